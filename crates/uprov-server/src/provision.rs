//! Per-device provisioning pipeline.
//!
//! Brings one device to the declared software baseline: STF helper binaries,
//! the on-device agent, and the companion APKs. Every step is idempotent and
//! versioned, so re-running the pipeline on an already-provisioned device
//! only issues probes. There is no rollback; the next hotplug event simply
//! re-drives the pipeline from the top.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use uprov_adb::{AdbError, DeviceProperties, DeviceTransport};

use crate::context::Context;
use crate::heartbeat::DevicePayload;
use crate::registry::DeviceRecord;
use crate::resources;

pub const AGENT_DEVICE_PATH: &str = "/data/local/tmp/atx-agent";
pub const AGENT_PORT: u16 = 7912;

pub const PKG_UIAUTOMATOR: &str = "com.github.uiautomator";
pub const PKG_UIAUTOMATOR_TEST: &str = "com.github.uiautomator.test";
pub const PKG_RECORDER: &str = "com.easetest.recorder";

/// Staged pushes land here first, then `mv` into place.
const PUSH_STAGING_SUFFIX: &str = ".tmp-uprov";
const PUSH_ATTEMPTS: u32 = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(500);

const INFO_ATTEMPTS: u32 = 3;
const INFO_RETRY_DELAY: Duration = Duration::from_millis(500);
const INFO_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("device properties: {0}")]
    Properties(AdbError),

    #[error("mini(cap|touch): {0}")]
    MiniTools(String),

    #[error("atx-agent: {0}")]
    Agent(String),

    #[error("companion apks: {0}")]
    Apks(String),

    #[error("agent port forward: {0}")]
    Forward(AdbError),

    #[error("device identify: {0}")]
    Identify(String),
}

/// Reply of the agent's `/info` endpoint on the forwarded port.
#[derive(Debug, Default, Deserialize)]
struct AgentInfo {
    #[serde(default)]
    udid: String,
    #[serde(default, rename = "serverUrl", alias = "serverURL")]
    server_url: String,
}

/// Run the whole pipeline for one device and publish the result to the
/// registry and the heartbeat client.
pub async fn provision_device(
    ctx: &Context,
    device: &dyn DeviceTransport,
) -> Result<DeviceRecord, ProvisionError> {
    let serial = device.serial().to_string();

    // Step 1: properties probe. A failure here usually means the device
    // dropped off the bus mid-provision.
    let props = device
        .properties()
        .await
        .map_err(ProvisionError::Properties)?;
    tracing::info!(
        serial,
        model = %props.model,
        sdk = %props.sdk,
        abi = %props.abi,
        "provisioning device"
    );

    // Step 2: STF helper binaries.
    install_mini_tools(ctx, device, &props)
        .await
        .map_err(ProvisionError::MiniTools)?;

    // Step 3: on-device agent, reconciled against the declared version.
    let agent_port = device
        .forward_to_free_port(AGENT_PORT)
        .await
        .map_err(ProvisionError::Forward)?;
    ensure_agent(ctx, device, agent_port)
        .await
        .map_err(ProvisionError::Agent)?;

    // Step 4: companion APKs.
    ensure_companion_apks(ctx, device)
        .await
        .map_err(ProvisionError::Apks)?;

    // Step 5: best-effort service start and operator-visible identify flash.
    let _ = device
        .shell(&["am", "startservice", "-n", "com.github.uiautomator/.Service"])
        .await;
    let _ = device
        .shell(&[
            "am",
            "start",
            "-n",
            "com.github.uiautomator/.IdentifyActivity",
            "-e",
            "theme",
            "red",
        ])
        .await;

    // Step 6: learn the UDID from the agent.
    let udid = query_udid(ctx, agent_port)
        .await
        .map_err(ProvisionError::Identify)?;
    tracing::info!(serial, udid, agent_port, "device identified");

    // Step 7: publish.
    let record = DeviceRecord {
        serial: serial.clone(),
        model: props.model,
        product: props.product,
        udid: udid.clone(),
        agent_port,
    };
    ctx.registry.add(record.clone());
    if let Some(heart) = &ctx.heartbeat {
        heart
            .add_data(
                &serial,
                DevicePayload::Online {
                    udid,
                    provider_forwarded_port: agent_port,
                },
            )
            .await;
    }

    Ok(record)
}

async fn install_mini_tools(
    ctx: &Context,
    device: &dyn DeviceTransport,
    props: &DeviceProperties,
) -> Result<(), String> {
    let stf = ctx.config.stf_binaries_dir();
    let abi = &props.abi;
    let sdk = &props.sdk;

    let minicap_so = stf.join(format!(
        "minicap-prebuilt/prebuilt/{abi}/lib/android-{sdk}/minicap.so"
    ));
    write_file_to_device(device, &minicap_so, "/data/local/tmp/minicap.so", 0o644).await?;

    let minicap = stf.join(format!("minicap-prebuilt/prebuilt/{abi}/bin/minicap"));
    write_file_to_device(device, &minicap, "/data/local/tmp/minicap", 0o755).await?;

    let minitouch = stf.join(format!("minitouch-prebuilt/prebuilt/{abi}/bin/minitouch"));
    write_file_to_device(device, &minitouch, "/data/local/tmp/minitouch", 0o755).await
}

/// Decide whether the running agent already matches the declared version and
/// coordinator; reinstall and restart it when it does not.
async fn ensure_agent(
    ctx: &Context,
    device: &dyn DeviceTransport,
    agent_port: u16,
) -> Result<(), String> {
    if agent_up_to_date(ctx, device, agent_port).await {
        tracing::info!(serial = device.serial(), "agent up to date, skip");
        return Ok(());
    }

    let binary = resources::ensure_agent_binary(&ctx.http, &ctx.config)
        .await
        .map_err(|e| e.to_string())?;
    write_file_to_device(device, &binary, AGENT_DEVICE_PATH, 0o755).await?;

    let _ = device.shell(&[AGENT_DEVICE_PATH, "server", "--stop"]).await;

    let mut args = vec![AGENT_DEVICE_PATH, "server", "-d", "--nouia"];
    if let Some(coordinator) = &ctx.config.coordinator {
        args.push("-t");
        args.push(coordinator);
    }
    let output = device.shell(&args).await.map_err(|e| e.to_string())?;
    tracing::info!(serial = device.serial(), output = %output.trim(), "agent restarted");
    Ok(())
}

async fn agent_up_to_date(ctx: &Context, device: &dyn DeviceTransport, agent_port: u16) -> bool {
    let info = match fetch_info(&ctx.http, agent_port).await {
        Ok(info) => info,
        Err(err) => {
            tracing::info!(serial = device.serial(), error = %err, "agent not answering, reinstall");
            return false;
        }
    };

    if let Some(coordinator) = &ctx.config.coordinator {
        if info.server_url != *coordinator {
            tracing::info!(
                serial = device.serial(),
                agent_server = %info.server_url,
                "agent bound to a different coordinator, reinstall"
            );
            return false;
        }
    }

    match device.shell(&[AGENT_DEVICE_PATH, "version"]).await {
        Ok(version) if version.trim() == ctx.config.versions.agent => true,
        Ok(version) => {
            tracing::info!(
                serial = device.serial(),
                installed = %version.trim(),
                declared = %ctx.config.versions.agent,
                "agent version mismatch, reinstall"
            );
            false
        }
        Err(_) => false,
    }
}

async fn ensure_companion_apks(ctx: &Context, device: &dyn DeviceTransport) -> Result<(), String> {
    let declared = &ctx.config.versions.apk;

    let main_version = device
        .package_version_name(PKG_UIAUTOMATOR)
        .await
        .map_err(|e| e.to_string())?;
    let test_version = device
        .package_version_name(PKG_UIAUTOMATOR_TEST)
        .await
        .map_err(|e| e.to_string())?;

    // The test APK rides with the main one: either both are current or both
    // get reinstalled.
    if main_version.as_deref() != Some(declared.as_str()) || test_version.is_none() {
        let _ = device.shell(&["pm", "uninstall", PKG_UIAUTOMATOR]).await;
        let _ = device
            .shell(&["pm", "uninstall", PKG_UIAUTOMATOR_TEST])
            .await;

        let apk = ctx.config.apk_path();
        resources::ensure_file(&ctx.http, &ctx.config.apk_url(), &apk)
            .await
            .map_err(|e| e.to_string())?;
        install_apk(device, &apk).await?;

        let test_apk = ctx.config.apk_test_path();
        resources::ensure_file(&ctx.http, &ctx.config.apk_test_url(), &test_apk)
            .await
            .map_err(|e| e.to_string())?;
        install_apk(device, &test_apk).await?;
    } else {
        tracing::info!(serial = device.serial(), "uiautomator apks up to date, skip");
    }

    let recorder_version = device
        .package_version_name(PKG_RECORDER)
        .await
        .map_err(|e| e.to_string())?;
    if recorder_version.as_deref() != Some(ctx.config.versions.recorder.as_str()) {
        let _ = device.shell(&["pm", "uninstall", PKG_RECORDER]).await;

        let recorder = ctx.config.recorder_path();
        resources::ensure_file(&ctx.http, &ctx.config.recorder_url(), &recorder)
            .await
            .map_err(|e| e.to_string())?;
        install_apk(device, &recorder).await?;
    } else {
        tracing::info!(serial = device.serial(), "recorder apk up to date, skip");
    }

    Ok(())
}

async fn install_apk(device: &dyn DeviceTransport, local: &Path) -> Result<(), String> {
    let base = local
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| format!("bad apk path: {}", local.display()))?;
    let dst = format!("/data/local/tmp/{base}");

    write_file_to_device(device, local, &dst, 0o644).await?;
    let output = device
        .shell(&["pm", "install", "-r", "-t", &dst])
        .await
        .map_err(|e| e.to_string());
    let _ = device.shell(&["rm", &dst]).await;

    let output = output?;
    if !output.contains("Success") {
        return Err(format!("apk-install: {}", output.trim()));
    }
    Ok(())
}

/// Push with staging and retry: write to `<dst>.tmp-uprov`, `mv` into place
/// so a running binary is never overwritten in place, clean up on error.
/// Intermediate failures are silent; only the final one is reported.
pub(crate) async fn write_file_to_device(
    device: &dyn DeviceTransport,
    src: &Path,
    dst: &str,
    mode: u32,
) -> Result<(), String> {
    for attempt in 1..=PUSH_ATTEMPTS {
        if push_once(device, src, dst, mode).await.is_ok() {
            return Ok(());
        }
        if attempt != PUSH_ATTEMPTS {
            tokio::time::sleep(PUSH_RETRY_DELAY).await;
        }
    }
    Err(format!(
        "copy file to device failed: {} -> {dst}",
        src.display()
    ))
}

async fn push_once(
    device: &dyn DeviceTransport,
    src: &Path,
    dst: &str,
    mode: u32,
) -> Result<(), AdbError> {
    let staging = format!("{dst}{PUSH_STAGING_SUFFIX}");
    if let Err(err) = device.push(src, &staging, mode).await {
        let _ = device.shell(&["rm", &staging]).await;
        return Err(err);
    }
    device.shell(&["mv", &staging, dst]).await?;
    Ok(())
}

async fn fetch_info(client: &reqwest::Client, port: u16) -> Result<AgentInfo, String> {
    let url = format!("http://127.0.0.1:{port}/info");
    let resp = client
        .get(&url)
        .timeout(INFO_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("GET /info: status {}", resp.status()));
    }
    resp.json::<AgentInfo>().await.map_err(|e| e.to_string())
}

async fn query_udid(ctx: &Context, port: u16) -> Result<String, String> {
    let mut last_err = String::new();
    for attempt in 1..=INFO_ATTEMPTS {
        match fetch_info(&ctx.http, port).await {
            Ok(info) if !info.udid.is_empty() => return Ok(info.udid),
            Ok(_) => last_err = "agent reported an empty udid".to_string(),
            Err(err) => last_err = err,
        }
        if attempt != INFO_ATTEMPTS {
            tokio::time::sleep(INFO_RETRY_DELAY).await;
        }
    }
    Err(last_err)
}
