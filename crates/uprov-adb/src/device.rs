use std::io;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::client::{merge_output, Adb};
use crate::error::AdbError;

/// Build properties the provisioner cares about, plus display fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    /// `ro.build.version.sdk`, with a non-zero preview suffix appended.
    pub sdk: String,
    /// `ro.product.cpu.abi`.
    pub abi: String,
    /// `ro.product.model`.
    pub model: String,
    /// `ro.product.name`.
    pub product: String,
}

/// Per-device operations used by provisioning and the install pipeline.
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    fn serial(&self) -> &str;

    async fn properties(&self) -> Result<DeviceProperties, AdbError>;

    /// Run a shell command, returning its merged output. A failing command is
    /// not an error here; `pm` and friends report failure in their output.
    async fn shell(&self, args: &[&str]) -> Result<String, AdbError>;

    async fn shell_with_timeout(
        &self,
        timeout: Duration,
        args: &[&str],
    ) -> Result<String, AdbError>;

    /// Push a local file and leave it at `remote` with the given mode.
    async fn push(&self, local: &Path, remote: &str, mode: u32) -> Result<(), AdbError>;

    /// Forward a free host port to `device_port`, returning the host port.
    async fn forward_to_free_port(&self, device_port: u16) -> Result<u16, AdbError>;

    /// `versionName` of an installed package, `None` when not installed.
    async fn package_version_name(&self, package: &str) -> Result<Option<String>, AdbError>;

    /// Size in bytes of a file on the device.
    async fn stat_size(&self, remote: &str) -> Result<u64, AdbError>;
}

/// The real transport: every call is one `adb -s <serial> ...` invocation.
#[derive(Clone, Debug)]
pub struct AdbDevice {
    adb: Adb,
    serial: String,
}

impl AdbDevice {
    pub(crate) fn new(adb: Adb, serial: &str) -> Self {
        Self {
            adb,
            serial: serial.to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full: Vec<&str> = vec!["-s", &self.serial];
        full.extend_from_slice(args);
        let output = self.adb.output(&full).await?;
        Ok(merge_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }
}

#[async_trait]
impl DeviceTransport for AdbDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn properties(&self) -> Result<DeviceProperties, AdbError> {
        let raw = self.shell(&["getprop"]).await?;
        Ok(parse_properties(&raw))
    }

    async fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        let mut full: Vec<&str> = vec!["shell"];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    async fn shell_with_timeout(
        &self,
        timeout: Duration,
        args: &[&str],
    ) -> Result<String, AdbError> {
        let mut full: Vec<String> = vec![
            "-s".into(),
            self.serial.clone(),
            "shell".into(),
        ];
        full.extend(args.iter().map(|s| s.to_string()));

        let mut cmd = Command::new(self.adb.binary_path());
        cmd.args(&full)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let fut = cmd.output();
        let output = tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| AdbError::Timeout(timeout))?
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    AdbError::NotFound
                } else {
                    AdbError::Io(e.to_string())
                }
            })?;

        Ok(merge_output(
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        ))
    }

    async fn push(&self, local: &Path, remote: &str, mode: u32) -> Result<(), AdbError> {
        let local = local
            .to_str()
            .ok_or_else(|| AdbError::Parse(format!("non-utf8 local path: {local:?}")))?;
        self.run(&["push", local, remote]).await?;
        let mode = format!("{:03o}", mode & 0o777);
        self.shell(&["chmod", &mode, remote]).await?;
        Ok(())
    }

    async fn forward_to_free_port(&self, device_port: u16) -> Result<u16, AdbError> {
        let device_spec = format!("tcp:{device_port}");
        let raw = self.run(&["forward", "tcp:0", &device_spec]).await?;
        parse_forwarded_port(&raw)
    }

    async fn package_version_name(&self, package: &str) -> Result<Option<String>, AdbError> {
        let raw = self.shell(&["dumpsys", "package", package]).await?;
        Ok(parse_version_name(&raw))
    }

    async fn stat_size(&self, remote: &str) -> Result<u64, AdbError> {
        let raw = self.shell(&["stat", "-c", "%s", remote]).await?;
        raw.trim()
            .parse::<u64>()
            .map_err(|_| AdbError::Parse(format!("stat {remote}: {}", raw.trim())))
    }
}

/// Parse the `[key]: [value]` dump produced by `getprop`.
fn parse_properties(raw: &str) -> DeviceProperties {
    let mut sdk = String::new();
    let mut abi = String::new();
    let mut preview = String::new();
    let mut model = String::new();
    let mut product = String::new();

    for line in raw.lines() {
        let Some((key, value)) = split_prop_line(line) else {
            continue;
        };
        match key {
            "ro.build.version.sdk" => sdk = value.to_string(),
            "ro.build.version.preview_sdk" => preview = value.to_string(),
            "ro.product.cpu.abi" => abi = value.to_string(),
            "ro.product.model" => model = value.to_string(),
            "ro.product.name" => product = value.to_string(),
            _ => {}
        }
    }

    // Preview builds report e.g. sdk=27 preview=1, which the prebuilt layout
    // names "271".
    if !preview.is_empty() && preview != "0" {
        sdk.push_str(&preview);
    }

    DeviceProperties {
        sdk,
        abi,
        model,
        product,
    }
}

fn split_prop_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    let rest = line.strip_prefix('[')?;
    let (key, rest) = rest.split_once("]: [")?;
    let value = rest.strip_suffix(']')?;
    Some((key, value))
}

fn parse_forwarded_port(raw: &str) -> Result<u16, AdbError> {
    raw.trim()
        .parse::<u16>()
        .map_err(|_| AdbError::Parse(format!("forward tcp:0: {}", raw.trim())))
}

fn parse_version_name(raw: &str) -> Option<String> {
    for line in raw.lines() {
        let line = line.trim();
        if let Some(version) = line.strip_prefix("versionName=") {
            let version = version.trim();
            if !version.is_empty() {
                return Some(version.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_properties_reads_probe_fields() {
        let raw = "[ro.build.version.sdk]: [25]\n\
                   [ro.build.version.preview_sdk]: [0]\n\
                   [ro.product.cpu.abi]: [arm64-v8a]\n\
                   [ro.product.model]: [Pixel]\n\
                   [ro.product.name]: [sailfish]\n";
        let props = parse_properties(raw);
        assert_eq!(props.sdk, "25");
        assert_eq!(props.abi, "arm64-v8a");
        assert_eq!(props.model, "Pixel");
        assert_eq!(props.product, "sailfish");
    }

    #[test]
    fn parse_properties_appends_nonzero_preview_suffix() {
        let raw = "[ro.build.version.sdk]: [27]\n\
                   [ro.build.version.preview_sdk]: [1]\n";
        assert_eq!(parse_properties(raw).sdk, "271");
    }

    #[test]
    fn parse_version_name_finds_installed_version() {
        let raw = "Packages:\n  Package [com.github.uiautomator] (43f2a):\n    versionName=2.3.3\n";
        assert_eq!(parse_version_name(raw).as_deref(), Some("2.3.3"));
    }

    #[test]
    fn parse_version_name_missing_package_is_none() {
        assert_eq!(parse_version_name("Unable to find package: com.example"), None);
    }

    #[test]
    fn parse_forwarded_port_accepts_adb_output() {
        assert_eq!(parse_forwarded_port("40123\n").unwrap(), 40123);
        assert!(parse_forwarded_port("error: device offline").is_err());
    }
}
