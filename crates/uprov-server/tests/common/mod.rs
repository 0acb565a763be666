// Shared test helpers. Not every test binary uses every helper, so
// dead_code warnings are suppressed at the module level.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uprov_adb::{AdbError, DeviceProperties, DeviceTransport};

pub const AGENT_DEVICE_PATH: &str = "/data/local/tmp/atx-agent";

/// Scripted device transport: records every call, answers from canned data.
pub struct MockDevice {
    serial: String,
    properties: DeviceProperties,
    forward_port: u16,
    package_versions: HashMap<String, String>,
    install_output: String,
    agent_version_output: String,
    stat_size: Option<u64>,
    push_delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl MockDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
            properties: DeviceProperties {
                sdk: "25".into(),
                abi: "arm64-v8a".into(),
                model: "Pixel".into(),
                product: "sailfish".into(),
            },
            forward_port: 0,
            package_versions: HashMap::new(),
            install_output: "Success\n".into(),
            agent_version_output: String::new(),
            stat_size: None,
            push_delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_install_output(mut self, output: &str) -> Self {
        self.install_output = output.to_string();
        self
    }

    pub fn with_forward_port(mut self, port: u16) -> Self {
        self.forward_port = port;
        self
    }

    pub fn with_package_version(mut self, package: &str, version: &str) -> Self {
        self.package_versions
            .insert(package.to_string(), version.to_string());
        self
    }

    pub fn with_agent_version(mut self, version: &str) -> Self {
        self.agent_version_output = version.to_string();
        self
    }

    pub fn with_stat_size(mut self, size: u64) -> Self {
        self.stat_size = Some(size);
        self
    }

    pub fn with_push_delay(mut self, delay: Duration) -> Self {
        self.push_delay = delay;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("push "))
            .collect()
    }

    pub fn pm_installs(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with("shell pm install"))
            .collect()
    }

    fn log(&self, entry: String) {
        self.calls.lock().unwrap().push(entry);
    }
}

/// Transport for a device that dropped off the bus: every call fails.
pub struct FailingDevice {
    serial: String,
}

impl FailingDevice {
    pub fn new(serial: &str) -> Self {
        Self {
            serial: serial.to_string(),
        }
    }

    fn gone() -> AdbError {
        AdbError::Io("device offline".into())
    }
}

#[async_trait]
impl DeviceTransport for FailingDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn properties(&self) -> Result<DeviceProperties, AdbError> {
        Err(Self::gone())
    }

    async fn shell(&self, _args: &[&str]) -> Result<String, AdbError> {
        Err(Self::gone())
    }

    async fn shell_with_timeout(
        &self,
        _timeout: Duration,
        _args: &[&str],
    ) -> Result<String, AdbError> {
        Err(Self::gone())
    }

    async fn push(&self, _local: &Path, _remote: &str, _mode: u32) -> Result<(), AdbError> {
        Err(Self::gone())
    }

    async fn forward_to_free_port(&self, _device_port: u16) -> Result<u16, AdbError> {
        Err(Self::gone())
    }

    async fn package_version_name(&self, _package: &str) -> Result<Option<String>, AdbError> {
        Err(Self::gone())
    }

    async fn stat_size(&self, _remote: &str) -> Result<u64, AdbError> {
        Err(Self::gone())
    }
}

#[async_trait]
impl DeviceTransport for MockDevice {
    fn serial(&self) -> &str {
        &self.serial
    }

    async fn properties(&self) -> Result<DeviceProperties, AdbError> {
        self.log("properties".into());
        Ok(self.properties.clone())
    }

    async fn shell(&self, args: &[&str]) -> Result<String, AdbError> {
        self.log(format!("shell {}", args.join(" ")));
        if args.first() == Some(&AGENT_DEVICE_PATH) && args.get(1) == Some(&"version") {
            return Ok(self.agent_version_output.clone());
        }
        if args.first() == Some(&"pm") && args.get(1) == Some(&"install") {
            return Ok(self.install_output.clone());
        }
        Ok(String::new())
    }

    async fn shell_with_timeout(
        &self,
        _timeout: Duration,
        args: &[&str],
    ) -> Result<String, AdbError> {
        self.shell(args).await
    }

    async fn push(&self, _local: &Path, remote: &str, mode: u32) -> Result<(), AdbError> {
        self.log(format!("push {remote} {mode:03o}"));
        if self.push_delay > Duration::ZERO {
            tokio::time::sleep(self.push_delay).await;
        }
        Ok(())
    }

    async fn forward_to_free_port(&self, _device_port: u16) -> Result<u16, AdbError> {
        self.log("forward".into());
        Ok(self.forward_port)
    }

    async fn package_version_name(&self, package: &str) -> Result<Option<String>, AdbError> {
        self.log(format!("stat-package {package}"));
        Ok(self.package_versions.get(package).cloned())
    }

    async fn stat_size(&self, remote: &str) -> Result<u64, AdbError> {
        self.log(format!("stat {remote}"));
        self.stat_size
            .ok_or_else(|| AdbError::Parse(format!("stat {remote}: no such file")))
    }
}
