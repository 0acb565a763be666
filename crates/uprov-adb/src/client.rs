use std::io;
use std::path::PathBuf;
use std::process::Output;

use tokio::process::Command;

use crate::device::AdbDevice;
use crate::error::AdbError;

/// Handle to the host-side ADB server, addressed through the `adb` binary.
#[derive(Clone, Debug)]
pub struct Adb {
    path: PathBuf,
}

/// One row of `adb devices -l`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceListing {
    pub serial: String,
    pub state: String,
    pub model: Option<String>,
    pub product: Option<String>,
}

impl DeviceListing {
    pub fn is_online(&self) -> bool {
        self.state == "device"
    }
}

impl Default for Adb {
    fn default() -> Self {
        Self::new()
    }
}

impl Adb {
    pub fn new() -> Self {
        Self { path: adb_path() }
    }

    pub fn device(&self, serial: &str) -> AdbDevice {
        AdbDevice::new(self.clone(), serial)
    }

    /// First line of `adb version`, e.g. `Android Debug Bridge version 1.0.41`.
    pub async fn server_version(&self) -> Result<String, AdbError> {
        let output = self.output(&["version"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .ok_or_else(|| AdbError::Parse("adb version produced no output".into()))
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceListing>, AdbError> {
        let output = self.output(&["devices", "-l"]).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_devices(&stdout))
    }

    pub(crate) fn binary_path(&self) -> PathBuf {
        self.path.clone()
    }

    pub(crate) async fn output(&self, args: &[&str]) -> Result<Output, AdbError> {
        let mut cmd = Command::new(&self.path);
        cmd.args(args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        let output = cmd.output().await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                AdbError::NotFound
            } else {
                AdbError::Io(e.to_string())
            }
        })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(AdbError::Exit {
                status: output.status.code().unwrap_or(-1),
                detail: merge_output(
                    &String::from_utf8_lossy(&output.stdout),
                    &String::from_utf8_lossy(&output.stderr),
                ),
            })
        }
    }
}

fn adb_path() -> PathBuf {
    if let Ok(path) = std::env::var("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        let candidate = PathBuf::from(&sdk_root).join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

pub(crate) fn merge_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

fn parse_devices(output: &str) -> Vec<DeviceListing> {
    let mut listings = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };

        let mut model = None;
        let mut product = None;
        for part in parts {
            if let Some((key, value)) = part.split_once(':') {
                match key {
                    "model" => model = Some(value.to_string()),
                    "product" => product = Some(value.to_string()),
                    _ => {}
                }
            }
        }

        listings.push(DeviceListing {
            serial: serial.to_string(),
            state: state.to_string(),
            model,
            product,
        });
    }

    listings
}
