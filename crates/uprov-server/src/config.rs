//! Command line and the assembled runtime configuration.

use std::path::PathBuf;

use clap::Parser;

/// Default mirror for release artifacts.
const DEFAULT_MIRROR: &str = "https://github.com";

pub const AGENT_VERSION: &str = "0.9.5";
pub const APK_VERSION: &str = "2.3.3";
pub const RECORDER_VERSION: &str = "1.0.0";

#[derive(Debug, Parser)]
#[command(
    name = "uprov",
    version,
    about = "ADB device provisioning and package delivery provider"
)]
pub struct Cli {
    /// Listen port, 0 picks a free port
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    pub port: u16,

    /// Coordinator address, host:port (e.g. 10.0.0.1:7700)
    #[arg(short = 's', long = "server")]
    pub server: Option<String>,

    /// Print an /etc/init.d script for this executable and exit
    #[arg(long)]
    pub initd: bool,

    /// Resources directory (helper binaries, agent releases, APKs)
    #[arg(long)]
    pub resdir: Option<PathBuf>,
}

/// Declared versions of everything the provisioner keeps on devices.
#[derive(Clone, Debug)]
pub struct Versions {
    pub agent: String,
    pub apk: String,
    pub recorder: String,
}

impl Default for Versions {
    fn default() -> Self {
        Self {
            agent: AGENT_VERSION.to_string(),
            apk: APK_VERSION.to_string(),
            recorder: RECORDER_VERSION.to_string(),
        }
    }
}

/// Runtime configuration; built once in `main` and handed to every engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Port the HTTP surface listens on (already resolved, never 0).
    pub listen_port: u16,
    /// Coordinator `host:port`, when heartbeats are enabled.
    pub coordinator: Option<String>,
    /// Absolute working directory for the artifact cache.
    pub workdir: PathBuf,
    /// Directory holding helper binaries, release archives, and APKs.
    pub resources_dir: PathBuf,
    /// Mirror base for release downloads.
    pub mirror: String,
    pub versions: Versions,
}

impl Config {
    pub fn new(listen_port: u16, coordinator: Option<String>, workdir: PathBuf, resources_dir: PathBuf) -> Self {
        Self {
            listen_port,
            coordinator,
            workdir,
            resources_dir,
            mirror: DEFAULT_MIRROR.to_string(),
            versions: Versions::default(),
        }
    }

    pub fn heartbeat_url(&self) -> Option<String> {
        self.coordinator
            .as_ref()
            .map(|addr| format!("http://{addr}/provider/heartbeat"))
    }

    pub fn stf_binaries_dir(&self) -> PathBuf {
        self.resources_dir.join("stf-binaries-master/node_modules")
    }

    pub fn agent_tarball_url(&self) -> String {
        let ver = &self.versions.agent;
        format!(
            "{}/openatx/atx-agent/releases/download/{ver}/atx-agent_{ver}_linux_armv6.tar.gz",
            self.mirror
        )
    }

    pub fn agent_tarball_path(&self) -> PathBuf {
        self.resources_dir
            .join(format!("atx-agent-{}.tar.gz", self.versions.agent))
    }

    pub fn agent_extract_dir(&self) -> PathBuf {
        self.resources_dir.join("atx-agent-armv6")
    }

    pub fn agent_binary_path(&self) -> PathBuf {
        self.agent_extract_dir().join("atx-agent")
    }

    pub fn apk_url(&self) -> String {
        format!(
            "{}/openatx/android-uiautomator-server/releases/download/{}/app-uiautomator.apk",
            self.mirror, self.versions.apk
        )
    }

    pub fn apk_test_url(&self) -> String {
        format!(
            "{}/openatx/android-uiautomator-server/releases/download/{}/app-uiautomator-test.apk",
            self.mirror, self.versions.apk
        )
    }

    pub fn recorder_url(&self) -> String {
        format!(
            "{}/openatx/android-uiautomator-server/releases/download/1.1.5/com.easetest.recorder_{}.apk",
            self.mirror, self.versions.recorder
        )
    }

    pub fn apk_path(&self) -> PathBuf {
        self.resources_dir
            .join(format!("app-uiautomator-{}.apk", self.versions.apk))
    }

    pub fn apk_test_path(&self) -> PathBuf {
        self.resources_dir
            .join(format!("app-uiautomator-test-{}.apk", self.versions.apk))
    }

    pub fn recorder_path(&self) -> PathBuf {
        self.resources_dir
            .join(format!("com.easetest.recorder-{}.apk", self.versions.recorder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config::new(
            7100,
            Some("10.0.0.1:7700".into()),
            PathBuf::from("/var/lib/uprov"),
            PathBuf::from("/opt/uprov/resources"),
        )
    }

    #[test]
    fn heartbeat_url_includes_provider_path() {
        assert_eq!(
            config().heartbeat_url().as_deref(),
            Some("http://10.0.0.1:7700/provider/heartbeat")
        );
    }

    #[test]
    fn release_urls_are_version_templated() {
        let cfg = config();
        assert_eq!(
            cfg.agent_tarball_url(),
            format!(
                "https://github.com/openatx/atx-agent/releases/download/{AGENT_VERSION}/atx-agent_{AGENT_VERSION}_linux_armv6.tar.gz"
            )
        );
        assert!(cfg.apk_url().ends_with("/app-uiautomator.apk"));
        assert!(cfg.apk_test_url().ends_with("/app-uiautomator-test.apk"));
        assert!(cfg
            .recorder_url()
            .ends_with(&format!("com.easetest.recorder_{RECORDER_VERSION}.apk")));
    }

    #[test]
    fn resource_paths_carry_versions() {
        let cfg = config();
        assert!(cfg
            .agent_tarball_path()
            .ends_with(format!("atx-agent-{AGENT_VERSION}.tar.gz")));
        assert!(cfg.agent_binary_path().ends_with("atx-agent-armv6/atx-agent"));
        assert!(cfg
            .apk_path()
            .ends_with(format!("app-uiautomator-{APK_VERSION}.apk")));
    }
}
