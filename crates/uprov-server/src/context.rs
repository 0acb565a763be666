//! The injected context shared by every engine. Only `main` builds one.

use std::sync::Arc;

use uprov_adb::Adb;

use crate::config::Config;
use crate::heartbeat::HeartbeatClient;
use crate::install::InstallManager;
use crate::registry::DeviceRegistry;

pub struct Context {
    pub config: Config,
    pub adb: Adb,
    pub registry: DeviceRegistry,
    pub heartbeat: Option<Arc<HeartbeatClient>>,
    pub installs: Arc<InstallManager>,
    pub http: reqwest::Client,
}
