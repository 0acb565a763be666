//! Package install pipeline.
//!
//! Each request gets a record and a dedicated task that walks the linear
//! state machine download → pushing → installing → success, collapsing into
//! failure at any stage. Progress is projected on demand from the download
//! record and from a device-side `stat`, never written back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;
use uprov_adb::DeviceTransport;
use uprov_flashget::{Cache, Download, DownloadStatus, FlashgetError};
use uprov_util::{human_bytes, human_rate};

const INSTALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Terminal records are dropped this long after completion.
const RECORD_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Downloading,
    Pushing,
    Installing,
    Failure,
    Success,
}

impl InstallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstallStatus::Failure | InstallStatus::Success)
    }
}

/// Serializable snapshot of an install record.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallInfo {
    pub id: String,
    pub status: InstallStatus,
    pub serial: String,
    pub device_file_path: String,
    pub description: String,
}

pub struct InstallRecord {
    id: String,
    serial: String,
    download: Weak<Download>,
    state: Mutex<State>,
}

struct State {
    status: InstallStatus,
    description: String,
    device_file_path: String,
    push_began_at: Option<Instant>,
}

impl InstallRecord {
    fn new(id: String, serial: String, download: &Arc<Download>) -> Self {
        Self {
            id,
            serial,
            download: Arc::downgrade(download),
            state: Mutex::new(State {
                status: InstallStatus::Downloading,
                description: String::new(),
                device_file_path: String::new(),
                push_began_at: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn status(&self) -> InstallStatus {
        self.state.lock().unwrap().status
    }

    pub fn download(&self) -> Option<Arc<Download>> {
        self.download.upgrade()
    }

    pub fn push_began_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().push_began_at
    }

    pub fn info(&self) -> InstallInfo {
        let state = self.state.lock().unwrap();
        InstallInfo {
            id: self.id.clone(),
            status: state.status,
            serial: self.serial.clone(),
            device_file_path: state.device_file_path.clone(),
            description: state.description.clone(),
        }
    }

    fn begin_push(&self, device_file_path: String) {
        let mut state = self.state.lock().unwrap();
        state.status = InstallStatus::Pushing;
        state.device_file_path = device_file_path;
        state.push_began_at = Some(Instant::now());
    }

    fn begin_install(&self) {
        self.state.lock().unwrap().status = InstallStatus::Installing;
    }

    fn finish(&self, status: InstallStatus, description: String) {
        let mut state = self.state.lock().unwrap();
        state.status = status;
        state.description = description;
    }

    fn fail(&self, description: String) {
        self.finish(InstallStatus::Failure, description);
    }
}

/// Owns all install records and assigns their ids.
pub struct InstallManager {
    cache: Arc<Cache>,
    records: Mutex<HashMap<String, Arc<InstallRecord>>>,
    next_id: AtomicU64,
}

impl InstallManager {
    pub fn new(cache: Arc<Cache>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    /// Admit a new install. The download record is created (or joined)
    /// synchronously, so a probe failure surfaces here and no install
    /// record is created; everything later lands in the record.
    pub async fn begin(
        self: &Arc<Self>,
        device: Arc<dyn DeviceTransport>,
        url: &str,
        no_install: bool,
    ) -> Result<Arc<InstallRecord>, FlashgetError> {
        let download = self.cache.retrieve(url).await?;

        let id = (self.next_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
        let record = Arc::new(InstallRecord::new(
            id.clone(),
            device.serial().to_string(),
            &download,
        ));
        self.records.lock().unwrap().insert(id, Arc::clone(&record));

        tracing::info!(
            id = record.id(),
            serial = record.serial(),
            url,
            no_install,
            "install started"
        );

        let manager = Arc::clone(self);
        tokio::spawn(run_install(
            manager,
            Arc::clone(&record),
            download,
            device,
            no_install,
        ));
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Option<Arc<InstallRecord>> {
        self.records.lock().unwrap().get(id).cloned()
    }

    fn expire_later(self: &Arc<Self>, id: String) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECORD_TTL).await;
            manager.records.lock().unwrap().remove(&id);
        });
    }
}

async fn run_install(
    manager: Arc<InstallManager>,
    record: Arc<InstallRecord>,
    download: Arc<Download>,
    device: Arc<dyn DeviceTransport>,
    no_install: bool,
) {
    download.wait().await;
    if !download.is_success() {
        record.fail(format!(
            "http download failed: {} {}",
            status_label(download.status()),
            download.description()
        ));
        manager.expire_later(record.id().to_string());
        return;
    }

    let device_path = format!("/sdcard/tmp/u2init-{}.apk", record.id());
    record.begin_push(device_path.clone());
    if let Err(err) = device.push(download.filename(), &device_path, 0o644).await {
        record.fail(format!("push file to device: {err}"));
        manager.expire_later(record.id().to_string());
        return;
    }

    if no_install {
        record.finish(
            InstallStatus::Success,
            "Skip install, just pushed".to_string(),
        );
        manager.expire_later(record.id().to_string());
        return;
    }

    record.begin_install();
    match device
        .shell_with_timeout(
            INSTALL_TIMEOUT,
            &["pm", "install", "-r", "-t", &device_path],
        )
        .await
    {
        Err(err) => record.fail(format!("pm install error: {err}")),
        Ok(output) => {
            let output = output.trim().to_string();
            if output.contains("Failure") {
                record.fail(output);
            } else {
                record.finish(InstallStatus::Success, output);
            }
        }
    }
    tracing::info!(
        id = record.id(),
        serial = record.serial(),
        status = ?record.status(),
        "install finished"
    );
    manager.expire_later(record.id().to_string());
}

/// Snapshot with the description synthesised for the in-flight stages.
///
/// While downloading: `written / total - rate/s` from the download record.
/// While pushing: `pushed / total  speed: rate/s`, where the pushed size
/// comes from a device-side `stat` and the rate from the push start time.
pub async fn projected_info(
    record: &InstallRecord,
    device: Option<&dyn DeviceTransport>,
) -> InstallInfo {
    let mut info = record.info();

    match info.status {
        InstallStatus::Downloading => {
            if let Some(download) = record.download() {
                info.description = format!(
                    "{} / {} - {}",
                    human_bytes(download.written()),
                    human_bytes(download.content_length()),
                    human_rate(download.rate_bytes_per_sec())
                );
            }
        }
        InstallStatus::Pushing => {
            let (Some(device), Some(download), Some(began)) =
                (device, record.download(), record.push_began_at())
            else {
                return info;
            };
            if let Ok(size) = device.stat_size(&info.device_file_path).await {
                let elapsed = began.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    (size as f64 / elapsed) as u64
                } else {
                    0
                };
                info.description = format!(
                    "{} / {}  speed: {}",
                    human_bytes(size),
                    human_bytes(download.content_length()),
                    human_rate(rate)
                );
            }
        }
        _ => {}
    }

    info
}

fn status_label(status: DownloadStatus) -> &'static str {
    match status {
        DownloadStatus::Downloading => "downloading",
        DownloadStatus::Success => "success",
        DownloadStatus::Failure => "failure",
    }
}
