//! The download cache proper: dedup, waiters, eviction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, RwLock};

use crate::store;
use crate::FlashgetError;

/// Disk quota across completed artifacts: 3 GiB.
pub const DEFAULT_QUOTA: u64 = 3 << 30;

const RECYCLE_INTERVAL: Duration = Duration::from_secs(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Success,
    Failure,
}

/// Serializable snapshot of a download record.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInfo {
    pub url: String,
    pub filename: String,
    pub content_length: u64,
    pub status: DownloadStatus,
    pub description: String,
    pub created_at: i64,
    pub finished_at: Option<i64>,
    pub written: u64,
}

/// One URL's download record. Owned by the cache; the copier task is the
/// only writer until the record reaches a terminal status.
pub struct Download {
    url: String,
    filename: PathBuf,
    content_length: u64,
    created_at: i64,
    started: Instant,
    written: AtomicU64,
    state: Mutex<State>,
    done: watch::Sender<bool>,
}

struct State {
    status: DownloadStatus,
    description: String,
    finished_at: Option<i64>,
}

impl Download {
    fn downloading(url: &str, filename: PathBuf, content_length: u64) -> Self {
        let (done, _) = watch::channel(false);
        Self {
            url: url.to_string(),
            filename,
            content_length,
            created_at: now_millis(),
            started: Instant::now(),
            written: AtomicU64::new(0),
            state: Mutex::new(State {
                status: DownloadStatus::Downloading,
                description: String::new(),
                finished_at: None,
            }),
            done,
        }
    }

    fn adopted(url: &str, filename: PathBuf, size: u64, modified_at: i64) -> Self {
        let (done, _) = watch::channel(true);
        Self {
            url: url.to_string(),
            filename,
            content_length: size,
            created_at: modified_at,
            started: Instant::now(),
            written: AtomicU64::new(size),
            state: Mutex::new(State {
                status: DownloadStatus::Success,
                description: String::new(),
                finished_at: Some(modified_at),
            }),
            done,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn status(&self) -> DownloadStatus {
        self.state.lock().unwrap().status
    }

    pub fn description(&self) -> String {
        self.state.lock().unwrap().description.clone()
    }

    pub fn finished_at(&self) -> Option<i64> {
        self.state.lock().unwrap().finished_at
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn is_success(&self) -> bool {
        self.status() == DownloadStatus::Success
    }

    /// Average transfer rate since the record was created.
    pub fn rate_bytes_per_sec(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0
        } else {
            (self.written() as f64 / elapsed) as u64
        }
    }

    /// Block until the record reaches a terminal status. Any number of
    /// callers may wait concurrently.
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn info(&self) -> DownloadInfo {
        let state = self.state.lock().unwrap();
        DownloadInfo {
            url: self.url.clone(),
            filename: self.filename.to_string_lossy().into_owned(),
            content_length: self.content_length,
            status: state.status,
            description: state.description.clone(),
            created_at: self.created_at,
            finished_at: state.finished_at,
            written: self.written(),
        }
    }

    fn add_written(&self, n: u64) {
        self.written.fetch_add(n, Ordering::Relaxed);
    }

    fn complete(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.status = DownloadStatus::Success;
            state.finished_at = Some(now_millis());
        }
        self.done.send_replace(true);
    }

    fn fail(&self, description: String) {
        {
            let mut state = self.state.lock().unwrap();
            state.status = DownloadStatus::Failure;
            state.description = description;
            state.finished_at = Some(now_millis());
        }
        self.done.send_replace(true);
    }

    /// A terminal record whose published file was removed out from under us.
    fn file_missing(&self) -> bool {
        self.status() != DownloadStatus::Downloading && !self.filename.exists()
    }

    #[cfg(test)]
    fn fabricated(url: &str, filename: PathBuf, content_length: u64, finished_at: i64) -> Self {
        let (done, _) = watch::channel(true);
        Self {
            url: url.to_string(),
            filename,
            content_length,
            created_at: finished_at,
            started: Instant::now(),
            written: AtomicU64::new(content_length),
            state: Mutex::new(State {
                status: DownloadStatus::Success,
                description: String::new(),
                finished_at: Some(finished_at),
            }),
            done,
        }
    }
}

/// The manager: one record per URL, guarded by a reader/writer lock.
///
/// `retrieve` holds the write lock for the whole admission decision,
/// including the probe request. That serialises admissions across URLs,
/// which is the dedup guarantee.
pub struct Cache {
    workdir: PathBuf,
    quota: u64,
    client: reqwest::Client,
    downloads: RwLock<HashMap<String, Arc<Download>>>,
}

impl Cache {
    pub fn new(workdir: PathBuf) -> Result<Self, FlashgetError> {
        Self::with_quota(workdir, DEFAULT_QUOTA)
    }

    pub fn with_quota(workdir: PathBuf, quota: u64) -> Result<Self, FlashgetError> {
        if !workdir.is_absolute() {
            return Err(FlashgetError::RelativeWorkdir(workdir));
        }
        std::fs::create_dir_all(&workdir)?;

        let orphans = store::remove_orphaned_staging(&workdir)?;
        if orphans > 0 {
            tracing::info!(orphans, "removed stale staging files");
        }
        let adoptable = store::scan(&workdir)?.len();
        if adoptable > 0 {
            tracing::info!(adoptable, "published artifacts present on disk");
        }

        Ok(Self {
            workdir,
            quota,
            client: reqwest::Client::new(),
            downloads: RwLock::new(HashMap::new()),
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the record for `url`, creating it on first request.
    ///
    /// A second call for the same URL returns the same record without any
    /// network traffic; a published file left by an earlier run is adopted
    /// as a completed record. A failed probe creates no record.
    pub async fn retrieve(&self, url: &str) -> Result<Arc<Download>, FlashgetError> {
        let mut downloads = self.downloads.write().await;

        if let Some(existing) = downloads.get(url).cloned() {
            if existing.file_missing() {
                downloads.remove(url);
            } else {
                return Ok(existing);
            }
        }

        let published = store::published_path(&self.workdir, url);
        if let Ok(meta) = std::fs::metadata(&published) {
            let modified = meta
                .modified()
                .map(system_time_millis)
                .unwrap_or_else(|_| now_millis());
            let dl = Arc::new(Download::adopted(url, published, meta.len(), modified));
            downloads.insert(url.to_string(), Arc::clone(&dl));
            tracing::info!(url, "adopted existing artifact");
            return Ok(dl);
        }

        tracing::info!(url, "starting download");
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(FlashgetError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }
        let content_length = resp.content_length().unwrap_or(0);

        let staging = store::staging_path(&self.workdir, url);
        let file = tokio::fs::File::create(&staging).await?;

        let dl = Arc::new(Download::downloading(url, published.clone(), content_length));
        downloads.insert(url.to_string(), Arc::clone(&dl));

        tokio::spawn(copy_body(Arc::clone(&dl), resp, file, staging, published));
        Ok(dl)
    }

    /// Remove a terminal record and its published file. Rejected while the
    /// record is still downloading; cancellation is out of scope.
    pub async fn remove(&self, url: &str) -> bool {
        let mut downloads = self.downloads.write().await;
        let Some(dl) = downloads.get(url) else {
            return false;
        };
        if dl.status() == DownloadStatus::Downloading {
            return false;
        }
        if std::fs::remove_file(dl.filename()).is_err() {
            return false;
        }
        downloads.remove(url);
        true
    }

    /// Evict completed artifacts, oldest finished first, while their summed
    /// content length exceeds the quota. In-flight and failed records are
    /// never touched.
    pub async fn recycle(&self) {
        let finished = self.finished_downloads().await;
        let mut total: u64 = finished.iter().map(|dl| dl.content_length()).sum();

        for dl in finished {
            if total <= self.quota {
                break;
            }
            tracing::info!(url = dl.url(), "recycling artifact");
            if self.remove(dl.url()).await {
                total = total.saturating_sub(dl.content_length());
            }
        }
    }

    /// Run `recycle` now and then every 50 seconds.
    pub fn spawn_recycler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECYCLE_INTERVAL);
            loop {
                ticker.tick().await;
                cache.recycle().await;
            }
        })
    }

    async fn finished_downloads(&self) -> Vec<Arc<Download>> {
        let downloads = self.downloads.read().await;
        let mut finished: Vec<_> = downloads
            .values()
            .filter(|dl| dl.is_success())
            .cloned()
            .collect();
        finished.sort_by_key(|dl| dl.finished_at().unwrap_or(0));
        finished
    }

    #[cfg(test)]
    async fn insert_for_test(&self, dl: Arc<Download>) {
        self.downloads
            .write()
            .await
            .insert(dl.url().to_string(), dl);
    }

    #[cfg(test)]
    async fn contains(&self, url: &str) -> bool {
        self.downloads.read().await.contains_key(url)
    }
}

async fn copy_body(
    dl: Arc<Download>,
    resp: reqwest::Response,
    mut file: tokio::fs::File,
    staging: PathBuf,
    published: PathBuf,
) {
    match stream_to_file(&dl, resp, &mut file).await {
        Ok(()) => {
            drop(file);
            if let Err(err) = store::publish(&staging, &published) {
                let _ = std::fs::remove_file(&staging);
                dl.fail(format!("publish failed: {err}"));
                tracing::warn!(url = dl.url(), error = %err, "publish failed");
                return;
            }
            dl.complete();
            tracing::info!(url = dl.url(), written = dl.written(), "download finished");
        }
        Err(err) => {
            drop(file);
            let _ = std::fs::remove_file(&staging);
            tracing::warn!(url = dl.url(), error = %err, "download failed");
            dl.fail(err);
        }
    }
}

async fn stream_to_file(
    dl: &Download,
    resp: reqwest::Response,
    file: &mut tokio::fs::File,
) -> Result<(), String> {
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("read body: {e}"))?;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write staging file: {e}"))?;
        dl.add_written(chunk.len() as u64);
    }
    file.flush()
        .await
        .map_err(|e| format!("flush staging file: {e}"))?;
    Ok(())
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn system_time_millis(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}
