//! URL-addressed download cache.
//!
//! Artifacts are fetched once per URL, streamed into a staging file and
//! published under a stable content key with an atomic rename. Concurrent
//! requests for the same URL share one in-flight download; completed
//! artifacts are evicted oldest-first when the cache grows past its disk
//! quota.

mod manager;
mod store;

pub use manager::{Cache, Download, DownloadInfo, DownloadStatus, DEFAULT_QUOTA};
pub use store::{key, published_path, scan, staging_path, ScanEntry};

#[derive(Debug, thiserror::Error)]
pub enum FlashgetError {
    #[error("working directory must be absolute: {0}")]
    RelativeWorkdir(std::path::PathBuf),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
