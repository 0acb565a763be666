//! Release artifacts kept in the resources directory.
//!
//! The provisioner needs the agent tarball and the companion APKs as local
//! files before it can push anything. Downloads stage into a temp name and
//! rename into place; the tarball is unpacked with the system `tar`.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("download {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("download {url}: unexpected status {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("extract {0}: {1}")]
    Extract(PathBuf, String),

    #[error("{0} missing after extraction")]
    MissingAfterExtract(PathBuf),
}

/// Make sure `dest` exists, downloading it from `url` when absent.
pub async fn ensure_file(
    client: &reqwest::Client,
    url: &str,
    dest: &Path,
) -> Result<(), ResourceError> {
    if dest.exists() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(url, dest = %dest.display(), "downloading resource");

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|source| ResourceError::Request {
            url: url.to_string(),
            source,
        })?;
    if !resp.status().is_success() {
        return Err(ResourceError::Status {
            url: url.to_string(),
            status: resp.status().as_u16(),
        });
    }

    let tmp = dest.with_extension(format!("tmp-{}", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| ResourceError::Request {
            url: url.to_string(),
            source,
        });
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                drop(file);
                let _ = std::fs::remove_file(&tmp);
                return Err(err);
            }
        };
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    std::fs::rename(&tmp, dest)?;
    Ok(())
}

/// Local path of the agent binary for the declared version, downloading and
/// unpacking the release tarball when needed.
pub async fn ensure_agent_binary(
    client: &reqwest::Client,
    config: &Config,
) -> Result<PathBuf, ResourceError> {
    let tarball = config.agent_tarball_path();
    let binary = config.agent_binary_path();

    if !tarball.exists() || !binary.exists() {
        ensure_file(client, &config.agent_tarball_url(), &tarball).await?;
        extract_tarball(&tarball, &config.agent_extract_dir()).await?;
    }

    if !binary.exists() {
        return Err(ResourceError::MissingAfterExtract(binary));
    }
    Ok(binary)
}

async fn extract_tarball(archive: &Path, dest: &Path) -> Result<(), ResourceError> {
    std::fs::create_dir_all(dest)?;

    tracing::info!(archive = %archive.display(), dest = %dest.display(), "extracting archive");

    let output = Command::new("tar")
        .arg("-xzf")
        .arg(archive)
        .arg("-C")
        .arg(dest)
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(ResourceError::Extract(archive.to_path_buf(), stderr));
    }
    Ok(())
}
