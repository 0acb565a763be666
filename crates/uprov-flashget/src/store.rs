//! On-disk layout of the artifact cache.
//!
//! Published artifacts live at `<workdir>/<md5(url)>.file`; in-flight
//! downloads stage at `<workdir>/<md5(url)>.file.cache`. Everything above
//! the filesystem (dedup, eviction, adoption) lives in the manager.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use md5::{Digest, Md5};

pub const PUBLISHED_EXT: &str = "file";
const STAGING_SUFFIX: &str = ".cache";

/// Content key for a URL: lowercase-hex MD5 of its UTF-8 bytes.
pub fn key(url: &str) -> String {
    let digest = Md5::digest(url.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

pub fn published_path(workdir: &Path, url: &str) -> PathBuf {
    workdir.join(format!("{}.{PUBLISHED_EXT}", key(url)))
}

pub fn staging_path(workdir: &Path, url: &str) -> PathBuf {
    let mut name = published_path(workdir, url).into_os_string();
    name.push(STAGING_SUFFIX);
    PathBuf::from(name)
}

/// Atomically publish a staged download.
pub fn publish(stage: &Path, published: &Path) -> io::Result<()> {
    fs::rename(stage, published)
}

/// A published artifact found on disk.
#[derive(Clone, Debug)]
pub struct ScanEntry {
    pub key: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// Enumerate `*.file` entries in the working directory.
pub fn scan(dir: &Path) -> io::Result<Vec<ScanEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(PUBLISHED_EXT) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        entries.push(ScanEntry {
            key: stem.to_string(),
            size: meta.len(),
            modified: meta.modified()?,
        });
    }
    Ok(entries)
}

/// Delete `*.file.cache` leftovers from a previous run. In-flight downloads
/// are never resumable, so any staging file at startup is garbage.
pub fn remove_orphaned_staging(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(&format!(".{PUBLISHED_EXT}{STAGING_SUFFIX}")) {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_md5_hex_of_url() {
        // md5("a"), the reference value for single-letter content keys.
        assert_eq!(key("a"), "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(key("").len(), 32);
        assert!(key("http://x/a").chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_depends_only_on_url() {
        assert_eq!(key("http://x/a"), key("http://x/a"));
        assert_ne!(key("http://x/a"), key("http://x/b"));
    }

    #[test]
    fn paths_share_the_key_prefix() {
        let workdir = Path::new("/var/cache/uprov");
        let published = published_path(workdir, "http://x/a");
        let staging = staging_path(workdir, "http://x/a");
        assert_eq!(
            staging.to_str().unwrap(),
            format!("{}.cache", published.to_str().unwrap())
        );
        assert!(published.to_str().unwrap().ends_with(".file"));
    }

    #[test]
    fn scan_lists_only_published_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0cc175b9c0f1b6a831c399e269772661.file"), b"x").unwrap();
        fs::write(
            dir.path().join("92eb5ffee6ae2fec3ad71c777531578f.file.cache"),
            b"y",
        )
        .unwrap();
        fs::write(dir.path().join("index.html"), b"z").unwrap();

        let entries = scan(dir.path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "0cc175b9c0f1b6a831c399e269772661");
        assert_eq!(entries[0].size, 1);
    }

    #[test]
    fn remove_orphaned_staging_leaves_published_files() {
        let dir = tempfile::tempdir().unwrap();
        let published = dir.path().join("0cc175b9c0f1b6a831c399e269772661.file");
        let staging = dir.path().join("92eb5ffee6ae2fec3ad71c777531578f.file.cache");
        fs::write(&published, b"x").unwrap();
        fs::write(&staging, b"y").unwrap();

        assert_eq!(remove_orphaned_staging(dir.path()).unwrap(), 1);
        assert!(published.exists());
        assert!(!staging.exists());
    }
}
