//! Install pipeline behaviour against a mock device transport.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::MockDevice;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uprov_adb::DeviceTransport;
use uprov_flashget::Cache;
use uprov_server::install::{projected_info, InstallManager, InstallRecord, InstallStatus};

/// Origin that answers with `body` after `delay`, keeping the record in the
/// downloading state long enough to observe it.
async fn serve_slow(body: &'static [u8], delay: Duration) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let header =
                    format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
                let _ = sock.write_all(header.as_bytes()).await;
                tokio::time::sleep(delay).await;
                let _ = sock.write_all(body).await;
                let _ = sock.flush().await;
            });
        }
    });
    format!("http://{addr}")
}

/// Origin that announces 1000 bytes and closes after 100.
async fn serve_truncated() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                let _ = sock.read(&mut buf).await;
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\n\r\n")
                    .await;
                let _ = sock.write_all(&[0u8; 100]).await;
                let _ = sock.flush().await;
            });
        }
    });
    format!("http://{addr}")
}

async fn wait_terminal(record: &InstallRecord) -> InstallStatus {
    for _ in 0..500 {
        let status = record.status();
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("install did not reach a terminal state");
}

async fn wait_status(record: &InstallRecord, wanted: InstallStatus) {
    for _ in 0..500 {
        if record.status() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("install never reached {wanted:?}");
}

fn manager(dir: &tempfile::TempDir) -> Arc<InstallManager> {
    let cache = Arc::new(Cache::new(dir.path().to_path_buf()).unwrap());
    InstallManager::new(cache)
}

// ---------------------------------------------------------------------------
// Test: happy path walks download → pushing → installing → success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_happy_path_reaches_success() {
    let base = serve_slow(b"apk-bytes", Duration::from_millis(150)).await;
    let url = format!("{base}/app.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(MockDevice::new("S1").with_install_output("Success\n"));

    let record = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, false)
        .await
        .unwrap();

    assert_eq!(record.id(), "1");
    assert_eq!(record.serial(), "S1");
    assert_eq!(record.status(), InstallStatus::Downloading);

    assert_eq!(wait_terminal(&record).await, InstallStatus::Success);

    let info = record.info();
    assert_eq!(info.device_file_path, "/sdcard/tmp/u2init-1.apk");
    assert_eq!(info.description, "Success");

    let calls = device.calls();
    let push_at = calls
        .iter()
        .position(|c| c.starts_with("push /sdcard/tmp/u2init-1.apk"))
        .expect("no push call");
    let install_at = calls
        .iter()
        .position(|c| c.starts_with("shell pm install -r -t /sdcard/tmp/u2init-1.apk"))
        .expect("no pm install call");
    assert!(push_at < install_at, "install ran before push: {calls:?}");
}

// ---------------------------------------------------------------------------
// Test: noInstall stops after the push, pm install never runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_install_skips_pm_install() {
    let base = serve_slow(b"apk-bytes", Duration::ZERO).await;
    let url = format!("{base}/app.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(MockDevice::new("S1"));

    let record = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, true)
        .await
        .unwrap();

    assert_eq!(wait_terminal(&record).await, InstallStatus::Success);
    assert_eq!(record.info().description, "Skip install, just pushed");
    assert!(device.pm_installs().is_empty(), "{:?}", device.calls());
    assert_eq!(device.pushes().len(), 1);
}

// ---------------------------------------------------------------------------
// Test: pm install reporting Failure fails the record with its output
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pm_install_failure_output_fails_the_record() {
    let base = serve_slow(b"apk-bytes", Duration::ZERO).await;
    let url = format!("{base}/app.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(
        MockDevice::new("S1").with_install_output("Failure [INSTALL_FAILED_INVALID_APK]\n"),
    );

    let record = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, false)
        .await
        .unwrap();

    assert_eq!(wait_terminal(&record).await, InstallStatus::Failure);
    assert_eq!(
        record.info().description,
        "Failure [INSTALL_FAILED_INVALID_APK]"
    );
}

// ---------------------------------------------------------------------------
// Test: a failed download fails the install with the download's detail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_download_fails_the_install() {
    let base = serve_truncated().await;
    let url = format!("{base}/broken.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(MockDevice::new("S1"));

    let record = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, false)
        .await
        .unwrap();

    assert_eq!(wait_terminal(&record).await, InstallStatus::Failure);
    assert!(record
        .info()
        .description
        .starts_with("http download failed: failure"));
    assert!(device.pushes().is_empty(), "pushed a failed download");
}

// ---------------------------------------------------------------------------
// Test: ids are assigned monotonically
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_ids_are_monotonic() {
    let base = serve_slow(b"apk-bytes", Duration::ZERO).await;
    let url = format!("{base}/app.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(MockDevice::new("S1"));

    let first = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, true)
        .await
        .unwrap();
    let second = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, true)
        .await
        .unwrap();

    assert_eq!(first.id(), "1");
    assert_eq!(second.id(), "2");
    assert!(manager.get("1").is_some());
    assert!(manager.get("2").is_some());
    assert!(manager.get("3").is_none());
}

// ---------------------------------------------------------------------------
// Test: progress projection while downloading and while pushing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn projection_synthesises_progress_descriptions() {
    let base = serve_slow(b"apk-bytes", Duration::from_millis(200)).await;
    let url = format!("{base}/app.apk");

    let dir = tempfile::tempdir().unwrap();
    let manager = manager(&dir);
    let device = Arc::new(
        MockDevice::new("S1")
            .with_push_delay(Duration::from_millis(200))
            .with_stat_size(512),
    );

    let record = manager
        .begin(Arc::clone(&device) as Arc<dyn DeviceTransport>, &url, true)
        .await
        .unwrap();

    // Downloading: `written / total - rate/s`, no device round-trip.
    let info = projected_info(&record, None).await;
    assert_eq!(info.status, InstallStatus::Downloading);
    assert!(
        info.description.starts_with("0B / 9B - "),
        "unexpected description: {}",
        info.description
    );
    assert!(info.description.ends_with("/s"));

    // Pushing: `pushed / total  speed: rate/s`, from a device-side stat.
    wait_status(&record, InstallStatus::Pushing).await;
    let info = projected_info(&record, Some(device.as_ref())).await;
    assert_eq!(info.status, InstallStatus::Pushing);
    assert!(
        info.description.starts_with("512B / 9B  speed: "),
        "unexpected description: {}",
        info.description
    );
    assert!(info.description.ends_with("/s"));

    assert_eq!(wait_terminal(&record).await, InstallStatus::Success);
}
