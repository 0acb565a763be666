use std::collections::HashSet;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::client::Adb;
use crate::error::AdbError;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Hotplug event for one serial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceEvent {
    Online(String),
    Offline(String),
}

/// Start the hotplug watcher.
///
/// Polls `adb devices -l` and emits an event whenever a serial enters or
/// leaves the `device` state. Devices already attached at startup are
/// reported as online on the first poll. The task ends with an error after
/// repeated enumeration failures; the channel closing signals the consumer.
pub fn watch_devices(adb: Adb) -> (mpsc::Receiver<DeviceEvent>, JoinHandle<Result<(), AdbError>>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = tokio::spawn(run(adb, tx));
    (rx, handle)
}

async fn run(adb: Adb, tx: mpsc::Sender<DeviceEvent>) -> Result<(), AdbError> {
    let mut online: HashSet<String> = HashSet::new();
    let mut failures = 0u32;
    let mut ticker = tokio::time::interval(POLL_INTERVAL);

    loop {
        ticker.tick().await;

        let listings = match adb.list_devices().await {
            Ok(listings) => {
                failures = 0;
                listings
            }
            Err(err) => {
                failures += 1;
                tracing::warn!(error = %err, failures, "device enumeration failed");
                if failures >= MAX_CONSECUTIVE_FAILURES {
                    return Err(err);
                }
                continue;
            }
        };

        let current: HashSet<String> = listings
            .iter()
            .filter(|l| l.is_online())
            .map(|l| l.serial.clone())
            .collect();

        for serial in current.difference(&online) {
            if tx.send(DeviceEvent::Online(serial.clone())).await.is_err() {
                return Ok(());
            }
        }
        for serial in online.difference(&current) {
            if tx.send(DeviceEvent::Offline(serial.clone())).await.is_err() {
                return Ok(());
            }
        }

        online = current;
    }
}
