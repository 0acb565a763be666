//! In-memory set of provisioned, currently-online devices.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

/// A provisioned device as the API reports it. Records are immutable;
/// re-provisioning replaces the whole record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub serial: String,
    pub model: String,
    pub product: String,
    pub udid: String,
    /// Host port forwarded to the agent's port 7912 on the device.
    pub agent_port: u16,
}

#[derive(Default)]
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl DeviceRegistry {
    pub fn add(&self, record: DeviceRecord) {
        self.devices
            .lock()
            .unwrap()
            .insert(record.serial.clone(), record);
    }

    pub fn remove(&self, serial: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().remove(serial)
    }

    pub fn get(&self, serial: &str) -> Option<DeviceRecord> {
        self.devices.lock().unwrap().get(serial).cloned()
    }

    /// Snapshot of all records; order unspecified.
    pub fn all(&self) -> Vec<DeviceRecord> {
        self.devices.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(serial: &str, udid: &str) -> DeviceRecord {
        DeviceRecord {
            serial: serial.into(),
            model: "Pixel".into(),
            product: "sailfish".into(),
            udid: udid.into(),
            agent_port: 40001,
        }
    }

    #[test]
    fn add_get_remove_round_trip() {
        let registry = DeviceRegistry::default();
        registry.add(record("S1", "U1"));

        assert_eq!(registry.get("S1").unwrap().udid, "U1");
        assert!(registry.get("S2").is_none());

        assert!(registry.remove("S1").is_some());
        assert!(registry.get("S1").is_none());
        assert!(registry.remove("S1").is_none());
    }

    #[test]
    fn reprovision_replaces_wholesale() {
        let registry = DeviceRegistry::default();
        registry.add(record("S1", "U1"));
        registry.add(record("S1", "U2"));

        assert_eq!(registry.all().len(), 1);
        assert_eq!(registry.get("S1").unwrap().udid, "U2");
    }

    #[test]
    fn record_serializes_with_camel_case_port() {
        let json = serde_json::to_value(record("S1", "U1")).unwrap();
        assert_eq!(json["serial"], "S1");
        assert_eq!(json["agentPort"], 40001);
    }
}
