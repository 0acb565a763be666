//! Heartbeat client: registers this provider with the coordinator and keeps
//! per-device state in sync across coordinator outages.
//!
//! Every send is best-effort. A resend buffer holds the last payload per
//! device key; after the coordinator recovers from a failure, the whole
//! buffer is re-published once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Per-device payload published to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum DevicePayload {
    Online {
        udid: String,
        #[serde(rename = "providerForwardedPort")]
        provider_forwarded_port: u16,
    },
    Offline,
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("heartbeat payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("heartbeat rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

pub struct HeartbeatClient {
    id: String,
    port: u16,
    url: String,
    client: reqwest::Client,
    storage: Mutex<HashMap<String, DevicePayload>>,
}

impl HeartbeatClient {
    /// `url` is the full heartbeat endpoint; `port` is the port this
    /// provider's own HTTP surface listens on.
    pub fn new(url: String, port: u16) -> Self {
        Self {
            id: uprov_util::machine_id(),
            port,
            url,
            client: reqwest::Client::new(),
            storage: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One bare POST; 200 is the only accepted answer.
    pub async fn ping(&self) -> Result<(), HeartbeatError> {
        self.send(None).await
    }

    /// Store the latest payload for `key` and publish it. Transport errors
    /// are swallowed; the resend buffer covers them on recovery.
    pub async fn add_data(&self, key: &str, payload: DevicePayload) {
        self.storage
            .lock()
            .unwrap()
            .insert(key.to_string(), payload.clone());
        if let Err(err) = self.send(Some(&payload)).await {
            tracing::warn!(key, error = %err, "heartbeat publish failed");
        }
    }

    /// Publish the offline tag for `key` once and drop it from the buffer.
    pub async fn delete(&self, key: &str) {
        if self.storage.lock().unwrap().remove(key).is_none() {
            return;
        }
        if let Err(err) = self.send(Some(&DevicePayload::Offline)).await {
            tracing::warn!(key, error = %err, "heartbeat offline publish failed");
        }
    }

    /// Ping every five seconds forever. The first success after any failure
    /// re-publishes the whole resend buffer.
    pub async fn ping_forever(self: std::sync::Arc<Self>) {
        let mut failed = false;
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(err) = self.ping().await {
                tracing::warn!(error = %err, "heartbeat ping failed");
                failed = true;
                continue;
            }
            if failed {
                failed = false;
                tracing::info!("coordinator back alive, resending device state");
                self.resend_all().await;
            }
        }
    }

    /// Re-publish every buffered payload; used after the coordinator
    /// recovers.
    pub async fn resend_all(&self) {
        let entries: Vec<(String, DevicePayload)> = {
            let storage = self.storage.lock().unwrap();
            storage
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, payload) in entries {
            if let Err(err) = self.send(Some(&payload)).await {
                tracing::warn!(key, error = %err, "heartbeat resend failed");
            }
        }
    }

    async fn send(&self, data: Option<&DevicePayload>) -> Result<(), HeartbeatError> {
        let mut form = vec![("id", self.id.clone()), ("port", self.port.to_string())];
        if let Some(payload) = data {
            form.push(("data", serde_json::to_string(payload)?));
        }

        let resp = self
            .client
            .post(&self.url)
            .timeout(SEND_TIMEOUT)
            .form(&form)
            .send()
            .await?;

        if resp.status().as_u16() == 200 {
            Ok(())
        } else {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            Err(HeartbeatError::Rejected { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn online_payload_serializes_with_status_tag() {
        let payload = DevicePayload::Online {
            udid: "U1".into(),
            provider_forwarded_port: 40001,
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["status"], "online");
        assert_eq!(json["udid"], "U1");
        assert_eq!(json["providerForwardedPort"], 40001);
    }

    #[test]
    fn offline_payload_is_tag_only() {
        let json = serde_json::to_value(&DevicePayload::Offline).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "offline" }));
    }
}
