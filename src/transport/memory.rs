// transport/memory.rs
use super::Transport;
use crate::error::TransportError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// In-process transport that records every publish. Used by tests and for
/// running the relay without a broker.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    failing: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every publish fails with [`TransportError::Publish`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.clone()
    }

    /// JSON payloads published on `topic`, oldest first. Payloads that are
    /// not JSON are skipped.
    pub async fn published_json(&self, topic: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Publish("memory transport set to fail".into()));
        }
        self.published.lock().await.push((topic.to_string(), payload));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_and_fails_on_demand() {
        let transport = MemoryTransport::new();
        transport
            .publish("device/command", br#"{"action":"home"}"#.to_vec())
            .await
            .expect("publish");

        transport.set_failing(true);
        let err = transport
            .publish("device/command", b"{}".to_vec())
            .await
            .expect_err("should fail");
        assert!(matches!(err, TransportError::Publish(_)));

        let sent = transport.published_json("device/command").await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["action"], "home");
    }
}
