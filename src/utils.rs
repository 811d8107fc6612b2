// utils.rs
use crate::relay::Relay;
use chrono::{SecondsFormat, Utc};
use tracing::info;
use uuid::Uuid;

pub async fn cleanup_viewer_connection(session_id: Uuid, relay: &Relay) {
    relay.unregister_viewer(session_id);
    info!("Viewer {} disconnected", session_id);
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
