// metrics/mod.rs
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use std::net::SocketAddr;

pub fn setup_metrics(port: u16) -> Result<(), BuildError> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    PrometheusBuilder::new().with_http_listener(addr).install()
}

/// `applied`, `unchanged`, `duplicate`, `stale`, `acknowledged` or an error code.
pub fn device_message(outcome: &'static str) {
    metrics::counter!("relay_device_messages_total", "outcome" => outcome).increment(1);
}

pub fn command(outcome: &'static str) {
    metrics::counter!("relay_commands_total", "outcome" => outcome).increment(1);
}

pub fn command_retry() {
    metrics::counter!("relay_command_retries_total").increment(1);
}

pub fn transport_event(event: &'static str) {
    metrics::counter!("relay_transport_events_total", "event" => event).increment(1);
}

pub fn viewer_lagged() {
    metrics::counter!("relay_viewer_lagged_total").increment(1);
}

pub fn viewer_sessions(count: usize) {
    metrics::gauge!("relay_viewer_sessions").set(count as f64);
}

pub fn pending_commands(count: usize) {
    metrics::gauge!("relay_pending_commands").set(count as f64);
}

pub fn state_sequence(sequence: u64) {
    metrics::gauge!("relay_state_sequence").set(sequence as f64);
}
