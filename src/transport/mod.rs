// transport/mod.rs
//! Broker-facing side of the relay.
//!
//! A transport publishes outbound payloads through [`Transport::publish`] and
//! hands everything it receives to the relay as a stream of
//! [`TransportEvent`]s, in broker order. Lifecycle changes (connection lost,
//! connection restored) travel on the same stream so the relay sees them
//! ordered relative to the messages around them.

mod memory;
mod mqtt;

pub use memory::MemoryTransport;
pub use mqtt::MqttTransport;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Disconnected,
    Reconnected,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Resolves once the request is queued with the broker client. Delivery
    /// to the broker (PubAck) is not awaited, and a full client queue is an
    /// error rather than a wait.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;
}

/// Exponential backoff, doubling from `initial` and capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.attempt = self.attempt.saturating_add(1);
        self.initial
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<u128> = (0..6).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000, 3000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_survives_many_attempts() {
        let mut backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }
}
