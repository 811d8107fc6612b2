// transport/mqtt.rs
use super::{Backoff, Transport, TransportEvent};
use crate::{config::BrokerSettings, error::TransportError, metrics};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 1024;

pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Connects, subscribes to `topics` and starts the background event loop.
    ///
    /// The initial connection is retried `connect_attempts` times with
    /// backoff. Once connected, losing the broker is never fatal: the loop
    /// keeps polling (rumqttc reconnects on the next poll), resubscribes on
    /// every ConnAck and reports the gap as `Disconnected`/`Reconnected`.
    pub async fn connect(
        broker: &BrokerSettings,
        topics: Vec<String>,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let mut options = MqttOptions::new(&broker.client_id, &broker.host, broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));
        options.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let mut backoff = Backoff::new(broker.backoff_initial(), broker.backoff_max());
        let mut failures = 0;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => break,
                Ok(_) => {}
                Err(e) => {
                    failures += 1;
                    if failures >= broker.connect_attempts {
                        return Err(TransportError::Unreachable {
                            attempts: failures,
                            reason: e.to_string(),
                        });
                    }
                    let delay = backoff.next_delay();
                    warn!(
                        host = %broker.host,
                        port = broker.port,
                        attempt = failures,
                        ?delay,
                        error = %e,
                        "Broker connect failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        info!(host = %broker.host, port = broker.port, "Connected to MQTT broker");

        subscribe_all(&client, &topics)?;
        backoff.reset();

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        tx.send(TransportEvent::Connected)
            .await
            .map_err(|_| TransportError::Disconnected)?;
        tokio::spawn(run_event_loop(eventloop, client.clone(), topics, tx, backoff));

        Ok((Self { client }, rx))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // Never waits on the request channel: a full queue while the broker
        // is away is a publish error.
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

// Runs inside the event loop task, so it must not wait on the request
// channel that only this task drains.
fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), TransportError> {
    for topic in topics {
        client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| TransportError::Subscribe(format!("{topic}: {e}")))?;
        debug!(%topic, "Subscribed");
    }
    Ok(())
}

/// Connection bookkeeping for the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Link {
    connected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkChange {
    Unchanged,
    Lost,
    Restored,
}

impl Link {
    fn established() -> Self {
        Self { connected: true }
    }

    /// Every ConnAck resubscribes; only the first after a loss is reported.
    fn on_connack(&mut self) -> LinkChange {
        if self.connected {
            return LinkChange::Unchanged;
        }
        self.connected = true;
        LinkChange::Restored
    }

    /// Poll errors repeat while the broker is away; only the first is a loss.
    fn on_error(&mut self) -> LinkChange {
        if !self.connected {
            return LinkChange::Unchanged;
        }
        self.connected = false;
        LinkChange::Lost
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    topics: Vec<String>,
    events: mpsc::Sender<TransportEvent>,
    mut backoff: Backoff,
) {
    let mut link = Link::established();

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                if let Err(e) = subscribe_all(&client, &topics) {
                    error!(error = %e, "Resubscribe failed");
                }
                if link.on_connack() == LinkChange::Restored {
                    info!("Broker connection restored");
                    metrics::transport_event("reconnected");
                    if events.send(TransportEvent::Reconnected).await.is_err() {
                        break;
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if link.on_error() == LinkChange::Lost {
                    warn!(error = %e, "Broker connection lost");
                    metrics::transport_event("disconnected");
                    if events.send(TransportEvent::Disconnected).await.is_err() {
                        break;
                    }
                }
                tokio::time::sleep(backoff.next_delay()).await;
            }
        }
    }

    debug!("Transport event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_errors_report_one_loss() {
        let mut link = Link::established();
        assert_eq!(link.on_error(), LinkChange::Lost);
        assert_eq!(link.on_error(), LinkChange::Unchanged);
        assert_eq!(link.on_error(), LinkChange::Unchanged);
        assert!(!link.connected);
    }

    #[test]
    fn connack_after_loss_reports_one_restore() {
        let mut link = Link::established();
        link.on_error();
        assert_eq!(link.on_connack(), LinkChange::Restored);
        assert_eq!(link.on_connack(), LinkChange::Unchanged);
        assert!(link.connected);
    }

    #[test]
    fn connack_while_connected_is_not_a_restore() {
        let mut link = Link::established();
        assert_eq!(link.on_connack(), LinkChange::Unchanged);
        assert_eq!(link.on_error(), LinkChange::Lost);
        assert_eq!(link.on_connack(), LinkChange::Restored);
    }
}
