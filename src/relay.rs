// relay.rs
//! The relay core.
//!
//! All mutations of the device state (inbound device messages, tentative
//! command effects, command completions, transport status) go through one
//! `tokio::sync::Mutex`. Sequence numbers are assigned and deltas fanned out
//! while that lock is held, so every viewer observes updates in the order
//! they were applied, and a viewer registering concurrently either sees an
//! update in its snapshot or receives it afterwards, never both or neither.

use crate::{
    colors::ColorTable,
    commands::{self, Command, CommandDispatcher, Completion},
    config::{Settings, TopicSettings},
    devices::{self, DeviceMessage, DobotState, Inbound},
    error::AppError,
    metrics,
    models::{StateDelta, StateView, Task, WsMessage},
    sessions::SessionRegistry,
    transport::{Transport, TransportEvent},
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What became of one inbound device message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Applied { sequence: u64 },
    /// Valid, but changed nothing.
    Unchanged,
    Duplicate,
    Stale,
    Acknowledged { matched: bool },
}

struct Core {
    device: DobotState,
    sequence: u64,
    last_message_id: Option<String>,
    last_device_seq: Option<u64>,
    replay: VecDeque<(u64, StateDelta)>,
    replay_window: usize,
    transport_connected: bool,
}

impl Core {
    fn view(&self) -> StateView {
        StateView {
            sequence: self.sequence,
            state: self.device.state().clone(),
            transport_connected: self.transport_connected,
            max_history: self.device.max_history(),
        }
    }

    /// Updates after `from`, if the replay window still holds all of them.
    fn replay_since(&self, from: u64) -> Option<Vec<WsMessage>> {
        if from > self.sequence {
            return None;
        }
        if from < self.sequence {
            let oldest = self.replay.front()?.0;
            if oldest > from + 1 {
                return None;
            }
        }
        Some(
            self.replay
                .iter()
                .filter(|(sequence, _)| *sequence > from)
                .map(|(sequence, delta)| WsMessage::StateUpdate {
                    sequence: *sequence,
                    delta: delta.clone(),
                })
                .collect(),
        )
    }
}

pub struct Relay {
    core: Mutex<Core>,
    sessions: SessionRegistry,
    dispatcher: Arc<CommandDispatcher>,
    transport: Arc<dyn Transport>,
    topics: TopicSettings,
    colors: ColorTable,
}

impl Relay {
    /// Builds the relay around an already constructed transport and starts
    /// the task that reports command completions to viewers.
    pub fn new(settings: &Settings, transport: Arc<dyn Transport>) -> Arc<Self> {
        let (dispatcher, completions) = CommandDispatcher::new(
            Arc::clone(&transport),
            settings.topics.command.clone(),
            &settings.commands,
        );

        let relay = Arc::new(Self {
            core: Mutex::new(Core {
                device: DobotState::new(settings.state.max_history),
                sequence: 0,
                last_message_id: None,
                last_device_seq: None,
                replay: VecDeque::new(),
                replay_window: settings.server.replay_window,
                transport_connected: false,
            }),
            sessions: SessionRegistry::new(settings.server.viewer_buffer),
            dispatcher,
            transport,
            topics: settings.topics.clone(),
            colors: settings.colors.table(),
        });

        tokio::spawn(report_completions(Arc::downgrade(&relay), completions));
        relay
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub async fn snapshot(&self) -> StateView {
        self.core.lock().await.view()
    }

    /// Consumes transport events until the transport goes away.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        warn!("Transport event stream closed");
    }

    pub async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message { topic, payload } => {
                match self.ingest_device_message(&topic, &payload).await {
                    Ok(outcome) => debug!(%topic, ?outcome, "Device message handled"),
                    Err(e) => {
                        metrics::device_message(e.code());
                        warn!(%topic, code = e.code(), error = %e, "Dropped device message");
                    }
                }
            }
            TransportEvent::Connected => {
                self.set_transport_connected(true, false).await;
                self.request_resync().await;
            }
            TransportEvent::Reconnected => {
                self.set_transport_connected(true, true).await;
                self.request_resync().await;
            }
            TransportEvent::Disconnected => {
                self.set_transport_connected(false, false).await;
            }
        }
    }

    /// Decodes and merges one device message. Errors leave the state as it
    /// was.
    pub async fn ingest_device_message(
        &self,
        topic: &str,
        raw: &[u8],
    ) -> Result<Ingested, AppError> {
        let kind = self
            .topics
            .kind_of(topic)
            .ok_or_else(|| AppError::UnknownTopic(topic.to_string()))?;
        let Inbound { envelope, message } = devices::decode(kind, raw, &self.colors)?;

        if let DeviceMessage::Ack(ack) = &message {
            let matched = self
                .dispatcher
                .on_device_ack(&ack.correlation_id, ack.success, ack.error.clone());
            metrics::device_message("acknowledged");
            return Ok(Ingested::Acknowledged { matched });
        }

        let mut core = self.core.lock().await;

        if let Some(id) = &envelope.message_id {
            if core.last_message_id.as_ref() == Some(id) {
                metrics::device_message("duplicate");
                debug!(%topic, message_id = %id, "Duplicate device message dropped");
                return Ok(Ingested::Duplicate);
            }
        }
        if let (Some(seq), Some(last)) = (envelope.seq, core.last_device_seq) {
            if seq <= last {
                metrics::device_message("stale");
                debug!(%topic, seq, last, "Stale device message dropped");
                return Ok(Ingested::Stale);
            }
        }

        let delta = core.device.apply(message);
        if envelope.message_id.is_some() {
            core.last_message_id = envelope.message_id;
        }
        if envelope.seq.is_some() {
            core.last_device_seq = envelope.seq;
        }

        match self.commit(&mut core, delta) {
            Some(sequence) => {
                metrics::device_message("applied");
                Ok(Ingested::Applied { sequence })
            }
            None => {
                metrics::device_message("unchanged");
                Ok(Ingested::Unchanged)
            }
        }
    }

    /// Validates and dispatches a viewer command, returning its correlation
    /// id. The session gets `command_accepted` now and `command_result` once
    /// the device answers or the retry budget runs out.
    pub async fn issue_command(
        &self,
        session_id: Uuid,
        action: &str,
        payload: &Value,
    ) -> Result<String, AppError> {
        let command = commands::parse_command(action, payload, &self.colors).inspect_err(|e| {
            metrics::command("invalid");
            warn!(%session_id, action, error = %e, "Rejected viewer command");
        })?;

        // Held across dispatch so `command_accepted` and the tentative state
        // change precede anything the completion reporter does.
        let mut core = self.core.lock().await;
        let dispatched = self.dispatcher.dispatch(command.clone(), session_id).await;
        let correlation_id = dispatched.correlation_id;

        self.sessions.notify(
            session_id,
            WsMessage::CommandAccepted {
                correlation_id: correlation_id.clone(),
                action: command.action().to_string(),
            },
        );

        let delta = match command {
            Command::EmergencyStop => core.device.enter_emergency(),
            Command::AddQueue { color, target } => core.device.add_tentative_task(Task {
                id: correlation_id.clone(),
                color,
                target,
                pending: true,
            }),
            _ => StateDelta::default(),
        };
        self.commit(&mut core, delta);

        info!(
            %session_id,
            %correlation_id,
            action,
            queued = dispatched.queued,
            coalesced = dispatched.coalesced,
            "Command accepted"
        );
        Ok(correlation_id)
    }

    /// Registers a viewer and queues its starting point: the missing updates
    /// when `resume_from` is still inside the replay window, otherwise a
    /// full snapshot.
    pub async fn register_viewer(
        &self,
        session_id: Uuid,
        resume_from: Option<u64>,
    ) -> mpsc::Receiver<WsMessage> {
        let core = self.core.lock().await;
        let initial = match resume_from.and_then(|from| core.replay_since(from)) {
            Some(updates) => {
                let mut initial = vec![WsMessage::TransportStatus {
                    connected: core.transport_connected,
                }];
                initial.extend(updates);
                initial
            }
            None => {
                let view = core.view();
                vec![WsMessage::StateSnapshot {
                    sequence: view.sequence,
                    state: view.state,
                    transport_connected: view.transport_connected,
                    max_history: view.max_history,
                }]
            }
        };
        self.sessions.register(session_id, core.sequence, initial)
    }

    pub fn unregister_viewer(&self, session_id: Uuid) -> bool {
        self.sessions.unregister(session_id)
    }

    fn commit(&self, core: &mut Core, delta: StateDelta) -> Option<u64> {
        if delta.is_empty() {
            return None;
        }
        core.sequence += 1;
        let sequence = core.sequence;

        core.replay.push_back((sequence, delta.clone()));
        while core.replay.len() > core.replay_window {
            core.replay.pop_front();
        }

        self.sessions.broadcast(sequence, &delta);
        metrics::state_sequence(sequence);
        Some(sequence)
    }

    async fn complete(&self, completion: Completion) {
        let Completion {
            correlation_id,
            command,
            origins,
            outcome,
        } = completion;
        let mut core = self.core.lock().await;

        match command {
            Command::AddQueue { .. } => {
                let delta = if outcome.is_success() {
                    core.device.confirm_task(&correlation_id)
                } else {
                    core.device.discard_task(&correlation_id)
                };
                self.commit(&mut core, delta);
            }
            Command::EmergencyStop | Command::Reset if outcome.is_success() => {
                core.device.confirm_emergency();
            }
            _ => {}
        }

        let error = outcome.error(&correlation_id);
        let result = WsMessage::CommandResult {
            correlation_id: correlation_id.clone(),
            success: error.is_none(),
            error: error.as_ref().map(ToString::to_string),
            code: error.as_ref().map(|e| e.code().to_string()),
        };
        for origin in origins {
            if !self.sessions.notify(origin, result.clone()) {
                debug!(%origin, %correlation_id, "Origin session gone, command result dropped");
            }
        }
    }

    async fn set_transport_connected(&self, connected: bool, reconnected: bool) {
        let mut core = self.core.lock().await;
        if reconnected {
            // The device may have restarted its own numbering meanwhile.
            core.last_device_seq = None;
            core.last_message_id = None;
        }
        if core.transport_connected != connected {
            core.transport_connected = connected;
            self.sessions
                .notify_all(WsMessage::TransportStatus { connected });
        }
    }

    async fn request_resync(&self) {
        let Some(topic) = &self.topics.state_request else {
            return;
        };
        match self.transport.publish(topic, b"{}".to_vec()).await {
            Ok(()) => info!(%topic, "Requested full state from device"),
            Err(e) => warn!(%topic, error = %e, "State resync request failed"),
        }
    }
}

async fn report_completions(
    relay: Weak<Relay>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    while let Some(completion) = completions.recv().await {
        let Some(relay) = relay.upgrade() else {
            break;
        };
        relay.complete(completion).await;
    }
}
