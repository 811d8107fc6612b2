// commands/dispatch.rs
//! Correlation-id tracked command delivery.
//!
//! Each dispatched command lives in the pending table until the device
//! acknowledges it or its retry budget runs out. A driver task per command
//! publishes, waits `timeout` for the ack, and republishes with the same
//! correlation id until `max_retries` is exhausted. The final outcome is
//! reported exactly once on the completion channel.
//!
//! Non-emergency actions are single-in-flight: a second `home` waits in the
//! action's lane until the first resolves. `emergency_stop` skips the lanes
//! and concurrent requests coalesce onto the one already pending.

use super::Command;
use crate::{
    config::CommandSettings,
    error::AppError,
    metrics,
    transport::Transport,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct PendingCommand {
    pub correlation_id: String,
    pub command: Command,
    pub issued_at: DateTime<Utc>,
    pub attempts: u32,
    /// First entry is the session that issued the command; coalesced
    /// emergency stops add theirs.
    pub origins: Vec<Uuid>,
    resolve: Option<oneshot::Sender<Resolution>>,
}

impl PendingCommand {
    fn new(correlation_id: String, command: Command, origin: Uuid) -> Self {
        Self {
            correlation_id,
            command,
            issued_at: Utc::now(),
            attempts: 0,
            origins: vec![origin],
            resolve: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Acknowledged,
    Rejected(String),
    TimedOut { attempts: u32 },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Acknowledged)
    }

    pub fn error(&self, correlation_id: &str) -> Option<AppError> {
        match self {
            CommandOutcome::Acknowledged => None,
            CommandOutcome::Rejected(reason) => Some(AppError::DeviceRejected(reason.clone())),
            CommandOutcome::TimedOut { attempts } => Some(AppError::CommandTimeout {
                correlation_id: correlation_id.to_string(),
                attempts: *attempts,
            }),
        }
    }
}

/// Final result of one command, emitted once.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub correlation_id: String,
    pub command: Command,
    pub origins: Vec<Uuid>,
    pub outcome: CommandOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub correlation_id: String,
    /// Joined an emergency stop that was already pending.
    pub coalesced: bool,
    /// Waiting behind an in-flight command with the same action.
    pub queued: bool,
}

#[derive(Debug)]
struct Resolution {
    origins: Vec<Uuid>,
    outcome: CommandOutcome,
}

#[derive(Default)]
struct Lanes {
    /// Presence of an action means one command for it is in flight; the
    /// deque holds the ones waiting behind it.
    waiting: HashMap<&'static str, VecDeque<PendingCommand>>,
    emergency: Option<String>,
}

pub struct CommandDispatcher {
    transport: Arc<dyn Transport>,
    topic: String,
    timeout: Duration,
    max_retries: u32,
    pending: DashMap<String, PendingCommand>,
    lanes: Mutex<Lanes>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl CommandDispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        topic: impl Into<String>,
        settings: &CommandSettings,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Completion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            transport,
            topic: topic.into(),
            timeout: settings.timeout(),
            max_retries: settings.max_retries,
            pending: DashMap::new(),
            lanes: Mutex::new(Lanes::default()),
            completions,
        });
        (dispatcher, rx)
    }

    /// Returns immediately; the outcome arrives on the completion channel.
    pub async fn dispatch(self: &Arc<Self>, command: Command, origin: Uuid) -> Dispatched {
        let mut lanes = self.lanes.lock().await;

        if command.is_emergency() {
            if let Some(id) = lanes.emergency.clone() {
                if let Some(mut pending) = self.pending.get_mut(&id) {
                    pending.origins.push(origin);
                    metrics::command("coalesced");
                    debug!(correlation_id = %id, %origin, "Emergency stop coalesced");
                    return Dispatched {
                        correlation_id: id,
                        coalesced: true,
                        queued: false,
                    };
                }
            }
            let correlation_id = new_correlation_id();
            lanes.emergency = Some(correlation_id.clone());
            drop(lanes);
            self.launch(PendingCommand::new(correlation_id.clone(), command, origin));
            return Dispatched {
                correlation_id,
                coalesced: false,
                queued: false,
            };
        }

        let correlation_id = new_correlation_id();
        let pending = PendingCommand::new(correlation_id.clone(), command, origin);
        let action = pending.command.action();
        let queued = lanes.waiting.contains_key(action);
        if queued {
            let lane = lanes.waiting.entry(action).or_default();
            lane.push_back(pending);
            debug!(
                %correlation_id,
                action,
                waiting = lane.len(),
                "Command queued behind in-flight action"
            );
        } else {
            lanes.waiting.insert(action, VecDeque::new());
            drop(lanes);
            self.launch(pending);
        }

        Dispatched {
            correlation_id,
            coalesced: false,
            queued,
        }
    }

    /// Resolves the pending command. Returns false for unknown or already
    /// resolved ids (late acks of retried commands land here).
    pub fn on_device_ack(
        &self,
        correlation_id: &str,
        success: bool,
        error: Option<String>,
    ) -> bool {
        let Some((_, mut pending)) = self.pending.remove(correlation_id) else {
            debug!(%correlation_id, "Ignoring ack for unknown or completed command");
            return false;
        };
        metrics::pending_commands(self.pending.len());

        let outcome = if success {
            CommandOutcome::Acknowledged
        } else {
            CommandOutcome::Rejected(error.unwrap_or_else(|| "rejected by device".to_string()))
        };
        if let Some(resolve) = pending.resolve.take() {
            let _ = resolve.send(Resolution {
                origins: std::mem::take(&mut pending.origins),
                outcome,
            });
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &str) -> bool {
        self.pending.contains_key(correlation_id)
    }

    fn launch(self: &Arc<Self>, mut pending: PendingCommand) {
        let (resolve, resolved) = oneshot::channel();
        pending.resolve = Some(resolve);
        let correlation_id = pending.correlation_id.clone();
        let command = pending.command.clone();
        let issued_at = pending.issued_at;
        self.pending.insert(correlation_id.clone(), pending);
        metrics::pending_commands(self.pending.len());
        metrics::command("dispatched");

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            dispatcher
                .drive(correlation_id, command, issued_at, resolved)
                .await
        });
    }

    async fn drive(
        self: Arc<Self>,
        correlation_id: String,
        command: Command,
        issued_at: DateTime<Utc>,
        mut resolved: oneshot::Receiver<Resolution>,
    ) {
        let payload = command.to_wire(&correlation_id).to_string().into_bytes();
        let max_attempts = self.max_retries + 1;
        let mut attempt = 0;

        let resolution = loop {
            attempt += 1;
            if let Some(mut pending) = self.pending.get_mut(&correlation_id) {
                pending.attempts = attempt;
            }
            if attempt > 1 {
                metrics::command_retry();
                warn!(
                    %correlation_id,
                    action = command.action(),
                    attempt,
                    "No ack, retrying command"
                );
            }
            // One deadline covers the publish and the ack wait.
            let deadline = Instant::now() + self.timeout;
            let publish = self.transport.publish(&self.topic, payload.clone());
            match tokio::time::timeout_at(deadline, publish).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(%correlation_id, error = %e, "Command publish failed"),
                Err(_) => warn!(%correlation_id, attempt, "Command publish stalled past deadline"),
            }

            match tokio::time::timeout_at(deadline, &mut resolved).await {
                Ok(Ok(resolution)) => break resolution,
                Ok(Err(_)) => break self.expire(&correlation_id, attempt),
                Err(_) if attempt < max_attempts => continue,
                Err(_) => match self.pending.remove(&correlation_id) {
                    Some((_, pending)) => {
                        metrics::pending_commands(self.pending.len());
                        break Resolution {
                            origins: pending.origins,
                            outcome: CommandOutcome::TimedOut { attempts: attempt },
                        };
                    }
                    // The ack won the race against the final timeout.
                    None => match resolved.await {
                        Ok(resolution) => break resolution,
                        Err(_) => break self.expire(&correlation_id, attempt),
                    },
                },
            }
        };

        let action = command.action();
        let elapsed_ms = (Utc::now() - issued_at).num_milliseconds();
        match &resolution.outcome {
            CommandOutcome::Acknowledged => {
                metrics::command("acked");
                info!(
                    %correlation_id,
                    action,
                    attempts = attempt,
                    elapsed_ms,
                    "Command acknowledged"
                );
            }
            CommandOutcome::Rejected(reason) => {
                metrics::command("failed");
                warn!(%correlation_id, action, %reason, elapsed_ms, "Command rejected by device");
            }
            CommandOutcome::TimedOut { attempts } => {
                metrics::command("timeout");
                warn!(%correlation_id, action, attempts, elapsed_ms, "Command timed out");
            }
        }

        self.finish(correlation_id, command, resolution).await;
    }

    fn expire(&self, correlation_id: &str, attempts: u32) -> Resolution {
        let origins = self
            .pending
            .remove(correlation_id)
            .map(|(_, pending)| pending.origins)
            .unwrap_or_default();
        Resolution {
            origins,
            outcome: CommandOutcome::TimedOut { attempts },
        }
    }

    async fn finish(
        self: &Arc<Self>,
        correlation_id: String,
        command: Command,
        resolution: Resolution,
    ) {
        let action = command.action();
        let is_emergency = command.is_emergency();

        let _ = self.completions.send(Completion {
            correlation_id: correlation_id.clone(),
            command,
            origins: resolution.origins,
            outcome: resolution.outcome,
        });

        let mut lanes = self.lanes.lock().await;
        if is_emergency {
            if lanes.emergency.as_deref() == Some(correlation_id.as_str()) {
                lanes.emergency = None;
            }
            return;
        }
        let next = match lanes.waiting.get_mut(action) {
            Some(lane) => lane.pop_front(),
            None => None,
        };
        match next {
            Some(next) => {
                drop(lanes);
                self.launch(next);
            }
            None => {
                lanes.waiting.remove(action);
            }
        }
    }
}

fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
