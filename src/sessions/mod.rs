// sessions/mod.rs
//! Registry of connected dashboard viewers.
//!
//! Each session owns a bounded outbound queue drained by its WebSocket task.
//! Fan-out only ever uses `try_send`, so a slow viewer cannot stall the relay
//! or its peers. A viewer whose queue overflows is dropped rather than
//! silently skipped: its socket closes, it reconnects and receives a fresh
//! snapshot, which keeps the per-viewer sequence gap-free.

use crate::{
    metrics,
    models::{StateDelta, WsMessage},
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ViewerSession {
    pub session_id: Uuid,
    pub connected_at: DateTime<Utc>,
    last_delivered_seq: AtomicU64,
    ordinal: u64,
    tx: mpsc::Sender<WsMessage>,
}

impl ViewerSession {
    pub fn last_delivered_seq(&self) -> u64 {
        self.last_delivered_seq.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Arc<ViewerSession>>,
    next_ordinal: AtomicU64,
    buffer: usize,
}

impl SessionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            sessions: DashMap::new(),
            next_ordinal: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    /// Creates the session and queues `initial` (a snapshot, or the replayed
    /// updates) ahead of anything broadcast later. `sequence` is the relay
    /// sequence `initial` brings the viewer up to.
    ///
    /// Callers must hold the relay's state lock so no update can slip in
    /// between the snapshot and registration.
    pub fn register(
        &self,
        session_id: Uuid,
        sequence: u64,
        initial: Vec<WsMessage>,
    ) -> mpsc::Receiver<WsMessage> {
        let (tx, rx) = mpsc::channel(self.buffer + initial.len());
        for message in initial {
            // Capacity covers the initial batch.
            let _ = tx.try_send(message);
        }

        let session = Arc::new(ViewerSession {
            session_id,
            connected_at: Utc::now(),
            last_delivered_seq: AtomicU64::new(sequence),
            ordinal: self.next_ordinal.fetch_add(1, Ordering::SeqCst),
            tx,
        });
        self.sessions.insert(session_id, session);
        metrics::viewer_sessions(self.sessions.len());
        debug!(%session_id, sequence, "Viewer session registered");
        rx
    }

    pub fn unregister(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.remove(&session_id).is_some();
        if removed {
            metrics::viewer_sessions(self.sessions.len());
        }
        removed
    }

    pub fn get(&self, session_id: Uuid) -> Option<Arc<ViewerSession>> {
        self.sessions.get(&session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Delivers `state_update` to every session, in registration order.
    /// Sessions already at or past `sequence` are skipped.
    pub fn broadcast(&self, sequence: u64, delta: &StateDelta) {
        let message = WsMessage::StateUpdate {
            sequence,
            delta: delta.clone(),
        };
        for session in self.ordered() {
            if session.last_delivered_seq() >= sequence {
                continue;
            }
            if self.deliver(&session, message.clone()) {
                session.last_delivered_seq.fetch_max(sequence, Ordering::SeqCst);
            }
        }
    }

    /// Unsequenced event for every session (transport status).
    pub fn notify_all(&self, message: WsMessage) {
        for session in self.ordered() {
            self.deliver(&session, message.clone());
        }
    }

    /// Returns false when the session is gone; the message is dropped.
    pub fn notify(&self, session_id: Uuid, message: WsMessage) -> bool {
        match self.get(session_id) {
            Some(session) => self.deliver(&session, message),
            None => false,
        }
    }

    fn ordered(&self) -> Vec<Arc<ViewerSession>> {
        let mut sessions: Vec<Arc<ViewerSession>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        sessions.sort_by_key(|s| s.ordinal);
        sessions
    }

    fn deliver(&self, session: &ViewerSession, message: WsMessage) -> bool {
        match session.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(session_id = %session.session_id, "Viewer lagging, disconnecting");
                metrics::viewer_lagged();
                self.unregister(session.session_id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(session.session_id);
                false
            }
        }
    }
}
