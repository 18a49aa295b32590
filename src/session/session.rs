//! A client session bound to one partition and one primitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{ConclaveError, Result};
use crate::metrics;
use crate::partition::RaftPartition;
use crate::session::manager::SessionManager;
use crate::session::participant::{Operation, ParticipantEvent, RaftParticipant};
use crate::types::{PartitionId, ReadConsistency, SessionId};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The session is being established.
    Opening,
    /// The session is live.
    Open,
    /// The leader has been unreachable for longer than the session
    /// timeout; the session may return to `Open` on rediscovery.
    Suspended,
    /// The partition declared the session expired. Terminal.
    Expired,
    /// The session was closed by the client.
    Closed,
}

impl SessionState {
    fn gauge_label(self) -> &'static str {
        match self {
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Suspended => "suspended",
            SessionState::Expired => "expired",
            SessionState::Closed => "closed",
        }
    }
}

/// A live client session on a partition.
pub struct RaftSession {
    id: SessionId,
    partition: Arc<RaftPartition>,
    primitive: String,
    primitive_type: String,
    consistency: ReadConsistency,
    state: RwLock<SessionState>,
    state_events: broadcast::Sender<SessionState>,
    sequence: AtomicU64,
    last_contact: Mutex<Instant>,
    manager: Weak<SessionManager>,
}

impl RaftSession {
    pub(crate) fn new(
        id: SessionId,
        partition: Arc<RaftPartition>,
        primitive: String,
        primitive_type: String,
        consistency: ReadConsistency,
        manager: Weak<SessionManager>,
    ) -> Arc<Self> {
        let (state_events, _) = broadcast::channel(16);
        metrics::SESSION_STATES
            .with_label_values(&[SessionState::Open.gauge_label()])
            .inc();
        Arc::new(Self {
            id,
            partition,
            primitive,
            primitive_type,
            consistency,
            state: RwLock::new(SessionState::Open),
            state_events,
            sequence: AtomicU64::new(0),
            last_contact: Mutex::new(Instant::now()),
            manager,
        })
    }

    /// The session id assigned by the partition leader.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// The partition this session is bound to.
    pub fn partition_id(&self) -> PartitionId {
        self.partition.id()
    }

    /// The primitive this session is bound to.
    pub fn primitive(&self) -> &str {
        &self.primitive
    }

    /// The primitive's type id.
    pub fn primitive_type(&self) -> &str {
        &self.primitive_type
    }

    /// The session's read consistency level.
    pub fn consistency(&self) -> ReadConsistency {
        self.consistency
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.read().expect("session state poisoned")
    }

    /// Subscribe to lifecycle state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<SessionState> {
        self.state_events.subscribe()
    }

    /// Subscribe to events from the partition's participant, when a
    /// local replica exists.
    pub fn subscribe_events(&self) -> Option<broadcast::Receiver<ParticipantEvent>> {
        self.partition.replica().map(|r| r.subscribe_events())
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let mut state = self.state.write().expect("session state poisoned");
        if *state == next {
            return;
        }
        // Expiry is terminal.
        if *state == SessionState::Expired {
            return;
        }
        metrics::SESSION_STATES
            .with_label_values(&[state.gauge_label()])
            .dec();
        metrics::SESSION_STATES
            .with_label_values(&[next.gauge_label()])
            .inc();
        debug!(session = %self.id, from = ?*state, to = ?next, "Session state changed");
        *state = next;
        drop(state);
        let _ = self.state_events.send(next);
    }

    pub(crate) fn mark_contact(&self) {
        *self.last_contact.lock().expect("contact clock poisoned") = Instant::now();
    }

    pub(crate) fn since_contact(&self) -> std::time::Duration {
        self.last_contact
            .lock()
            .expect("contact clock poisoned")
            .elapsed()
    }

    fn manager(&self) -> Result<Arc<SessionManager>> {
        self.manager.upgrade().ok_or(ConclaveError::NotOpen)
    }

    fn check_usable(&self) -> Result<()> {
        match self.state() {
            SessionState::Expired => Err(ConclaveError::SessionExpired { session: self.id }),
            SessionState::Closed => Err(ConclaveError::NotOpen),
            // A suspended session rejects operations until a keepalive
            // rediscovers the leader and moves it back to open.
            SessionState::Suspended => {
                Err(ConclaveError::SessionSuspended { session: self.id })
            }
            _ => Ok(()),
        }
    }

    /// Submit a sequenced command on this session.
    ///
    /// Commands carry a per-session sequence number; the partition
    /// applies them in issue order.
    pub async fn submit(&self, op: &str, input: Value) -> Result<Value> {
        self.check_usable()?;
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let operation = Operation::command(
            self.primitive.clone(),
            self.primitive_type.clone(),
            op,
            input,
        );
        self.manager()?
            .invoke_command(self, sequence, operation)
            .await
    }

    /// Execute a query at the session's consistency level.
    pub async fn query(&self, op: &str, input: Value) -> Result<Value> {
        self.check_usable()?;
        let operation = Operation::query(
            self.primitive.clone(),
            self.primitive_type.clone(),
            op,
            input,
        );
        self.manager()?.invoke_query(self, operation).await
    }

    /// Close this session gracefully.
    pub async fn close(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Ok(());
        }
        self.manager()?.close_session(self).await
    }
}
