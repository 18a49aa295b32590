//! The replicated-state-machine participant seam.
//!
//! The session layer consumes consensus through [`RaftParticipant`]: a
//! per-partition interface for opening sessions, keeping them alive, and
//! submitting sequenced commands and consistency-levelled queries. The
//! consensus algorithm itself lives behind this trait; the crate ships
//! an embedded in-process participant ([`super::local::LocalParticipant`])
//! and a fabric-forwarding client view
//! ([`super::forward::ForwardingParticipant`]).

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::types::{NodeId, PartitionId, ReadConsistency, SessionId};

/// Whether an operation mutates state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    /// Mutating operation, sequenced per session.
    Command,
    /// Read-only operation, honoring a read consistency level.
    Query,
}

/// An operation routed to a primitive's state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Primitive name.
    pub primitive: String,
    /// Primitive type id.
    pub primitive_type: String,
    /// Operation name within the primitive's vocabulary.
    pub name: String,
    /// Operation input.
    pub input: Value,
    /// Command or query.
    pub kind: OperationKind,
}

impl Operation {
    /// Create a mutating command.
    pub fn command(
        primitive: impl Into<String>,
        primitive_type: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            primitive: primitive.into(),
            primitive_type: primitive_type.into(),
            name: name.into(),
            input,
            kind: OperationKind::Command,
        }
    }

    /// Create a read-only query.
    pub fn query(
        primitive: impl Into<String>,
        primitive_type: impl Into<String>,
        name: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            primitive: primitive.into(),
            primitive_type: primitive_type.into(),
            name: name.into(),
            input,
            kind: OperationKind::Query,
        }
    }
}

/// Request to open a session bound to one primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub client_id: String,
    pub primitive: String,
    pub primitive_type: String,
    pub timeout: Duration,
}

/// Session keepalive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub session: SessionId,
}

/// Graceful session close.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionRequest {
    pub session: SessionId,
}

/// A sequenced command on a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub session: SessionId,
    /// Monotonically increasing per session; the participant holds a
    /// command until every lower sequence from the session has applied.
    pub sequence: u64,
    pub operation: Operation,
}

/// A query on a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub session: SessionId,
    pub consistency: ReadConsistency,
    pub operation: Operation,
}

/// Request for the names of primitives of one type on a partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListPrimitivesRequest {
    pub type_id: String,
}

/// Protocol-level outcome of a participant call.
///
/// Transport failures surface as errors; everything the protocol itself
/// can say is data, so callers react without string matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SessionReply {
    /// Successful output.
    Output(Value),
    /// The addressed replica is not the leader; retarget using the hint.
    NotLeader { hint: Option<NodeId> },
    /// The session has been declared expired. Terminal.
    Expired { session: SessionId },
    /// The state machine rejected the operation.
    Failure { message: String },
}

/// Event pushed from a participant to its local subscribers.
#[derive(Debug, Clone)]
pub enum ParticipantEvent {
    /// A state machine published an event on a primitive.
    Primitive { primitive: String, payload: Value },
    /// A session was declared expired by the participant.
    SessionExpired { session: SessionId },
}

/// Per-partition replicated-state-machine access.
#[async_trait]
pub trait RaftParticipant: Send + Sync {
    /// The partition this participant belongs to.
    fn partition_id(&self) -> PartitionId;

    /// The node this participant view addresses.
    fn node(&self) -> &NodeId;

    /// Open a session bound to a primitive. Only the leader assigns
    /// session ids; the reply's output is the numeric session id.
    async fn open_session(&self, request: OpenSessionRequest) -> Result<SessionReply>;

    /// Refresh a session's server-side liveness.
    async fn keep_alive(&self, request: KeepAliveRequest) -> Result<SessionReply>;

    /// Close a session gracefully.
    async fn close_session(&self, request: CloseSessionRequest) -> Result<SessionReply>;

    /// Submit a sequenced command.
    async fn submit(&self, request: CommandRequest) -> Result<SessionReply>;

    /// Execute a query at the requested consistency level.
    async fn query(&self, request: QueryRequest) -> Result<SessionReply>;

    /// List primitive names of a type hosted by this partition.
    async fn primitive_names(&self, request: ListPrimitivesRequest) -> Result<SessionReply>;

    /// Subscribe to primitive and session events from this participant.
    fn subscribe_events(&self) -> broadcast::Receiver<ParticipantEvent>;
}
