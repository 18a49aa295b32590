//! Sessions over partitioned replicated state machines.
//!
//! A session is a logical client-to-partition relationship carrying
//! per-session command order and event delivery. The manager multiplexes
//! sessions per client and partition, tracks suspected leaders, and
//! keeps sessions alive; the participant seam hides the consensus
//! implementation.

pub mod forward;
pub mod local;
pub mod manager;
pub mod participant;
#[allow(clippy::module_inception)]
pub mod session;

pub use forward::ForwardingParticipant;
pub use local::LocalParticipant;
pub use manager::{SessionConfig, SessionManager};
pub use participant::{
    CommandRequest, KeepAliveRequest, ListPrimitivesRequest, OpenSessionRequest, Operation,
    OperationKind, ParticipantEvent, QueryRequest, RaftParticipant, SessionReply,
};
pub use session::{RaftSession, SessionState};
