//! Error types for the coordination runtime.
//!
//! # Error Handling Patterns
//!
//! Two patterns are used depending on operation criticality:
//!
//! ## Fail-Fast (Propagate Errors)
//!
//! Used where failure indicates a real problem the caller must see:
//! - Builder validation (`ConfigurationInvalid` surfaces at build time)
//! - Partition bring-up (failure rolls back already-opened partitions)
//! - Command submission on the write path
//!
//! ## Best-Effort (Log and Continue)
//!
//! Used where partial failure is acceptable:
//! - `close()` paths (teardown always resolves; errors are logged)
//! - Event fan-out to peers (a missing peer does not fail the publish)
//! - Background keepalive ticks (the session state machine absorbs them)
//!
//! # Adapter Classification
//!
//! Only *transient* kinds are transformed by the proxy adapters:
//! the retrying layer consumes [`is_transient`](ConclaveError::is_transient)
//! errors, the recovering layer consumes
//! [`is_session_fatal`](ConclaveError::is_session_fatal) errors.
//! Application errors pass through verbatim and are never retried.

use std::time::Duration;

use thiserror::Error;

use crate::types::{PartitionId, SessionId};

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Errors surfaced by the coordination runtime.
#[derive(Debug, Error)]
pub enum ConclaveError {
    /// The builder was given an inconsistent configuration.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),

    /// A user-facing operation was attempted while the runtime is closed.
    #[error("runtime is not open")]
    NotOpen,

    /// No replica of the partition could be reached.
    #[error("partition {partition} unavailable: {detail}")]
    Unavailable {
        partition: PartitionId,
        detail: String,
    },

    /// The partition leader is not currently known.
    #[error("leader unknown for partition {partition}")]
    LeaderUnknown { partition: PartitionId },

    /// An operation exceeded its deadline.
    #[error("operation timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The session lost contact with its partition leader.
    #[error("session {session} suspended")]
    SessionSuspended { session: SessionId },

    /// The partition declared the session expired. Terminal for the session.
    #[error("session {session} expired")]
    SessionExpired { session: SessionId },

    /// An in-flight operation was dropped during session recovery.
    ///
    /// The recovering proxy surfaces this instead of silently resubmitting;
    /// whether to retry is the caller's decision (usually delegated to the
    /// retrying layer above it).
    #[error("operation lost during session recovery")]
    OperationLost,

    /// An error raised by a primitive state machine. Never retried.
    #[error("application error: {0}")]
    Application(String),

    /// A transport-level failure (unreachable endpoint, no handler).
    #[error("transport error: {0}")]
    Transport(String),

    /// Serialization failure in a fabric envelope or operation payload.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Filesystem failure (data directories, lock files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConclaveError {
    /// Whether the retrying proxy layer may retry this error.
    ///
    /// Transient kinds are leadership churn (`Unavailable`,
    /// `LeaderUnknown`) and recovery fallout (`OperationLost`).
    /// `Timeout` is deliberately excluded: a deadline that has expired
    /// must surface to the caller.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ConclaveError::Unavailable { .. }
                | ConclaveError::LeaderUnknown { .. }
                | ConclaveError::OperationLost
        )
    }

    /// Whether the recovering proxy layer should replace the session.
    #[inline]
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ConclaveError::SessionExpired { .. })
    }

    /// Whether this error terminates the operation with no adapter able
    /// to transform it.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConclaveError::ConfigurationInvalid(_)
                | ConclaveError::NotOpen
                | ConclaveError::Timeout { .. }
                | ConclaveError::Application(_)
        )
    }

    /// Label used for metrics, one per kind.
    pub fn kind_label(&self) -> &'static str {
        match self {
            ConclaveError::ConfigurationInvalid(_) => "configuration_invalid",
            ConclaveError::NotOpen => "not_open",
            ConclaveError::Unavailable { .. } => "unavailable",
            ConclaveError::LeaderUnknown { .. } => "leader_unknown",
            ConclaveError::Timeout { .. } => "timeout",
            ConclaveError::SessionSuspended { .. } => "session_suspended",
            ConclaveError::SessionExpired { .. } => "session_expired",
            ConclaveError::OperationLost => "operation_lost",
            ConclaveError::Application(_) => "application",
            ConclaveError::Transport(_) => "transport",
            ConclaveError::Serde(_) => "serde",
            ConclaveError::Io(_) => "io",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> PartitionId {
        PartitionId::new(1)
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(ConclaveError::Unavailable {
            partition: partition(),
            detail: "no replica reachable".into()
        }
        .is_transient());
        assert!(ConclaveError::LeaderUnknown {
            partition: partition()
        }
        .is_transient());
        assert!(ConclaveError::OperationLost.is_transient());
    }

    #[test]
    fn timeout_is_not_retryable() {
        let err = ConclaveError::Timeout {
            elapsed: Duration::from_secs(1),
        };
        assert!(!err.is_transient());
        assert!(err.is_terminal());
    }

    #[test]
    fn application_errors_pass_through() {
        let err = ConclaveError::Application("lock already held".into());
        assert!(!err.is_transient());
        assert!(!err.is_session_fatal());
        assert!(err.is_terminal());
    }

    #[test]
    fn session_expiry_is_recoverable_not_retryable() {
        let err = ConclaveError::SessionExpired {
            session: SessionId::new(42),
        };
        assert!(err.is_session_fatal());
        assert!(!err.is_transient());
    }

    #[test]
    fn suspension_is_neither_transient_nor_fatal() {
        let err = ConclaveError::SessionSuspended {
            session: SessionId::new(7),
        };
        assert!(!err.is_transient());
        assert!(!err.is_session_fatal());
    }

    #[test]
    fn display_includes_context() {
        let err = ConclaveError::Unavailable {
            partition: PartitionId::new(3),
            detail: "all replicas refused".into(),
        };
        let display = err.to_string();
        assert!(display.contains("3"));
        assert!(display.contains("all replicas refused"));
    }

    #[test]
    fn kind_labels_are_snake_case() {
        let errors = [
            ConclaveError::NotOpen,
            ConclaveError::OperationLost,
            ConclaveError::Application("x".into()),
        ];
        for err in errors {
            let label = err.kind_label();
            assert!(!label.is_empty());
            assert!(label.chars().all(|c| c.is_ascii_lowercase() || c == '_'));
        }
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "locked");
        let err: ConclaveError = io.into();
        assert!(matches!(err, ConclaveError::Io(_)));
    }
}
