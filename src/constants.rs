//! Centralized configuration constants.
//!
//! This module consolidates the defaults used throughout the runtime.
//! Having them in one place makes it easier to:
//!
//! - Understand the timing relationships (keepalive vs session timeout)
//! - Update values consistently
//! - Document the rationale for each constant

use std::time::Duration;

// =============================================================================
// Cluster Constants
// =============================================================================

/// Default cluster name used when the builder is not given one.
pub const DEFAULT_CLUSTER_NAME: &str = "conclave";

/// Upper bound applied when deriving the replication factor from the
/// bootstrap set: `partition_size = min(|bootstrap|, 3)`.
///
/// Three replicas tolerate one failure per partition while keeping the
/// quorum round-trip fan-out small.
pub const DEFAULT_PARTITION_SIZE_CAP: usize = 3;

// =============================================================================
// Session Constants
// =============================================================================

/// Default server-side session timeout.
///
/// A session whose keepalives stop arriving for this long may be declared
/// expired by the partition. Expiration on the server side is authoritative.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);

/// Divisor applied to the session timeout to derive the keepalive interval.
///
/// Keepalives must be emitted at an interval no larger than half the session
/// timeout so a single lost keepalive does not expire the session.
pub const KEEPALIVE_DIVISOR: u32 = 2;

/// Default lower bound for per-operation deadlines.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Default upper bound for per-operation deadlines.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Proxy Constants
// =============================================================================

/// Default retry count for the retrying proxy layer. Zero disables it.
pub const DEFAULT_MAX_RETRIES: u32 = 0;

/// Default fixed delay between proxy retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Membership Constants
// =============================================================================

/// How often each node announces itself to its peers.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Missed heartbeats before a peer is suspected.
pub const DEFAULT_SUSPICION_THRESHOLD: u32 = 2;

/// Missed heartbeats before a peer is declared dead.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

// =============================================================================
// Routing Constants
// =============================================================================

/// Seed of the name-routing hash.
///
/// The hash must be identical on every node and across process restarts
/// so a primitive name always resolves to the same partition; never
/// change this value on a live cluster.
pub const ROUTING_HASH_SEED: u64 = 0x636f_7465;

// =============================================================================
// Transport Constants
// =============================================================================

/// Reply-wait budget for request/reply exchanges on the loopback transport.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Name of the exclusive lock file created in each partition data directory.
pub const PARTITION_LOCK_FILE: &str = ".lock";
