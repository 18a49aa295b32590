//! Type-safe identifiers used across the runtime.
//!
//! These newtypes prevent mixing up values that share an underlying
//! representation but carry different semantic meanings, such as a
//! partition number and a session number.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a cluster node.
///
/// Node ids are opaque strings with a total order; the topology builder
/// sorts bootstrap nodes by id so every node derives the identical
/// partition layout without coordination.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// View the id as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a partition (replica group).
///
/// Partition ids are dense 1-based integers in `[1, N]` where `N` is the
/// partition count fixed at build time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionId(pub u32);

impl PartitionId {
    /// Create a new partition id from a raw value.
    #[inline]
    pub const fn new(value: u32) -> Self {
        PartitionId(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a client session on a partition.
///
/// Session ids are assigned by the partition and increase monotonically
/// over its lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Create a new session id from a raw value.
    #[inline]
    pub const fn new(value: u64) -> Self {
        SessionId(value)
    }

    /// Get the raw value.
    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read consistency level honored by queries on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ReadConsistency {
    /// Follower reads are permitted; only session order is observed.
    Sequential,
    /// Leader-local reads while its lease is valid.
    LinearizableLease,
    /// Leader round-trip with quorum confirmation.
    #[default]
    Linearizable,
}

impl fmt::Display for ReadConsistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadConsistency::Sequential => write!(f, "sequential"),
            ReadConsistency::LinearizableLease => write!(f, "linearizable-lease"),
            ReadConsistency::Linearizable => write!(f, "linearizable"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_orders_lexicographically() {
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        assert!(a < b);

        let mut ids = vec![NodeId::from("n3"), NodeId::from("n1"), NodeId::from("n2")];
        ids.sort();
        assert_eq!(
            ids,
            vec![NodeId::from("n1"), NodeId::from("n2"), NodeId::from("n3")]
        );
    }

    #[test]
    fn node_id_display_roundtrip() {
        let id = NodeId::new("node-7");
        assert_eq!(id.to_string(), "node-7");
        assert_eq!(id.as_str(), "node-7");
    }

    #[test]
    fn partition_id_value_access() {
        let id = PartitionId::new(3);
        assert_eq!(id.value(), 3);
        assert_eq!(id.to_string(), "3");
        assert_eq!(PartitionId::from(3), id);
    }

    #[test]
    fn session_id_ordering() {
        assert!(SessionId::new(1) < SessionId::new(2));
    }

    #[test]
    fn read_consistency_default_is_linearizable() {
        assert_eq!(ReadConsistency::default(), ReadConsistency::Linearizable);
    }

    #[test]
    fn identifiers_serialize_as_json() {
        let id = NodeId::new("n1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"n1\"");
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
