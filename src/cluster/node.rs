//! Cluster node identity and bootstrap metadata.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConclaveError, Result};
use crate::transport::Endpoint;
use crate::types::NodeId;

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeRole {
    /// Participates in partition replica sets.
    #[default]
    Core,
    /// Connects to the cluster without hosting partitions.
    Client,
}

/// A cluster node: identity, endpoint, and role.
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    endpoint: Endpoint,
    role: NodeRole,
}

impl Node {
    /// Create a core node.
    pub fn core(id: impl Into<NodeId>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            role: NodeRole::Core,
        }
    }

    /// Create a client node.
    pub fn client(id: impl Into<NodeId>, endpoint: Endpoint) -> Self {
        Self {
            id: id.into(),
            endpoint,
            role: NodeRole::Client,
        }
    }

    /// The node's identifier.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The node's transport endpoint.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The node's role.
    pub fn role(&self) -> NodeRole {
        self.role
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.endpoint)
    }
}

/// The local node plus the bootstrap node set, fixed at build time.
#[derive(Debug, Clone)]
pub struct ClusterMetadata {
    local: Node,
    bootstrap: BTreeMap<NodeId, Node>,
}

impl ClusterMetadata {
    /// Create cluster metadata from the local node and the bootstrap set.
    ///
    /// The bootstrap set must be non-empty; duplicate ids collapse to the
    /// last entry.
    pub fn new(local: Node, bootstrap: impl IntoIterator<Item = Node>) -> Result<Self> {
        let bootstrap: BTreeMap<NodeId, Node> = bootstrap
            .into_iter()
            .map(|node| (node.id().clone(), node))
            .collect();
        if bootstrap.is_empty() {
            return Err(ConclaveError::ConfigurationInvalid(
                "bootstrap node set must not be empty".into(),
            ));
        }
        Ok(Self { local, bootstrap })
    }

    /// The local node.
    pub fn local(&self) -> &Node {
        &self.local
    }

    /// Bootstrap nodes in id order.
    pub fn bootstrap(&self) -> impl Iterator<Item = &Node> {
        self.bootstrap.values()
    }

    /// Number of bootstrap nodes.
    pub fn bootstrap_len(&self) -> usize {
        self.bootstrap.len()
    }

    /// Look up a bootstrap node by id.
    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.bootstrap.get(id)
    }

    /// Whether the local node is part of the bootstrap set.
    pub fn local_is_bootstrap(&self) -> bool {
        self.bootstrap.contains_key(self.local.id())
    }
}
