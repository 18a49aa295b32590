//! Cluster services: node identity, membership, and messaging fabrics.
//!
//! Layering, bottom to top:
//!
//! ```text
//!   ClusterEventBus        cluster-wide topic publish/subscribe
//!        │
//!   ClusterCommunicator    typed request-reply between nodes
//!        │
//!   ClusterMembership      node set, liveness, local identity
//!        │
//!   MessagingService       point-to-point transport (trait seam)
//! ```

pub mod communication;
pub mod events;
pub mod membership;
pub mod node;

pub use communication::ClusterCommunicator;
pub use events::ClusterEventBus;
pub use membership::{
    ClusterMembership, Member, MembershipConfig, MembershipEvent, MembershipSnapshot, NodeState,
};
pub use node::{ClusterMetadata, Node, NodeRole};
