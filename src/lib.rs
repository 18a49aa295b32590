//! # Conclave
//! Distributed coordination runtime for Rust.
//!
//! Conclave is a process-local composition root that wires together a
//! cluster membership service, point-to-point messaging, cluster-wide
//! request-reply and publish/subscribe fabrics, a partitioned
//! replicated-state-machine layer, and a factory for distributed
//! primitives (counters, maps) built on top.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Primitive Service                          │
//! │        build(name, type) routed by hash(name) mod N + 1         │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Proxy Stack                              │
//! │   Session → Recovering? → Retrying? → BlockingAware → Delegating│
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Session Manager                            │
//! │   leader tracking │ keepalives │ per-session command ordering   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Partition Service                           │
//! │       replica groups │ data directories │ participants          │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              Cluster Fabrics and Membership                     │
//! │      events │ request-reply │ liveness │ transport seam         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Getting started
//!
//! ```rust,no_run
//! use conclave::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> conclave::error::Result<()> {
//!     let local = Node::core("n1", Endpoint::new("127.0.0.1", 5001));
//!     let runtime = Conclave::builder()
//!         .with_local_node(local.clone())
//!         .with_bootstrap_nodes([local])
//!         .with_data_dir("/var/lib/conclave")
//!         .build()?;
//!
//!     runtime.open().await?;
//!
//!     let counter = runtime
//!         .primitives()
//!         .primitive("requests", "counter")
//!         .await?
//!         .into_counter()
//!         .expect("counter primitive");
//!     counter.increment().await?;
//!
//!     runtime.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! Lifecycle transitions are serialized on a single-threaded
//! orchestration context; everything else (transport dispatch, replica
//! participants, keepalive loops) runs on parallel tokio tasks.

#![forbid(unsafe_code)]

pub mod cluster;
pub mod conclave;
pub mod constants;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod partition;
pub mod primitives;
pub mod proxy;
pub mod rest;
pub mod session;
pub mod tasks;
pub mod telemetry;
pub mod transport;
pub mod types;

pub use crate::conclave::{Conclave, ConclaveBuilder};

pub mod prelude {
    //! Main exports for building and using a runtime.
    pub use crate::cluster::node::{Node, NodeRole};
    pub use crate::conclave::{Conclave, ConclaveBuilder};
    pub use crate::error::{ConclaveError, Result};
    pub use crate::partition::topology::PartitionMetadata;
    pub use crate::primitives::service::{DistributedCounter, DistributedMap, Primitive};
    pub use crate::proxy::{ProxyOptions, RecoveryStrategy};
    pub use crate::transport::{Endpoint, LoopbackHub};
    pub use crate::types::{NodeId, PartitionId, ReadConsistency, SessionId};
}
