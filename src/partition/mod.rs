//! Partition topology and the partition service.

pub mod service;
pub mod topology;

pub use service::{PartitionService, RaftPartition};
pub use topology::{PartitionMetadata, plan_partitions, validate_partitions};
