//! Partition service: owns the replica groups and their lifecycle.
//!
//! Each partition handle carries its replica set, its data directory
//! under `<data_dir>/partitions/<id>/`, and an embedded participant when
//! the local node belongs to the replica set (a pure client view
//! otherwise). Partitions open in parallel; a single failure rolls the
//! whole bring-up back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cluster::communication::ClusterCommunicator;
use crate::constants::PARTITION_LOCK_FILE;
use crate::error::{ConclaveError, Result};
use crate::lifecycle::Managed;
use crate::partition::topology::PartitionMetadata;
use crate::primitives::registry::PrimitiveTypeRegistry;
use crate::session::forward::{register_replica_handlers, unregister_replica_handlers};
use crate::session::local::LocalParticipant;
use crate::types::{NodeId, PartitionId};

/// One partition: replica set, data directory, and participant.
pub struct RaftPartition {
    metadata: PartitionMetadata,
    data_dir: PathBuf,
    replica: Option<Arc<LocalParticipant>>,
    communicator: Arc<ClusterCommunicator>,
    open: AtomicBool,
}

impl RaftPartition {
    /// Create the handle for one partition.
    ///
    /// A participant is embedded only when `local` belongs to the
    /// replica set.
    pub fn new(
        metadata: PartitionMetadata,
        data_root: &Path,
        local: &NodeId,
        registry: Arc<PrimitiveTypeRegistry>,
        communicator: Arc<ClusterCommunicator>,
    ) -> Arc<Self> {
        let data_dir = data_root
            .join("partitions")
            .join(metadata.id().to_string());
        let replica = metadata.members().contains(local).then(|| {
            LocalParticipant::new(
                metadata.id(),
                local.clone(),
                metadata.members().clone(),
                registry,
            )
        });
        Arc::new(Self {
            metadata,
            data_dir,
            replica,
            communicator,
            open: AtomicBool::new(false),
        })
    }

    /// The partition id.
    pub fn id(&self) -> PartitionId {
        self.metadata.id()
    }

    /// The partition's replica set.
    pub fn metadata(&self) -> &PartitionMetadata {
        &self.metadata
    }

    /// The partition's data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// The embedded participant, when the local node is a replica.
    pub fn replica(&self) -> Option<&Arc<LocalParticipant>> {
        self.replica.as_ref()
    }

    fn lock_path(&self) -> PathBuf {
        self.data_dir.join(PARTITION_LOCK_FILE)
    }

    /// Open the partition: prepare and lock the data directory, expose
    /// the replica on the fabric, and join or bootstrap the group.
    pub async fn open(&self) -> Result<()> {
        if let Some(replica) = &self.replica {
            tokio::fs::create_dir_all(&self.data_dir).await?;

            // Exclusive ownership of the data directory for the
            // partition's lifetime.
            std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(self.lock_path())
                .map_err(|e| {
                    if e.kind() == std::io::ErrorKind::AlreadyExists {
                        ConclaveError::ConfigurationInvalid(format!(
                            "partition {} data directory {} is locked by another process",
                            self.id(),
                            self.data_dir.display()
                        ))
                    } else {
                        ConclaveError::Io(e)
                    }
                })?;

            register_replica_handlers(&self.communicator, replica);
            if let Err(e) = replica.open().await {
                unregister_replica_handlers(&self.communicator, self.id());
                let _ = std::fs::remove_file(self.lock_path());
                return Err(e);
            }
        }
        self.open.store(true, Ordering::SeqCst);
        debug!(partition = %self.id(), local = self.replica.is_some(), "Partition opened");
        Ok(())
    }

    /// Close the partition. The data-directory lock is released even if
    /// the participant fails to stop cleanly.
    pub async fn close(&self) -> Result<()> {
        let mut result = Ok(());
        if let Some(replica) = &self.replica {
            unregister_replica_handlers(&self.communicator, self.id());
            result = replica.close().await;
            if let Err(e) = std::fs::remove_file(self.lock_path()) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(partition = %self.id(), error = %e, "Failed to remove lock file");
                }
            }
        }
        self.open.store(false, Ordering::SeqCst);
        result
    }

    /// Whether the partition is open.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// The set of partitions owned by this runtime.
pub struct PartitionService {
    partitions: BTreeMap<PartitionId, Arc<RaftPartition>>,
    open: AtomicBool,
}

impl PartitionService {
    /// Create the service over a set of partition handles.
    pub fn new(partitions: Vec<Arc<RaftPartition>>) -> Arc<Self> {
        Arc::new(Self {
            partitions: partitions.into_iter().map(|p| (p.id(), p)).collect(),
            open: AtomicBool::new(false),
        })
    }

    /// Look up a partition handle.
    pub fn partition(&self, id: PartitionId) -> Option<Arc<RaftPartition>> {
        self.partitions.get(&id).cloned()
    }

    /// All partitions, ordered by id.
    pub fn partitions(&self) -> Vec<Arc<RaftPartition>> {
        self.partitions.values().cloned().collect()
    }

    /// Number of partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    /// Whether the service owns no partitions.
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[async_trait]
impl Managed for PartitionService {
    fn name(&self) -> &'static str {
        "partitions"
    }

    async fn open(&self) -> Result<()> {
        let mut joins = JoinSet::new();
        for partition in self.partitions.values() {
            let partition = partition.clone();
            joins.spawn(async move {
                let id = partition.id();
                (id, partition.open().await)
            });
        }

        let mut first_error = None;
        while let Some(joined) = joins.join_next().await {
            match joined {
                Ok((id, Ok(()))) => {
                    debug!(partition = %id, "Partition open complete");
                }
                Ok((id, Err(e))) => {
                    warn!(partition = %id, error = %e, "Partition failed to open");
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error.get_or_insert(ConclaveError::Application(format!(
                        "partition open task failed: {}",
                        join_error
                    )));
                }
            }
        }

        if let Some(error) = first_error {
            // Roll back whatever opened before surfacing the failure.
            for partition in self.partitions.values() {
                if partition.is_open() {
                    if let Err(e) = partition.close().await {
                        warn!(partition = %partition.id(), error = %e, "Rollback close failed");
                    }
                }
            }
            return Err(error);
        }

        self.open.store(true, Ordering::SeqCst);
        info!(partitions = self.partitions.len(), "Partition service opened");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        for partition in self.partitions.values().rev() {
            if let Err(e) = partition.close().await {
                warn!(partition = %partition.id(), error = %e, "Partition close failed");
            }
        }
        self.open.store(false, Ordering::SeqCst);
        info!("Partition service closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::membership::{ClusterMembership, MembershipConfig};
    use crate::cluster::node::{ClusterMetadata, Node};
    use crate::partition::topology::plan_partitions;
    use crate::transport::{Endpoint, LoopbackHub};
    use std::time::Duration;

    async fn single_node_fixture(
        data_root: &Path,
    ) -> (Arc<PartitionService>, Arc<ClusterCommunicator>) {
        let hub = LoopbackHub::new();
        let local = Node::core("n1", Endpoint::new("127.0.0.1", 1111));
        let transport = hub.transport(local.endpoint().clone());
        transport.open().await.unwrap();
        let metadata = ClusterMetadata::new(local.clone(), [local.clone()]).unwrap();
        let membership = ClusterMembership::new(
            metadata,
            transport.clone(),
            MembershipConfig {
                heartbeat_interval: Duration::from_secs(60),
                ..Default::default()
            },
        );
        membership.open().await.unwrap();
        let communicator = ClusterCommunicator::new(membership, transport);
        communicator.open().await.unwrap();

        let topology = plan_partitions(&[local.clone()], 0, 0).unwrap();
        let registry = PrimitiveTypeRegistry::with_builtins();
        let partitions = topology
            .into_iter()
            .map(|p| {
                RaftPartition::new(
                    p,
                    data_root,
                    &NodeId::from("n1"),
                    registry.clone(),
                    communicator.clone(),
                )
            })
            .collect();
        (PartitionService::new(partitions), communicator)
    }

    #[tokio::test]
    async fn open_creates_and_locks_data_directories() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _fabric) = single_node_fixture(dir.path()).await;

        service.open().await.unwrap();
        let partition = service.partition(PartitionId::new(1)).unwrap();
        assert!(partition.data_dir().is_dir());
        assert!(partition.data_dir().join(PARTITION_LOCK_FILE).exists());

        service.close().await.unwrap();
        assert!(!partition.data_dir().join(PARTITION_LOCK_FILE).exists());
    }

    #[tokio::test]
    async fn double_open_of_same_data_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (first, _fabric_a) = single_node_fixture(dir.path()).await;
        let (second, _fabric_b) = single_node_fixture(dir.path()).await;

        first.open().await.unwrap();
        let result = second.open().await;
        assert!(matches!(
            result,
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
        first.close().await.unwrap();

        // Once the lock is released the second service can open.
        second.open().await.unwrap();
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn partitions_are_ordered_by_id() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _fabric) = single_node_fixture(dir.path()).await;
        let ids: Vec<u32> = service.partitions().iter().map(|p| p.id().value()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _fabric) = single_node_fixture(dir.path()).await;
        service.open().await.unwrap();
        service.close().await.unwrap();
        service.close().await.unwrap();
        assert!(!service.is_open());
    }

    #[tokio::test]
    async fn remote_partition_has_no_local_replica() {
        let dir = tempfile::tempdir().unwrap();
        let hub = LoopbackHub::new();
        let local = Node::core("observer", Endpoint::new("127.0.0.1", 9999));
        let transport = hub.transport(local.endpoint().clone());
        transport.open().await.unwrap();
        let remote = Node::core("n1", Endpoint::new("127.0.0.1", 1111));
        let metadata = ClusterMetadata::new(local.clone(), [remote.clone()]).unwrap();
        let membership = ClusterMembership::new(
            metadata,
            transport.clone(),
            MembershipConfig::default(),
        );
        membership.open().await.unwrap();
        let communicator = ClusterCommunicator::new(membership, transport);
        communicator.open().await.unwrap();

        let topology = plan_partitions(&[remote], 0, 0).unwrap();
        let partition = RaftPartition::new(
            topology.into_iter().next().unwrap(),
            dir.path(),
            &NodeId::from("observer"),
            PrimitiveTypeRegistry::with_builtins(),
            communicator,
        );
        assert!(partition.replica().is_none());

        // Opening a client-view partition touches no filesystem state.
        partition.open().await.unwrap();
        assert!(!partition.data_dir().exists());
        partition.close().await.unwrap();
    }
}
