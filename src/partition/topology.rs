//! Partition topology synthesis.
//!
//! Derives the partition-to-replica-set mapping from the bootstrap node
//! set with a sliding window over the id-sorted nodes. The assignment is
//! a pure function of `(bootstrap, num_partitions, partition_size)`:
//! every node derives the identical topology without coordination, and
//! with `num_partitions == |bootstrap|` every node hosts exactly
//! `partition_size` partitions.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::cluster::node::Node;
use crate::constants::DEFAULT_PARTITION_SIZE_CAP;
use crate::error::{ConclaveError, Result};
use crate::types::{NodeId, PartitionId};

/// A partition's identity and replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMetadata {
    id: PartitionId,
    members: BTreeSet<NodeId>,
}

impl PartitionMetadata {
    /// Create partition metadata from an id and replica set.
    pub fn new(id: PartitionId, members: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            id,
            members: members.into_iter().collect(),
        }
    }

    /// The partition id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The replica set, in id order.
    pub fn members(&self) -> &BTreeSet<NodeId> {
        &self.members
    }

    /// Replication factor of this partition.
    pub fn size(&self) -> usize {
        self.members.len()
    }
}

/// Derive the partition topology from the bootstrap set.
///
/// Defaults: `num_partitions == 0` becomes `|bootstrap|`;
/// `partition_size == 0` becomes `min(|bootstrap|, 3)`. The window
/// assignment places partition `i + 1` on the sorted nodes at positions
/// `(i + j) mod num_partitions` for `j` in `[0, partition_size)`.
pub fn plan_partitions(
    bootstrap: &[Node],
    num_partitions: usize,
    partition_size: usize,
) -> Result<Vec<PartitionMetadata>> {
    let cluster_size = bootstrap.len();
    if cluster_size == 0 {
        return Err(ConclaveError::ConfigurationInvalid(
            "cannot derive partitions from an empty bootstrap set".into(),
        ));
    }

    let num_partitions = if num_partitions == 0 {
        cluster_size
    } else {
        num_partitions
    };
    let partition_size = if partition_size == 0 {
        cluster_size.min(DEFAULT_PARTITION_SIZE_CAP)
    } else {
        partition_size
    };

    if partition_size > cluster_size {
        return Err(ConclaveError::ConfigurationInvalid(format!(
            "partition size {} exceeds cluster size {}",
            partition_size, cluster_size
        )));
    }
    if num_partitions > cluster_size {
        // The window indexes the sorted node list modulo the partition
        // count; more partitions than nodes would address nodes that do
        // not exist.
        return Err(ConclaveError::ConfigurationInvalid(format!(
            "partition count {} exceeds cluster size {}",
            num_partitions, cluster_size
        )));
    }

    let mut sorted: Vec<&Node> = bootstrap.iter().collect();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));

    let mut partitions = Vec::with_capacity(num_partitions);
    for i in 0..num_partitions {
        let members: BTreeSet<NodeId> = (0..partition_size)
            .map(|j| sorted[(i + j) % num_partitions].id().clone())
            .collect();
        partitions.push(PartitionMetadata {
            id: PartitionId::new(i as u32 + 1),
            members,
        });
    }
    Ok(partitions)
}

/// Validate an explicitly supplied topology against the bootstrap set.
///
/// Requires one entry per partition id in `[1, N]`, non-empty replica
/// sets no larger than the cluster, and members drawn from the
/// bootstrap set.
pub fn validate_partitions(
    bootstrap: &[Node],
    partitions: &[PartitionMetadata],
) -> Result<()> {
    if partitions.is_empty() {
        return Err(ConclaveError::ConfigurationInvalid(
            "explicit topology must not be empty".into(),
        ));
    }

    let known: BTreeSet<&NodeId> = bootstrap.iter().map(|n| n.id()).collect();
    let mut seen = BTreeSet::new();
    for partition in partitions {
        let id = partition.id().value();
        if id == 0 || id as usize > partitions.len() {
            return Err(ConclaveError::ConfigurationInvalid(format!(
                "partition id {} outside the dense range [1, {}]",
                id,
                partitions.len()
            )));
        }
        if !seen.insert(id) {
            return Err(ConclaveError::ConfigurationInvalid(format!(
                "duplicate partition id {}",
                id
            )));
        }
        if partition.members().is_empty() {
            return Err(ConclaveError::ConfigurationInvalid(format!(
                "partition {} has an empty replica set",
                id
            )));
        }
        if partition.size() > bootstrap.len() {
            return Err(ConclaveError::ConfigurationInvalid(format!(
                "partition {} replica set exceeds cluster size",
                id
            )));
        }
        for member in partition.members() {
            if !known.contains(member) {
                return Err(ConclaveError::ConfigurationInvalid(format!(
                    "partition {} references unknown node {}",
                    id, member
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| Node::core(*id, Endpoint::new("127.0.0.1", 1000 + i as u16)))
            .collect()
    }

    fn member_ids(partition: &PartitionMetadata) -> Vec<&str> {
        partition.members().iter().map(NodeId::as_str).collect()
    }

    #[test]
    fn defaults_derive_from_bootstrap_size() {
        let bootstrap = nodes(&["n1", "n2", "n3"]);
        let topology = plan_partitions(&bootstrap, 0, 0).unwrap();

        assert_eq!(topology.len(), 3);
        for partition in &topology {
            assert_eq!(partition.size(), 3);
            assert_eq!(member_ids(partition), vec!["n1", "n2", "n3"]);
        }
    }

    #[test]
    fn sliding_window_over_five_nodes() {
        let bootstrap = nodes(&["n1", "n2", "n3", "n4", "n5"]);
        let topology = plan_partitions(&bootstrap, 5, 3).unwrap();

        assert_eq!(topology.len(), 5);
        assert_eq!(member_ids(&topology[0]), vec!["n1", "n2", "n3"]);
        assert_eq!(member_ids(&topology[1]), vec!["n2", "n3", "n4"]);
        assert_eq!(member_ids(&topology[2]), vec!["n3", "n4", "n5"]);
        assert_eq!(member_ids(&topology[3]), vec!["n1", "n4", "n5"]);
        assert_eq!(member_ids(&topology[4]), vec!["n1", "n2", "n5"]);
    }

    #[test]
    fn every_node_hosts_exactly_r_partitions_when_n_equals_cluster_size() {
        let bootstrap = nodes(&["a", "b", "c", "d", "e", "f", "g"]);
        let replication = 3;
        let topology = plan_partitions(&bootstrap, 0, replication).unwrap();

        for node in &bootstrap {
            let hosted = topology
                .iter()
                .filter(|p| p.members().contains(node.id()))
                .count();
            assert_eq!(hosted, replication, "node {} load is unbalanced", node.id());
        }
    }

    #[test]
    fn topology_is_independent_of_input_order() {
        let forward = nodes(&["n1", "n2", "n3", "n4"]);
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = plan_partitions(&forward, 4, 2).unwrap();
        let b = plan_partitions(&reversed, 4, 2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn replication_equal_to_cluster_size_is_degenerate_but_legal() {
        let bootstrap = nodes(&["n1", "n2", "n3"]);
        let topology = plan_partitions(&bootstrap, 3, 3).unwrap();
        for partition in &topology {
            assert_eq!(member_ids(partition), vec!["n1", "n2", "n3"]);
        }
    }

    #[test]
    fn oversized_replication_factor_is_rejected() {
        let bootstrap = nodes(&["n1", "n2", "n3"]);
        assert!(matches!(
            plan_partitions(&bootstrap, 3, 4),
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn empty_bootstrap_is_rejected() {
        assert!(matches!(
            plan_partitions(&[], 0, 0),
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn more_partitions_than_nodes_is_rejected() {
        let bootstrap = nodes(&["n1", "n2"]);
        assert!(matches!(
            plan_partitions(&bootstrap, 5, 1),
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn fewer_partitions_than_nodes_uses_the_sorted_prefix() {
        let bootstrap = nodes(&["n1", "n2", "n3", "n4"]);
        let topology = plan_partitions(&bootstrap, 2, 2).unwrap();
        assert_eq!(topology.len(), 2);
        assert_eq!(member_ids(&topology[0]), vec!["n1", "n2"]);
        assert_eq!(member_ids(&topology[1]), vec!["n1", "n2"]);
    }

    #[test]
    fn explicit_topology_validation_accepts_well_formed() {
        let bootstrap = nodes(&["n1", "n2", "n3"]);
        let partitions = vec![
            PartitionMetadata::new(PartitionId::new(1), [NodeId::from("n1"), NodeId::from("n2")]),
            PartitionMetadata::new(PartitionId::new(2), [NodeId::from("n2"), NodeId::from("n3")]),
        ];
        assert!(validate_partitions(&bootstrap, &partitions).is_ok());
    }

    #[test]
    fn explicit_topology_rejects_unknown_members() {
        let bootstrap = nodes(&["n1", "n2"]);
        let partitions = vec![PartitionMetadata::new(
            PartitionId::new(1),
            [NodeId::from("ghost")],
        )];
        assert!(matches!(
            validate_partitions(&bootstrap, &partitions),
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn explicit_topology_rejects_sparse_ids() {
        let bootstrap = nodes(&["n1", "n2"]);
        let partitions = vec![
            PartitionMetadata::new(PartitionId::new(1), [NodeId::from("n1")]),
            PartitionMetadata::new(PartitionId::new(3), [NodeId::from("n2")]),
        ];
        assert!(matches!(
            validate_partitions(&bootstrap, &partitions),
            Err(ConclaveError::ConfigurationInvalid(_))
        ));
    }

    #[test]
    fn explicit_topology_rejects_duplicates_and_empty_sets() {
        let bootstrap = nodes(&["n1", "n2"]);
        let duplicated = vec![
            PartitionMetadata::new(PartitionId::new(1), [NodeId::from("n1")]),
            PartitionMetadata::new(PartitionId::new(1), [NodeId::from("n2")]),
        ];
        assert!(validate_partitions(&bootstrap, &duplicated).is_err());

        let empty = vec![PartitionMetadata::new(PartitionId::new(1), [])];
        assert!(validate_partitions(&bootstrap, &empty).is_err());
    }
}
