//! Topology derivation through the public builder surface.

use std::collections::BTreeSet;

use conclave::error::ConclaveError;
use conclave::partition::topology::{PartitionMetadata, plan_partitions};
use conclave::prelude::*;

fn node(id: &str, port: u16) -> Node {
    Node::core(id, Endpoint::new("127.0.0.1", port))
}

fn members(runtime: &Conclave, id: u32) -> BTreeSet<String> {
    runtime
        .partitions()
        .partition(PartitionId::new(id))
        .unwrap()
        .metadata()
        .members()
        .iter()
        .map(|n| n.as_str().to_string())
        .collect()
}

#[test]
fn three_node_defaults_produce_the_rotated_window() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Conclave::builder()
        .with_local_node(node("n1", 1111))
        .with_bootstrap_nodes([node("n1", 1111), node("n2", 2222), node("n3", 3333)])
        .with_data_dir(dir.path())
        .build()
        .unwrap();

    // Defaults: N = 3, R = min(3, 3) = 3; every window wraps the full
    // set, so all three partitions share the same replica set.
    assert_eq!(runtime.partitions().len(), 3);
    let expected: BTreeSet<String> = ["n1", "n2", "n3"].iter().map(|s| s.to_string()).collect();
    for id in 1..=3 {
        assert_eq!(members(&runtime, id), expected);
    }
}

#[test]
fn topology_is_identical_on_every_node() {
    let nodes = [node("n2", 2222), node("n3", 3333), node("n1", 1111)];
    let hub = LoopbackHub::new();

    let mut per_node: Vec<Vec<(u32, BTreeSet<String>)>> = Vec::new();
    for local in &nodes {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Conclave::builder()
            .with_local_node(local.clone())
            .with_bootstrap_nodes(nodes.clone())
            .with_transport_hub(hub.clone())
            .with_data_dir(dir.path())
            .build()
            .unwrap();
        per_node.push(
            runtime
                .partitions()
                .partitions()
                .iter()
                .map(|p| {
                    (
                        p.id().value(),
                        p.metadata()
                            .members()
                            .iter()
                            .map(|n| n.as_str().to_string())
                            .collect(),
                    )
                })
                .collect(),
        );
    }

    assert_eq!(per_node[0], per_node[1]);
    assert_eq!(per_node[1], per_node[2]);
}

#[test]
fn five_nodes_with_replication_three_slide_the_window() {
    let bootstrap: Vec<Node> = (1..=5).map(|i| node(&format!("n{}", i), 1000 + i)).collect();
    let topology = plan_partitions(&bootstrap, 5, 3).unwrap();

    let sets: Vec<BTreeSet<&str>> = topology
        .iter()
        .map(|p| p.members().iter().map(|n| n.as_str()).collect())
        .collect();
    assert_eq!(sets[0], BTreeSet::from(["n1", "n2", "n3"]));
    assert_eq!(sets[1], BTreeSet::from(["n2", "n3", "n4"]));
    assert_eq!(sets[2], BTreeSet::from(["n3", "n4", "n5"]));
    assert_eq!(sets[3], BTreeSet::from(["n4", "n5", "n1"]));
    assert_eq!(sets[4], BTreeSet::from(["n5", "n1", "n2"]));
}

#[test]
fn each_node_hosts_replication_factor_partitions() {
    let bootstrap: Vec<Node> = (1..=5).map(|i| node(&format!("n{}", i), 1000 + i)).collect();
    let topology = plan_partitions(&bootstrap, 0, 3).unwrap();

    for bootstrap_node in &bootstrap {
        let hosted = topology
            .iter()
            .filter(|p| p.members().contains(bootstrap_node.id()))
            .count();
        assert_eq!(hosted, 3);
    }
}

#[test]
fn replication_beyond_cluster_size_fails_at_build() {
    let dir = tempfile::tempdir().unwrap();
    let result = Conclave::builder()
        .with_local_node(node("n1", 1111))
        .with_bootstrap_nodes([node("n1", 1111), node("n2", 2222), node("n3", 3333)])
        .with_partition_size(4)
        .with_data_dir(dir.path())
        .build();
    assert!(matches!(
        result,
        Err(ConclaveError::ConfigurationInvalid(_))
    ));
}

#[test]
fn explicit_topology_overrides_derivation() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Conclave::builder()
        .with_local_node(node("n1", 1111))
        .with_bootstrap_nodes([node("n1", 1111), node("n2", 2222), node("n3", 3333)])
        .with_partitions([
            PartitionMetadata::new(PartitionId::new(1), [NodeId::from("n1")]),
            PartitionMetadata::new(
                PartitionId::new(2),
                [NodeId::from("n2"), NodeId::from("n3")],
            ),
        ])
        .with_data_dir(dir.path())
        .build()
        .unwrap();

    assert_eq!(runtime.partitions().len(), 2);
    assert_eq!(members(&runtime, 1), BTreeSet::from(["n1".to_string()]));
}

#[test]
fn explicit_topology_with_unknown_node_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let result = Conclave::builder()
        .with_local_node(node("n1", 1111))
        .with_bootstrap_nodes([node("n1", 1111)])
        .with_partitions([PartitionMetadata::new(
            PartitionId::new(1),
            [NodeId::from("stranger")],
        )])
        .with_data_dir(dir.path())
        .build();
    assert!(matches!(
        result,
        Err(ConclaveError::ConfigurationInvalid(_))
    ));
}
