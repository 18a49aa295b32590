//! End-to-end runtime scenarios: single node and in-process clusters.

use std::time::Duration;

use conclave::error::ConclaveError;
use conclave::prelude::*;
use serde_json::json;

fn node(id: &str, port: u16) -> Node {
    Node::core(id, Endpoint::new("127.0.0.1", port))
}

async fn open_single_node(dir: &std::path::Path) -> Conclave {
    let local = node("n1", 1111);
    let runtime = Conclave::builder()
        .with_local_node(local.clone())
        .with_bootstrap_nodes([local])
        .with_data_dir(dir)
        .build()
        .unwrap();
    runtime.open().await.unwrap();
    runtime
}

#[tokio::test]
async fn counter_operations_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_single_node(dir.path()).await;

    let counter = runtime
        .primitives()
        .primitive("requests", "counter")
        .await
        .unwrap()
        .into_counter()
        .unwrap();

    assert_eq!(counter.get().await.unwrap(), 0);
    assert_eq!(counter.increment().await.unwrap(), 1);
    assert_eq!(counter.add(10).await.unwrap(), 11);
    counter.set(-5).await.unwrap();
    assert_eq!(counter.get().await.unwrap(), -5);

    runtime.close().await.unwrap();
}

#[tokio::test]
async fn map_operations_and_events() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_single_node(dir.path()).await;

    let map = runtime
        .primitives()
        .primitive("settings", "map")
        .await
        .unwrap()
        .into_map()
        .unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    map.on_event(std::sync::Arc::new(move |event| {
        let _ = tx.send(event.payload);
    }));

    assert_eq!(map.put("theme", json!("dark")).await.unwrap(), None);
    assert_eq!(
        map.put("theme", json!("light")).await.unwrap(),
        Some(json!("dark"))
    );
    assert_eq!(map.get("theme").await.unwrap(), Some(json!("light")));
    assert_eq!(map.size().await.unwrap(), 1);
    assert_eq!(
        map.remove("theme").await.unwrap(),
        Some(json!("light"))
    );

    // put, put, remove: three events, in order.
    for expected in ["updated", "updated", "removed"] {
        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within deadline")
            .unwrap();
        assert_eq!(payload["event"], json!(expected));
        assert_eq!(payload["key"], json!("theme"));
    }

    runtime.close().await.unwrap();
}

#[tokio::test]
async fn listing_returns_created_primitives() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_single_node(dir.path()).await;

    for name in ["alpha", "beta", "gamma"] {
        runtime
            .primitives()
            .primitive(name, "counter")
            .await
            .unwrap();
    }
    runtime.primitives().primitive("other", "map").await.unwrap();

    let counters = runtime.primitives().list("counter").await.unwrap();
    assert_eq!(
        counters,
        ["alpha", "beta", "gamma"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    );

    let maps = runtime.primitives().list("map").await.unwrap();
    assert_eq!(maps, ["other".to_string()].into_iter().collect());

    runtime.close().await.unwrap();
}

#[tokio::test]
async fn unknown_primitive_type_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = open_single_node(dir.path()).await;

    let result = runtime.primitives().primitive("x", "barrier").await;
    assert!(matches!(
        result,
        Err(ConclaveError::ConfigurationInvalid(_))
    ));
    runtime.close().await.unwrap();
}

struct ClusterFixture {
    runtimes: Vec<Conclave>,
    _dirs: Vec<tempfile::TempDir>,
}

async fn open_three_node_cluster() -> ClusterFixture {
    let nodes = [node("n1", 1111), node("n2", 2222), node("n3", 3333)];
    let hub = LoopbackHub::new();

    let mut runtimes = Vec::new();
    let mut dirs = Vec::new();
    for local in &nodes {
        let dir = tempfile::tempdir().unwrap();
        let runtime = Conclave::builder()
            .with_cluster_name("test-cluster")
            .with_local_node(local.clone())
            .with_bootstrap_nodes(nodes.clone())
            .with_transport_hub(hub.clone())
            .with_data_dir(dir.path())
            .build()
            .unwrap();
        runtime.open().await.unwrap();
        runtimes.push(runtime);
        dirs.push(dir);
    }
    ClusterFixture {
        runtimes,
        _dirs: dirs,
    }
}

#[tokio::test]
async fn cluster_nodes_agree_on_primitive_routing() {
    let fixture = open_three_node_cluster().await;

    let ids: Vec<PartitionId> = fixture
        .runtimes
        .iter()
        .map(|r| r.primitives().partition_of("shared-counter"))
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);

    for runtime in &fixture.runtimes {
        runtime.close().await.unwrap();
    }
}

#[tokio::test]
async fn increments_from_different_nodes_observe_one_state() {
    let fixture = open_three_node_cluster().await;

    // Every node binds the same name, hence the same partition and the
    // same replicated counter.
    let mut expected = 0i64;
    for runtime in &fixture.runtimes {
        let counter = runtime
            .primitives()
            .primitive("shared-counter", "counter")
            .await
            .unwrap()
            .into_counter()
            .unwrap();
        expected += 1;
        assert_eq!(counter.increment().await.unwrap(), expected);
    }

    for runtime in &fixture.runtimes {
        runtime.close().await.unwrap();
    }
}

#[tokio::test]
async fn listing_is_cluster_wide() {
    let fixture = open_three_node_cluster().await;

    fixture.runtimes[0]
        .primitives()
        .primitive("from-n1", "counter")
        .await
        .unwrap();
    fixture.runtimes[1]
        .primitives()
        .primitive("from-n2", "counter")
        .await
        .unwrap();

    let names = fixture.runtimes[2]
        .primitives()
        .list("counter")
        .await
        .unwrap();
    assert!(names.contains("from-n1"));
    assert!(names.contains("from-n2"));

    for runtime in &fixture.runtimes {
        runtime.close().await.unwrap();
    }
}
