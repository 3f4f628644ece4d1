mod test_harness;

use std::time::Duration;

use autod::config::Role;
use autod::discovery::RegisterRequest;
use autod::registry::Source;
use test_harness::{assert_eventually, test_config, TestNode};

#[tokio::test]
async fn test_node_seeds_self_record() {
    let worker = TestNode::worker("w1").await;

    let nodes = worker.client.nodes().await.unwrap();
    let me = nodes.nodes.iter().find(|n| n.id == "w1").unwrap();
    assert_eq!(me.source, Source::SelfNode);
    assert_eq!(me.address, worker.addr.to_string());
    assert!(nodes.scan.is_none());

    let caps = worker.client.caps().await.unwrap();
    assert_eq!(caps.port, worker.addr.port());

    worker.stop().await;
}

#[tokio::test]
async fn test_stale_nodes_are_evicted_with_ttl() {
    let mut config = test_config("coord", Role::Coordinator);
    config.node_ttl = Some(Duration::from_secs(1));
    let coordinator = TestNode::start(config).await;

    coordinator
        .client
        .register(&RegisterRequest {
            id: "w1".to_string(),
            address: "10.0.0.2:8080".to_string(),
            slots: vec![],
            role: None,
        })
        .await
        .unwrap();
    assert!(coordinator.registry.get("w1").await.is_some());

    let registry = coordinator.registry.clone();
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.get("w1").await.is_none() }
        },
        Duration::from_secs(4),
        "stale node should be evicted",
    )
    .await;
    assert!(coordinator.registry.get("coord").await.is_some());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_nodes_are_kept_without_ttl() {
    let coordinator = TestNode::coordinator("coord").await;
    coordinator
        .client
        .register(&RegisterRequest {
            id: "w1".to_string(),
            address: "10.0.0.2:8080".to_string(),
            slots: vec![],
            role: Some(Role::Worker),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(coordinator.registry.get("w1").await.is_some());

    coordinator.stop().await;
}

#[tokio::test]
async fn test_shutdown_stops_server() {
    let worker = TestNode::worker("w1").await;
    let client = worker.client.clone();
    assert!(client.health().await.is_ok());

    tokio::time::timeout(Duration::from_secs(5), worker.stop())
        .await
        .expect("node should stop");
    assert!(client.health().await.is_err());
}

#[tokio::test]
async fn test_client_encodes_slot_names() {
    let coordinator = TestNode::coordinator("coord").await;
    coordinator
        .client
        .register(&RegisterRequest {
            id: "w1".to_string(),
            address: "10.0.0.2:8080".to_string(),
            slots: vec![],
            role: None,
        })
        .await
        .unwrap();

    let slot = "cam 1/left";
    let bound = coordinator.client.bind_slot(slot, "w1").await.unwrap();
    assert_eq!(bound.slot, slot);

    let slots = coordinator.client.slots().await.unwrap();
    assert_eq!(slots.slots.get(slot).map(String::as_str), Some("w1"));

    let unbound = coordinator.client.unbind_slot(slot).await.unwrap();
    assert!(unbound.removed);
    assert!(coordinator.registry.resolve_slot(slot).await.is_none());

    coordinator.stop().await;
}
