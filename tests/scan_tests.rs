mod test_harness;

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use autod::config::{Role, ScanConfig};
use autod::discovery::{ScanPhase, Scanner};
use autod::error::AutodError;
use autod::registry::{Registry, Source};
use test_harness::{assert_eventually, tarpit, tarpit_on, test_config, TestNode};

/// A scanner over 127.0.0.1/32 on `port`, outside of any node.
fn loopback_scanner(port: u16, health_timeout: Duration) -> (Arc<Scanner>, Registry) {
    let mut config = test_config("coord", Role::Coordinator);
    config.scan = ScanConfig {
        ranges: vec!["127.0.0.1/32".parse().unwrap()],
        include_local_subnets: false,
        include_arp_cache: false,
        probe_port: port,
        health_timeout,
        ..config.scan
    };
    let registry = Registry::new();
    let scanner = Scanner::new(Arc::new(config), registry.clone()).unwrap();
    (Arc::new(scanner), registry)
}

#[tokio::test]
async fn test_scan_discovers_local_worker() {
    let mut worker_config = test_config("w1", Role::Worker).with_slot("a");
    worker_config.device = Some("cam-1".to_string());
    worker_config.caps = vec!["exec".to_string()];
    let worker = TestNode::start(worker_config).await;

    let (scanner, registry) = loopback_scanner(worker.addr.port(), Duration::from_millis(500));
    let summary = scanner.scan_once(&CancellationToken::new()).await.unwrap();

    assert_eq!(summary.targets, 1);
    assert_eq!(summary.found, 1);

    let node = registry.get("w1").await.expect("worker should be registered");
    assert_eq!(node.source, Source::Probed);
    assert_eq!(node.role, Role::Worker);
    assert_eq!(node.address, worker.addr.to_string());
    assert!(node.slots.contains("a"));
    assert_eq!(node.device.as_deref(), Some("cam-1"));
    assert_eq!(node.caps, vec!["exec".to_string()]);

    // self record is always present
    let me = registry.get("coord").await.expect("self record");
    assert_eq!(me.source, Source::SelfNode);

    let status = scanner.status();
    assert_eq!(status.phase, ScanPhase::Idle);
    assert_eq!(status.targets_done, status.targets_total);
    assert_eq!(status.progress_pct, 100);
}

#[tokio::test]
async fn test_scan_accepts_legacy_health_body() {
    let app = Router::new()
        .route("/health", get(|| async { Json(json!({"status": "ok"})) }))
        .route(
            "/caps",
            get(|| async {
                Json(json!({
                    "device": "radio",
                    "role": "slave",
                    "version": "1.2",
                    "caps": ["uart"],
                    "port": 8080
                }))
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (scanner, registry) = loopback_scanner(addr.port(), Duration::from_millis(500));
    let summary = scanner.scan_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.found, 1);

    let node = registry
        .get(&addr.to_string())
        .await
        .expect("node keyed by address");
    assert_eq!(node.role, Role::Worker);
    assert_eq!(node.device.as_deref(), Some("radio"));
    assert_eq!(node.version.as_deref(), Some("1.2"));

    server.abort();
}

#[tokio::test]
async fn test_scan_ignores_non_fleet_targets() {
    let (tarpit_addr, tarpit_handle) = tarpit().await;
    let (scanner, registry) = loopback_scanner(tarpit_addr.port(), Duration::from_millis(100));

    let summary = scanner.scan_once(&CancellationToken::new()).await.unwrap();
    assert_eq!(summary.targets, 1);
    assert_eq!(summary.found, 0);
    assert!(registry
        .list()
        .await
        .iter()
        .all(|n| n.source == Source::SelfNode));

    tarpit_handle.abort();
}

#[tokio::test]
async fn test_concurrent_scans_are_exclusive() {
    let (tarpit_addr, tarpit_handle) = tarpit().await;
    let (scanner, _registry) = loopback_scanner(tarpit_addr.port(), Duration::from_millis(400));
    let shutdown = CancellationToken::new();

    let (first, second) = tokio::join!(scanner.scan_once(&shutdown), scanner.scan_once(&shutdown));
    let results = [first, second];
    let ran = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(AutodError::ScanAlreadyRunning)))
        .count();
    assert_eq!(ran, 1);
    assert_eq!(rejected, 1);

    let status = scanner.status();
    assert_eq!(status.targets_done, status.targets_total);

    tarpit_handle.abort();
}

#[tokio::test]
async fn test_background_start_rejects_second_start() {
    let (tarpit_addr, tarpit_handle) = tarpit().await;
    let (scanner, _registry) = loopback_scanner(tarpit_addr.port(), Duration::from_millis(400));
    let shutdown = CancellationToken::new();

    let started = scanner.start(shutdown.clone()).unwrap();
    assert!(started.is_running());
    assert!(matches!(
        scanner.start(shutdown.clone()),
        Err(AutodError::ScanAlreadyRunning)
    ));

    let running = scanner.status();
    assert!(running.targets_done <= running.targets_total);

    let s = scanner.clone();
    assert_eventually(
        || {
            let s = s.clone();
            async move { s.status().phase == ScanPhase::Idle }
        },
        Duration::from_secs(3),
        "scan should finish",
    )
    .await;

    let done = scanner.status();
    assert_eq!(done.targets_total, 1);
    assert_eq!(done.targets_done, 1);
    assert!(done.finished_at.is_some());

    // a new scan may start once the previous one is finished
    assert!(scanner.start(shutdown).is_ok());
    tarpit_handle.abort();
}

#[tokio::test]
async fn test_shutdown_cuts_scan_short() {
    let (tarpit_addr, tarpit_handle) = tarpit().await;
    let (scanner, _registry) = loopback_scanner(tarpit_addr.port(), Duration::from_secs(10));
    let shutdown = CancellationToken::new();

    let s = scanner.clone();
    let token = shutdown.clone();
    let scan = tokio::spawn(async move { s.scan_once(&token).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), scan)
        .await
        .expect("scan should stop promptly")
        .unwrap()
        .unwrap();
    assert_eq!(summary.found, 0);

    let status = scanner.status();
    assert_eq!(status.phase, ScanPhase::Idle);
    assert_eq!(status.targets_done, status.targets_total);

    tarpit_handle.abort();
}

#[tokio::test]
async fn test_each_target_counted_once_when_cut_short() {
    let (tarpit_addr, tarpit_handle) = tarpit_on("0.0.0.0:0").await;
    let mut config = test_config("coord", Role::Coordinator);
    config.scan.ranges = vec!["127.0.0.0/29".parse().unwrap()];
    config.scan.probe_port = tarpit_addr.port();
    config.scan.health_timeout = Duration::from_millis(300);
    config.scan.concurrency = 2;
    let scanner = Arc::new(Scanner::new(Arc::new(config), Registry::new()).unwrap());
    let shutdown = CancellationToken::new();

    let s = scanner.clone();
    let token = shutdown.clone();
    let scan = tokio::spawn(async move { s.scan_once(&token).await });

    let deadline = tokio::time::Instant::now() + Duration::from_millis(450);
    while tokio::time::Instant::now() < deadline {
        let status = scanner.status();
        assert!(
            status.targets_done <= status.targets_total,
            "done {} exceeds total {}",
            status.targets_done,
            status.targets_total
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();

    let summary = tokio::time::timeout(Duration::from_secs(2), scan)
        .await
        .expect("scan should stop promptly")
        .unwrap()
        .unwrap();
    // 127.0.0.1 ..= 127.0.0.6
    assert_eq!(summary.targets, 6);

    let status = scanner.status();
    assert_eq!(status.phase, ScanPhase::Idle);
    assert_eq!(status.targets_total, 6);
    assert_eq!(status.targets_done, 6);

    tarpit_handle.abort();
}

#[tokio::test]
async fn test_scan_control_over_http() {
    let (tarpit_addr, tarpit_handle) = tarpit().await;
    let mut config = test_config("coord", Role::Coordinator);
    config.scan.ranges = vec!["127.0.0.1/32".parse().unwrap()];
    config.scan.probe_port = tarpit_addr.port();
    config.scan.health_timeout = Duration::from_millis(400);
    let coordinator = TestNode::start(config).await;

    let first = coordinator.client.start_scan().await.unwrap();
    assert_eq!(first.rescan, "started");

    let second = coordinator.client.start_scan().await.unwrap();
    assert_eq!(second.rescan, "already_running");
    assert!(second.scan.is_running());

    let client = coordinator.client.clone();
    assert_eventually(
        || {
            let client = client.clone();
            async move {
                matches!(client.scan_status().await, Ok(s) if s.phase == ScanPhase::Idle && s.progress_pct == 100)
            }
        },
        Duration::from_secs(3),
        "scan should complete",
    )
    .await;

    let nodes = coordinator.client.nodes().await.unwrap();
    assert!(nodes.scan.is_some());
    assert!(nodes.nodes.iter().any(|n| n.id == "coord"));

    coordinator.stop().await;
    tarpit_handle.abort();
}
