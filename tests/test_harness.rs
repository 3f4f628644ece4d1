//! Test harness for node integration tests.
//!
//! Spawns nodes on ephemeral loopback ports and provides polling helpers.
#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use autod::client::AutodClient;
use autod::config::{NodeConfig, Role};
use autod::discovery::Scanner;
use autod::node::Node;
use autod::registry::Registry;

/// Node config for tests: loopback, ephemeral port, `/usr/bin/env` as the
/// handler, and no scanning of real networks.
pub fn test_config(node_id: &str, role: Role) -> NodeConfig {
    let mut config = NodeConfig::new(node_id, role, "127.0.0.1:0".parse().unwrap());
    config.exec.handler = PathBuf::from("/usr/bin/env");
    config.exec.default_timeout = Duration::from_secs(5);
    config.scan.include_local_subnets = false;
    config.scan.include_arp_cache = false;
    config.scan.health_timeout = Duration::from_millis(300);
    config.scan.caps_timeout = Duration::from_millis(500);
    config.registrar.interval = Duration::from_millis(100);
    config.registrar.timeout = Duration::from_secs(1);
    config.dispatch.timeout = Duration::from_secs(5);
    config
}

/// Handle to a running test node
pub struct TestNode {
    pub node_id: String,
    pub addr: SocketAddr,
    pub registry: Registry,
    pub scanner: Option<Arc<Scanner>>,
    pub client: AutodClient,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl TestNode {
    pub async fn start(config: NodeConfig) -> Self {
        let node = Node::bind(config).await.expect("node should bind");
        let addr = node.local_addr();
        let node_id = node.config.node_id.clone();
        let registry = node.registry.clone();
        let scanner = node.scanner.clone();
        let client = AutodClient::new(format!("http://{}", addr), Duration::from_secs(10))
            .expect("client should build");

        let shutdown = CancellationToken::new();
        let run_token = shutdown.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = node.run(run_token).await {
                eprintln!("test node exited with error: {}", e);
            }
        });

        Self {
            node_id,
            addr,
            registry,
            scanner,
            client,
            shutdown,
            handle: Some(handle),
        }
    }

    pub async fn worker(node_id: &str) -> Self {
        Self::start(test_config(node_id, Role::Worker)).await
    }

    pub async fn coordinator(node_id: &str) -> Self {
        Self::start(test_config(node_id, Role::Coordinator)).await
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Cancel the node and wait for it to finish.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a condition to become true with timeout
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(25)).await;
    assert!(result, "{}", message);
}

/// True while `pid` exists and is not a zombie.
pub fn process_alive(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => match stat.rsplit_once(')') {
            Some((_, rest)) => !matches!(rest.trim_start().chars().next(), Some('Z') | Some('X')),
            None => false,
        },
        Err(_) => false,
    }
}

/// A listener that accepts connections and never answers, so probes against
/// it run until their timeout.
pub async fn tarpit() -> (SocketAddr, JoinHandle<()>) {
    tarpit_on("127.0.0.1:0").await
}

/// [`tarpit`] bound to `bind`; `0.0.0.0:0` catches every loopback address.
pub async fn tarpit_on(bind: &str) -> (SocketAddr, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind(bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (addr, handle)
}
