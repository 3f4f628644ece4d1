use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::api::{self, ApiState};
use crate::config::{NodeConfig, Role};
use crate::discovery::{Registrar, Scanner};
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::exec::Executor;
use crate::registry::{NodeRecord, Registry};

/// Main node that owns every component for its role
pub struct Node {
    pub config: Arc<NodeConfig>,
    pub registry: Registry,
    pub executor: Arc<Executor>,
    pub dispatcher: Arc<Dispatcher>,
    pub scanner: Option<Arc<Scanner>>,
    listener: TcpListener,
}

impl Node {
    /// Validate `config`, bind the API listener and build the components.
    ///
    /// Binding first means a `:0` listen port is resolved before anything
    /// advertises it.
    pub async fn bind(mut config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let listener = TcpListener::bind(config.listen_addr).await?;
        config.listen_addr = listener.local_addr()?;
        let config = Arc::new(config);

        let registry = Registry::new();
        let executor = Arc::new(Executor::new(config.exec.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            config.dispatch.clone(),
        )?);
        let scanner = match config.role {
            Role::Coordinator => Some(Arc::new(Scanner::new(
                Arc::clone(&config),
                registry.clone(),
            )?)),
            Role::Worker => None,
        };

        Ok(Self {
            config,
            registry,
            executor,
            dispatcher,
            scanner,
            listener,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.config.listen_addr
    }

    pub fn api_state(&self, shutdown: CancellationToken) -> ApiState {
        ApiState {
            config: Arc::clone(&self.config),
            registry: self.registry.clone(),
            executor: Arc::clone(&self.executor),
            dispatcher: Arc::clone(&self.dispatcher),
            scanner: self.scanner.clone(),
            shutdown,
        }
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Seeds the registry with this node's own record
    /// 2. Coordinator: spawns the periodic scanner when scanning is enabled
    /// 3. Worker: spawns the registrar when a coordinator url is configured
    /// 4. Spawns the staleness sweep when a node TTL is configured
    /// 5. Serves the API, then waits for the background tasks to stop
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!(
            node_id = %self.config.node_id,
            role = %self.config.role,
            addr = %self.config.listen_addr,
            advertise = %self.config.advertise_address(),
            "Starting node"
        );

        match self.scanner {
            Some(ref scanner) => scanner.seed_self().await,
            None => self.registry.upsert(NodeRecord::for_self(&self.config)).await,
        }

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        if let Some(ref scanner) = self.scanner {
            if self.config.scan.enabled {
                tasks.push(tokio::spawn(Arc::clone(scanner).run(shutdown.clone())));
            }
        }

        if self.config.role == Role::Worker && self.config.registrar.coordinator_url.is_some() {
            let registrar = Registrar::new(&self.config)?;
            tasks.push(tokio::spawn(registrar.run(shutdown.clone())));
        }

        if let Some(ttl) = self.config.node_ttl {
            let registry = self.registry.clone();
            tasks.push(tokio::spawn(eviction_loop(registry, ttl, shutdown.clone())));
        }

        let app = api::router(self.api_state(shutdown.clone()));
        let served = api::serve(self.listener, app, shutdown.clone()).await;
        if let Err(ref e) = served {
            tracing::error!(error = %e, "API server failed");
            shutdown.cancel();
        }

        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(node_id = %self.config.node_id, "Node stopped");
        served.map_err(Into::into)
    }
}

/// Periodically drop records not refreshed within `ttl`.
async fn eviction_loop(registry: Registry, ttl: Duration, shutdown: CancellationToken) {
    let period = (ttl / 2).max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = registry.evict_stale(ttl).await;
                if !evicted.is_empty() {
                    tracing::info!(count = evicted.len(), "Stale nodes evicted");
                }
            }
        }
    }
}
