use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::discovery::probe::Prober;
use crate::discovery::targets::{local_interfaces, parse_arp_table, TargetSet};
use crate::error::{AutodError, Result};
use crate::registry::{NodeRecord, Registry, Source};

const ARP_TABLE: &str = "/proc/net/arp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Idle = 0,
    Counting = 1,
    Scanning = 2,
}

impl ScanPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ScanPhase::Counting,
            2 => ScanPhase::Scanning,
            _ => ScanPhase::Idle,
        }
    }
}

/// Point-in-time view of the scan state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStatus {
    pub phase: ScanPhase,
    pub targets_total: u64,
    pub targets_done: u64,
    pub progress_pct: u8,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ScanStatus {
    pub fn is_running(&self) -> bool {
        self.phase != ScanPhase::Idle
    }
}

/// Lock-free scan state shared between the scan task and status readers.
///
/// At most one scan holds a [`ScanGuard`] at a time.
#[derive(Debug, Default)]
pub struct ScanCoordinator {
    phase: AtomicU8,
    total: AtomicU64,
    done: AtomicU64,
    started_ms: AtomicI64,
    finished_ms: AtomicI64,
}

impl ScanCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move idle -> counting, or fail with `ScanAlreadyRunning`.
    pub fn try_begin(self: &Arc<Self>) -> Result<ScanGuard> {
        self.phase
            .compare_exchange(
                ScanPhase::Idle as u8,
                ScanPhase::Counting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| AutodError::ScanAlreadyRunning)?;

        self.total.store(0, Ordering::Release);
        self.done.store(0, Ordering::Release);
        self.started_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.finished_ms.store(0, Ordering::Release);

        Ok(ScanGuard {
            coordinator: Arc::clone(self),
        })
    }

    pub fn phase(&self) -> ScanPhase {
        ScanPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn status(&self) -> ScanStatus {
        let phase = self.phase();
        let total = self.total.load(Ordering::Acquire);
        let done = self.done.load(Ordering::Acquire);
        let started_at = millis_to_time(self.started_ms.load(Ordering::Acquire));
        let finished_at = millis_to_time(self.finished_ms.load(Ordering::Acquire));

        let progress_pct = if total > 0 {
            (done.min(total) * 100 / total) as u8
        } else if phase == ScanPhase::Idle && finished_at.is_some() {
            100
        } else {
            0
        };

        ScanStatus {
            phase,
            targets_total: total,
            targets_done: done,
            progress_pct,
            started_at,
            finished_at,
        }
    }
}

fn millis_to_time(ms: i64) -> Option<DateTime<Utc>> {
    if ms == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

/// Held for the lifetime of one scan. Dropping it returns the phase to idle.
#[derive(Debug)]
pub struct ScanGuard {
    coordinator: Arc<ScanCoordinator>,
}

impl ScanGuard {
    pub fn set_total(&self, total: usize) {
        self.coordinator
            .total
            .store(total as u64, Ordering::Release);
    }

    pub fn begin_scanning(&self) {
        self.coordinator
            .phase
            .store(ScanPhase::Scanning as u8, Ordering::Release);
    }

    pub fn target_done(&self) {
        self.coordinator.done.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        self.coordinator
            .finished_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.coordinator
            .phase
            .store(ScanPhase::Idle as u8, Ordering::Release);
    }
}

/// Result of a completed scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSummary {
    pub targets: usize,
    pub found: usize,
}

/// Active subnet scanner run by the coordinator.
pub struct Scanner {
    config: Arc<NodeConfig>,
    registry: Registry,
    prober: Prober,
    coordinator: Arc<ScanCoordinator>,
}

impl Scanner {
    pub fn new(config: Arc<NodeConfig>, registry: Registry) -> Result<Self> {
        let prober = Prober::new(config.scan.health_timeout, config.scan.caps_timeout)?;
        Ok(Self {
            config,
            registry,
            prober,
            coordinator: Arc::new(ScanCoordinator::new()),
        })
    }

    pub fn status(&self) -> ScanStatus {
        self.coordinator.status()
    }

    /// Upsert this node's own record plus an `id@ip` alias for every other
    /// local IPv4 address.
    pub async fn seed_self(&self) {
        let primary = NodeRecord::for_self(&self.config);
        let advertised_host = primary
            .address
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_default();
        let port = self.config.listen_addr.port();

        for iface in local_interfaces() {
            let ip = iface.addr.to_string();
            if ip == advertised_host {
                continue;
            }
            let mut alias = primary.clone();
            alias.id = format!("{}@{}", self.config.node_id, ip);
            alias.address = SocketAddrV4::new(iface.addr, port).to_string();
            self.registry.upsert(alias).await;
        }
        self.registry.upsert(primary).await;
    }

    /// Claim the scan slot and run the scan in the background.
    ///
    /// Rejection happens before this returns, so callers see
    /// `ScanAlreadyRunning` synchronously.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) -> Result<ScanStatus> {
        let guard = self.coordinator.try_begin()?;
        let scanner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scanner.scan_with(guard, &shutdown).await {
                tracing::warn!(error = %e, "Scan failed");
            }
        });
        Ok(self.status())
    }

    /// Run one scan to completion on the current task.
    pub async fn scan_once(&self, shutdown: &CancellationToken) -> Result<ScanSummary> {
        let guard = self.coordinator.try_begin()?;
        self.scan_with(guard, shutdown).await
    }

    async fn scan_with(&self, guard: ScanGuard, shutdown: &CancellationToken) -> Result<ScanSummary> {
        self.seed_self().await;

        let targets = self.plan_targets().await;
        guard.set_total(targets.len());
        guard.begin_scanning();
        tracing::info!(targets = targets.len(), "Scan started");

        let counter = AtomicUsize::new(0);
        let found = &counter;
        let guard = &guard;
        stream::iter(targets.iter().copied())
            .for_each_concurrent(self.config.scan.concurrency, |addr| async move {
                if !shutdown.is_cancelled() {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        probed = self.prober.probe(addr) => {
                            match probed {
                                Ok(node) => {
                                    tracing::debug!(node_id = %node.id, %addr, "Node answered probe");
                                    self.registry.upsert(node).await;
                                    found.fetch_add(1, Ordering::Relaxed);
                                }
                                Err(e) => tracing::debug!(%addr, error = %e, "Probe failed"),
                            }
                        }
                    }
                }
                guard.target_done();
            })
            .await;

        let summary = ScanSummary {
            targets: targets.len(),
            found: counter.load(Ordering::Relaxed),
        };
        tracing::info!(
            targets = summary.targets,
            found = summary.found,
            cancelled = shutdown.is_cancelled(),
            "Scan finished"
        );
        Ok(summary)
    }

    /// Candidate targets in priority order: known probed nodes, the ARP
    /// cache, configured ranges, then local subnets.
    pub async fn plan_targets(&self) -> Vec<SocketAddr> {
        let scan = &self.config.scan;
        let interfaces = local_interfaces();
        let mut set = TargetSet::new(
            scan.probe_port,
            scan.max_targets,
            interfaces.iter().map(|i| i.addr),
        );

        for node in self.registry.list().await {
            if node.source != Source::Probed {
                continue;
            }
            if let Ok(addr) = node.address.parse::<SocketAddrV4>() {
                set.push_addr(addr);
            }
        }

        if scan.include_arp_cache {
            match tokio::fs::read_to_string(ARP_TABLE).await {
                Ok(contents) => {
                    for ip in parse_arp_table(&contents) {
                        set.push_ip(ip);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "ARP cache unavailable"),
            }
        }

        for range in &scan.ranges {
            set.extend_range(*range);
        }

        if scan.include_local_subnets {
            for iface in &interfaces {
                let added = set.extend_range(iface.network);
                tracing::debug!(interface = %iface.name, network = %iface.network, added, "Subnet planned");
            }
        }

        set.into_targets()
    }

    /// Scan at startup and then every `scan.interval` until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.scan.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan_once(&shutdown).await {
                        Ok(_) => {}
                        Err(AutodError::ScanAlreadyRunning) => {
                            tracing::debug!("Periodic scan skipped, scan already running");
                        }
                        Err(e) => tracing::warn!(error = %e, "Periodic scan failed"),
                    }
                }
            }
        }
        tracing::info!("Scanner stopped");
    }
}
