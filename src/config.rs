use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AutodError, Result};

/// Process role within the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "master")]
    #[value(alias = "master")]
    Coordinator,
    #[serde(alias = "slave")]
    #[value(alias = "slave")]
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

impl FromStr for Role {
    type Err = AutodError;

    /// Accepts the legacy `master`/`slave` names still reported by older firmware.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "coordinator" | "master" => Ok(Role::Coordinator),
            "worker" | "slave" => Ok(Role::Worker),
            other => Err(AutodError::Config(format!(
                "role must be 'coordinator' or 'worker', got '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the handler execution engine.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    /// Program invoked for every execution request; receives the target path as argv[1]
    pub handler: PathBuf,
    /// Deadline used when a request carries no timeout
    pub default_timeout: Duration,
    /// Upper bound for a timeout supplied by a request
    pub max_timeout: Duration,
    /// Cap applied separately to stdout and stderr
    pub max_output_bytes: usize,
    /// Time between SIGTERM and SIGKILL once the deadline has passed
    pub kill_grace: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            handler: PathBuf::from("/usr/bin/exec-handler.sh"),
            default_timeout: Duration::from_secs(5),
            max_timeout: Duration::from_secs(60),
            max_output_bytes: 64 * 1024,
            kill_grace: Duration::from_millis(200),
        }
    }
}

impl ExecConfig {
    /// Resolve the deadline for a request. Zero or missing falls back to the default.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        match requested {
            Some(t) if !t.is_zero() => t.min(self.max_timeout),
            _ => self.default_timeout,
        }
    }
}

/// Configuration for the active subnet scanner (coordinator only).
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Run a scan at startup and every `interval` afterwards
    pub enabled: bool,
    /// Explicit ranges to sweep in addition to local subnets
    pub ranges: Vec<Ipv4Network>,
    /// Sweep the subnets of every local non-loopback interface
    pub include_local_subnets: bool,
    /// Seed targets from the kernel ARP cache
    pub include_arp_cache: bool,
    /// Port the fleet's nodes listen on
    pub probe_port: u16,
    pub interval: Duration,
    pub health_timeout: Duration,
    pub caps_timeout: Duration,
    /// Number of targets probed in parallel
    pub concurrency: usize,
    /// Safety ceiling on planned targets per scan
    pub max_targets: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ranges: Vec::new(),
            include_local_subnets: true,
            include_arp_cache: true,
            probe_port: 8080,
            interval: Duration::from_secs(45),
            health_timeout: Duration::from_millis(150),
            caps_timeout: Duration::from_millis(400),
            concurrency: 16,
            max_targets: 1024,
        }
    }
}

/// Configuration for the periodic self-registration push (worker only).
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Base URL of the coordinator, e.g. `http://10.0.0.1:8080`
    pub coordinator_url: Option<String>,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            coordinator_url: None,
            interval: Duration::from_secs(15),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Limits for forwarding slot executions to workers.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub timeout: Duration,
    pub max_response_bytes: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_response_bytes: 2 << 20,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub role: Role,
    pub listen_addr: SocketAddr,
    /// host:port other nodes should use to reach this node
    pub advertise: Option<String>,
    pub slots: Vec<String>,
    pub device: Option<String>,
    pub version: String,
    pub caps: Vec<String>,
    /// Drop non-self nodes not seen for this long. `None` keeps them forever.
    pub node_ttl: Option<Duration>,
    /// Slot -> node id bound automatically when that node registers
    pub slot_preferences: BTreeMap<String, String>,
    pub exec: ExecConfig,
    pub scan: ScanConfig,
    pub registrar: RegistrarConfig,
    pub dispatch: DispatchConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: generate_node_id(),
            role: Role::Worker,
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
            advertise: None,
            slots: Vec::new(),
            device: None,
            version: env!("CARGO_PKG_VERSION").to_string(),
            caps: Vec::new(),
            node_ttl: None,
            slot_preferences: BTreeMap::new(),
            exec: ExecConfig::default(),
            scan: ScanConfig::default(),
            registrar: RegistrarConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>, role: Role, listen_addr: SocketAddr) -> Self {
        Self {
            node_id: node_id.into(),
            role,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slots.push(slot.into());
        self
    }

    pub fn with_coordinator(mut self, url: impl Into<String>) -> Self {
        self.registrar.coordinator_url = Some(url.into());
        self
    }

    /// Address advertised to peers. Falls back to the listen address, with an
    /// unspecified IP replaced by loopback.
    pub fn advertise_address(&self) -> String {
        if let Some(ref addr) = self.advertise {
            return addr.clone();
        }
        if self.listen_addr.ip().is_unspecified() {
            format!("127.0.0.1:{}", self.listen_addr.port())
        } else {
            self.listen_addr.to_string()
        }
    }

    /// Startup validation. Any error here is fatal.
    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() || self.node_id.chars().any(char::is_whitespace) {
            return Err(AutodError::Config(
                "node id must be non-empty and contain no whitespace".to_string(),
            ));
        }
        if self.exec.max_output_bytes == 0 {
            return Err(AutodError::Config(
                "max output bytes must be positive".to_string(),
            ));
        }
        if self.exec.default_timeout.is_zero() {
            return Err(AutodError::Config("exec timeout must be positive".to_string()));
        }
        if self.exec.max_timeout < self.exec.default_timeout {
            return Err(AutodError::Config(format!(
                "max exec timeout ({:?}) must not be below the default ({:?})",
                self.exec.max_timeout, self.exec.default_timeout
            )));
        }
        if self.scan.concurrency == 0 || self.scan.max_targets == 0 {
            return Err(AutodError::Config(
                "scan concurrency and max targets must be positive".to_string(),
            ));
        }
        if self.scan.interval.is_zero() || self.registrar.interval.is_zero() {
            return Err(AutodError::Config("intervals must be positive".to_string()));
        }
        if let Some(ttl) = self.node_ttl {
            if ttl <= self.registrar.interval {
                return Err(AutodError::Config(format!(
                    "node ttl ({:?}) must exceed the register interval ({:?})",
                    ttl, self.registrar.interval
                )));
            }
        }
        if let Some(ref url) = self.registrar.coordinator_url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(AutodError::Config(format!(
                    "coordinator url must start with http:// or https://, got '{}'",
                    url
                )));
            }
        }
        Ok(())
    }
}

/// `{hostname}-{8 hex chars}`, used when no node id is configured.
pub fn generate_node_id() -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "autod-node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", host, &suffix[..8])
}
