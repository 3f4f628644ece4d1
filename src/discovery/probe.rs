use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Role;
use crate::error::Result;
use crate::registry::{NodeRecord, Source};

/// Body of `GET /health`. Older firmware answers with `{"status":"ok"}` only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub slots: Vec<String>,
}

/// Body of `GET /caps`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
    #[serde(default)]
    pub slots: Vec<String>,
}

/// Two-stage node probe: a cheap liveness check, then the metadata fetch.
#[derive(Debug, Clone)]
pub struct Prober {
    client: reqwest::Client,
    health_timeout: Duration,
    caps_timeout: Duration,
}

impl Prober {
    pub fn new(health_timeout: Duration, caps_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(health_timeout)
            .build()?;
        Ok(Self {
            client,
            health_timeout,
            caps_timeout,
        })
    }

    /// Probe one address. Any failure means the target is not a fleet node.
    pub async fn probe(&self, addr: SocketAddr) -> Result<NodeRecord> {
        let health: HealthResponse = self
            .client
            .get(format!("http://{}/health", addr))
            .timeout(self.health_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .unwrap_or_default();

        let caps: CapsResponse = self
            .client
            .get(format!("http://{}/caps", addr))
            .timeout(self.caps_timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(node_from_probe(addr, health, caps))
    }
}

/// Build a probed record. The id falls back from `/health` to `/caps` to the
/// address itself.
pub fn node_from_probe(addr: SocketAddr, health: HealthResponse, caps: CapsResponse) -> NodeRecord {
    let id = health
        .id
        .filter(|id| !id.is_empty())
        .or(caps.id.filter(|id| !id.is_empty()))
        .unwrap_or_else(|| addr.to_string());
    let role = caps
        .role
        .as_deref()
        .or(health.role.as_deref())
        .map(parse_role)
        .unwrap_or(Role::Worker);
    let slots = if caps.slots.is_empty() {
        health.slots
    } else {
        caps.slots
    };

    let mut node = NodeRecord::new(id, addr.to_string(), role, Source::Probed).with_slots(slots);
    node.device = caps.device;
    node.version = caps.version;
    node.caps = caps.caps;
    node
}

/// Unknown role strings are treated as workers.
fn parse_role(s: &str) -> Role {
    s.parse().unwrap_or(Role::Worker)
}
