use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{NodeConfig, Role};

/// How a node record entered the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    #[serde(rename = "self")]
    SelfNode,
    Registered,
    Probed,
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::SelfNode => write!(f, "self"),
            Source::Registered => write!(f, "registered"),
            Source::Probed => write!(f, "probed"),
        }
    }
}

/// A node known to the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    /// host:port used for dispatch
    pub address: String,
    pub role: Role,
    #[serde(default)]
    pub slots: BTreeSet<String>,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
    pub source: Source,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub caps: Vec<String>,
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, address: impl Into<String>, role: Role, source: Source) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            role,
            slots: BTreeSet::new(),
            last_seen: Utc::now(),
            healthy: true,
            source,
            device: None,
            version: None,
            caps: Vec::new(),
        }
    }

    /// This process's own record.
    pub fn for_self(config: &NodeConfig) -> Self {
        let mut node = Self::new(
            config.node_id.clone(),
            config.advertise_address(),
            config.role,
            Source::SelfNode,
        )
        .with_slots(config.slots.iter().cloned());
        node.device = config.device.clone();
        node.version = Some(config.version.clone());
        node.caps = config.caps.clone();
        node
    }

    pub fn with_slots<I, S>(mut self, slots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slots = slots.into_iter().map(Into::into).collect();
        self
    }

    /// True when the record was refreshed within `ttl`.
    pub fn is_fresh(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now.signed_duration_since(self.last_seen) < ttl,
            Err(_) => true,
        }
    }
}
