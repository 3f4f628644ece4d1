use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::{NodeConfig, Role};
use crate::error::{AutodError, Result};
use crate::registry::{NodeRecord, Registry, Source};

/// Body of `POST /sync/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub slots: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

impl RegisterRequest {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            id: config.node_id.clone(),
            address: config.advertise_address(),
            slots: config.slots.clone(),
            role: Some(config.role),
        }
    }
}

/// Outcome of an accepted registration.
#[derive(Debug, Clone, PartialEq)]
pub struct Registration {
    pub node: NodeRecord,
    /// Slot bound to the node by this registration
    pub slot: Option<String>,
}

/// Coordinator side of a registration push.
///
/// `id` and `address` are required; a missing role means worker. The node
/// is then given a slot: one `preferences` names it for (slot -> node id),
/// else the first free slot it advertises if it holds none yet.
pub async fn accept_registration(
    registry: &Registry,
    req: RegisterRequest,
    preferences: &BTreeMap<String, String>,
) -> Result<Registration> {
    let id = req.id.trim();
    let address = req.address.trim();
    if id.is_empty() || address.is_empty() {
        return Err(AutodError::Validation(
            "id and address are required".to_string(),
        ));
    }

    let node = NodeRecord::new(
        id,
        address,
        req.role.unwrap_or(Role::Worker),
        Source::Registered,
    )
    .with_slots(req.slots.iter().cloned());

    tracing::debug!(node_id = %node.id, address = %node.address, "Registration accepted");
    registry.upsert(node.clone()).await;

    let preferred: Vec<String> = preferences
        .iter()
        .filter(|(_, owner)| **owner == node.id)
        .map(|(slot, _)| slot.clone())
        .collect();
    let slot = registry.assign_slot(&node.id, &preferred, &req.slots).await;

    Ok(Registration { node, slot })
}

/// Worker side: pushes this node's descriptor to the coordinator on a timer.
pub struct Registrar {
    request: RegisterRequest,
    coordinator_url: Option<String>,
    interval: Duration,
    client: reqwest::Client,
}

impl Registrar {
    pub fn new(config: &NodeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.registrar.timeout)
            .build()?;
        Ok(Self {
            request: RegisterRequest::from_config(config),
            coordinator_url: config
                .registrar
                .coordinator_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            interval: config.registrar.interval,
            client,
        })
    }

    /// Push once. Errors are returned to the caller.
    pub async fn push(&self) -> Result<()> {
        let url = match self.coordinator_url {
            Some(ref url) => format!("{}/sync/register", url),
            None => return Err(AutodError::Config("no coordinator url".to_string())),
        };
        self.client
            .post(url)
            .json(&self.request)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    /// Push immediately and then on every tick until shutdown.
    ///
    /// Late ticks are delayed rather than bursted, so at most one push is in
    /// flight.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.coordinator_url.is_none() || self.request.address.is_empty() {
            tracing::warn!("Registration disabled: coordinator url or advertise address missing");
            return;
        }

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // An in-flight push is abandoned on shutdown.
            let pushed = tokio::select! {
                _ = shutdown.cancelled() => break,
                pushed = self.push() => pushed,
            };
            match pushed {
                Ok(()) => tracing::debug!(node_id = %self.request.id, "Registered with coordinator"),
                Err(e) => tracing::warn!(
                    node_id = %self.request.id,
                    coordinator = ?self.coordinator_url,
                    error = %e,
                    "Registration push failed"
                ),
            }
        }
        tracing::info!("Registrar stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accept_defaults_role_to_worker() {
        let registry = Registry::new();
        let req: RegisterRequest =
            serde_json::from_str(r#"{"id":"w1","address":"10.0.0.2:8080","slots":["a"]}"#)
                .unwrap();
        let registered = accept_registration(&registry, req, &BTreeMap::new())
            .await
            .unwrap();
        let node = registered.node;
        assert_eq!(node.role, Role::Worker);
        assert_eq!(node.source, Source::Registered);
        assert!(node.healthy);
        assert_eq!(registry.get("w1").await.unwrap(), node);
        assert_eq!(registered.slot.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn accept_legacy_role_name() {
        let registry = Registry::new();
        let req: RegisterRequest =
            serde_json::from_str(r#"{"id":"m","address":"10.0.0.1:8080","role":"master"}"#)
                .unwrap();
        let registered = accept_registration(&registry, req, &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(registered.node.role, Role::Coordinator);
        assert!(registered.slot.is_none());
    }

    #[tokio::test]
    async fn accept_requires_id_and_address() {
        let registry = Registry::new();
        let req: RegisterRequest = serde_json::from_str(r#"{"id":"w1"}"#).unwrap();
        assert!(matches!(
            accept_registration(&registry, req, &BTreeMap::new()).await,
            Err(AutodError::Validation(_))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn accept_binds_preferred_slot() {
        let registry = Registry::new();
        let preferences = BTreeMap::from([
            ("front".to_string(), "w1".to_string()),
            ("rear".to_string(), "w2".to_string()),
        ]);
        let req: RegisterRequest =
            serde_json::from_str(r#"{"id":"w1","address":"10.0.0.2:8080","slots":["a"]}"#)
                .unwrap();

        let registered = accept_registration(&registry, req, &preferences)
            .await
            .unwrap();
        assert_eq!(registered.slot.as_deref(), Some("front"));
        assert_eq!(registry.resolve_slot("front").await.as_deref(), Some("w1"));
        assert!(registry.resolve_slot("rear").await.is_none());
    }

    #[tokio::test]
    async fn accept_keeps_manual_binding_of_preferred_slot() {
        let registry = Registry::new();
        registry.bind_slot("front", "w9").await;
        let preferences = BTreeMap::from([("front".to_string(), "w1".to_string())]);
        let req: RegisterRequest =
            serde_json::from_str(r#"{"id":"w1","address":"10.0.0.2:8080"}"#).unwrap();

        let registered = accept_registration(&registry, req, &preferences)
            .await
            .unwrap();
        assert!(registered.slot.is_none());
        assert_eq!(registry.resolve_slot("front").await.as_deref(), Some("w9"));
    }

    #[test]
    fn request_from_config() {
        let config = NodeConfig::new("w1", Role::Worker, "0.0.0.0:9000".parse().unwrap())
            .with_slot("a");
        let req = RegisterRequest::from_config(&config);
        assert_eq!(req.address, "127.0.0.1:9000");
        assert_eq!(req.slots, vec!["a".to_string()]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["role"], "worker");
    }
}
