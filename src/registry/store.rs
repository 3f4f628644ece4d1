use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::registry::node::{NodeRecord, Source};

#[derive(Debug, Default)]
struct RegistryState {
    nodes: HashMap<String, NodeRecord>,
    slots: HashMap<String, String>,
}

/// Shared node table and slot bindings.
///
/// Cloning is cheap; every clone refers to the same table. Readers run
/// concurrently, writers are exclusive, and nothing here performs I/O while
/// holding the lock.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the record with `node.id`.
    pub async fn upsert(&self, node: NodeRecord) {
        let id = node.id.clone();
        let source = node.source;
        let mut state = self.inner.write().await;
        if state.nodes.insert(id.clone(), node).is_none() {
            tracing::info!(node_id = %id, %source, total = state.nodes.len(), "Node added");
        } else {
            tracing::debug!(node_id = %id, %source, "Node refreshed");
        }
    }

    pub async fn get(&self, id: &str) -> Option<NodeRecord> {
        self.inner.read().await.nodes.get(id).cloned()
    }

    /// All records, sorted by id.
    pub async fn list(&self) -> Vec<NodeRecord> {
        let state = self.inner.read().await;
        let mut nodes: Vec<NodeRecord> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.nodes.is_empty()
    }

    /// Bind `slot` to `node_id`, replacing any previous binding.
    ///
    /// The node does not have to exist; dispatch checks that.
    pub async fn bind_slot(&self, slot: &str, node_id: &str) {
        let mut state = self.inner.write().await;
        let prev = state.slots.insert(slot.to_string(), node_id.to_string());
        tracing::info!(slot, node_id, previous = ?prev, "Slot bound");
    }

    /// Slot assignment for a registering node, under one write lock.
    ///
    /// The first `preferred` slot that is free or already held by `node_id`
    /// is taken. Failing that, a node holding no slot at all gets the first
    /// free slot it `advertised`. Bindings owned by other nodes are never
    /// moved. Returns the slot bound by this call.
    pub async fn assign_slot(
        &self,
        node_id: &str,
        preferred: &[String],
        advertised: &[String],
    ) -> Option<String> {
        let mut state = self.inner.write().await;
        let free_or_own = |slots: &HashMap<String, String>, slot: &str| {
            slots.get(slot).map_or(true, |owner| owner == node_id)
        };

        let slot = match preferred.iter().find(|s| free_or_own(&state.slots, s.as_str())) {
            Some(slot) => slot.clone(),
            None => {
                if state.slots.values().any(|owner| owner == node_id) {
                    return None;
                }
                advertised
                    .iter()
                    .find(|s| !state.slots.contains_key(s.as_str()))?
                    .clone()
            }
        };

        let prev = state.slots.insert(slot.clone(), node_id.to_string());
        if prev.as_deref() != Some(node_id) {
            tracing::info!(slot = %slot, node_id, "Slot auto-assigned");
        }
        Some(slot)
    }

    pub async fn resolve_slot(&self, slot: &str) -> Option<String> {
        self.inner.read().await.slots.get(slot).cloned()
    }

    /// Remove a binding. Returns the node it pointed at, if any.
    pub async fn unbind_slot(&self, slot: &str) -> Option<String> {
        let removed = self.inner.write().await.slots.remove(slot);
        if let Some(ref node_id) = removed {
            tracing::info!(slot, node_id = %node_id, "Slot unbound");
        }
        removed
    }

    /// Snapshot of every binding, ordered by slot.
    pub async fn slot_map(&self) -> BTreeMap<String, String> {
        self.inner
            .read()
            .await
            .slots
            .iter()
            .map(|(slot, node)| (slot.clone(), node.clone()))
            .collect()
    }

    /// Drop non-self records not seen within `ttl`. Returns the evicted ids.
    ///
    /// Slot bindings are left alone; a binding to an evicted node fails at
    /// dispatch with `NodeNotFound` until the node is seen again.
    pub async fn evict_stale(&self, ttl: Duration) -> Vec<String> {
        let now = Utc::now();
        let mut state = self.inner.write().await;
        let stale: Vec<String> = state
            .nodes
            .values()
            .filter(|n| n.source != Source::SelfNode && !n.is_fresh(ttl, now))
            .map(|n| n.id.clone())
            .collect();

        for id in &stale {
            state.nodes.remove(id);
            tracing::info!(node_id = %id, "Evicted stale node");
        }
        stale
    }
}
