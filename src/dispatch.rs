use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::DispatchConfig;
use crate::error::{AutodError, Result};
use crate::exec::ExecRequest;
use crate::registry::Registry;

/// A worker's reply to a forwarded execution, relayed as-is.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub node_id: String,
    pub status: u16,
    pub body: Vec<u8>,
}

impl DispatchResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body)
            .map_err(|e| AutodError::Validation(format!("invalid worker response: {}", e)))
    }
}

/// Routes slot executions to the node bound to the slot.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    registry: Registry,
    client: reqwest::Client,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Registry, config: DispatchConfig) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            registry,
            client,
            config,
        })
    }

    /// Resolve `slot` and forward `payload` to that node's `/exec`.
    ///
    /// The payload is checked through its [`ExecRequest`] view but sent as
    /// received, so older workers still see their own field names. Both
    /// lookups happen now, not at bind time. Failures are never retried.
    pub async fn dispatch(&self, slot: &str, payload: &Value) -> Result<DispatchResponse> {
        let request = ExecRequest::from_payload(payload)?;
        request.validate()?;

        let node_id = self
            .registry
            .resolve_slot(slot)
            .await
            .ok_or_else(|| AutodError::SlotUnassigned(slot.to_string()))?;
        let node = self
            .registry
            .get(&node_id)
            .await
            .ok_or_else(|| AutodError::NodeNotFound(node_id.clone()))?;

        let unavailable = |cause: String| AutodError::DownstreamUnavailable {
            node_id: node.id.clone(),
            address: node.address.clone(),
            cause,
        };

        tracing::info!(slot, node_id = %node.id, address = %node.address, command = %request.command_path, "Dispatching");

        let mut response = self
            .client
            .post(format!("http://{}/exec", node.address))
            .json(payload)
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        let status = response.status().as_u16();
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| unavailable(e.to_string()))?
        {
            if body.len() + chunk.len() > self.config.max_response_bytes {
                return Err(unavailable(format!(
                    "response exceeds {} bytes",
                    self.config.max_response_bytes
                )));
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(slot, node_id = %node.id, status, bytes = body.len(), "Dispatch complete");
        Ok(DispatchResponse {
            node_id: node.id,
            status,
            body,
        })
    }
}
