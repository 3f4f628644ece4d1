use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;

use crate::api::coordinator::{
    BindBody, BindRequest, RegisterBody, ScanStartBody, SlotsBody, UnbindBody,
};
use crate::api::{CapsBody, ErrorBody, HealthBody, NodesBody};
use crate::discovery::{RegisterRequest, ScanStatus};
use crate::error::{AutodError, Result};
use crate::exec::{ExecRequest, ExecResponse};

/// Typed client for a node's HTTP API
#[derive(Clone, Debug)]
pub struct AutodClient {
    client: Client,
    base_url: String,
}

impl AutodClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// `/sync/slots/{slot}` with the slot name percent-encoded as one segment.
    fn slot_url(&self, slot: &str) -> String {
        self.url(&format!("/sync/slots/{}", urlencoding::encode(slot)))
    }

    /// Send and decode a JSON body, turning error statuses into `Remote`.
    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|e| e.error)
            .unwrap_or(text);
        Err(AutodError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    pub async fn health(&self) -> Result<HealthBody> {
        self.execute(self.client.get(self.url("/health"))).await
    }

    pub async fn caps(&self) -> Result<CapsBody> {
        self.execute(self.client.get(self.url("/caps"))).await
    }

    pub async fn nodes(&self) -> Result<NodesBody> {
        self.execute(self.client.get(self.url("/nodes"))).await
    }

    pub async fn exec(&self, request: &ExecRequest) -> Result<ExecResponse> {
        self.execute(self.client.post(self.url("/exec")).json(request))
            .await
    }

    /// Start a scan. A scan already in progress is reported in the body,
    /// not as an error.
    pub async fn start_scan(&self) -> Result<ScanStartBody> {
        let response = self.client.post(self.url("/nodes/scan")).send().await?;
        match response.status() {
            StatusCode::ACCEPTED | StatusCode::CONFLICT => Ok(response.json().await?),
            status => Err(AutodError::Remote {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }

    pub async fn scan_status(&self) -> Result<ScanStatus> {
        self.execute(self.client.get(self.url("/nodes/scan"))).await
    }

    pub async fn register(&self, request: &RegisterRequest) -> Result<RegisterBody> {
        self.execute(self.client.post(self.url("/sync/register")).json(request))
            .await
    }

    pub async fn slots(&self) -> Result<SlotsBody> {
        self.execute(self.client.get(self.url("/sync/slots"))).await
    }

    pub async fn bind_slot(&self, slot: &str, node_id: &str) -> Result<BindBody> {
        let body = BindRequest {
            node_id: node_id.to_string(),
        };
        self.execute(
            self.client
                .put(self.slot_url(slot))
                .json(&body),
        )
        .await
    }

    pub async fn unbind_slot(&self, slot: &str) -> Result<UnbindBody> {
        self.execute(self.client.delete(self.slot_url(slot))).await
    }

    pub async fn slot_exec(&self, slot: &str, request: &ExecRequest) -> Result<ExecResponse> {
        self.execute(
            self.client
                .post(format!("{}/exec", self.slot_url(slot)))
                .json(request),
        )
        .await
    }
}
