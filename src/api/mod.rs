//! HTTP + JSON surface.
//!
//! Every node serves `/health`, `/caps`, `/exec` and `/nodes`. The coordinator
//! additionally serves scan control, registration and the slot routes from
//! [`coordinator`].

pub mod coordinator;
pub mod runtime;

use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequest, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{NodeConfig, Role};
use crate::discovery::{ScanStatus, Scanner};
use crate::dispatch::Dispatcher;
use crate::error::AutodError;
use crate::exec::{ExecRequest, ExecResponse, Executor};
use crate::registry::{NodeRecord, Registry};

use self::runtime::RuntimeStats;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<NodeConfig>,
    pub registry: Registry,
    pub executor: Arc<Executor>,
    pub dispatcher: Arc<Dispatcher>,
    /// Present on the coordinator only
    pub scanner: Option<Arc<Scanner>>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthBody {
    pub status: String,
    pub id: String,
    pub role: Role,
    pub slots: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CapsBody {
    pub id: String,
    pub device: Option<String>,
    pub role: Role,
    pub version: String,
    pub caps: Vec<String>,
    pub slots: Vec<String>,
    pub port: u16,
    #[serde(flatten)]
    pub runtime: RuntimeStats,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NodesBody {
    pub nodes: Vec<NodeRecord>,
    pub scan: Option<ScanStatus>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

impl IntoResponse for AutodError {
    fn into_response(self) -> Response {
        let status = match &self {
            AutodError::Validation(_) => StatusCode::BAD_REQUEST,
            AutodError::SlotUnassigned(_) | AutodError::NodeNotFound(_) => StatusCode::NOT_FOUND,
            AutodError::ScanAlreadyRunning => StatusCode::CONFLICT,
            AutodError::DownstreamUnavailable { .. } | AutodError::Remote { .. } => {
                StatusCode::BAD_GATEWAY
            }
            AutodError::SpawnFailed { .. }
            | AutodError::Config(_)
            | AutodError::Io(_)
            | AutodError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self, kind = self.kind(), "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
            kind: self.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// `Json` extractor whose rejections (bad syntax, missing fields, wrong
/// content type) come back as validation errors in the usual error body.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AutodError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ValidJson(value)),
            Err(rejection) => Err(AutodError::Validation(rejection.body_text())),
        }
    }
}

/// Build the router for this node's role.
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut app = Router::new()
        .route("/health", get(health_handler))
        .route("/caps", get(caps_handler))
        .route("/exec", post(exec_handler))
        .route("/nodes", get(nodes_handler));

    if state.config.role == Role::Coordinator {
        app = app.merge(coordinator::routes());
    }

    app.layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve `app` on `listener` until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "API server listening");
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(HealthBody {
        status: "ok".to_string(),
        id: state.config.node_id.clone(),
        role: state.config.role,
        slots: state.config.slots.clone(),
        timestamp: Utc::now(),
    })
}

async fn caps_handler(State(state): State<ApiState>) -> impl IntoResponse {
    let config = &state.config;
    Json(CapsBody {
        id: config.node_id.clone(),
        device: config.device.clone(),
        role: config.role,
        version: config.version.clone(),
        caps: config.caps.clone(),
        slots: config.slots.clone(),
        port: config.listen_addr.port(),
        runtime: RuntimeStats::read().await,
    })
}

async fn exec_handler(
    State(state): State<ApiState>,
    ValidJson(request): ValidJson<ExecRequest>,
) -> Result<Json<ExecResponse>, AutodError> {
    let result = state.executor.execute(&request).await?;
    Ok(Json(ExecResponse::from(result)))
}

async fn nodes_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(NodesBody {
        nodes: state.registry.list().await,
        scan: state.scanner.as_ref().map(|s| s.status()),
    })
}
