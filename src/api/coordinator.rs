use std::collections::BTreeMap;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::{ApiState, ValidJson};
use crate::discovery::{accept_registration, RegisterRequest, ScanStatus};
use crate::error::AutodError;

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanStartBody {
    pub rescan: String,
    pub scan: ScanStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterBody {
    pub status: String,
    /// Slot assigned on this registration, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SlotsBody {
    pub slots: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BindBody {
    pub slot: String,
    pub node_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnbindBody {
    pub slot: String,
    pub removed: bool,
}

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/nodes/scan", post(start_scan_handler).get(scan_status_handler))
        .route("/sync/register", post(register_handler))
        .route("/sync/slots", get(list_slots_handler))
        .route("/sync/slots/:slot", put(bind_slot_handler).delete(unbind_slot_handler))
        .route("/sync/slots/:slot/exec", post(slot_exec_handler))
}

fn scanner_missing() -> AutodError {
    AutodError::Config("scanner is not running on this node".to_string())
}

async fn start_scan_handler(State(state): State<ApiState>) -> Response {
    let Some(scanner) = state.scanner.as_ref() else {
        return scanner_missing().into_response();
    };

    match scanner.start(state.shutdown.clone()) {
        Ok(scan) => {
            tracing::info!("Scan requested");
            (
                StatusCode::ACCEPTED,
                Json(ScanStartBody {
                    rescan: "started".to_string(),
                    scan,
                }),
            )
                .into_response()
        }
        Err(AutodError::ScanAlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(ScanStartBody {
                rescan: "already_running".to_string(),
                scan: scanner.status(),
            }),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

async fn scan_status_handler(
    State(state): State<ApiState>,
) -> Result<Json<ScanStatus>, AutodError> {
    let scanner = state.scanner.as_ref().ok_or_else(scanner_missing)?;
    Ok(Json(scanner.status()))
}

async fn register_handler(
    State(state): State<ApiState>,
    ValidJson(request): ValidJson<RegisterRequest>,
) -> Result<Json<RegisterBody>, AutodError> {
    let registered =
        accept_registration(&state.registry, request, &state.config.slot_preferences).await?;
    Ok(Json(RegisterBody {
        status: "ok".to_string(),
        slot: registered.slot,
    }))
}

async fn list_slots_handler(State(state): State<ApiState>) -> impl IntoResponse {
    Json(SlotsBody {
        slots: state.registry.slot_map().await,
    })
}

async fn bind_slot_handler(
    State(state): State<ApiState>,
    Path(slot): Path<String>,
    ValidJson(request): ValidJson<BindRequest>,
) -> Result<Json<BindBody>, AutodError> {
    let node_id = request.node_id.trim();
    if node_id.is_empty() {
        return Err(AutodError::Validation("node_id is required".to_string()));
    }
    if state.registry.get(node_id).await.is_none() {
        return Err(AutodError::NodeNotFound(node_id.to_string()));
    }

    state.registry.bind_slot(&slot, node_id).await;
    Ok(Json(BindBody {
        slot,
        node_id: node_id.to_string(),
    }))
}

async fn unbind_slot_handler(
    State(state): State<ApiState>,
    Path(slot): Path<String>,
) -> impl IntoResponse {
    let removed = state.registry.unbind_slot(&slot).await.is_some();
    Json(UnbindBody { slot, removed })
}

async fn slot_exec_handler(
    State(state): State<ApiState>,
    Path(slot): Path<String>,
    ValidJson(payload): ValidJson<serde_json::Value>,
) -> Result<Response, AutodError> {
    let relayed = state.dispatcher.dispatch(&slot, &payload).await?;
    let status = StatusCode::from_u16(relayed.status).unwrap_or(StatusCode::BAD_GATEWAY);
    Ok((
        status,
        [(header::CONTENT_TYPE, "application/json")],
        relayed.body,
    )
        .into_response())
}
