//! Axum Handlers for the REST API
//!
//! Service info and health probes. Both are documented with `utoipa` so the
//! `openapi` binary can emit them.

use axum::{extract::State, response::Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::state::AppState;

pub const SERVICE_NAME: &str = "live-bridge";
pub const WS_PATH: &str = "/api/gemini/ws";

/// Basic information about the running service.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    pub service: String,
    pub version: String,
    pub model: String,
    pub websocket_path: String,
}

/// Liveness report with the number of live bridge sessions.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub live_sessions: usize,
    pub max_sessions: Option<usize>,
    pub started_at: DateTime<Utc>,
}

/// Describe the service and where to open a live session.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    )
)]
pub async fn root(State(state): State<Arc<AppState>>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        service: SERVICE_NAME.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.config.live_model.clone(),
        websocket_path: WS_PATH.to_string(),
    })
}

/// Report service health.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        live_sessions: state.supervisor.live_sessions(),
        max_sessions: state.supervisor.policy().max_sessions,
        started_at: state.started_at,
    })
}
