//! Node HTTP API
//!
//! - `GET /info`: leadership view of this node
//! - `POST /handoff`: a candidate asks this primary to release its lease
//! - `POST /replicas`: a replica registers with this primary
//! - `POST /promote`: operator request to make this node primary
//! - `GET /health`, `/health/ready`, `/health/live`: health checks
//! - `GET /metrics`: Prometheus text format
//! - `GET /debug/vars`: diagnostic variables as JSON

use super::leadership::{Coordinator, ReplicaStatus};
use super::peer::{ErrorBody, HandoffRequest, ReplicaRegistration};
use super::state::LeaseState;
use crate::common::diagnostics;
use crate::common::metrics::METRICS;
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Error;
use crate::lease::{LeaseType, PrimaryInfo};
use axum::{
    extract::State,
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct NodeState {
    pub coordinator: Arc<Coordinator>,
    /// Cancels in-flight promotions on shutdown
    pub shutdown: CancellationToken,
}

/// Body of `GET /info`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoResponse {
    pub id: String,
    pub is_primary: bool,
    pub primary: Option<PrimaryInfo>,
    pub state: LeaseState,
    pub epoch: Option<u64>,
    pub ready: bool,
    pub candidate: bool,
    pub lease_type: LeaseType,
    #[serde(default)]
    pub replicas: Vec<ReplicaStatus>,
}

impl InfoResponse {
    pub fn from_coordinator(coordinator: &Coordinator) -> Self {
        let snap = coordinator.snapshot();
        Self {
            id: coordinator.id().to_string(),
            is_primary: coordinator.is_primary(),
            primary: snap.primary,
            state: snap.state,
            epoch: snap.epoch,
            ready: coordinator.ready().is_ready(),
            candidate: coordinator.candidate(),
            lease_type: coordinator.lease_type(),
            replicas: coordinator.replicas(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let primary = match &self {
            Error::NotPrimary(primary) => primary.clone(),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            primary,
        };
        (self.to_http_status(), Json(body)).into_response()
    }
}

pub fn create_router(state: NodeState) -> Router {
    Router::new()
        .route("/info", get(info))
        .route("/handoff", post(handoff))
        .route("/replicas", post(register_replica))
        .route("/promote", post(promote))
        // Health
        .route("/health", get(health))
        .route("/health/ready", get(health_ready))
        .route("/health/live", get(health_live))
        // Diagnostics
        .route("/metrics", get(metrics))
        .route("/debug/vars", get(debug_vars))
        .layer(middleware::from_fn(request_tracing_middleware))
        .with_state(state)
}

async fn info(State(state): State<NodeState>) -> Json<InfoResponse> {
    Json(InfoResponse::from_coordinator(&state.coordinator))
}

async fn handoff(
    State(state): State<NodeState>,
    Json(req): Json<HandoffRequest>,
) -> Result<Json<serde_json::Value>, Error> {
    state.coordinator.handle_handoff(&req)?;
    Ok(Json(json!({ "status": "released" })))
}

async fn register_replica(
    State(state): State<NodeState>,
    Json(reg): Json<ReplicaRegistration>,
) -> Result<Json<PrimaryInfo>, Error> {
    state.coordinator.register_replica(&reg).map(Json)
}

async fn promote(State(state): State<NodeState>) -> Result<Json<InfoResponse>, Error> {
    state.coordinator.promote(&state.shutdown.child_token()).await?;
    Ok(Json(InfoResponse::from_coordinator(&state.coordinator)))
}

async fn health(State(state): State<NodeState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    Json(json!({
        "status": "healthy",
        "state": coordinator.state(),
        "is_primary": coordinator.is_primary(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check: 503 until the node is primary or synced with one
async fn health_ready(State(state): State<NodeState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    let ready = coordinator.ready().is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "ready": ready,
            "state": coordinator.state(),
            "is_primary": coordinator.is_primary(),
        })),
    )
}

async fn health_live() -> impl IntoResponse {
    Json(json!({
        "alive": true,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

async fn metrics(State(state): State<NodeState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.to_prometheus(state.coordinator.is_primary()),
    )
}

async fn debug_vars() -> impl IntoResponse {
    Json(diagnostics::snapshot())
}
