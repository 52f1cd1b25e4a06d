//! HTTP and WebSocket surface.

mod monitor;
pub mod problem;
mod ws;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use imf_runtime::supervisor;
use imf_runtime::{ApplicationOrchestrator, OrchestratorStatus, ProcessSupervisor};

use crate::config::ServerConfig;
use crate::telemetry_store::{self, Snapshot, TelemetryStore};
use problem::Problem;

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<ApplicationOrchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Arc<ApplicationOrchestrator>) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &ApplicationOrchestrator {
        &self.orchestrator
    }

    fn supervisor(&self) -> Option<Arc<ProcessSupervisor>> {
        self.orchestrator.registry().find(supervisor::SERVICE_NAME)
    }

    fn telemetry(&self) -> Option<Arc<TelemetryStore>> {
        self.orchestrator.registry().find(telemetry_store::SERVICE_NAME)
    }
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/api/health", get(health))
        .route("/api/status", get(status))
        .route("/api/telemetry", get(telemetry))
        .route("/api/telemetry/{kind}", get(telemetry_kind))
        .nest("/api/monitor", monitor::router())
        .route("/ws", get(ws::upgrade))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if server.allow_any_origin {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Runs a poll on demand; while a timer poll is outstanding the last result
/// is served instead.
async fn health(State(state): State<AppState>) -> Response {
    let snapshot = state
        .orchestrator
        .check_health()
        .await
        .or_else(|| state.orchestrator.last_health());
    let Some(snapshot) = snapshot else {
        return Problem::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Health Unavailable",
            "no health poll has completed yet",
        )
        .into_response();
    };
    let code = if snapshot.all_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(snapshot)).into_response()
}

async fn status(State(state): State<AppState>) -> Json<OrchestratorStatus> {
    Json(state.orchestrator.status())
}

fn store(state: &AppState) -> Result<Arc<TelemetryStore>, Problem> {
    state.telemetry().ok_or_else(|| {
        Problem::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Telemetry Unavailable",
            "the telemetry store is not running",
        )
    })
}

async fn telemetry(State(state): State<AppState>) -> Result<Json<BTreeMap<String, Snapshot>>, Problem> {
    Ok(Json(store(&state)?.snapshot()))
}

async fn telemetry_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
) -> Result<Json<Snapshot>, Problem> {
    store(&state)?.latest(&kind).map(Json).ok_or_else(|| {
        Problem::new(
            StatusCode::NOT_FOUND,
            "Not Found",
            format!("no '{kind}' event received yet"),
        )
    })
}
