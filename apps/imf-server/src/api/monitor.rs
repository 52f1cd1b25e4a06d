//! Control surface for the monitor worker.

use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use imf_runtime::supervisor::PendingCommandInfo;
use imf_runtime::{ProcessSupervisor, SupervisorStatus};

use super::AppState;
use super::problem::Problem;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/restart", post(restart))
        .route("/commands", get(pending).post(send_command))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
    /// Overrides the configured command timeout.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub result: Value,
}

fn supervisor(state: &AppState) -> Result<Arc<ProcessSupervisor>, Problem> {
    state.supervisor().ok_or_else(Problem::worker_disabled)
}

async fn status(State(state): State<AppState>) -> Result<Json<SupervisorStatus>, Problem> {
    Ok(Json(supervisor(&state)?.get_status()))
}

async fn start(State(state): State<AppState>) -> Result<Json<SupervisorStatus>, Problem> {
    let sup = supervisor(&state)?;
    sup.start().await?;
    Ok(Json(sup.get_status()))
}

async fn stop(State(state): State<AppState>) -> Result<Json<SupervisorStatus>, Problem> {
    let sup = supervisor(&state)?;
    sup.stop().await;
    Ok(Json(sup.get_status()))
}

async fn restart(State(state): State<AppState>) -> Result<Json<SupervisorStatus>, Problem> {
    let sup = supervisor(&state)?;
    sup.restart().await?;
    Ok(Json(sup.get_status()))
}

async fn pending(State(state): State<AppState>) -> Result<Json<Vec<PendingCommandInfo>>, Problem> {
    Ok(Json(supervisor(&state)?.pending_commands()))
}

async fn send_command(
    State(state): State<AppState>,
    Json(req): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, Problem> {
    let sup = supervisor(&state)?;
    tracing::debug!(command = %req.name, "forwarding command to worker");
    let result = match req.timeout_ms {
        Some(ms) => {
            sup.send_command_with_timeout(&req.name, req.args, Duration::from_millis(ms))
                .await?
        }
        None => sup.send_command(&req.name, req.args).await?,
    };
    Ok(Json(CommandResponse { result }))
}
