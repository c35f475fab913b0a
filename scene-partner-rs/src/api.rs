//! HTTP control API for a running rehearsal.
//!
//! Mirrors the console commands so another process (a stage-side tablet, a
//! foot pedal script) can drive the session. Binds to localhost only.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::RehearsalError;
use crate::orchestrator::{TurnOrchestrator, TurnState};
use crate::script::ScriptModel;

#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: TurnOrchestrator,
    pub script: Arc<ScriptModel>,
    pub character: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    turn: TurnState,
    running: bool,
    total_lines: usize,
    cached_lines: usize,
}

#[derive(Debug, Serialize)]
struct SimpleResponse {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl SimpleResponse {
    fn ok(status: &str) -> Self {
        Self {
            status: status.into(),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            error: Some(message.into()),
        }
    }
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/play", post(handle_play))
        .route("/next", post(handle_next))
        .route("/restart", post(handle_restart))
        .with_state(state)
}

/// Start the control API as a background tokio task.
pub async fn start_api(state: ApiState, port: u16) {
    let app = router(state);
    let addr = format!("127.0.0.1:{port}");
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind control API on {addr}: {e}");
            return;
        }
    };
    info!("Control API listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("Control API server error: {e}");
        }
    });
}

// --- Handlers ---

async fn handle_status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        turn: state.orchestrator.state(),
        running: state.orchestrator.is_running(),
        total_lines: state.script.len(),
        cached_lines: state.orchestrator.cache_len(),
    })
}

async fn handle_play(State(state): State<ApiState>) -> (StatusCode, Json<SimpleResponse>) {
    info!("HTTP /play as {}", state.character);
    match state
        .orchestrator
        .spawn(Arc::clone(&state.script), &state.character)
    {
        Ok(_) => (StatusCode::ACCEPTED, Json(SimpleResponse::ok("playing"))),
        Err(e @ (RehearsalError::AlreadyRunning | RehearsalError::SessionFinished)) => {
            (StatusCode::CONFLICT, Json(SimpleResponse::err(e.to_string())))
        }
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(SimpleResponse::err(e.to_string())),
        ),
    }
}

async fn handle_next(State(state): State<ApiState>) -> Json<SimpleResponse> {
    if state.orchestrator.manual_next() {
        Json(SimpleResponse::ok("advanced"))
    } else {
        Json(SimpleResponse::ok("ignored"))
    }
}

async fn handle_restart(State(state): State<ApiState>) -> Json<SimpleResponse> {
    state.orchestrator.restart();
    Json(SimpleResponse::ok("restarted"))
}
