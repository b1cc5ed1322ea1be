//! HTTP surface of the orchestrator.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use gaia_proto::{GpuSleepRequest, HandoffAdvanceRequest, HandoffStartRequest, HealthResponse};
use serde_json::json;
use std::sync::Arc;

use crate::state::{StateError, StateManager};

const SERVICE_NAME: &str = "gaia-orchestrator";

pub fn router(manager: Arc<StateManager>) -> Router {
    Router::new()
        .route("/gpu/sleep", post(gpu_sleep))
        .route("/gpu/wake", post(gpu_wake))
        .route("/handoff/start", post(handoff_start))
        .route("/handoff/advance", post(handoff_advance))
        .route("/state", get(state_snapshot))
        .route("/health", get(health))
        .with_state(manager)
}

fn error_response(err: StateError) -> Response {
    let status = match &err {
        StateError::Precondition(_) => StatusCode::CONFLICT,
        StateError::NotFound(_) => StatusCode::NOT_FOUND,
        StateError::VerifyFailed(_) => StatusCode::BAD_GATEWAY,
        StateError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({"error": err.to_string()}))).into_response()
}

async fn gpu_sleep(
    State(manager): State<Arc<StateManager>>,
    Json(body): Json<GpuSleepRequest>,
) -> Response {
    match manager.gpu_sleep(&body.reason).await {
        Ok(state) => Json(state).into_response(),
        Err(e) => error_response(e),
    }
}

async fn gpu_wake(State(manager): State<Arc<StateManager>>) -> Response {
    match manager.gpu_wake().await {
        Ok(state) => Json(state).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handoff_start(
    State(manager): State<Arc<StateManager>>,
    Json(body): Json<HandoffStartRequest>,
) -> Response {
    match manager
        .start_handoff(body.handoff_type, &body.source, &body.destination)
        .await
    {
        Ok(handoff) => Json(handoff).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handoff_advance(
    State(manager): State<Arc<StateManager>>,
    Json(body): Json<HandoffAdvanceRequest>,
) -> Response {
    match manager.advance_handoff(&body.handoff_id, body.phase).await {
        Ok(handoff) => Json(handoff).into_response(),
        Err(e) => error_response(e),
    }
}

async fn state_snapshot(State(manager): State<Arc<StateManager>>) -> Response {
    Json(manager.snapshot().await).into_response()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy(SERVICE_NAME))
}
