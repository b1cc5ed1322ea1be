//! gaia-core HTTP surface.
//!
//! Exposes the `/sleep/*` endpoints backed by the shared
//! [`SleepWakeManager`] plus the service health probe. The sleep cycle
//! loop runs beside the server; the shutdown endpoint flips both.

#![forbid(unsafe_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use gaia_proto::{
    DistractedCheckResponse, GaiaState, HandoffType, HealthResponse, ShutdownResponse,
    SleepStatus, StudyHandoffRequest, StudyHandoffResponse, WakeResponse,
};
use gaia_sleep::{IdleMonitor, SleepTaskHandler, SleepWakeManager};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

pub const SERVICE_NAME: &str = "gaia-core";

/// Shared state of the HTTP surface.
#[derive(Clone)]
pub struct CoreState {
    pub manager: Arc<SleepWakeManager>,
    pub idle: Arc<IdleMonitor>,
    pub shutdown: Arc<watch::Sender<bool>>,
}

pub fn router(state: CoreState) -> Router {
    Router::new()
        .route("/sleep/wake", post(receive_wake))
        .route("/sleep/status", get(sleep_status))
        .route("/sleep/study-handoff", post(study_handoff))
        .route("/sleep/distracted-check", get(distracted_check))
        .route("/sleep/shutdown", post(shutdown))
        .route("/health", get(health))
        .with_state(state)
}

/// Wake signal from gaia-web, sent when the first message is queued
/// during sleep. Also counts as activity for idle tracking.
async fn receive_wake(State(state): State<CoreState>) -> Json<WakeResponse> {
    state.idle.record_activity();
    state.manager.receive_wake_signal("http");
    Json(WakeResponse {
        received: true,
        state: state.manager.get_state(),
        timestamp: Utc::now(),
    })
}

async fn sleep_status(State(state): State<CoreState>) -> Json<SleepStatus> {
    Json(state.manager.get_status())
}

/// Study handoff signal from the orchestrator:
/// `prime_to_study` enters DREAMING, `study_to_prime` leaves it.
async fn study_handoff(
    State(state): State<CoreState>,
    Json(body): Json<StudyHandoffRequest>,
) -> Response {
    let accepted = match body.direction {
        HandoffType::PrimeToStudy => state.manager.enter_dreaming(&body.handoff_id),
        HandoffType::StudyToPrime => state.manager.exit_dreaming(),
        HandoffType::CandidateSwap => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid direction: candidate_swap"})),
            )
                .into_response();
        }
    };
    debug!(direction = %body.direction, handoff_id = %body.handoff_id, accepted, "study handoff");
    Json(StudyHandoffResponse {
        accepted,
        state: state.manager.get_state(),
        timestamp: Utc::now(),
    })
    .into_response()
}

/// Whether the current state warrants a canned reply instead of waking
/// the model.
async fn distracted_check(State(state): State<CoreState>) -> Json<DistractedCheckResponse> {
    Json(DistractedCheckResponse {
        state: state.manager.get_state(),
        canned_response: state.manager.get_canned_response(),
        timestamp: Utc::now(),
    })
}

/// Graceful shutdown: OFFLINE, then stop the loop and the server.
async fn shutdown(State(state): State<CoreState>) -> Json<ShutdownResponse> {
    info!("shutdown requested");
    state.manager.initiate_offline();
    let _ = state.shutdown.send(true);
    Json(ShutdownResponse {
        accepted: true,
        state: GaiaState::Offline,
        timestamp: Utc::now(),
    })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy(SERVICE_NAME))
}

// ─── Inert task handlers ──────────────────────────────────────────────────────

/// Placeholder handler for the built-in maintenance tasks. The cognition
/// side registers real handlers at boot in a full deployment; the control
/// plane ships inert ones that only journal the run.
pub struct InertTaskHandler {
    label: &'static str,
}

impl InertTaskHandler {
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self { label })
    }
}

#[async_trait::async_trait]
impl SleepTaskHandler for InertTaskHandler {
    async fn run(&self) -> anyhow::Result<()> {
        debug!(task = self.label, "inert task handler ran");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_observe::OperationsMetrics;
    use gaia_sleep::SleepConfig;
    use gaia_timeline::TimelineStore;
    use std::time::Duration;

    struct Rig {
        _dir: tempfile::TempDir,
        state: CoreState,
        base_url: String,
    }

    async fn serve() -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = Arc::new(TimelineStore::new(dir.path().join("timeline")));
        let config = SleepConfig {
            drowsy_grace: Duration::from_millis(10),
            ..SleepConfig::default()
        };
        let manager = Arc::new(SleepWakeManager::new(
            config,
            timeline,
            Arc::new(OperationsMetrics::new()),
        ));
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let state = CoreState {
            manager,
            idle: Arc::new(IdleMonitor::new()),
            shutdown: Arc::new(shutdown_tx),
        };

        let app = router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Rig {
            _dir: dir,
            state,
            base_url: format!("http://{addr}"),
        }
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let rig = serve().await;
        let body: serde_json::Value = reqwest::get(format!("{}/health", rig.base_url))
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "gaia-core");
    }

    #[tokio::test]
    async fn test_wake_endpoint_while_active() {
        let rig = serve().await;
        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/sleep/wake", rig.base_url))
            .json(&json!({}))
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(body["received"], true);
        assert_eq!(body["state"], "active");
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let rig = serve().await;
        let body: serde_json::Value = reqwest::get(format!("{}/sleep/status", rig.base_url))
            .await
            .expect("get")
            .json()
            .await
            .expect("json");
        assert_eq!(body["state"], "active");
        assert_eq!(body["wake_signal_pending"], false);
        assert!(body["current_task"].is_null());
    }

    #[tokio::test]
    async fn test_study_handoff_roundtrip() {
        let rig = serve().await;
        rig.state.manager.initiate_drowsy().await; // ends asleep

        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/sleep/study-handoff", rig.base_url))
            .json(&json!({"direction": "prime_to_study", "handoff_id": "h-1"}))
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(body["accepted"], true);
        assert_eq!(body["state"], "dreaming");

        let body: serde_json::Value = client
            .post(format!("{}/sleep/study-handoff", rig.base_url))
            .json(&json!({"direction": "study_to_prime", "handoff_id": "h-1"}))
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(body["accepted"], true);
        assert_eq!(body["state"], "asleep");
    }

    #[tokio::test]
    async fn test_study_handoff_invalid_direction() {
        let rig = serve().await;
        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{}/sleep/study-handoff", rig.base_url))
            .json(&json!({"direction": "candidate_swap", "handoff_id": "h-1"}))
            .send()
            .await
            .expect("post");
        assert_eq!(resp.status().as_u16(), 400);
    }

    #[tokio::test]
    async fn test_distracted_check_active_has_no_canned_response() {
        let rig = serve().await;
        let body: serde_json::Value =
            reqwest::get(format!("{}/sleep/distracted-check", rig.base_url))
                .await
                .expect("get")
                .json()
                .await
                .expect("json");
        assert_eq!(body["state"], "active");
        assert!(body["canned_response"].is_null());
    }

    #[tokio::test]
    async fn test_distracted_check_dreaming_has_canned_response() {
        let rig = serve().await;
        rig.state.manager.initiate_drowsy().await;
        rig.state.manager.enter_dreaming("h-1");

        let body: serde_json::Value =
            reqwest::get(format!("{}/sleep/distracted-check", rig.base_url))
                .await
                .expect("get")
                .json()
                .await
                .expect("json");
        assert_eq!(body["state"], "dreaming");
        assert!(body["canned_response"].is_string());
    }

    #[tokio::test]
    async fn test_shutdown_endpoint() {
        let rig = serve().await;
        let mut rx = rig.state.shutdown.subscribe();

        let client = reqwest::Client::new();
        let body: serde_json::Value = client
            .post(format!("{}/sleep/shutdown", rig.base_url))
            .json(&json!({}))
            .send()
            .await
            .expect("post")
            .json()
            .await
            .expect("json");
        assert_eq!(body["accepted"], true);
        assert_eq!(body["state"], "offline");
        assert_eq!(rig.state.manager.get_state(), GaiaState::Offline);
        assert!(rx.has_changed().expect("channel open"));
    }
}
