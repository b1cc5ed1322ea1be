//! Single-writer persistent state for the GPU lease orchestrator.
//!
//! Every mutation is followed by an atomic save of `state.json`. On
//! startup any handoff persisted in a non-terminal phase is reconciled:
//! forced to `failed`, stamped, and moved to the append-only history.

use chrono::Utc;
use gaia_observe::SharedMetrics;
use gaia_persist::StateFile;
use gaia_proto::{
    GpuOwner, Handoff, HandoffPhase, HandoffType, PersistentState,
};
use gaia_timeline::{TimelineStore, event};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::OrchestratorConfig;
use crate::containers::{ContainerControl, wait_healthy};

#[derive(Debug, Error)]
pub enum StateError {
    /// Rejected without any state change (HTTP 409).
    #[error("precondition violation: {0}")]
    Precondition(String),

    /// Unknown handoff id (HTTP 404).
    #[error("handoff not found: {0}")]
    NotFound(String),

    /// Prime never came up healthy before the wake deadline; the owner
    /// was not changed (HTTP 502).
    #[error("gpu wake verification failed: {0}")]
    VerifyFailed(String),

    #[error(transparent)]
    Persist(#[from] gaia_persist::PersistError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// In-memory clock for the per-phase deadline; not persisted, since a
/// restart reconciles any in-flight handoff anyway.
struct PhaseClock {
    handoff_id: String,
    entered_at: Instant,
}

struct Guarded {
    state: PersistentState,
    phase_clock: Option<PhaseClock>,
}

/// Single writer of [`PersistentState`].
///
/// One async mutex serializes whole operations, including the container
/// boot and health verification inside `gpu_wake`, so concurrent HTTP
/// requests can never interleave partial mutations.
pub struct StateManager {
    guarded: tokio::sync::Mutex<Guarded>,
    file: StateFile,
    config: OrchestratorConfig,
    containers: Arc<dyn ContainerControl>,
    timeline: Arc<TimelineStore>,
    metrics: SharedMetrics,
}

impl StateManager {
    /// Load persisted state (or start fresh) and reconcile any handoff
    /// that was mid-flight at the previous shutdown.
    pub fn initialize(
        file: StateFile,
        config: OrchestratorConfig,
        containers: Arc<dyn ContainerControl>,
        timeline: Arc<TimelineStore>,
        metrics: SharedMetrics,
    ) -> Result<Self> {
        let mut state = match file.load::<PersistentState>() {
            Ok(Some(state)) => state,
            Ok(None) => {
                info!("no persisted state, starting fresh");
                PersistentState::default()
            }
            Err(e) => {
                warn!(error = %e, "corrupt state file, starting fresh");
                PersistentState::default()
            }
        };

        let reconciled = Self::reconcile(&mut state);
        if reconciled {
            state.last_updated = Some(Utc::now());
            file.save(&state)?;
        }

        Ok(Self {
            guarded: tokio::sync::Mutex::new(Guarded {
                state,
                phase_clock: None,
            }),
            file,
            config,
            containers,
            timeline,
            metrics,
        })
    }

    /// Force a stale non-terminal handoff to `failed` and move it to
    /// history. Terminal handoffs are left untouched. Returns true if a
    /// reconciliation happened.
    fn reconcile(state: &mut PersistentState) -> bool {
        let stale_present = state
            .active_handoff
            .as_ref()
            .is_some_and(|h| !h.phase.is_terminal());
        if !stale_present {
            return false;
        }
        let Some(mut stale) = state.active_handoff.take() else {
            return false;
        };
        warn!(
            handoff_id = %stale.handoff_id,
            phase = %stale.phase,
            "reconciling stale handoff from previous run"
        );
        stale.phase = HandoffPhase::Failed;
        stale.error = Some("startup reconciliation".to_string());
        stale.completed_at = Some(Utc::now());
        state.handoff_history.push(stale);
        true
    }

    /// Full state snapshot.
    pub async fn snapshot(&self) -> PersistentState {
        self.guarded.lock().await.state.clone()
    }

    // ─── GPU custody ──────────────────────────────────────────────────────

    /// Release the GPU: stop Prime and set the owner to NONE. Idempotent
    /// if nothing holds the GPU.
    pub async fn gpu_sleep(&self, reason: &str) -> Result<PersistentState> {
        let mut guarded = self.guarded.lock().await;
        if guarded.state.gpu.owner == GpuOwner::None {
            return Ok(guarded.state.clone());
        }

        // Stopping the container is best-effort; the lease release is not.
        if let Err(e) = self.containers.stop(&self.config.prime_service).await {
            warn!(error = %e, "prime stop failed, releasing lease anyway");
        }

        let previous = guarded.state.gpu.owner;
        guarded.state.gpu.owner = GpuOwner::None;
        guarded.state.gpu.lease_id = None;
        guarded.state.gpu.reason = None;
        guarded.state.gpu.acquired_at = None;
        self.save(&mut guarded)?;

        self.metrics.gpu_handoffs_total.inc();
        self.timeline.append(
            event::GPU_HANDOFF,
            json!({"action": "sleep", "from": previous.to_string(), "reason": reason}),
        );
        info!(from = %previous, reason, "gpu released");
        Ok(guarded.state.clone())
    }

    /// Boot Prime and take the GPU for the live core. The owner is only
    /// set after Prime's health endpoint answers 200 (never mark a
    /// container we know is down). Idempotent if the core already owns it.
    pub async fn gpu_wake(&self) -> Result<PersistentState> {
        let mut guarded = self.guarded.lock().await;
        if guarded.state.gpu.owner == GpuOwner::Core {
            return Ok(guarded.state.clone());
        }

        if let Err(e) = self.containers.start(&self.config.prime_service).await {
            return Err(StateError::VerifyFailed(format!("prime start failed: {e}")));
        }

        let healthy = wait_healthy(
            &self.config.prime_health_url,
            self.config.wake_deadline,
            self.config.wake_poll_interval,
        )
        .await;
        if !healthy {
            return Err(StateError::VerifyFailed(format!(
                "{} not healthy within {:?}",
                self.config.prime_health_url, self.config.wake_deadline
            )));
        }

        let now = Utc::now();
        guarded.state.gpu.owner = GpuOwner::Core;
        guarded.state.gpu.lease_id = Some(Uuid::new_v4());
        guarded.state.gpu.reason = Some("wake".to_string());
        guarded.state.gpu.acquired_at = Some(now);
        self.save(&mut guarded)?;

        self.metrics.gpu_handoffs_total.inc();
        self.timeline
            .append(event::GPU_HANDOFF, json!({"action": "wake", "to": "core"}));
        info!("gpu reclaimed by core");
        Ok(guarded.state.clone())
    }

    // ─── Handoffs ─────────────────────────────────────────────────────────

    /// Begin a new handoff. Rejected while another is active.
    pub async fn start_handoff(
        &self,
        handoff_type: HandoffType,
        source: &str,
        destination: &str,
    ) -> Result<Handoff> {
        let mut guarded = self.guarded.lock().await;
        if let Some(active) = guarded.state.active_handoff.as_ref() {
            return Err(StateError::Precondition(format!(
                "handoff {} already active in phase {}",
                active.handoff_id, active.phase
            )));
        }

        let handoff = Handoff {
            handoff_id: Uuid::new_v4().to_string(),
            handoff_type,
            phase: HandoffPhase::Initiated,
            started_at: Utc::now(),
            completed_at: None,
            source: source.to_string(),
            destination: destination.to_string(),
            error: None,
            progress_pct: 0,
        };
        guarded.state.active_handoff = Some(handoff.clone());
        guarded.phase_clock = Some(PhaseClock {
            handoff_id: handoff.handoff_id.clone(),
            entered_at: Instant::now(),
        });
        self.save(&mut guarded)?;

        self.metrics.gpu_handoffs_total.inc();
        self.timeline.append(
            event::GPU_HANDOFF,
            json!({
                "action": "handoff_start",
                "handoff_id": handoff.handoff_id,
                "type": handoff.handoff_type.to_string(),
                "source": source,
                "destination": destination,
            }),
        );
        info!(handoff_id = %handoff.handoff_id, handoff_type = %handoff.handoff_type, "handoff started");
        Ok(handoff)
    }

    /// Advance the active handoff. Phases move forward only; a terminal
    /// phase archives the record and clears the active slot. A request
    /// that would violate a precondition changes nothing.
    pub async fn advance_handoff(&self, handoff_id: &str, phase: HandoffPhase) -> Result<Handoff> {
        let mut guarded = self.guarded.lock().await;
        let Some(active) = guarded.state.active_handoff.as_ref() else {
            return Err(StateError::NotFound(handoff_id.to_string()));
        };
        if active.handoff_id != handoff_id {
            return Err(StateError::NotFound(handoff_id.to_string()));
        }
        if !active.phase.can_advance_to(phase) {
            return Err(StateError::Precondition(format!(
                "cannot advance from {} to {}",
                active.phase, phase
            )));
        }

        let Some(mut handoff) = guarded.state.active_handoff.take() else {
            return Err(StateError::NotFound(handoff_id.to_string()));
        };
        handoff.phase = phase;
        handoff.progress_pct = phase_progress(phase);

        let archived = phase.is_terminal();
        if archived {
            handoff.completed_at = Some(Utc::now());
            guarded.state.handoff_history.push(handoff.clone());
            guarded.phase_clock = None;
        } else {
            guarded.state.active_handoff = Some(handoff.clone());
            guarded.phase_clock = Some(PhaseClock {
                handoff_id: handoff.handoff_id.clone(),
                entered_at: Instant::now(),
            });
        }
        self.save(&mut guarded)?;

        self.timeline.append(
            event::GPU_HANDOFF,
            json!({
                "action": "handoff_advance",
                "handoff_id": handoff.handoff_id,
                "phase": handoff.phase.to_string(),
            }),
        );
        info!(handoff_id = %handoff.handoff_id, phase = %handoff.phase, archived, "handoff advanced");
        Ok(handoff)
    }

    /// Fail the active handoff if it has sat in one phase past the
    /// deadline. Called by the internal timer; returns the failed record.
    pub async fn expire_stale_handoff(&self) -> Result<Option<Handoff>> {
        let mut guarded = self.guarded.lock().await;
        let overdue = match (&guarded.phase_clock, &guarded.state.active_handoff) {
            (Some(clock), Some(active))
                if clock.handoff_id == active.handoff_id
                    && clock.entered_at.elapsed() > self.config.phase_deadline =>
            {
                true
            }
            _ => false,
        };
        if !overdue {
            return Ok(None);
        }

        let Some(mut handoff) = guarded.state.active_handoff.take() else {
            return Ok(None);
        };
        warn!(
            handoff_id = %handoff.handoff_id,
            phase = %handoff.phase,
            "handoff exceeded phase deadline, failing"
        );
        handoff.error = Some(format!(
            "phase {} exceeded deadline of {:?}",
            handoff.phase, self.config.phase_deadline
        ));
        handoff.phase = HandoffPhase::Failed;
        handoff.completed_at = Some(Utc::now());
        handoff.progress_pct = phase_progress(HandoffPhase::Failed);
        guarded.state.handoff_history.push(handoff.clone());
        guarded.phase_clock = None;
        self.save(&mut guarded)?;

        self.timeline.append(
            event::GPU_HANDOFF,
            json!({
                "action": "handoff_expired",
                "handoff_id": handoff.handoff_id,
            }),
        );
        Ok(Some(handoff))
    }

    /// Background timer that expires overdue handoffs until shutdown.
    pub async fn run_phase_timer(
        self: Arc<Self>,
        check_interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.expire_stale_handoff().await {
                warn!(error = %e, "phase timer failed to expire handoff");
            }
            tokio::select! {
                _ = tokio::time::sleep(check_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    // ─── Internal ─────────────────────────────────────────────────────────

    fn save(&self, guarded: &mut Guarded) -> Result<()> {
        guarded.state.last_updated = Some(Utc::now());
        self.file.save(&guarded.state)?;
        Ok(())
    }
}

fn phase_progress(phase: HandoffPhase) -> u8 {
    match phase {
        HandoffPhase::Initiated => 0,
        HandoffPhase::ReleasingGpu => 25,
        HandoffPhase::BootingTarget => 50,
        HandoffPhase::Verifying => 75,
        HandoffPhase::Completed | HandoffPhase::Failed => 100,
    }
}
