//! The sleep/wake state machine.
//!
//! All state transitions go through this type; no other component mutates
//! the state. Each transition is appended to the timeline **before** the
//! caller performs downstream effects (GPU release, presence updates), so
//! the journal is the authoritative ordering of what happened.

use chrono::{DateTime, Utc};
use gaia_observe::SharedMetrics;
use gaia_proto::{CurrentTask, GaiaState, TransientPhase, WakeSignal};
use gaia_timeline::{TimelineStore, event};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::SleepConfig;

/// What `complete_wake` reports back to the loop.
#[derive(Debug, Clone)]
pub struct WakeOutcome {
    /// True if a context checkpoint was available to restore.
    pub checkpoint_loaded: bool,
}

/// A canned reply issued by surface layers when the current state
/// declines to wake the model.
struct CannedResponse {
    applies_to: &'static [GaiaState],
    text: &'static str,
}

static CANNED_RESPONSES: &[CannedResponse] = &[
    CannedResponse {
        applies_to: &[GaiaState::Dreaming],
        text: "I'm deep in a study session right now. Leave your message and I'll pick it up as soon as the session wraps.",
    },
    CannedResponse {
        applies_to: &[GaiaState::Distracted],
        text: "Something else is keeping the machine busy at the moment. I'll respond once the load clears.",
    },
    CannedResponse {
        applies_to: &[GaiaState::Offline],
        text: "I'm offline for maintenance. Please check back later.",
    },
];

struct Inner {
    state: GaiaState,
    phase: Option<TransientPhase>,
    state_since: DateTime<Utc>,
    wake_signal: Option<WakeSignal>,
    current_task: Option<CurrentTask>,
}

impl Inner {
    /// Label of the current position for transition journaling; transient
    /// phases shadow the visible state.
    fn label(&self) -> &'static str {
        match self.phase {
            Some(phase) => phase.as_str(),
            None => self.state.as_str(),
        }
    }
}

/// Owner of the current [`GaiaState`] and the pending wake signal.
///
/// One mutex guards all fields. The drowsy grace wait never holds it;
/// cancellation is observed through a watch channel bumped by
/// [`receive_wake_signal`](Self::receive_wake_signal).
pub struct SleepWakeManager {
    inner: Mutex<Inner>,
    wake_tx: watch::Sender<u64>,
    config: SleepConfig,
    timeline: Arc<TimelineStore>,
    metrics: SharedMetrics,
}

impl SleepWakeManager {
    pub fn new(config: SleepConfig, timeline: Arc<TimelineStore>, metrics: SharedMetrics) -> Self {
        let (wake_tx, _) = watch::channel(0u64);
        Self {
            inner: Mutex::new(Inner {
                state: GaiaState::Active,
                phase: None,
                state_since: Utc::now(),
                wake_signal: None,
                current_task: None,
            }),
            wake_tx,
            config,
            timeline,
            metrics,
        }
    }

    // ─── Observers ────────────────────────────────────────────────────────

    pub fn get_state(&self) -> GaiaState {
        self.inner.lock().state
    }

    pub fn phase(&self) -> Option<TransientPhase> {
        self.inner.lock().phase
    }

    pub fn wake_signal_pending(&self) -> bool {
        self.inner.lock().wake_signal.is_some()
    }

    pub fn current_task(&self) -> Option<CurrentTask> {
        self.inner.lock().current_task.clone()
    }

    /// Settable only by the sleep cycle loop for the duration of a task.
    pub fn set_current_task(&self, task: Option<CurrentTask>) {
        self.inner.lock().current_task = task;
    }

    pub fn get_status(&self) -> gaia_proto::SleepStatus {
        let inner = self.inner.lock();
        let seconds = (Utc::now() - inner.state_since).num_seconds().max(0) as u64;
        gaia_proto::SleepStatus {
            state: inner.state,
            seconds_in_state: seconds,
            current_task: inner.current_task.clone(),
            wake_signal_pending: inner.wake_signal.is_some(),
        }
    }

    /// If the current state warrants a canned reply, return it. ACTIVE
    /// and DROWSY always return none (normal processing).
    pub fn get_canned_response(&self) -> Option<String> {
        let state = self.get_state();
        CANNED_RESPONSES
            .iter()
            .find(|c| c.applies_to.contains(&state))
            .map(|c| c.text.to_string())
    }

    /// True iff ACTIVE, idle past the threshold, and sleep is enabled.
    pub fn should_transition_to_drowsy(&self, idle_minutes: f64) -> bool {
        self.config.sleep_enabled
            && self.get_state() == GaiaState::Active
            && idle_minutes >= self.config.idle_threshold_minutes
    }

    // ─── Wake signals ─────────────────────────────────────────────────────

    /// Register an external wake request.
    ///
    /// While ACTIVE this is idempotent (status is unchanged). While
    /// DROWSY it cancels the grace window. While ASLEEP under a
    /// non-interruptible task it arms FINISHING_TASK; the loop's next
    /// poll performs the transition to WAKING.
    pub fn receive_wake_signal(&self, source: &str) {
        let mut inner = self.inner.lock();
        self.metrics.wake_signals_total.inc();

        match inner.state {
            GaiaState::Active | GaiaState::Offline => {
                debug!(state = %inner.state, source, "wake signal ignored");
            }
            GaiaState::Drowsy => {
                if inner.wake_signal.is_none() {
                    inner.wake_signal = Some(WakeSignal {
                        received_at: Utc::now(),
                        source: source.to_string(),
                    });
                }
                // Cancel the grace wait promptly.
                self.wake_tx.send_modify(|n| *n += 1);
                info!(source, "wake signal during drowsy grace window");
            }
            GaiaState::Asleep => {
                if inner.wake_signal.is_none() {
                    inner.wake_signal = Some(WakeSignal {
                        received_at: Utc::now(),
                        source: source.to_string(),
                    });
                }
                let blocked = inner
                    .current_task
                    .as_ref()
                    .is_some_and(|t| !t.interruptible);
                if blocked && inner.phase.is_none() {
                    let from = inner.label();
                    inner.phase = Some(TransientPhase::FinishingTask);
                    drop(inner);
                    self.record_transition(from, TransientPhase::FinishingTask.as_str(), None);
                    info!(source, "wake signal deferred until current task finishes");
                    return;
                }
                info!(source, "wake signal pending");
            }
            GaiaState::Dreaming | GaiaState::Distracted => {
                if inner.wake_signal.is_none() {
                    inner.wake_signal = Some(WakeSignal {
                        received_at: Utc::now(),
                        source: source.to_string(),
                    });
                }
                info!(state = %inner.state, source, "wake signal queued until asleep again");
            }
        }
    }

    // ─── Drowsy ───────────────────────────────────────────────────────────

    /// ACTIVE → DROWSY for the grace window.
    ///
    /// Returns true if the window completed without a wake signal (the
    /// machine is now ASLEEP); false if a signal cancelled it (back to
    /// ACTIVE). The internal lock is never held across the wait.
    pub async fn initiate_drowsy(&self) -> bool {
        let mut wake_rx = {
            let mut inner = self.inner.lock();
            if inner.state != GaiaState::Active {
                return false;
            }
            inner.state = GaiaState::Drowsy;
            inner.state_since = Utc::now();

            // Subscribe while still holding the lock: a signal raised
            // after this point is observed by `changed()`, one raised
            // before could not have seen DROWSY.
            let mut rx = self.wake_tx.subscribe();
            rx.borrow_and_update();
            drop(inner);
            self.record_transition(
                GaiaState::Active.as_str(),
                GaiaState::Drowsy.as_str(),
                Some("idle threshold"),
            );
            rx
        };

        let cancelled = tokio::select! {
            _ = wake_rx.changed() => true,
            _ = tokio::time::sleep(self.config.drowsy_grace) => false,
        };

        let mut inner = self.inner.lock();
        // A signal may also land between the sleep elapsing and the lock
        // reacquisition; it still cancels.
        if cancelled || inner.wake_signal.is_some() {
            inner.wake_signal = None;
            inner.state = GaiaState::Active;
            inner.state_since = Utc::now();
            drop(inner);
            self.record_transition(
                GaiaState::Drowsy.as_str(),
                GaiaState::Active.as_str(),
                Some("wake signal during grace window"),
            );
            return false;
        }

        inner.state = GaiaState::Asleep;
        inner.state_since = Utc::now();
        drop(inner);
        self.record_transition(
            GaiaState::Drowsy.as_str(),
            GaiaState::Asleep.as_str(),
            Some("grace window elapsed"),
        );
        true
    }

    // ─── Waking ───────────────────────────────────────────────────────────

    /// Move into the WAKING phase, consuming the pending wake signal.
    /// Returns false unless the machine is ASLEEP (possibly finishing a
    /// task).
    pub fn transition_to_waking(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != GaiaState::Asleep || inner.phase == Some(TransientPhase::Waking) {
            return false;
        }
        let from = inner.label();
        inner.phase = Some(TransientPhase::Waking);
        inner.wake_signal = None;
        drop(inner);
        self.record_transition(from, TransientPhase::Waking.as_str(), None);
        true
    }

    /// WAKING → ACTIVE. Reports whether a context checkpoint was found
    /// for the cognition side to restore.
    pub fn complete_wake(&self) -> WakeOutcome {
        let mut inner = self.inner.lock();
        let from = inner.label();
        inner.state = GaiaState::Active;
        inner.phase = None;
        inner.state_since = Utc::now();
        drop(inner);
        self.record_transition(from, GaiaState::Active.as_str(), None);

        let checkpoint_loaded = self
            .timeline
            .last_event_of_type(event::CHECKPOINT)
            .is_some();
        WakeOutcome { checkpoint_loaded }
    }

    // ─── Dreaming / Distracted ────────────────────────────────────────────

    /// ASLEEP → DREAMING, when the GPU is handed to a study workload.
    pub fn enter_dreaming(&self, handoff_id: &str) -> bool {
        self.visible_transition(
            GaiaState::Asleep,
            GaiaState::Dreaming,
            Some(format!("handoff {handoff_id}")),
        )
    }

    pub fn exit_dreaming(&self) -> bool {
        self.visible_transition(GaiaState::Dreaming, GaiaState::Asleep, None)
    }

    /// ASLEEP → DISTRACTED on sustained host load.
    pub fn enter_distracted(&self) -> bool {
        self.visible_transition(
            GaiaState::Asleep,
            GaiaState::Distracted,
            Some("sustained host load".to_string()),
        )
    }

    pub fn exit_distracted(&self) -> bool {
        self.visible_transition(
            GaiaState::Distracted,
            GaiaState::Asleep,
            Some("load subsided".to_string()),
        )
    }

    // ─── Offline ──────────────────────────────────────────────────────────

    /// Any state → OFFLINE. Terminal for this process.
    pub fn initiate_offline(&self) {
        let mut inner = self.inner.lock();
        if inner.state == GaiaState::Offline {
            return;
        }
        let from = inner.label();
        inner.state = GaiaState::Offline;
        inner.phase = None;
        inner.current_task = None;
        inner.wake_signal = None;
        inner.state_since = Utc::now();
        drop(inner);
        self.record_transition(from, GaiaState::Offline.as_str(), Some("shutdown"));
    }

    // ─── Internal ─────────────────────────────────────────────────────────

    /// Guarded transition between two visible states; phases must be
    /// clear for it to apply.
    fn visible_transition(&self, from: GaiaState, to: GaiaState, reason: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != from || inner.phase.is_some() {
            debug!(
                state = %inner.state,
                expected = %from,
                target = %to,
                "transition rejected"
            );
            return false;
        }
        inner.state = to;
        inner.state_since = Utc::now();
        drop(inner);
        self.record_transition(from.as_str(), to.as_str(), reason.as_deref());
        true
    }

    fn record_transition(&self, from: &str, to: &str, reason: Option<&str>) {
        self.metrics.state_transitions_total.inc();
        info!(from, to, reason = reason.unwrap_or(""), "state transition");
        let mut data = json!({"from": from, "to": to});
        if let Some(reason) = reason {
            data["reason"] = json!(reason);
        }
        self.timeline.append(event::STATE_CHANGE, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_observe::OperationsMetrics;
    use std::time::Duration;

    fn make_manager(grace: Duration) -> (tempfile::TempDir, Arc<SleepWakeManager>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = Arc::new(TimelineStore::new(dir.path().join("timeline")));
        let config = SleepConfig {
            drowsy_grace: grace,
            ..SleepConfig::default()
        };
        let manager = Arc::new(SleepWakeManager::new(
            config,
            timeline,
            Arc::new(OperationsMetrics::new()),
        ));
        (dir, manager)
    }

    fn timeline_transitions(manager: &SleepWakeManager) -> Vec<(String, String)> {
        let mut events = manager
            .timeline
            .events_by_type(event::STATE_CHANGE, 50)
            .into_iter()
            .map(|e| {
                (
                    e.data["from"].as_str().unwrap_or("").to_string(),
                    e.data["to"].as_str().unwrap_or("").to_string(),
                )
            })
            .collect::<Vec<_>>();
        events.reverse(); // chronological
        events
    }

    #[test]
    fn test_initial_state_active() {
        let (_dir, manager) = make_manager(Duration::from_secs(60));
        assert_eq!(manager.get_state(), GaiaState::Active);
        assert!(!manager.wake_signal_pending());
    }

    #[test]
    fn test_should_transition_to_drowsy() {
        let (_dir, manager) = make_manager(Duration::from_secs(60));
        assert!(!manager.should_transition_to_drowsy(4.9));
        assert!(manager.should_transition_to_drowsy(5.0));
        assert!(manager.should_transition_to_drowsy(6.0));
    }

    #[test]
    fn test_wake_signal_while_active_is_noop() {
        let (_dir, manager) = make_manager(Duration::from_secs(60));
        let before = manager.get_status();
        manager.receive_wake_signal("discord");
        let after = manager.get_status();
        assert_eq!(before.state, after.state);
        assert_eq!(before.current_task, after.current_task);
        assert_eq!(before.wake_signal_pending, after.wake_signal_pending);
        assert!(!after.wake_signal_pending);
    }

    #[tokio::test]
    async fn test_drowsy_completes_into_asleep() {
        let (_dir, manager) = make_manager(Duration::from_millis(30));
        let completed = manager.initiate_drowsy().await;
        assert!(completed);
        assert_eq!(manager.get_state(), GaiaState::Asleep);

        let transitions = timeline_transitions(&manager);
        assert_eq!(
            transitions,
            vec![
                ("active".to_string(), "drowsy".to_string()),
                ("drowsy".to_string(), "asleep".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_wake_signal_cancels_drowsy() {
        let (_dir, manager) = make_manager(Duration::from_secs(10));

        let task = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.initiate_drowsy().await })
        };
        // Let the grace wait start, then cancel it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.get_state(), GaiaState::Drowsy);
        manager.receive_wake_signal("web");

        let completed = task.await.expect("join");
        assert!(!completed);
        assert_eq!(manager.get_state(), GaiaState::Active);
        assert!(!manager.wake_signal_pending());
    }

    #[tokio::test]
    async fn test_wake_during_asleep_interruptible() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_drowsy().await;
        manager.set_current_task(Some(CurrentTask {
            task_id: "t-1".to_string(),
            interruptible: true,
        }));

        manager.receive_wake_signal("discord");
        assert!(manager.wake_signal_pending());
        assert!(manager.phase().is_none());

        manager.set_current_task(None);
        assert!(manager.transition_to_waking());
        assert_eq!(manager.phase(), Some(TransientPhase::Waking));
        assert!(!manager.wake_signal_pending());

        let outcome = manager.complete_wake();
        assert_eq!(manager.get_state(), GaiaState::Active);
        assert!(manager.phase().is_none());
        assert!(!outcome.checkpoint_loaded);
    }

    #[tokio::test]
    async fn test_wake_during_non_interruptible_task_arms_finishing() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_drowsy().await;
        manager.set_current_task(Some(CurrentTask {
            task_id: "t-ni".to_string(),
            interruptible: false,
        }));

        manager.receive_wake_signal("discord");
        assert_eq!(manager.phase(), Some(TransientPhase::FinishingTask));
        // Still asleep for external observers.
        assert_eq!(manager.get_state(), GaiaState::Asleep);

        manager.set_current_task(None);
        assert!(manager.transition_to_waking());
        manager.complete_wake();

        let transitions = timeline_transitions(&manager);
        assert!(
            transitions.contains(&("asleep".to_string(), "finishing_task".to_string())),
            "{transitions:?}"
        );
        assert!(transitions.contains(&("finishing_task".to_string(), "waking".to_string())));
        assert!(transitions.contains(&("waking".to_string(), "active".to_string())));
    }

    #[tokio::test]
    async fn test_dreaming_roundtrip() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_drowsy().await;

        assert!(manager.enter_dreaming("h-1"));
        assert_eq!(manager.get_state(), GaiaState::Dreaming);
        // Already dreaming: a second enter is rejected.
        assert!(!manager.enter_dreaming("h-2"));

        assert!(manager.exit_dreaming());
        assert_eq!(manager.get_state(), GaiaState::Asleep);
    }

    #[tokio::test]
    async fn test_dreaming_rejected_unless_asleep() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        assert!(!manager.enter_dreaming("h-1"));
        assert_eq!(manager.get_state(), GaiaState::Active);
    }

    #[tokio::test]
    async fn test_distracted_roundtrip() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_drowsy().await;

        assert!(manager.enter_distracted());
        assert_eq!(manager.get_state(), GaiaState::Distracted);
        assert!(manager.exit_distracted());
        assert_eq!(manager.get_state(), GaiaState::Asleep);
    }

    #[test]
    fn test_canned_responses() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        // ACTIVE: no canned response.
        assert!(manager.get_canned_response().is_none());

        manager.initiate_offline();
        assert!(manager.get_canned_response().is_some());
    }

    #[tokio::test]
    async fn test_canned_response_for_distracted_and_dreaming() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_drowsy().await;
        assert!(manager.get_canned_response().is_none()); // ASLEEP wakes normally

        manager.enter_distracted();
        assert!(manager.get_canned_response().is_some());
        manager.exit_distracted();

        manager.enter_dreaming("h-1");
        assert!(manager.get_canned_response().is_some());
    }

    #[tokio::test]
    async fn test_offline_is_terminal() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        manager.initiate_offline();
        assert_eq!(manager.get_state(), GaiaState::Offline);

        // No transition out of OFFLINE.
        assert!(!manager.initiate_drowsy().await);
        manager.receive_wake_signal("web");
        assert!(!manager.wake_signal_pending());
        assert_eq!(manager.get_state(), GaiaState::Offline);
    }

    #[tokio::test]
    async fn test_seconds_in_state_resets_on_transition() {
        let (_dir, manager) = make_manager(Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.initiate_drowsy().await;
        let status = manager.get_status();
        assert_eq!(status.state, GaiaState::Asleep);
        assert!(status.seconds_in_state <= 1);
    }
}
