//! The sleep cycle loop: a long-lived worker that reads idle and
//! resource signals, drives the sleep/wake manager, and runs sleep tasks
//! while asleep.
//!
//! GPU custody changes and presence updates are best-effort effects
//! behind trait seams; their failure never blocks a state transition.

use async_trait::async_trait;
use gaia_client::ServiceClient;
use gaia_proto::{CurrentTask, GaiaState, TransientPhase};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{IdleMonitor, ResourceMonitor, SleepConfig, SleepTaskScheduler, SleepWakeManager};

// ─── Effect Seams ─────────────────────────────────────────────────────────────

/// Release/reclaim of the GPU around sleep and wake, performed by the
/// orchestrator on the loop's behalf.
#[async_trait]
pub trait GpuCustodian: Send + Sync {
    async fn release_for_sleep(&self, reason: &str) -> anyhow::Result<()>;
    async fn reclaim_for_wake(&self) -> anyhow::Result<()>;
}

/// HTTP custodian calling the orchestrator's `/gpu/*` endpoints.
pub struct HttpGpuCustodian {
    client: ServiceClient,
}

impl HttpGpuCustodian {
    pub fn new(client: ServiceClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl GpuCustodian for HttpGpuCustodian {
    async fn release_for_sleep(&self, reason: &str) -> anyhow::Result<()> {
        self.client
            .post("/gpu/sleep", serde_json::json!({"reason": reason}))
            .await?;
        Ok(())
    }

    async fn reclaim_for_wake(&self) -> anyhow::Result<()> {
        self.client.post("/gpu/wake", serde_json::json!({})).await?;
        Ok(())
    }
}

/// Presence status shown on the external surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presence {
    /// Reset to the dynamic idle status.
    Reset,
    /// Visible activity text with an idle (sleeping) dot.
    Sleeping(String),
    /// Visible activity text with a do-not-disturb dot.
    Busy(String),
    /// Plain activity text, online dot.
    Activity(String),
    /// Invisible (offline).
    Offline,
}

/// Best-effort presence updates; implementations must never block the
/// loop on failure.
#[async_trait]
pub trait PresenceSink: Send + Sync {
    async fn update(&self, presence: Presence);
}

/// SOA-mode sink: POST `/presence` on the web service. Errors are logged
/// at debug and dropped.
pub struct HttpPresenceSink {
    web_url: String,
    http: reqwest::Client,
}

impl HttpPresenceSink {
    pub fn new(web_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            web_url: web_url.trim_end_matches('/').to_string(),
            http,
        }
    }
}

#[async_trait]
impl PresenceSink for HttpPresenceSink {
    async fn update(&self, presence: Presence) {
        let payload = match presence {
            Presence::Reset => serde_json::json!({"activity": "over the studio"}),
            Presence::Sleeping(text) => serde_json::json!({"activity": text, "status": "idle"}),
            Presence::Busy(text) => serde_json::json!({"activity": text, "status": "dnd"}),
            Presence::Activity(text) => serde_json::json!({"activity": text}),
            Presence::Offline => {
                serde_json::json!({"activity": "over the studio", "status": "invisible"})
            }
        };
        let url = format!("{}/presence", self.web_url);
        if let Err(e) = self.http.post(&url).json(&payload).send().await {
            debug!(url = %url, error = %e, "presence update failed");
        }
    }
}

/// Monolith/test sink that drops updates.
pub struct NoopPresenceSink;

#[async_trait]
impl PresenceSink for NoopPresenceSink {
    async fn update(&self, _presence: Presence) {}
}

// ─── SleepCycleLoop ───────────────────────────────────────────────────────────

/// Long-lived worker driving the sleep/wake manager.
///
/// Polling cadence is state-dependent: ACTIVE uses the long period,
/// ASLEEP and DISTRACTED the short one so wake signals are serviced
/// promptly. Every tick is fenced; an errored tick logs and backs off
/// for the error cooldown instead of killing the loop.
pub struct SleepCycleLoop {
    config: SleepConfig,
    manager: Arc<SleepWakeManager>,
    scheduler: tokio::sync::Mutex<SleepTaskScheduler>,
    idle: Arc<IdleMonitor>,
    resources: Arc<ResourceMonitor>,
    custodian: Arc<dyn GpuCustodian>,
    presence: Arc<dyn PresenceSink>,
    last_distracted_recheck: Mutex<Option<Instant>>,
}

impl SleepCycleLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SleepConfig,
        manager: Arc<SleepWakeManager>,
        scheduler: SleepTaskScheduler,
        idle: Arc<IdleMonitor>,
        resources: Arc<ResourceMonitor>,
        custodian: Arc<dyn GpuCustodian>,
        presence: Arc<dyn PresenceSink>,
    ) -> Self {
        Self {
            config,
            manager,
            scheduler: tokio::sync::Mutex::new(scheduler),
            idle,
            resources,
            custodian,
            presence,
            last_distracted_recheck: Mutex::new(None),
        }
    }

    /// Run until shutdown is signalled or the manager goes OFFLINE.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("sleep cycle loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let state = self.manager.get_state();
            if state == GaiaState::Offline {
                break;
            }

            let delay = match self.tick_once().await {
                Ok(()) => match self.manager.get_state() {
                    GaiaState::Asleep | GaiaState::Distracted => self.config.poll_asleep,
                    _ => self.config.poll_active,
                },
                Err(e) => {
                    error!(error = %e, "sleep cycle tick failed");
                    self.config.error_cooldown
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!("sleep cycle loop stopped");
    }

    /// One tick of the loop. Public so tests can drive the loop
    /// deterministically.
    pub async fn tick_once(&self) -> anyhow::Result<()> {
        match self.manager.get_state() {
            GaiaState::Active => self.handle_active().await,
            GaiaState::Asleep => self.handle_asleep().await,
            GaiaState::Dreaming => self.handle_dreaming().await,
            GaiaState::Distracted => self.handle_distracted().await,
            // DROWSY resolves inside initiate_drowsy; OFFLINE ends the loop.
            GaiaState::Drowsy | GaiaState::Offline => {}
        }
        Ok(())
    }

    // ─── Per-state handlers ───────────────────────────────────────────────

    async fn handle_active(&self) {
        let idle_minutes = self.idle.idle_minutes();
        if !self.manager.should_transition_to_drowsy(idle_minutes) {
            return;
        }

        info!(idle_minutes, "idle: entering drowsy");
        self.presence
            .update(Presence::Activity("drifting off...".to_string()))
            .await;

        if self.manager.initiate_drowsy().await {
            self.release_gpu_for_sleep().await;
            self.presence
                .update(Presence::Sleeping("sleeping...".to_string()))
                .await;
        } else {
            // Cancelled inside the grace window.
            self.presence.update(Presence::Reset).await;
        }
    }

    async fn handle_asleep(&self) {
        // Transient phases first.
        match self.manager.phase() {
            Some(TransientPhase::FinishingTask) => {
                if self.manager.current_task().is_none() {
                    self.manager.transition_to_waking();
                }
                return;
            }
            Some(TransientPhase::Waking) => {
                self.presence
                    .update(Presence::Activity("waking up...".to_string()))
                    .await;
                self.reclaim_gpu_for_wake().await;
                let outcome = self.manager.complete_wake();
                if outcome.checkpoint_loaded {
                    info!("context restored from checkpoint");
                }
                self.presence.update(Presence::Reset).await;
                return;
            }
            None => {}
        }

        // Sustained host load shifts us aside.
        if self.resources.is_distracted() {
            if self.manager.enter_distracted() {
                self.presence
                    .update(Presence::Busy("occupied...".to_string()))
                    .await;
            }
            return;
        }

        // A signal that arrived between ticks with no task running.
        if self.manager.wake_signal_pending() {
            self.manager.transition_to_waking();
            return;
        }

        // Normal ASLEEP: run the next maintenance task.
        let next = self.scheduler.lock().await.get_next_task();
        let Some(task) = next else {
            return;
        };

        self.manager.set_current_task(Some(CurrentTask {
            task_id: task.task_id.clone(),
            interruptible: task.interruptible,
        }));
        self.presence
            .update(Presence::Sleeping(format!("sleeping: {}", task.task_type)))
            .await;

        self.scheduler.lock().await.execute_task(&task.task_id).await;

        self.manager.set_current_task(None);

        if self.manager.wake_signal_pending() {
            self.manager.transition_to_waking();
        }
    }

    async fn handle_dreaming(&self) {
        // Driven by orchestrator HTTP calls; no local work, no tasks.
        self.presence
            .update(Presence::Busy("studying...".to_string()))
            .await;
    }

    async fn handle_distracted(&self) {
        let due = {
            let mut last = self.last_distracted_recheck.lock();
            match *last {
                Some(at) if at.elapsed() < self.config.distracted_recheck => false,
                _ => {
                    *last = Some(Instant::now());
                    true
                }
            }
        };
        if !due {
            return;
        }

        if self.resources.check_and_clear().await {
            self.manager.exit_distracted();
            self.presence
                .update(Presence::Sleeping("sleeping...".to_string()))
                .await;
        }
    }

    // ─── GPU effects (best-effort) ────────────────────────────────────────

    async fn release_gpu_for_sleep(&self) {
        match self.custodian.release_for_sleep("sleep_cycle").await {
            Ok(()) => info!("gpu released for sleep"),
            Err(e) => warn!(error = %e, "orchestrator unreachable, sleeping without gpu release"),
        }
    }

    async fn reclaim_gpu_for_wake(&self) {
        match self.custodian.reclaim_for_wake().await {
            Ok(()) => info!("gpu reclaimed on wake"),
            Err(e) => warn!(error = %e, "orchestrator unreachable, waking without gpu"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SleepTask, SleepTaskHandler, UtilizationProbe};
    use gaia_observe::OperationsMetrics;
    use gaia_timeline::TimelineStore;

    struct MockCustodian {
        releases: Mutex<u32>,
        reclaims: Mutex<u32>,
    }

    impl MockCustodian {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                releases: Mutex::new(0),
                reclaims: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl GpuCustodian for MockCustodian {
        async fn release_for_sleep(&self, _reason: &str) -> anyhow::Result<()> {
            *self.releases.lock() += 1;
            Ok(())
        }

        async fn reclaim_for_wake(&self) -> anyhow::Result<()> {
            *self.reclaims.lock() += 1;
            Ok(())
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl SleepTaskHandler for NoopHandler {
        async fn run(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct IdleProbe;

    impl UtilizationProbe for IdleProbe {
        fn sample(&self) -> Option<f32> {
            Some(1.0)
        }
    }

    struct TestRig {
        _dir: tempfile::TempDir,
        cycle: Arc<SleepCycleLoop>,
        manager: Arc<SleepWakeManager>,
        custodian: Arc<MockCustodian>,
        idle: Arc<IdleMonitor>,
    }

    fn make_rig(with_task: bool) -> TestRig {
        let dir = tempfile::tempdir().expect("tempdir");
        let timeline = Arc::new(TimelineStore::new(dir.path().join("timeline")));
        let metrics = Arc::new(OperationsMetrics::new());
        let config = SleepConfig {
            idle_threshold_minutes: 5.0,
            drowsy_grace: Duration::from_millis(20),
            ..SleepConfig::default()
        };

        let manager = Arc::new(SleepWakeManager::new(
            config.clone(),
            timeline.clone(),
            metrics.clone(),
        ));
        let mut scheduler = SleepTaskScheduler::new(timeline, metrics);
        if with_task {
            scheduler.register_task(SleepTask::new(
                "noop",
                "noop",
                1,
                true,
                1,
                Arc::new(NoopHandler),
            ));
        }

        let idle = Arc::new(IdleMonitor::new());
        let resources = Arc::new(ResourceMonitor::new(Arc::new(IdleProbe)));
        let custodian = MockCustodian::new();

        let cycle = Arc::new(SleepCycleLoop::new(
            config,
            manager.clone(),
            scheduler,
            idle.clone(),
            resources,
            custodian.clone(),
            Arc::new(NoopPresenceSink),
        ));

        TestRig {
            _dir: dir,
            cycle,
            manager,
            custodian,
            idle,
        }
    }

    #[tokio::test]
    async fn test_idle_tick_falls_asleep_and_releases_gpu() {
        let rig = make_rig(false);
        rig.idle
            .set_last_activity(chrono::Utc::now() - chrono::Duration::minutes(6));

        rig.cycle.tick_once().await.expect("tick");

        assert_eq!(rig.manager.get_state(), GaiaState::Asleep);
        assert_eq!(*rig.custodian.releases.lock(), 1);
    }

    #[tokio::test]
    async fn test_active_and_busy_stays_active() {
        let rig = make_rig(false);
        // Fresh activity: not idle.
        rig.cycle.tick_once().await.expect("tick");
        assert_eq!(rig.manager.get_state(), GaiaState::Active);
        assert_eq!(*rig.custodian.releases.lock(), 0);
    }

    #[tokio::test]
    async fn test_asleep_runs_task_then_services_wake_signal() {
        let rig = make_rig(true);
        rig.idle
            .set_last_activity(chrono::Utc::now() - chrono::Duration::minutes(6));
        rig.cycle.tick_once().await.expect("tick"); // falls asleep

        rig.manager.receive_wake_signal("test");
        rig.cycle.tick_once().await.expect("tick"); // runs task, arms waking
        // Wake signal serviced after the task: phase is WAKING.
        assert_eq!(rig.manager.phase(), Some(TransientPhase::Waking));

        rig.cycle.tick_once().await.expect("tick"); // completes wake
        assert_eq!(rig.manager.get_state(), GaiaState::Active);
        assert!(rig.manager.phase().is_none());
        assert_eq!(*rig.custodian.reclaims.lock(), 1);
    }

    #[tokio::test]
    async fn test_wake_without_tasks() {
        let rig = make_rig(false);
        rig.idle
            .set_last_activity(chrono::Utc::now() - chrono::Duration::minutes(6));
        rig.cycle.tick_once().await.expect("tick"); // asleep

        rig.manager.receive_wake_signal("test");
        rig.cycle.tick_once().await.expect("tick"); // pending → waking
        rig.cycle.tick_once().await.expect("tick"); // waking → active

        assert_eq!(rig.manager.get_state(), GaiaState::Active);
        assert_eq!(*rig.custodian.reclaims.lock(), 1);
    }

    #[tokio::test]
    async fn test_current_task_cleared_after_execution() {
        let rig = make_rig(true);
        rig.idle
            .set_last_activity(chrono::Utc::now() - chrono::Duration::minutes(6));
        rig.cycle.tick_once().await.expect("tick"); // asleep
        rig.cycle.tick_once().await.expect("tick"); // runs the task

        assert!(rig.manager.current_task().is_none());
    }

    #[tokio::test]
    async fn test_loop_exits_on_shutdown_signal() {
        let rig = make_rig(false);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(rig.cycle.clone().run(rx));
        tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop exits")
            .expect("join");
    }

    #[tokio::test]
    async fn test_loop_exits_when_offline() {
        let rig = make_rig(false);
        rig.manager.initiate_offline();
        let (_tx, rx) = watch::channel(false);

        tokio::time::timeout(Duration::from_secs(2), rig.cycle.clone().run(rx))
            .await
            .expect("loop exits");
    }
}
