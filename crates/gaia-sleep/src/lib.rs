//! Sleep/wake orchestration for gaia-core.
//!
//! Owns the sleep/wake state machine ([`SleepWakeManager`]), the
//! idle-time maintenance scheduler ([`SleepTaskScheduler`]), and the
//! long-lived [`SleepCycleLoop`] that drives both from idle and resource
//! signals. GPU custody changes and presence updates go through narrow
//! trait seams so the loop carries no service wiring of its own.

#![forbid(unsafe_code)]

mod cycle;
mod idle;
mod manager;
mod resource;
mod scheduler;

pub use cycle::{
    GpuCustodian, HttpGpuCustodian, HttpPresenceSink, NoopPresenceSink, Presence, PresenceSink,
    SleepCycleLoop,
};
pub use idle::IdleMonitor;
pub use manager::{SleepWakeManager, WakeOutcome};
pub use resource::{LoadAvgProbe, ResourceMonitor, UtilizationProbe};
pub use scheduler::{NextTask, SleepTask, SleepTaskHandler, SleepTaskScheduler, TaskStatusView};

use std::time::Duration;

/// Tunables for the sleep/wake subsystem. The sites that consume these
/// vary in upstream deployments, so every knob is explicit here.
#[derive(Debug, Clone)]
pub struct SleepConfig {
    /// Master switch; when false the core never drifts off.
    pub sleep_enabled: bool,
    /// Minutes of idle time before ACTIVE turns DROWSY.
    pub idle_threshold_minutes: f64,
    /// Grace window in DROWSY during which a wake signal cancels sleep.
    pub drowsy_grace: Duration,
    /// Poll period while ACTIVE / DREAMING.
    pub poll_active: Duration,
    /// Poll period while ASLEEP / DISTRACTED (react fast to wake signals).
    pub poll_asleep: Duration,
    /// Cooldown after an errored tick.
    pub error_cooldown: Duration,
    /// Interval between load rechecks while DISTRACTED.
    pub distracted_recheck: Duration,
}

impl Default for SleepConfig {
    fn default() -> Self {
        Self {
            sleep_enabled: true,
            idle_threshold_minutes: 5.0,
            drowsy_grace: Duration::from_secs(60),
            poll_active: Duration::from_secs(10),
            poll_asleep: Duration::from_secs(2),
            error_cooldown: Duration::from_secs(15),
            distracted_recheck: Duration::from_secs(300),
        }
    }
}
