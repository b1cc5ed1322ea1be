//! GPU lease orchestrator.
//!
//! A separate process that owns the single writer of the persistent
//! orchestrator state: GPU custody, the active handoff, and the handoff
//! history. Other services observe and request custody changes over HTTP;
//! nothing else touches `state.json`.

#![forbid(unsafe_code)]

pub mod containers;
pub mod http;
pub mod state;

pub use containers::{ComposeControl, ContainerControl, wait_healthy};
pub use state::{StateError, StateManager};

use std::time::Duration;

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Compose service name of the live Prime container.
    pub prime_service: String,
    /// Health endpoint polled after booting Prime.
    pub prime_health_url: String,
    /// How long to wait for Prime to come up healthy on wake.
    pub wake_deadline: Duration,
    /// Poll interval while waiting for Prime health.
    pub wake_poll_interval: Duration,
    /// A handoff stuck in one phase longer than this is failed by the
    /// internal timer.
    pub phase_deadline: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            prime_service: "gaia-prime".to_string(),
            prime_health_url: "http://gaia-prime:7777/health".to_string(),
            wake_deadline: Duration::from_secs(180),
            wake_poll_interval: Duration::from_secs(2),
            phase_deadline: Duration::from_secs(300),
        }
    }
}
