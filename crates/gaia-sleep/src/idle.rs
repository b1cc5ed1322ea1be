//! Idle detection: minutes since the last externally-recorded activity.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Tracks the last user-visible activity (message, command, session
/// start). Surfaces record activity; the sleep cycle loop reads idle
/// minutes from it.
pub struct IdleMonitor {
    last_activity: RwLock<DateTime<Utc>>,
}

impl IdleMonitor {
    pub fn new() -> Self {
        Self {
            last_activity: RwLock::new(Utc::now()),
        }
    }

    /// Record activity now.
    pub fn record_activity(&self) {
        *self.last_activity.write() = Utc::now();
    }

    /// Backdate the last activity (tests and replay).
    pub fn set_last_activity(&self, at: DateTime<Utc>) {
        *self.last_activity.write() = at;
    }

    /// Minutes since the last recorded activity.
    pub fn idle_minutes(&self) -> f64 {
        let last = *self.last_activity.read();
        (Utc::now() - last).num_milliseconds().max(0) as f64 / 60_000.0
    }
}

impl Default for IdleMonitor {
    fn default() -> Self {
        Self::new()
    }
}
