//! Observability primitives for the GAIA control plane.
//!
//! Provides:
//! - [`OperationsMetrics`] — atomic counters for control-plane operations
//! - [`NotificationManager`] — broadcast pub-sub used for HA status
//!   transitions and handoff completions

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

// ─────────────────────────────────────────────────────────────
// Atomic Counter
// ─────────────────────────────────────────────────────────────

/// A thread-safe u64 counter backed by an atomic.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

// ─────────────────────────────────────────────────────────────
// Operations Metrics
// ─────────────────────────────────────────────────────────────

/// Atomic operation counters for the control plane.
///
/// All counters are thread-safe and shared via [`Arc`].
#[derive(Debug, Default)]
pub struct OperationsMetrics {
    /// Total sleep/wake state transitions recorded.
    pub state_transitions_total: Counter,
    /// Total wake signals received (including idempotent ones).
    pub wake_signals_total: Counter,
    /// Total sleep task executions (success + failure).
    pub sleep_tasks_total: Counter,
    /// Total sleep task executions that failed.
    pub sleep_task_errors: Counter,
    /// Total GPU custody changes (sleep, wake, handoff phases).
    pub gpu_handoffs_total: Counter,
    /// Total health check probes performed.
    pub health_checks_total: Counter,
    /// Total HA status transitions observed.
    pub ha_transitions_total: Counter,
    /// Total doctor remediation attempts.
    pub remediations_total: Counter,
    /// Total approval actions created.
    pub approvals_created_total: Counter,
    /// Total approval actions approved.
    pub approvals_approved_total: Counter,
}

impl OperationsMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot all counters as (name, value) pairs.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("state_transitions_total", self.state_transitions_total.get()),
            ("wake_signals_total", self.wake_signals_total.get()),
            ("sleep_tasks_total", self.sleep_tasks_total.get()),
            ("sleep_task_errors", self.sleep_task_errors.get()),
            ("gpu_handoffs_total", self.gpu_handoffs_total.get()),
            ("health_checks_total", self.health_checks_total.get()),
            ("ha_transitions_total", self.ha_transitions_total.get()),
            ("remediations_total", self.remediations_total.get()),
            ("approvals_created_total", self.approvals_created_total.get()),
            ("approvals_approved_total", self.approvals_approved_total.get()),
        ]
    }
}

/// Shared reference to the metrics (cheap to clone).
pub type SharedMetrics = Arc<OperationsMetrics>;

// ─────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────

/// A typed event fanned out to subscribers (web/SSE surfaces, tests).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub data: serde_json::Value,
    pub ts: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: &str, data: serde_json::Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            ts: Utc::now(),
        }
    }
}

/// Fire-and-forget pub-sub over a broadcast channel.
///
/// Broadcasting with no subscribers is fine; subscribers that lag past
/// the channel capacity miss events rather than blocking the producer.
#[derive(Debug, Clone)]
pub struct NotificationManager {
    tx: broadcast::Sender<Notification>,
}

impl NotificationManager {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn broadcast(&self, notification: Notification) {
        let kind = notification.kind.clone();
        match self.tx.send(notification) {
            Ok(receivers) => debug!(kind, receivers, "notification broadcast"),
            Err(_) => debug!(kind, "notification dropped (no subscribers)"),
        }
    }
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new(64)
    }
}
