//! Protocol types for the GAIA control plane.
//!
//! Defines the state, lease, handoff, and health types shared between
//! gaia-core, the GPU orchestrator, the health watchdog, and the doctor,
//! plus the request/response bodies of their HTTP surfaces.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

// ─── Sleep/Wake States ────────────────────────────────────────────────────────

/// Externally visible lifecycle states of a GAIA core service.
///
/// Exactly one state holds at a time; every change is appended to the
/// timeline as a `state_change` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GaiaState {
    Active,
    Drowsy,
    Asleep,
    Dreaming,
    Distracted,
    Offline,
}

impl GaiaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Drowsy => "drowsy",
            Self::Asleep => "asleep",
            Self::Dreaming => "dreaming",
            Self::Distracted => "distracted",
            Self::Offline => "offline",
        }
    }
}

impl std::fmt::Display for GaiaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Transient phases internal to the sleep/wake manager.
///
/// While one of these is set, `GaiaState` remains `Asleep` for external
/// observers; the phase names still appear in timeline transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientPhase {
    FinishingTask,
    Waking,
}

impl TransientPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FinishingTask => "finishing_task",
            Self::Waking => "waking",
        }
    }
}

/// A single recorded state transition.
///
/// `from`/`to` are state or phase labels (`"asleep"`, `"waking"`, ...) so
/// that transient phases can be journaled without widening [`GaiaState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: String,
    pub to: String,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A wake request received while drowsy or asleep. At most one is pending;
/// it is consumed on the transition to WAKING.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeSignal {
    pub received_at: DateTime<Utc>,
    pub source: String,
}

/// The task currently executing under the sleep cycle loop, as far as the
/// sleep/wake manager needs to know it (interruptibility decides whether a
/// wake signal must wait for FINISHING_TASK).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentTask {
    pub task_id: String,
    pub interruptible: bool,
}

// ─── GPU Custody ──────────────────────────────────────────────────────────────

/// Which container currently owns the GPU. Exactly one owner at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GpuOwner {
    #[default]
    None,
    Core,
    Study,
    CandidateCore,
    CandidateStudy,
}

impl std::fmt::Display for GpuOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Core => "core",
            Self::Study => "study",
            Self::CandidateCore => "candidate_core",
            Self::CandidateStudy => "candidate_study",
        };
        write!(f, "{s}")
    }
}

/// The record asserting current GPU custody. Zero or one active lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuLease {
    pub lease_id: Uuid,
    pub owner: GpuOwner,
    pub reason: String,
    pub acquired_at: DateTime<Utc>,
}

/// GPU slot inside [`PersistentState`]: the owner plus the flattened lease
/// fields as they appear on disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GpuSlot {
    pub owner: GpuOwner,
    pub lease_id: Option<Uuid>,
    pub reason: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub queue: Vec<String>,
}

// ─── Handoffs ─────────────────────────────────────────────────────────────────

/// The three multi-phase GPU custody transfers the orchestrator performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffType {
    PrimeToStudy,
    StudyToPrime,
    CandidateSwap,
}

impl std::fmt::Display for HandoffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PrimeToStudy => "prime_to_study",
            Self::StudyToPrime => "study_to_prime",
            Self::CandidateSwap => "candidate_swap",
        };
        write!(f, "{s}")
    }
}

/// Handoff lifecycle phases. Transitions are forward-only except to
/// `Failed`, which is reachable from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandoffPhase {
    Initiated,
    ReleasingGpu,
    BootingTarget,
    Verifying,
    Completed,
    Failed,
}

impl HandoffPhase {
    /// Position in the forward sequence. `Failed` sits alongside
    /// `Completed` as a terminal sink.
    fn ordinal(&self) -> u8 {
        match self {
            Self::Initiated => 0,
            Self::ReleasingGpu => 1,
            Self::BootingTarget => 2,
            Self::Verifying => 3,
            Self::Completed => 4,
            Self::Failed => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// True if a handoff in `self` may advance to `next`.
    pub fn can_advance_to(&self, next: HandoffPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == HandoffPhase::Failed {
            return true;
        }
        next.ordinal() > self.ordinal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::ReleasingGpu => "releasing_gpu",
            Self::BootingTarget => "booting_target",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for HandoffPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A multi-phase transfer of GPU custody between services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handoff {
    pub handoff_id: String,
    pub handoff_type: HandoffType,
    pub phase: HandoffPhase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub source: String,
    pub destination: String,
    pub error: Option<String>,
    pub progress_pct: u8,
}

// ─── Persistent Orchestrator State ────────────────────────────────────────────

/// The orchestrator's full persisted state. Single writer; written
/// atomically (temp + rename) after every mutation.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PersistentState {
    pub gpu: GpuSlot,
    #[serde(default)]
    pub containers: ContainerSets,
    pub active_handoff: Option<Handoff>,
    #[serde(default)]
    pub handoff_history: Vec<Handoff>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Per-deployment container metadata, keyed by container name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContainerSets {
    #[serde(default)]
    pub live: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub candidate: HashMap<String, serde_json::Value>,
}

// ─── Health & HA ──────────────────────────────────────────────────────────────

/// Health bookkeeping for one polled service.
///
/// `healthy` is `None` until the first check completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealth {
    pub healthy: Option<bool>,
    pub last_check: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub can_remediate: bool,
}

impl ServiceHealth {
    pub fn new(can_remediate: bool) -> Self {
        Self {
            healthy: None,
            last_check: None,
            consecutive_failures: 0,
            can_remediate,
        }
    }
}

/// High-availability status, derived purely from live + candidate health
/// plus the maintenance flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaStatus {
    Active,
    Degraded,
    FailoverActive,
    Failed,
}

impl std::fmt::Display for HaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Degraded => "degraded",
            Self::FailoverActive => "failover_active",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

// ─── HTTP Bodies: core service ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeResponse {
    pub received: bool,
    pub state: GaiaState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SleepStatus {
    pub state: GaiaState,
    pub seconds_in_state: u64,
    pub current_task: Option<CurrentTask>,
    pub wake_signal_pending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyHandoffRequest {
    pub direction: HandoffType,
    pub handoff_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyHandoffResponse {
    pub accepted: bool,
    pub state: GaiaState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistractedCheckResponse {
    pub state: GaiaState,
    pub canned_response: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownResponse {
    pub accepted: bool,
    pub state: GaiaState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl HealthResponse {
    pub fn healthy(service: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            service: service.to_string(),
        }
    }
}

// ─── HTTP Bodies: orchestrator ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuSleepRequest {
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffStartRequest {
    #[serde(rename = "type")]
    pub handoff_type: HandoffType,
    pub source: String,
    pub destination: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandoffAdvanceRequest {
    pub handoff_id: String,
    pub phase: HandoffPhase,
}
