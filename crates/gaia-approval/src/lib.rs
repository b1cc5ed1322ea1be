//! Pending-action registry with reversed-challenge human approval.
//!
//! Sensitive actions are parked here until an operator approves them by
//! supplying the challenge code **reversed** (a cheap proof the code was
//! read rather than echoed back). Entries expire after a TTL and are
//! reaped lazily on the next list or cleanup.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use gaia_observe::{OperationsMetrics, SharedMetrics};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const CHALLENGE_LEN: usize = 5;
const PROPOSAL_RENDER_LIMIT: usize = 2000;
const DEFAULT_TTL_SECS: i64 = 900;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ApprovalError {
    #[error("action not found")]
    NotFound,

    #[error("action expired")]
    Expired,

    #[error("invalid approval challenge")]
    InvalidChallenge,
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ─── Types ───────────────────────────────────────────────────────────────────

/// A sensitive action awaiting operator approval.
#[derive(Debug, Clone)]
struct PendingAction {
    method: String,
    params: serde_json::Value,
    challenge: String,
    proposal: String,
    created_at: DateTime<Utc>,
    expiry: DateTime<Utc>,
}

/// Receipt returned when a pending action is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingReceipt {
    pub action_id: Uuid,
    pub challenge: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

/// Operator-facing view of a pending action. The proposal is truncated
/// at render time; the stored entry keeps the full text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingView {
    pub action_id: Uuid,
    pub method: String,
    pub created_at: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
    pub proposal: String,
}

/// Payload handed back to the caller once an action is approved, so the
/// caller may execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovedAction {
    pub method: String,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ─── ApprovalStore ───────────────────────────────────────────────────────────

/// Mutex-guarded in-memory store of pending actions. Each `action_id` is
/// single-use: approve or cancel removes it.
pub struct ApprovalStore {
    store: Mutex<HashMap<Uuid, PendingAction>>,
    ttl: Duration,
    metrics: SharedMetrics,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::with_ttl_seconds(DEFAULT_TTL_SECS)
    }

    pub fn with_ttl_seconds(ttl_seconds: i64) -> Self {
        Self::with_metrics(ttl_seconds, Arc::new(OperationsMetrics::new()))
    }

    /// Share the embedding service's counters so approval activity shows
    /// up in its metrics snapshot.
    pub fn with_metrics(ttl_seconds: i64, metrics: SharedMetrics) -> Self {
        Self {
            store: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_seconds),
            metrics,
        }
    }

    fn gen_challenge() -> String {
        let mut rng = rand::thread_rng();
        (0..CHALLENGE_LEN)
            .map(|_| rng.gen_range(b'A'..=b'Z') as char)
            .collect()
    }

    /// Park an action for approval. When no proposal is supplied the
    /// params are pretty-printed for operator review.
    pub fn create_pending(
        &self,
        method: &str,
        params: serde_json::Value,
        proposal: Option<String>,
    ) -> PendingReceipt {
        let action_id = Uuid::new_v4();
        let challenge = Self::gen_challenge();
        let now = Utc::now();
        let expiry = now + self.ttl;

        let proposal = proposal.unwrap_or_else(|| {
            serde_json::to_string_pretty(&params).unwrap_or_else(|_| params.to_string())
        });

        let mut store = self.store.lock();
        store.insert(
            action_id,
            PendingAction {
                method: method.to_string(),
                params,
                challenge: challenge.clone(),
                proposal,
                created_at: now,
                expiry,
            },
        );

        self.metrics.approvals_created_total.inc();
        info!(%action_id, method, challenge, expiry = %expiry, "created pending action");

        PendingReceipt {
            action_id,
            challenge,
            created_at: now,
            expiry,
        }
    }

    /// List pending actions, reaping any past expiry.
    pub fn list_pending(&self) -> Vec<PendingView> {
        let now = Utc::now();
        let mut store = self.store.lock();
        store.retain(|_, item| item.expiry >= now);

        let mut views: Vec<PendingView> = store
            .iter()
            .map(|(id, item)| {
                let mut proposal = item.proposal.clone();
                if proposal.len() > PROPOSAL_RENDER_LIMIT {
                    let cut = proposal
                        .char_indices()
                        .find(|(i, _)| *i >= PROPOSAL_RENDER_LIMIT)
                        .map(|(i, _)| i)
                        .unwrap_or(proposal.len());
                    proposal.truncate(cut);
                    proposal.push_str("\n... [truncated]");
                }
                PendingView {
                    action_id: *id,
                    method: item.method.clone(),
                    created_at: item.created_at,
                    expiry: item.expiry,
                    proposal,
                }
            })
            .collect();
        views.sort_by_key(|v| v.created_at);
        views
    }

    /// Approve a pending action. The operator must supply the challenge
    /// **reversed**. On success the entry is consumed and its payload
    /// returned for execution.
    pub fn approve(&self, action_id: Uuid, provided_challenge: &str) -> Result<ApprovedAction> {
        let mut store = self.store.lock();
        let item = store.get(&action_id).ok_or(ApprovalError::NotFound)?;

        if Utc::now() > item.expiry {
            store.remove(&action_id);
            return Err(ApprovalError::Expired);
        }

        let expected: String = item.challenge.chars().rev().collect();
        if provided_challenge != expected {
            return Err(ApprovalError::InvalidChallenge);
        }

        let item = store.remove(&action_id).ok_or(ApprovalError::NotFound)?;
        self.metrics.approvals_approved_total.inc();
        info!(%action_id, method = %item.method, "approved action");

        Ok(ApprovedAction {
            method: item.method,
            params: item.params,
            created_at: item.created_at,
        })
    }

    /// Cancel a pending action. Returns false if it was not present.
    pub fn cancel(&self, action_id: Uuid) -> bool {
        let removed = self.store.lock().remove(&action_id).is_some();
        if removed {
            info!(%action_id, "cancelled action");
        }
        removed
    }

    /// Remove all expired actions; returns how many were reaped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut store = self.store.lock();
        let before = store.len();
        store.retain(|_, item| item.expiry >= now);
        let reaped = before - store.len();
        if reaped > 0 {
            info!(reaped, "cleaned up expired actions");
        }
        reaped
    }
}

impl Default for ApprovalStore {
    fn default() -> Self {
        Self::new()
    }
}
