//! Append-only JSONL event log for GAIA's temporal self-awareness.
//!
//! Events are appended as single JSON lines to daily-rotated files:
//! `<timeline_dir>/gaia_timeline_2026-02-18.jsonl`. Appends of short lines
//! are atomic on POSIX, so concurrent writers need no cross-line locking;
//! readers tolerate a partial tail by skipping malformed lines.
//!
//! Telemetry must never crash a caller: every write and read failure is
//! logged and swallowed.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Well-known event type names.
pub mod event {
    pub const STATE_CHANGE: &str = "state_change";
    pub const SESSION_START: &str = "session_start";
    pub const MESSAGE: &str = "message";
    pub const TASK_EXEC: &str = "task_exec";
    pub const CHECKPOINT: &str = "checkpoint";
    pub const GPU_HANDOFF: &str = "gpu_handoff";
    pub const CODE_EVOLUTION: &str = "code_evolution";
    pub const COUNCIL_NOTE: &str = "council_note";
}

// ─── TimelineEvent ────────────────────────────────────────────────────────────

/// A single temporal event. `ts` is ISO-8601 UTC, which sorts
/// lexicographically in timestamp order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub ts: String,
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TimelineEvent {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn from_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

/// Per-session message statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub message_count: usize,
    pub first_message: Option<String>,
    pub last_message: Option<String>,
}

// ─── TimelineStore ────────────────────────────────────────────────────────────

/// Append-only JSONL event store with daily file rotation.
pub struct TimelineStore {
    dir: PathBuf,
}

impl TimelineStore {
    pub fn new(timeline_dir: impl Into<PathBuf>) -> Self {
        let dir = timeline_dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            debug!(dir = %dir.display(), error = %e, "cannot create timeline dir");
        }
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ─── Write API ────────────────────────────────────────────────────────

    /// Append a single event to today's file. Failures are logged and
    /// swallowed.
    pub fn append(&self, event_type: &str, data: serde_json::Value) {
        let event = TimelineEvent {
            ts: Utc::now().to_rfc3339(),
            event: event_type.to_string(),
            data,
        };
        let Ok(line) = serde_json::to_string(&event) else {
            debug!(event = event_type, "timeline event not serializable");
            return;
        };
        let path = self.file_for_date(Utc::now());
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut fh| writeln!(fh, "{line}"));
        if let Err(e) = result {
            debug!(path = %path.display(), error = %e, "timeline append failed");
        }
    }

    // ─── Read API ─────────────────────────────────────────────────────────

    /// Last N events across today + yesterday, newest first.
    pub fn recent_events(&self, limit: usize) -> Vec<TimelineEvent> {
        let mut events = self.read_recent_files(2);
        events.truncate(limit);
        events
    }

    /// Last N events of a specific type, newest first.
    pub fn events_by_type(&self, event_type: &str, limit: usize) -> Vec<TimelineEvent> {
        self.read_recent_files(2)
            .into_iter()
            .filter(|e| e.event == event_type)
            .take(limit)
            .collect()
    }

    /// All events after a given instant, up to `limit`, newest first.
    /// Opens as many daily files as the range spans, capped at 7.
    pub fn events_since(&self, since: DateTime<Utc>, limit: usize) -> Vec<TimelineEvent> {
        let days = (Utc::now() - since).num_days().max(0) as usize + 1;
        self.read_recent_files(days.min(7))
            .into_iter()
            .filter(|e| e.timestamp().is_some_and(|ts| ts >= since))
            .take(limit)
            .collect()
    }

    /// Most recent event of the given type, if any.
    pub fn last_event_of_type(&self, event_type: &str) -> Option<TimelineEvent> {
        self.events_by_type(event_type, 1).into_iter().next()
    }

    /// Seconds spent in each state over the last N hours, reduced from
    /// consecutive `state_change` events. The open interval of the
    /// current state ends at `now`.
    pub fn state_duration_stats(&self, hours: i64) -> HashMap<String, f64> {
        let since = Utc::now() - Duration::hours(hours);
        let mut changes: Vec<TimelineEvent> = self
            .events_since(since, 500)
            .into_iter()
            .filter(|e| e.event == event::STATE_CHANGE)
            .collect();
        // events_since returns newest first; reduce in chronological order
        changes.reverse();

        let mut stats: HashMap<String, f64> = HashMap::new();
        let now = Utc::now();

        for (i, change) in changes.iter().enumerate() {
            let Some(start) = change.timestamp() else {
                continue;
            };
            let state = change
                .data
                .get("to")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            let end = changes
                .get(i + 1)
                .and_then(|next| next.timestamp())
                .unwrap_or(now);
            let duration = (end - start).num_milliseconds() as f64 / 1000.0;
            *stats.entry(state).or_insert(0.0) += duration;
        }

        stats
    }

    /// Message count and first/last message time for a session, over the
    /// last week of files.
    pub fn session_stats(&self, session_id: &str) -> SessionStats {
        let mut messages: Vec<TimelineEvent> = self
            .read_recent_files(7)
            .into_iter()
            .filter(|e| {
                e.event == event::MESSAGE
                    && e.data.get("session_id").and_then(|v| v.as_str()) == Some(session_id)
            })
            .collect();
        messages.reverse(); // chronological

        SessionStats {
            session_id: session_id.to_string(),
            message_count: messages.len(),
            first_message: messages.first().map(|e| e.ts.clone()),
            last_message: messages.last().map(|e| e.ts.clone()),
        }
    }

    // ─── Internal ─────────────────────────────────────────────────────────

    fn file_for_date(&self, dt: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("gaia_timeline_{}.jsonl", dt.format("%Y-%m-%d")))
    }

    /// Read today + recent daily files; events sorted newest first.
    /// Malformed lines (including a torn tail) are skipped.
    fn read_recent_files(&self, max_days: usize) -> Vec<TimelineEvent> {
        let mut events = Vec::new();
        let now = Utc::now();

        for day_offset in 0..max_days {
            let path = self.file_for_date(now - Duration::days(day_offset as i64));
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            events.extend(
                content
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .filter_map(TimelineEvent::from_line),
            );
        }

        events.sort_by(|a, b| b.ts.cmp(&a.ts));
        events
    }
}
