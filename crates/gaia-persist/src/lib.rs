//! JSON file persistence and shared-volume conventions for GAIA services.
//!
//! Provides [`StateFile`], a single-document JSON store with atomic
//! replace semantics (write temp + rename), the [`SharedDir`] layout of
//! the shared Docker volume, and the [`MaintenanceFlag`] sentinel used to
//! suppress HA failover and doctor remediation.

#![forbid(unsafe_code)]

use serde::{Serialize, de::DeserializeOwned};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt state file {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("serialize error: {0}")]
    Serialize(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PersistError>;

// ─── StateFile ────────────────────────────────────────────────────────────────

/// A single JSON document on disk, replaced atomically on every save.
///
/// The write goes to a `.tmp` sibling in the same directory and is then
/// renamed over the target, so readers never observe a partial document.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. Returns `Ok(None)` if the file does not exist;
    /// a file that exists but does not parse is an error (the caller
    /// decides whether starting fresh is acceptable).
    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no state file");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&content).map_err(|e| PersistError::Corrupt {
            path: self.path.display().to_string(),
            source: e,
        })?;
        Ok(Some(value))
    }

    /// Save the document atomically. Creates parent directories as needed.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(value).map_err(PersistError::Serialize)?;

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

// ─── Shared Directory Layout ──────────────────────────────────────────────────

/// Typed accessor for the shared-volume layout used across services.
///
/// ```text
/// <SHARED_DIR>/ha_maintenance          — maintenance-mode sentinel
/// <SHARED_DIR>/timeline/               — daily JSONL timeline files
/// <SHARED_DIR>/orchestrator/state.json — orchestrator persistent state
/// <SHARED_DIR>/doctor/status.json      — doctor status snapshot
/// ```
#[derive(Debug, Clone)]
pub struct SharedDir {
    root: PathBuf,
}

impl SharedDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from the `SHARED_DIR` environment variable, defaulting to
    /// `/shared` (the Docker volume mount point).
    pub fn from_env() -> Self {
        let root = std::env::var("SHARED_DIR").unwrap_or_else(|_| "/shared".to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn maintenance_flag(&self) -> MaintenanceFlag {
        MaintenanceFlag::new(self.root.join("ha_maintenance"))
    }

    pub fn timeline_dir(&self) -> PathBuf {
        self.root.join("timeline")
    }

    pub fn orchestrator_state(&self) -> StateFile {
        StateFile::new(self.root.join("orchestrator").join("state.json"))
    }

    pub fn doctor_status(&self) -> StateFile {
        StateFile::new(self.root.join("doctor").join("status.json"))
    }
}

// ─── Maintenance Flag ─────────────────────────────────────────────────────────

/// Operator-asserted sentinel file. Presence means maintenance mode:
/// HA failover and doctor remediation are suppressed.
#[derive(Debug, Clone)]
pub struct MaintenanceFlag {
    path: PathBuf,
}

impl MaintenanceFlag {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// True if maintenance mode is active. Readers tolerate transient
    /// absence of the shared directory itself.
    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    /// Assert maintenance mode (operator tooling and tests).
    pub fn set(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, b"")?;
        Ok(())
    }

    /// Clear maintenance mode. Clearing an absent flag is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to clear maintenance flag");
                Err(e.into())
            }
        }
    }
}
