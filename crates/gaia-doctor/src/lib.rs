//! gaia-doctor — persistent HA watchdog.
//!
//! Polls critical GAIA services and restarts crashed HA candidates via
//! docker compose with the HA overlay. Remediation is rate-limited by a
//! per-service cooldown (which applies whether or not the restart
//! succeeded) and unconditionally suppressed by the maintenance flag.
//! No queue, no broker: a poll loop and process spawning.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use gaia_observe::SharedMetrics;
use gaia_persist::{MaintenanceFlag, SharedDir, StateFile};
use gaia_proto::{HealthResponse, ServiceHealth};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SERVICE_NAME: &str = "gaia-doctor";
const REMEDIATION_LOG_CAP: usize = 50;

// ─── Config ──────────────────────────────────────────────────────────────────

/// One monitored service.
#[derive(Debug, Clone)]
pub struct WatchedService {
    pub name: String,
    pub health_url: String,
    pub can_remediate: bool,
}

impl WatchedService {
    pub fn new(name: &str, health_url: &str, can_remediate: bool) -> Self {
        Self {
            name: name.to_string(),
            health_url: health_url.to_string(),
            can_remediate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DoctorConfig {
    pub services: Vec<WatchedService>,
    pub poll_interval: Duration,
    pub failure_threshold: u32,
    pub restart_cooldown: Duration,
    pub probe_timeout: Duration,
    pub maintenance: MaintenanceFlag,
    /// Status snapshot written after each cycle.
    pub status_file: StateFile,
}

impl DoctorConfig {
    /// Registry and knobs from the environment (`POLL_INTERVAL`,
    /// `FAILURE_THRESHOLD`, `RESTART_COOLDOWN`, `SHARED_DIR`).
    pub fn from_env() -> Self {
        let shared = SharedDir::from_env();
        Self {
            services: vec![
                WatchedService::new("gaia-core", "http://gaia-core:6415/health", false),
                WatchedService::new("gaia-prime", "http://gaia-prime:7777/health", false),
                WatchedService::new(
                    "gaia-core-candidate",
                    "http://gaia-core-candidate:6415/health",
                    true,
                ),
                WatchedService::new(
                    "gaia-mcp-candidate",
                    "http://gaia-mcp-candidate:8765/health",
                    true,
                ),
            ],
            poll_interval: env_secs("POLL_INTERVAL", 60),
            failure_threshold: std::env::var("FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            restart_cooldown: env_secs("RESTART_COOLDOWN", 300),
            probe_timeout: Duration::from_secs(5),
            maintenance: shared.maintenance_flag(),
            status_file: shared.doctor_status(),
        }
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}

// ─── Remediation seam ────────────────────────────────────────────────────────

/// Executes the external restart command for a crashed candidate.
#[async_trait]
pub trait Remediator: Send + Sync {
    async fn restart(&self, service: &str) -> anyhow::Result<String>;
}

/// docker compose up with the candidate + HA overlay files.
pub struct ComposeRemediator {
    compose_dir: String,
    project: String,
}

impl ComposeRemediator {
    pub fn from_env() -> Self {
        Self {
            compose_dir: std::env::var("COMPOSE_DIR").unwrap_or_else(|_| "/compose".to_string()),
            project: std::env::var("COMPOSE_PROJECT_NAME")
                .unwrap_or_else(|_| "gaia_project".to_string()),
        }
    }
}

#[async_trait]
impl Remediator for ComposeRemediator {
    async fn restart(&self, service: &str) -> anyhow::Result<String> {
        let mut cmd = tokio::process::Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(&self.project)
            .arg("-f")
            .arg(format!("{}/docker-compose.candidate.yml", self.compose_dir))
            .arg("-f")
            .arg(format!("{}/docker-compose.ha.yml", self.compose_dir))
            .arg("--profile")
            .arg("ha")
            .arg("up")
            .arg("-d")
            .arg(service);

        let output = tokio::time::timeout(Duration::from_secs(120), cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("restart timed out after 120s"))??;

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let combined = combined.trim().chars().take(500).collect::<String>();

        if output.status.success() {
            Ok(combined)
        } else {
            anyhow::bail!("docker compose failed: {combined}")
        }
    }
}

// ─── Status types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationEntry {
    pub service: String,
    pub time: DateTime<Utc>,
    pub success: bool,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoctorStatus {
    pub service: String,
    pub uptime_seconds: u64,
    pub poll_interval_seconds: u64,
    pub maintenance_mode: bool,
    pub services: HashMap<String, ServiceHealth>,
    pub recent_remediations: Vec<RemediationEntry>,
}

// ─── Doctor ──────────────────────────────────────────────────────────────────

struct DoctorState {
    services: HashMap<String, ServiceHealth>,
    last_restart: HashMap<String, Instant>,
    remediation_log: Vec<RemediationEntry>,
}

pub struct Doctor {
    config: DoctorConfig,
    remediator: Arc<dyn Remediator>,
    http: reqwest::Client,
    state: Mutex<DoctorState>,
    metrics: SharedMetrics,
    started: Instant,
}

impl Doctor {
    pub fn new(config: DoctorConfig, remediator: Arc<dyn Remediator>, metrics: SharedMetrics) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.probe_timeout)
            .build()
            .unwrap_or_default();
        let services = config
            .services
            .iter()
            .map(|s| (s.name.clone(), ServiceHealth::new(s.can_remediate)))
            .collect();
        Self {
            config,
            remediator,
            http,
            state: Mutex::new(DoctorState {
                services,
                last_restart: HashMap::new(),
                remediation_log: Vec::new(),
            }),
            metrics,
            started: Instant::now(),
        }
    }

    /// One health check cycle across all services, then a status write.
    pub async fn poll_cycle(&self) {
        for spec in self.config.services.clone() {
            let healthy = self.check_health(&spec.health_url).await;
            let needs_remediation = self.apply_observation(&spec.name, healthy, spec.can_remediate);
            if needs_remediation {
                self.restart_candidate(&spec.name).await;
            }
        }
        self.write_status();
    }

    /// Poll until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            poll_s = self.config.poll_interval.as_secs(),
            threshold = self.config.failure_threshold,
            cooldown_s = self.config.restart_cooldown.as_secs(),
            "gaia-doctor started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.poll_cycle().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    pub fn build_status(&self) -> DoctorStatus {
        let state = self.state.lock();
        let recent = state
            .remediation_log
            .iter()
            .rev()
            .take(10)
            .rev()
            .cloned()
            .collect();
        DoctorStatus {
            service: SERVICE_NAME.to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            poll_interval_seconds: self.config.poll_interval.as_secs(),
            maintenance_mode: self.config.maintenance.is_set(),
            services: state.services.clone(),
            recent_remediations: recent,
        }
    }

    // ─── Internal ─────────────────────────────────────────────────────────

    async fn check_health(&self, url: &str) -> bool {
        self.metrics.health_checks_total.inc();
        match self.http.get(url).send().await {
            Ok(resp) => resp.status().as_u16() == 200,
            Err(e) => {
                debug!(url, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Update bookkeeping for one observation; returns true when a
    /// remediable service has crossed the failure threshold.
    fn apply_observation(&self, name: &str, healthy: bool, can_remediate: bool) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.services.get_mut(name) else {
            return false;
        };
        entry.last_check = Some(Utc::now());

        if healthy {
            entry.consecutive_failures = 0;
            if entry.healthy == Some(false) {
                info!(service = name, "recovered");
            }
            entry.healthy = Some(true);
            return false;
        }

        entry.consecutive_failures += 1;
        if entry.consecutive_failures < self.config.failure_threshold {
            debug!(
                service = name,
                failures = entry.consecutive_failures,
                threshold = self.config.failure_threshold,
                "failed check"
            );
            return false;
        }

        if entry.healthy != Some(false) {
            warn!(
                service = name,
                failures = entry.consecutive_failures,
                "service is DOWN"
            );
        }
        entry.healthy = Some(false);
        can_remediate
    }

    /// Restart an HA candidate, subject to cooldown and the maintenance
    /// flag. The cooldown window opens on every attempt, success or not.
    async fn restart_candidate(&self, name: &str) {
        {
            let state = self.state.lock();
            if let Some(last) = state.last_restart.get(name) {
                if last.elapsed() < self.config.restart_cooldown {
                    let remaining = self.config.restart_cooldown - last.elapsed();
                    info!(
                        service = name,
                        remaining_s = remaining.as_secs(),
                        "cooldown active, skipping restart"
                    );
                    return;
                }
            }
        }

        if self.config.maintenance.is_set() {
            info!(service = name, "maintenance mode active, skipping restart");
            return;
        }

        warn!(service = name, "REMEDIATION: restarting via HA compose overlay");
        self.metrics.remediations_total.inc();
        let result = self.remediator.restart(name).await;

        let mut state = self.state.lock();
        state.last_restart.insert(name.to_string(), Instant::now());
        let entry = match result {
            Ok(output) => {
                info!(service = name, "restart succeeded");
                RemediationEntry {
                    service: name.to_string(),
                    time: Utc::now(),
                    success: true,
                    output,
                }
            }
            Err(e) => {
                error!(service = name, error = %e, "restart failed");
                RemediationEntry {
                    service: name.to_string(),
                    time: Utc::now(),
                    success: false,
                    output: e.to_string(),
                }
            }
        };
        state.remediation_log.push(entry);
        if state.remediation_log.len() > REMEDIATION_LOG_CAP {
            state.remediation_log.remove(0);
        }
    }

    /// Write the status snapshot to the shared volume. Telemetry: a
    /// failure here is logged and swallowed.
    fn write_status(&self) {
        let status = self.build_status();
        if let Err(e) = self.config.status_file.save(&status) {
            debug!(error = %e, "failed to write doctor status file");
        }
    }
}

// ─── HTTP surface ────────────────────────────────────────────────────────────

pub fn router(doctor: Arc<Doctor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(doctor)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy(SERVICE_NAME))
}

async fn status(State(doctor): State<Arc<Doctor>>) -> Json<DoctorStatus> {
    Json(doctor.build_status())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gaia_observe::OperationsMetrics;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct MockRemediator {
        restarts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockRemediator {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                restarts: Mutex::new(vec![]),
                fail,
            })
        }
    }

    #[async_trait]
    impl Remediator for MockRemediator {
        async fn restart(&self, service: &str) -> anyhow::Result<String> {
            self.restarts.lock().push(service.to_string());
            if self.fail {
                anyhow::bail!("compose blew up");
            }
            Ok("started".to_string())
        }
    }

    async fn health_server(status: u16) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let mut buf = [0u8; 1024];
                let _ = sock.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {status} X\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok"
                );
                let _ = sock.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{addr}/health")
    }

    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);
        format!("http://{addr}/health")
    }

    struct Rig {
        _dir: tempfile::TempDir,
        doctor: Doctor,
        remediator: Arc<MockRemediator>,
        maintenance: MaintenanceFlag,
        status_path: std::path::PathBuf,
    }

    fn make_rig(services: Vec<WatchedService>, cooldown: Duration, fail_restart: bool) -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let maintenance = MaintenanceFlag::new(dir.path().join("ha_maintenance"));
        let status_path = dir.path().join("doctor").join("status.json");
        let config = DoctorConfig {
            services,
            poll_interval: Duration::from_millis(50),
            failure_threshold: 2,
            restart_cooldown: cooldown,
            probe_timeout: Duration::from_secs(1),
            maintenance: maintenance.clone(),
            status_file: StateFile::new(&status_path),
        };
        let remediator = MockRemediator::new(fail_restart);
        let doctor = Doctor::new(config, remediator.clone(), Arc::new(OperationsMetrics::new()));
        Rig {
            _dir: dir,
            doctor,
            remediator,
            maintenance,
            status_path,
        }
    }

    #[tokio::test]
    async fn test_healthy_service_no_remediation() {
        let url = health_server(200).await;
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &url, true)],
            Duration::from_secs(300),
            false,
        );

        rig.doctor.poll_cycle().await;
        assert!(rig.remediator.restarts.lock().is_empty());

        let status = rig.doctor.build_status();
        assert_eq!(status.services["gaia-core-candidate"].healthy, Some(true));
    }

    #[tokio::test]
    async fn test_threshold_gates_remediation() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &dead_url(), true)],
            Duration::from_secs(300),
            false,
        );

        // First failure: below threshold, no restart.
        rig.doctor.poll_cycle().await;
        assert!(rig.remediator.restarts.lock().is_empty());

        // Second failure crosses the threshold.
        rig.doctor.poll_cycle().await;
        assert_eq!(
            rig.remediator.restarts.lock().as_slice(),
            ["gaia-core-candidate"]
        );
    }

    #[tokio::test]
    async fn test_non_remediable_service_never_restarted() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core", &dead_url(), false)],
            Duration::from_secs(300),
            false,
        );

        for _ in 0..3 {
            rig.doctor.poll_cycle().await;
        }
        assert!(rig.remediator.restarts.lock().is_empty());
        // Still marked unhealthy.
        assert_eq!(
            rig.doctor.build_status().services["gaia-core"].healthy,
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_cooldown_limits_restart_rate() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &dead_url(), true)],
            Duration::from_secs(300),
            false,
        );

        for _ in 0..4 {
            rig.doctor.poll_cycle().await;
        }
        // Threshold crossed on cycle 2; cycles 3 and 4 are inside the
        // cooldown window.
        assert_eq!(rig.remediator.restarts.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_cooldown_applies_even_when_restart_failed() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &dead_url(), true)],
            Duration::from_secs(300),
            true,
        );

        for _ in 0..4 {
            rig.doctor.poll_cycle().await;
        }
        assert_eq!(rig.remediator.restarts.lock().len(), 1);

        let status = rig.doctor.build_status();
        assert_eq!(status.recent_remediations.len(), 1);
        assert!(!status.recent_remediations[0].success);
    }

    #[tokio::test]
    async fn test_restart_allowed_after_cooldown_expires() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &dead_url(), true)],
            Duration::from_millis(20),
            false,
        );

        rig.doctor.poll_cycle().await;
        rig.doctor.poll_cycle().await; // restart #1
        tokio::time::sleep(Duration::from_millis(40)).await;
        rig.doctor.poll_cycle().await; // restart #2
        assert_eq!(rig.remediator.restarts.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_maintenance_flag_suppresses_remediation() {
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &dead_url(), true)],
            Duration::from_secs(300),
            false,
        );
        rig.maintenance.set().expect("set");

        for _ in 0..3 {
            rig.doctor.poll_cycle().await;
        }
        assert!(rig.remediator.restarts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_status_file_written_each_cycle() {
        let url = health_server(200).await;
        let rig = make_rig(
            vec![WatchedService::new("gaia-core", &url, false)],
            Duration::from_secs(300),
            false,
        );

        rig.doctor.poll_cycle().await;
        assert!(rig.status_path.exists());

        let content = std::fs::read_to_string(&rig.status_path).expect("read");
        let status: serde_json::Value = serde_json::from_str(&content).expect("parse");
        assert_eq!(status["service"], "gaia-doctor");
        assert_eq!(status["services"]["gaia-core"]["healthy"], true);
    }

    #[tokio::test]
    async fn test_recovery_resets_counter() {
        // One server that we script: first dead, then healthy is hard
        // with a static responder, so drive apply_observation directly.
        let url = health_server(200).await;
        let rig = make_rig(
            vec![WatchedService::new("gaia-core-candidate", &url, true)],
            Duration::from_secs(300),
            false,
        );

        rig.doctor.apply_observation("gaia-core-candidate", false, true);
        rig.doctor.apply_observation("gaia-core-candidate", false, true);
        assert_eq!(
            rig.doctor.build_status().services["gaia-core-candidate"].healthy,
            Some(false)
        );

        rig.doctor.apply_observation("gaia-core-candidate", true, true);
        let status = rig.doctor.build_status();
        assert_eq!(status.services["gaia-core-candidate"].healthy, Some(true));
        assert_eq!(
            status.services["gaia-core-candidate"].consecutive_failures,
            0
        );
    }
}
