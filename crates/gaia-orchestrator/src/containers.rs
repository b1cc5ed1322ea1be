//! Container lifecycle seam.
//!
//! The orchestrator starts and stops the Prime container through this
//! trait; production uses docker compose with the HA overlay, tests use
//! mocks.

use async_trait::async_trait;
use std::time::Duration;
use tracing::{info, warn};

#[async_trait]
pub trait ContainerControl: Send + Sync {
    async fn start(&self, service: &str) -> anyhow::Result<()>;
    async fn stop(&self, service: &str) -> anyhow::Result<()>;
}

/// docker compose invocation with the candidate + HA overlay files.
pub struct ComposeControl {
    compose_dir: String,
    project: String,
}

impl ComposeControl {
    pub fn new(compose_dir: &str, project: &str) -> Self {
        Self {
            compose_dir: compose_dir.to_string(),
            project: project.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let compose_dir = std::env::var("COMPOSE_DIR").unwrap_or_else(|_| "/compose".to_string());
        let project =
            std::env::var("COMPOSE_PROJECT_NAME").unwrap_or_else(|_| "gaia_project".to_string());
        Self::new(&compose_dir, &project)
    }

    async fn compose(&self, args: &[&str]) -> anyhow::Result<()> {
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
            .args(args);

        let output = tokio::time::timeout(Duration::from_secs(120), cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("docker compose timed out after 120s"))??;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("docker compose failed: {}", stderr.trim())
        }
    }
}

#[async_trait]
impl ContainerControl for ComposeControl {
    async fn start(&self, service: &str) -> anyhow::Result<()> {
        info!(service, "starting container via compose");
        self.compose(&["up", "-d", service]).await
    }

    async fn stop(&self, service: &str) -> anyhow::Result<()> {
        info!(service, "stopping container via compose");
        self.compose(&["stop", service]).await
    }
}

/// Poll a health endpoint until it answers 200 or the deadline passes.
pub async fn wait_healthy(url: &str, deadline: Duration, interval: Duration) -> bool {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap_or_default();

    let started = tokio::time::Instant::now();
    loop {
        match http.get(url).send().await {
            Ok(resp) if resp.status().as_u16() == 200 => return true,
            Ok(resp) => warn!(url, status = resp.status().as_u16(), "health not ready"),
            Err(e) => warn!(url, error = %e, "health unreachable"),
        }
        if started.elapsed() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}
