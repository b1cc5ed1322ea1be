//! gaia-orchestrator — GPU lease orchestrator service.
//!
//! Owns the single writer of the persistent orchestrator state and
//! exposes the `/gpu/*` and `/handoff/*` HTTP surface.

use anyhow::Context;
use clap::Parser;
use gaia_observe::OperationsMetrics;
use gaia_orchestrator::{ComposeControl, OrchestratorConfig, StateManager, http};
use gaia_observe::NotificationManager;
use gaia_persist::SharedDir;
use gaia_timeline::TimelineStore;
use gaia_watchdog::{HealthWatchdog, WatchdogConfig};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gaia-orchestrator")]
#[command(about = "GAIA GPU lease orchestrator")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 6410)]
    port: u16,

    /// Shared volume root (overrides SHARED_DIR)
    #[arg(long)]
    shared_dir: Option<String>,

    /// Health endpoint of the live Prime service
    #[arg(long, default_value = "http://gaia-prime:7777/health")]
    prime_health_url: String,

    /// Seconds a handoff may sit in one phase before the timer fails it
    #[arg(long, default_value_t = 300)]
    phase_deadline_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let shared = match cli.shared_dir {
        Some(dir) => SharedDir::new(dir),
        None => SharedDir::from_env(),
    };

    let config = OrchestratorConfig {
        prime_health_url: cli.prime_health_url,
        phase_deadline: Duration::from_secs(cli.phase_deadline_secs),
        ..OrchestratorConfig::default()
    };

    let timeline = Arc::new(TimelineStore::new(shared.timeline_dir()));
    let metrics = Arc::new(OperationsMetrics::new());
    let manager = Arc::new(
        StateManager::initialize(
            shared.orchestrator_state(),
            config,
            Arc::new(ComposeControl::from_env()),
            timeline.clone(),
            metrics.clone(),
        )
        .context("load orchestrator state")?,
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(
        manager
            .clone()
            .run_phase_timer(Duration::from_secs(10), shutdown_rx.clone()),
    );

    // The HA watchdog lives in this process; its status surfaces under
    // /ha/status alongside the orchestrator routes.
    let watchdog = Arc::new(HealthWatchdog::new(
        WatchdogConfig::gaia_default(shared.maintenance_flag()),
        NotificationManager::default(),
        timeline,
        metrics,
    ));
    tokio::spawn(watchdog.clone().run(shutdown_rx));

    let app = http::router(manager).merge(gaia_watchdog::router(watchdog));
    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "gaia-orchestrator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serve")?;

    info!("gaia-orchestrator stopped");
    Ok(())
}
