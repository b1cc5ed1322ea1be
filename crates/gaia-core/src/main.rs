//! gaia-core — the GAIA core service.
//!
//! Composes the sleep/wake manager, the sleep task scheduler, and the
//! sleep cycle loop, and serves the `/sleep/*` HTTP surface.

use anyhow::Context;
use clap::Parser;
use gaia_client::{ClientConfig, orchestrator_client};
use gaia_core::{CoreState, InertTaskHandler, SERVICE_NAME};
use gaia_observe::OperationsMetrics;
use gaia_persist::SharedDir;
use gaia_sleep::{
    HttpGpuCustodian, HttpPresenceSink, IdleMonitor, LoadAvgProbe, ResourceMonitor, SleepConfig,
    SleepCycleLoop, SleepTaskScheduler, SleepWakeManager,
};
use gaia_timeline::TimelineStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gaia-core")]
#[command(about = "GAIA core service")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 6415)]
    port: u16,

    /// Shared volume root (overrides SHARED_DIR)
    #[arg(long)]
    shared_dir: Option<String>,

    /// Minutes of idle before drifting off
    #[arg(long, default_value_t = 5.0)]
    idle_threshold_minutes: f64,

    /// Seconds of drowsy grace window
    #[arg(long, default_value_t = 60)]
    drowsy_grace_secs: u64,

    /// Disable the sleep cycle entirely
    #[arg(long)]
    no_sleep: bool,
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

    let sleep_config = SleepConfig {
        sleep_enabled: !cli.no_sleep,
        idle_threshold_minutes: cli.idle_threshold_minutes,
        drowsy_grace: Duration::from_secs(cli.drowsy_grace_secs),
        ..SleepConfig::default()
    };

    let timeline = Arc::new(TimelineStore::new(shared.timeline_dir()));
    let metrics = Arc::new(OperationsMetrics::new());
    let manager = Arc::new(SleepWakeManager::new(
        sleep_config.clone(),
        timeline.clone(),
        metrics.clone(),
    ));

    let mut scheduler = SleepTaskScheduler::new(timeline.clone(), metrics.clone());
    scheduler.register_defaults(
        InertTaskHandler::new("conversation_curation"),
        InertTaskHandler::new("thought_seed_review"),
        InertTaskHandler::new("initiative_cycle"),
    );

    let idle = Arc::new(IdleMonitor::new());
    let resources = Arc::new(ResourceMonitor::new(Arc::new(LoadAvgProbe)));

    // Boot of the Prime container can take minutes; no retries, the loop
    // treats custody failures as non-fatal.
    let custodian = Arc::new(HttpGpuCustodian::new(orchestrator_client(ClientConfig {
        timeout: Duration::from_secs(180),
        max_attempts: 1,
        ..ClientConfig::default()
    })));
    let web_url =
        std::env::var("WEB_ENDPOINT").unwrap_or_else(|_| "http://gaia-web:6414".to_string());
    let presence = Arc::new(HttpPresenceSink::new(&web_url));

    let cycle = Arc::new(SleepCycleLoop::new(
        sleep_config,
        manager.clone(),
        scheduler,
        idle.clone(),
        resources.clone(),
        custodian,
        presence,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(resources.run(Duration::from_secs(5), shutdown_rx.clone()));
    tokio::spawn(cycle.run(shutdown_rx.clone()));

    let state = CoreState {
        manager: manager.clone(),
        idle,
        shutdown: Arc::new(shutdown_tx),
    };
    let app = gaia_core::router(state.clone());

    let addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, service = SERVICE_NAME, "gaia-core listening");

    let mut shutdown_rx = shutdown_rx;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    state.manager.initiate_offline();
                    let _ = state.shutdown.send(true);
                }
                _ = shutdown_rx.changed() => {}
            }
        })
        .await
        .context("serve")?;

    info!("gaia-core stopped");
    Ok(())
}
