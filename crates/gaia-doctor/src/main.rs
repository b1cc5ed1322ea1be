//! gaia-doctor entry point.

use anyhow::Context;
use clap::Parser;
use gaia_doctor::{ComposeRemediator, Doctor, DoctorConfig};
use gaia_observe::OperationsMetrics;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "gaia-doctor")]
#[command(about = "GAIA external HA watchdog")]
#[command(version)]
struct Cli {
    /// Port to listen on (overrides HTTP_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let port = match cli.port {
        Some(p) => p,
        None => std::env::var("HTTP_PORT")
            .unwrap_or_else(|_| "6419".to_string())
            .parse()
            .context("HTTP_PORT must be a port number")?,
    };

    let doctor = Arc::new(Doctor::new(
        DoctorConfig::from_env(),
        Arc::new(ComposeRemediator::from_env()),
        Arc::new(OperationsMetrics::new()),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(doctor.clone().run(shutdown_rx));

    let app = gaia_doctor::router(doctor);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!(addr = %addr, "gaia-doctor listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("serve")?;

    info!("gaia-doctor stopped");
    Ok(())
}
