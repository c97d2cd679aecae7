use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eos_bridge::api;
use eos_bridge::config::Config;
use eos_bridge::controller::{self, AppState};
use eos_bridge::telemetry;

/// Home-energy orchestration daemon bridging EOS-style optimizers and
/// battery inverters.
#[derive(Debug, Parser)]
#[command(name = "eos-bridge", version)]
struct Cli {
    /// Working directory holding config.toml and the json/ artifacts
    /// (defaults to the binary's directory).
    workdir: Option<PathBuf>,
}

fn default_workdir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let workdir = cli.workdir.unwrap_or_else(default_workdir);

    let cfg = Config::load(&workdir)?;
    telemetry::init_tracing(&cfg.general.log_level);
    info!(
        workdir = %workdir.display(),
        time_zone = %cfg.general.time_zone,
        "starting eos-bridge"
    );

    let stop = CancellationToken::new();
    let (app, override_rx) = AppState::new(cfg, workdir, stop.clone()).await?;

    let handles = controller::spawn_controller_tasks(app.clone(), stop.clone(), override_rx);

    let addr = app.cfg.server.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind web server to {addr}"))?;
    info!(%addr, "web server listening");

    axum::serve(listener, api::router(app))
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    controller::shutdown(stop, handles).await;
    warn!("shutdown complete");
    Ok(())
}
