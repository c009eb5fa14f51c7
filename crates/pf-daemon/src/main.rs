//! probefleet daemon — starts the HTTP control surface, the node WebSocket
//! endpoint, and the background loops.

use anyhow::{Context, Result};
use pf_core::config::Config;
use pf_daemon::daemon::Daemon;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    pf_telemetry::logging::init_logging("pf-daemon", "info");

    let mut config = Config::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        Config::default()
    });

    // Ensure the data directory exists and expand ~ in the state path.
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    let data_dir = std::path::Path::new(&home).join(".probefleet");
    std::fs::create_dir_all(&data_dir).ok();
    if config.state.path.starts_with("~/") {
        config.state.path = config.state.path.replacen('~', &home, 1);
    }

    info!(
        host = %config.daemon.host,
        port = config.daemon.port,
        state_db = %config.state.path,
        "probefleet daemon starting"
    );

    let daemon = Daemon::new(config)
        .await
        .context("failed to initialise daemon")?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received");
            shutdown.trigger();
        }
    });

    daemon.run().await
}
