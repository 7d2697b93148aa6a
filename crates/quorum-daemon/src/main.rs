use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use quorum_store::SqliteCache;
use tracing_subscriber::EnvFilter;

use quorum_daemon::config::DaemonConfig;
use quorum_daemon::daemon::Daemon;

#[derive(Parser, Debug)]
#[command(
    name = "quorum-daemon",
    about = "Quorum daemon - periodically re-analyzes configured ticker groups"
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/quorum.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read config: {}", cli.config))?;
    let config: DaemonConfig =
        toml::from_str(&config_str).with_context(|| "Failed to parse daemon config")?;

    let orchestrator =
        quorum::build_orchestrator(&config.quorum).context("Failed to build orchestrator")?;
    let cache = SqliteCache::open(&config.quorum.store.sqlite_path).with_context(|| {
        format!("Failed to open cache DB: {}", config.quorum.store.sqlite_path)
    })?;

    let capabilities = config.daemon.resolve_capabilities(&config.quorum.agents);
    let daemon = Daemon::new(config.daemon, capabilities, Arc::new(orchestrator)).with_cleanup(cache);
    let cancel = daemon.cancel_token();

    // Handle shutdown signals
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received shutdown signal");
        cancel.cancel();
    });

    daemon
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("Daemon error: {e}"))?;

    Ok(())
}
