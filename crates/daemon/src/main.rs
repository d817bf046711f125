//! Meshplane Daemon
//!
//! The control plane for a WireGuard-style site-to-site overlay: terminates
//! client and agent sessions, reconciles registrations and target changes
//! onto exit nodes, and answers the target trigger API.

use clap::Parser;
use meshplane_common::{Database, HttpPeerTable};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod connectivity;
mod server;
mod targets;
#[cfg(test)]
mod testutil;
mod ws;

use config::DaemonConfig;

#[derive(Parser)]
#[command(name = "meshplaned")]
#[command(about = "Meshplane daemon - mesh connectivity synchronization")]
#[command(version)]
struct Cli {
    /// Configuration file path (defaults to config.toml in the store)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Store directory
    #[arg(short, long)]
    store: Option<PathBuf>,

    /// HTTP/WebSocket listen address
    #[arg(short, long, env = "MESHPLANE_LISTEN")]
    listen: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Meshplane daemon v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration, then apply CLI overrides
    let config_path = cli
        .config
        .unwrap_or_else(|| meshplane_common::default_store_path().join("config.toml"));
    let mut config = DaemonConfig::load(&config_path)?;
    if let Some(store) = cli.store {
        config.store_path = store;
    }
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }

    // Ensure store directory exists
    tokio::fs::create_dir_all(&config.store_path).await?;

    let db = Database::open(config.db_path())?;
    let peers = Arc::new(HttpPeerTable::new(config.push_timeout())?);
    let app = server::build_app(db, peers);

    let server_handle = tokio::spawn(server::serve(config.listen.clone(), app));

    info!("Daemon started on {}", config.listen);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("Server error: {}", e),
                Err(e) => tracing::error!("Server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Daemon shutdown complete");
    Ok(())
}
