//! execgate SSH gateway
//!
//! An SSH server that treats the `exec` command as a route path
//! (`/path?key=value`), checks the user against the route's allow-list and
//! runs the command configured for it on a pseudo-terminal.

mod bridge;
mod config;
mod gateway;
mod handlers;
mod keys;
mod msg;
mod router;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::gateway::Gateway;

/// execgate - route SSH exec requests to configured commands
#[derive(Parser, Debug)]
#[command(name = "execgate", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/execgate/gateway.toml")]
    config: PathBuf,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if cli.generate_config {
        println!("{}", GatewayConfig::example().to_toml()?);
        return Ok(());
    }

    let mut config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    info!("Starting execgate");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Routes configured: {}", config.routes.len());
    info!("  Users configured: {}", config.users.len());

    let gateway = Arc::new(Gateway::new(&config).await?);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;

    tokio::select! {
        res = ssh::run_server(gateway, listener) => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
