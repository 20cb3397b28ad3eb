//! Edge gateway daemon entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gateway::{EdgeAgent, GatewayConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edge-gateway")]
#[command(about = "Edge gateway agent bridging an ESP-NOW co-processor to an MQTT broker")]
struct Cli {
    /// Configuration file path
    #[arg(
        short,
        long,
        env = "EDGE_GATEWAY_CONF",
        default_value = "/etc/edge-gateway/edge-gateway.conf"
    )]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;

    let default_filter = if cli.debug {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let agent = EdgeAgent::bootstrap(config)
        .await
        .context("building gateway components")?;
    Arc::clone(&agent)
        .start()
        .await
        .context("starting gateway")?;

    // Run until SIGINT or SIGTERM, then shut down in order.
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!("ctrl-c handler failed: {}", err);
            }
            info!("received SIGINT");
        }
        _ = sigterm.recv() => {
            info!("received SIGTERM");
        }
    }

    agent.stop().await;
    Ok(())
}
