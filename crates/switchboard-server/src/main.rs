//! # Switchboard
//!
//! Realtime chat gateway node.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! switchboard
//!
//! # Run with a custom config file
//! SWITCHBOARD_CONFIG=/path/to/switchboard.toml switchboard
//!
//! # Run with environment variables
//! SWITCHBOARD_PORT=8080 SWITCHBOARD_NODE__ID=gw-1 switchboard
//! ```

use anyhow::Result;
use switchboard_server::{config, handlers, metrics};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "switchboard_server=debug,switchboard_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Switchboard server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Shutdown requested");
                signal.cancel();
            }
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
    });

    // Start the server
    handlers::run_server(config, shutdown).await?;

    Ok(())
}
