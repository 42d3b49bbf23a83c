//! Resilient API gateway.
//!
//! # Architecture Overview
//!
//! ```text
//!  Client ──▶ request id ──▶ authenticator ──▶ rate limiter ──▶ upstream table
//!                                                                    │
//!                                                                    ▼
//!  Client ◀── response (streamed) ◀── stream proxy ◀── circuit breaker gate
//!                                      │  ▲
//!                                      ▼  │ retries, backoff, deadline
//!                                    upstream service
//! ```

use std::path::PathBuf;

use clap::Parser;

use resilient_gateway::config::loader::load_config;
use resilient_gateway::config::GatewayConfig;
use resilient_gateway::lifecycle::signals::spawn_signal_handler;
use resilient_gateway::lifecycle::Gateway;
use resilient_gateway::observability::{logging, metrics};

#[derive(Parser, Debug)]
#[command(name = "resilient-gateway", version, about = "Resilient API gateway")]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long, env = "GATEWAY_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => GatewayConfig::default(),
    };

    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        "resilient-gateway starting"
    );

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        upstreams = config.upstreams.len(),
        max_retries = config.retries.max_retries,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let gateway = Gateway::start(config).await?;
    spawn_signal_handler(gateway.shutdown().clone());

    gateway.wait().await?;
    tracing::info!("Shutdown complete");
    Ok(())
}
