//! snirelay
//!
//! TLS passthrough proxy routing by SNI.
//!
//! This service:
//! - Accepts TCP connections on configured listeners
//! - Reads the TLS ClientHello to learn the requested hostname
//! - Maps the hostname to a backend through a fixed policy
//! - Optionally sends a PROXY protocol header
//! - Relays bytes untouched in both directions

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use snirelay_ingress::config::{Args, LogFormat};
use snirelay_ingress::{Listener, Server};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| args.log_level.clone().into());
    match args.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init(),
    }

    let config = args.into_config().context("Invalid configuration")?;

    info!("Starting snirelay");
    info!(
        policy = ?config.policy,
        default_hostname = %config.server.default_hostname,
        proxy_protocol = %config.server.proxy_protocol,
        listener_count = config.listeners.len(),
        "Configuration loaded"
    );

    let dialer = config.policy.into_dialer(config.connect_timeout);
    let server = Arc::new(Server::new(config.server, dialer));

    // Bind everything before serving anything.
    let mut listeners = Vec::with_capacity(config.listeners.len());
    for listener_config in config.listeners {
        let bind_addr = listener_config.bind_addr;
        let listener = Listener::bind(listener_config, Arc::clone(&server))
            .await
            .with_context(|| format!("Failed to bind listener on {bind_addr}"))?;
        listeners.push(Arc::new(listener));
    }

    let mut tasks = JoinSet::new();
    for listener in listeners {
        tasks.spawn(listener.run());
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            info!("Shutdown signal received");
            Ok(())
        }
        Some(joined) = tasks.join_next() => {
            let result = joined.context("Listener task panicked")?;
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result.context("Listener stopped")
        }
    }
}
