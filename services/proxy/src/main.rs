//! egress6
//!
//! Authenticated HTTP and SOCKS5 forward proxy. Every outbound connection
//! leaves from a freshly drawn address inside the configured IPv6 block.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use egress6_proxy::{bind_listeners, Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Initialize tracing (prefer RUST_LOG, fallback to --log-level)
    let registry = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()),
    );
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
    }

    let settings = config.validate().context("Invalid configuration")?;

    info!("Starting egress6");
    info!(
        prefix = %settings.pool.prefix(),
        host_bits = settings.pool.host_bits(),
        http_listen = ?settings.http.as_ref().map(|f| f.listen),
        socks_listen = ?settings.socks.as_ref().map(|f| f.listen),
        freebind = settings.dialer.freebind,
        max_connections = settings.max_connections,
        "Configuration loaded"
    );

    let listeners = bind_listeners(&settings)
        .await
        .context("Failed to bind listener")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(listeners.len());
    for listener in listeners {
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = listener.run(shutdown).await {
                error!(error = %e, "Listener error");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, no longer accepting connections");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("egress6 stopped");
    Ok(())
}
