//! tsproxy
//!
//! Exposes in-cluster services on host TCP ports. The set of exposed ports
//! follows a desired-state file; each port relays raw TCP to one backend
//! service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tsproxy::{
    config::Config,
    http::{self, HttpState},
    FileSource, Manager,
};
use tsproxy_events::ProxyMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to TSPROXY_LOG_LEVEL)
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    if config.log_format.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting tsproxy");
    info!(
        config_path = %config.config_path.display(),
        bind_host = %config.bind_host,
        dial_timeout_ms = u64::try_from(config.dial_timeout.as_millis()).unwrap_or(u64::MAX),
        keepalive = config.keepalive.is_some(),
        debug = config.debug,
        "Configuration loaded"
    );

    let metrics = Arc::new(ProxyMetrics::new());
    let manager = Arc::new(
        Manager::builder()
            .config(config.listener_config())
            .observer(metrics.clone())
            .worker_ids(metrics.worker_ids())
            .resolver(config.resolver())
            .debug_dump(config.debug)
            .build(),
    );

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = FileSource::new(
        config.config_path.clone(),
        config.poll_interval,
        Arc::clone(&manager),
    );
    let source_handle = tokio::spawn(source.run(shutdown_rx.clone()));

    let http_handle = config.metrics_addr.map(|addr| {
        let state = HttpState {
            manager: Arc::clone(&manager),
            metrics: Arc::clone(&metrics),
        };
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(addr, state, shutdown_rx).await {
                error!(error = %format!("{e:#}"), "Metrics endpoint failed");
            }
        })
    });

    // Wait for shutdown signal (Ctrl+C)
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    let shutdown_timeout = Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, source_handle).await {
        warn!(error = %e, "Desired-state source did not shut down in time");
    }

    if let Some(handle) = http_handle {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(error = %e, "Metrics endpoint did not shut down in time");
        }
    }

    manager.shutdown().await;

    info!("tsproxy shutdown complete");
    Ok(())
}
