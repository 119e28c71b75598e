mod aggregator;
mod api;
mod config;
mod discovery;
mod drivers;
mod mdns;
mod node;
mod plugmgr;
mod rpc;
mod ssdp;

use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::node::HttpScanner;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("periodicpi_aggd=info"))
        )
        .init();

    tracing::info!("Starting periodicpi-aggd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/periodicpi/aggregator.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.mdns.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    // Scans run on the discovery threads and block on this runtime
    let http = Arc::new(
        HttpScanner::new(config.scan.timeout(), Handle::current())
            .context("Failed to create HTTP client")?,
    );

    let listen = config.api.listen.clone();
    let mut aggregator = Aggregator::new(config);
    aggregator.discover_drivers(http.clone(), http);

    aggregator
        .start_mdns(&mdns_daemon)
        .context("Failed to start mDNS watcher")?;
    aggregator
        .start_ssdp()
        .context("Failed to start SSDP poller")?;

    let cancel = CancellationToken::new();

    let app = api::routes::router(api::routes::AppState {
        rpc: aggregator.rpc(),
    });

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;

    tracing::info!("API listening on {}", listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    // Joining the workers blocks until their current probe or dispatch ends
    let shutdown = tokio::task::spawn_blocking(move || aggregator.shutdown());
    if let Err(e) = shutdown.await {
        tracing::error!("Aggregator shutdown failed: {}", e);
    }

    cancel.cancel();
    let _ = server_handle.await;

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
