//! Image Cache Proxy - HTTP front for the two-tier remote image cache
//!
//! Fetches images by URL on behalf of clients, coalescing concurrent requests
//! and serving repeats from memory or disk.

mod error;
mod server;
mod types;

use std::sync::Arc;
use std::time::Duration;

use remote_image_cache::{CacheConfig, HttpTransport, ImageCache, ImageLoader};
use tracing::info;
use tracing_subscriber::{prelude::*, EnvFilter};

use crate::error::Result;
use crate::server::{start_server, ServerState, SharedState};
use crate::types::ProxyConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let env_filter = EnvFilter::from_default_env()
        .add_directive("image_cache_proxy=info".parse()?)
        .add_directive("remote_image_cache=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting Image Cache Proxy...");

    let config = load_config();
    info!("Port: {}", config.port);
    info!("Cache dir: {:?}", config.cache.cache_dir);
    info!(
        "Max cache size: {} MB (trim to {} MB)",
        config.cache.max_bytes / (1024 * 1024),
        config.cache.trim_target_bytes / (1024 * 1024)
    );
    info!("Cache TTL: {} seconds", config.cache.ttl_secs);

    let transport = HttpTransport::with_timeout(config.fetch_timeout)?;
    let cache = ImageCache::open(&config.cache).await?;
    let loader = ImageLoader::new(Arc::new(cache), Arc::new(transport));

    let state: SharedState = Arc::new(ServerState::new(
        loader.clone(),
        config.background_window,
    ));

    start_server(state, config.port, shutdown_signal()).await?;

    let report = loader.on_will_terminate().await;
    info!(
        expired = report.expired_removed,
        evicted = report.evicted,
        "Shutdown complete"
    );

    Ok(())
}

fn load_config() -> ProxyConfig {
    let defaults = ProxyConfig::default();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(defaults.port);

    let fetch_timeout = std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.fetch_timeout);

    let background_window = std::env::var("BACKGROUND_WINDOW_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(defaults.background_window);

    ProxyConfig {
        port,
        cache: CacheConfig::from_env(),
        fetch_timeout,
        background_window,
    }
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, draining connections");
}
