//! Core types for the image cache proxy

use std::time::Duration;

use remote_image_cache::{CacheConfig, LoaderStats};
use serde::{Deserialize, Serialize};

/// Configuration for the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub port: u16,
    pub cache: CacheConfig,
    pub fetch_timeout: Duration,
    /// Time granted to a trim requested through `/admin/trim`
    pub background_window: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: 3001,
            cache: CacheConfig::default(),
            fetch_timeout: Duration::from_secs(30),
            background_window: Duration::from_secs(25),
        }
    }
}

/// Query string for `/image`
#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

/// Cache state reported by the health check
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub memory_entries: usize,
    pub disk_bytes: u64,
    #[serde(flatten)]
    pub stats: LoaderStats,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub cache: CacheStatus,
}

/// Number of entries dropped by an admin action
#[derive(Debug, Serialize)]
pub struct ClearedResponse {
    pub removed: usize,
}
