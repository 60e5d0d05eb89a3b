//! Environment-driven cache settings

use std::env;
use std::path::PathBuf;

use chrono::Duration;

use crate::types::StoreBudget;

const DEFAULT_MAX_BYTES: u64 = 1_000_000_000; // 1GB
const DEFAULT_TTL_SECS: i64 = 7 * 24 * 60 * 60; // 7 days
const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60; // 100 years

/// Cache configuration parsed from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_bytes: u64,
    pub ttl_secs: i64,
    /// Size the disk tier is trimmed down to once `max_bytes` is reached
    pub trim_target_bytes: u64,
}

impl CacheConfig {
    /// Parse configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let cache_dir = env::var("IMAGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.cache_dir);

        let max_bytes = env::var("IMAGE_CACHE_MAX_BYTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.max_bytes);

        let ttl_secs = parse_ttl_secs(env::var("IMAGE_CACHE_TTL_SECS").ok());

        let trim_target_bytes = env::var("IMAGE_CACHE_TRIM_TARGET_BYTES")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|target| *target <= max_bytes)
            .unwrap_or(max_bytes / 2);

        Self {
            cache_dir,
            max_bytes,
            ttl_secs,
            trim_target_bytes,
        }
    }

    pub fn budget(&self) -> StoreBudget {
        StoreBudget {
            size_limit_bytes: self.max_bytes,
            ttl: Duration::try_seconds(self.ttl_secs.clamp(1, MAX_TTL_SECS))
                .unwrap_or_else(|| Duration::seconds(DEFAULT_TTL_SECS)),
            eviction_target_bytes: self.trim_target_bytes,
        }
    }
}

/// Positive TTL in seconds, capped at `MAX_TTL_SECS`
fn parse_ttl_secs(value: Option<String>) -> i64 {
    value
        .and_then(|s| s.parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| secs.min(MAX_TTL_SECS))
        .unwrap_or(DEFAULT_TTL_SECS)
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/images"),
            max_bytes: DEFAULT_MAX_BYTES,
            ttl_secs: DEFAULT_TTL_SECS,
            trim_target_bytes: DEFAULT_MAX_BYTES / 2,
        }
    }
}
