//! Cache types

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::LoadError;

type SharedResult = Shared<BoxFuture<'static, Result<Bytes, LoadError>>>;

/// A memory tier entry: either a finished payload or a fetch other callers can join
#[derive(Clone)]
pub enum CacheEntry {
    Ready(Bytes),
    InProgress(InFlight),
}

impl CacheEntry {
    pub fn is_ready(&self) -> bool {
        matches!(self, CacheEntry::Ready(_))
    }

    /// Generation of the fetch behind an in-progress entry
    pub fn generation(&self) -> Option<u64> {
        match self {
            CacheEntry::Ready(_) => None,
            CacheEntry::InProgress(handle) => Some(handle.generation()),
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheEntry::Ready(payload) => f.debug_tuple("Ready").field(&payload.len()).finish(),
            CacheEntry::InProgress(handle) => f.debug_tuple("InProgress").field(handle).finish(),
        }
    }
}

/// Shareable handle to an in-flight fetch.
///
/// Any number of clones can await the same result. If the producing side is
/// dropped without completing, every waiter sees [`LoadError::Cancelled`].
#[derive(Clone)]
pub struct InFlight {
    generation: u64,
    result: SharedResult,
}

impl InFlight {
    /// Create a handle together with the sender that resolves it
    pub fn channel(generation: u64) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let result = async move { rx.await.unwrap_or(Err(LoadError::Cancelled)) }
            .boxed()
            .shared();

        (Self { generation, result }, Completion { tx })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the fetch has produced a result (or was dropped) and someone observed it
    pub fn is_resolved(&self) -> bool {
        self.result.peek().is_some()
    }

    pub async fn wait(self) -> Result<Bytes, LoadError> {
        self.result.await
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("generation", &self.generation)
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// Producer side of an [`InFlight`] handle
#[derive(Debug)]
pub struct Completion {
    tx: oneshot::Sender<Result<Bytes, LoadError>>,
}

impl Completion {
    pub fn complete(self, result: Result<Bytes, LoadError>) {
        // Nobody left waiting is fine
        let _ = self.tx.send(result);
    }
}

/// Fixed limits of a disk store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreBudget {
    pub size_limit_bytes: u64,
    pub ttl: Duration,
    pub eviction_target_bytes: u64,
}

impl StoreBudget {
    /// Budget that evicts down to half of `size_limit_bytes`
    pub fn new(size_limit_bytes: u64, ttl: Duration) -> Self {
        Self {
            size_limit_bytes,
            ttl,
            eviction_target_bytes: size_limit_bytes / 2,
        }
    }
}

impl Default for StoreBudget {
    fn default() -> Self {
        Self::new(1_000_000_000, Duration::days(7))
    }
}

/// A payload on disk with its bookkeeping timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub hashed_key: String,
    pub payload: Bytes,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl DiskRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Outcome of a maintenance sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimReport {
    pub expired_removed: usize,
    pub evicted: usize,
    pub bytes_freed: u64,
    pub completed: bool,
}

/// Counters kept by the loader
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderStats {
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub fetches: u64,
    pub joined: u64,
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_budget_default() {
        let budget = StoreBudget::default();
        assert_eq!(budget.size_limit_bytes, 1_000_000_000);
        assert_eq!(budget.eviction_target_bytes, 500_000_000);
        assert_eq!(budget.ttl, Duration::days(7));
    }

    #[tokio::test]
    async fn test_in_flight_shares_result() {
        let (handle, completion) = InFlight::channel(7);
        let other = handle.clone();
        assert_eq!(other.generation(), 7);

        completion.complete(Ok(Bytes::from_static(b"png")));

        assert_eq!(handle.wait().await.unwrap(), Bytes::from_static(b"png"));
        assert_eq!(other.wait().await.unwrap(), Bytes::from_static(b"png"));
    }

    #[tokio::test]
    async fn test_dropped_completion_cancels_waiters() {
        let (handle, completion) = InFlight::channel(1);
        drop(completion);

        assert_eq!(handle.wait().await, Err(LoadError::Cancelled));
    }

    #[test]
    fn test_trim_report_serialization() {
        let report = TrimReport {
            expired_removed: 2,
            evicted: 3,
            bytes_freed: 4096,
            completed: true,
        };

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"evicted\":3"));
        assert!(json.contains("4096"));
    }
}
