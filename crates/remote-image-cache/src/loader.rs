//! Fetch coordinator
//!
//! Looks a key up in the cache, and on a miss starts exactly one fetch that
//! every concurrent caller for the same key waits on. The in-flight entry is
//! published before the fetch starts and is replaced by the payload (success)
//! or removed (failure, cancellation) before waiters are woken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::cache::{ImageCache, Lookup};
use crate::error::LoadError;
use crate::transport::FetchTransport;
use crate::types::{CacheEntry, Completion, InFlight, LoaderStats};

/// Which tier answered a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Memory,
    Disk,
    /// Fetched, either by this caller or by a fetch it joined
    Network,
}

impl LoadSource {
    pub fn is_cache_hit(self) -> bool {
        !matches!(self, LoadSource::Network)
    }
}

/// Loads images through the cache. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ImageLoader {
    inner: Arc<Inner>,
}

struct Inner {
    cache: Arc<ImageCache>,
    transport: Arc<dyn FetchTransport>,
    next_generation: AtomicU64,
    /// Fetch tasks currently running, by key
    tasks: Mutex<HashMap<String, RunningFetch>>,
    stats: Counters,
}

struct RunningFetch {
    generation: u64,
    abort: AbortHandle,
}

#[derive(Default)]
struct Counters {
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    fetches: AtomicU64,
    joined: AtomicU64,
    failures: AtomicU64,
}

impl ImageLoader {
    pub fn new(cache: Arc<ImageCache>, transport: Arc<dyn FetchTransport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache,
                transport,
                next_generation: AtomicU64::new(1),
                tasks: Mutex::new(HashMap::new()),
                stats: Counters::default(),
            }),
        }
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.inner.cache
    }

    /// Return the payload for `key`, fetching it at most once across concurrent callers
    pub async fn load(&self, key: &str) -> Result<Bytes, LoadError> {
        self.load_with_source(key).await.map(|(payload, _)| payload)
    }

    /// Like [`ImageLoader::load`], also reporting which tier answered
    pub async fn load_with_source(&self, key: &str) -> Result<(Bytes, LoadSource), LoadError> {
        let stats = &self.inner.stats;

        match self.inner.cache.lookup(key).await {
            Some(Lookup::Memory(CacheEntry::Ready(payload))) => {
                stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                return Ok((payload, LoadSource::Memory));
            }
            Some(Lookup::Memory(CacheEntry::InProgress(handle))) => {
                stats.joined.fetch_add(1, Ordering::Relaxed);
                return self.join(key, handle).await.map(|p| (p, LoadSource::Network));
            }
            Some(Lookup::Disk(payload)) => {
                stats.disk_hits.fetch_add(1, Ordering::Relaxed);
                self.inner.cache.promote(key, payload.clone());
                return Ok((payload, LoadSource::Disk));
            }
            None => {}
        }

        // Another caller may have published between the lookup and here, so
        // the vacancy check and the publish happen under one lock.
        let mut completion = None;
        let (entry, _) = self.inner.cache.memory().get_or_insert_with(key, || {
            let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
            let (handle, done) = InFlight::channel(generation);
            completion = Some(done);
            CacheEntry::InProgress(handle)
        });

        match entry {
            CacheEntry::Ready(payload) => {
                stats.memory_hits.fetch_add(1, Ordering::Relaxed);
                Ok((payload, LoadSource::Memory))
            }
            CacheEntry::InProgress(handle) => {
                match completion {
                    Some(done) => self.spawn_fetch(key, handle.generation(), done),
                    None => {
                        stats.joined.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.join(key, handle)
                    .await
                    .map(|p| (p, LoadSource::Network))
            }
        }
    }

    /// Drop `key` from both tiers. A fetch already running keeps running for
    /// its waiters but its result is not published.
    pub async fn invalidate(&self, key: &str) {
        self.inner.cache.remove(key).await;
        debug!(key = %key, "Invalidated cache entry");
    }

    /// Abort the running fetch for `key`. Its waiters observe [`LoadError::Cancelled`].
    pub fn cancel(&self, key: &str) -> bool {
        let running = self.inner.tasks.lock().remove(key);
        match running {
            Some(running) => {
                running.abort.abort();
                self.inner
                    .cache
                    .memory()
                    .remove_in_flight(key, running.generation);
                info!(key = %key, generation = running.generation, "Cancelled fetch");
                true
            }
            None => false,
        }
    }

    pub fn clear_memory(&self) -> usize {
        self.inner.cache.clear_memory()
    }

    pub async fn clear_disk(&self) -> usize {
        self.inner.cache.clear_disk().await
    }

    pub fn stats(&self) -> LoaderStats {
        let stats = &self.inner.stats;
        LoaderStats {
            memory_hits: stats.memory_hits.load(Ordering::Relaxed),
            disk_hits: stats.disk_hits.load(Ordering::Relaxed),
            fetches: stats.fetches.load(Ordering::Relaxed),
            joined: stats.joined.load(Ordering::Relaxed),
            failures: stats.failures.load(Ordering::Relaxed),
        }
    }

    async fn join(&self, key: &str, handle: InFlight) -> Result<Bytes, LoadError> {
        let generation = handle.generation();
        let result = handle.wait().await;

        if result == Err(LoadError::Cancelled) {
            // Normally already gone; covers a fetch task that died before cleaning up
            self.inner.cache.memory().remove_in_flight(key, generation);
        }
        result
    }

    fn spawn_fetch(&self, key: &str, generation: u64, done: Completion) {
        self.inner.stats.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, generation, "Starting fetch");

        let guard = FetchGuard {
            inner: Arc::clone(&self.inner),
            key: key.to_string(),
            generation,
            settled: false,
        };
        // The task unregisters itself in `FetchGuard::drop`, which needs this
        // lock, so it cannot settle before it is registered. The runtime is
        // resolved first so nothing under the lock can panic.
        let runtime = tokio::runtime::Handle::current();
        let mut tasks = self.inner.tasks.lock();
        let task = runtime.spawn(run_fetch(guard, done));
        let superseded = tasks
            .get(key)
            .map_or(false, |running| running.generation > generation);
        if !superseded {
            tasks.insert(
                key.to_string(),
                RunningFetch {
                    generation,
                    abort: task.abort_handle(),
                },
            );
        }
    }
}

async fn run_fetch(mut guard: FetchGuard, done: Completion) {
    let inner = Arc::clone(&guard.inner);
    let key = guard.key.clone();
    let generation = guard.generation;

    let result = match inner.transport.fetch(&key).await {
        Ok(payload) if payload.is_empty() => Err(LoadError::EmptyBody),
        other => other,
    };

    match &result {
        Ok(payload) => {
            let published = inner.cache.commit(&key, generation, payload.clone()).await;
            debug!(key = %key, generation, size = payload.len(), published, "Fetch succeeded");
        }
        Err(e) => {
            inner.stats.failures.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, generation, error = %e, "Fetch failed");
            inner.cache.memory().remove_in_flight(&key, generation);
        }
    }

    guard.settled = true;
    done.complete(result);
}

/// Cleans up after a fetch task however it ends, including abort and panic
struct FetchGuard {
    inner: Arc<Inner>,
    key: String,
    generation: u64,
    settled: bool,
}

impl Drop for FetchGuard {
    fn drop(&mut self) {
        if !self.settled
            && self
                .inner
                .cache
                .memory()
                .remove_in_flight(&self.key, self.generation)
        {
            debug!(key = %self.key, generation = self.generation, "Removed abandoned fetch");
        }

        let mut tasks = self.inner.tasks.lock();
        if tasks.get(&self.key).map(|t| t.generation) == Some(self.generation) {
            tasks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{create_loader, wait_until, StubTransport};
    use tempfile::tempdir;

    const KEY: &str = "https://example.com/cat.png";

    fn image() -> Bytes {
        Bytes::from_static(b"\x89PNG cat")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_loads_share_one_fetch() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::gated(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move { loader.load(KEY).await }));
        }

        wait_until(|| loader.stats().joined == 7).await;
        transport.release.notify_one();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Ok(image()));
        }
        assert_eq!(transport.calls(), 1);
        assert_eq!(loader.stats().fetches, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failure_is_shared_and_leaves_no_residue() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::gated(Err(LoadError::Status(500))));
        let loader = create_loader(dir.path(), transport.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move { loader.load(KEY).await }));
        }

        wait_until(|| loader.stats().joined == 4).await;
        transport.release.notify_one();

        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(LoadError::Status(500)));
        }
        assert_eq!(transport.calls(), 1);
        assert!(loader.cache().entry(KEY).await.is_none());
        assert_eq!(loader.cache().disk().total_size().await, 0);

        // The failure does not poison the next attempt
        transport.release.notify_one();
        assert_eq!(loader.load(KEY).await, Err(LoadError::Status(500)));
        assert_eq!(transport.calls(), 2);
        assert_eq!(loader.stats().failures, 2);
    }

    #[tokio::test]
    async fn test_result_is_published_to_both_tiers() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        assert_eq!(loader.load(KEY).await, Ok(image()));
        assert!(loader.cache().memory().get(KEY).unwrap().is_ready());
        assert_eq!(
            loader.cache().disk().peek(KEY).await.map(|r| r.payload),
            Some(image())
        );

        assert_eq!(loader.load(KEY).await, Ok(image()));
        assert_eq!(transport.calls(), 1);
        assert_eq!(loader.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn test_disk_hit_is_promoted_without_fetch() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        assert_eq!(loader.load(KEY).await, Ok(image()));
        assert_eq!(loader.clear_memory(), 1);

        assert_eq!(loader.load(KEY).await, Ok(image()));
        assert_eq!(transport.calls(), 1);
        assert_eq!(loader.stats().disk_hits, 1);
        assert!(loader.cache().memory().get(KEY).is_some());
    }

    #[tokio::test]
    async fn test_load_reports_source() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport).await;

        let (_, source) = loader.load_with_source(KEY).await.unwrap();
        assert_eq!(source, LoadSource::Network);
        assert!(!source.is_cache_hit());

        let (_, source) = loader.load_with_source(KEY).await.unwrap();
        assert_eq!(source, LoadSource::Memory);

        loader.clear_memory();
        let (_, source) = loader.load_with_source(KEY).await.unwrap();
        assert_eq!(source, LoadSource::Disk);
        assert!(source.is_cache_hit());
    }

    #[tokio::test]
    async fn test_empty_payload_is_a_failure() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(Bytes::new())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        assert_eq!(loader.load(KEY).await, Err(LoadError::EmptyBody));
        assert!(loader.cache().entry(KEY).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        loader.load(KEY).await.unwrap();
        loader.invalidate(KEY).await;
        assert!(loader.cache().entry(KEY).await.is_none());

        loader.load(KEY).await.unwrap();
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalidate_during_fetch_discards_result() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::gated(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        let waiter = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(KEY).await })
        };
        wait_until(|| transport.calls() == 1).await;

        loader.invalidate(KEY).await;
        transport.release.notify_one();

        // The caller still gets its image, but the stale result is not cached
        assert_eq!(waiter.await.unwrap(), Ok(image()));
        assert!(loader.cache().entry(KEY).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_fails_all_waiters() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::gated(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move { loader.load(KEY).await }));
        }
        wait_until(|| transport.calls() == 1 && loader.stats().joined == 2).await;

        assert!(loader.cancel(KEY));
        for task in tasks {
            assert_eq!(task.await.unwrap(), Err(LoadError::Cancelled));
        }
        assert!(loader.cache().entry(KEY).await.is_none());
        assert!(!loader.cancel(KEY));

        // A fresh load starts a new fetch
        transport.release.notify_one();
        assert_eq!(loader.load(KEY).await, Ok(image()));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancel_without_fetch() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport).await;

        assert!(!loader.cancel(KEY));
    }

    #[tokio::test]
    async fn test_finished_fetch_is_unregistered() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport).await;

        loader.load(KEY).await.unwrap();
        wait_until(|| loader.inner.tasks.lock().is_empty()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fast_fetches_never_stay_registered() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::new(Ok(image())));
        let loader = create_loader(dir.path(), transport).await;

        for i in 0..100 {
            loader.load(&format!("{}?v={}", KEY, i)).await.unwrap();
        }

        wait_until(|| loader.inner.tasks.lock().is_empty()).await;
        assert!(!loader.cancel(&format!("{}?v=0", KEY)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_memory_pressure_during_fetch_keeps_single_fetch() {
        let dir = tempdir().unwrap();
        let transport = Arc::new(StubTransport::gated(Ok(image())));
        let loader = create_loader(dir.path(), transport.clone()).await;

        let first = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(KEY).await })
        };
        wait_until(|| transport.calls() == 1).await;

        assert_eq!(loader.on_memory_pressure(), 0);

        let second = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.load(KEY).await })
        };
        wait_until(|| loader.stats().joined == 1).await;
        transport.release.notify_one();

        assert_eq!(first.await.unwrap(), Ok(image()));
        assert_eq!(second.await.unwrap(), Ok(image()));
        assert_eq!(transport.calls(), 1);

        // The result survived the pressure event on both tiers
        assert!(loader.cache().memory().get(KEY).unwrap().is_ready());
        assert_eq!(
            loader.cache().disk().peek(KEY).await.map(|r| r.payload),
            Some(image())
        );
    }
}
