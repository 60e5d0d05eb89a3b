//! Two-tier cache facade over the memory and disk stores

use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::disk::DiskStore;
use crate::error::StorageError;
use crate::memory::MemoryStore;
use crate::types::{CacheEntry, TrimReport};

/// Where a lookup was answered from
#[derive(Debug, Clone)]
pub enum Lookup {
    Memory(CacheEntry),
    Disk(Bytes),
}

impl Lookup {
    pub fn into_entry(self) -> CacheEntry {
        match self {
            Lookup::Memory(entry) => entry,
            Lookup::Disk(payload) => CacheEntry::Ready(payload),
        }
    }
}

/// Memory tier in front of a disk tier
#[derive(Debug)]
pub struct ImageCache {
    memory: MemoryStore,
    disk: DiskStore,
}

impl ImageCache {
    pub fn new(memory: MemoryStore, disk: DiskStore) -> Self {
        Self { memory, disk }
    }

    /// Build a cache from configuration and create its directory
    pub async fn open(config: &CacheConfig) -> Result<Self, StorageError> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        config: &CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let disk = DiskStore::new(&config.cache_dir, config.budget(), clock);
        disk.init().await?;
        Ok(Self::new(MemoryStore::new(), disk))
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub fn disk(&self) -> &DiskStore {
        &self.disk
    }

    /// Memory first, then disk. A disk hit is not copied into memory.
    pub async fn lookup(&self, key: &str) -> Option<Lookup> {
        if let Some(entry) = self.memory.get(key) {
            return Some(Lookup::Memory(entry));
        }
        self.disk.read(key).await.map(Lookup::Disk)
    }

    pub async fn entry(&self, key: &str) -> Option<CacheEntry> {
        self.lookup(key).await.map(Lookup::into_entry)
    }

    /// Store an entry in memory, and on disk when it is ready.
    ///
    /// If the disk write fails the memory entry is dropped too, so neither
    /// tier holds a payload the other lost.
    pub async fn set(&self, key: &str, entry: CacheEntry) {
        let payload = match &entry {
            CacheEntry::Ready(payload) => Some(payload.clone()),
            CacheEntry::InProgress(_) => None,
        };
        self.memory.set(key, entry);

        if let Some(payload) = payload {
            self.persist(key, payload).await;
        }
    }

    /// Copy a disk hit into memory without rewriting it, unless memory already has the key
    pub fn promote(&self, key: &str, payload: Bytes) {
        let (_, inserted) = self
            .memory
            .get_or_insert_with(key, || CacheEntry::Ready(payload));
        if inserted {
            debug!(key = %key, "Promoted disk entry to memory");
        }
    }

    /// Publish the result of fetch `generation`.
    ///
    /// Does nothing and returns false if the key no longer holds that fetch
    /// (it was invalidated or superseded while running). The memory swap
    /// happens under the disk lock, so a concurrent `remove` either prevents
    /// the publish or runs after the disk write.
    pub async fn commit(&self, key: &str, generation: u64, payload: Bytes) -> bool {
        let entry = CacheEntry::Ready(payload.clone());
        let written = self
            .disk
            .write_if(key, payload.clone(), || {
                self.memory.replace_in_flight(key, generation, entry)
            })
            .await;

        match written {
            Ok(true) => true,
            Ok(false) => {
                debug!(key = %key, generation, "Fetch result superseded, not publishing");
                false
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to persist entry, dropping it from memory");
                self.memory.remove_payload(key, &payload);
                true
            }
        }
    }

    pub async fn remove(&self, key: &str) {
        self.memory.remove(key);
        self.disk.remove(key).await;
    }

    pub fn clear_memory(&self) -> usize {
        self.memory.clear()
    }

    pub async fn clear_disk(&self) -> usize {
        self.disk.remove_all().await
    }

    /// Expire stale entries, then trim to the size budget
    pub async fn expire_and_trim(&self) -> TrimReport {
        self.expire_and_trim_until(None).await
    }

    /// Same as [`ImageCache::expire_and_trim`], but stops between file
    /// operations once `deadline` passes. The report counts what was
    /// actually removed and has `completed == false` if it stopped early.
    pub async fn expire_and_trim_until(&self, deadline: Option<Instant>) -> TrimReport {
        let mut report = TrimReport::default();
        let completed = self.disk.expire_into(&mut report, deadline).await
            && self.disk.trim_into(&mut report, deadline).await;
        report.completed = completed;
        report
    }

    async fn persist(&self, key: &str, payload: Bytes) {
        if let Err(e) = self.disk.write(key, payload.clone()).await {
            warn!(key = %key, error = %e, "Failed to persist entry, dropping it from memory");
            self.memory.remove_payload(key, &payload);
        }
    }
}
