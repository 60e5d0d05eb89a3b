//! File-based disk tier
//!
//! One file per entry, named by the hashed key, flat in a dedicated directory.
//! The file's modification time holds the expiry instant and its access time
//! the creation instant. Both are always written together, so the creation
//! instant is also recoverable as `expires_at - ttl`, which is what scans use.
//! Hidden files are temporary files of writes in progress.

use std::fmt;
use std::fs::{File, FileTimes, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::StorageError;
use crate::hasher::hash_key;
use crate::types::{DiskRecord, StoreBudget, TrimReport};

const PARTIAL_PREFIX: &str = ".partial-";

/// Expiring, size-bounded payload store
pub struct DiskStore {
    /// Directory owned exclusively by this store
    dir: PathBuf,
    budget: StoreBudget,
    clock: Arc<dyn Clock>,
    /// Serializes filesystem access of this store
    lock: Mutex<()>,
}

/// A directory entry as seen by a sweep
struct ScannedFile {
    path: PathBuf,
    name: String,
    size: u64,
    /// None when metadata could not be read
    expires_at: Option<DateTime<Utc>>,
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>, budget: StoreBudget, clock: Arc<dyn Clock>) -> Self {
        Self {
            dir: dir.into(),
            budget,
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Ensure the cache directory exists
    pub async fn init(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;
        info!(cache_dir = ?self.dir, "Disk cache initialized");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn budget(&self) -> &StoreBudget {
        &self.budget
    }

    /// On-disk location of a key's payload
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(hash_key(key))
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.budget.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn created_from(&self, expires_at: DateTime<Utc>) -> DateTime<Utc> {
        expires_at
            .checked_sub_signed(self.budget.ttl)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Read a payload and slide its expiry forward.
    ///
    /// Missing, empty, unreadable and expired files all read as absent; the
    /// latter three are deleted on the way.
    pub async fn read(&self, key: &str) -> Option<Bytes> {
        let path = self.path_for(key);
        let _guard = self.lock.lock().await;

        let (payload, expires_at) = match load_file(&path).await {
            Loaded::Found(payload, expires_at) => (payload, expires_at),
            Loaded::Missing => return None,
            Loaded::Corrupt => {
                remove_file_quietly(&path).await;
                return None;
            }
        };

        let now = self.clock.now();
        if expires_at <= now {
            debug!(key = %key, expires_at = %expires_at, "Disk entry expired");
            remove_file_quietly(&path).await;
            return None;
        }

        if let Err(e) = self.stamp(&path, now).await {
            warn!(key = %key, error = %e, "Failed to extend disk entry expiration");
        }

        debug!(key = %key, size = payload.len(), "Disk hit");
        Some(payload)
    }

    /// Persist a payload with `created_at = now` and `expires_at = now + ttl`.
    ///
    /// The bytes go to a temporary file that is renamed into place, so readers
    /// never see a partial payload. On failure any previous payload for the
    /// key is removed as well.
    pub async fn write(&self, key: &str, payload: Bytes) -> Result<(), StorageError> {
        self.write_if(key, payload, || true).await.map(|_| ())
    }

    /// Like [`DiskStore::write`], but only if `precondition` holds once the
    /// store lock is taken. Returns whether the payload was written.
    ///
    /// No other operation on this store can run between the check and the
    /// write.
    pub async fn write_if<F>(
        &self,
        key: &str,
        payload: Bytes,
        precondition: F,
    ) -> Result<bool, StorageError>
    where
        F: FnOnce() -> bool,
    {
        let path = self.path_for(key);
        let _guard = self.lock.lock().await;
        if !precondition() {
            return Ok(false);
        }

        let now = self.clock.now();
        let expires_at = self.expiry_from(now);

        let dir = self.dir.clone();
        let target = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::Builder::new()
                .prefix(PARTIAL_PREFIX)
                .tempfile_in(&dir)
                .map_err(|e| StorageError::io(&dir, e))?;
            tmp.write_all(&payload)
                .and_then(|()| tmp.flush())
                .map_err(|e| StorageError::io(&target, e))?;
            set_file_times(tmp.as_file(), now, expires_at)
                .map_err(|e| StorageError::io(&target, e))?;
            tmp.persist(&target)
                .map_err(|e| StorageError::io(&target, e.error))?;
            Ok::<(), StorageError>(())
        })
        .await
        .map_err(StorageError::from)
        .and_then(|inner| inner);

        match result {
            Ok(()) => {
                debug!(key = %key, "Wrote disk entry");
                Ok(true)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to write disk entry");
                remove_file_quietly(&path).await;
                Err(e)
            }
        }
    }

    /// Delete a key's payload; a missing file is not an error
    pub async fn remove(&self, key: &str) {
        let path = self.path_for(key);
        let _guard = self.lock.lock().await;
        remove_file_quietly(&path).await;
    }

    /// Read a record with its timestamps without touching its expiry.
    ///
    /// Unlike [`DiskStore::read`] this also returns expired records.
    pub async fn peek(&self, key: &str) -> Option<DiskRecord> {
        let path = self.path_for(key);
        let _guard = self.lock.lock().await;

        match load_file(&path).await {
            Loaded::Found(payload, expires_at) => Some(DiskRecord {
                hashed_key: hash_key(key),
                payload,
                created_at: self.created_from(expires_at),
                expires_at,
            }),
            Loaded::Missing | Loaded::Corrupt => None,
        }
    }

    /// Delete every entry whose expiry is at or before now.
    ///
    /// Entries whose metadata cannot be read are treated as expired.
    /// Temporary files left behind by interrupted writes are deleted too but
    /// not counted.
    pub async fn remove_expired(&self) -> usize {
        let mut report = TrimReport::default();
        self.expire_into(&mut report, None).await;
        report.expired_removed
    }

    /// Evict oldest-created entries once the size limit is reached.
    ///
    /// Eviction continues down to the eviction target (half the limit by
    /// default) rather than stopping at the limit. Ties on creation time are
    /// broken by hashed key.
    pub async fn remove_over_budget(&self) -> TrimReport {
        let mut report = TrimReport::default();
        let completed = self.trim_into(&mut report, None).await;
        report.completed = completed;
        report
    }

    /// Expiry sweep that adds to `report` and gives up once `deadline` has
    /// passed. Returns false if it gave up.
    pub(crate) async fn expire_into(
        &self,
        report: &mut TrimReport,
        deadline: Option<Instant>,
    ) -> bool {
        let _guard = self.lock.lock().await;
        let now = self.clock.now();

        // Writes hold the lock, so any temporary file seen here was abandoned
        let mut leftovers = 0;
        let mut removed = 0;
        let mut completed = true;
        for file in self.scan(true).await {
            if past(deadline) {
                completed = false;
                break;
            }
            if file.name.starts_with(PARTIAL_PREFIX) {
                if remove_file_quietly(&file.path).await {
                    leftovers += 1;
                }
                continue;
            }
            if file.name.starts_with('.') {
                continue;
            }

            let expired = file.expires_at.map_or(true, |expires_at| expires_at <= now);
            if expired && remove_file_quietly(&file.path).await {
                removed += 1;
            }
        }
        report.expired_removed += removed;

        if leftovers > 0 {
            debug!(leftovers, "Removed abandoned temporary files");
        }
        if removed > 0 {
            info!(removed, completed, "Removed expired disk entries");
        }
        completed
    }

    /// Size trim that adds to `report` and gives up once `deadline` has
    /// passed. Returns false if it gave up.
    pub(crate) async fn trim_into(
        &self,
        report: &mut TrimReport,
        deadline: Option<Instant>,
    ) -> bool {
        let _guard = self.lock.lock().await;

        let mut files = self.scan(false).await;
        let mut total: u64 = files.iter().map(|f| f.size).sum();
        if total < self.budget.size_limit_bytes {
            return true;
        }

        files.sort_by(|a, b| {
            let created_a = a.expires_at.map(|t| self.created_from(t));
            let created_b = b.expires_at.map(|t| self.created_from(t));
            created_a.cmp(&created_b).then_with(|| a.name.cmp(&b.name))
        });

        let mut completed = true;
        for file in files {
            if total <= self.budget.eviction_target_bytes {
                break;
            }
            if past(deadline) {
                completed = false;
                break;
            }
            total = total.saturating_sub(file.size);
            if remove_file_quietly(&file.path).await {
                report.evicted += 1;
                report.bytes_freed += file.size;
            }
        }

        info!(
            evicted = report.evicted,
            bytes_freed = report.bytes_freed,
            remaining = total,
            completed,
            "Trimmed disk cache to size budget"
        );
        completed
    }

    /// Delete every entry, including leftover temporary files
    pub async fn remove_all(&self) -> usize {
        let _guard = self.lock.lock().await;

        let mut removed = 0;
        for file in self.scan(true).await {
            if remove_file_quietly(&file.path).await && !file.name.starts_with('.') {
                removed += 1;
            }
        }

        info!(removed, "Cleared disk cache");
        removed
    }

    /// Sum of payload sizes; entries with unreadable metadata count as zero
    pub async fn total_size(&self) -> u64 {
        let _guard = self.lock.lock().await;
        self.scan(false).await.iter().map(|f| f.size).sum()
    }

    /// Reset a file's creation and expiry stamps relative to `now`
    async fn stamp(&self, path: &Path, now: DateTime<Utc>) -> Result<(), StorageError> {
        let path = path.to_path_buf();
        let expires_at = self.expiry_from(now);

        tokio::task::spawn_blocking(move || {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            set_file_times(&file, now, expires_at).map_err(|e| StorageError::io(&path, e))
        })
        .await?
    }

    /// List regular files in the cache directory. Must be called with the lock held.
    async fn scan(&self, include_hidden: bool) -> Vec<ScannedFile> {
        let mut files = Vec::new();

        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(cache_dir = ?self.dir, error = %e, "Failed to list disk cache");
                return files;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(cache_dir = ?self.dir, error = %e, "Failed to read directory entry");
                    break;
                }
            };

            let name = entry.file_name().to_string_lossy().into_owned();
            if !include_hidden && name.starts_with('.') {
                continue;
            }

            let path = entry.path();
            match entry.metadata().await {
                Ok(metadata) if metadata.is_dir() => continue,
                Ok(metadata) => files.push(ScannedFile {
                    path,
                    name,
                    size: metadata.len(),
                    expires_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                }),
                Err(_) => files.push(ScannedFile {
                    path,
                    name,
                    size: 0,
                    expires_at: None,
                }),
            }
        }

        files
    }
}

impl fmt::Debug for DiskStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskStore")
            .field("dir", &self.dir)
            .field("budget", &self.budget)
            .finish()
    }
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |deadline| Instant::now() >= deadline)
}

enum Loaded {
    Found(Bytes, DateTime<Utc>),
    Missing,
    Corrupt,
}

async fn load_file(path: &Path) -> Loaded {
    let expires_at = match fs::metadata(path).await.and_then(|m| m.modified()) {
        Ok(modified) => DateTime::<Utc>::from(modified),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Loaded::Missing,
        Err(e) => {
            warn!(path = ?path, error = %e, "Unreadable disk entry metadata");
            return Loaded::Corrupt;
        }
    };

    match fs::read(path).await {
        Ok(data) if data.is_empty() => Loaded::Corrupt,
        Ok(data) => Loaded::Found(Bytes::from(data), expires_at),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Loaded::Missing,
        Err(e) => {
            warn!(path = ?path, error = %e, "Unreadable disk entry");
            Loaded::Corrupt
        }
    }
}

fn set_file_times(
    file: &File,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> std::io::Result<()> {
    let times = FileTimes::new()
        .set_accessed(SystemTime::from(created_at))
        .set_modified(SystemTime::from(expires_at));
    file.set_times(times)
}

/// Returns true if a file was actually deleted
async fn remove_file_quietly(path: &Path) -> bool {
    match fs::remove_file(path).await {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(path = ?path, error = %e, "Failed to remove disk entry");
            false
        }
    }
}
