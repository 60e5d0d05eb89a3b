//! Volatile memory tier

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::types::CacheEntry;

/// Key to entry table guarded by a single lock.
///
/// Has no size bound of its own; the host empties it on memory pressure.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Insert or replace. A replaced in-flight handle keeps running for whoever holds it.
    pub fn set(&self, key: &str, entry: CacheEntry) {
        self.entries.write().insert(key.to_string(), entry);
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        self.entries.write().remove(key)
    }

    /// Drop every ready payload, returning how many were dropped.
    ///
    /// In-flight entries stay: they are the only record that a fetch is
    /// running, and the fetch still needs them to publish its result.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_ready());
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Return the current entry, or insert the one built by `make` if the key is vacant.
    ///
    /// The boolean is true when `make` ran. Lookup and insert happen under one
    /// write lock, so at most one caller per key can observe a vacancy.
    pub fn get_or_insert_with<F>(&self, key: &str, make: F) -> (CacheEntry, bool)
    where
        F: FnOnce() -> CacheEntry,
    {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(key) {
            return (existing.clone(), false);
        }

        let entry = make();
        entries.insert(key.to_string(), entry.clone());
        (entry, true)
    }

    /// Remove a ready entry only if it still holds this exact payload
    pub fn remove_payload(&self, key: &str, payload: &Bytes) -> bool {
        let mut entries = self.entries.write();
        let same = matches!(
            entries.get(key),
            Some(CacheEntry::Ready(current))
                if current.as_ptr() == payload.as_ptr() && current.len() == payload.len()
        );
        if same {
            entries.remove(key);
        }
        same
    }

    /// Replace the entry only if it is still the in-flight fetch of `generation`
    pub fn replace_in_flight(&self, key: &str, generation: u64, entry: CacheEntry) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(current) if current.generation() == Some(generation) => {
                *current = entry;
                true
            }
            _ => false,
        }
    }

    /// Remove the entry only if it is still the in-flight fetch of `generation`
    pub fn remove_in_flight(&self, key: &str, generation: u64) -> bool {
        let mut entries = self.entries.write();
        if entries.get(key).and_then(CacheEntry::generation) == Some(generation) {
            entries.remove(key);
            true
        } else {
            false
        }
    }
}
