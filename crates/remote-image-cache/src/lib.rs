//! Two-tier remote image cache
//!
//! Fetches images by URL, coalesces concurrent requests for the same key into
//! a single fetch, and keeps successful results in a volatile memory tier and
//! an expiring, size-bounded disk tier.

pub mod cache;
pub mod clock;
pub mod config;
pub mod decode;
pub mod disk;
pub mod error;
pub mod hasher;
pub mod lifecycle;
pub mod loader;
pub mod memory;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use cache::{ImageCache, Lookup};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use disk::DiskStore;
pub use error::{LoadError, StorageError};
pub use hasher::hash_key;
pub use loader::{ImageLoader, LoadSource};
pub use memory::MemoryStore;
pub use transport::{FetchTransport, HttpTransport};
pub use types::{CacheEntry, DiskRecord, InFlight, LoaderStats, StoreBudget, TrimReport};
