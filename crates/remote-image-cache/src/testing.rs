//! Shared fixtures for unit tests

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::cache::ImageCache;
use crate::clock::SystemClock;
use crate::disk::DiskStore;
use crate::error::LoadError;
use crate::loader::ImageLoader;
use crate::memory::MemoryStore;
use crate::transport::FetchTransport;
use crate::types::StoreBudget;

/// Transport returning a canned response, optionally held until released
pub struct StubTransport {
    calls: AtomicUsize,
    gated: bool,
    pub release: Notify,
    response: Result<Bytes, LoadError>,
}

impl StubTransport {
    pub fn new(response: Result<Bytes, LoadError>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            gated: false,
            release: Notify::new(),
            response,
        }
    }

    /// Every fetch waits for one `release.notify_one()`
    pub fn gated(response: Result<Bytes, LoadError>) -> Self {
        Self {
            gated: true,
            ..Self::new(response)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FetchTransport for StubTransport {
    async fn fetch(&self, _key: &str) -> Result<Bytes, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.gated {
            self.release.notified().await;
        }
        self.response.clone()
    }
}

pub async fn create_loader(dir: &Path, transport: Arc<StubTransport>) -> ImageLoader {
    let disk = DiskStore::new(dir, StoreBudget::default(), Arc::new(SystemClock));
    disk.init().await.unwrap();
    let cache = Arc::new(ImageCache::new(MemoryStore::new(), disk));
    ImageLoader::new(cache, transport)
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
