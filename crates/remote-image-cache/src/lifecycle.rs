//! Hooks for the host's process lifecycle notifications
//!
//! The cache never schedules maintenance itself. The host calls these from
//! whatever signals its platform provides.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::loader::ImageLoader;
use crate::types::TrimReport;

impl ImageLoader {
    /// The host is low on memory: drop the payloads held in memory
    pub fn on_memory_pressure(&self) -> usize {
        let dropped = self.clear_memory();
        info!(dropped, "Memory pressure, cleared memory cache");
        dropped
    }

    /// The host is about to exit: expire and trim the disk tier
    pub async fn on_will_terminate(&self) -> TrimReport {
        let report = self.cache().expire_and_trim().await;
        info!(
            expired = report.expired_removed,
            evicted = report.evicted,
            bytes_freed = report.bytes_freed,
            "Disk maintenance before termination"
        );
        report
    }

    /// The host went to the background and granted `window` of execution time.
    ///
    /// Maintenance that does not finish in time stops between file
    /// operations; every deletion is a single atomic unlink, so a stopped
    /// sweep leaves the store consistent. The report counts what was removed
    /// before stopping and has `completed == false`.
    pub async fn on_enter_background(&self, window: Duration) -> TrimReport {
        let deadline = Instant::now() + window;
        let report = self.cache().expire_and_trim_until(Some(deadline)).await;
        if !report.completed {
            warn!(
                window_ms = window.as_millis() as u64,
                expired = report.expired_removed,
                evicted = report.evicted,
                "Background maintenance stopped at deadline"
            );
        }
        report
    }
}
