//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of parallel fetch/filter workers.
pub const DEFAULT_WORKERS: usize = 6;
/// Default bound on fetched-but-unconsumed heights.
pub const DEFAULT_BACKLOG: usize = 32;
/// Default number of heights committed per storage transaction.
pub const DEFAULT_BATCH_SIZE: u32 = 8;
/// Default delay between live-sync polls of the chain source.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
/// Default deepest reorg the engine will unwind on its own.
pub const DEFAULT_MAX_REORG_DEPTH: u32 = 100;

/// Configuration for the [`SyncEngine`](crate::sync::SyncEngine).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Parallel fetch and filter workers.
    pub workers: usize,
    /// Heights fetched ahead of the committer.
    pub backlog: usize,
    /// Heights committed per storage transaction.
    pub batch_size: u32,
    /// Live-sync poll delay in milliseconds.
    pub poll_interval_ms: u64,
    /// Deepest reorg unwound automatically. Also the sync tip history kept.
    pub max_reorg_depth: u32,
    /// Height to start from when the ledger has no sync tip.
    pub start_height: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            backlog: DEFAULT_BACKLOG,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_reorg_depth: DEFAULT_MAX_REORG_DEPTH,
            start_height: 0,
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
