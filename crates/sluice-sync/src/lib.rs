//! # sluice-sync: block scanning for the Sluice wallet.
//!
//! Fetches and filters blocks from a [`ChainSource`](sluice_core::traits::ChainSource)
//! on a bounded worker pool and commits the results into the ledger in
//! height order. The main entry point is [`SyncEngine`], which owns live
//! sync, rescans and reorg rollback.

pub mod config;
pub mod error;
pub mod sync;
pub mod watchlist;
pub mod workqueue;

pub use config::SyncConfig;
pub use error::SyncError;
pub use sync::{RescanJob, RescanProgress, ScanOutcome, SyncEngine, SyncState, SyncStatus};
pub use watchlist::{WatchList, WatchSnapshot};
pub use workqueue::WorkQueue;
