//! # sluice-ledger: wallet transaction ledger.
//!
//! - [`kv`]: the ordered key-value contract and an in-memory store
//! - [`storage::RocksStore`]: RocksDB-backed store
//! - [`db::Database`]: read-only views and single-writer transactions
//! - [`ledger::Ledger`]: credits, debits, unmined pool, rollback, balances
//! - [`locks::LockedOutpoints`]: named outpoint locks

pub mod db;
pub mod error;
pub mod keys;
pub mod kv;
pub mod ledger;
pub mod locks;
mod query;
pub mod records;
pub mod storage;
mod sync_tip;

pub use db::{Database, DbTx, KvRead, ReadTx};
pub use error::LedgerError;
pub use kv::{Bucket, KvStore, MemoryStore};
pub use ledger::Ledger;
pub use locks::LockedOutpoints;
pub use records::{Balances, Credit, TxDetails, TxRecord};
pub use storage::RocksStore;
