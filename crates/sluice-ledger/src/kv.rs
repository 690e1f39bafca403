//! Minimal key-value contract the ledger is built on.
//!
//! A store exposes named buckets with ordered keys, point reads, resumable
//! prefix scans, and atomic multi-bucket writes. [`MemoryStore`] backs tests;
//! [`RocksStore`](crate::storage::RocksStore) backs real wallets.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use crate::error::LedgerError;

/// Storage namespaces. Each maps to one RocksDB column family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bucket {
    /// height -> block record (hash, time, txids)
    Blocks,
    /// txid || height -> mined tx record
    MinedTxs,
    /// txid -> unmined tx record
    UnminedTxs,
    /// txid || height || vout -> mined credit
    Credits,
    /// outpoint -> height of the mined, unspent credit
    Unspent,
    /// txid || height || input index -> debit
    Debits,
    /// outpoint -> unmined credit
    UnminedCredits,
    /// outpoint || spender txid -> ()
    UnminedInputs,
    /// height -> block meta of the sync tip history
    SyncTip,
    /// named singleton values
    Meta,
}

impl Bucket {
    pub const ALL: [Bucket; 10] = [
        Bucket::Blocks,
        Bucket::MinedTxs,
        Bucket::UnminedTxs,
        Bucket::Credits,
        Bucket::Unspent,
        Bucket::Debits,
        Bucket::UnminedCredits,
        Bucket::UnminedInputs,
        Bucket::SyncTip,
        Bucket::Meta,
    ];

    /// Buckets holding transaction history (everything but sync state and meta).
    pub const HISTORY: [Bucket; 8] = [
        Bucket::Blocks,
        Bucket::MinedTxs,
        Bucket::UnminedTxs,
        Bucket::Credits,
        Bucket::Unspent,
        Bucket::Debits,
        Bucket::UnminedCredits,
        Bucket::UnminedInputs,
    ];

    /// Column family name.
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Blocks => "blocks",
            Bucket::MinedTxs => "mined_txs",
            Bucket::UnminedTxs => "unmined_txs",
            Bucket::Credits => "credits",
            Bucket::Unspent => "unspent",
            Bucket::Debits => "debits",
            Bucket::UnminedCredits => "unmined_credits",
            Bucket::UnminedInputs => "unmined_inputs",
            Bucket::SyncTip => "sync_tip",
            Bucket::Meta => "meta",
        }
    }
}

/// A single mutation in an atomic write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { bucket: Bucket, key: Vec<u8>, value: Vec<u8> },
    Delete { bucket: Bucket, key: Vec<u8> },
}

/// A key/value entry returned by scans.
pub type Entry = (Vec<u8>, Vec<u8>);

/// Persistent ordered key-value store.
pub trait KvStore: Send + Sync {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Up to `limit` entries whose keys start with `prefix` and are `>= start`,
    /// in ascending key order. An empty `start` begins at `prefix`.
    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError>;

    /// Apply all operations atomically, in order.
    fn write(&self, ops: Vec<WriteOp>) -> Result<(), LedgerError>;
}

/// Effective first key of a scan.
pub(crate) fn scan_start<'a>(prefix: &'a [u8], start: &'a [u8]) -> &'a [u8] {
    if start > prefix { start } else { prefix }
}

/// Smallest key strictly greater than `key`.
pub fn successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// In-memory store: one ordered map per bucket.
#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<HashMap<Bucket, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every entry in `buckets`, for whole-state comparisons.
    pub fn snapshot(&self, buckets: &[Bucket]) -> BTreeMap<(Bucket, Vec<u8>), Vec<u8>> {
        let guard = self.buckets.read();
        let mut out = BTreeMap::new();
        for bucket in buckets {
            if let Some(map) = guard.get(bucket) {
                for (k, v) in map {
                    out.insert((*bucket, k.clone()), v.clone());
                }
            }
        }
        out
    }

    /// Number of entries in a bucket.
    pub fn len(&self, bucket: Bucket) -> usize {
        self.buckets.read().get(&bucket).map_or(0, BTreeMap::len)
    }
}

impl KvStore for MemoryStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self
            .buckets
            .read()
            .get(&bucket)
            .and_then(|m| m.get(key).cloned()))
    }

    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError> {
        let guard = self.buckets.read();
        let Some(map) = guard.get(&bucket) else {
            return Ok(Vec::new());
        };
        Ok(map
            .range(scan_start(prefix, start).to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), LedgerError> {
        let mut guard = self.buckets.write();
        for op in ops {
            match op {
                WriteOp::Put { bucket, key, value } => {
                    guard.entry(bucket).or_default().insert(key, value);
                }
                WriteOp::Delete { bucket, key } => {
                    if let Some(map) = guard.get_mut(&bucket) {
                        map.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}
