//! Transactional views over a [`KvStore`].
//!
//! [`Database::view`] gives a consistent read-only view. [`Database::update`]
//! buffers writes in an overlay (reads see them) and commits the whole
//! overlay atomically when the closure returns `Ok`. Writers are serialized.

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::LedgerError;
use crate::kv::{successor, Bucket, Entry, KvStore, WriteOp};

/// Page size used by [`KvRead::scan_all`].
const SCAN_PAGE: usize = 256;

/// Read access shared by read-only and read-write transactions.
pub trait KvRead {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError>;

    /// See [`KvStore::scan`].
    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError>;

    fn contains(&self, bucket: Bucket, key: &[u8]) -> Result<bool, LedgerError> {
        Ok(self.get(bucket, key)?.is_some())
    }

    /// Every entry under `prefix`.
    fn scan_all(&self, bucket: Bucket, prefix: &[u8]) -> Result<Vec<Entry>, LedgerError> {
        let mut out = Vec::new();
        let mut start = prefix.to_vec();
        loop {
            let page = self.scan(bucket, prefix, &start, SCAN_PAGE)?;
            let done = page.len() < SCAN_PAGE;
            if let Some((last, _)) = page.last() {
                start = successor(last);
            }
            out.extend(page);
            if done {
                return Ok(out);
            }
        }
    }

    /// Whether any key starts with `prefix`.
    fn has_prefix(&self, bucket: Bucket, prefix: &[u8]) -> Result<bool, LedgerError> {
        Ok(!self.scan(bucket, prefix, prefix, 1)?.is_empty())
    }
}

/// Shared handle to a store with single-writer transactions.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn KvStore>,
    writer: Arc<Mutex<()>>,
    /// Held shared by views, exclusively while a commit is applied.
    commit: Arc<RwLock<()>>,
}

impl Database {
    /// Wrap `store`, which must not be written to by anything else.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            writer: Arc::new(Mutex::new(())),
            commit: Arc::new(RwLock::new(())),
        }
    }

    /// Run `f` against a read-only view. Commits wait until the view ends.
    pub fn view<T, E>(&self, f: impl FnOnce(&ReadTx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<LedgerError>,
    {
        let tx = ReadTx {
            store: self.store.as_ref(),
            _guard: self.commit.read(),
        };
        f(&tx)
    }

    /// Run `f` in a read-write transaction. All writes commit atomically if
    /// `f` returns `Ok`; on `Err` nothing is written.
    pub fn update<T, E>(&self, f: impl FnOnce(&mut DbTx<'_>) -> Result<T, E>) -> Result<T, E>
    where
        E: From<LedgerError>,
    {
        let _writer = self.writer.lock();
        let mut tx = DbTx {
            store: self.store.as_ref(),
            overlay: BTreeMap::new(),
        };
        let value = f(&mut tx)?;
        let ops = tx.into_ops();
        if !ops.is_empty() {
            let _commit = self.commit.write();
            self.store.write(ops)?;
        }
        Ok(value)
    }
}

/// Read-only transaction.
pub struct ReadTx<'a> {
    store: &'a dyn KvStore,
    _guard: RwLockReadGuard<'a, ()>,
}

impl KvRead for ReadTx<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        self.store.get(bucket, key)
    }

    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError> {
        self.store.scan(bucket, prefix, start, limit)
    }
}

/// Read-write transaction with read-your-writes semantics.
pub struct DbTx<'a> {
    store: &'a dyn KvStore,
    /// `None` marks a pending delete.
    overlay: BTreeMap<(Bucket, Vec<u8>), Option<Vec<u8>>>,
}

impl DbTx<'_> {
    /// Buffer a write, visible to later reads in this transaction.
    pub fn put(&mut self, bucket: Bucket, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.overlay.insert((bucket, key.into()), Some(value));
    }

    /// Buffer a delete.
    pub fn delete(&mut self, bucket: Bucket, key: impl Into<Vec<u8>>) {
        self.overlay.insert((bucket, key.into()), None);
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.overlay.len()
    }

    fn into_ops(self) -> Vec<WriteOp> {
        self.overlay
            .into_iter()
            .map(|((bucket, key), value)| match value {
                Some(value) => WriteOp::Put { bucket, key, value },
                None => WriteOp::Delete { bucket, key },
            })
            .collect()
    }

    /// Overlay entries in `bucket` with `prefix`, from `from` up to `to` inclusive.
    fn overlay_range(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        from: &[u8],
        to: Option<&[u8]>,
    ) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        let lower = Bound::Included((bucket, from.to_vec()));
        self.overlay
            .range((lower, Bound::Unbounded))
            .take_while(move |((b, k), _)| {
                *b == bucket && k.starts_with(prefix) && to.is_none_or(|to| k.as_slice() <= to)
            })
            .map(|((_, k), v)| (k, v))
    }
}

impl KvRead for DbTx<'_> {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        match self.overlay.get(&(bucket, key.to_vec())) {
            Some(value) => Ok(value.clone()),
            None => self.store.get(bucket, key),
        }
    }

    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError> {
        let mut out = Vec::new();
        let mut cursor = if start > prefix { start.to_vec() } else { prefix.to_vec() };
        loop {
            let page = self.store.scan(bucket, prefix, &cursor, limit.max(1))?;
            // A short page means the store has nothing past it under `prefix`.
            let upper = if page.len() < limit.max(1) {
                None
            } else {
                page.last().map(|(k, _)| k.clone())
            };

            let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = page.into_iter().collect();
            for (key, value) in self.overlay_range(bucket, prefix, &cursor, upper.as_deref()) {
                match value {
                    Some(v) => merged.insert(key.clone(), v.clone()),
                    None => merged.remove(key),
                };
            }

            for entry in merged {
                if out.len() >= limit {
                    return Ok(out);
                }
                out.push(entry);
            }
            match upper {
                Some(last) if out.len() < limit => cursor = successor(&last),
                _ => return Ok(out),
            }
        }
    }
}
