//! RocksDB-backed [`KvStore`].
//!
//! Each [`Bucket`] is a column family. Writes go through a single atomic
//! [`WriteBatch`] so a failed commit leaves no partial state behind.

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use crate::error::LedgerError;
use crate::kv::{scan_start, Bucket, Entry, KvStore, WriteOp};

/// RocksDB-backed persistent store.
pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Bucket::ALL
            .iter()
            .map(|b| ColumnFamilyDescriptor::new(b.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(|e| LedgerError::Database(e.to_string()))?;
        tracing::info!(path = %path.as_ref().display(), "opened ledger database");
        Ok(Self { db })
    }

    fn cf_handle(&self, bucket: Bucket) -> Result<&rocksdb::ColumnFamily, LedgerError> {
        self.db
            .cf_handle(bucket.name())
            .ok_or_else(|| LedgerError::Database(format!("missing column family: {}", bucket.name())))
    }
}

impl KvStore for RocksStore {
    fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        let cf = self.cf_handle(bucket)?;
        self.db
            .get_cf(cf, key)
            .map_err(|e| LedgerError::Database(e.to_string()))
    }

    fn scan(
        &self,
        bucket: Bucket,
        prefix: &[u8],
        start: &[u8],
        limit: usize,
    ) -> Result<Vec<Entry>, LedgerError> {
        let cf = self.cf_handle(bucket)?;
        let from = scan_start(prefix, start);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(from, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(|e| LedgerError::Database(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), LedgerError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { bucket, key, value } => {
                    batch.put_cf(self.cf_handle(bucket)?, key, value);
                }
                WriteOp::Delete { bucket, key } => {
                    batch.delete_cf(self.cf_handle(bucket)?, key);
                }
            }
        }
        self.db
            .write(batch)
            .map_err(|e| LedgerError::Database(e.to_string()))
    }
}
