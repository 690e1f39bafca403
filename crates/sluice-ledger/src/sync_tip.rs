//! The block the ledger considers current, with per-height history so
//! rollback can step the tip back one block at a time.

use sluice_core::types::BlockMeta;

use crate::db::{DbTx, KvRead};
use crate::error::LedgerError;
use crate::keys::{decode, decode_height, encode, height_key};
use crate::kv::Bucket;
use crate::ledger::Ledger;

const META_TIP_HEIGHT: &[u8] = b"sync_tip_height";

impl Ledger {
    /// Current sync tip, `None` before the first block is connected.
    pub fn sync_tip(&self, r: &impl KvRead) -> Result<Option<BlockMeta>, LedgerError> {
        let Some(height) = r.get(Bucket::Meta, META_TIP_HEIGHT)? else {
            return Ok(None);
        };
        let height = decode_height(&height)?;
        let meta = self
            .sync_stamp(r, height)?
            .ok_or_else(|| LedgerError::Corrupt(format!("sync tip {height} has no history entry")))?;
        Ok(Some(meta))
    }

    /// Recorded sync history entry at `height`.
    pub fn sync_stamp(
        &self,
        r: &impl KvRead,
        height: u32,
    ) -> Result<Option<BlockMeta>, LedgerError> {
        r.get(Bucket::SyncTip, &height_key(height))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Advance the tip to `meta`, which must sit exactly one block above it.
    pub fn set_sync_tip(&self, tx: &mut DbTx<'_>, meta: &BlockMeta) -> Result<(), LedgerError> {
        if let Some(current) = self.sync_tip(tx)? {
            if meta.height() != current.height() + 1 {
                return Err(LedgerError::Input(format!(
                    "sync tip must advance one block at a time: at {}, got {}",
                    current.height(),
                    meta.height()
                )));
            }
        }
        self.write_tip(tx, meta)
    }

    /// Step the tip back one block. Returns the new tip.
    pub fn rewind_sync_tip(&self, tx: &mut DbTx<'_>) -> Result<Option<BlockMeta>, LedgerError> {
        let current = self
            .sync_tip(tx)?
            .ok_or_else(|| LedgerError::Input("no sync tip to rewind".into()))?;
        tx.delete(Bucket::SyncTip, height_key(current.height()).to_vec());

        let previous = match current.height().checked_sub(1) {
            Some(h) => self.sync_stamp(tx, h)?,
            None => None,
        };
        match previous {
            Some(prev) => tx.put(
                Bucket::Meta,
                META_TIP_HEIGHT.to_vec(),
                height_key(prev.height()).to_vec(),
            ),
            None => tx.delete(Bucket::Meta, META_TIP_HEIGHT.to_vec()),
        }
        Ok(previous)
    }

    /// Forget all sync history and make `meta` the tip.
    pub fn reset_sync_tip(&self, tx: &mut DbTx<'_>, meta: &BlockMeta) -> Result<(), LedgerError> {
        self.clear_sync_tip(tx)?;
        self.write_tip(tx, meta)
    }

    /// Forget all sync history. The next connected block may be at any height.
    pub fn clear_sync_tip(&self, tx: &mut DbTx<'_>) -> Result<(), LedgerError> {
        for (key, _) in tx.scan_all(Bucket::SyncTip, &[])? {
            tx.delete(Bucket::SyncTip, key);
        }
        tx.delete(Bucket::Meta, META_TIP_HEIGHT.to_vec());
        Ok(())
    }

    /// Drop history entries more than `keep` blocks below the tip, so at
    /// most `keep` rewinds are possible. Returns the number removed.
    pub fn prune_sync_history(&self, tx: &mut DbTx<'_>, keep: u32) -> Result<usize, LedgerError> {
        let Some(tip) = self.sync_tip(tx)? else {
            return Ok(0);
        };
        let Some(cutoff) = tip.height().checked_sub(keep) else {
            return Ok(0);
        };
        let mut pruned = 0;
        for (key, _) in tx.scan_all(Bucket::SyncTip, &[])? {
            if decode_height(&key)? >= cutoff {
                break;
            }
            tx.delete(Bucket::SyncTip, key);
            pruned += 1;
        }
        Ok(pruned)
    }

    fn write_tip(&self, tx: &mut DbTx<'_>, meta: &BlockMeta) -> Result<(), LedgerError> {
        tx.put(Bucket::SyncTip, height_key(meta.height()).to_vec(), encode(meta)?);
        tx.put(Bucket::Meta, META_TIP_HEIGHT.to_vec(), height_key(meta.height()).to_vec());
        Ok(())
    }

    /// Store an opaque named value alongside the ledger.
    pub fn put_meta(&self, tx: &mut DbTx<'_>, key: &[u8], value: Vec<u8>) {
        tx.put(Bucket::Meta, key.to_vec(), value);
    }

    /// Value stored with [`put_meta`](Self::put_meta).
    pub fn get_meta(&self, r: &impl KvRead, key: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
        r.get(Bucket::Meta, key)
    }

    /// Remove a value stored with [`put_meta`](Self::put_meta).
    pub fn delete_meta(&self, tx: &mut DbTx<'_>, key: &[u8]) {
        tx.delete(Bucket::Meta, key.to_vec());
    }
}
