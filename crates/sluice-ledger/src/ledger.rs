//! Credit/debit bookkeeping: the mined and unmined pools and block rollback.
//!
//! All mutating operations run inside a caller-supplied [`DbTx`], so a batch
//! of inserts, credits and rollbacks commits or fails as a unit.

use tracing::{debug, info};

use sluice_core::constants::ChainParams;
use sluice_core::types::{BlockMeta, Hash256, OutPoint};

use crate::db::{DbTx, KvRead};
use crate::error::LedgerError;
use crate::keys::{
    decode, encode, height_key, indexed_key, outpoint_key, tx_key, tx_key_height,
    unmined_input_key, unmined_input_spender,
};
use crate::kv::Bucket;
use crate::records::{
    BlockRecord, CreditRecord, DebitRecord, SpentBy, TxRecord, UnminedCredit,
};

/// Wallet transaction ledger.
///
/// Stateless apart from chain parameters; every operation reads and writes
/// through the transaction it is handed.
#[derive(Clone, Debug)]
pub struct Ledger {
    params: ChainParams,
}

impl Ledger {
    /// Create a ledger using `params` for coinbase maturity.
    pub fn new(params: ChainParams) -> Self {
        Self { params }
    }

    /// Chain parameters the ledger was created with.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    // --- Lookups ---

    pub(crate) fn block_record(
        &self,
        r: &impl KvRead,
        height: u32,
    ) -> Result<Option<BlockRecord>, LedgerError> {
        r.get(Bucket::Blocks, &height_key(height))?
            .map(|b| decode(&b))
            .transpose()
    }

    /// The block recorded at `height`, if any wallet transaction was mined there.
    pub fn block_at(&self, r: &impl KvRead, height: u32) -> Result<Option<BlockMeta>, LedgerError> {
        Ok(self.block_record(r, height)?.map(|b| b.meta(height)))
    }

    /// Txids recorded at `height`, in block order.
    pub fn block_txids(&self, r: &impl KvRead, height: u32) -> Result<Vec<Hash256>, LedgerError> {
        Ok(self.block_record(r, height)?.map(|b| b.txids).unwrap_or_default())
    }

    pub(crate) fn credit(
        &self,
        r: &impl KvRead,
        key: &[u8],
    ) -> Result<Option<CreditRecord>, LedgerError> {
        r.get(Bucket::Credits, key)?.map(|b| decode(&b)).transpose()
    }

    pub(crate) fn unmined_credit(
        &self,
        r: &impl KvRead,
        outpoint: &OutPoint,
    ) -> Result<Option<UnminedCredit>, LedgerError> {
        r.get(Bucket::UnminedCredits, &outpoint_key(outpoint))?
            .map(|b| decode(&b))
            .transpose()
    }

    pub(crate) fn unmined_record(
        &self,
        r: &impl KvRead,
        txid: &Hash256,
    ) -> Result<Option<TxRecord>, LedgerError> {
        r.get(Bucket::UnminedTxs, txid.as_bytes())?
            .map(|b| decode(&b))
            .transpose()
    }

    /// Height of the mined, unspent credit at `outpoint`.
    pub(crate) fn unspent_height(
        &self,
        r: &impl KvRead,
        outpoint: &OutPoint,
    ) -> Result<Option<u32>, LedgerError> {
        r.get(Bucket::Unspent, &outpoint_key(outpoint))?
            .map(|v| crate::keys::decode_height(&v))
            .transpose()
    }

    /// Whether an unmined transaction spends `outpoint`.
    pub fn has_unmined_spender(
        &self,
        r: &impl KvRead,
        outpoint: &OutPoint,
    ) -> Result<bool, LedgerError> {
        r.has_prefix(Bucket::UnminedInputs, &outpoint_key(outpoint))
    }

    pub(crate) fn unmined_spenders(
        &self,
        r: &impl KvRead,
        outpoint: &OutPoint,
    ) -> Result<Vec<Hash256>, LedgerError> {
        r.scan_all(Bucket::UnminedInputs, &outpoint_key(outpoint))?
            .iter()
            .map(|(k, _)| unmined_input_spender(k))
            .collect()
    }

    /// Whether `txid` is recorded in the unmined pool.
    pub fn is_unmined(&self, r: &impl KvRead, txid: &Hash256) -> Result<bool, LedgerError> {
        r.contains(Bucket::UnminedTxs, txid.as_bytes())
    }

    /// Whether `txid` is recorded in any block.
    pub fn is_mined(&self, r: &impl KvRead, txid: &Hash256) -> Result<bool, LedgerError> {
        r.has_prefix(Bucket::MinedTxs, txid.as_bytes())
    }

    /// Heights at which `txid` is recorded, ascending.
    pub fn mined_heights(&self, r: &impl KvRead, txid: &Hash256) -> Result<Vec<u32>, LedgerError> {
        r.scan_all(Bucket::MinedTxs, txid.as_bytes())?
            .iter()
            .map(|(k, _)| tx_key_height(k))
            .collect()
    }

    // --- Inserts ---

    /// Record a transaction in the unmined pool (`block == None`) or under `block`.
    ///
    /// Unmined inserts are idempotent and skipped when the transaction is
    /// already mined. Mined inserts move the record out of the unmined pool,
    /// mark spent credits, and remove unmined double spends together with
    /// everything depending on them. A transaction already recorded at another
    /// height is only valid at one of them, so the block holding the older
    /// record is rolled back first. Returns whether anything was written.
    pub fn insert_transaction(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
        block: Option<&BlockMeta>,
    ) -> Result<bool, LedgerError> {
        match block {
            None => self.insert_unmined(tx, rec),
            Some(block) => self.insert_mined(tx, rec, block),
        }
    }

    fn insert_unmined(&self, tx: &mut DbTx<'_>, rec: &TxRecord) -> Result<bool, LedgerError> {
        if rec.tx.is_coinbase() {
            return Err(LedgerError::Input(format!(
                "coinbase {} cannot enter the unmined pool",
                rec.txid
            )));
        }
        if self.is_unmined(tx, &rec.txid)? || self.is_mined(tx, &rec.txid)? {
            return Ok(false);
        }

        tx.put(Bucket::UnminedTxs, rec.txid.as_bytes().to_vec(), encode(rec)?);
        for input in &rec.tx.inputs {
            tx.put(
                Bucket::UnminedInputs,
                unmined_input_key(&input.previous_output, &rec.txid),
                Vec::new(),
            );
        }
        debug!(txid = %rec.txid, "inserted unmined transaction");
        Ok(true)
    }

    fn insert_mined(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
        block: &BlockMeta,
    ) -> Result<bool, LedgerError> {
        let height = block.height();
        let key = tx_key(&rec.txid, height);
        if tx.contains(Bucket::MinedTxs, &key)? {
            return Ok(false);
        }
        for stale in self.mined_heights(tx, &rec.txid)? {
            let delta = self.rollback_one_block(tx, stale)?;
            info!(txid = %rec.txid, stale, height, delta, "transaction moved, rolled back stale block");
        }

        let mut record = match self.block_record(tx, height)? {
            Some(existing) if existing.hash != block.hash() => {
                return Err(LedgerError::Input(format!(
                    "height {height} already recorded for block {}, not {}",
                    existing.hash,
                    block.hash()
                )));
            }
            Some(existing) => existing,
            None => BlockRecord { hash: block.hash(), time: block.time, txids: Vec::new() },
        };
        record.txids.push(rec.txid);
        tx.put(Bucket::Blocks, height_key(height).to_vec(), encode(&record)?);

        // A promoted record keeps the time it was first seen.
        let stored = match self.unmined_record(tx, &rec.txid)? {
            Some(unmined) => {
                self.promote_unmined(tx, &unmined, height)?;
                unmined
            }
            None => rec.clone(),
        };
        tx.put(Bucket::MinedTxs, key, encode(&stored)?);

        if !rec.tx.is_coinbase() {
            for input in &rec.tx.inputs {
                for spender in self.unmined_spenders(tx, &input.previous_output)? {
                    if spender != rec.txid {
                        info!(
                            txid = %spender,
                            mined = %rec.txid,
                            outpoint = %input.previous_output,
                            "removing double spend of mined transaction"
                        );
                        self.remove_unmined(tx, &spender)?;
                    }
                }
            }
            self.mark_spends(tx, rec, height)?;
        }

        debug!(txid = %rec.txid, height, "inserted mined transaction");
        Ok(true)
    }

    /// Move an unmined record and its credits under the block at `height`.
    fn promote_unmined(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
        height: u32,
    ) -> Result<(), LedgerError> {
        tx.delete(Bucket::UnminedTxs, rec.txid.as_bytes().to_vec());
        for input in &rec.tx.inputs {
            tx.delete(
                Bucket::UnminedInputs,
                unmined_input_key(&input.previous_output, &rec.txid),
            );
        }
        for vout in 0..rec.tx.outputs.len() as u32 {
            let outpoint = OutPoint::new(rec.txid, vout);
            let Some(credit) = self.unmined_credit(tx, &outpoint)? else {
                continue;
            };
            tx.delete(Bucket::UnminedCredits, outpoint_key(&outpoint));
            let mined = CreditRecord {
                amount: credit.amount,
                pk_script: credit.pk_script,
                from_coinbase: false,
                is_change: credit.is_change,
                spent_by: None,
            };
            tx.put(Bucket::Credits, indexed_key(&rec.txid, height, vout), encode(&mined)?);
            tx.put(Bucket::Unspent, outpoint_key(&outpoint), height_key(height).to_vec());
        }
        Ok(())
    }

    /// Mark every wallet credit consumed by `rec` as spent and write debits.
    fn mark_spends(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
        height: u32,
    ) -> Result<(), LedgerError> {
        for (index, input) in rec.tx.inputs.iter().enumerate() {
            let outpoint = input.previous_output;
            let Some(credit_height) = self.unspent_height(tx, &outpoint)? else {
                continue;
            };
            let credit_key = indexed_key(&outpoint.txid, credit_height, outpoint.index);
            let mut credit = self.credit(tx, &credit_key)?.ok_or_else(|| {
                LedgerError::Corrupt(format!("unspent index points at missing credit {outpoint}"))
            })?;
            credit.spent_by = Some(SpentBy {
                txid: rec.txid,
                height,
                input_index: index as u32,
            });
            let debit = DebitRecord { amount: credit.amount, outpoint, credit_height };

            tx.put(Bucket::Credits, credit_key, encode(&credit)?);
            tx.delete(Bucket::Unspent, outpoint_key(&outpoint));
            tx.put(Bucket::Debits, indexed_key(&rec.txid, height, index as u32), encode(&debit)?);
        }
        Ok(())
    }

    /// Register output `index` of `rec` as wallet-owned.
    ///
    /// Returns `false` when the credit was already registered.
    pub fn add_credit(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
        block: Option<&BlockMeta>,
        index: u32,
        is_change: bool,
    ) -> Result<bool, LedgerError> {
        let output = rec.tx.outputs.get(index as usize).ok_or_else(|| {
            LedgerError::Input(format!(
                "output index {index} out of range for {} with {} outputs",
                rec.txid,
                rec.tx.outputs.len()
            ))
        })?;
        let outpoint = OutPoint::new(rec.txid, index);

        match block {
            None => {
                if tx.contains(Bucket::UnminedCredits, &outpoint_key(&outpoint))? {
                    return Ok(false);
                }
                let credit = UnminedCredit {
                    amount: output.value,
                    pk_script: output.pk_script.clone(),
                    is_change,
                };
                tx.put(Bucket::UnminedCredits, outpoint_key(&outpoint), encode(&credit)?);
            }
            Some(block) => {
                let key = indexed_key(&rec.txid, block.height(), index);
                if tx.contains(Bucket::Credits, &key)? {
                    return Ok(false);
                }
                let credit = CreditRecord {
                    amount: output.value,
                    pk_script: output.pk_script.clone(),
                    from_coinbase: rec.tx.is_coinbase(),
                    is_change,
                    spent_by: None,
                };
                tx.put(Bucket::Credits, key, encode(&credit)?);
                tx.put(
                    Bucket::Unspent,
                    outpoint_key(&outpoint),
                    height_key(block.height()).to_vec(),
                );
            }
        }
        debug!(%outpoint, amount = output.value, mined = block.is_some(), "added credit");
        Ok(true)
    }

    // --- Removal ---

    /// Delete an unmined transaction and every unmined transaction depending on it.
    pub fn remove_unmined_transaction(
        &self,
        tx: &mut DbTx<'_>,
        rec: &TxRecord,
    ) -> Result<(), LedgerError> {
        self.remove_unmined(tx, &rec.txid)
    }

    pub(crate) fn remove_unmined(
        &self,
        tx: &mut DbTx<'_>,
        txid: &Hash256,
    ) -> Result<(), LedgerError> {
        let Some(rec) = self.unmined_record(tx, txid)? else {
            return Ok(());
        };

        for vout in 0..rec.tx.outputs.len() as u32 {
            let outpoint = OutPoint::new(*txid, vout);
            for spender in self.unmined_spenders(tx, &outpoint)? {
                if spender != *txid {
                    self.remove_unmined(tx, &spender)?;
                }
            }
            tx.delete(Bucket::UnminedCredits, outpoint_key(&outpoint));
        }
        for input in &rec.tx.inputs {
            tx.delete(Bucket::UnminedInputs, unmined_input_key(&input.previous_output, txid));
        }
        tx.delete(Bucket::UnminedTxs, txid.as_bytes().to_vec());
        debug!(%txid, "removed unmined transaction");
        Ok(())
    }

    // --- Rollback ---

    /// Reverse every transaction recorded at `height`.
    ///
    /// Coinbase transactions are purged with their credits, and any unmined
    /// transaction spending them is removed. Other transactions return to the
    /// unmined pool with their credits, and the credits they spent become
    /// unspent again. Returns the change in mined unspent value.
    pub fn rollback_one_block(&self, tx: &mut DbTx<'_>, height: u32) -> Result<i64, LedgerError> {
        let Some(block) = self.block_record(tx, height)? else {
            return Ok(0);
        };

        let mut delta: i64 = 0;
        for txid in block.txids.iter().rev() {
            let key = tx_key(txid, height);
            let bytes = tx.get(Bucket::MinedTxs, &key)?.ok_or_else(|| {
                LedgerError::Corrupt(format!("block {height} lists missing transaction {txid}"))
            })?;
            let rec: TxRecord = decode(&bytes)?;
            tx.delete(Bucket::MinedTxs, key);

            if rec.tx.is_coinbase() {
                for vout in 0..rec.tx.outputs.len() as u32 {
                    let outpoint = OutPoint::new(*txid, vout);
                    delta -= self.detach_credit(tx, &outpoint, height)?.map_or(0, |c| c.0);
                    for spender in self.unmined_spenders(tx, &outpoint)? {
                        self.remove_unmined(tx, &spender)?;
                    }
                }
                continue;
            }

            for (index, input) in rec.tx.inputs.iter().enumerate() {
                delta += self.restore_debit(tx, txid, height, index as u32)?;
                tx.put(
                    Bucket::UnminedInputs,
                    unmined_input_key(&input.previous_output, txid),
                    Vec::new(),
                );
            }
            for vout in 0..rec.tx.outputs.len() as u32 {
                let outpoint = OutPoint::new(*txid, vout);
                if let Some((unspent, credit)) = self.detach_credit(tx, &outpoint, height)? {
                    delta -= unspent;
                    let unmined = UnminedCredit {
                        amount: credit.amount,
                        pk_script: credit.pk_script,
                        is_change: credit.is_change,
                    };
                    tx.put(Bucket::UnminedCredits, outpoint_key(&outpoint), encode(&unmined)?);
                }
            }
            tx.put(Bucket::UnminedTxs, txid.as_bytes().to_vec(), encode(&rec)?);
        }

        tx.delete(Bucket::Blocks, height_key(height).to_vec());
        info!(height, hash = %block.hash, txs = block.txids.len(), delta, "rolled back block");
        Ok(delta)
    }

    /// Undo debit `index` of `txid`, returning the credit to the unspent index.
    fn restore_debit(
        &self,
        tx: &mut DbTx<'_>,
        txid: &Hash256,
        height: u32,
        index: u32,
    ) -> Result<i64, LedgerError> {
        let debit_key = indexed_key(txid, height, index);
        let Some(bytes) = tx.get(Bucket::Debits, &debit_key)? else {
            return Ok(0);
        };
        let debit: DebitRecord = decode(&bytes)?;
        let credit_key = indexed_key(&debit.outpoint.txid, debit.credit_height, debit.outpoint.index);
        let mut credit = self.credit(tx, &credit_key)?.ok_or_else(|| {
            LedgerError::Corrupt(format!("debit of {txid} spends missing credit {}", debit.outpoint))
        })?;
        credit.spent_by = None;

        tx.put(Bucket::Credits, credit_key, encode(&credit)?);
        tx.put(
            Bucket::Unspent,
            outpoint_key(&debit.outpoint),
            height_key(debit.credit_height).to_vec(),
        );
        tx.delete(Bucket::Debits, debit_key);
        Ok(debit.amount as i64)
    }

    /// Delete the mined credit at `outpoint` mined at `height`.
    ///
    /// Returns the value that left the unspent index (zero if it was spent)
    /// and the removed record.
    fn detach_credit(
        &self,
        tx: &mut DbTx<'_>,
        outpoint: &OutPoint,
        height: u32,
    ) -> Result<Option<(i64, CreditRecord)>, LedgerError> {
        let key = indexed_key(&outpoint.txid, height, outpoint.index);
        let Some(credit) = self.credit(tx, &key)? else {
            return Ok(None);
        };
        let unspent = match credit.spent_by {
            // Only the record at `height` owns the unspent index entry.
            None if self.unspent_height(tx, outpoint)? == Some(height) => {
                tx.delete(Bucket::Unspent, outpoint_key(outpoint));
                credit.amount as i64
            }
            None => 0,
            Some(spender) => {
                // The spender sits in a block that is still connected.
                tx.delete(
                    Bucket::Debits,
                    indexed_key(&spender.txid, spender.height, spender.input_index),
                );
                0
            }
        };
        tx.delete(Bucket::Credits, key);
        Ok(Some((unspent, credit)))
    }
}
