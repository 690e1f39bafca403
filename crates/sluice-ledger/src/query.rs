//! Read-side ledger queries: balances, unspent iteration, transaction details.

use std::collections::{HashMap, HashSet};
use std::ops::ControlFlow;

use tracing::info;

use sluice_core::types::{confirmations, BlockStamp, Hash256, OutPoint};

use crate::db::{DbTx, KvRead};
use crate::error::LedgerError;
use crate::keys::{decode, decode_height, decode_outpoint, indexed_key, tx_key_height};
use crate::kv::{successor, Bucket};
use crate::ledger::Ledger;
use crate::records::{
    Balances, Credit, CreditDetail, CreditRecord, DebitDetail, DebitRecord, TxDetails, TxRecord,
    UnminedCredit,
};

/// Continuation-key section markers for [`Ledger::for_each_unspent_output`].
const SECTION_MINED: u8 = 0;
const SECTION_UNMINED: u8 = 1;

const PAGE: usize = 128;

impl Ledger {
    /// Unspent value split into spendable, immature coinbase, and unconfirmed.
    ///
    /// Outputs spent by an unmined transaction are excluded. Unmined outputs
    /// have zero confirmations.
    pub fn balances(
        &self,
        r: &impl KvRead,
        min_conf: u32,
        tip: u32,
    ) -> Result<Balances, LedgerError> {
        let mut balances = Balances::default();
        let mut visit = |c: &Credit| {
            let height = c.height();
            if c.from_coinbase && !height.is_some_and(|h| self.params().is_coinbase_mature(h, tip)) {
                balances.immature += c.amount;
            } else if confirmations(height, tip) >= min_conf {
                balances.spendable += c.amount;
            } else {
                balances.unconfirmed += c.amount;
            }
            ControlFlow::Continue(())
        };
        self.for_each_unspent_output(r, &[], &mut visit)?;
        Ok(balances)
    }

    /// Sum of unspent credits with at least `min_conf` confirmations,
    /// excluding immature coinbase outputs.
    pub fn balance(&self, r: &impl KvRead, min_conf: u32, tip: u32) -> Result<u64, LedgerError> {
        Ok(self.balances(r, min_conf, tip)?.spendable)
    }

    /// Visit unspent credits: mined ones in outpoint order, then unmined ones.
    ///
    /// Pass an empty `start` to begin. When the visitor breaks, returns a
    /// continuation key that resumes after the last visited credit; returns
    /// `None` once every credit has been visited. Outputs spent by unmined
    /// transactions are skipped.
    pub fn for_each_unspent_output(
        &self,
        r: &impl KvRead,
        start: &[u8],
        visitor: &mut impl FnMut(&Credit) -> ControlFlow<()>,
    ) -> Result<Option<Vec<u8>>, LedgerError> {
        let (section, rest) = match start.split_first() {
            None => (SECTION_MINED, &[][..]),
            Some((s, rest)) => (*s, rest),
        };

        if section == SECTION_MINED {
            let mut stamps: HashMap<u32, BlockStamp> = HashMap::new();
            let mut cursor = rest.to_vec();
            loop {
                let page = r.scan(Bucket::Unspent, &[], &cursor, PAGE)?;
                for (key, value) in &page {
                    let outpoint = decode_outpoint(key)?;
                    if self.has_unmined_spender(r, &outpoint)? {
                        continue;
                    }
                    let height = decode_height(value)?;
                    let stamp = match stamps.get(&height) {
                        Some(stamp) => *stamp,
                        None => {
                            let meta = self
                                .block_at(r, height)?
                                .ok_or(LedgerError::MissingBlock(height))?;
                            stamps.insert(height, meta.stamp);
                            meta.stamp
                        }
                    };
                    let record = self
                        .credit(r, &indexed_key(&outpoint.txid, height, outpoint.index))?
                        .ok_or_else(|| {
                            LedgerError::Corrupt(format!("unspent index points at missing credit {outpoint}"))
                        })?;
                    let credit = mined_credit(outpoint, stamp, record);
                    if visitor(&credit).is_break() {
                        return Ok(Some(continuation(SECTION_MINED, key)));
                    }
                }
                match page.last() {
                    Some((last, _)) if page.len() == PAGE => cursor = successor(last),
                    _ => break,
                }
            }
        } else if section != SECTION_UNMINED {
            return Err(LedgerError::Input("invalid continuation key".into()));
        }

        let mut cursor = if section == SECTION_UNMINED { rest.to_vec() } else { Vec::new() };
        loop {
            let page = r.scan(Bucket::UnminedCredits, &[], &cursor, PAGE)?;
            for (key, value) in &page {
                let outpoint = decode_outpoint(key)?;
                if self.has_unmined_spender(r, &outpoint)? {
                    continue;
                }
                let record: UnminedCredit = decode(value)?;
                let credit = Credit {
                    outpoint,
                    amount: record.amount,
                    pk_script: record.pk_script,
                    block: None,
                    from_coinbase: false,
                    is_change: record.is_change,
                };
                if visitor(&credit).is_break() {
                    return Ok(Some(continuation(SECTION_UNMINED, key)));
                }
            }
            match page.last() {
                Some((last, _)) if page.len() == PAGE => cursor = successor(last),
                _ => return Ok(None),
            }
        }
    }

    /// Every unspent credit.
    pub fn unspent_outputs(&self, r: &impl KvRead) -> Result<Vec<Credit>, LedgerError> {
        let mut out = Vec::new();
        self.for_each_unspent_output(r, &[], &mut |c: &Credit| {
            out.push(c.clone());
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// Record, block, credits and debits of `txid`, preferring the mined copy.
    pub fn tx_details(
        &self,
        r: &impl KvRead,
        txid: &Hash256,
    ) -> Result<Option<TxDetails>, LedgerError> {
        if let Some((key, bytes)) = r.scan_all(Bucket::MinedTxs, txid.as_bytes())?.pop() {
            let height = tx_key_height(&key)?;
            let record: TxRecord = decode(&bytes)?;
            let block = self.block_at(r, height)?.ok_or(LedgerError::MissingBlock(height))?;

            let mut credits = Vec::new();
            for index in 0..record.tx.outputs.len() as u32 {
                if let Some(c) = self.credit(r, &indexed_key(txid, height, index))? {
                    let outpoint = OutPoint::new(*txid, index);
                    credits.push(CreditDetail {
                        index,
                        amount: c.amount,
                        is_change: c.is_change,
                        spent: c.spent_by.is_some() || self.has_unmined_spender(r, &outpoint)?,
                    });
                }
            }
            let mut debits = Vec::new();
            for index in 0..record.tx.inputs.len() as u32 {
                if let Some(bytes) = r.get(Bucket::Debits, &indexed_key(txid, height, index))? {
                    let d: DebitRecord = decode(&bytes)?;
                    debits.push(DebitDetail { index, amount: d.amount });
                }
            }
            return Ok(Some(TxDetails { record, block: Some(block), credits, debits }));
        }

        let Some(record) = self.unmined_record(r, txid)? else {
            return Ok(None);
        };
        let mut credits = Vec::new();
        for index in 0..record.tx.outputs.len() as u32 {
            let outpoint = OutPoint::new(*txid, index);
            if let Some(c) = self.unmined_credit(r, &outpoint)? {
                credits.push(CreditDetail {
                    index,
                    amount: c.amount,
                    is_change: c.is_change,
                    spent: self.has_unmined_spender(r, &outpoint)?,
                });
            }
        }
        let mut debits = Vec::new();
        for (index, input) in record.tx.inputs.iter().enumerate() {
            if let Some(amount) = self.owned_amount(r, &input.previous_output)? {
                debits.push(DebitDetail { index: index as u32, amount });
            }
        }
        Ok(Some(TxDetails { record, block: None, credits, debits }))
    }

    /// Value of the wallet output at `outpoint`, if it is a live credit.
    fn owned_amount(&self, r: &impl KvRead, outpoint: &OutPoint) -> Result<Option<u64>, LedgerError> {
        if let Some(height) = self.unspent_height(r, outpoint)? {
            let key = indexed_key(&outpoint.txid, height, outpoint.index);
            return Ok(self.credit(r, &key)?.map(|c| c.amount));
        }
        Ok(self.unmined_credit(r, outpoint)?.map(|c| c.amount))
    }

    /// Unmined transactions ordered so that parents precede children.
    pub fn unmined_transactions(&self, r: &impl KvRead) -> Result<Vec<TxRecord>, LedgerError> {
        let mut pending: Vec<TxRecord> = r
            .scan_all(Bucket::UnminedTxs, &[])?
            .iter()
            .map(|(_, v)| decode(v))
            .collect::<Result<_, _>>()?;

        let mut ordered = Vec::with_capacity(pending.len());
        let mut placed: HashSet<Hash256> = HashSet::new();
        let unmined: HashSet<Hash256> = pending.iter().map(|r| r.txid).collect();
        while !pending.is_empty() {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|rec| {
                rec.tx.inputs.iter().all(|i| {
                    let parent = i.previous_output.txid;
                    !unmined.contains(&parent) || placed.contains(&parent)
                })
            });
            if ready.is_empty() {
                // Dependency cycle; cannot happen for valid transactions.
                ordered.extend(blocked);
                break;
            }
            placed.extend(ready.iter().map(|r| r.txid));
            ordered.extend(ready);
            pending = blocked;
        }
        Ok(ordered)
    }

    /// Delete all transaction history, leaving sync state untouched.
    pub fn drop_transaction_history(&self, tx: &mut DbTx<'_>) -> Result<(), LedgerError> {
        let mut dropped = 0usize;
        for bucket in Bucket::HISTORY {
            for (key, _) in tx.scan_all(bucket, &[])? {
                tx.delete(bucket, key);
                dropped += 1;
            }
        }
        info!(rows = dropped, "dropped transaction history");
        Ok(())
    }
}

fn mined_credit(outpoint: OutPoint, stamp: BlockStamp, record: CreditRecord) -> Credit {
    Credit {
        outpoint,
        amount: record.amount,
        pk_script: record.pk_script,
        block: Some(stamp),
        from_coinbase: record.from_coinbase,
        is_change: record.is_change,
    }
}

fn continuation(section: u8, key: &[u8]) -> Vec<u8> {
    let mut out = vec![section];
    out.extend_from_slice(&successor(key));
    out
}
