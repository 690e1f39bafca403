//! Stored records and the public views built from them.

use serde::{Deserialize, Serialize};
use sluice_core::error::DecodeError;
use sluice_core::script::Script;
use sluice_core::types::{BlockMeta, BlockStamp, Hash256, OutPoint, Transaction};

/// A wallet-relevant transaction plus the time it was first seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TxRecord {
    /// Cached `tx.txid()`.
    pub txid: Hash256,
    pub tx: Transaction,
    /// Unix seconds.
    pub received: i64,
}

impl TxRecord {
    /// Record received now.
    pub fn new(tx: Transaction) -> Self {
        Self::with_received(tx, chrono::Utc::now().timestamp())
    }

    /// Record first seen at `received` (Unix seconds).
    pub fn with_received(tx: Transaction, received: i64) -> Self {
        Self { txid: tx.txid(), tx, received }
    }

    /// Parse a raw serialized transaction.
    pub fn from_raw(raw: &[u8], received: i64) -> Result<Self, DecodeError> {
        let tx = Transaction::from_bytes(raw).map_err(|e| DecodeError::Transaction(e.to_string()))?;
        Ok(Self::with_received(tx, received))
    }
}

/// Per-height block record: the block identity plus wallet txids in block order.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct BlockRecord {
    pub hash: Hash256,
    pub time: i64,
    pub txids: Vec<Hash256>,
}

impl BlockRecord {
    pub fn meta(&self, height: u32) -> BlockMeta {
        BlockMeta::new(height, self.hash, self.time)
    }
}

/// The mined input that spent a credit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct SpentBy {
    pub txid: Hash256,
    pub height: u32,
    pub input_index: u32,
}

/// A mined wallet output.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CreditRecord {
    pub amount: u64,
    pub pk_script: Script,
    pub from_coinbase: bool,
    pub is_change: bool,
    /// `None` is the unspent sentinel.
    pub spent_by: Option<SpentBy>,
}

/// A mined input that consumed a mined credit.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DebitRecord {
    pub amount: u64,
    pub outpoint: OutPoint,
    /// Height of the block holding the consumed credit.
    pub credit_height: u32,
}

/// A wallet output of an unmined transaction.
#[derive(Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct UnminedCredit {
    pub amount: u64,
    pub pk_script: Script,
    pub is_change: bool,
}

/// An unspent wallet output as seen by readers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credit {
    pub outpoint: OutPoint,
    pub amount: u64,
    pub pk_script: Script,
    /// Block the output was mined in, `None` while unmined.
    pub block: Option<BlockStamp>,
    pub from_coinbase: bool,
    pub is_change: bool,
}

impl Credit {
    /// Height of the block holding the credit, `None` while unmined.
    pub fn height(&self) -> Option<u32> {
        self.block.map(|b| b.height)
    }

    /// Confirmations at chain height `tip`; zero while unmined.
    pub fn confirmations(&self, tip: u32) -> u32 {
        sluice_core::types::confirmations(self.height(), tip)
    }
}

/// A credit of one transaction, for [`TxDetails`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDetail {
    pub index: u32,
    pub amount: u64,
    pub is_change: bool,
    pub spent: bool,
}

/// A debit of one transaction, for [`TxDetails`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitDetail {
    pub index: u32,
    pub amount: u64,
}

/// Everything the ledger knows about one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxDetails {
    pub record: TxRecord,
    pub block: Option<BlockMeta>,
    pub credits: Vec<CreditDetail>,
    pub debits: Vec<DebitDetail>,
}

impl TxDetails {
    /// Wallet value received minus wallet value spent.
    pub fn net(&self) -> i64 {
        let received: u64 = self.credits.iter().map(|c| c.amount).sum();
        let spent: u64 = self.debits.iter().map(|d| d.amount).sum();
        received as i64 - spent as i64
    }
}

/// Unspent value split by spendability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Meets the confirmation requirement and, for coinbase, maturity.
    pub spendable: u64,
    /// Coinbase outputs still below maturity.
    pub immature: u64,
    /// Outputs with fewer confirmations than required (including unmined).
    pub unconfirmed: u64,
}

impl Balances {
    /// Every unspent credit, spendable or not.
    pub fn total(&self) -> u64 {
        self.spendable + self.immature + self.unconfirmed
    }
}
