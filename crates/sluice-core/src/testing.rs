//! In-memory [`ChainSource`] for tests.
//!
//! `MemChain` keeps a single main chain of full blocks and supports
//! truncating it at a fork height so tests can drive reorgs.

use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::ChainError;
use crate::script::Script;
use crate::traits::{ChainSource, FilterBlocksRequest, FilterBlocksResponse};
use crate::types::{
    Block, BlockHeader, BlockMeta, BlockStamp, Hash256, OutPoint, Transaction, TxInput, TxOutput,
};

const GENESIS_TIME: i64 = 1_700_000_000;
const BLOCK_SPACING: i64 = 600;

struct Inner {
    blocks: Vec<Block>,
    /// Mixed into new headers so blocks mined after a reorg get fresh hashes.
    salt: u32,
    rejections: HashMap<Hash256, String>,
    broadcast: Vec<Transaction>,
    current: bool,
    latency: Option<Duration>,
}

/// A mutable, thread-safe in-memory chain.
pub struct MemChain {
    inner: RwLock<Inner>,
}

impl MemChain {
    /// A chain holding only a genesis block at height 0.
    pub fn new() -> Self {
        let chain = Self {
            inner: RwLock::new(Inner {
                blocks: Vec::new(),
                salt: 0,
                rejections: HashMap::new(),
                broadcast: Vec::new(),
                current: true,
                latency: None,
            }),
        };
        chain.mine(vec![coinbase(0, Script::default(), 0)]);
        chain
    }

    /// Append a block with the given transactions. Returns its metadata.
    pub fn mine(&self, transactions: Vec<Transaction>) -> BlockMeta {
        let mut inner = self.inner.write();
        let height = inner.blocks.len() as u32;
        let prev_hash = inner
            .blocks
            .last()
            .map(|b| b.header.hash())
            .unwrap_or(Hash256::ZERO);
        let mut ids = blake3::Hasher::new();
        for tx in &transactions {
            ids.update(tx.txid().as_bytes());
        }
        let header = BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: Hash256(ids.finalize().into()),
            timestamp: GENESIS_TIME + height as i64 * BLOCK_SPACING,
            bits: 0x207fffff,
            nonce: inner.salt,
        };
        let meta = BlockMeta::new(height, header.hash(), header.timestamp);
        inner.blocks.push(Block { header, transactions });
        meta
    }

    /// Append a block containing only a coinbase paying `value` to `pk_script`.
    pub fn mine_coinbase(&self, pk_script: Script, value: u64) -> (BlockMeta, Transaction) {
        let height = self.height() + 1;
        let cb = coinbase(height, pk_script, value);
        let meta = self.mine(vec![cb.clone()]);
        (meta, cb)
    }

    /// Append `n` blocks with unspendable coinbases.
    pub fn mine_empty(&self, n: u32) -> BlockMeta {
        let mut meta = self.tip();
        for _ in 0..n {
            let height = self.height() + 1;
            meta = self.mine(vec![coinbase(height, Script::default(), 0)]);
        }
        meta
    }

    /// Drop every block at `fork_height` and above.
    pub fn reorg(&self, fork_height: u32) {
        let mut inner = self.inner.write();
        inner.blocks.truncate(fork_height.max(1) as usize);
        inner.salt += 1;
    }

    pub fn height(&self) -> u32 {
        self.inner.read().blocks.len() as u32 - 1
    }

    pub fn tip(&self) -> BlockMeta {
        let inner = self.inner.read();
        let height = inner.blocks.len() - 1;
        let header = &inner.blocks[height].header;
        BlockMeta::new(height as u32, header.hash(), header.timestamp)
    }

    pub fn block(&self, height: u32) -> Option<Block> {
        self.inner.read().blocks.get(height as usize).cloned()
    }

    pub fn meta(&self, height: u32) -> Option<BlockMeta> {
        let inner = self.inner.read();
        let header = &inner.blocks.get(height as usize)?.header;
        Some(BlockMeta::new(height, header.hash(), header.timestamp))
    }

    /// Make the next broadcast of `txid` fail with `reason`.
    pub fn reject(&self, txid: Hash256, reason: &str) {
        self.inner.write().rejections.insert(txid, reason.to_string());
    }

    /// Transactions accepted by [`send_raw_transaction`](ChainSource::send_raw_transaction).
    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.inner.read().broadcast.clone()
    }

    pub fn set_current(&self, current: bool) {
        self.inner.write().current = current;
    }

    /// Sleep a random duration up to `max` in every filter call, so parallel
    /// fetches complete out of order.
    pub fn set_latency(&self, max: Duration) {
        self.inner.write().latency = Some(max);
    }

    fn find(&self, hash: &Hash256) -> Option<(u32, Block)> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .enumerate()
            .find(|(_, b)| b.header.hash() == *hash)
            .map(|(h, b)| (h as u32, b.clone()))
    }
}

impl Default for MemChain {
    fn default() -> Self {
        Self::new()
    }
}

/// A coinbase transaction unique to `height`.
pub fn coinbase(height: u32, pk_script: Script, value: u64) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            previous_output: OutPoint::null(),
            signature_script: height.to_le_bytes().to_vec(),
            witness: Vec::new(),
            sequence: u32::MAX,
        }],
        outputs: vec![TxOutput { value, pk_script }],
        lock_time: height,
    }
}

/// A transaction spending `inputs` into `outputs`.
pub fn spend(inputs: &[OutPoint], outputs: Vec<(Script, u64)>) -> Transaction {
    Transaction {
        version: 1,
        inputs: inputs.iter().copied().map(TxInput::unsigned).collect(),
        outputs: outputs
            .into_iter()
            .map(|(pk_script, value)| TxOutput { value, pk_script })
            .collect(),
        lock_time: 0,
    }
}

impl ChainSource for MemChain {
    fn best_block(&self) -> Result<BlockStamp, ChainError> {
        Ok(self.tip().stamp)
    }

    fn block_hash(&self, height: u32) -> Result<Hash256, ChainError> {
        self.inner
            .read()
            .blocks
            .get(height as usize)
            .map(|b| b.header.hash())
            .ok_or(ChainError::BlockNotFound(height))
    }

    fn block_header(&self, hash: &Hash256) -> Result<BlockHeader, ChainError> {
        self.find(hash)
            .map(|(_, b)| b.header)
            .ok_or_else(|| ChainError::UnknownHash(hash.to_string()))
    }

    fn filter_blocks(
        &self,
        request: &FilterBlocksRequest,
    ) -> Result<Option<FilterBlocksResponse>, ChainError> {
        let latency = self.inner.read().latency;
        if let Some(max) = latency {
            let ms = rand::thread_rng().gen_range(0..=max.as_millis() as u64);
            std::thread::sleep(Duration::from_millis(ms));
        }

        let mut watched = request.outpoints.clone();
        for (batch_index, meta) in request.blocks.iter().enumerate() {
            let (_, block) = self
                .find(&meta.hash())
                .ok_or_else(|| ChainError::UnknownHash(meta.hash().to_string()))?;

            let mut related = Vec::new();
            let mut found_addresses = HashSet::new();
            let mut found_outpoints = HashMap::new();
            for tx in &block.transactions {
                let spends_watched = tx
                    .inputs
                    .iter()
                    .any(|i| watched.contains_key(&i.previous_output));
                let txid = tx.txid();
                let mut pays_watched = false;
                for (vout, out) in tx.outputs.iter().enumerate() {
                    for addr in out.pk_script.kind().addresses() {
                        if request.addresses.contains(&addr) {
                            pays_watched = true;
                            let op = OutPoint::new(txid, vout as u32);
                            watched.insert(op, addr.clone());
                            found_outpoints.insert(op, addr.clone());
                            found_addresses.insert(addr);
                        }
                    }
                }
                if spends_watched || pays_watched {
                    related.push(tx.clone());
                }
            }

            if !related.is_empty() {
                return Ok(Some(FilterBlocksResponse {
                    batch_index,
                    block: *meta,
                    related,
                    found_addresses,
                    found_outpoints,
                }));
            }
        }
        Ok(None)
    }

    fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash256, ChainError> {
        let txid = tx.txid();
        let mut inner = self.inner.write();
        if let Some(reason) = inner.rejections.remove(&txid) {
            return Err(ChainError::Rejected(reason));
        }
        inner.broadcast.push(tx.clone());
        Ok(txid)
    }

    fn is_current(&self) -> bool {
        self.inner.read().current
    }
}
