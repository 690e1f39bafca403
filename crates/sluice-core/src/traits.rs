//! Trait interfaces consumed by the wallet core.
//!
//! - [`ChainSource`]: block hashes, headers, block filtering and broadcast
//!   (a full node or light client implements it)
//! - [`BurnRule`]: protocol rule marking certain coinbase outputs unspendable

use std::collections::{HashMap, HashSet};

use crate::error::ChainError;
use crate::script::{Address, Script};
use crate::types::{BlockHeader, BlockMeta, BlockStamp, Hash256, OutPoint, Transaction};

/// A batch of candidate blocks plus the watch-list to test them against.
#[derive(Clone, Debug, Default)]
pub struct FilterBlocksRequest {
    /// Consecutive blocks, lowest height first.
    pub blocks: Vec<BlockMeta>,
    /// Addresses whose payments are of interest.
    pub addresses: HashSet<Address>,
    /// Outpoints whose spends are of interest, with the address they pay.
    pub outpoints: HashMap<OutPoint, Address>,
}

/// The first block in a [`FilterBlocksRequest`] containing relevant transactions.
#[derive(Clone, Debug)]
pub struct FilterBlocksResponse {
    /// Index of the matching block within the request batch.
    pub batch_index: usize,
    pub block: BlockMeta,
    /// Matching transactions in block order.
    pub related: Vec<Transaction>,
    /// Watched addresses that received payments in this block.
    pub found_addresses: HashSet<Address>,
    /// Outputs of matching transactions that pay watched addresses.
    /// Their spends must be watched from here on.
    pub found_outpoints: HashMap<OutPoint, Address>,
}

/// Source of chain data for the sync engine and wallet.
///
/// Calls may block on network I/O. Implementations must be safe to call
/// from several worker threads at once.
pub trait ChainSource: Send + Sync {
    /// Current best block.
    fn best_block(&self) -> Result<BlockStamp, ChainError>;

    /// Hash of the main-chain block at `height`.
    fn block_hash(&self, height: u32) -> Result<Hash256, ChainError>;

    /// Header of the block with the given hash.
    fn block_header(&self, hash: &Hash256) -> Result<BlockHeader, ChainError>;

    /// Scan the request's blocks in order and return the first one that
    /// contains a transaction paying a watched address or spending a watched
    /// outpoint. `None` when no block matches.
    fn filter_blocks(
        &self,
        request: &FilterBlocksRequest,
    ) -> Result<Option<FilterBlocksResponse>, ChainError>;

    /// Broadcast a transaction. Rejections carry the node's reason.
    fn send_raw_transaction(&self, tx: &Transaction) -> Result<Hash256, ChainError>;

    /// Whether the source believes it is synced to the network tip.
    fn is_current(&self) -> bool;

    /// Whether the block stamp is still on the main chain.
    ///
    /// Default implementation compares [`block_hash`](Self::block_hash) at the
    /// stamp's height.
    fn is_main_chain(&self, stamp: &BlockStamp) -> Result<bool, ChainError> {
        match self.block_hash(stamp.height) {
            Ok(hash) => Ok(hash == stamp.hash),
            Err(ChainError::BlockNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Protocol rule deciding whether a coinbase output has been burned.
pub trait BurnRule: Send + Sync {
    /// `height` is the height the coinbase was mined at; `tip` the current tip.
    fn is_burned(&self, outpoint: &OutPoint, pk_script: &Script, height: u32, tip: u32) -> bool;
}

/// Burn rule for chains without burned outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoBurn;

impl BurnRule for NoBurn {
    fn is_burned(&self, _: &OutPoint, _: &Script, _: u32, _: u32) -> bool {
        false
    }
}
