//! # sluice-core
//! Foundation types and traits for the Sluice wallet core.

pub mod constants;
pub mod error;
pub mod script;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;
pub mod types;

pub use constants::{ChainParams, NetworkType, COIN};
pub use error::{ChainError, DecodeError};
pub use script::{Address, Script, ScriptKind};
pub use traits::{BurnRule, ChainSource, FilterBlocksRequest, FilterBlocksResponse, NoBurn};
pub use types::{
    confirmations, Block, BlockHeader, BlockMeta, BlockStamp, Hash256, OutPoint, Transaction,
    TxInput, TxOutput,
};
