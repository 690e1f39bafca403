//! # sluice-wallet: coin selection, transaction creation and the wallet coordinator.
//!
//! # Modules
//!
//! - [`coin_selection`]: filter, group and choose unspent credits
//! - [`ordering`]: pluggable input orderings and the ordered credit set
//! - [`builder`]: fee estimation, change handling, per-input signing
//! - [`creator`]: the serialized transaction creation thread
//! - [`locker`]: key lock state actor with hold guards
//! - [`keys`]: the address and key oracle the wallet consumes
//! - [`wallet`]: high-level composition
//! - [`config`], [`logging`], [`error`]

pub mod builder;
pub mod coin_selection;
pub mod config;
pub mod creator;
pub mod error;
pub mod keys;
pub mod locker;
pub mod logging;
pub mod ordering;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod wallet;

pub use builder::{TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelector, Exclusions, Selection, SelectionRequest};
pub use config::{SelectionConfig, WalletConfig};
pub use creator::{CreatedTransaction, TxPolicy};
pub use error::{InputSignError, SelectError, WalletError};
pub use keys::{AddressOracle, InputSignature};
pub use locker::{HoldGuard, KeyLocker};
pub use ordering::{AscendingAmount, DescendingAmount, InputOrdering, OldestFirst, OrderingPolicy};
pub use wallet::{UnspentOutput, Wallet};
