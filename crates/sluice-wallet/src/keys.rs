//! The address and key oracle the wallet consumes.
//!
//! Key derivation, address bookkeeping and key encryption live outside this
//! crate. The wallet only needs to know which destinations it owns, where to
//! send change, and how to sign an input.

use sluice_core::constants::NetworkType;
use sluice_core::script::{Address, Script};
use sluice_core::types::Transaction;
use sluice_ledger::Credit;

/// Unlocking data for one input.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InputSignature {
    pub signature_script: Vec<u8>,
    pub witness: Vec<Vec<u8>>,
}

/// Owned-address metadata and signing keys.
pub trait AddressOracle: Send + Sync {
    fn network(&self) -> NetworkType;

    /// Whether the wallet holds the key for `address`.
    fn owns(&self, address: &Address) -> bool;

    /// Every owned address, for seeding the sync watch-list.
    fn addresses(&self) -> Vec<Address>;

    /// A fresh locking script for change.
    fn change_script(&self) -> Result<Script, String>;

    /// Sign input `index` of `tx`, which spends `spent`.
    fn sign_input(&self, tx: &Transaction, index: usize, spent: &Credit) -> Result<InputSignature, String>;

    /// Whether the wallet can sign for `script`.
    fn can_spend(&self, script: &Script) -> bool {
        script.kind().is_spendable_by(|a| self.owns(a))
    }
}
