//! Deterministic in-memory key oracle for tests.

use parking_lot::RwLock;
use std::collections::HashSet;

use sluice_core::constants::NetworkType;
use sluice_core::script::{Address, Script};
use sluice_core::types::Transaction;
use sluice_ledger::Credit;

use crate::keys::{AddressOracle, InputSignature};

const KDF_CONTEXT: &str = "sluice-wallet testing keys v1";

struct Inner {
    owned: HashSet<Address>,
    next: u32,
}

/// Derives pay-to-pubkey-hash addresses from a seed with BLAKE3 and
/// "signs" with a keyed hash. Not a real signature scheme.
pub struct MemoryKeys {
    seed: [u8; 32],
    network: NetworkType,
    segwit: bool,
    inner: RwLock<Inner>,
}

impl MemoryKeys {
    pub fn new(seed: [u8; 32], network: NetworkType) -> Self {
        Self {
            seed,
            network,
            segwit: false,
            inner: RwLock::new(Inner { owned: HashSet::new(), next: 0 }),
        }
    }

    /// Derive witness addresses instead of legacy ones.
    pub fn with_segwit(mut self) -> Self {
        self.segwit = true;
        self
    }

    /// Derive and register the next address.
    pub fn next_address(&self) -> Address {
        let mut inner = self.inner.write();
        let index = inner.next;
        inner.next += 1;
        let mut material = self.seed.to_vec();
        material.extend_from_slice(&index.to_be_bytes());
        let key = blake3::derive_key(KDF_CONTEXT, &material);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&key[..20]);
        let address = if self.segwit {
            Address::WitnessPubKeyHash(hash)
        } else {
            Address::PubKeyHash(hash)
        };
        inner.owned.insert(address.clone());
        address
    }

}

impl AddressOracle for MemoryKeys {
    fn network(&self) -> NetworkType {
        self.network
    }

    fn owns(&self, address: &Address) -> bool {
        self.inner.read().owned.contains(address)
    }

    fn addresses(&self) -> Vec<Address> {
        let mut out: Vec<_> = self.inner.read().owned.iter().cloned().collect();
        out.sort();
        out
    }

    fn change_script(&self) -> Result<Script, String> {
        Ok(self.next_address().script())
    }

    fn sign_input(&self, tx: &Transaction, index: usize, spent: &Credit) -> Result<InputSignature, String> {
        if !self.can_spend(&spent.pk_script) {
            return Err(format!("no key for {}", spent.outpoint));
        }
        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(tx.txid().as_bytes());
        hasher.update(&(index as u32).to_be_bytes());
        let sig = hasher.finalize().as_bytes().to_vec();
        Ok(if spent.pk_script.kind().is_segwit() {
            InputSignature { signature_script: Vec::new(), witness: vec![sig] }
        } else {
            InputSignature { signature_script: sig, witness: Vec::new() }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::{Hash256, OutPoint};

    #[test]
    fn derivation_is_deterministic() {
        let a = MemoryKeys::new([1; 32], NetworkType::Regtest);
        let b = MemoryKeys::new([1; 32], NetworkType::Regtest);
        assert_eq!(a.next_address(), b.next_address());
        assert_ne!(a.next_address(), MemoryKeys::new([2; 32], NetworkType::Regtest).next_address());
        assert_eq!(a.addresses().len(), 2);
    }

    #[test]
    fn signs_only_owned_scripts() {
        let keys = MemoryKeys::new([1; 32], NetworkType::Regtest).with_segwit();
        let mine = keys.next_address();
        let credit = |script: Script| Credit {
            outpoint: OutPoint::new(Hash256([3; 32]), 0),
            amount: 1,
            pk_script: script,
            block: None,
            from_coinbase: false,
            is_change: false,
        };
        let tx = sluice_core::testing::spend(&[OutPoint::new(Hash256([3; 32]), 0)], vec![]);
        let sig = keys.sign_input(&tx, 0, &credit(mine.script())).unwrap();
        assert_eq!(sig.witness.len(), 1);
        assert!(sig.signature_script.is_empty());
        assert!(keys.sign_input(&tx, 0, &credit(Address::PubKeyHash([9; 20]).script())).is_err());
    }
}
