//! Addresses and outpoints the sync engine filters blocks against.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

use sluice_core::script::Address;
use sluice_core::traits::FilterBlocksRequest;
use sluice_core::types::{BlockMeta, OutPoint};

#[derive(Default)]
struct Inner {
    addresses: HashSet<Address>,
    outpoints: HashMap<OutPoint, Address>,
    generation: u64,
}

/// Mutable watch-list with a generation counter.
///
/// Every change bumps the generation, so a filter result computed against an
/// older generation can be recognised and recomputed.
#[derive(Default)]
pub struct WatchList {
    inner: RwLock<Inner>,
}

/// A consistent copy of the watch-list.
#[derive(Clone, Debug, Default)]
pub struct WatchSnapshot {
    pub addresses: HashSet<Address>,
    pub outpoints: HashMap<OutPoint, Address>,
    pub generation: u64,
}

impl WatchSnapshot {
    /// Filter request for `blocks` against this snapshot.
    pub fn request(&self, blocks: Vec<BlockMeta>) -> FilterBlocksRequest {
        FilterBlocksRequest {
            blocks,
            addresses: self.addresses.clone(),
            outpoints: self.outpoints.clone(),
        }
    }
}

impl WatchList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add addresses. Returns how many were new.
    pub fn add_addresses(&self, addresses: impl IntoIterator<Item = Address>) -> usize {
        let mut inner = self.inner.write();
        let added = addresses
            .into_iter()
            .filter(|a| inner.addresses.insert(a.clone()))
            .count();
        if added > 0 {
            inner.generation += 1;
        }
        added
    }

    /// Add outpoints whose spends should be detected. Returns how many were new.
    pub fn add_outpoints(&self, outpoints: impl IntoIterator<Item = (OutPoint, Address)>) -> usize {
        let mut inner = self.inner.write();
        let mut added = 0;
        for (outpoint, address) in outpoints {
            if inner.outpoints.insert(outpoint, address).is_none() {
                added += 1;
            }
        }
        if added > 0 {
            inner.generation += 1;
        }
        added
    }

    pub fn contains_address(&self, address: &Address) -> bool {
        self.inner.read().addresses.contains(address)
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }

    pub fn snapshot(&self) -> WatchSnapshot {
        let inner = self.inner.read();
        WatchSnapshot {
            addresses: inner.addresses.clone(),
            outpoints: inner.outpoints.clone(),
            generation: inner.generation,
        }
    }

    /// (addresses, outpoints) counts.
    pub fn len(&self) -> (usize, usize) {
        let inner = self.inner.read();
        (inner.addresses.len(), inner.outpoints.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::types::Hash256;

    fn addr(b: u8) -> Address {
        Address::PubKeyHash([b; 20])
    }

    #[test]
    fn generation_bumps_only_on_change() {
        let watch = WatchList::new();
        assert_eq!(watch.generation(), 0);
        assert_eq!(watch.add_addresses([addr(1), addr(2)]), 2);
        assert_eq!(watch.generation(), 1);
        assert_eq!(watch.add_addresses([addr(1)]), 0);
        assert_eq!(watch.generation(), 1);

        let op = OutPoint::new(Hash256([1; 32]), 0);
        assert_eq!(watch.add_outpoints([(op, addr(1))]), 1);
        assert_eq!(watch.add_outpoints([(op, addr(1))]), 0);
        assert_eq!(watch.generation(), 2);
        assert_eq!(watch.len(), (2, 1));
    }

    #[test]
    fn snapshot_builds_request() {
        let watch = WatchList::new();
        watch.add_addresses([addr(3)]);
        let snap = watch.snapshot();
        let req = snap.request(vec![]);
        assert!(req.addresses.contains(&addr(3)));
        assert!(watch.contains_address(&addr(3)));
        assert_eq!(snap.generation, watch.generation());
    }
}
