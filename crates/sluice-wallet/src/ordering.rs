//! Input ordering policies and the ordered credit multiset used by coin
//! selection.
//!
//! An ordering ranks credits from best to worst; selection evicts from the
//! worst end. Every policy breaks ties on the outpoint so selection is
//! deterministic for a given unspent set.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;

use sluice_ledger::Credit;

/// Ranks credits for spending. `Ordering::Less` means `a` is spent before `b`.
pub trait InputOrdering: Send + Sync {
    fn compare(&self, a: &Credit, b: &Credit) -> Ordering;
}

/// Largest amount first. The default.
#[derive(Clone, Copy, Debug, Default)]
pub struct DescendingAmount;

impl InputOrdering for DescendingAmount {
    fn compare(&self, a: &Credit, b: &Credit) -> Ordering {
        b.amount.cmp(&a.amount).then_with(|| a.outpoint.cmp(&b.outpoint))
    }
}

/// Smallest amount first, consolidating small outputs.
#[derive(Clone, Copy, Debug, Default)]
pub struct AscendingAmount;

impl InputOrdering for AscendingAmount {
    fn compare(&self, a: &Credit, b: &Credit) -> Ordering {
        a.amount.cmp(&b.amount).then_with(|| a.outpoint.cmp(&b.outpoint))
    }
}

/// Lowest block height first; unmined outputs last.
#[derive(Clone, Copy, Debug, Default)]
pub struct OldestFirst;

impl InputOrdering for OldestFirst {
    fn compare(&self, a: &Credit, b: &Credit) -> Ordering {
        let height = |c: &Credit| c.height().unwrap_or(u32::MAX);
        height(a)
            .cmp(&height(b))
            .then_with(|| b.amount.cmp(&a.amount))
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    }
}

/// Configurable name for a built-in ordering.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingPolicy {
    #[default]
    AmountDesc,
    AmountAsc,
    OldestFirst,
}

impl OrderingPolicy {
    pub fn ordering(self) -> Arc<dyn InputOrdering> {
        match self {
            Self::AmountDesc => Arc::new(DescendingAmount),
            Self::AmountAsc => Arc::new(AscendingAmount),
            Self::OldestFirst => Arc::new(OldestFirst),
        }
    }
}

/// Credits kept sorted best-first under an [`InputOrdering`], with a running
/// sum and cheap eviction of the worst member.
pub struct OrderedCredits<'a> {
    items: Vec<Credit>,
    sum: u64,
    segwit: usize,
    ordering: &'a dyn InputOrdering,
}

impl<'a> OrderedCredits<'a> {
    pub fn new(ordering: &'a dyn InputOrdering) -> Self {
        Self { items: Vec::new(), sum: 0, segwit: 0, ordering }
    }

    /// Insert after any members that compare equal.
    pub fn insert(&mut self, credit: Credit) {
        let at = self
            .items
            .partition_point(|c| self.ordering.compare(c, &credit) != Ordering::Greater);
        self.sum = self.sum.saturating_add(credit.amount);
        if credit.pk_script.kind().is_segwit() {
            self.segwit += 1;
        }
        self.items.insert(at, credit);
    }

    pub fn worst(&self) -> Option<&Credit> {
        self.items.last()
    }

    pub fn pop_worst(&mut self) -> Option<Credit> {
        let credit = self.items.pop()?;
        self.sum -= credit.amount;
        if credit.pk_script.kind().is_segwit() {
            self.segwit -= 1;
        }
        Some(credit)
    }

    /// Evict worst members while the rest still cover `target`.
    pub fn trim_to(&mut self, target: u64) {
        while let Some(worst) = self.worst() {
            if self.sum - worst.amount < target {
                break;
            }
            self.pop_worst();
        }
    }

    /// Evict worst members until at most `cap` remain. Returns (count, value) evicted.
    pub fn enforce_cap(&mut self, cap: usize) -> (usize, u64) {
        let mut count = 0;
        let mut value = 0u64;
        while self.items.len() > cap {
            if let Some(c) = self.pop_worst() {
                count += 1;
                value = value.saturating_add(c.amount);
            }
        }
        (count, value)
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_segwit(&self) -> bool {
        self.segwit > 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credit> {
        self.items.iter()
    }

    /// Members best-first.
    pub fn into_vec(self) -> Vec<Credit> {
        self.items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::script::{Address, Script};
    use sluice_core::types::{BlockStamp, Hash256, OutPoint};

    fn credit(id: u8, amount: u64, height: Option<u32>) -> Credit {
        Credit {
            outpoint: OutPoint::new(Hash256([id; 32]), 0),
            amount,
            pk_script: Address::PubKeyHash([1; 20]).script(),
            block: height.map(|h| BlockStamp { height: h, hash: Hash256([h as u8; 32]) }),
            from_coinbase: false,
            is_change: false,
        }
    }

    fn amounts(set: &OrderedCredits<'_>) -> Vec<u64> {
        set.iter().map(|c| c.amount).collect()
    }

    #[test]
    fn descending_ties_break_on_outpoint() {
        let mut set = OrderedCredits::new(&DescendingAmount);
        set.insert(credit(3, 10, None));
        set.insert(credit(1, 10, None));
        set.insert(credit(2, 50, None));
        let ids: Vec<u8> = set.iter().map(|c| c.outpoint.txid.0[0]).collect();
        assert_eq!(ids, vec![2, 1, 3]);
        assert_eq!(set.sum(), 70);
    }

    #[test]
    fn ascending_and_oldest() {
        let mut asc = OrderedCredits::new(&AscendingAmount);
        let mut old = OrderedCredits::new(&OldestFirst);
        for c in [credit(1, 30, Some(9)), credit(2, 10, None), credit(3, 20, Some(4))] {
            asc.insert(c.clone());
            old.insert(c);
        }
        assert_eq!(amounts(&asc), vec![10, 20, 30]);
        assert_eq!(amounts(&old), vec![20, 30, 10]);
    }

    #[test]
    fn trim_keeps_cover() {
        let mut set = OrderedCredits::new(&DescendingAmount);
        for (i, a) in [60, 50, 5].into_iter().enumerate() {
            set.insert(credit(i as u8, a, None));
        }
        set.trim_to(100);
        assert_eq!(amounts(&set), vec![60, 50]);
        set.trim_to(60);
        assert_eq!(amounts(&set), vec![60]);
        set.trim_to(0);
        assert!(set.is_empty());
    }

    #[test]
    fn cap_reports_evicted_value() {
        let mut set = OrderedCredits::new(&DescendingAmount);
        for i in 0..5u8 {
            set.insert(credit(i, 10 + i as u64, None));
        }
        assert_eq!(set.enforce_cap(3), (2, 10 + 11));
        assert_eq!(set.len(), 3);
        assert_eq!(set.sum(), 12 + 13 + 14);
    }

    #[test]
    fn segwit_membership_tracked() {
        let mut set = OrderedCredits::new(&DescendingAmount);
        set.insert(credit(1, 5, None));
        assert!(!set.has_segwit());
        let mut w = credit(2, 1, None);
        w.pk_script = Script::pay_to(&Address::WitnessPubKeyHash([2; 20]));
        set.insert(w);
        assert!(set.has_segwit());
        set.pop_worst();
        assert!(!set.has_segwit());
    }

    #[test]
    fn policy_names() {
        let p: OrderingPolicy = serde_json::from_str("\"amount-asc\"").unwrap();
        assert_eq!(p, OrderingPolicy::AmountAsc);
        let a = credit(1, 1, None);
        let b = credit(2, 2, None);
        assert_eq!(OrderingPolicy::AmountDesc.ordering().compare(&a, &b), Ordering::Greater);
    }
}
