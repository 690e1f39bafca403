//! Coin selection over the ledger's unspent outputs.
//!
//! Eligible credits are grouped by locking script. A group that covers the
//! target on its own wins, so payments prefer spending from a single
//! address. Otherwise every eligible credit is merged and selected from as
//! one set. Within a set, members beyond what is needed to cover the target
//! are evicted worst-first, and the input cap is enforced the same way.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::debug;

use sluice_core::constants::{MAX_INPUTS_LEGACY, MAX_INPUTS_SEGWIT};
use sluice_core::script::{Address, Script};
use sluice_core::traits::{BurnRule, ChainSource};
use sluice_core::types::BlockStamp;
use sluice_ledger::{Credit, Database, KvRead, Ledger, LockedOutpoints};

use crate::error::SelectError;
use crate::ordering::{DescendingAmount, InputOrdering, OrderedCredits};

/// Parameters of one selection.
#[derive(Clone)]
pub struct SelectionRequest {
    /// Value to cover. Zero selects everything up to the input cap.
    pub target: u64,
    /// Confirmations a credit needs to be eligible.
    pub min_conf: u32,
    /// Only spend outputs paying one of these addresses.
    pub addresses: Option<HashSet<Address>>,
    /// Cap override; `None` applies the legacy or segwit cap.
    pub max_inputs: Option<usize>,
    /// Ranking used to keep the best credits.
    pub ordering: Arc<dyn InputOrdering>,
}

impl SelectionRequest {
    /// A request with no address filter, default caps and largest-first ordering.
    pub fn new(target: u64, min_conf: u32) -> Self {
        Self {
            target,
            min_conf,
            addresses: None,
            max_inputs: None,
            ordering: Arc::new(DescendingAmount),
        }
    }

    /// Whether the request spends everything eligible.
    pub fn is_sweep(&self) -> bool {
        self.target == 0
    }

    fn cap(&self, has_segwit: bool) -> usize {
        self.max_inputs.unwrap_or(if has_segwit { MAX_INPUTS_SEGWIT } else { MAX_INPUTS_LEGACY })
    }
}

/// Value excluded while filtering, reported with shortfalls.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Exclusions {
    /// Below the confirmation requirement or immature coinbase.
    pub unconfirmed: u64,
    /// Held by an outpoint lock.
    pub locked: u64,
    /// Coinbase outputs the burn rule marks unspendable.
    pub burned: u64,
    /// In blocks no longer on the main chain.
    pub orphaned: u64,
}

/// Credits chosen to fund a transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Best-first under the request's ordering.
    pub credits: Vec<Credit>,
    /// Sum of `credits`.
    pub total: u64,
    /// Whether every credit pays the same script.
    pub single_group: bool,
    /// Value filtered out before choosing.
    pub exclusions: Exclusions,
    /// Credits dropped to respect the input cap.
    pub overflow_count: usize,
    pub overflow_value: u64,
}

/// Selects unspent credits for a payment.
pub struct CoinSelector<'a> {
    ledger: &'a Ledger,
    chain: &'a dyn ChainSource,
    locks: &'a LockedOutpoints,
    burn: &'a dyn BurnRule,
}

impl<'a> CoinSelector<'a> {
    /// Selector reading `ledger`, checking blocks against `chain`, and
    /// honouring `locks` and `burn`.
    pub fn new(
        ledger: &'a Ledger,
        chain: &'a dyn ChainSource,
        locks: &'a LockedOutpoints,
        burn: &'a dyn BurnRule,
    ) -> Self {
        Self { ledger, chain, locks, burn }
    }

    /// Select from the ledger's unspent outputs at chain height `tip`.
    pub fn select(
        &self,
        db: &Database,
        tip: u32,
        request: &SelectionRequest,
    ) -> Result<Selection, SelectError> {
        let (eligible, exclusions) = self.eligible(db, tip, request)?;
        choose(eligible, request, exclusions)
    }

    /// Unspent credits passing every filter, in ledger order.
    ///
    /// Candidates are read under a view; the main-chain check talks to the
    /// chain source after the view is released.
    pub fn eligible(
        &self,
        db: &Database,
        tip: u32,
        request: &SelectionRequest,
    ) -> Result<(Vec<Credit>, Exclusions), SelectError> {
        let (candidates, mut exclusions) = db.view(|r| self.candidates(r, tip, request))?;
        let eligible = self.drop_orphaned(candidates, &mut exclusions)?;
        Ok((eligible, exclusions))
    }

    /// Unspent credits in `r` passing the address, confirmation, burn and
    /// lock filters. Makes no chain calls.
    pub fn candidates(
        &self,
        r: &impl KvRead,
        tip: u32,
        request: &SelectionRequest,
    ) -> Result<(Vec<Credit>, Exclusions), SelectError> {
        let params = self.ledger.params();
        let mut exclusions = Exclusions::default();
        let mut candidates = Vec::new();

        let mut visit = |c: &Credit| {
            if let Some(filter) = &request.addresses {
                if !c.pk_script.kind().addresses().iter().any(|a| filter.contains(a)) {
                    return ControlFlow::Continue(());
                }
            }

            let immature = c.from_coinbase
                && !c.height().is_some_and(|h| params.is_coinbase_mature(h, tip));
            if immature || c.confirmations(tip) < request.min_conf {
                exclusions.unconfirmed += c.amount;
                return ControlFlow::Continue(());
            }

            if let (true, Some(height)) = (c.from_coinbase, c.height()) {
                if self.burn.is_burned(&c.outpoint, &c.pk_script, height, tip) {
                    exclusions.burned += c.amount;
                    return ControlFlow::Continue(());
                }
            }

            if self.locks.is_locked(&c.outpoint) {
                exclusions.locked += c.amount;
                return ControlFlow::Continue(());
            }

            candidates.push(c.clone());
            ControlFlow::Continue(())
        };
        self.ledger.for_each_unspent_output(r, &[], &mut visit)?;
        Ok((candidates, exclusions))
    }

    /// Drop credits mined in blocks that left the main chain. Each block is
    /// asked about once.
    pub fn drop_orphaned(
        &self,
        candidates: Vec<Credit>,
        exclusions: &mut Exclusions,
    ) -> Result<Vec<Credit>, SelectError> {
        let mut main_chain: HashMap<BlockStamp, bool> = HashMap::new();
        let mut eligible = Vec::with_capacity(candidates.len());
        for c in candidates {
            if let Some(stamp) = c.block {
                let on_chain = match main_chain.get(&stamp) {
                    Some(known) => *known,
                    None => *main_chain.entry(stamp).or_insert(self.chain.is_main_chain(&stamp)?),
                };
                if !on_chain {
                    exclusions.orphaned += c.amount;
                    continue;
                }
            }
            eligible.push(c);
        }
        Ok(eligible)
    }
}

/// Choose from already filtered credits.
///
/// Deterministic for a given candidate set and ordering, whatever order the
/// candidates arrive in.
pub fn choose(
    candidates: Vec<Credit>,
    request: &SelectionRequest,
    exclusions: Exclusions,
) -> Result<Selection, SelectError> {
    let ordering = request.ordering.as_ref();

    if !request.is_sweep() {
        let mut groups: BTreeMap<Script, OrderedCredits<'_>> = BTreeMap::new();
        for credit in &candidates {
            let group = groups
                .entry(credit.pk_script.clone())
                .or_insert_with(|| OrderedCredits::new(ordering));
            group.insert(credit.clone());
            group.trim_to(request.target);
            let cap = request.cap(group.has_segwit());
            group.enforce_cap(cap);
        }

        let winner = groups
            .into_values()
            .filter(|g| g.sum() >= request.target)
            .min_by_key(|g| g.len());
        if let Some(group) = winner {
            debug!(inputs = group.len(), total = group.sum(), "single-script selection");
            return Ok(finish(group, true, exclusions, (0, 0)));
        }
    }

    let mut union = OrderedCredits::new(ordering);
    let mut overflow = (0usize, 0u64);
    for credit in candidates {
        union.insert(credit);
        if !request.is_sweep() {
            union.trim_to(request.target);
        }
        let (count, value) = union.enforce_cap(request.cap(union.has_segwit()));
        overflow.0 += count;
        overflow.1 = overflow.1.saturating_add(value);
    }

    let have = union.sum();
    let need = request.target;
    let covered = if request.is_sweep() { !union.is_empty() } else { have >= need };
    if covered {
        debug!(inputs = union.len(), total = have, "merged selection");
        let single = union.iter().map(|c| &c.pk_script).collect::<HashSet<_>>().len() == 1;
        return Ok(finish(union, single, exclusions, overflow));
    }

    if overflow.0 > 0 && have.saturating_add(overflow.1) >= need {
        return Err(SelectError::TooManyInputs {
            selected: union.len(),
            overflow_value: overflow.1,
            overflow_count: overflow.0,
            need,
        });
    }
    if exclusions.unconfirmed > 0 && have.saturating_add(exclusions.unconfirmed) >= need {
        return Err(SelectError::UnconfirmedCoins { have, unconfirmed: exclusions.unconfirmed, need });
    }
    Err(SelectError::InsufficientFunds { have, need, unconfirmed: exclusions.unconfirmed })
}

fn finish(
    set: OrderedCredits<'_>,
    single_group: bool,
    exclusions: Exclusions,
    (overflow_count, overflow_value): (usize, u64),
) -> Selection {
    let total = set.sum();
    Selection {
        credits: set.into_vec(),
        total,
        single_group,
        exclusions,
        overflow_count,
        overflow_value,
    }
}
