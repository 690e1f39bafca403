//! Serialized transaction creation.
//!
//! Every request goes through one dedicated thread, so two transactions
//! built at the same time can never select the same outputs: the second
//! request only runs after the first has been recorded as unmined, which
//! removes its inputs from the unspent set.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use sluice_core::script::Address;
use sluice_core::traits::{BurnRule, ChainSource};
use sluice_core::types::{Hash256, OutPoint, Transaction, TxOutput};
use sluice_ledger::{Credit, Database, DbTx, Ledger, LedgerError, LockedOutpoints, TxRecord};
use sluice_sync::WatchList;

use crate::builder::TransactionBuilder;
use crate::coin_selection::{CoinSelector, SelectionRequest};
use crate::error::{InputSignError, WalletError};
use crate::keys::AddressOracle;
use crate::locker::KeyLocker;
use crate::ordering::{InputOrdering, OrderingPolicy};

/// Rounds of select-then-build before giving up on a stable fee.
const MAX_FEE_ROUNDS: usize = 5;

/// Caller-controlled selection and recording options.
#[derive(Clone)]
pub struct TxPolicy {
    pub min_conf: u32,
    /// Only spend outputs paying one of these addresses.
    pub addresses: Option<HashSet<Address>>,
    pub max_inputs: Option<usize>,
    pub ordering: Arc<dyn InputOrdering>,
    /// Build and sign but do not record in the ledger.
    pub dry_run: bool,
}

impl TxPolicy {
    pub fn new(min_conf: u32) -> Self {
        Self {
            min_conf,
            addresses: None,
            max_inputs: None,
            ordering: OrderingPolicy::default().ordering(),
            dry_run: false,
        }
    }
}

/// A built transaction and what it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTransaction {
    pub tx: Transaction,
    pub txid: Hash256,
    pub fee: u64,
    pub inputs: Vec<Credit>,
    pub change_index: Option<u32>,
    /// Inputs left unsigned. The transaction is recorded only when empty.
    pub signing_errors: Vec<InputSignError>,
    /// Whether the transaction was written to the unmined pool.
    pub recorded: bool,
}

impl CreatedTransaction {
    pub fn is_complete(&self) -> bool {
        self.signing_errors.is_empty()
    }
}

/// Everything the creator thread reads or writes.
pub(crate) struct CreatorContext {
    pub db: Database,
    pub ledger: Ledger,
    pub chain: Arc<dyn ChainSource>,
    pub locks: Arc<LockedOutpoints>,
    pub burn: Arc<dyn BurnRule>,
    pub oracle: Arc<dyn AddressOracle>,
    pub locker: KeyLocker,
    pub watch: Arc<WatchList>,
    pub fee_per_kb: u64,
    pub dust_limit: u64,
}

struct CreateRequest {
    outputs: Vec<TxOutput>,
    policy: TxPolicy,
    reply: oneshot::Sender<Result<CreatedTransaction, WalletError>>,
}

/// Handle to the creator thread.
pub struct TxCreator {
    requests: Mutex<Option<mpsc::UnboundedSender<CreateRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TxCreator {
    pub(crate) fn spawn(ctx: CreatorContext) -> Result<Self, WalletError> {
        let (requests, mut rx) = mpsc::unbounded_channel::<CreateRequest>();
        let thread = std::thread::Builder::new()
            .name("sluice-creator".into())
            .spawn(move || {
                while let Some(request) = rx.blocking_recv() {
                    let result = ctx.create(&request.outputs, &request.policy);
                    let _ = request.reply.send(result);
                }
                debug!("transaction creator stopped");
            })
            .map_err(|e| WalletError::Build(format!("spawn creator thread: {e}")))?;
        Ok(Self {
            requests: Mutex::new(Some(requests)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue a request and wait for its result.
    pub async fn create(
        &self,
        outputs: Vec<TxOutput>,
        policy: TxPolicy,
    ) -> Result<CreatedTransaction, WalletError> {
        let (reply, rx) = oneshot::channel();
        {
            let requests = self.requests.lock();
            let sender = requests.as_ref().ok_or(WalletError::ShuttingDown)?;
            sender
                .send(CreateRequest { outputs, policy, reply })
                .map_err(|_| WalletError::ShuttingDown)?;
        }
        rx.await.map_err(|_| WalletError::ShuttingDown)?
    }

    /// Refuse new requests, finish queued ones and join the thread.
    pub fn shutdown(&self) {
        self.requests.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TxCreator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CreatorContext {
    fn create(&self, outputs: &[TxOutput], policy: &TxPolicy) -> Result<CreatedTransaction, WalletError> {
        let mut builder = TransactionBuilder::new(self.fee_per_kb, self.dust_limit);
        for out in outputs {
            builder.add_output(out.pk_script.clone(), out.value);
        }
        let send = builder.send_total()?;

        // Signing needs the keys; hold them for the whole request.
        let _hold = if policy.dry_run { None } else { Some(self.locker.hold_blocking()?) };

        let change_script = self.oracle.change_script().map_err(WalletError::Build)?;
        let tip = self.db.view(|r| self.ledger.sync_tip(r))?.map_or(0, |t| t.height());
        let selector = CoinSelector::new(&self.ledger, self.chain.as_ref(), &self.locks, self.burn.as_ref());

        let mut request = SelectionRequest {
            target: send,
            min_conf: policy.min_conf,
            addresses: policy.addresses.clone(),
            max_inputs: policy.max_inputs,
            ordering: policy.ordering.clone(),
        };
        let mut unsigned = None;
        for round in 0..MAX_FEE_ROUNDS {
            let selection = selector.select(&self.db, tip, &request)?;
            match builder.build(&selection, &change_script) {
                Ok(built) => {
                    unsigned = Some(built);
                    break;
                }
                Err(WalletError::Select(e)) if e.is_insufficient_funds() && !request.is_sweep() => {
                    let fee = builder.estimate_fee(&selection.credits, Some(&change_script));
                    let target = send.saturating_add(fee);
                    if target <= request.target {
                        return Err(WalletError::Select(e));
                    }
                    debug!(round, target, "raising selection target to cover fee");
                    request.target = target;
                }
                Err(e) => return Err(e),
            }
        }
        let mut unsigned = unsigned
            .ok_or_else(|| WalletError::Build("fee did not converge".into()))?;
        unsigned.randomize_change_position(&mut rand::thread_rng());

        let (tx, signing_errors) = if policy.dry_run {
            (unsigned.tx.clone(), Vec::new())
        } else {
            TransactionBuilder::sign(&unsigned, self.oracle.as_ref())
        };
        for e in &signing_errors {
            warn!(error = %e, "input not signed");
        }

        let txid = tx.txid();
        let recorded = !policy.dry_run && signing_errors.is_empty();
        if recorded {
            self.record(&tx, unsigned.change_index)?;
        }
        info!(%txid, inputs = unsigned.inputs.len(), fee = unsigned.fee, recorded, "created transaction");
        Ok(CreatedTransaction {
            tx,
            txid,
            fee: unsigned.fee,
            inputs: unsigned.inputs,
            change_index: unsigned.change_index,
            signing_errors,
            recorded,
        })
    }

    /// Write `tx` to the unmined pool with credits for the outputs the wallet owns.
    fn record(&self, tx: &Transaction, change_index: Option<u32>) -> Result<(), WalletError> {
        let rec = TxRecord::new(tx.clone());
        let owned = self.db.update(|dbtx| self.record_owned(dbtx, &rec, change_index))?;

        let addresses: Vec<Address> = owned.iter().map(|(_, a)| a.clone()).collect();
        self.watch.add_addresses(addresses);
        self.watch.add_outpoints(owned);
        Ok(())
    }

    fn record_owned(
        &self,
        dbtx: &mut DbTx<'_>,
        rec: &TxRecord,
        change_index: Option<u32>,
    ) -> Result<Vec<(OutPoint, Address)>, LedgerError> {
        self.ledger.insert_transaction(dbtx, rec, None)?;
        let mut owned = Vec::new();
        for (index, out) in rec.tx.outputs.iter().enumerate() {
            let index = index as u32;
            let kind = out.pk_script.kind();
            let Some(address) = kind.addresses().into_iter().find(|a| self.oracle.owns(a)) else {
                continue;
            };
            if !self.oracle.can_spend(&out.pk_script) {
                continue;
            }
            self.ledger.add_credit(dbtx, rec, None, index, change_index == Some(index))?;
            owned.push((OutPoint::new(rec.txid, index), address));
        }
        Ok(owned)
    }
}
