//! Wallet composition: ledger, sync engine, coin selection, creation, keys.
//!
//! The [`Wallet`] owns the long-lived pieces and exposes the user-facing
//! operations. Sync runs on its own thread once [`Wallet::start`] is called;
//! transaction creation is serialized through the [`TxCreator`] thread; key
//! lock state lives in the [`KeyLocker`] task.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

use sluice_core::error::ChainError;
use sluice_core::script::Address;
use sluice_core::traits::{BurnRule, ChainSource};
use sluice_core::types::{Hash256, OutPoint, TxOutput};
use sluice_ledger::{
    Balances, Credit, Database, KvStore, Ledger, LockedOutpoints, RocksStore, TxDetails, TxRecord,
};
use sluice_sync::{RescanJob, SyncEngine, SyncError, SyncStatus, WatchList};

use crate::config::WalletConfig;
use crate::creator::{CreatedTransaction, CreatorContext, TxCreator, TxPolicy};
use crate::error::WalletError;
use crate::keys::AddressOracle;
use crate::locker::KeyLocker;

/// An unspent output as reported by [`Wallet::list_unspent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutput {
    pub credit: Credit,
    pub confirmations: u32,
    /// First owned address the output pays.
    pub address: Option<Address>,
    /// The wallet holds the keys and, for coinbase, the output is mature.
    pub spendable: bool,
}

/// A UTXO wallet bound to one chain source and key oracle.
pub struct Wallet {
    config: WalletConfig,
    db: Database,
    ledger: Ledger,
    chain: Arc<dyn ChainSource>,
    oracle: Arc<dyn AddressOracle>,
    locks: Arc<LockedOutpoints>,
    engine: Arc<SyncEngine>,
    creator: TxCreator,
    locker: KeyLocker,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl Wallet {
    /// Open the RocksDB ledger under `config.data_dir`.
    ///
    /// Must be called within a tokio runtime. The wallet starts locked.
    pub fn open(
        config: WalletConfig,
        chain: Arc<dyn ChainSource>,
        oracle: Arc<dyn AddressOracle>,
        burn: Arc<dyn BurnRule>,
        passphrase: &[u8],
    ) -> Result<Self, WalletError> {
        let store = RocksStore::open(config.db_path())?;
        Self::with_store(config, Arc::new(store), chain, oracle, burn, passphrase)
    }

    /// Open on an arbitrary store.
    pub fn with_store(
        config: WalletConfig,
        store: Arc<dyn KvStore>,
        chain: Arc<dyn ChainSource>,
        oracle: Arc<dyn AddressOracle>,
        burn: Arc<dyn BurnRule>,
        passphrase: &[u8],
    ) -> Result<Self, WalletError> {
        if oracle.network() != config.network {
            return Err(WalletError::WrongNetwork {
                expected: config.network.to_string(),
                got: oracle.network().to_string(),
            });
        }

        let db = Database::new(store);
        let ledger = Ledger::new(config.chain_params());
        let watch = Arc::new(WatchList::new());
        watch.add_addresses(oracle.addresses());
        let unspent = db.view(|r| ledger.unspent_outputs(r))?;
        watch.add_outpoints(unspent.iter().filter_map(|c| {
            let address = c.pk_script.kind().addresses().into_iter().find(|a| oracle.owns(a))?;
            Some((c.outpoint, address))
        }));

        let locks = Arc::new(LockedOutpoints::new());
        let (locker, _task) = KeyLocker::spawn(passphrase);
        let engine = Arc::new(SyncEngine::new(
            chain.clone(),
            db.clone(),
            ledger.clone(),
            watch.clone(),
            config.sync.clone(),
        ));
        let creator = TxCreator::spawn(CreatorContext {
            db: db.clone(),
            ledger: ledger.clone(),
            chain: chain.clone(),
            locks: locks.clone(),
            burn,
            oracle: oracle.clone(),
            locker: locker.clone(),
            watch,
            fee_per_kb: config.fee_per_kb,
            dust_limit: config.dust_limit,
        })?;

        info!(network = %config.network, unspent = unspent.len(), "wallet opened");
        Ok(Self {
            config,
            db,
            ledger,
            chain,
            oracle,
            locks,
            engine,
            creator,
            locker,
            sync_thread: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Configuration the wallet was opened with.
    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    /// The engine driving the ledger, for rescans and status.
    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    fn ensure_running(&self) -> Result<(), WalletError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(WalletError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Start the background sync thread. Idempotent.
    pub fn start(&self) -> Result<(), WalletError> {
        self.ensure_running()?;
        let mut slot = self.sync_thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        let engine = self.engine.clone();
        let handle = std::thread::Builder::new()
            .name("sluice-sync".into())
            .spawn(move || {
                if let Err(e) = engine.run() {
                    error!(error = %e, "sync engine exited");
                }
            })
            .map_err(|e| WalletError::Build(format!("spawn sync thread: {e}")))?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop sync and transaction creation. Later calls fail with
    /// [`WalletError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("wallet shutting down");
        self.engine.shutdown();
        self.creator.shutdown();
        if let Some(handle) = self.sync_thread.lock().take() {
            let _ = handle.join();
        }
    }

    // --- Balances and outputs ---

    /// Height the ledger is synced to.
    pub fn synced_height(&self) -> Result<u32, WalletError> {
        Ok(self.db.view(|r| self.ledger.sync_tip(r))?.map_or(0, |t| t.height()))
    }

    /// Spendable balance with at least `min_conf` confirmations.
    pub fn balance(&self, min_conf: u32) -> Result<u64, WalletError> {
        Ok(self.balances(min_conf)?.spendable)
    }

    /// Unspent value split into spendable, immature and unconfirmed.
    pub fn balances(&self, min_conf: u32) -> Result<Balances, WalletError> {
        self.ensure_running()?;
        let tip = self.synced_height()?;
        Ok(self.db.view(|r| self.ledger.balances(r, min_conf, tip))?)
    }

    /// Unlocked unspent outputs with confirmations in `[min_conf, max_conf]`,
    /// optionally restricted to outputs paying one of `addresses`.
    pub fn list_unspent(
        &self,
        min_conf: u32,
        max_conf: u32,
        addresses: Option<&HashSet<Address>>,
    ) -> Result<Vec<UnspentOutput>, WalletError> {
        self.ensure_running()?;
        let tip = self.synced_height()?;
        let params = self.ledger.params();
        let mut out = Vec::new();
        let mut visit = |c: &Credit| {
            let confirmations = c.confirmations(tip);
            if confirmations < min_conf || confirmations > max_conf || self.locks.is_locked(&c.outpoint) {
                return ControlFlow::Continue(());
            }
            let paid = c.pk_script.kind().addresses();
            if let Some(filter) = addresses {
                if !paid.iter().any(|a| filter.contains(a)) {
                    return ControlFlow::Continue(());
                }
            }
            let mature = !c.from_coinbase || c.height().is_some_and(|h| params.is_coinbase_mature(h, tip));
            out.push(UnspentOutput {
                credit: c.clone(),
                confirmations,
                address: paid.into_iter().find(|a| self.oracle.owns(a)),
                spendable: mature && self.oracle.can_spend(&c.pk_script),
            });
            ControlFlow::Continue(())
        };
        self.db.view(|r| self.ledger.for_each_unspent_output(r, &[], &mut visit))?;
        Ok(out)
    }

    /// Credits, debits and block of a wallet transaction.
    pub fn tx_details(&self, txid: &Hash256) -> Result<Option<TxDetails>, WalletError> {
        Ok(self.db.view(|r| self.ledger.tx_details(r, txid))?)
    }

    // --- Transactions ---

    /// Policy with the configured selection defaults.
    pub fn default_policy(&self, min_conf: u32) -> TxPolicy {
        TxPolicy {
            max_inputs: self.config.selection.max_inputs,
            ordering: self.config.selection.ordering.ordering(),
            ..TxPolicy::new(min_conf)
        }
    }

    /// Select, build and sign a transaction paying `outputs`.
    ///
    /// Unless `policy.dry_run` is set, a fully signed transaction is recorded
    /// as unmined so its inputs are not selected again.
    pub async fn create_transaction(
        &self,
        outputs: Vec<TxOutput>,
        policy: TxPolicy,
    ) -> Result<CreatedTransaction, WalletError> {
        self.ensure_running()?;
        self.creator.create(outputs, policy).await
    }

    /// Create, record and broadcast a transaction. A rejected transaction is
    /// removed from the ledger again.
    pub async fn send_outputs(&self, outputs: Vec<TxOutput>, mut policy: TxPolicy) -> Result<Hash256, WalletError> {
        policy.dry_run = false;
        let created = self.create_transaction(outputs, policy).await?;
        if !created.is_complete() {
            let failed: Vec<String> = created.signing_errors.iter().map(|e| e.to_string()).collect();
            return Err(WalletError::Build(format!("unsigned inputs: {}", failed.join("; "))));
        }

        let chain = self.chain.clone();
        let tx = created.tx.clone();
        let sent = tokio::task::spawn_blocking(move || chain.send_raw_transaction(&tx))
            .await
            .map_err(|e| WalletError::Build(format!("broadcast task: {e}")))?;
        match sent {
            Ok(txid) => {
                info!(%txid, fee = created.fee, "transaction broadcast");
                Ok(txid)
            }
            Err(ChainError::Rejected(reason)) => {
                warn!(txid = %created.txid, %reason, "broadcast rejected, removing");
                let rec = TxRecord::new(created.tx);
                self.db.update(|tx| self.ledger.remove_unmined_transaction(tx, &rec))?;
                Err(ChainError::Rejected(reason).into())
            }
            Err(e) => {
                warn!(txid = %created.txid, error = %e, "broadcast failed, kept for rebroadcast");
                Err(e.into())
            }
        }
    }

    /// Re-send every unmined transaction. Rejected ones are removed together
    /// with their dependents. Returns (sent, removed).
    pub async fn rebroadcast_unmined(&self) -> Result<(usize, usize), WalletError> {
        self.ensure_running()?;
        let pending = self.db.view(|r| self.ledger.unmined_transactions(r))?;
        let mut sent = 0;
        let mut removed = 0;
        for rec in pending {
            // An earlier removal may have cascaded to this one.
            if !self.db.view(|r| self.ledger.is_unmined(r, &rec.txid))? {
                continue;
            }
            let chain = self.chain.clone();
            let tx = rec.tx.clone();
            let result = tokio::task::spawn_blocking(move || chain.send_raw_transaction(&tx))
                .await
                .map_err(|e| WalletError::Build(format!("broadcast task: {e}")))?;
            match result {
                Ok(_) => sent += 1,
                Err(ChainError::Rejected(reason)) => {
                    warn!(txid = %rec.txid, %reason, "unmined transaction rejected, removing");
                    self.db.update(|tx| self.ledger.remove_unmined_transaction(tx, &rec))?;
                    removed += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(sent, removed, "rebroadcast unmined transactions");
        Ok((sent, removed))
    }

    // --- Output locks ---

    /// Exclude `outpoint` from selection until unlocked under `name`.
    pub fn lock_outpoint(&self, outpoint: OutPoint, name: &str) {
        self.locks.lock(outpoint, name);
    }

    /// Release a lock held under `name`. Returns whether it existed.
    pub fn unlock_outpoint(&self, outpoint: &OutPoint, name: &str) -> bool {
        self.locks.unlock(outpoint, name)
    }

    /// Release every lock held under `name`.
    pub fn reset_locks(&self, name: &str) -> usize {
        self.locks.reset(name)
    }

    /// Every lock, sorted by outpoint.
    pub fn locked_outpoints(&self) -> Vec<(OutPoint, String)> {
        self.locks.list()
    }

    // --- Sync control ---

    /// Watch more addresses from now on. Past payments need a rescan.
    pub fn watch_addresses(&self, addresses: impl IntoIterator<Item = Address>) -> usize {
        self.engine.watch().add_addresses(addresses)
    }

    /// Queue a rescan for the background sync thread.
    pub fn start_rescan(
        &self,
        from: u32,
        to: u32,
        addresses: Vec<Address>,
        drop_existing: bool,
    ) -> Result<(), WalletError> {
        self.ensure_running()?;
        if from > to {
            return Err(WalletError::InvalidAmount(format!("rescan range {from}..={to} is empty")));
        }
        self.engine.start_rescan(RescanJob { from, to, addresses, drop_existing });
        Ok(())
    }

    /// Stop the running rescan after its current batch.
    pub fn stop_rescan(&self) {
        self.engine.stop_rescan();
    }

    /// What the sync engine is doing.
    pub fn sync_status(&self) -> SyncStatus {
        self.engine.status()
    }

    /// Sync to the chain tip on the calling thread.
    pub fn sync_now(&self) -> Result<(), WalletError> {
        self.ensure_running()?;
        match self.engine.sync_to_tip() {
            Ok(()) => Ok(()),
            Err(SyncError::ShuttingDown) => Err(WalletError::ShuttingDown),
            Err(e) => Err(e.into()),
        }
    }

    // --- Keys ---

    /// Unlock for the configured timeout (zero means until [`lock`](Self::lock)).
    pub async fn unlock(&self, passphrase: &[u8]) -> Result<(), WalletError> {
        let timeout = match self.config.unlock_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        self.unlock_for(passphrase, timeout).await
    }

    pub async fn unlock_for(&self, passphrase: &[u8], timeout: Option<Duration>) -> Result<(), WalletError> {
        self.ensure_running()?;
        self.locker.unlock(passphrase, timeout).await
    }

    /// Lock key material now.
    pub fn lock(&self) -> Result<(), WalletError> {
        self.locker.lock()
    }

    pub async fn is_locked(&self) -> Result<bool, WalletError> {
        self.locker.is_locked().await
    }
}

impl Drop for Wallet {
    fn drop(&mut self) {
        self.shutdown();
    }
}
