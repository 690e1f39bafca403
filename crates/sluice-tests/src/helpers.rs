//! Shared test helpers for integration and property tests.

use std::sync::Arc;

use sluice_core::constants::{ChainParams, NetworkType};
use sluice_core::script::{Address, Script};
use sluice_core::testing::MemChain;
use sluice_core::traits::NoBurn;
use sluice_core::types::{BlockMeta, Hash256, Transaction};
use sluice_ledger::{Bucket, Database, Ledger, LedgerError, MemoryStore, TxRecord};
use sluice_sync::{SyncConfig, SyncEngine, WatchList};
use sluice_wallet::testing::MemoryKeys;
use sluice_wallet::{Wallet, WalletConfig};

/// Passphrase of every wallet built by [`wallet_fixture`].
pub const PASSPHRASE: &[u8] = b"integration";

/// Legacy locking script owned by seed `seed`.
pub fn script(seed: u8) -> Script {
    Address::PubKeyHash([seed; 20]).script()
}

/// Deterministic block meta for `height`, distinct per `fork`.
pub fn meta(height: u32, fork: u8) -> BlockMeta {
    let mut hash = [fork; 32];
    hash[..4].copy_from_slice(&height.to_be_bytes());
    BlockMeta::new(height, Hash256(hash), 1_700_000_000 + i64::from(height) * 600)
}

/// Record with a fixed receive time so snapshots compare equal.
pub fn rec(tx: Transaction) -> TxRecord {
    TxRecord::with_received(tx, 1_700_000_000)
}

/// A transaction plus the output indexes the wallet owns, with change flags.
pub struct Relevant {
    pub rec: TxRecord,
    pub owned: Vec<(u32, bool)>,
}

impl Relevant {
    pub fn new(tx: Transaction, owned: Vec<(u32, bool)>) -> Self {
        Self { rec: rec(tx), owned }
    }
}

/// Ledger over an inspectable memory store.
pub struct LedgerFixture {
    pub store: Arc<MemoryStore>,
    pub db: Database,
    pub ledger: Ledger,
}

impl LedgerFixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            db: Database::new(store.clone()),
            store,
            ledger: Ledger::new(ChainParams::regtest()),
        }
    }

    /// Record `txs` under `block` (or unmined) in one storage transaction.
    pub fn record(&self, block: Option<&BlockMeta>, txs: &[Relevant]) {
        self.db
            .update(|tx| {
                for relevant in txs {
                    self.ledger.insert_transaction(tx, &relevant.rec, block)?;
                    for &(index, is_change) in &relevant.owned {
                        self.ledger.add_credit(tx, &relevant.rec, block, index, is_change)?;
                    }
                }
                Ok::<_, LedgerError>(())
            })
            .expect("record transactions");
    }

    pub fn rollback(&self, height: u32) -> i64 {
        self.db
            .update(|tx| self.ledger.rollback_one_block(tx, height))
            .expect("rollback")
    }

    /// Unspent value of every kind: spendable, immature and unconfirmed.
    pub fn total(&self, tip: u32) -> u64 {
        self.db
            .view(|r| self.ledger.balances(r, 0, tip))
            .expect("balances")
            .total()
    }

    pub fn history(&self) -> std::collections::BTreeMap<(Bucket, Vec<u8>), Vec<u8>> {
        self.store.snapshot(&Bucket::HISTORY)
    }
}

impl Default for LedgerFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Sync engine over a fresh in-memory chain, watching `watched`.
pub struct SyncFixture {
    pub chain: Arc<MemChain>,
    pub ledger: LedgerFixture,
    pub engine: SyncEngine,
}

pub fn sync_fixture(watched: &[Address]) -> SyncFixture {
    let chain = Arc::new(MemChain::new());
    let ledger = LedgerFixture::new();
    let watch = Arc::new(WatchList::new());
    watch.add_addresses(watched.iter().cloned());
    let config = SyncConfig { workers: 4, backlog: 8, batch_size: 4, ..SyncConfig::default() };
    let engine = SyncEngine::new(chain.clone(), ledger.db.clone(), ledger.ledger.clone(), watch, config);
    SyncFixture { chain, ledger, engine }
}

/// Wallet on regtest over an in-memory store, with one derived address.
pub struct WalletFixture {
    pub chain: Arc<MemChain>,
    pub keys: Arc<MemoryKeys>,
    pub wallet: Wallet,
    pub address: Address,
}

/// Must be called within a tokio runtime.
pub fn wallet_fixture(config: WalletConfig) -> WalletFixture {
    let chain = Arc::new(MemChain::new());
    let keys = Arc::new(MemoryKeys::new([0x42; 32], NetworkType::Regtest));
    let address = keys.next_address();
    let wallet = Wallet::with_store(
        config,
        Arc::new(MemoryStore::new()),
        chain.clone(),
        keys.clone(),
        Arc::new(NoBurn),
        PASSPHRASE,
    )
    .expect("open wallet");
    WalletFixture { chain, keys, wallet, address }
}

/// Regtest wallet config with fast polling.
pub fn regtest_config() -> WalletConfig {
    let mut config = WalletConfig::for_network(NetworkType::Regtest);
    config.sync.poll_interval_ms = 20;
    config.dust_limit = 100;
    config
}

/// Poll `cond` until it holds or five seconds pass.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    cond()
}
