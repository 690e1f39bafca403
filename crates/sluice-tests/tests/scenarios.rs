//! End-to-end scenarios across ledger, sync engine and wallet.

use std::sync::Arc;

use sluice_core::constants::NetworkType;
use sluice_core::script::Address;
use sluice_core::testing::{MemChain, coinbase, spend};
use sluice_core::traits::NoBurn;
use sluice_core::types::{Hash256, OutPoint, TxOutput};
use sluice_ledger::keys::outpoint_key;
use sluice_ledger::{Bucket, KvRead, LockedOutpoints};
use sluice_tests::helpers::{
    LedgerFixture, PASSPHRASE, Relevant, meta, regtest_config, script, sync_fixture, wait_until,
    wallet_fixture,
};
use sluice_wallet::coin_selection::{CoinSelector, SelectionRequest};
use sluice_wallet::error::SelectError;
use sluice_wallet::testing::MemoryKeys;
use sluice_wallet::{Wallet, WalletError};

fn pay(value: u64) -> Vec<TxOutput> {
    vec![TxOutput { value, pk_script: Address::PubKeyHash([0xEE; 20]).script() }]
}

fn foreign(index: u32) -> OutPoint {
    OutPoint::new(Hash256([0x77; 32]), index)
}

#[test]
fn immature_coinbase_counts_but_cannot_be_spent() {
    let address = Address::PubKeyHash([1; 20]);
    let fx = sync_fixture(std::slice::from_ref(&address));
    fx.chain.mine_empty(9);
    let (block, _) = fx.chain.mine_coinbase(address.script(), 100);
    assert_eq!(block.height(), 10);
    fx.chain.mine_empty(2);
    fx.engine.sync_to_tip().unwrap();

    let tip = fx.chain.height();
    assert_eq!(tip, 12);
    let balances = fx.ledger.db.view(|r| fx.ledger.ledger.balances(r, 1, tip)).unwrap();
    assert_eq!(balances.total(), 100);
    assert_eq!((balances.spendable, balances.immature), (0, 100));

    let locks = LockedOutpoints::new();
    let selector = CoinSelector::new(&fx.ledger.ledger, &*fx.chain, &locks, &NoBurn);
    let err = selector.select(&fx.ledger.db, tip, &SelectionRequest::new(50, 1)).unwrap_err();
    assert_eq!(err, SelectError::UnconfirmedCoins { have: 0, unconfirmed: 100, need: 50 });
    assert!(err.is_insufficient_funds());
}

#[test]
fn single_address_selection_takes_what_the_target_needs() {
    let address = Address::PubKeyHash([2; 20]);
    let fx = sync_fixture(std::slice::from_ref(&address));
    fx.chain.mine(vec![
        spend(&[foreign(0)], vec![(address.script(), 60)]),
        spend(&[foreign(1)], vec![(address.script(), 50)]),
    ]);
    fx.chain.mine_empty(1);
    fx.engine.sync_to_tip().unwrap();

    let tip = fx.chain.height();
    let locks = LockedOutpoints::new();
    let selector = CoinSelector::new(&fx.ledger.ledger, &*fx.chain, &locks, &NoBurn);
    let both = selector.select(&fx.ledger.db, tip, &SelectionRequest::new(100, 1)).unwrap();
    let mut amounts: Vec<u64> = both.credits.iter().map(|c| c.amount).collect();
    amounts.sort_unstable();
    assert_eq!(amounts, vec![50, 60]);
    assert!(both.single_group);

    // A larger output arriving later covers the target alone.
    fx.chain.mine(vec![spend(&[foreign(2)], vec![(address.script(), 120)])]);
    fx.engine.sync_to_tip().unwrap();
    let tip = fx.chain.height();
    let one = selector.select(&fx.ledger.db, tip, &SelectionRequest::new(100, 1)).unwrap();
    assert_eq!(one.credits.len(), 1);
    assert_eq!(one.total, 120);
}

#[test]
fn rollback_returns_spend_to_unmined_pool() {
    let fx = LedgerFixture::new();
    let cb = coinbase(1, script(1), 100_000);
    let funding = OutPoint::new(cb.txid(), 0);
    fx.record(Some(&meta(1, 0)), &[Relevant::new(cb, vec![(0, false)])]);

    let t = spend(&[funding], vec![(script(9), 40_000), (script(1), 60_000)]);
    let t_id = t.txid();
    let change = OutPoint::new(t_id, 1);
    fx.record(Some(&meta(7, 0)), &[Relevant::new(t, vec![(1, true)])]);
    assert_eq!(fx.total(7), 60_000);

    let delta = fx.rollback(7);
    assert_eq!(delta, 100_000 - 60_000);

    fx.db
        .view(|r| {
            assert!(fx.ledger.is_unmined(r, &t_id)?);
            assert!(!fx.ledger.is_mined(r, &t_id)?);
            let details = fx.ledger.tx_details(r, &t_id)?.unwrap();
            assert!(details.block.is_none());
            assert_eq!(details.debits.len(), 1);

            // The funding output is back in the mined unspent index but
            // stays reserved by the unmined spend.
            assert!(r.contains(Bucket::Unspent, &outpoint_key(&funding))?);
            assert!(fx.ledger.has_unmined_spender(r, &funding)?);
            assert!(!r.contains(Bucket::Unspent, &outpoint_key(&change))?);

            let unspent = fx.ledger.unspent_outputs(r)?;
            assert_eq!(unspent.len(), 1);
            assert_eq!(unspent[0].outpoint, change);
            assert!(unspent[0].block.is_none());
            assert!(unspent[0].is_change);
            Ok::<_, sluice_ledger::LedgerError>(())
        })
        .unwrap();
    assert_eq!(fx.total(7), 60_000);
}

#[tokio::test]
async fn send_survives_reorg_and_rebroadcast() {
    let fx = wallet_fixture(regtest_config());
    fx.chain.mine_coinbase(fx.address.script(), 100_000);
    fx.chain.mine_empty(6);
    fx.wallet.sync_now().unwrap();
    assert_eq!(fx.wallet.balance(1).unwrap(), 100_000);

    fx.wallet.unlock(PASSPHRASE).await.unwrap();
    let txid = fx.wallet.send_outputs(pay(30_000), fx.wallet.default_policy(1)).await.unwrap();
    let sent = fx.chain.broadcasts();
    assert_eq!(sent.len(), 1);
    let change = fx.wallet.tx_details(&txid).unwrap().unwrap().net() + 100_000;

    let mined = fx.chain.mine(sent.clone());
    fx.wallet.sync_now().unwrap();
    assert_eq!(fx.wallet.balance(1).unwrap(), change as u64);
    let details = fx.wallet.tx_details(&txid).unwrap().unwrap();
    assert_eq!(details.block.map(|b| b.height()), Some(mined.height()));

    // The block carrying the payment is replaced by a longer branch without it.
    fx.chain.reorg(mined.height());
    fx.chain.mine_empty(2);
    fx.wallet.sync_now().unwrap();
    assert_eq!(fx.wallet.synced_height().unwrap(), fx.chain.height());
    let details = fx.wallet.tx_details(&txid).unwrap().unwrap();
    assert!(details.block.is_none());
    let balances = fx.wallet.balances(1).unwrap();
    assert_eq!(balances.spendable, 0);
    assert_eq!(balances.unconfirmed, change as u64);

    assert_eq!(fx.wallet.rebroadcast_unmined().await.unwrap(), (1, 0));
    assert_eq!(fx.chain.broadcasts().len(), 2);

    fx.chain.mine(vec![fx.chain.broadcasts()[1].clone()]);
    fx.wallet.sync_now().unwrap();
    assert_eq!(fx.wallet.balance(1).unwrap(), change as u64);
    fx.wallet.shutdown();
}

#[tokio::test]
async fn background_sync_follows_the_chain() {
    let fx = wallet_fixture(regtest_config());
    fx.wallet.start().unwrap();
    fx.chain.mine_coinbase(fx.address.script(), 5_000);
    fx.chain.mine_empty(5);

    let target = fx.chain.height();
    assert!(wait_until(|| fx.wallet.synced_height().unwrap_or(0) == target));
    assert_eq!(fx.wallet.balance(1).unwrap(), 5_000);
    fx.wallet.shutdown();
    assert_eq!(fx.wallet.balance(1), Err(WalletError::ShuttingDown));
}

#[tokio::test]
async fn ledger_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = regtest_config();
    config.data_dir = dir.path().to_path_buf();
    let chain = Arc::new(MemChain::new());
    let keys = Arc::new(MemoryKeys::new([0x42; 32], NetworkType::Regtest));
    let address = keys.next_address();

    let open = |config| {
        Wallet::open(config, chain.clone(), keys.clone(), Arc::new(NoBurn), PASSPHRASE).unwrap()
    };

    let (height, funding) = {
        let wallet = open(config.clone());
        let (_, cb) = chain.mine_coinbase(address.script(), 70_000);
        chain.mine_empty(6);
        wallet.sync_now().unwrap();
        assert_eq!(wallet.balance(1).unwrap(), 70_000);

        let funding = OutPoint::new(cb.txid(), 0);
        wallet.lock_outpoint(funding, "manual");
        (wallet.synced_height().unwrap(), funding)
    };

    let wallet = open(config);
    assert_eq!(wallet.synced_height().unwrap(), height);
    assert_eq!(wallet.balance(1).unwrap(), 70_000);
    // Output locks live only as long as the process.
    assert!(wallet.locked_outpoints().is_empty());
    let unspent = wallet.list_unspent(1, u32::MAX, None).unwrap();
    assert_eq!(unspent.len(), 1);
    assert_eq!(unspent[0].credit.outpoint, funding);
    assert_eq!(unspent[0].address.as_ref(), Some(&address));

    // Blocks mined while closed are picked up from the stored tip.
    chain.mine_coinbase(address.script(), 1_000);
    wallet.sync_now().unwrap();
    assert_eq!(wallet.synced_height().unwrap(), chain.height());
    assert_eq!(wallet.balances(1).unwrap().total(), 71_000);
}
