//! Ledger behaviour against the in-memory and RocksDB stores.

use std::ops::ControlFlow;
use std::sync::Arc;

use sluice_core::constants::ChainParams;
use sluice_core::script::{Address, Script};
use sluice_core::testing::{coinbase, spend};
use sluice_core::types::{BlockMeta, Hash256, OutPoint};
use sluice_ledger::{
    Bucket, Credit, Database, DbTx, KvRead, Ledger, LedgerError, MemoryStore, RocksStore,
    TxRecord,
};

fn setup() -> (Database, Arc<MemoryStore>, Ledger) {
    let store = Arc::new(MemoryStore::new());
    (Database::new(store.clone()), store, Ledger::new(ChainParams::regtest()))
}

fn script(seed: u8) -> Script {
    Address::WitnessPubKeyHash([seed; 20]).script()
}

fn meta(height: u32) -> BlockMeta {
    BlockMeta::new(height, Hash256([height as u8; 32]), 1_700_000_000 + height as i64)
}

fn rec(tx: sluice_core::types::Transaction) -> TxRecord {
    TxRecord::with_received(tx, 1_700_000_000)
}

fn update<T>(db: &Database, f: impl FnOnce(&mut DbTx<'_>) -> Result<T, LedgerError>) -> T {
    db.update(f).unwrap()
}

/// Mine a coinbase of `value` to the wallet at `height` and credit output 0.
fn mine_coinbase(db: &Database, ledger: &Ledger, height: u32, value: u64) -> TxRecord {
    let cb = rec(coinbase(height, script(1), value));
    update(db, |tx| {
        ledger.insert_transaction(tx, &cb, Some(&meta(height)))?;
        ledger.add_credit(tx, &cb, Some(&meta(height)), 0, false)
    });
    cb
}

fn balance(db: &Database, ledger: &Ledger, min_conf: u32, tip: u32) -> u64 {
    db.view(|r| ledger.balance(r, min_conf, tip)).unwrap()
}

fn unspent(db: &Database, ledger: &Ledger) -> Vec<Credit> {
    db.view(|r| ledger.unspent_outputs(r)).unwrap()
}

// --- Inserts and credits ---

#[test]
fn unmined_insert_is_idempotent() {
    let (db, _, ledger) = setup();
    let t = rec(spend(&[OutPoint::new(Hash256([9; 32]), 0)], vec![(script(1), 10)]));
    assert!(update(&db, |tx| ledger.insert_transaction(tx, &t, None)));
    assert!(!update(&db, |tx| ledger.insert_transaction(tx, &t, None)));
    assert_eq!(db.view(|r| ledger.unmined_transactions(r)).unwrap().len(), 1);
}

#[test]
fn coinbase_cannot_be_unmined() {
    let (db, _, ledger) = setup();
    let cb = rec(coinbase(3, script(1), 50));
    let err = db.update(|tx| ledger.insert_transaction(tx, &cb, None)).unwrap_err();
    assert!(err.is_input());
}

#[test]
fn add_credit_rejects_bad_index_and_dedups() {
    let (db, _, ledger) = setup();
    let t = rec(spend(&[OutPoint::new(Hash256([9; 32]), 0)], vec![(script(1), 10)]));
    let err = db
        .update(|tx| {
            ledger.insert_transaction(tx, &t, None)?;
            ledger.add_credit(tx, &t, None, 1, false)
        })
        .unwrap_err();
    assert!(matches!(err, LedgerError::Input(_)));
    // Nothing from the failed transaction was committed.
    assert!(db.view(|r| ledger.unmined_transactions(r)).unwrap().is_empty());

    update(&db, |tx| ledger.insert_transaction(tx, &t, None));
    assert!(update(&db, |tx| ledger.add_credit(tx, &t, None, 0, false)));
    assert!(!update(&db, |tx| ledger.add_credit(tx, &t, None, 0, false)));
    assert_eq!(balance(&db, &ledger, 0, 0), 10);
}

#[test]
fn mined_insert_promotes_unmined_record_and_credits() {
    let (db, store, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(2), 30), (script(1), 60)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, None)?;
        ledger.add_credit(tx, &t, None, 1, true)
    });
    // Unmined spend hides the coinbase output; the change is unconfirmed.
    assert_eq!(balance(&db, &ledger, 0, 200), 60);
    assert_eq!(balance(&db, &ledger, 1, 200), 0);

    update(&db, |tx| ledger.insert_transaction(tx, &t, Some(&meta(7))));
    assert_eq!(store.len(Bucket::UnminedTxs), 0);
    assert_eq!(store.len(Bucket::UnminedCredits), 0);
    assert_eq!(store.len(Bucket::UnminedInputs), 0);
    assert_eq!(store.len(Bucket::Debits), 1);

    let credits = unspent(&db, &ledger);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].outpoint, OutPoint::new(t.txid, 1));
    assert_eq!(credits[0].height(), Some(7));
    assert!(credits[0].is_change);
    assert_eq!(balance(&db, &ledger, 1, 7), 60);
}

#[test]
fn mined_insert_twice_is_noop() {
    let (db, _, ledger) = setup();
    let cb = rec(coinbase(2, script(1), 50));
    assert!(update(&db, |tx| ledger.insert_transaction(tx, &cb, Some(&meta(2)))));
    assert!(!update(&db, |tx| ledger.insert_transaction(tx, &cb, Some(&meta(2)))));
    assert_eq!(db.view(|r| ledger.block_txids(r, 2)).unwrap(), vec![cb.txid]);
}

#[test]
fn transaction_moved_to_earlier_block_keeps_one_record() {
    let (db, _, ledger) = setup();
    let t = rec(spend(&[OutPoint::new(Hash256([9; 32]), 0)], vec![(script(1), 30)]));
    let other = rec(spend(&[OutPoint::new(Hash256([9; 32]), 1)], vec![(script(1), 5)]));
    update(&db, |tx| {
        for r in [&other, &t] {
            ledger.insert_transaction(tx, r, Some(&meta(5)))?;
            ledger.add_credit(tx, r, Some(&meta(5)), 0, false)?;
        }
        Ok(())
    });

    // The reorganized chain carries `t` one block earlier.
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, Some(&meta(4)))?;
        ledger.add_credit(tx, &t, Some(&meta(4)), 0, false)
    });

    db.view(|r| {
        assert_eq!(ledger.mined_heights(r, &t.txid)?, vec![4]);
        assert!(!ledger.is_unmined(r, &t.txid)?);
        assert_eq!(ledger.block_at(r, 5)?, None);
        assert_eq!(ledger.block_txids(r, 4)?, vec![t.txid]);
        // The rest of the stale block waits in the unmined pool.
        assert!(ledger.is_unmined(r, &other.txid)?);
        assert!(r.contains(Bucket::Unspent, &OutPoint::new(t.txid, 0).to_key())?);
        Ok::<_, LedgerError>(())
    })
    .unwrap();
    assert_eq!(balance(&db, &ledger, 1, 7), 30);
    assert_eq!(balance(&db, &ledger, 0, 7), 35);

    // Rolling back the new block leaves no stray unspent entry behind.
    update(&db, |tx| ledger.rollback_one_block(tx, 4));
    let credits = unspent(&db, &ledger);
    assert!(credits.iter().all(|c| c.block.is_none()));
    assert_eq!(balance(&db, &ledger, 0, 7), 35);
}

#[test]
fn mined_insert_rejects_conflicting_block_hash() {
    let (db, _, ledger) = setup();
    let cb = rec(coinbase(2, script(1), 50));
    update(&db, |tx| ledger.insert_transaction(tx, &cb, Some(&meta(2))));
    let other = rec(coinbase(3, script(1), 50));
    let fork = BlockMeta::new(2, Hash256([0xEE; 32]), 0);
    let err = db.update(|tx| ledger.insert_transaction(tx, &other, Some(&fork))).unwrap_err();
    assert!(err.is_input());
}

#[test]
fn mined_spend_removes_double_spend_and_dependents() {
    let (db, _, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let op = OutPoint::new(cb.txid, 0);

    let a = rec(spend(&[op], vec![(script(1), 90)]));
    let child = rec(spend(&[OutPoint::new(a.txid, 0)], vec![(script(1), 80)]));
    let b = rec(spend(&[op], vec![(script(3), 95)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &a, None)?;
        ledger.add_credit(tx, &a, None, 0, false)?;
        ledger.insert_transaction(tx, &child, None)?;
        ledger.add_credit(tx, &child, None, 0, false)
    });
    assert_eq!(db.view(|r| ledger.unmined_transactions(r)).unwrap().len(), 2);

    update(&db, |tx| ledger.insert_transaction(tx, &b, Some(&meta(5))));
    assert!(db.view(|r| ledger.unmined_transactions(r)).unwrap().is_empty());
    assert!(unspent(&db, &ledger).is_empty());
    assert_eq!(balance(&db, &ledger, 0, 200), 0);
}

#[test]
fn remove_unmined_cascades() {
    let (db, _, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let a = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(1), 90)]));
    let child = rec(spend(&[OutPoint::new(a.txid, 0)], vec![(script(1), 80)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &a, None)?;
        ledger.add_credit(tx, &a, None, 0, false)?;
        ledger.insert_transaction(tx, &child, None)?;
        ledger.add_credit(tx, &child, None, 0, false)
    });
    update(&db, |tx| ledger.remove_unmined_transaction(tx, &a));
    assert!(db.view(|r| ledger.unmined_transactions(r)).unwrap().is_empty());
    // The coinbase output is spendable again.
    assert_eq!(balance(&db, &ledger, 1, 200), 100);
}

// --- Rollback ---

#[test]
fn rollback_purges_coinbase_and_its_unmined_spenders() {
    let (db, store, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 4, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(1), 90)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, None)?;
        ledger.add_credit(tx, &t, None, 0, false)
    });

    let delta = update(&db, |tx| ledger.rollback_one_block(tx, 4));
    assert_eq!(delta, -100);
    for bucket in Bucket::HISTORY {
        assert_eq!(store.len(bucket), 0, "{bucket:?} not empty");
    }
}

#[test]
fn rollback_returns_non_coinbase_to_unmined() {
    let (db, _, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(2), 30), (script(1), 70)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, Some(&meta(8)))?;
        ledger.add_credit(tx, &t, Some(&meta(8)), 1, true)
    });
    assert_eq!(balance(&db, &ledger, 1, 8), 70);

    let delta = update(&db, |tx| ledger.rollback_one_block(tx, 8));
    assert_eq!(delta, 100 - 70);

    let credits = unspent(&db, &ledger);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].outpoint, OutPoint::new(t.txid, 1));
    assert_eq!(credits[0].block, None);
    let unmined = db.view(|r| ledger.unmined_transactions(r)).unwrap();
    assert_eq!(unmined, vec![t.clone()]);
    // The coinbase output is spent only by the unmined tx now.
    assert!(db.view(|r| ledger.has_unmined_spender(r, &OutPoint::new(cb.txid, 0))).unwrap());

    // Dropping the unmined tx reports the coinbase output as unspent again.
    update(&db, |tx| ledger.remove_unmined_transaction(tx, &t));
    let credits = unspent(&db, &ledger);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].outpoint, OutPoint::new(cb.txid, 0));
}

#[test]
fn rollback_of_unknown_height_is_noop() {
    let (db, _, ledger) = setup();
    assert_eq!(update(&db, |tx| ledger.rollback_one_block(tx, 42)), 0);
}

#[test]
fn connect_then_rollback_restores_state() {
    let (db, store, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(2), 25), (script(1), 75)]));
    let child = rec(spend(&[OutPoint::new(t.txid, 1)], vec![(script(1), 70)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, None)?;
        ledger.add_credit(tx, &t, None, 1, true)?;
        ledger.insert_transaction(tx, &child, None)?;
        ledger.add_credit(tx, &child, None, 0, false)
    });
    let before = store.snapshot(&Bucket::HISTORY);

    let block = meta(9);
    let cb9 = rec(coinbase(9, script(1), 50));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &cb9, Some(&block))?;
        ledger.add_credit(tx, &cb9, Some(&block), 0, false)?;
        ledger.insert_transaction(tx, &t, Some(&block))?;
        ledger.add_credit(tx, &t, Some(&block), 1, true)?;
        ledger.insert_transaction(tx, &child, Some(&block))?;
        ledger.add_credit(tx, &child, Some(&block), 0, false)
    });
    assert_ne!(store.snapshot(&Bucket::HISTORY), before);

    update(&db, |tx| ledger.rollback_one_block(tx, 9));
    assert_eq!(store.snapshot(&Bucket::HISTORY), before);
}

// --- Queries ---

#[test]
fn immature_coinbase_counts_in_total_only() {
    let (db, _, ledger) = setup();
    mine_coinbase(&db, &ledger, 10, 100);
    let b = db.view(|r| ledger.balances(r, 1, 12)).unwrap();
    assert_eq!(b.spendable, 0);
    assert_eq!(b.immature, 100);
    assert_eq!(b.total(), 100);
    // Regtest maturity is 5 confirmations.
    assert_eq!(balance(&db, &ledger, 1, 14), 100);
}

#[test]
fn balance_respects_min_conf() {
    let (db, _, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(1), 90)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, Some(&meta(20)))?;
        ledger.add_credit(tx, &t, Some(&meta(20)), 0, false)
    });
    assert_eq!(balance(&db, &ledger, 1, 20), 90);
    assert_eq!(balance(&db, &ledger, 3, 21), 0);
    assert_eq!(balance(&db, &ledger, 3, 22), 90);
    // Output above the tip has zero confirmations.
    assert_eq!(balance(&db, &ledger, 1, 19), 0);
}

#[test]
fn unspent_iteration_resumes_from_continuation() {
    let (db, _, ledger) = setup();
    for h in 1..=5 {
        mine_coinbase(&db, &ledger, h, h as u64);
    }
    let t = rec(spend(&[OutPoint::new(Hash256([7; 32]), 0)], vec![(script(1), 6), (script(1), 7)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, None)?;
        ledger.add_credit(tx, &t, None, 0, false)?;
        ledger.add_credit(tx, &t, None, 1, false)
    });

    let mut seen = Vec::new();
    let mut start = Vec::new();
    loop {
        let mut taken = 0;
        let next = db
            .view(|r| {
                ledger.for_each_unspent_output(r, &start, &mut |c: &Credit| {
                    seen.push(c.amount);
                    taken += 1;
                    if taken == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
                })
            })
            .unwrap();
        match next {
            Some(key) => start = key,
            None => break,
        }
    }
    seen.sort();
    assert_eq!(seen, vec![1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn bad_continuation_key_is_input_error() {
    let (db, _, ledger) = setup();
    let err = db
        .view(|r| ledger.for_each_unspent_output(r, &[9], &mut |_: &Credit| ControlFlow::Continue(())))
        .unwrap_err();
    assert!(err.is_input());
}

#[test]
fn tx_details_for_mined_and_unmined() {
    let (db, _, ledger) = setup();
    let cb = mine_coinbase(&db, &ledger, 1, 100);
    let t = rec(spend(&[OutPoint::new(cb.txid, 0)], vec![(script(2), 30), (script(1), 60)]));
    update(&db, |tx| {
        ledger.insert_transaction(tx, &t, None)?;
        ledger.add_credit(tx, &t, None, 1, true)
    });
    let d = db.view(|r| ledger.tx_details(r, &t.txid)).unwrap().unwrap();
    assert_eq!(d.block, None);
    assert_eq!(d.debits.len(), 1);
    assert_eq!(d.net(), -40);

    update(&db, |tx| ledger.insert_transaction(tx, &t, Some(&meta(3))));
    let d = db.view(|r| ledger.tx_details(r, &t.txid)).unwrap().unwrap();
    assert_eq!(d.block, Some(meta(3)));
    assert_eq!(d.net(), -40);
    assert!(db.view(|r| ledger.tx_details(r, &Hash256([0xAB; 32]))).unwrap().is_none());
}

#[test]
fn unmined_transactions_parent_first() {
    let (db, _, ledger) = setup();
    let parent = rec(spend(&[OutPoint::new(Hash256([1; 32]), 0)], vec![(script(1), 10)]));
    let child = rec(spend(&[OutPoint::new(parent.txid, 0)], vec![(script(1), 9)]));
    let grandchild = rec(spend(&[OutPoint::new(child.txid, 0)], vec![(script(1), 8)]));
    update(&db, |tx| {
        // Insert out of order; the listing must still be parent-first.
        ledger.insert_transaction(tx, &grandchild, None)?;
        ledger.insert_transaction(tx, &child, None)?;
        ledger.insert_transaction(tx, &parent, None)
    });
    let ids: Vec<_> = db
        .view(|r| ledger.unmined_transactions(r))
        .unwrap()
        .into_iter()
        .map(|r| r.txid)
        .collect();
    assert_eq!(ids, vec![parent.txid, child.txid, grandchild.txid]);
}

#[test]
fn drop_history_keeps_sync_tip() {
    let (db, store, ledger) = setup();
    mine_coinbase(&db, &ledger, 1, 100);
    update(&db, |tx| ledger.set_sync_tip(tx, &meta(1)));
    update(&db, |tx| ledger.drop_transaction_history(tx));
    for bucket in Bucket::HISTORY {
        assert_eq!(store.len(bucket), 0);
    }
    assert_eq!(db.view(|r| ledger.sync_tip(r)).unwrap(), Some(meta(1)));
}

#[test]
fn rocks_backed_ledger_persists() {
    let dir = tempfile::TempDir::new().unwrap();
    let ledger = Ledger::new(ChainParams::regtest());
    let cb_txid = {
        let db = Database::new(Arc::new(RocksStore::open(dir.path()).unwrap()));
        mine_coinbase(&db, &ledger, 1, 100).txid
    };
    let db = Database::new(Arc::new(RocksStore::open(dir.path()).unwrap()));
    let credits = unspent(&db, &ledger);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].outpoint.txid, cb_txid);
    assert!(db.view(|r| r.contains(Bucket::Blocks, &1u32.to_be_bytes())).unwrap());
}
