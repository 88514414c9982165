//! Racing submissions and readers running alongside block connects.

mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Barrier;
use std::thread;

use common::{config, connect, shield, wallet};
use veil_core::Amount;
use veil_node::{Engine, SubmitError};
use veil_wallet::{Memo, Recipient, WalletKey};

#[test]
fn racing_double_spends_admit_exactly_one() {
    let engine = Engine::new(config());
    let (alice, a) = wallet(&engine);
    let (twin, _) = wallet(&engine);
    let (_, b) = wallet(&engine);
    connect(&engine, vec![shield(&a, 500)]);

    // A second wallet holding the same spending key can spend the same note.
    let key = WalletKey::import(&engine.export_key(alice, &a).unwrap()).unwrap();
    engine
        .import_key(twin, key, Some(1), &AtomicBool::new(false))
        .unwrap();

    let pay = |value: u64| Recipient {
        address: b,
        value: Amount::from_atoms(value),
        memo: Memo::empty(),
    };
    let tx1 = engine
        .create_spend(alice, &a, &[pay(100)], Amount::from_atoms(1))
        .unwrap();
    let tx2 = engine
        .create_spend(twin, &a, &[pay(200)], Amount::from_atoms(1))
        .unwrap();
    assert_eq!(tx1.spends[0].nullifier, tx2.spends[0].nullifier);
    assert_ne!(tx1, tx2);
    let nf = tx1.spends[0].nullifier;

    let barrier = Barrier::new(2);
    let results: Vec<Result<_, SubmitError>> = thread::scope(|s| {
        let handles: Vec<_> = [tx1, tx2]
            .into_iter()
            .map(|tx| {
                let engine = &engine;
                let barrier = &barrier;
                s.spawn(move || {
                    barrier.wait();
                    engine.submit(tx)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(admitted, 1);
    assert!(results
        .iter()
        .any(|r| *r == Err(SubmitError::DoubleSpend(nf))));
    assert_eq!(engine.pending_txids().len(), 1);
    assert!(engine.contains_nullifier(&nf));
}

#[test]
fn readers_never_see_a_half_applied_block() {
    let engine = Engine::new(config());
    let (id, a) = wallet(&engine);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for i in 1..=40u64 {
                connect(&engine, vec![shield(&a, i)]);
            }
            done.store(true, std::sync::atomic::Ordering::SeqCst);
        });
        for _ in 0..3 {
            s.spawn(|| {
                let mut last_supply = 0i64;
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    let anchor = engine.get_anchor();
                    assert!(engine.is_valid_anchor(&anchor));
                    let supply = engine.shielded_supply().atoms();
                    assert!(supply >= last_supply);
                    last_supply = supply;
                    let balance = engine
                        .get_balance(id, &veil_wallet::BalanceQuery::default())
                        .unwrap();
                    assert!(balance.atoms() <= 820);
                }
            });
        }
    });

    assert_eq!(engine.tip_height(), Some(40));
    assert_eq!(engine.shielded_supply().atoms(), 820);
}
