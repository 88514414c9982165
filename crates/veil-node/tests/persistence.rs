//! Restart with sled-backed chain and wallet stores.

mod common;

use std::path::Path;

use common::{config, connect, mine, shield};
use veil_core::{Amount, Anchor, Nullifier};
use veil_node::{Engine, WalletId};
use veil_wallet::{BalanceQuery, Memo, PaymentAddress, ReceivedNote, Recipient, Wallet};

fn open(dir: &Path) -> (Engine, WalletId) {
    let engine = Engine::open(config(), &dir.join("chain")).unwrap();
    let wallet = Wallet::open(&dir.join("wallet"), engine.config().witness_cache_size()).unwrap();
    let id = engine.attach_wallet(wallet).unwrap();
    (engine, id)
}

type Snapshot = (Option<u64>, Anchor, Amount, Vec<ReceivedNote>, bool, i64);

fn snapshot(engine: &Engine, id: WalletId, a: &PaymentAddress, nf: &Nullifier) -> Snapshot {
    (
        engine.tip_height(),
        engine.get_anchor(),
        engine.get_balance(id, &BalanceQuery::default()).unwrap(),
        engine.list_received(id, a, 1).unwrap(),
        engine.contains_nullifier(nf),
        engine.shielded_supply().atoms(),
    )
}

#[test]
fn restart_answers_queries_identically() {
    let dir = tempfile::tempdir().unwrap();
    let (before, a, nf) = {
        let (engine, id) = open(dir.path());
        let a = engine.new_address(id).unwrap();
        connect(&engine, vec![shield(&a, 5_000)]);
        connect(&engine, vec![]);
        let tx = engine
            .create_spend(
                id,
                &a,
                &[Recipient {
                    address: a,
                    value: Amount::from_atoms(1_234),
                    memo: Memo::from_bytes(b"to self").unwrap(),
                }],
                Amount::from_atoms(10),
            )
            .unwrap();
        let nf = tx.spends[0].nullifier;
        engine.submit(tx).unwrap();
        mine(&engine);
        connect(&engine, vec![shield(&a, 1)]);
        let snap = snapshot(&engine, id, &a, &nf);
        engine.shutdown().unwrap();
        (snap, a, nf)
    };

    let (engine, id) = open(dir.path());
    assert_eq!(snapshot(&engine, id, &a, &nf), before);
    assert_eq!(before.0, Some(4));
    assert!(before.4);

    // The reopened wallet can still follow reorgs with its restored witnesses.
    engine.disconnect_tip().unwrap();
    engine.disconnect_tip().unwrap();
    assert!(!engine.contains_nullifier(&nf));
    assert_eq!(
        engine.get_balance(id, &BalanceQuery::default()).unwrap(),
        Amount::from_atoms(5_000)
    );
}

#[test]
fn wallet_behind_the_chain_catches_up_on_attach() {
    let dir = tempfile::tempdir().unwrap();
    let a = {
        let (engine, id) = open(dir.path());
        let a = engine.new_address(id).unwrap();
        connect(&engine, vec![shield(&a, 70)]);
        engine.shutdown().unwrap();
        a
    };
    {
        // Blocks arrive while the wallet is not attached.
        let engine = Engine::open(config(), &dir.path().join("chain")).unwrap();
        connect(&engine, vec![shield(&a, 30)]);
        connect(&engine, vec![]);
        engine.shutdown().unwrap();
    }
    let (engine, id) = open(dir.path());
    assert_eq!(
        engine.get_balance(id, &BalanceQuery::default()).unwrap(),
        Amount::from_atoms(100)
    );
    let received = engine.list_received(id, &a, 1).unwrap();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].confirmations, 3);
}
