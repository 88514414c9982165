//! Wallet behaviour against a locally driven chain.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;

use veil_core::{Amount, Block, BlockHeader, Hash32, Transaction, PROTOCOL_VERSION};
use veil_state::{ChainState, Frontier, StateError};
use veil_wallet::{
    build_shielding_tx, BalanceQuery, BlockSource, Memo, PaymentAddress, Recipient, Wallet,
    WalletError, WalletKey,
};

const CACHE: u32 = 11;

#[derive(Default)]
struct TestChain {
    state: ChainState,
    blocks: BTreeMap<u64, Block>,
}

impl TestChain {
    fn connect(&mut self, txs: Vec<Transaction>, wallets: &mut [&mut Wallet]) -> u64 {
        let height = self.state.next_height().unwrap_or(1);
        let cms: Vec<_> = txs.iter().flat_map(|t| t.commitments().copied()).collect();
        let block = Block {
            header: BlockHeader {
                version: PROTOCOL_VERSION,
                prev: Hash32::zero(),
                commitment_root: self.state.preview_root(&cms).unwrap(),
                timestamp: height,
            },
            txs,
        };
        let frontier = self.state.tree().frontier().clone();
        self.state
            .on_block_connected(
                height,
                &block.commitments(),
                &block.nullifiers(),
                block.net_value_delta().unwrap(),
            )
            .unwrap();
        for w in wallets.iter_mut() {
            w.block_connected(height, &block, &frontier).unwrap();
        }
        self.blocks.insert(height, block);
        height
    }

    fn disconnect(&mut self, wallets: &mut [&mut Wallet]) {
        let height = self.state.tip_height().unwrap();
        let d = self.state.on_block_disconnected(height).unwrap();
        self.blocks.remove(&height);
        for w in wallets.iter_mut() {
            w.block_disconnected(height, d.undo.tree_size_before).unwrap();
        }
    }
}

impl BlockSource for TestChain {
    fn tip_height(&self) -> Option<u64> {
        self.state.tip_height()
    }

    fn block_at(&self, height: u64) -> Option<Block> {
        self.blocks.get(&height).cloned()
    }

    fn frontier_before(&self, height: u64) -> Result<Frontier, StateError> {
        self.state.frontier_before(height)
    }
}

fn shield(to: &PaymentAddress, atoms: u64, memo: &str) -> Transaction {
    build_shielding_tx(
        to,
        Amount::from_atoms(atoms),
        Memo::from_bytes(memo.as_bytes()).unwrap(),
    )
    .unwrap()
}

fn balance(w: &Wallet, addr: &PaymentAddress) -> u64 {
    w.get_balance(&BalanceQuery {
        address: Some(*addr),
        min_confirmations: 1,
        include_watch_only: true,
    })
    .atoms()
}

#[test]
fn receives_and_confirms_notes() {
    let mut chain = TestChain::default();
    let mut w = Wallet::new(CACHE);
    let addr = w.new_address().unwrap();
    let stranger = Wallet::new(CACHE).new_address().unwrap();

    chain.connect(
        vec![shield(&stranger, 5, ""), shield(&addr, 700, "hello")],
        &mut [&mut w],
    );
    chain.connect(vec![], &mut [&mut w]);

    assert_eq!(balance(&w, &addr), 700);
    let received = w.list_received(&addr, 1);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].confirmations, 2);
    assert_eq!(received[0].memo.to_text().as_deref(), Some("hello"));
    assert!(!received[0].spent);
    assert!(w.list_received(&addr, 3).is_empty());
}

#[test]
fn spend_marks_note_and_returns_change() {
    let mut chain = TestChain::default();
    let mut alice = Wallet::new(CACHE);
    let mut bob = Wallet::new(CACHE);
    let a = alice.new_address().unwrap();
    let b = bob.new_address().unwrap();

    chain.connect(vec![shield(&a, 1_000, "")], &mut [&mut alice, &mut bob]);
    let anchor = chain.state.root();
    let tx = alice
        .create_spend(
            &a,
            &[Recipient {
                address: b,
                value: Amount::from_atoms(300),
                memo: Memo::from_bytes(b"rent").unwrap(),
            }],
            Amount::from_atoms(10),
            anchor,
        )
        .unwrap();
    assert_eq!(tx.value_balance.atoms(), 10);

    // Reserved notes are not selected twice.
    let again = alice.create_spend(&a, &[], Amount::from_atoms(1), anchor);
    assert!(matches!(again, Err(WalletError::InsufficientFunds { .. })));

    chain.connect(vec![tx], &mut [&mut alice, &mut bob]);
    assert_eq!(balance(&alice, &a), 690);
    assert_eq!(balance(&bob, &b), 300);
    let notes = alice.list_received(&a, 1);
    assert_eq!(notes.len(), 2);
    assert!(notes[0].spent);
    assert!(notes[1].change);
    assert!(!bob.list_received(&b, 1)[0].change);

    // Undo the spend: the original note is unspent again, change is gone.
    chain.disconnect(&mut [&mut alice, &mut bob]);
    assert_eq!(balance(&alice, &a), 1_000);
    assert_eq!(balance(&bob, &b), 0);
}

#[test]
fn spending_needs_a_current_witness() {
    let mut chain = TestChain::default();
    let mut w = Wallet::new(CACHE);
    let a = w.new_address().unwrap();
    chain.connect(vec![shield(&a, 50, "")], &mut [&mut w]);
    let old_anchor = chain.state.root();
    chain.connect(vec![shield(&a, 1, "")], &mut [&mut w]);

    let err = w
        .create_spend(&a, &[], Amount::from_atoms(40), old_anchor)
        .unwrap_err();
    assert!(matches!(err, WalletError::NoWitness(_)));
    assert!(w
        .create_spend(&a, &[], Amount::from_atoms(40), chain.state.root())
        .is_ok());
}

#[test]
fn view_only_wallet_cannot_spend() {
    let mut chain = TestChain::default();
    let mut owner = Wallet::new(CACHE);
    let a = owner.new_address().unwrap();
    chain.connect(vec![shield(&a, 80, "")], &mut [&mut owner]);

    let view = match WalletKey::import(&owner.export_key(&a).unwrap()).unwrap() {
        WalletKey::SpendCapable(sk) => WalletKey::ViewOnly(sk.full_viewing_key()),
        other => other,
    };
    let mut watcher = Wallet::new(CACHE);
    let never = AtomicBool::new(false);
    watcher.import_key(view, Some(0), &chain, &never).unwrap();

    assert_eq!(balance(&watcher, &a), 80);
    assert_eq!(watcher.get_balance(&BalanceQuery::default()).atoms(), 0);
    let err = watcher
        .create_spend(&a, &[], Amount::from_atoms(1), chain.state.root())
        .unwrap_err();
    assert!(matches!(err, WalletError::KeyNotSpendCapable));
}

#[test]
fn importing_the_same_key_twice_is_idempotent() {
    let mut chain = TestChain::default();
    let mut owner = Wallet::new(CACHE);
    let a = owner.new_address().unwrap();
    for i in 0..5u64 {
        chain.connect(vec![shield(&a, 100 + i, "")], &mut [&mut owner]);
    }
    let exported = owner.export_key(&a).unwrap();

    let mut w = Wallet::new(CACHE);
    let never = AtomicBool::new(false);
    w.import_key(WalletKey::import(&exported).unwrap(), Some(0), &chain, &never)
        .unwrap();
    let first_balance = balance(&w, &a);
    let first_list = w.list_received(&a, 1);
    let first_witness = w.witness(0, &chain.state.root()).unwrap().clone();

    w.import_key(WalletKey::import(&exported).unwrap(), Some(0), &chain, &never)
        .unwrap();
    assert_eq!(balance(&w, &a), first_balance);
    assert_eq!(first_balance, 100 + 101 + 102 + 103 + 104);
    assert_eq!(w.list_received(&a, 1), first_list);
    assert_eq!(w.witness(0, &chain.state.root()).unwrap(), &first_witness);

    // Imported witnesses keep following the chain.
    chain.connect(vec![shield(&a, 1, "")], &mut [&mut w]);
    assert!(w.witness(0, &chain.state.root()).is_ok());
}

#[test]
fn interrupted_rescan_leaves_wallet_untouched() {
    let mut chain = TestChain::default();
    let mut owner = Wallet::new(CACHE);
    let a = owner.new_address().unwrap();
    chain.connect(vec![shield(&a, 9, "")], &mut [&mut owner]);

    let mut w = Wallet::new(CACHE);
    let cancelled = AtomicBool::new(true);
    let key = WalletKey::import(&owner.export_key(&a).unwrap()).unwrap();
    let err = w.import_key(key, Some(0), &chain, &cancelled).unwrap_err();
    assert!(matches!(err, WalletError::RescanInterrupted));
    assert!(w.addresses().is_empty());
    assert_eq!(balance(&w, &a), 0);
}

#[test]
fn deep_disconnect_requires_rescan() {
    let mut chain = TestChain::default();
    let mut w = Wallet::new(2);
    let a = w.new_address().unwrap();
    chain.connect(vec![shield(&a, 5, "")], &mut [&mut w]);
    for _ in 0..4 {
        chain.connect(vec![shield(&a, 1, "")], &mut [&mut w]);
    }
    for _ in 0..3 {
        chain.disconnect(&mut [&mut w]);
    }
    // The first note survived but its witness cache did not reach back.
    assert!(matches!(
        w.witness(0, &chain.state.root()),
        Err(WalletError::NoWitness(0))
    ));
    assert_eq!(balance(&w, &a), 0);
    assert_eq!(w.list_received(&a, 1).len(), 2);

    let never = AtomicBool::new(false);
    w.rescan(1, &chain, &never).unwrap();
    assert!(w.witness(0, &chain.state.root()).is_ok());
    assert_eq!(balance(&w, &a), 6);
}

#[test]
fn unsynced_wallet_refuses_a_later_block() {
    let mut chain = TestChain::default();
    let mut owner = Wallet::new(CACHE);
    let a = owner.new_address().unwrap();
    chain.connect(vec![shield(&a, 3, "")], &mut [&mut owner]);
    let height = chain.connect(vec![shield(&a, 4, "")], &mut [&mut owner]);

    let mut late = Wallet::new(CACHE);
    late.new_address().unwrap();
    let frontier = chain.state.frontier_before(height).unwrap();
    let err = late
        .block_connected(height, &chain.blocks[&height], &frontier)
        .unwrap_err();
    assert!(matches!(
        err,
        WalletError::State(StateError::StructuralCorruption(_))
    ));
    assert_eq!(late.scanned_height(), None);
}

#[test]
fn wallet_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let mut chain = TestChain::default();
    let addr;
    let before;
    {
        let mut w = Wallet::open(dir.path(), CACHE).unwrap();
        addr = w.new_address().unwrap();
        chain.connect(vec![shield(&addr, 321, "kept")], &mut [&mut w]);
        w.flush().unwrap();
        before = w.list_received(&addr, 1);
    }
    let w = Wallet::open(dir.path(), CACHE).unwrap();
    assert_eq!(w.list_received(&addr, 1), before);
    assert_eq!(w.scanned_height(), Some(1));
    assert!(w.witness(0, &chain.state.root()).is_ok());
    assert_eq!(w.default_address(), Some(addr));
}
