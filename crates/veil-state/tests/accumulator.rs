//! Accumulator and chain-state properties over varied commitment sequences.

use veil_core::{hash32, Commitment, Nullifier, SignedAmount};
use veil_state::{ChainState, CommitmentTree, IncrementalWitness, StateError};

/// Small deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn cm(seed: u64, i: u64) -> Commitment {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&seed.to_le_bytes());
    bytes[8..].copy_from_slice(&i.to_le_bytes());
    Commitment(hash32(b"acc-test", &bytes).0)
}

#[test]
fn append_truncate_append_reproduces_root() {
    for seed in 0..24u64 {
        let mut rng = Lcg(seed);
        let mut tree = CommitmentTree::with_max_checkpoints(4);
        let prefix = rng.next() % 50;
        for i in 0..prefix {
            tree.append(cm(seed, i)).unwrap();
            if rng.next() % 4 == 0 {
                tree.checkpoint();
            }
        }
        let before = tree.root();
        let start = tree.size();

        let n = 1 + rng.next() % 70;
        let batch: Vec<_> = (0..n).map(|i| cm(seed, 1_000 + i)).collect();
        for c in &batch {
            tree.append(*c).unwrap();
        }
        let a = tree.root();

        tree.truncate(start).unwrap();
        assert_eq!(tree.root(), before, "seed {seed}");
        for c in &batch {
            tree.append(*c).unwrap();
        }
        assert_eq!(tree.root(), a, "seed {seed}");
    }
}

#[test]
fn reorg_releases_nullifiers() {
    let mut st = ChainState::new();
    st.on_block_connected(1, &[cm(0, 0)], &[], SignedAmount::from_atoms(1_000))
        .unwrap();

    let n = Nullifier([42; 32]);
    st.on_block_connected(2, &[cm(0, 1)], &[n], SignedAmount::from_atoms(-400))
        .unwrap();
    assert!(st.contains_nullifier(&n));

    st.on_block_disconnected(2).unwrap();
    assert!(!st.contains_nullifier(&n));

    // The same spend is admissible again.
    st.claim_nullifiers(hash32(b"tx", b"x"), &[n]).unwrap();
    st.on_block_connected(2, &[cm(0, 1)], &[n], SignedAmount::from_atoms(-400))
        .unwrap();
    assert!(st.nullifiers().is_committed(&n));
    assert_eq!(
        st.on_block_connected(3, &[], &[n], SignedAmount::zero()),
        Err(StateError::DoubleSpend(n))
    );
}

#[test]
fn reconnect_reproduces_anchor_and_supply() {
    let mut st = ChainState::new();
    for h in 1..=10u64 {
        let cms: Vec<_> = (0..h % 3).map(|i| cm(h, i)).collect();
        st.on_block_connected(h, &cms, &[], SignedAmount::from_atoms(7 * h as i64))
            .unwrap();
    }
    let anchor = st.root();
    let supply = st.supply();

    st.on_block_disconnected(10).unwrap();
    assert!(!st.is_valid_anchor(&anchor));
    let cms: Vec<_> = (0..10 % 3).map(|i| cm(10, i)).collect();
    st.on_block_connected(10, &cms, &[], SignedAmount::from_atoms(70))
        .unwrap();
    assert_eq!(st.root(), anchor);
    assert_eq!(st.supply(), supply);
}

#[test]
fn witness_moves_forward_across_blocks() {
    let mut st = ChainState::new();
    st.on_block_connected(1, &[cm(1, 0), cm(1, 1)], &[], SignedAmount::zero())
        .unwrap();

    let mine = cm(2, 0);
    let mut w = IncrementalWitness::from_frontier(st.tree().frontier(), mine);
    st.on_block_connected(2, &[mine, cm(2, 1)], &[], SignedAmount::zero())
        .unwrap();
    w.append(&cm(2, 1)).unwrap();
    let a2 = st.root();
    assert_eq!(w.root(), a2);

    for h in 3..8u64 {
        let cms: Vec<_> = (0..h).map(|i| cm(h, i)).collect();
        st.on_block_connected(h, &cms, &[], SignedAmount::zero()).unwrap();
        for c in &cms {
            w.append(c).unwrap();
        }
        assert_eq!(w.root(), st.root());
        assert!(st.is_valid_anchor(&a2));
    }
}
