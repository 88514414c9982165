// Consensus-critical. Changes require a protocol version bump + tests.
//! Incremental witnesses.
//!
//! A witness for the leaf at position `p` needs one sibling per level:
//! - where bit `h` of `p` is 1 the sibling is a complete subtree to the left,
//!   fixed forever once the leaf exists
//! - where bit `h` of `p` is 0 the sibling lies to the right and fills in as
//!   later commitments arrive
//!
//! The right siblings cover consecutive leaf ranges starting at `p + 1`, so
//! they are completed strictly in ascending level order. We keep the completed
//! ones plus a single partial frontier for the one being built.

use borsh::{BorshDeserialize, BorshSerialize};
use veil_core::{Anchor, Commitment, Hash32, TREE_DEPTH};

use crate::error::StateError;
use crate::merkle::{empty_at, leaf_hash, Frontier, MerklePath};

/// Authentication path for one leaf that can be advanced as the tree grows.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct IncrementalWitness {
    position: u64,
    leaf: Commitment,
    left: Vec<Option<Hash32>>,
    filled: Vec<Hash32>,
    cursor: Option<Frontier>,
    appended: u64,
}

impl IncrementalWitness {
    /// Start witnessing `leaf`, which is appended right after `before`.
    ///
    /// `before` is the frontier of the tree *before* the leaf is appended.
    pub fn from_frontier(before: &Frontier, leaf: Commitment) -> Self {
        let position = before.size();
        let left = (0..TREE_DEPTH).map(|h| before.filled_at(h)).collect();
        Self {
            position,
            leaf,
            left,
            filled: Vec::new(),
            cursor: None,
            appended: 0,
        }
    }

    /// Position of the witnessed leaf.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The witnessed commitment.
    pub fn leaf(&self) -> &Commitment {
        &self.leaf
    }

    /// Size of the tree this witness currently authenticates against.
    pub fn tree_size(&self) -> u64 {
        self.position + 1 + self.appended
    }

    /// Level of the `nth` right sibling (the `nth` zero bit of the position).
    fn right_level(&self, nth: usize) -> Option<usize> {
        (0..TREE_DEPTH)
            .filter(|h| (self.position >> h) & 1 == 0)
            .nth(nth)
    }

    /// Account for one more commitment appended to the tree.
    pub fn append(&mut self, cm: &Commitment) -> Result<(), StateError> {
        let level = self
            .right_level(self.filled.len())
            .ok_or(StateError::TreeFull)?;
        let node = leaf_hash(cm);
        if level == 0 {
            self.filled.push(node);
        } else {
            let cursor = self.cursor.get_or_insert_with(Frontier::new);
            cursor.append_node(node);
            if cursor.size() == 1u64 << level {
                let root = cursor.root_at(level);
                self.filled.push(root);
                self.cursor = None;
            }
        }
        self.appended += 1;
        Ok(())
    }

    /// Current authentication path.
    pub fn path(&self) -> MerklePath {
        let mut siblings = Vec::with_capacity(TREE_DEPTH);
        let mut right = 0usize;
        for height in 0..TREE_DEPTH {
            let sibling = if (self.position >> height) & 1 == 1 {
                self.left
                    .get(height)
                    .copied()
                    .flatten()
                    .unwrap_or_else(|| empty_at(height))
            } else {
                let node = match self.filled.get(right) {
                    Some(node) => *node,
                    None if right == self.filled.len() => self
                        .cursor
                        .as_ref()
                        .map(|c| c.root_at(height))
                        .unwrap_or_else(|| empty_at(height)),
                    None => empty_at(height),
                };
                right += 1;
                node
            };
            siblings.push(sibling);
        }
        MerklePath {
            position: self.position,
            siblings,
        }
    }

    /// Root this witness authenticates against.
    pub fn root(&self) -> Anchor {
        self.path().root(&self.leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::CommitmentTree;
    use veil_core::hash32;

    fn cm(i: u64) -> Commitment {
        Commitment(hash32(b"witness-cm", &i.to_le_bytes()).0)
    }

    #[test]
    fn witness_tracks_tree_root_for_every_position() {
        for pos in 0..20u64 {
            let mut tree = CommitmentTree::new();
            for i in 0..pos {
                tree.append(cm(i)).unwrap();
            }
            let mut w = IncrementalWitness::from_frontier(tree.frontier(), cm(pos));
            tree.append(cm(pos)).unwrap();
            assert_eq!(w.root(), tree.root());
            for i in pos + 1..pos + 40 {
                tree.append(cm(i)).unwrap();
                w.append(&cm(i)).unwrap();
                assert_eq!(w.root(), tree.root(), "pos {pos} size {}", tree.size());
                assert_eq!(w.tree_size(), tree.size());
                assert_eq!(w.path(), tree.path(pos).unwrap());
            }
        }
    }

    #[test]
    fn witness_survives_borsh() {
        let mut tree = CommitmentTree::new();
        tree.append(cm(0)).unwrap();
        let mut w = IncrementalWitness::from_frontier(tree.frontier(), cm(1));
        tree.append(cm(1)).unwrap();
        for i in 2..7 {
            tree.append(cm(i)).unwrap();
            w.append(&cm(i)).unwrap();
        }
        let bytes = borsh::to_vec(&w).unwrap();
        let back = IncrementalWitness::try_from_slice(&bytes).unwrap();
        assert_eq!(back.root(), tree.root());
    }
}
