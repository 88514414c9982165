// Consensus-critical. Changes require a protocol version bump + tests.
//! Append-only note commitment tree.
//!
//! The tree has a fixed depth of `TREE_DEPTH`. We keep:
//! - the frontier (complete subtree roots along the right edge), for O(log n)
//!   append and root
//! - every leaf, so any past frontier can be replayed
//! - a bounded set of per-block checkpoints, so replays during a reorg start
//!   close to the target instead of at leaf 0
//!
//! Hash function: BLAKE3 with domain separators, empty subtrees hash to a
//! per-height constant.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use veil_core::{hash32, Anchor, Commitment, Hash32, DEFAULT_MAX_REORG_DEPTH, TREE_DEPTH};

use crate::error::StateError;

/// Domain separator for merkle node hashing.
const DS_MERKLE_NODE: &[u8] = b"VEIL::MERKLE_NODE::V0";
/// Domain separator for merkle leaf hashing.
const DS_MERKLE_LEAF: &[u8] = b"VEIL::MERKLE_LEAF::V0";
/// Domain separator for merkle empty hashing.
const DS_MERKLE_EMPTY: &[u8] = b"VEIL::MERKLE_EMPTY::V0";

/// Maximum number of leaves the tree can hold.
pub const TREE_CAPACITY: u64 = 1u64 << TREE_DEPTH;

/// Leaf hash of a commitment: `BLAKE3(DS_MERKLE_LEAF || cm)`.
pub fn leaf_hash(cm: &Commitment) -> Hash32 {
    hash32(DS_MERKLE_LEAF, cm.as_bytes())
}

/// Root of a tree with no leaves.
pub fn empty_root() -> Anchor {
    empty_at(TREE_DEPTH)
}

/// Compute parent hash for two child nodes.
pub(crate) fn parent_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut bytes = [0u8; 64];
    bytes[..32].copy_from_slice(left.as_bytes());
    bytes[32..].copy_from_slice(right.as_bytes());
    hash32(DS_MERKLE_NODE, &bytes)
}

/// Hash of an empty subtree of the given height.
pub(crate) fn empty_at(height: usize) -> Hash32 {
    // Height is included to avoid accidental reuse across levels.
    hash32(DS_MERKLE_EMPTY, &[height as u8])
}

/// Right edge of an append-only tree.
///
/// `filled[h]` holds the root of a complete subtree of height `h` exactly
/// when bit `h` of `size` is set.
#[derive(Clone, Debug, Default, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Frontier {
    size: u64,
    filled: Vec<Option<Hash32>>,
}

impl Frontier {
    /// Create an empty frontier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leaves appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Complete left subtree at `height`, if any.
    pub(crate) fn filled_at(&self, height: usize) -> Option<Hash32> {
        self.filled.get(height).copied().flatten()
    }

    /// Append a commitment.
    pub fn append(&mut self, cm: &Commitment) {
        self.append_node(leaf_hash(cm));
    }

    /// Append an already-hashed leaf node.
    pub(crate) fn append_node(&mut self, leaf: Hash32) {
        let mut node = leaf;
        let mut height = 0usize;
        let mut idx = self.size;

        // While the current index is odd at this height, we have a left sibling
        // stored in the frontier; combine and carry upward.
        while (idx & 1) == 1 {
            let left = self
                .filled
                .get_mut(height)
                .and_then(Option::take)
                .unwrap_or_else(|| empty_at(height));
            node = parent_hash(&left, &node);
            idx >>= 1;
            height += 1;
        }

        if self.filled.len() <= height {
            self.filled.resize(height + 1, None);
        }
        self.filled[height] = Some(node);
        self.size += 1;
    }

    /// Root of the subtree of height `depth` that starts at leaf 0.
    ///
    /// Leaves past `size` are treated as empty. Callers must not have appended
    /// more than `2^depth` leaves.
    pub fn root_at(&self, depth: usize) -> Hash32 {
        let mut node: Option<Hash32> = None;
        for height in 0..depth {
            node = match (self.filled_at(height), node) {
                (Some(left), Some(right)) => Some(parent_hash(&left, &right)),
                (Some(left), None) => Some(parent_hash(&left, &empty_at(height))),
                (None, Some(left)) => Some(parent_hash(&left, &empty_at(height))),
                (None, None) => None,
            };
        }
        node.or_else(|| self.filled_at(depth))
            .unwrap_or_else(|| empty_at(depth))
    }

    /// Root of the full-depth tree.
    pub fn root(&self) -> Anchor {
        self.root_at(TREE_DEPTH)
    }
}

/// Authentication path from a leaf to the root.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct MerklePath {
    /// Leaf position the path belongs to.
    pub position: u64,
    /// Sibling hashes from the leaf level upwards (`TREE_DEPTH` entries).
    pub siblings: Vec<Hash32>,
}

impl MerklePath {
    /// Fold `cm` up the path and return the implied root.
    pub fn root(&self, cm: &Commitment) -> Anchor {
        let mut node = leaf_hash(cm);
        for (height, sibling) in self.siblings.iter().enumerate() {
            node = if (self.position >> height) & 1 == 1 {
                parent_hash(sibling, &node)
            } else {
                parent_hash(&node, sibling)
            };
        }
        node
    }
}

/// The commitment accumulator.
#[derive(Clone, Debug)]
pub struct CommitmentTree {
    frontier: Frontier,
    leaves: Vec<Commitment>,
    /// Frontier snapshots keyed by tree size.
    checkpoints: BTreeMap<u64, Frontier>,
    max_checkpoints: usize,
}

impl CommitmentTree {
    /// Create an empty tree that keeps enough checkpoints for the default reorg depth.
    pub fn new() -> Self {
        Self::with_max_checkpoints(DEFAULT_MAX_REORG_DEPTH as usize + 1)
    }

    /// Create an empty tree retaining at most `max_checkpoints` checkpoints.
    pub fn with_max_checkpoints(max_checkpoints: usize) -> Self {
        Self {
            frontier: Frontier::new(),
            leaves: Vec::new(),
            checkpoints: BTreeMap::new(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    /// Number of leaves in the tree.
    pub fn size(&self) -> u64 {
        self.frontier.size()
    }

    /// Whether the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Current root.
    pub fn root(&self) -> Anchor {
        self.frontier.root()
    }

    /// Current frontier.
    pub fn frontier(&self) -> &Frontier {
        &self.frontier
    }

    /// Commitments from `position` to the end of the tree.
    pub fn leaves_from(&self, position: u64) -> &[Commitment] {
        let start = (position as usize).min(self.leaves.len());
        &self.leaves[start..]
    }

    /// Commitment at `position`, if appended.
    pub fn leaf(&self, position: u64) -> Option<&Commitment> {
        self.leaves.get(position as usize)
    }

    /// Append a commitment and return its position.
    pub fn append(&mut self, cm: Commitment) -> Result<u64, StateError> {
        let position = self.size();
        if position >= TREE_CAPACITY {
            return Err(StateError::TreeFull);
        }
        self.frontier.append(&cm);
        self.leaves.push(cm);
        Ok(position)
    }

    /// Root the tree would have after appending `cms`, without mutating it.
    pub fn preview_root<'a>(
        &self,
        cms: impl IntoIterator<Item = &'a Commitment>,
    ) -> Result<Anchor, StateError> {
        let mut frontier = self.frontier.clone();
        for cm in cms {
            if frontier.size() >= TREE_CAPACITY {
                return Err(StateError::TreeFull);
            }
            frontier.append(cm);
        }
        Ok(frontier.root())
    }

    /// Remember the current frontier so a later truncation back to this size is cheap.
    pub fn checkpoint(&mut self) {
        self.checkpoints.insert(self.size(), self.frontier.clone());
        while self.checkpoints.len() > self.max_checkpoints {
            self.checkpoints.pop_first();
        }
    }

    /// Frontier of the tree as it was when it held `size` leaves.
    pub fn frontier_at(&self, size: u64) -> Result<Frontier, StateError> {
        if size > self.size() {
            return Err(StateError::corruption(format!(
                "frontier requested at size {size}, tree holds {}",
                self.size()
            )));
        }
        if size == self.size() {
            return Ok(self.frontier.clone());
        }
        let (start, mut frontier) = self
            .checkpoints
            .range(..=size)
            .next_back()
            .map(|(s, f)| (*s, f.clone()))
            .unwrap_or_default();
        for cm in &self.leaves[start as usize..size as usize] {
            frontier.append(cm);
        }
        Ok(frontier)
    }

    /// Drop every leaf at or past `position`.
    ///
    /// Afterwards the root equals the root the tree had when it held
    /// `position` leaves.
    pub fn truncate(&mut self, position: u64) -> Result<(), StateError> {
        if position > self.size() {
            return Err(StateError::corruption(format!(
                "truncate to {position} beyond tree size {}",
                self.size()
            )));
        }
        self.frontier = self.frontier_at(position)?;
        self.leaves.truncate(position as usize);
        let _dropped = self.checkpoints.split_off(&(position + 1));
        Ok(())
    }

    /// Authentication path for the leaf at `position`, computed from the leaves.
    pub fn path(&self, position: u64) -> Result<MerklePath, StateError> {
        if position >= self.size() {
            return Err(StateError::corruption(format!(
                "no leaf at position {position}"
            )));
        }
        let siblings = (0..TREE_DEPTH)
            .map(|height| self.subtree_root(height, (position >> height) ^ 1))
            .collect();
        Ok(MerklePath { position, siblings })
    }

    fn subtree_root(&self, height: usize, index: u64) -> Hash32 {
        let start = index << height;
        if start >= self.size() {
            return empty_at(height);
        }
        if height == 0 {
            return leaf_hash(&self.leaves[start as usize]);
        }
        let left = self.subtree_root(height - 1, index << 1);
        let right = self.subtree_root(height - 1, (index << 1) | 1);
        parent_hash(&left, &right)
    }
}

impl Default for CommitmentTree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(i: u64) -> Commitment {
        Commitment(hash32(b"test-cm", &i.to_le_bytes()).0)
    }

    #[test]
    fn empty_tree_root_is_constant() {
        let tree = CommitmentTree::new();
        assert_eq!(tree.root(), empty_root());
        assert_eq!(Frontier::new().root(), empty_root());
    }

    #[test]
    fn root_changes_on_every_append() {
        let mut tree = CommitmentTree::new();
        let mut seen = vec![tree.root()];
        for i in 0..16 {
            tree.append(cm(i)).unwrap();
            assert!(!seen.contains(&tree.root()));
            seen.push(tree.root());
        }
    }

    #[test]
    fn paths_agree_with_frontier_root() {
        let mut tree = CommitmentTree::new();
        for i in 0..23 {
            tree.append(cm(i)).unwrap();
            for pos in 0..=i {
                let path = tree.path(pos).unwrap();
                assert_eq!(path.root(&cm(pos)), tree.root(), "size {} pos {pos}", i + 1);
            }
        }
    }

    #[test]
    fn full_small_subtree_root_is_stored_node() {
        let mut f = Frontier::new();
        for i in 0..4 {
            f.append(&cm(i));
        }
        let expected = parent_hash(
            &parent_hash(&leaf_hash(&cm(0)), &leaf_hash(&cm(1))),
            &parent_hash(&leaf_hash(&cm(2)), &leaf_hash(&cm(3))),
        );
        assert_eq!(f.root_at(2), expected);
    }

    #[test]
    fn truncate_restores_prior_roots() {
        let mut tree = CommitmentTree::with_max_checkpoints(3);
        let mut roots = vec![tree.root()];
        for i in 0..40 {
            tree.append(cm(i)).unwrap();
            if i % 3 == 0 {
                tree.checkpoint();
            }
            roots.push(tree.root());
        }
        for target in [37u64, 30, 12, 1, 0] {
            tree.truncate(target).unwrap();
            assert_eq!(tree.size(), target);
            assert_eq!(tree.root(), roots[target as usize]);
        }
    }

    #[test]
    fn truncate_beyond_size_is_corruption() {
        let mut tree = CommitmentTree::new();
        tree.append(cm(1)).unwrap();
        let err = tree.truncate(5).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn preview_does_not_mutate() {
        let mut tree = CommitmentTree::new();
        tree.append(cm(0)).unwrap();
        let cms = [cm(1), cm(2)];
        let preview = tree.preview_root(cms.iter()).unwrap();
        assert_eq!(tree.size(), 1);
        for c in cms {
            tree.append(c).unwrap();
        }
        assert_eq!(tree.root(), preview);
    }
}
