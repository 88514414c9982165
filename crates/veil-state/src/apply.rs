//! Block connect/disconnect against the shielded chain state.
//!
//! `ChainState` owns the four chain singletons and applies a block to all of
//! them as one step, in a fixed order:
//! append commitments, record anchor, commit nullifiers, apply supply delta.
//! Disconnect undoes the same steps in reverse from a recorded `BlockUndo`.
//!
//! Every check that can reject a block runs before the first mutation, so a
//! rejected block leaves the state exactly as it was.

use std::collections::BTreeMap;

use borsh::{BorshDeserialize, BorshSerialize};
use hashbrown::HashSet;
use tracing::{debug, info};
use veil_core::{Anchor, Commitment, Nullifier, SignedAmount, TxId, DEFAULT_MAX_REORG_DEPTH};

use crate::anchors::AnchorHistory;
use crate::error::StateError;
use crate::merkle::{CommitmentTree, Frontier, TREE_CAPACITY};
use crate::nullifier::NullifierSet;
use crate::supply::SupplyLedger;

/// What a connected block changed, kept so the block can be disconnected.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct BlockUndo {
    /// Height of the block.
    pub height: u64,
    /// Tree size before the block's commitments were appended.
    pub tree_size_before: u64,
    /// Tree size after the block.
    pub tree_size_after: u64,
    /// Nullifiers the block committed.
    pub nullifiers: Vec<Nullifier>,
    /// Net value the block moved into the pool.
    pub net_value_delta: SignedAmount,
    /// Root after the block.
    pub anchor: Anchor,
}

/// Summary of a disconnect, for downstream consumers (mempool, wallets).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DisconnectedBlock {
    /// Undo record that was applied.
    pub undo: BlockUndo,
    /// Root of the new tip.
    pub tip_anchor: Anchor,
    /// Whether the disconnected block's anchor is still produced by another connected block.
    pub anchor_still_valid: bool,
}

/// Shielded chain state: accumulator, nullifiers, anchors and supply.
#[derive(Clone, Debug)]
pub struct ChainState {
    tree: CommitmentTree,
    nullifiers: NullifierSet,
    anchors: AnchorHistory,
    supply: SupplyLedger,
    undo: BTreeMap<u64, BlockUndo>,
}

impl ChainState {
    /// Empty state (genesis) with the default reorg depth.
    pub fn new() -> Self {
        Self::with_max_reorg_depth(DEFAULT_MAX_REORG_DEPTH)
    }

    /// Empty state keeping accumulator checkpoints for `depth` blocks.
    pub fn with_max_reorg_depth(depth: u32) -> Self {
        Self {
            tree: CommitmentTree::with_max_checkpoints(depth as usize + 1),
            nullifiers: NullifierSet::new(),
            anchors: AnchorHistory::new(),
            supply: SupplyLedger::new(),
            undo: BTreeMap::new(),
        }
    }

    /// Height of the last connected block, if any.
    pub fn tip_height(&self) -> Option<u64> {
        self.undo.last_key_value().map(|(h, _)| *h)
    }

    /// Height the next connected block must have, if constrained.
    pub fn next_height(&self) -> Option<u64> {
        self.tip_height().map(|h| h + 1)
    }

    /// Current commitment root (the tip anchor).
    pub fn root(&self) -> Anchor {
        self.tree.root()
    }

    /// Whether `anchor` is the root of a block on the current chain.
    pub fn is_valid_anchor(&self, anchor: &Anchor) -> bool {
        self.anchors.is_valid(anchor)
    }

    /// Anchor recorded at `height`.
    pub fn anchor_at(&self, height: u64) -> Option<Anchor> {
        self.anchors.at(height)
    }

    /// Whether a nullifier is committed or claimed by a pending transaction.
    pub fn contains_nullifier(&self, nf: &Nullifier) -> bool {
        self.nullifiers.contains(nf)
    }

    /// Read access to the nullifier set.
    pub fn nullifiers(&self) -> &NullifierSet {
        &self.nullifiers
    }

    /// Read access to the accumulator.
    pub fn tree(&self) -> &CommitmentTree {
        &self.tree
    }

    /// Net shielded supply.
    pub fn supply(&self) -> SignedAmount {
        self.supply.value()
    }

    /// Undo record of a connected block.
    pub fn undo_at(&self, height: u64) -> Option<&BlockUndo> {
        self.undo.get(&height)
    }

    /// Frontier of the accumulator as of the start of block `height`.
    pub fn frontier_before(&self, height: u64) -> Result<Frontier, StateError> {
        let size = self
            .undo
            .range(height..)
            .next()
            .map_or(self.tree.size(), |(_, undo)| undo.tree_size_before);
        self.tree.frontier_at(size)
    }

    /// Root the accumulator would have after appending `commitments`.
    pub fn preview_root(&self, commitments: &[Commitment]) -> Result<Anchor, StateError> {
        self.tree.preview_root(commitments)
    }

    /// Claim the nullifiers of a mempool transaction (all or nothing).
    pub fn claim_nullifiers(&mut self, txid: TxId, nfs: &[Nullifier]) -> Result<(), StateError> {
        self.nullifiers.insert_provisional(txid, nfs)
    }

    /// Release the provisional claims `txid` holds among `nfs`.
    pub fn release_nullifiers(&mut self, txid: &TxId, nfs: &[Nullifier]) {
        self.nullifiers.release(txid, nfs)
    }

    /// Connect a block.
    ///
    /// `height` must directly follow the tip. Fails without side effects on
    /// double spends, supply underflow and capacity exhaustion.
    pub fn on_block_connected(
        &mut self,
        height: u64,
        commitments: &[Commitment],
        nullifiers: &[Nullifier],
        net_value_delta: SignedAmount,
    ) -> Result<&BlockUndo, StateError> {
        if let Some(expected) = self.next_height() {
            if height != expected {
                return Err(StateError::corruption(format!(
                    "connect at height {height}, expected {expected}"
                )));
            }
        }

        let mut seen = HashSet::with_capacity(nullifiers.len());
        for nf in nullifiers {
            if self.nullifiers.is_committed(nf) || !seen.insert(*nf) {
                return Err(StateError::DoubleSpend(*nf));
            }
        }
        self.supply.preview_apply(net_value_delta)?;
        let tree_size_before = self.tree.size();
        if TREE_CAPACITY - tree_size_before < commitments.len() as u64 {
            return Err(StateError::TreeFull);
        }

        for cm in commitments {
            self.tree.append(*cm)?;
        }
        self.tree.checkpoint();
        let anchor = self.tree.root();
        self.anchors.record(height, anchor)?;
        for nf in nullifiers {
            self.nullifiers.insert_committed(*nf)?;
        }
        self.supply.apply_block(net_value_delta)?;

        info!(
            height,
            %anchor,
            commitments = commitments.len(),
            nullifiers = nullifiers.len(),
            supply = %self.supply.value(),
            "connected block"
        );
        let undo = self.undo.entry(height).or_insert(BlockUndo {
            height,
            tree_size_before,
            tree_size_after: self.tree.size(),
            nullifiers: nullifiers.to_vec(),
            net_value_delta,
            anchor,
        });
        Ok(&*undo)
    }

    /// Disconnect the tip block, which must be at `height`.
    pub fn on_block_disconnected(&mut self, height: u64) -> Result<DisconnectedBlock, StateError> {
        if self.tip_height() != Some(height) {
            return Err(StateError::corruption(format!(
                "disconnect at height {height}, tip is {:?}",
                self.tip_height()
            )));
        }
        let undo = self
            .undo
            .remove(&height)
            .ok_or_else(|| StateError::corruption("missing undo record"))?;

        self.supply.revert_block(undo.net_value_delta)?;
        for nf in undo.nullifiers.iter().rev() {
            self.nullifiers.remove_committed(nf)?;
        }
        let forgotten = self.anchors.forget(height)?;
        if forgotten != undo.anchor {
            return Err(StateError::corruption(format!(
                "anchor history holds {forgotten} at height {height}, undo has {}",
                undo.anchor
            )));
        }
        self.tree.truncate(undo.tree_size_before)?;

        let tip_anchor = self.tree.root();
        if let Some((_, recorded)) = self.anchors.tip() {
            if recorded != tip_anchor {
                return Err(StateError::corruption(format!(
                    "tree root {tip_anchor} disagrees with recorded tip anchor {recorded}"
                )));
            }
        }
        let anchor_still_valid = self.anchors.is_valid(&undo.anchor);
        info!(height, anchor = %undo.anchor, %tip_anchor, "disconnected block");
        debug!(released = undo.nullifiers.len(), "nullifiers released");

        Ok(DisconnectedBlock {
            undo,
            tip_anchor,
            anchor_still_valid,
        })
    }
}

impl Default for ChainState {
    fn default() -> Self {
        Self::new()
    }
}
