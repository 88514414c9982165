//! Witness tracker for one wallet note.
//!
//! Keeps the note's witness as of each of the last `capacity` connected
//! blocks, newest last. Connecting a block pushes a snapshot, disconnecting
//! pops back to the new tip. A disconnect deeper than the cache leaves the
//! tracker empty and the note flagged for a rescan; we never guess a path.

use borsh::{BorshDeserialize, BorshSerialize};
use veil_core::{Anchor, Commitment};
use veil_state::{IncrementalWitness, StateError};

/// What a rewind did to a tracked note.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RewindOutcome {
    /// The witness now matches the rewound tree.
    Current,
    /// The note itself was disconnected.
    Orphaned,
    /// The cache did not reach back far enough; rebuild by rescanning.
    NeedsRescan,
}

/// Bounded history of witnesses for one note.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WitnessTracker {
    /// `(height, witness as of the end of that block)`, oldest first.
    cache: Vec<(u64, IncrementalWitness)>,
    capacity: u32,
    position: u64,
}

impl WitnessTracker {
    /// Track a note first witnessed in block `height`.
    pub fn new(witness: IncrementalWitness, height: u64, capacity: u32) -> Self {
        Self {
            position: witness.position(),
            cache: vec![(height, witness)],
            capacity: capacity.max(1),
        }
    }

    /// Position of the tracked note.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Height the newest witness is current to.
    pub fn witness_height(&self) -> Option<u64> {
        self.cache.last().map(|(h, _)| *h)
    }

    /// Newest witness, if the cache is intact.
    pub fn current(&self) -> Option<&IncrementalWitness> {
        self.cache.last().map(|(_, w)| w)
    }

    /// Root the newest witness authenticates against.
    pub fn anchor(&self) -> Option<Anchor> {
        self.current().map(IncrementalWitness::root)
    }

    /// Whether the tracker lost its history and needs a rescan.
    pub fn needs_rescan(&self) -> bool {
        self.cache.is_empty()
    }

    /// Extend the newest witness with commitments later in the same block.
    pub fn extend(&mut self, cm: &Commitment) -> Result<(), StateError> {
        match self.cache.last_mut() {
            Some((_, w)) => w.append(cm),
            None => Ok(()),
        }
    }

    /// Snapshot the witness for block `height`, which appended `cms`.
    ///
    /// A block at or below the newest snapshot was already applied and is ignored.
    pub fn advance(&mut self, height: u64, cms: &[Commitment]) -> Result<(), StateError> {
        let Some((last_height, last)) = self.cache.last() else {
            return Ok(());
        };
        if height <= *last_height {
            return Ok(());
        }
        let mut next = last.clone();
        for cm in cms {
            next.append(cm)?;
        }
        self.cache.push((height, next));
        let excess = self.cache.len().saturating_sub(self.capacity as usize);
        self.cache.drain(..excess);
        Ok(())
    }

    /// Roll back to the tree as of block `tip_height`, holding `to_position` leaves.
    pub fn rewind(&mut self, to_position: u64, tip_height: u64) -> RewindOutcome {
        if self.position >= to_position {
            self.cache.clear();
            return RewindOutcome::Orphaned;
        }
        while matches!(self.cache.last(), Some((h, _)) if *h > tip_height) {
            self.cache.pop();
        }
        match self.current() {
            Some(w) if w.tree_size() == to_position => RewindOutcome::Current,
            _ => {
                self.cache.clear();
                RewindOutcome::NeedsRescan
            }
        }
    }
}
