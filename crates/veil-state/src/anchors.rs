//! Anchor history.
//!
//! Every connected block records the commitment root it left behind. A root
//! stays a valid anchor for as long as at least one connected block produced
//! it. Blocks without outputs repeat their parent's root, so roots are
//! reference counted.

use std::collections::BTreeMap;

use hashbrown::HashMap;
use veil_core::Anchor;

use crate::error::StateError;
use crate::merkle::empty_root;

/// Roots of connected blocks, by height.
#[derive(Clone, Debug)]
pub struct AnchorHistory {
    by_height: BTreeMap<u64, Anchor>,
    refs: HashMap<Anchor, usize>,
}

impl AnchorHistory {
    /// Create an empty history.
    pub fn new() -> Self {
        Self {
            by_height: BTreeMap::new(),
            refs: HashMap::new(),
        }
    }

    /// Record the root a newly connected block produced.
    ///
    /// Heights must be strictly increasing.
    pub fn record(&mut self, height: u64, anchor: Anchor) -> Result<(), StateError> {
        if let Some((tip, _)) = self.by_height.last_key_value() {
            if height <= *tip {
                return Err(StateError::corruption(format!(
                    "anchor recorded at height {height} below tip {tip}"
                )));
            }
        }
        self.by_height.insert(height, anchor);
        *self.refs.entry(anchor).or_insert(0) += 1;
        Ok(())
    }

    /// Forget the anchor of the disconnected tip block.
    pub fn forget(&mut self, height: u64) -> Result<Anchor, StateError> {
        match self.by_height.last_key_value() {
            Some((tip, _)) if *tip == height => {}
            _ => {
                return Err(StateError::corruption(format!(
                    "forget anchor at height {height} which is not the tip"
                )))
            }
        }
        let anchor = self
            .by_height
            .remove(&height)
            .ok_or_else(|| StateError::corruption("anchor tip vanished"))?;
        match self.refs.get_mut(&anchor) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                self.refs.remove(&anchor);
            }
            None => {
                return Err(StateError::corruption(format!(
                    "anchor {anchor} has no reference count"
                )))
            }
        }
        Ok(anchor)
    }

    /// Whether `anchor` is the root of some connected block, or of the empty tree.
    pub fn is_valid(&self, anchor: &Anchor) -> bool {
        self.refs.contains_key(anchor) || *anchor == empty_root()
    }

    /// Anchor recorded at `height`.
    pub fn at(&self, height: u64) -> Option<Anchor> {
        self.by_height.get(&height).copied()
    }

    /// Highest recorded height and its anchor.
    pub fn tip(&self) -> Option<(u64, Anchor)> {
        self.by_height.last_key_value().map(|(h, a)| (*h, *a))
    }

    /// Number of recorded blocks.
    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }
}

impl Default for AnchorHistory {
    fn default() -> Self {
        Self::new()
    }
}
