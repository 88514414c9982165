//! Nullifier set.
//!
//! Two disjoint views:
//! - committed: revealed by a connected block; consensus state
//! - provisional: claimed by a transaction waiting in the mempool
//!
//! A nullifier is "seen" if it is in either. Admission of a transaction claims
//! all of its nullifiers at once or none of them.

use hashbrown::{HashMap, HashSet};
use veil_core::{Nullifier, TxId};

use crate::error::StateError;

/// Committed and provisional spent nullifiers.
#[derive(Clone, Debug, Default)]
pub struct NullifierSet {
    committed: HashSet<Nullifier>,
    provisional: HashMap<Nullifier, TxId>,
}

impl NullifierSet {
    /// Create a new empty nullifier set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the nullifier is committed or provisionally claimed.
    pub fn contains(&self, nf: &Nullifier) -> bool {
        self.committed.contains(nf) || self.provisional.contains_key(nf)
    }

    /// Returns `true` if a connected block revealed the nullifier.
    pub fn is_committed(&self, nf: &Nullifier) -> bool {
        self.committed.contains(nf)
    }

    /// Mempool transaction currently claiming the nullifier.
    pub fn provisional_owner(&self, nf: &Nullifier) -> Option<&TxId> {
        self.provisional.get(nf)
    }

    /// Mark a nullifier spent by a connected block.
    ///
    /// A provisional claim on it graduates (is dropped) at the same time.
    pub fn insert_committed(&mut self, nf: Nullifier) -> Result<(), StateError> {
        if !self.committed.insert(nf) {
            return Err(StateError::DoubleSpend(nf));
        }
        self.provisional.remove(&nf);
        Ok(())
    }

    /// Undo [`Self::insert_committed`] during a disconnect.
    ///
    /// The nullifier must be present; anything else means the undo data and
    /// the set disagree.
    pub fn remove_committed(&mut self, nf: &Nullifier) -> Result<(), StateError> {
        if self.committed.remove(nf) {
            Ok(())
        } else {
            Err(StateError::corruption(format!(
                "disconnect removes unknown nullifier {nf}"
            )))
        }
    }

    /// Claim every nullifier of a mempool transaction, all or nothing.
    ///
    /// Fails on the first nullifier already seen, leaving the set unchanged.
    pub fn insert_provisional(
        &mut self,
        txid: TxId,
        nullifiers: &[Nullifier],
    ) -> Result<(), StateError> {
        for (i, nf) in nullifiers.iter().enumerate() {
            if self.contains(nf) || nullifiers[..i].contains(nf) {
                return Err(StateError::DoubleSpend(*nf));
            }
        }
        for nf in nullifiers {
            self.provisional.insert(*nf, txid);
        }
        Ok(())
    }

    /// Release a provisional claim. Returns the owning transaction, if any.
    pub fn remove_provisional(&mut self, nf: &Nullifier) -> Option<TxId> {
        self.provisional.remove(nf)
    }

    /// Release every claim of `txid` among `nullifiers`.
    pub fn release(&mut self, txid: &TxId, nullifiers: &[Nullifier]) {
        for nf in nullifiers {
            if self.provisional.get(nf) == Some(txid) {
                self.provisional.remove(nf);
            }
        }
    }

    /// Committed nullifiers, in no particular order.
    pub fn committed(&self) -> impl Iterator<Item = &Nullifier> + '_ {
        self.committed.iter()
    }

    /// Number of committed nullifiers.
    pub fn len(&self) -> usize {
        self.committed.len()
    }

    /// Whether no nullifier is committed.
    pub fn is_empty(&self) -> bool {
        self.committed.is_empty()
    }

    /// Number of provisional claims.
    pub fn provisional_len(&self) -> usize {
        self.provisional.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::Hash32;

    fn nf(b: u8) -> Nullifier {
        Nullifier([b; 32])
    }

    #[test]
    fn provisional_insert_is_all_or_nothing() {
        let mut set = NullifierSet::new();
        set.insert_committed(nf(3)).unwrap();

        let err = set
            .insert_provisional(Hash32([1; 32]), &[nf(1), nf(2), nf(3)])
            .unwrap_err();
        assert_eq!(err, StateError::DoubleSpend(nf(3)));
        assert!(!set.contains(&nf(1)));
        assert_eq!(set.provisional_len(), 0);

        let err = set
            .insert_provisional(Hash32([1; 32]), &[nf(4), nf(4)])
            .unwrap_err();
        assert_eq!(err, StateError::DoubleSpend(nf(4)));
        assert_eq!(set.provisional_len(), 0);
    }

    #[test]
    fn commit_graduates_provisional() {
        let mut set = NullifierSet::new();
        let owner = Hash32([7; 32]);
        set.insert_provisional(owner, &[nf(1)]).unwrap();
        assert_eq!(set.provisional_owner(&nf(1)), Some(&owner));
        set.insert_committed(nf(1)).unwrap();
        assert!(set.is_committed(&nf(1)));
        assert_eq!(set.provisional_len(), 0);
        assert_eq!(set.insert_committed(nf(1)), Err(StateError::DoubleSpend(nf(1))));
    }

    #[test]
    fn removing_absent_committed_is_fatal() {
        let mut set = NullifierSet::new();
        assert!(set.remove_committed(&nf(9)).unwrap_err().is_fatal());
    }

    #[test]
    fn release_only_drops_own_claims() {
        let mut set = NullifierSet::new();
        let a = Hash32([1; 32]);
        let b = Hash32([2; 32]);
        set.insert_provisional(a, &[nf(1)]).unwrap();
        set.insert_provisional(b, &[nf(2)]).unwrap();
        set.release(&a, &[nf(1), nf(2)]);
        assert!(!set.contains(&nf(1)));
        assert!(set.contains(&nf(2)));
    }
}
