//! Shielded supply ledger.
//!
//! The pool's net value is the running sum of every connected block's
//! `net_value_delta`. It can never go negative: no more value can leave the
//! pool than ever entered it.

use veil_core::SignedAmount;

use crate::error::StateError;

/// Net shielded value, in atoms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SupplyLedger {
    value: SignedAmount,
}

impl SupplyLedger {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current shielded supply.
    pub fn value(&self) -> SignedAmount {
        self.value
    }

    /// Supply after applying `delta`, without mutating.
    pub fn preview_apply(&self, delta: SignedAmount) -> Result<SignedAmount, StateError> {
        let next = self
            .value
            .checked_add(delta)
            .map_err(|_| StateError::SupplyUnderflow)?;
        if next.atoms() < 0 {
            return Err(StateError::SupplyUnderflow);
        }
        Ok(next)
    }

    /// Apply a connected block's delta.
    pub fn apply_block(&mut self, delta: SignedAmount) -> Result<SignedAmount, StateError> {
        self.value = self.preview_apply(delta)?;
        Ok(self.value)
    }

    /// Revert a disconnected block's delta.
    pub fn revert_block(&mut self, delta: SignedAmount) -> Result<SignedAmount, StateError> {
        let next = self
            .value
            .checked_sub(delta)
            .map_err(|_| StateError::corruption("supply overflow on revert"))?;
        if next.atoms() < 0 {
            return Err(StateError::corruption(format!(
                "supply {next} negative after revert"
            )));
        }
        self.value = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_then_revert_is_identity() {
        let mut s = SupplyLedger::new();
        s.apply_block(SignedAmount::from_atoms(500)).unwrap();
        s.apply_block(SignedAmount::from_atoms(-120)).unwrap();
        s.revert_block(SignedAmount::from_atoms(-120)).unwrap();
        s.revert_block(SignedAmount::from_atoms(500)).unwrap();
        assert_eq!(s.value(), SignedAmount::zero());
    }

    #[test]
    fn cannot_unshield_more_than_pool() {
        let mut s = SupplyLedger::new();
        s.apply_block(SignedAmount::from_atoms(10)).unwrap();
        assert_eq!(
            s.apply_block(SignedAmount::from_atoms(-11)),
            Err(StateError::SupplyUnderflow)
        );
        assert_eq!(s.value(), SignedAmount::from_atoms(10));
    }
}
