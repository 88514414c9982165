//! Commitment and nullifier derivation.
//!
//! Important: this crate intentionally does NOT implement a proof system.
//! These are the binding/hiding stand-ins the rest of the node agrees on;
//! the concrete hash is an implementation detail.

use crate::constants::*;
use crate::serialization::hash32;
use crate::types::{Amount, Commitment, Nullifier};

/// Note commitment: `cm = BLAKE3(DS_COMMITMENT || address || value_le || rcm)`.
///
/// `rcm` is the note's random commitment trapdoor, which makes the
/// commitment hiding even for equal (address, value) pairs.
pub fn note_commitment(address: &[u8], value: Amount, rcm: &[u8; 32]) -> Commitment {
    let mut input = Vec::with_capacity(address.len() + 8 + 32);
    input.extend_from_slice(address);
    input.extend_from_slice(&value.atoms().to_le_bytes());
    input.extend_from_slice(rcm);
    Commitment(hash32(DS_COMMITMENT, &input).0)
}

/// Nullifier: `nf = BLAKE3(DS_NULLIFIER || nk || cm || position_le)`.
///
/// Binding the tree position means a note has exactly one nullifier, even if
/// an identical commitment were appended twice.
pub fn derive_nullifier(nk: &[u8; 32], cm: &Commitment, position: u64) -> Nullifier {
    let mut input = [0u8; 32 + COMMITMENT_LEN + 8];
    input[..32].copy_from_slice(nk);
    input[32..32 + COMMITMENT_LEN].copy_from_slice(cm.as_bytes());
    input[32 + COMMITMENT_LEN..].copy_from_slice(&position.to_le_bytes());
    Nullifier(hash32(DS_NULLIFIER, &input).0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nullifier_depends_on_position_and_key() {
        let cm = note_commitment(&[1u8; 33], Amount::from_atoms(5), &[2u8; 32]);
        let a = derive_nullifier(&[3u8; 32], &cm, 0);
        assert_ne!(a, derive_nullifier(&[3u8; 32], &cm, 1));
        assert_ne!(a, derive_nullifier(&[4u8; 32], &cm, 0));
        assert_eq!(a, derive_nullifier(&[3u8; 32], &cm, 0));
    }

    #[test]
    fn commitment_hides_with_trapdoor() {
        let a = note_commitment(&[1u8; 33], Amount::from_atoms(5), &[2u8; 32]);
        let b = note_commitment(&[1u8; 33], Amount::from_atoms(5), &[3u8; 32]);
        assert_ne!(a, b);
    }
}
