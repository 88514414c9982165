// Consensus-critical. Changes require a protocol version bump + tests.
//! Canonical serialization helpers.
//!
//! Rule: all consensus-critical objects are encoded with Borsh.
//! Do not use JSON or non-canonical formats for hashing/signing/consensus.

use crate::constants::*;
use crate::types::{BlockHeader, CoreError, Hash32, Transaction};
use borsh::to_vec;

/// Encode a value with canonical Borsh encoding.
pub fn to_bytes<T: borsh::BorshSerialize>(v: &T) -> Result<Vec<u8>, CoreError> {
    to_vec(v).map_err(|_| CoreError::InvalidValue("borsh serialization failed"))
}

/// Hash bytes with blake3 and return 32 bytes.
pub fn hash32(domain_sep: &[u8], bytes: &[u8]) -> Hash32 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(domain_sep);
    hasher.update(bytes);
    Hash32(*hasher.finalize().as_bytes())
}

/// Canonical transaction id (txid) = BLAKE3(DS_TX || borsh(tx)).
pub fn txid(tx: &Transaction) -> Result<Hash32, CoreError> {
    let bytes = to_bytes(tx)?;
    if bytes.len() > MAX_TX_BYTES {
        return Err(CoreError::InvalidValue("tx exceeds MAX_TX_BYTES"));
    }
    Ok(hash32(DS_TX, &bytes))
}

/// Message signed by every spend authorization signature of `tx`.
///
/// The signatures themselves are blanked before hashing so a signer can
/// compute the digest before any signature exists.
pub fn sighash(tx: &Transaction) -> Result<Hash32, CoreError> {
    let mut unsigned = tx.clone();
    for spend in &mut unsigned.spends {
        spend.spend_auth_sig.clear();
    }
    Ok(hash32(DS_SIGHASH, &to_bytes(&unsigned)?))
}

/// Canonical block header hash = BLAKE3(DS_BLOCK_HEADER || borsh(header)).
pub fn block_header_hash(h: &BlockHeader) -> Result<Hash32, CoreError> {
    let bytes = to_bytes(h)?;
    Ok(hash32(DS_BLOCK_HEADER, &bytes))
}
