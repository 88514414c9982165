// Consensus-critical. Changes require a protocol version bump + tests.
//! Canonical protocol types.
//!
//! This module defines all consensus-visible data structures and primitive
//! value types shared by the chain state, the mempool and wallets.

use crate::constants::*;
use crate::serialization::to_bytes;
use borsh::{BorshDeserialize, BorshSerialize};
use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors related to parsing, validation, or construction of core protocol types.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Hex string had an unexpected byte length.
    #[error("invalid hex length: expected {expected} bytes, got {got} bytes")]
    InvalidHexLength {
        /// Expected number of bytes.
        expected: usize,
        /// Actual number of bytes provided.
        got: usize,
    },

    /// Hex decoding failed.
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Arithmetic overflow or underflow occurred.
    #[error("amount overflow or underflow")]
    AmountOverflow,

    /// A value violated protocol constraints.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
}

/// Generates a fixed-size byte newtype with hex `Debug`/`Display`/`FromStr`.
macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize)]
        #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Returns the all-zero value.
            pub const fn zero() -> Self {
                Self([0u8; $len])
            }

            /// Returns the underlying byte array.
            pub const fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(value: [u8; $len]) -> Self {
                Self(value)
            }
        }

        impl From<$name> for [u8; $len] {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                let bytes = hex::decode(s)?;
                if bytes.len() != $len {
                    return Err(CoreError::InvalidHexLength {
                        expected: $len,
                        got: bytes.len(),
                    });
                }
                let mut arr = [0u8; $len];
                arr.copy_from_slice(&bytes);
                Ok(Self(arr))
            }
        }
    };
}

fixed_bytes!(
    /// Fixed-size 32-byte hash used throughout the protocol.
    Hash32,
    HASH32_LEN
);

fixed_bytes!(
    /// Commitment to a shielded note, appended once to the commitment tree.
    Commitment,
    COMMITMENT_LEN
);

fixed_bytes!(
    /// Nullifier revealed when a note is spent.
    Nullifier,
    NULLIFIER_LEN
);

/// Block hash type.
pub type BlockHash = Hash32;

/// Transaction identifier type.
pub type TxId = Hash32;

/// Root of the note commitment tree at some point of chain history.
pub type Anchor = Hash32;

/// Amount expressed in the smallest unit ("atoms").
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Amount(pub u64);

impl Amount {
    /// Returns a zero amount.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Constructs an amount from atoms.
    pub const fn from_atoms(atoms: u64) -> Self {
        Self(atoms)
    }

    /// Returns the underlying atom value.
    pub const fn atoms(self) -> u64 {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(self, other: Amount) -> Result<Self, CoreError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: Amount) -> Result<Self, CoreError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    /// Whether the amount is within the monetary range.
    pub fn is_valid_money(self) -> bool {
        self.0 <= MAX_MONEY_ATOMS
    }
}

impl fmt::Debug for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Amount({} atoms)", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} atoms", self.0)
    }
}

/// Signed amount in atoms, used for value balances and supply deltas.
#[derive(
    Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, BorshSerialize, BorshDeserialize,
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SignedAmount(pub i64);

impl SignedAmount {
    /// Returns zero.
    pub const fn zero() -> Self {
        Self(0)
    }

    /// Constructs a signed amount from atoms.
    pub const fn from_atoms(atoms: i64) -> Self {
        Self(atoms)
    }

    /// Returns the underlying atom value.
    pub const fn atoms(self) -> i64 {
        self.0
    }

    /// Checked addition.
    pub fn checked_add(self, other: SignedAmount) -> Result<Self, CoreError> {
        self.0
            .checked_add(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    /// Checked subtraction.
    pub fn checked_sub(self, other: SignedAmount) -> Result<Self, CoreError> {
        self.0
            .checked_sub(other.0)
            .map(Self)
            .ok_or(CoreError::AmountOverflow)
    }

    /// Checked negation.
    pub fn checked_neg(self) -> Result<Self, CoreError> {
        self.0.checked_neg().map(Self).ok_or(CoreError::AmountOverflow)
    }

    /// Whether the magnitude is within the monetary range.
    pub fn is_valid_money(self) -> bool {
        self.0.unsigned_abs() <= MAX_MONEY_ATOMS
    }
}

impl TryFrom<Amount> for SignedAmount {
    type Error = CoreError;

    fn try_from(value: Amount) -> Result<Self, Self::Error> {
        i64::try_from(value.0)
            .map(Self)
            .map_err(|_| CoreError::AmountOverflow)
    }
}

impl fmt::Debug for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignedAmount({} atoms)", self.0)
    }
}

impl fmt::Display for SignedAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(
            f,
            "{sign}{}.{:08}",
            abs / ATOMS_PER_COIN,
            abs % ATOMS_PER_COIN
        )
    }
}

/// Note ciphertext attached to a shielded output.
///
/// `epk` is a compressed secp256k1 point; the ciphertext is opaque to consensus.
#[derive(Clone, PartialEq, Eq, Debug, Default, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct EncryptedNote {
    /// Ephemeral public key (SEC1 compressed).
    pub epk: Vec<u8>,
    /// AEAD ciphertext of the note plaintext.
    pub ciphertext: Vec<u8>,
}

/// A shielded spend: reveals a nullifier and authorizes it.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SpendDescription {
    /// Nullifier of the note being consumed.
    pub nullifier: Nullifier,
    /// Spend-authorizing public key (SEC1 compressed).
    pub rk: Vec<u8>,
    /// DER-encoded ECDSA signature over the transaction sighash.
    pub spend_auth_sig: Vec<u8>,
}

/// A shielded output: a new note commitment plus its ciphertext.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct OutputDescription {
    /// Note commitment appended to the tree when the block connects.
    pub cm: Commitment,
    /// Encrypted note for the recipient.
    pub note: EncryptedNote,
}

/// Shielded transaction.
///
/// `value_balance` is the net value leaving the shielded pool:
/// Σ spent note values − Σ output note values. Shielding from the transparent
/// side therefore has a negative value balance.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Transaction {
    /// Protocol version for this transaction.
    pub version: u16,
    /// Commitment tree root all spends are proven against.
    pub anchor: Anchor,
    /// Notes consumed by this transaction.
    pub spends: Vec<SpendDescription>,
    /// Notes created by this transaction.
    pub outputs: Vec<OutputDescription>,
    /// Net value leaving the shielded pool.
    pub value_balance: SignedAmount,
    /// Fee offered to the block producer (mempool policy only).
    pub fee: Amount,
    /// Zero-knowledge proof bytes (opaque here).
    pub proof: Vec<u8>,
}

impl Transaction {
    /// Nullifiers revealed by this transaction, in spend order.
    pub fn nullifiers(&self) -> impl Iterator<Item = &Nullifier> + '_ {
        self.spends.iter().map(|s| &s.nullifier)
    }

    /// Commitments created by this transaction, in output order.
    pub fn commitments(&self) -> impl Iterator<Item = &Commitment> + '_ {
        self.outputs.iter().map(|o| &o.cm)
    }

    /// Performs basic structural validation.
    pub fn validate_sanity(&self) -> Result<(), CoreError> {
        if self.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidValue("unsupported transaction version"));
        }
        if self.spends.is_empty() && self.outputs.is_empty() {
            return Err(CoreError::InvalidValue("transaction has no spends or outputs"));
        }
        if self.spends.len() > MAX_SPENDS_PER_TX {
            return Err(CoreError::InvalidValue("too many spends"));
        }
        if self.outputs.len() > MAX_OUTPUTS_PER_TX {
            return Err(CoreError::InvalidValue("too many outputs"));
        }
        if !self.spends.is_empty() && self.anchor == Hash32::zero() {
            return Err(CoreError::InvalidValue("spends require an anchor"));
        }
        if !self.value_balance.is_valid_money() || !self.fee.is_valid_money() {
            return Err(CoreError::InvalidValue("value out of range"));
        }
        for (i, spend) in self.spends.iter().enumerate() {
            if self.spends[..i].iter().any(|s| s.nullifier == spend.nullifier) {
                return Err(CoreError::InvalidValue("duplicate nullifier in transaction"));
            }
        }
        if to_bytes(self)?.len() > MAX_TX_BYTES {
            return Err(CoreError::InvalidValue("transaction exceeds MAX_TX_BYTES"));
        }
        Ok(())
    }
}

/// Block header fields the shielded pool cares about.
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct BlockHeader {
    /// Protocol version.
    pub version: u16,
    /// Hash of the previous block.
    pub prev: BlockHash,
    /// Commitment tree root after this block.
    pub commitment_root: Anchor,
    /// Block timestamp (Unix seconds).
    pub timestamp: u64,
}

/// Full block (header + shielded transactions).
#[derive(Clone, PartialEq, Eq, Debug, BorshSerialize, BorshDeserialize)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Block {
    /// Block header.
    pub header: BlockHeader,
    /// Transactions included in this block.
    pub txs: Vec<Transaction>,
}

impl Block {
    /// Performs basic structural validation.
    pub fn validate_sanity(&self) -> Result<(), CoreError> {
        if self.header.version != PROTOCOL_VERSION {
            return Err(CoreError::InvalidValue("unsupported block version"));
        }
        self.txs.iter().try_for_each(Transaction::validate_sanity)
    }

    /// All note commitments of the block, in the order they are appended.
    pub fn commitments(&self) -> Vec<Commitment> {
        self.txs.iter().flat_map(|tx| tx.commitments().copied()).collect()
    }

    /// All nullifiers revealed by the block.
    pub fn nullifiers(&self) -> Vec<Nullifier> {
        self.txs.iter().flat_map(|tx| tx.nullifiers().copied()).collect()
    }

    /// Net value entering the shielded pool: −Σ value_balance.
    pub fn net_value_delta(&self) -> Result<SignedAmount, CoreError> {
        self.txs.iter().try_fold(SignedAmount::zero(), |acc, tx| {
            acc.checked_sub(tx.value_balance)
        })
    }
}
