//! State transition errors.

use thiserror::Error;
use veil_core::{Anchor, Nullifier};

/// Errors produced by state validation or transitions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// Transaction or block failed basic sanity checks.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(&'static str),

    /// A nullifier was already committed, or appears twice in one block.
    #[error("double spend detected: {0}")]
    DoubleSpend(Nullifier),

    /// The anchor is not the root of any connected block.
    #[error("stale anchor: {0}")]
    StaleAnchor(Anchor),

    /// Block header commitment root mismatch.
    #[error("commitment root mismatch")]
    CommitmentRootMismatch,

    /// Connecting the block would drive the shielded supply below zero.
    #[error("shielded supply underflow")]
    SupplyUnderflow,

    /// The commitment tree has no room for further leaves.
    #[error("commitment tree is full")]
    TreeFull,

    /// Internal bookkeeping is inconsistent. The engine must halt.
    #[error("structural corruption: {0}")]
    StructuralCorruption(String),
}

impl StateError {
    /// Whether the error means the state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StructuralCorruption(_) | Self::TreeFull)
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::StructuralCorruption(msg.into())
    }
}
