//! Wallet errors.

use thiserror::Error;
use veil_core::CoreError;
use veil_state::StateError;

/// Errors produced by wallet operations.
#[derive(Debug, Error)]
pub enum WalletError {
    /// The note has no witness current to the requested anchor; wait for sync or rescan.
    #[error("no witness for note at position {0}")]
    NoWitness(u64),

    /// The wallet does not track the referenced note.
    #[error("unknown note")]
    UnknownNote,

    /// Not enough spendable value.
    #[error("insufficient funds: need {needed} atoms, have {available}")]
    InsufficientFunds {
        /// Value required including fee.
        needed: u64,
        /// Spendable value found.
        available: u64,
    },

    /// The key for this address can only view.
    #[error("key is view-only")]
    KeyNotSpendCapable,

    /// Key material could not be parsed or derived.
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),

    /// Address string or bytes could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(&'static str),

    /// Address is well formed but no key in the wallet owns it.
    #[error("address not in wallet: {0}")]
    UnknownAddress(String),

    /// Memo exceeds the fixed memo size.
    #[error("memo too long: {0} bytes")]
    MemoTooLong(usize),

    /// A rescan was cancelled; the wallet is unchanged.
    #[error("rescan interrupted")]
    RescanInterrupted,

    /// Note encryption failed.
    #[error("note encryption failed")]
    Encryption,

    /// Persistent storage failure.
    #[error("storage: {0}")]
    Storage(String),

    /// Core type or encoding error.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Chain state error surfaced through the wallet.
    #[error(transparent)]
    State(#[from] StateError),
}

impl From<sled::Error> for WalletError {
    fn from(e: sled::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<std::io::Error> for WalletError {
    fn from(e: std::io::Error) -> Self {
        Self::Storage(e.to_string())
    }
}
