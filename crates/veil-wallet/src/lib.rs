#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Veil shielded wallet.
//!
//! Holds spend-capable and view-only keys, discovers notes by trial
//! decryption, keeps a witness tracker per note in step with the chain, and
//! builds signed spends. Wallet state can be persisted with sled.

pub mod error;
pub mod keys;
pub mod note;
pub mod store;
pub mod tracker;
pub mod wallet;

pub use error::*;
pub use keys::*;
pub use note::*;
pub use store::WalletStore;
pub use tracker::*;
pub use wallet::*;
