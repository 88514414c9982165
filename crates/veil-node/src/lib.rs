#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Veil node: the shielded pool consistency engine.
//!
//! Responsibilities:
//! - Drive block connect/disconnect through chain state, mempool and wallets
//! - Guard mempool admission against double spends and stale anchors
//! - Persist connected blocks and rebuild chain state from them on start
//!
//! The binary in `main.rs` is a thin shell around [`Engine`].

pub mod chain_store;
pub mod config;
pub mod engine;
pub mod mempool;

pub use config::{resolve_config, EngineConfig, NodeArgs, ResolvedConfig};
pub use engine::{Engine, EngineError, WalletId};
pub use mempool::{
    Admission, EvictReason, Eviction, Mempool, MempoolEntry, ShieldedView, SubmitError,
};
