#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

//! Veil shielded pool state.
//!
//! Responsibilities:
//! - Maintain the append-only note commitment tree and its checkpoints
//! - Maintain the nullifier set (committed and mempool-provisional)
//! - Remember which commitment roots are valid anchors
//! - Track the net shielded supply
//! - Connect and disconnect blocks against all of the above as one step
//!
//! Proofs are opaque bytes here; this crate only enforces the bookkeeping
//! that makes a proof meaningful (anchor validity, nullifier uniqueness).

pub mod anchors;
pub mod apply;
pub mod error;
pub mod merkle;
pub mod nullifier;
pub mod supply;
pub mod witness;

pub use anchors::*;
pub use apply::*;
pub use error::*;
pub use merkle::*;
pub use nullifier::*;
pub use supply::*;
pub use witness::*;
