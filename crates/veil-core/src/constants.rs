//! Protocol-wide constants for the Veil shielded pool.

/// Protocol semantic version.
pub const PROTOCOL_VERSION: u16 = 0;

/// Length in bytes of a 32-byte hash.
pub const HASH32_LEN: usize = 32;

/// Length in bytes of a note commitment.
pub const COMMITMENT_LEN: usize = 32;

/// Length in bytes of a nullifier.
pub const NULLIFIER_LEN: usize = 32;

/// Number of atomic units per one coin.
///
/// All value arithmetic is fixed-point in atoms; there is no floating point anywhere.
pub const ATOMS_PER_COIN: u64 = 100_000_000;

/// Upper bound on any single amount, in atoms.
pub const MAX_MONEY_ATOMS: u64 = 21_000_000 * ATOMS_PER_COIN;

/// Depth of the note commitment tree. Capacity is `2^TREE_DEPTH` leaves.
pub const TREE_DEPTH: usize = 32;

/// Maximum number of shielded spends in one transaction.
pub const MAX_SPENDS_PER_TX: usize = 64;

/// Maximum number of shielded outputs in one transaction.
pub const MAX_OUTPUTS_PER_TX: usize = 64;

/// Maximum serialized transaction size (in bytes) accepted by the mempool.
pub const MAX_TX_BYTES: usize = 200_000;

/// Size in bytes of the memo field carried inside every note plaintext.
pub const MEMO_SIZE: usize = 512;

/// First byte of a memo that carries no data.
pub const EMPTY_MEMO_MARKER: u8 = 0xF6;

/// Default maximum reorganization depth the engine is prepared to undo cheaply.
pub const DEFAULT_MAX_REORG_DEPTH: u32 = 100;

/// Domain separator used when hashing block headers.
pub const DS_BLOCK_HEADER: &[u8] = b"VEIL::BLOCK_HEADER::V0";

/// Domain separator used when hashing transactions.
pub const DS_TX: &[u8] = b"VEIL::TX::V0";

/// Domain separator for the message signed by spend authorization signatures.
pub const DS_SIGHASH: &[u8] = b"VEIL::SIGHASH::V0";

/// Domain separator used when deriving note commitments.
pub const DS_COMMITMENT: &[u8] = b"VEIL::COMMITMENT::V0";

/// Domain separator used when deriving nullifiers.
pub const DS_NULLIFIER: &[u8] = b"VEIL::NULLIFIER::V0";
