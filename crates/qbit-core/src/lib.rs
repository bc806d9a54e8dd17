//! # qbit-core
//!
//! Primitive types and encodings for the qbit blockchain.
//!
//! This crate provides:
//! - Canonical binary encoding/decoding of blocks, transactions and outpoints
//! - Domain-separated Blake2b-256 hashing for block ids, tx ids and Merkle trees
//! - Compact (nBits) difficulty target encoding
//! - The transaction signature hash and the post-quantum signature primitive
//!
//! ## Canonical encoding
//!
//! Integers are little-endian fixed width. Sequences and byte strings are
//! length-prefixed with a Bitcoin-style variable-length integer; non-minimal
//! VarInt encodings are rejected so every value has exactly one encoding.
//! Top-level decodes enforce hard size caps (block 4 MiB, transaction 1 MiB,
//! script 10 KiB) and reject trailing bytes.

mod codec;
mod compact;
mod error;
mod hash;
mod merkle;
pub mod sig;
mod sighash;
mod types;

pub use codec::{Decodable, Encodable, Reader};
pub use compact::{compact_to_target, is_canonical_compact, target_to_compact, work_for_target};
pub use error::{CodecError, CodecResult};
pub use hash::{hash_tagged, hash_tagged2, tags, Hash, HASH_SIZE};
pub use merkle::merkle_root;
pub use sighash::tx_sighash;
pub use types::{
    Block, BlockHeader, OutPoint, Transaction, TxInput, TxOutput, UndoRecord, UtxoEntry,
};

/// Hard wire-format limits enforced by the codec.
///
/// These mirror the consensus constants; they live here because decoding must
/// reject oversized structures before any consensus logic runs.
pub mod limits {
    /// Maximum encoded block size in bytes (4 MiB).
    pub const MAX_BLOCK_BYTES: usize = 4_194_304;

    /// Maximum encoded transaction size in bytes (1 MiB).
    pub const MAX_TX_BYTES: usize = 1_048_576;

    /// Maximum script size in bytes (10 KiB).
    pub const MAX_SCRIPT_BYTES: usize = 10_240;

    /// Maximum inputs or outputs per transaction.
    pub const MAX_TX_SLOTS: usize = 65_536;

    /// Maximum transactions per block (a block of minimal transactions).
    pub const MAX_BLOCK_TX_SLOTS: usize = 65_536;
}
