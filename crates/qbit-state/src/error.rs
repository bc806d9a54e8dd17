//! Error types for state management.

use qbit_core::{CodecError, Hash, OutPoint};
use qbit_consensus::ValidationError;
use qbit_storage::StorageError;
use thiserror::Error;

/// State management errors.
#[derive(Error, Debug)]
pub enum StateError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Stored bytes failed to decode.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Consensus validation failure; the block is marked failed.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Header references an unknown parent. Soft: buffer and revisit when
    /// the parent arrives.
    #[error("orphan header: parent {0} unknown")]
    OrphanHeader(Hash),

    /// Parent was already marked failed; the descendant is rejected
    /// terminally.
    #[error("parent {0} failed validation")]
    ParentFailed(Hash),

    /// The block itself was already marked failed; never retried.
    #[error("block {0} is known invalid")]
    KnownInvalid(Hash),

    /// A reorganization deeper than the finality window was refused.
    #[error("reorg too deep: fork at {fork_height}, tip at {tip_height}, max depth {max}")]
    ReorgTooDeep {
        fork_height: u32,
        tip_height: u32,
        max: u32,
    },

    /// A spent outpoint was absent from the UTXO set.
    #[error("missing UTXO {0:?}")]
    MissingUtxo(OutPoint),

    /// An inserted outpoint already existed in the UTXO set.
    #[error("duplicate UTXO {0:?}")]
    DuplicateUtxo(OutPoint),

    /// A block body was expected but not stored.
    #[error("block not found: {0}")]
    BlockNotFound(Hash),

    /// On-disk state is internally inconsistent. Fatal.
    #[error("corruption: {0}")]
    Corruption(String),
}

/// Result type for state operations.
pub type StateResult<T> = Result<T, StateError>;
