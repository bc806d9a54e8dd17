//! Error types for the mempool.

use qbit_core::{Hash, OutPoint};
use thiserror::Error;

/// Mempool-specific errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// Transaction already pooled.
    #[error("transaction {0} already in mempool")]
    AlreadyExists(Hash),

    /// Transaction not found.
    #[error("transaction {0} not in mempool")]
    NotFound(Hash),

    /// An input is already spent by another pooled transaction.
    #[error("input {0:?} already spent in mempool")]
    DoubleSpend(OutPoint),

    /// Transaction exceeds the per-transaction size limit.
    #[error("transaction too large: {size} bytes, max {max}")]
    TooLarge { size: usize, max: usize },

    /// Fee rate below the pool floor.
    #[error("fee {fee} below minimum {min}")]
    FeeTooLow { fee: u64, min: u64 },
}

/// Result type for mempool operations.
pub type MempoolResult<T> = Result<T, MempoolError>;
