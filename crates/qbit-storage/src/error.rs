//! Error types for the storage layer.

use thiserror::Error;

/// Storage-specific errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB error.
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    /// I/O error. Retried once by callers; persistent failure degrades the
    /// node to read-only.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Column family not found.
    #[error("column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// On-disk state is internally inconsistent. Fatal: the writer halts and
    /// the operator must intervene.
    #[error("data corruption detected: {0}")]
    Corruption(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
