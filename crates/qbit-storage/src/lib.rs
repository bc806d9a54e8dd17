//! # qbit-storage
//!
//! Storage layer for the qbit node.
//!
//! This crate provides a keyed storage abstraction with:
//! - Column families for the node's data (blocks, undo, UTXO, index, main
//!   chain, metadata)
//! - Atomic batch writes: a connect or disconnect is committed as a single
//!   write group, so a crash can never expose a partial state
//! - A RocksDB backend for production and an in-memory backend for tests
//!
//! ## Column families
//!
//! | Family | Key | Value |
//! |---|---|---|
//! | `blocks` | block hash (32 B) | canonical-encoded block |
//! | `undo` | block hash (32 B) | canonical-encoded undo record |
//! | `utxo` | outpoint (36 B) | UTXO entry |
//! | `index` | `h` + block hash | block-index entry |
//! | `main` | height (8 B big-endian) | block hash |
//! | `meta` | ASCII key | tip hash, schema version, total work |

mod batch;
mod database;
mod error;
mod memory;

pub use batch::WriteBatch;
pub use database::Database;
pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;

/// Column families for organizing data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    /// Block bodies keyed by block hash.
    Blocks,
    /// Per-block undo records keyed by block hash.
    Undo,
    /// Unspent transaction outputs keyed by outpoint.
    Utxo,
    /// Block-index entries keyed by `h` + block hash.
    Index,
    /// Main-chain hashes keyed by big-endian height.
    MainChain,
    /// Well-known metadata keys (tip, schema version, total work).
    Metadata,
    /// Default column family (required by RocksDB).
    Default,
}

impl ColumnFamily {
    /// On-disk name of the column family.
    pub fn name(&self) -> &'static str {
        match self {
            ColumnFamily::Blocks => "blocks",
            ColumnFamily::Undo => "undo",
            ColumnFamily::Utxo => "utxo",
            ColumnFamily::Index => "index",
            ColumnFamily::MainChain => "main",
            ColumnFamily::Metadata => "meta",
            ColumnFamily::Default => "default",
        }
    }

    /// All column families.
    pub fn all() -> &'static [ColumnFamily] {
        &[
            ColumnFamily::Blocks,
            ColumnFamily::Undo,
            ColumnFamily::Utxo,
            ColumnFamily::Index,
            ColumnFamily::MainChain,
            ColumnFamily::Metadata,
            ColumnFamily::Default,
        ]
    }
}

/// Storage trait abstracting the database backend.
///
/// Both the durable RocksDB database and the in-memory test backend satisfy
/// this interface, so everything above the storage layer is testable without
/// touching disk.
pub trait Storage: Send + Sync {
    /// Get a value by key from a column family.
    fn get(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Put a key-value pair into a column family.
    fn put(&self, cf: ColumnFamily, key: &[u8], value: &[u8]) -> StorageResult<()>;

    /// Delete a key from a column family.
    fn delete(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<()>;

    /// Check if a key exists in a column family.
    fn contains(&self, cf: ColumnFamily, key: &[u8]) -> StorageResult<bool> {
        Ok(self.get(cf, key)?.is_some())
    }

    /// Execute a batch of writes atomically: either every operation in the
    /// batch becomes visible or none does.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Iterate a column family in key order.
    fn iter(
        &self,
        cf: ColumnFamily,
    ) -> StorageResult<Box<dyn Iterator<Item = (Vec<u8>, Vec<u8>)> + '_>>;

    /// Get multiple values by keys from a column family.
    fn multi_get(&self, cf: ColumnFamily, keys: &[&[u8]]) -> StorageResult<Vec<Option<Vec<u8>>>> {
        keys.iter().map(|k| self.get(cf, k)).collect()
    }
}

/// Well-known metadata keys.
pub mod meta_keys {
    /// Hash of the current main-chain tip.
    pub const TIP: &[u8] = b"tip";
    /// Height of the current main-chain tip.
    pub const TIP_HEIGHT: &[u8] = b"tip_height";
    /// Cumulative work of the main chain, big-endian bytes.
    pub const TOTAL_WORK: &[u8] = b"total_work";
    /// On-disk schema version.
    pub const SCHEMA_VERSION: &[u8] = b"schema_version";
    /// Height the UTXO set reflects; must equal the tip height.
    pub const UTXO_HEIGHT: &[u8] = b"utxo_height";
}

/// Current on-disk schema version.
pub const SCHEMA_VERSION: u32 = 1;
