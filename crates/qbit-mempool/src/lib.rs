//! # qbit-mempool
//!
//! Transaction mempool for the qbit node.
//!
//! This crate provides:
//! - Transaction storage with fee-rate ordering
//! - Double-spend detection against pooled transactions
//! - Selection for block templates with in-pool dependency ordering
//! - Reorg notification handling: re-add from disconnected blocks, drop
//!   confirmed transactions
//!
//! Admission validation against the UTXO view happens in the caller, which
//! owns a chain snapshot; the pool itself only enforces structural limits.

mod error;
mod ordering;
mod pool;

pub use error::{MempoolError, MempoolResult};
pub use ordering::FeeOrdering;
pub use pool::{Mempool, MempoolConfig, MempoolStats, PooledTransaction};

/// Default maximum mempool size in bytes.
pub const DEFAULT_MAX_SIZE: usize = 64 * 1024 * 1024;

/// Default maximum number of transactions.
pub const DEFAULT_MAX_TXS: usize = 10_000;
