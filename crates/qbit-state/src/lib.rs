//! # qbit-state
//!
//! Chain state for the qbit node.
//!
//! This crate provides:
//! - The UTXO store with a write-back LRU cache and copy-on-write snapshots
//! - Persistent block bodies and per-block undo records
//! - The chain state machine: block index, tip selection by total work,
//!   connect/disconnect with full undo, and the finality window
//!
//! ## Write groups
//!
//! Every connect and disconnect commits UTXO mutations, the undo record, the
//! main-chain pointer and the metadata in one atomic storage batch. Readers
//! either see a block fully applied or not at all; crash recovery reduces to
//! checking that the UTXO height equals the tip height.

mod block_store;
mod chain;
mod clock;
mod error;
mod utxo;

pub use block_store::BlockStore;
pub use chain::{
    BlockAcceptance, BlockIndexEntry, BlockStatus, ChainOptions, ChainState, ReorgSink,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{StateError, StateResult};
pub use utxo::{UtxoSnapshot, UtxoStore, DEFAULT_UTXO_CACHE_CAPACITY};
