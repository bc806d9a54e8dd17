//! Error types for consensus validation.

use crate::script::ScriptError;
use qbit_core::{Hash, OutPoint};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Reasons a block or transaction fails validation.
///
/// Every variant except [`ValidationError::Cancelled`] is a consensus
/// failure: the offending block is marked `Failed` permanently and all of its
/// descendants become unreachable for main-chain inclusion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Header PoW hash is above the declared target.
    #[error("PoW hash does not meet target")]
    PowInsufficient,

    /// Header target differs from the retarget rule's output, or is not in
    /// canonical compact form.
    #[error("wrong target: got {got:#010x}, expected {expected:#010x}")]
    WrongTarget { got: u32, expected: u32 },

    /// Header Merkle root does not match the transactions.
    #[error("merkle root mismatch: got {got}, expected {expected}")]
    BadMerkleRoot { got: Hash, expected: Hash },

    /// Block time outside the (median-past, now + drift] window.
    #[error("bad timestamp {time}: must be in ({lower}, {upper}]")]
    BadTimestamp { time: u32, lower: u32, upper: u32 },

    /// Coinbase structure violation.
    #[error("malformed coinbase: {0}")]
    CoinbaseMalformed(String),

    /// Coinbase height commitment does not match the block height.
    #[error("coinbase height {committed} does not match block height {expected}")]
    CoinbaseHeightMismatch { committed: u32, expected: u32 },

    /// Coinbase outputs exceed subsidy plus fees.
    #[error("coinbase claims {claimed} but only {allowed} is allowed")]
    CoinbaseOverclaim { claimed: u64, allowed: u64 },

    /// A spent outpoint is absent from the UTXO view.
    #[error("missing UTXO {0:?}")]
    MissingUtxo(OutPoint),

    /// A coinbase output was spent before maturity.
    #[error("coinbase UTXO {outpoint:?} spent at height {spend_height}, created at {origin_height}")]
    CoinbaseImmature {
        outpoint: OutPoint,
        origin_height: u32,
        spend_height: u32,
    },

    /// Input amounts do not cover output amounts.
    #[error("inputs {input_total} less than outputs {output_total}")]
    InsufficientInputAmount { input_total: u64, output_total: u64 },

    /// Script evaluation failed for an input.
    #[error("script failure on input {input_index}: {error}")]
    ScriptFailure {
        input_index: usize,
        error: ScriptError,
    },

    /// The same outpoint was spent twice within a transaction or block.
    #[error("duplicate input {0:?}")]
    DuplicateInput(OutPoint),

    /// Encoded block exceeds the size cap.
    #[error("block too large: {size} bytes, max {max}")]
    BlockTooLarge { size: usize, max: usize },

    /// Block signature-verification cost above the cap.
    #[error("too many sigops: cost {cost}, max {max}")]
    TooManySigops { cost: u32, max: u32 },

    /// Structural transaction violation (empty inputs/outputs, unsupported
    /// version, value overflow).
    #[error("malformed transaction: {0}")]
    TxMalformed(String),

    /// Validation was cancelled cooperatively. Not a consensus failure; the
    /// block must not be marked `Failed`.
    #[error("validation cancelled")]
    Cancelled,
}

/// Result type for validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Cooperative cancellation flag, checked at per-transaction boundaries
/// during block validation.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of the validation in progress.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Re-arm the flag before starting a new validation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
