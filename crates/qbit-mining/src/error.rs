//! Error types for mining.

use thiserror::Error;

/// Mining-specific errors.
#[derive(Error, Debug)]
pub enum MiningError {
    /// Coinbase construction failed.
    #[error("invalid coinbase destination: {0}")]
    BadDestination(String),

    /// Template fields are unusable (e.g. non-canonical target).
    #[error("invalid template: {0}")]
    BadTemplate(String),

    /// Chain state unavailable or inconsistent.
    #[error("state error: {0}")]
    State(#[from] qbit_state::StateError),

    /// The nonce search space was exhausted without a solution.
    #[error("no solution found within {0} attempts")]
    Unsolved(u64),
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;
