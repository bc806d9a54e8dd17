//! # qbit-consensus
//!
//! Consensus rules for the qbit blockchain.
//!
//! This crate provides:
//! - Epoch-keyed proof-of-work verification
//! - Per-block difficulty retargeting with damping
//! - The script machine, including the post-quantum signature opcode
//! - Coin emission and the halving schedule
//! - Context-free (phase A) and contextual (phase B) block validation
//!
//! ## Difficulty
//!
//! The target is recomputed every block from the solve times of the previous
//! 60 blocks, with adjustments damped to a factor of four per step.
//!
//! ## Proof of work
//!
//! The PoW hash is produced by a CPU-biased scratchpad kernel seeded with a
//! per-epoch key: the id of the block 64 blocks before the current 2048-block
//! epoch boundary. Validators therefore need ancestors up to ~2112 blocks
//! back; the key changes once per epoch, not per block.

mod block_validation;
mod chain_params;
mod difficulty;
mod emission;
mod error;
mod pow;
pub mod script;
mod validation;

pub use block_validation::{
    BlockContext, ContextualValidator, CreatedCoin, SpentCoin, ValidatedStateChange,
};
pub use chain_params::{ChainParams, Network};
pub use difficulty::{median_time_past, DifficultyEngine, HeaderTiming};
pub use emission::{max_supply, subsidy, subsidy_up_to};
pub use error::{CancelFlag, ValidationError, ValidationResult};
pub use pow::{PowEngine, PowKernel, ScratchpadKernel};
pub use script::{ScriptError, ScriptVm};
pub use validation::{parse_coinbase_height, validate_block_stateless, validate_tx_stateless};

/// Consensus constants. Changing any of these is a hard fork.
pub mod params {
    /// Target solve time per block, in seconds.
    pub const TARGET_BLOCK_TIME: u32 = 120;

    /// Number of past blocks averaged by the retarget.
    pub const RETARGET_WINDOW: u32 = 60;

    /// Maximum retarget adjustment per block (factor of four either way).
    pub const RETARGET_DAMPING: u32 = 4;

    /// Blocks considered by the median-time-past rule.
    pub const MEDIAN_TIME_SPAN: usize = 11;

    /// Maximum allowed block time ahead of wall clock, in seconds.
    pub const MAX_FUTURE_DRIFT_SECS: u32 = 7_200;

    /// Sub-units per whole coin.
    pub const COIN: u64 = 10_000;

    /// Subsidy of the first halving period, in sub-units.
    pub const INITIAL_SUBSIDY: u64 = 105_113_636 * COIN;

    /// Blocks per halving period (~4 years at 2-minute blocks).
    pub const HALVING_INTERVAL: u32 = 1_051_200;

    /// Subsidy is zero from this many halvings on.
    pub const MAX_HALVINGS: u32 = 64;

    /// Blocks a coinbase output must wait before it can be spent.
    pub const COINBASE_MATURITY: u32 = 100;

    /// Reorganizations deeper than this are refused; older blocks are final.
    pub const MAX_REORG_DEPTH: u32 = 100;

    /// Maximum total signature-verification cost per block (one unit per
    /// `CHECK_SIG_PQ`).
    pub const MAX_SIGOP_COST: u32 = 80_000;

    /// Blocks per proof-of-work epoch.
    pub const EPOCH_LENGTH: u32 = 2_048;

    /// Epoch key lag: the key block sits this far before the epoch boundary.
    pub const EPOCH_LAG: u32 = 64;

    /// Easiest permitted target in compact form (~half of hashes pass).
    pub const MAX_TARGET_BITS: u32 = 0x207f_ffff;

    /// Block header version produced and accepted.
    pub const HEADER_VERSION: u32 = 1;

    /// Transaction versions accepted by validation.
    pub const SUPPORTED_TX_VERSIONS: &[u32] = &[1];

    /// Coinbase unlock script length bounds.
    pub const COINBASE_SCRIPT_MIN: usize = 2;
    pub const COINBASE_SCRIPT_MAX: usize = 100;

    /// Maximum encoded block size in bytes.
    pub const MAX_BLOCK_BYTES: usize = qbit_core::limits::MAX_BLOCK_BYTES;

    /// Maximum encoded transaction size in bytes.
    pub const MAX_TX_BYTES: usize = qbit_core::limits::MAX_TX_BYTES;
}
