//! Contextual (phase B) block validation.
//!
//! Runs against the parent's chain state through a UTXO lookup. On success it
//! yields a [`ValidatedStateChange`] carrying everything the chain state
//! needs to connect the block atomically: spent coins with their undo data,
//! created coins, and the collected fees.

use crate::error::{CancelFlag, ValidationError, ValidationResult};
use crate::params;
use crate::script::{self, ScriptVm};
use crate::subsidy;
use crate::validation::parse_coinbase_height;
use qbit_core::{tx_sighash, Block, OutPoint, UndoRecord, UtxoEntry};
use std::collections::{HashMap, HashSet};
use tracing::{debug, instrument, warn};

/// Chain context the parent provides for phase B.
#[derive(Debug, Clone, Copy)]
pub struct BlockContext {
    /// Height of the block under validation (parent height + 1).
    pub height: u32,
    /// Target required by the retarget rule, compact form.
    pub expected_target: u32,
    /// Median of the previous 11 block times.
    pub median_time_past: u32,
    /// Wall-clock time at validation.
    pub now: u32,
}

/// A coin consumed by the block, with the data needed to undo the spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpentCoin {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// A coin the block creates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedCoin {
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

/// The outcome of successful phase B validation. Can only be produced by
/// [`ContextualValidator::validate_block`].
#[derive(Debug, Clone)]
pub struct ValidatedStateChange {
    pub height: u32,
    /// Coins consumed, in block input order (coinbase has none).
    pub spent: Vec<SpentCoin>,
    /// Coins created, in block output order (coinbase outputs first).
    /// Includes coins consumed again within the same block.
    pub created: Vec<CreatedCoin>,
    /// Sum of transaction fees collected by the coinbase.
    pub fees: u64,
    /// Signature-operation cost of the executed scripts.
    pub sigop_cost: u32,
}

impl ValidatedStateChange {
    /// Undo record persisted alongside the block: the pre-images of every
    /// spent coin, in block input order.
    pub fn undo_record(&self) -> UndoRecord {
        UndoRecord {
            spent: self.spent.iter().map(|s| s.entry.clone()).collect(),
        }
    }
}

/// Phase B validator.
pub struct ContextualValidator {
    skip_scripts: bool,
}

impl ContextualValidator {
    pub fn new() -> Self {
        Self {
            skip_scripts: false,
        }
    }

    /// Skip script execution. Test-only: lets fixtures spend without real
    /// signatures.
    pub fn without_scripts() -> Self {
        Self { skip_scripts: true }
    }

    /// Validate `block` in the context of its parent chain.
    ///
    /// `utxo_lookup` views the UTXO set as of the parent. Cancellation is
    /// cooperative at transaction boundaries and is not a consensus failure.
    #[instrument(skip_all, fields(height = ctx.height))]
    pub fn validate_block<F>(
        &self,
        block: &Block,
        ctx: &BlockContext,
        utxo_lookup: F,
        cancel: Option<&CancelFlag>,
    ) -> ValidationResult<ValidatedStateChange>
    where
        F: Fn(&OutPoint) -> Option<UtxoEntry>,
    {
        self.check_header(block, ctx)?;

        let coinbase = &block.transactions[0];
        let committed = parse_coinbase_height(&coinbase.inputs[0].unlock_script)
            .ok_or_else(|| ValidationError::CoinbaseMalformed("bad height commitment".into()))?;
        if committed != ctx.height {
            return Err(ValidationError::CoinbaseHeightMismatch {
                committed,
                expected: ctx.height,
            });
        }

        let mut fees: u64 = 0;
        let mut sigop_cost: u32 = 0;
        let mut spent: Vec<SpentCoin> = Vec::new();
        let mut created: Vec<CreatedCoin> = Vec::new();
        let mut spent_in_block: HashSet<OutPoint> = HashSet::new();
        let mut created_in_block: HashMap<OutPoint, UtxoEntry> = HashMap::new();

        // Coinbase outputs enter the created set first, in block order.
        let coinbase_txid = coinbase.txid();
        for (idx, output) in coinbase.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(coinbase_txid, idx as u32);
            let entry = UtxoEntry::new(output.clone(), ctx.height, true);
            created_in_block.insert(outpoint, entry.clone());
            created.push(CreatedCoin { outpoint, entry });
        }

        for tx in &block.transactions[1..] {
            if let Some(flag) = cancel {
                if flag.is_cancelled() {
                    return Err(ValidationError::Cancelled);
                }
            }

            let txid = tx.txid();
            let mut input_total: u64 = 0;

            for (input_index, input) in tx.inputs.iter().enumerate() {
                if !spent_in_block.insert(input.prev) {
                    return Err(ValidationError::DuplicateInput(input.prev));
                }

                let entry = created_in_block
                    .get(&input.prev)
                    .cloned()
                    .or_else(|| utxo_lookup(&input.prev))
                    .ok_or(ValidationError::MissingUtxo(input.prev))?;

                if entry.is_coinbase
                    && ctx.height.saturating_sub(entry.height) < params::COINBASE_MATURITY
                {
                    return Err(ValidationError::CoinbaseImmature {
                        outpoint: input.prev,
                        origin_height: entry.height,
                        spend_height: ctx.height,
                    });
                }

                sigop_cost += script::count_sigops(&input.unlock_script)
                    + script::count_sigops(&entry.output.script);

                if !self.skip_scripts {
                    let digest =
                        tx_sighash(tx, input_index, &entry.output.script, entry.output.amount);
                    ScriptVm::eval_input(&input.unlock_script, &entry.output.script, &digest)
                        .map_err(|error| ValidationError::ScriptFailure { input_index, error })?;
                }

                input_total = input_total
                    .checked_add(entry.output.amount)
                    .ok_or_else(|| ValidationError::TxMalformed("input total overflows".into()))?;

                spent.push(SpentCoin {
                    outpoint: input.prev,
                    entry,
                });
            }

            let output_total = tx
                .output_total()
                .ok_or_else(|| ValidationError::TxMalformed("output total overflows".into()))?;
            if input_total < output_total {
                return Err(ValidationError::InsufficientInputAmount {
                    input_total,
                    output_total,
                });
            }
            fees += input_total - output_total;

            for (idx, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint::new(txid, idx as u32);
                let entry = UtxoEntry::new(output.clone(), ctx.height, false);
                created_in_block.insert(outpoint, entry.clone());
                created.push(CreatedCoin { outpoint, entry });
            }
        }

        if sigop_cost > params::MAX_SIGOP_COST {
            return Err(ValidationError::TooManySigops {
                cost: sigop_cost,
                max: params::MAX_SIGOP_COST,
            });
        }

        // The coinbase may claim at most subsidy plus collected fees; any
        // excess is a consensus violation, not a silent burn.
        let claimed = coinbase
            .output_total()
            .ok_or_else(|| ValidationError::TxMalformed("coinbase total overflows".into()))?;
        let allowed = subsidy(ctx.height) + fees;
        if claimed > allowed {
            warn!(height = ctx.height, claimed, allowed, "coinbase overclaim");
            return Err(ValidationError::CoinbaseOverclaim { claimed, allowed });
        }

        debug!(
            height = ctx.height,
            spent = spent.len(),
            created = created.len(),
            fees,
            sigop_cost,
            "block validated"
        );

        Ok(ValidatedStateChange {
            height: ctx.height,
            spent,
            created,
            fees,
            sigop_cost,
        })
    }

    fn check_header(&self, block: &Block, ctx: &BlockContext) -> ValidationResult<()> {
        if block.header.target != ctx.expected_target {
            return Err(ValidationError::WrongTarget {
                got: block.header.target,
                expected: ctx.expected_target,
            });
        }

        let upper = ctx.now.saturating_add(params::MAX_FUTURE_DRIFT_SECS);
        if block.header.time <= ctx.median_time_past || block.header.time > upper {
            return Err(ValidationError::BadTimestamp {
                time: block.header.time,
                lower: ctx.median_time_past,
                upper,
            });
        }

        Ok(())
    }
}

impl Default for ContextualValidator {
    fn default() -> Self {
        Self::new()
    }
}
