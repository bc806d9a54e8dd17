//! Block template construction and solved-block submission.

use crate::{build_coinbase, MiningError, MiningResult};
use parking_lot::RwLock;
use qbit_consensus::{params, script, subsidy};
use qbit_core::{
    compact_to_target, merkle_root, Block, BlockHeader, Encodable, Hash, Transaction,
};
use qbit_mempool::Mempool;
use qbit_state::{BlockAcceptance, ChainState, Clock, StateError};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// A candidate block for external miners.
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub height: u32,
    pub prev_hash: Hash,
    /// Required compact target.
    pub target: u32,
    /// Template timestamp: `max(now, median-time-past + 1)`.
    pub time: u32,
    /// Transaction ids in template order, coinbase first.
    pub merkle_basis: Vec<Hash>,
    pub coinbase: Transaction,
    /// Selected mempool transactions, dependency-ordered.
    pub transactions: Vec<Transaction>,
    pub total_fees: u64,
}

impl BlockTemplate {
    /// Assemble the block for a nonce choice.
    pub fn assemble(&self, nonce: u64) -> Block {
        let mut transactions = Vec::with_capacity(self.transactions.len() + 1);
        transactions.push(self.coinbase.clone());
        transactions.extend(self.transactions.iter().cloned());
        Block {
            header: BlockHeader {
                version: params::HEADER_VERSION,
                prev_block: self.prev_hash,
                merkle_root: merkle_root(&self.merkle_basis),
                time: self.time,
                target: self.target,
                nonce,
            },
            transactions,
        }
    }
}

/// Outcome of `submit_block`.
#[derive(Debug)]
pub enum SubmissionResult {
    Accepted(BlockAcceptance),
    Rejected(StateError),
}

impl SubmissionResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmissionResult::Accepted(_))
    }
}

/// Builds templates from the chain tip and the mempool selection, and routes
/// solved blocks back into validation.
pub struct TemplateBuilder {
    chain: Arc<ChainState>,
    mempool: Arc<Mempool>,
    clock: Arc<dyn Clock>,
    /// Cached template, invalidated when the tip moves.
    cached: RwLock<Option<BlockTemplate>>,
}

impl TemplateBuilder {
    pub fn new(chain: Arc<ChainState>, mempool: Arc<Mempool>, clock: Arc<dyn Clock>) -> Self {
        Self {
            chain,
            mempool,
            clock,
            cached: RwLock::new(None),
        }
    }

    /// Build a template paying the coinbase to `destination_script`.
    #[instrument(skip_all)]
    pub fn get_block_template(
        &self,
        destination_script: &[u8],
        extra_nonce: u32,
    ) -> MiningResult<BlockTemplate> {
        let (prev_hash, tip_height) = self.chain.tip();
        let height = tip_height + 1;
        let target = self.chain.next_target();
        let time = self
            .clock
            .now()
            .max(self.chain.tip_median_time_past() + 1);

        let (transactions, total_fees) = self.select_transactions();

        let reward = subsidy(height) + total_fees;
        let coinbase = build_coinbase(height, reward, destination_script, extra_nonce)?;

        let mut merkle_basis = Vec::with_capacity(transactions.len() + 1);
        merkle_basis.push(coinbase.txid());
        merkle_basis.extend(transactions.iter().map(|tx| tx.txid()));

        let template = BlockTemplate {
            height,
            prev_hash,
            target,
            time,
            merkle_basis,
            coinbase,
            transactions,
            total_fees,
        };

        info!(
            height,
            txs = template.transactions.len(),
            reward,
            target,
            "built block template"
        );
        *self.cached.write() = Some(template.clone());
        Ok(template)
    }

    /// Cached template if it still extends the current tip, else a fresh
    /// one.
    pub fn get_or_refresh(
        &self,
        destination_script: &[u8],
        extra_nonce: u32,
    ) -> MiningResult<BlockTemplate> {
        let (tip, _) = self.chain.tip();
        if let Some(cached) = self.cached.read().clone() {
            if cached.prev_hash == tip {
                debug!("serving cached template");
                return Ok(cached);
            }
        }
        self.get_block_template(destination_script, extra_nonce)
    }

    /// Run full validation on a solved block and activate the best chain.
    pub fn submit_block(&self, block: Block) -> SubmissionResult {
        match self.chain.receive_block(&block) {
            Ok(acceptance) => {
                *self.cached.write() = None;
                SubmissionResult::Accepted(acceptance)
            }
            Err(err) => {
                warn!(%err, "submitted block rejected");
                SubmissionResult::Rejected(err)
            }
        }
    }

    /// Grind nonces against the template's target. Intended for regtest,
    /// where a solution is a few attempts away; production mining is an
    /// external worker.
    pub fn solve(&self, template: &BlockTemplate, max_attempts: u64) -> MiningResult<Block> {
        let target = compact_to_target(template.target)
            .ok_or_else(|| MiningError::BadTemplate("target not canonical".into()))?;
        let epoch_key = self.chain.next_epoch_key();

        let mut block = template.assemble(0);
        for nonce in 0..max_attempts {
            block.header.nonce = nonce;
            if self
                .chain
                .pow()
                .check(&epoch_key, &block.header.encode(), &target)
            {
                return Ok(block);
            }
        }
        Err(MiningError::Unsolved(max_attempts))
    }

    /// Greedy fee-rate selection under the block-size and sigop caps.
    fn select_transactions(&self) -> (Vec<Transaction>, u64) {
        // Leave generous headroom for the header and coinbase.
        let budget = params::MAX_BLOCK_BYTES - 16 * 1024;
        let mut used_bytes = 0usize;
        let mut used_sigops = 0u32;
        let mut total_fees = 0u64;
        let mut selected = Vec::new();
        let mut skipped: std::collections::HashSet<Hash> = std::collections::HashSet::new();

        for pooled in self.mempool.iter_selection() {
            // Never include a child whose in-template parent was skipped for
            // weight; the block would be invalid.
            let orphaned = pooled
                .tx
                .inputs
                .iter()
                .any(|input| skipped.contains(&input.prev.txid));
            let sigops: u32 = pooled
                .tx
                .inputs
                .iter()
                .map(|i| script::count_sigops(&i.unlock_script))
                .sum::<u32>()
                + pooled
                    .tx
                    .outputs
                    .iter()
                    .map(|o| script::count_sigops(&o.script))
                    .sum::<u32>();

            if orphaned
                || used_bytes + pooled.size > budget
                || used_sigops + sigops > params::MAX_SIGOP_COST
            {
                skipped.insert(pooled.txid);
                continue;
            }

            used_bytes += pooled.size;
            used_sigops += sigops;
            total_fees += pooled.fee;
            selected.push(pooled.tx);
        }

        (selected, total_fees)
    }
}
