//! Transaction pool implementation.

use crate::{FeeOrdering, MempoolError, MempoolResult};
use crate::{DEFAULT_MAX_SIZE, DEFAULT_MAX_TXS};
use dashmap::DashMap;
use parking_lot::RwLock;
use qbit_core::{Block, Encodable, Hash, OutPoint, Transaction};
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument, warn};

/// Mempool configuration.
#[derive(Debug, Clone)]
pub struct MempoolConfig {
    /// Maximum total size in bytes.
    pub max_size: usize,
    /// Maximum number of transactions.
    pub max_transactions: usize,
    /// Minimum fee per byte, in thousandths of a sub-unit.
    pub min_fee_rate_millis: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            max_transactions: DEFAULT_MAX_TXS,
            min_fee_rate_millis: 0,
        }
    }
}

/// A transaction held by the pool, with its admission metadata. The fee is
/// computed by the caller against a chain snapshot at admission time.
#[derive(Debug, Clone)]
pub struct PooledTransaction {
    pub tx: Transaction,
    pub txid: Hash,
    pub fee: u64,
    pub size: usize,
    pub arrival: u64,
}

/// Mempool statistics.
#[derive(Debug, Clone, Default)]
pub struct MempoolStats {
    pub tx_count: usize,
    pub total_size: usize,
}

/// Transaction mempool.
pub struct Mempool {
    config: MempoolConfig,
    /// Transactions by id.
    transactions: DashMap<Hash, PooledTransaction>,
    /// Outpoint to spending transaction, for double-spend detection.
    input_to_tx: DashMap<OutPoint, Hash>,
    /// Fee-rate-ordered view.
    fee_order: RwLock<BTreeSet<FeeOrdering>>,
    total_size: RwLock<usize>,
    arrivals: AtomicU64,
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            transactions: DashMap::new(),
            input_to_tx: DashMap::new(),
            fee_order: RwLock::new(BTreeSet::new()),
            total_size: RwLock::new(0),
            arrivals: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(MempoolConfig::default())
    }

    /// Admit a transaction the caller has already validated against a chain
    /// snapshot. `fee` is the input/output difference observed there.
    #[instrument(skip(self, tx), fields(txid = %tx.txid()))]
    pub fn add(&self, tx: Transaction, fee: u64) -> MempoolResult<Hash> {
        let txid = tx.txid();
        if self.transactions.contains_key(&txid) {
            return Err(MempoolError::AlreadyExists(txid));
        }

        let size = tx.encoded_size();
        let max_tx_size = self.config.max_size / 10;
        if size > max_tx_size {
            return Err(MempoolError::TooLarge {
                size,
                max: max_tx_size,
            });
        }

        let arrival = self.arrivals.fetch_add(1, Ordering::Relaxed);
        let ordering = FeeOrdering::new(txid, fee, size, arrival);
        if ordering.fee_rate_millis() < self.config.min_fee_rate_millis {
            return Err(MempoolError::FeeTooLow {
                fee,
                min: self.config.min_fee_rate_millis * size as u64 / 1000,
            });
        }

        for input in &tx.inputs {
            if let Some(existing) = self.input_to_tx.get(&input.prev) {
                debug!(conflict = %*existing, "rejecting double spend");
                return Err(MempoolError::DoubleSpend(input.prev));
            }
        }

        if self.transactions.len() >= self.config.max_transactions {
            self.evict_lowest();
        }
        while *self.total_size.read() + size > self.config.max_size {
            if !self.evict_lowest() {
                break;
            }
        }

        for input in &tx.inputs {
            self.input_to_tx.insert(input.prev, txid);
        }
        self.fee_order.write().insert(ordering);
        *self.total_size.write() += size;
        self.transactions.insert(
            txid,
            PooledTransaction {
                tx,
                txid,
                fee,
                size,
                arrival,
            },
        );

        debug!(count = self.transactions.len(), "transaction pooled");
        Ok(txid)
    }

    /// Remove a transaction by id.
    pub fn remove(&self, txid: &Hash) -> MempoolResult<PooledTransaction> {
        let (_, pooled) = self
            .transactions
            .remove(txid)
            .ok_or(MempoolError::NotFound(*txid))?;

        for input in &pooled.tx.inputs {
            self.input_to_tx.remove(&input.prev);
        }
        self.fee_order.write().remove(&FeeOrdering::new(
            pooled.txid,
            pooled.fee,
            pooled.size,
            pooled.arrival,
        ));
        *self.total_size.write() -= pooled.size;

        Ok(pooled)
    }

    pub fn get(&self, txid: &Hash) -> Option<PooledTransaction> {
        self.transactions.get(txid).map(|r| r.clone())
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.transactions.contains_key(txid)
    }

    /// True when some pooled transaction already spends the outpoint.
    pub fn is_input_spent(&self, outpoint: &OutPoint) -> bool {
        self.input_to_tx.contains_key(outpoint)
    }

    /// Ordered selection for template building.
    pub fn iter_selection(&self) -> impl Iterator<Item = PooledTransaction> {
        self.select_ordered(usize::MAX).into_iter()
    }

    /// Selection for a block template: descending fee rate, ties by arrival,
    /// with in-pool parents always emitted before their children.
    pub fn select_ordered(&self, limit: usize) -> Vec<PooledTransaction> {
        let order = self.fee_order.read();
        let mut result: Vec<PooledTransaction> = Vec::new();
        let mut emitted: HashSet<Hash> = HashSet::new();

        // Multi-pass: a child blocked on an unemitted parent is skipped and
        // picked up on a later pass once the parent is out.
        loop {
            let mut progressed = false;
            for key in order.iter() {
                if result.len() >= limit {
                    return result;
                }
                if emitted.contains(&key.txid) {
                    continue;
                }
                let Some(pooled) = self.get(&key.txid) else {
                    continue;
                };
                let blocked = pooled.tx.inputs.iter().any(|input| {
                    self.transactions.contains_key(&input.prev.txid)
                        && !emitted.contains(&input.prev.txid)
                });
                if blocked {
                    continue;
                }
                emitted.insert(key.txid);
                result.push(pooled);
                progressed = true;
            }
            if !progressed {
                return result;
            }
        }
    }

    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            tx_count: self.transactions.len(),
            total_size: *self.total_size.read(),
        }
    }

    pub fn clear(&self) {
        self.transactions.clear();
        self.input_to_tx.clear();
        self.fee_order.write().clear();
        *self.total_size.write() = 0;
        info!("mempool cleared");
    }

    /// Handle a main-chain reorganization.
    ///
    /// Transactions confirmed by `connected` blocks leave the pool, as do
    /// pooled transactions conflicting with newly spent outpoints.
    /// Transactions from `disconnected` blocks that are not confirmed on the
    /// new chain are re-admitted when `revalidate` accepts them against the
    /// new tip (returning their fee).
    #[instrument(skip_all, fields(disconnected = disconnected.len(), connected = connected.len()))]
    pub fn reorg_notification<F>(
        &self,
        disconnected: &[Block],
        connected: &[Block],
        revalidate: F,
    ) where
        F: Fn(&Transaction) -> Option<u64>,
    {
        let mut confirmed: HashSet<Hash> = HashSet::new();
        for block in connected {
            for tx in &block.transactions {
                let txid = tx.txid();
                confirmed.insert(txid);
                let _ = self.remove(&txid);

                // Drop pooled conflicts spending the same outpoints.
                for input in &tx.inputs {
                    if let Some(spender) = self.input_to_tx.get(&input.prev).map(|r| *r) {
                        let _ = self.remove(&spender);
                    }
                }
            }
        }

        let mut readded = 0usize;
        for block in disconnected.iter().rev() {
            // Oldest disconnected block first, so parents re-enter before
            // children.
            for tx in &block.transactions {
                if tx.is_coinbase() || confirmed.contains(&tx.txid()) {
                    continue;
                }
                match revalidate(tx) {
                    Some(fee) => {
                        if self.add(tx.clone(), fee).is_ok() {
                            readded += 1;
                        }
                    }
                    None => {
                        debug!(txid = %tx.txid(), "disconnected tx no longer valid");
                    }
                }
            }
        }

        if !disconnected.is_empty() || !connected.is_empty() {
            info!(readded, "mempool updated after reorg");
        }
    }

    fn evict_lowest(&self) -> bool {
        let victim = {
            let order = self.fee_order.read();
            order.iter().next_back().map(|o| o.txid)
        };
        match victim {
            Some(txid) => {
                warn!(%txid, "evicting lowest fee-rate transaction");
                self.remove(&txid).is_ok()
            }
            None => false,
        }
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::with_defaults()
    }
}
