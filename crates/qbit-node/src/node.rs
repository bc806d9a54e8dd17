//! Node wiring.

use crate::NodeConfig;
use qbit_consensus::{params, validate_tx_stateless, ScriptVm, ValidationError};
use qbit_core::{Decodable, Hash, OutPoint, Transaction, TxOutput, UtxoEntry};
use qbit_core::{tx_sighash, Block, BlockHeader};
use qbit_mempool::{Mempool, MempoolError};
use qbit_mining::{BlockTemplate, MiningError, SubmissionResult, TemplateBuilder};
use qbit_state::{
    BlockAcceptance, ChainOptions, ChainState, Clock, ReorgSink, StateError, SystemClock,
    UtxoSnapshot,
};
use qbit_storage::{Database, Storage};
use std::sync::{Arc, Weak};
use thiserror::Error;
use tracing::{info, instrument};

/// Errors surfaced by the node's entry points.
#[derive(Error, Debug)]
pub enum NodeError {
    /// Message bytes could not be decoded. Do not re-request from the same
    /// peer.
    #[error("malformed encoding: {0}")]
    Codec(#[from] qbit_core::CodecError),

    /// Chain-state failure (validation, orphan, reorg depth, storage).
    #[error(transparent)]
    State(#[from] StateError),

    /// Mempool admission failure.
    #[error(transparent)]
    Mempool(#[from] MempoolError),

    /// Transaction rejected before reaching the mempool.
    #[error("transaction invalid: {0}")]
    TxInvalid(#[from] ValidationError),

    /// Mining subsystem failure.
    #[error(transparent)]
    Mining(#[from] MiningError),
}

/// A snapshot of the node's externally visible state.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub network: String,
    pub tip: Hash,
    pub height: u32,
    pub mempool_txs: usize,
}

/// The node core: storage, chain state, mempool and template builder behind
/// one owner. The P2P and RPC layers hold an `Arc<Node>` and call in.
pub struct Node {
    config: NodeConfig,
    chain: Arc<ChainState>,
    mempool: Arc<Mempool>,
    templates: TemplateBuilder,
}

impl Node {
    /// Open a node over the durable database in `config.data_dir`.
    pub fn open(config: NodeConfig) -> Result<Self, NodeError> {
        let storage = Arc::new(Database::open(&config.data_dir).map_err(StateError::Storage)?);
        Self::open_with(config, storage, Arc::new(SystemClock))
    }

    /// Open a node over explicit storage and clock. Tests use this with the
    /// in-memory backend and a manual clock.
    pub fn open_with(
        config: NodeConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, NodeError> {
        let chain = Arc::new(ChainState::open_with_options(
            storage,
            config.chain_params(),
            Arc::clone(&clock),
            ChainOptions {
                utxo_cache_capacity: config.storage.utxo_cache_capacity,
                verify_scripts: true,
            },
        )?);
        let mempool = Arc::new(Mempool::with_defaults());

        chain.register_sink(Arc::new(MempoolSink {
            mempool: Arc::clone(&mempool),
            chain: Arc::downgrade(&chain),
        }));

        let templates =
            TemplateBuilder::new(Arc::clone(&chain), Arc::clone(&mempool), clock);

        let (tip, height) = chain.tip();
        info!(
            node = config.node_name,
            network = config.network,
            %tip,
            height,
            "node opened"
        );

        Ok(Self {
            config,
            chain,
            mempool,
            templates,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<ChainState> {
        &self.chain
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn templates(&self) -> &TemplateBuilder {
        &self.templates
    }

    pub fn status(&self) -> NodeStatus {
        let (tip, height) = self.chain.tip();
        NodeStatus {
            network: self.config.network.clone(),
            tip,
            height,
            mempool_txs: self.mempool.stats().tx_count,
        }
    }

    // ---- wire entry points ----

    /// Accept a raw header from the network.
    pub fn receive_header(&self, bytes: &[u8]) -> Result<Hash, NodeError> {
        let header = BlockHeader::decode(bytes)?;
        Ok(self.chain.receive_header(&header)?)
    }

    /// Accept a raw block from the network.
    #[instrument(skip_all)]
    pub fn receive_block(&self, bytes: &[u8]) -> Result<BlockAcceptance, NodeError> {
        let block = Block::decode(bytes)?;
        Ok(self.chain.receive_block(&block)?)
    }

    /// Validate a transaction against the current tip and admit it to the
    /// mempool.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<Hash, NodeError> {
        let snapshot = self.chain.utxo_snapshot();
        let spend_height = self.chain.height() + 1;
        let fee = validate_for_mempool(&snapshot, self.mempool.as_ref(), spend_height, &tx)?;
        Ok(self.mempool.add(tx, fee)?)
    }

    /// Build a block template paying `destination_script`.
    pub fn get_block_template(
        &self,
        destination_script: &[u8],
        extra_nonce: u32,
    ) -> Result<BlockTemplate, NodeError> {
        Ok(self
            .templates
            .get_block_template(destination_script, extra_nonce)?)
    }

    /// Accept a raw solved block from a miner.
    pub fn submit_block(&self, bytes: &[u8]) -> Result<SubmissionResult, NodeError> {
        let block = Block::decode(bytes)?;
        Ok(self.templates.submit_block(block))
    }
}

/// Validate a transaction for mempool admission against a chain snapshot,
/// resolving missing prevouts from pooled parents. Returns the fee.
fn validate_for_mempool(
    snapshot: &UtxoSnapshot,
    mempool: &Mempool,
    spend_height: u32,
    tx: &Transaction,
) -> Result<u64, NodeError> {
    // Rejects coinbase shapes too: the sentinel prevout is only legal as the
    // first transaction of a block.
    validate_tx_stateless(tx, false)?;

    let mut input_total: u64 = 0;
    for (input_index, input) in tx.inputs.iter().enumerate() {
        if mempool.is_input_spent(&input.prev) {
            return Err(NodeError::Mempool(MempoolError::DoubleSpend(input.prev)));
        }

        let entry = resolve_prevout(snapshot, mempool, &input.prev)?
            .ok_or(NodeError::TxInvalid(ValidationError::MissingUtxo(input.prev)))?;

        if entry.is_coinbase
            && spend_height.saturating_sub(entry.height) < params::COINBASE_MATURITY
        {
            return Err(NodeError::TxInvalid(ValidationError::CoinbaseImmature {
                outpoint: input.prev,
                origin_height: entry.height,
                spend_height,
            }));
        }

        let digest = tx_sighash(tx, input_index, &entry.output.script, entry.output.amount);
        ScriptVm::eval_input(&input.unlock_script, &entry.output.script, &digest).map_err(
            |error| NodeError::TxInvalid(ValidationError::ScriptFailure { input_index, error }),
        )?;

        input_total = input_total
            .checked_add(entry.output.amount)
            .ok_or_else(|| {
                NodeError::TxInvalid(ValidationError::TxMalformed("input total overflows".into()))
            })?;
    }

    let output_total = tx.output_total().ok_or_else(|| {
        NodeError::TxInvalid(ValidationError::TxMalformed("output total overflows".into()))
    })?;
    if input_total < output_total {
        return Err(NodeError::TxInvalid(
            ValidationError::InsufficientInputAmount {
                input_total,
                output_total,
            },
        ));
    }

    Ok(input_total - output_total)
}

/// Resolve a prevout from the snapshot, or from an in-pool parent when the
/// chain does not know it yet.
fn resolve_prevout(
    snapshot: &UtxoSnapshot,
    mempool: &Mempool,
    outpoint: &OutPoint,
) -> Result<Option<UtxoEntry>, NodeError> {
    if let Some(entry) = snapshot.get(outpoint)? {
        return Ok(Some(entry));
    }
    if let Some(parent) = mempool.get(&outpoint.txid) {
        if let Some(output) = parent.tx.outputs.get(outpoint.index as usize) {
            let output = TxOutput::new(output.amount, output.script.clone());
            // Unconfirmed parent: treat as created at the next height.
            return Ok(Some(UtxoEntry::new(output, u32::MAX, false)));
        }
    }
    Ok(None)
}

/// Bridges chain reorg events into the mempool: re-adds transactions from
/// disconnected blocks that still validate under the new tip, drops the ones
/// the new chain confirmed.
struct MempoolSink {
    mempool: Arc<Mempool>,
    chain: Weak<ChainState>,
}

impl ReorgSink for MempoolSink {
    fn reorg_notification(&self, disconnected: &[Block], connected: &[Block]) {
        let Some(chain) = self.chain.upgrade() else {
            return;
        };
        let snapshot = chain.utxo_snapshot();
        let spend_height = chain.height() + 1;
        self.mempool
            .reorg_notification(disconnected, connected, |tx| {
                validate_for_mempool(&snapshot, self.mempool.as_ref(), spend_height, tx).ok()
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbit_storage::MemoryStorage;
    use qbit_state::ManualClock;

    fn test_node() -> Node {
        let config = NodeConfig::default_for_network("regtest");
        Node::open_with(
            config,
            Arc::new(MemoryStorage::new()),
            Arc::new(ManualClock::new(1_700_001_000)),
        )
        .unwrap()
    }

    #[test]
    fn test_open_initializes_genesis() {
        let node = test_node();
        let status = node.status();
        assert_eq!(status.height, 0);
        assert_eq!(status.network, "regtest");
        assert_eq!(status.mempool_txs, 0);
    }

    #[test]
    fn test_receive_block_rejects_garbage() {
        let node = test_node();
        assert!(matches!(
            node.receive_block(&[0xDE, 0xAD, 0xBE, 0xEF]),
            Err(NodeError::Codec(_))
        ));
    }

    #[test]
    fn test_receive_header_rejects_garbage() {
        let node = test_node();
        assert!(matches!(
            node.receive_header(&[1, 2, 3]),
            Err(NodeError::Codec(_))
        ));
    }

    #[test]
    fn test_submit_coinbase_rejected() {
        let node = test_node();
        let coinbase = qbit_mining::build_coinbase(1, 10, &[0x51], 0).unwrap();
        assert!(matches!(
            node.submit_transaction(coinbase),
            Err(NodeError::TxInvalid(_))
        ));
    }

    #[test]
    fn test_submit_transaction_with_unknown_input_rejected() {
        let node = test_node();
        let tx = Transaction {
            version: 1,
            inputs: vec![qbit_core::TxInput::new(
                OutPoint::new(qbit_core::hash_tagged(qbit_core::tags::TX, b"nope"), 0),
                vec![],
            )],
            outputs: vec![TxOutput::new(1, vec![0x51])],
            lock_time: 0,
        };
        assert!(matches!(
            node.submit_transaction(tx),
            Err(NodeError::TxInvalid(ValidationError::MissingUtxo(_)))
        ));
    }
}
