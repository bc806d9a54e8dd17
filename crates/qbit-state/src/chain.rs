//! Chain state machine.
//!
//! Owns the block index (a DAG rooted at genesis), the main-chain pointer
//! and the activation logic: whenever a fully-validated branch with more
//! total work than the current tip exists, the chain disconnects back to the
//! common ancestor and connects forward, block by block, each step one
//! atomic write group. Blocks that fail validation are marked `Failed`
//! permanently, together with every descendant.
//!
//! Index entry lifecycle:
//!
//! ```text
//! Header-Known ──body arrives──▶ Body-Known ──phase-B passes──▶ Validated
//!                                    │                            │
//!                                    │                            ├──activated──▶ In-Main-Chain
//!                                    └──phase-B fails─────────────┴──▶ Failed (terminal)
//! ```

use crate::block_store::BlockStore;
use crate::clock::Clock;
use crate::utxo::UtxoStore;
use crate::{StateError, StateResult};
use num_bigint::BigUint;
use parking_lot::RwLock;
use qbit_consensus::{
    params, validate_block_stateless, BlockContext, CancelFlag, ChainParams, ContextualValidator,
    DifficultyEngine, HeaderTiming, PowEngine, ValidationError, median_time_past,
};
use qbit_core::{
    compact_to_target, work_for_target, Block, BlockHeader, Decodable, Encodable, Hash, Reader,
};
use qbit_storage::{meta_keys, ColumnFamily, Storage, WriteBatch, SCHEMA_VERSION};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Validation status of a block-index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Header accepted; body not yet seen.
    HeaderKnown,
    /// Body stored; contextual validation pending.
    BodyKnown,
    /// Fully validated, not currently on the main chain.
    Validated,
    /// Connected to the main chain.
    InMainChain,
    /// Failed validation. Terminal; descendants are unreachable.
    Failed,
}

impl BlockStatus {
    fn to_u8(self) -> u8 {
        match self {
            BlockStatus::HeaderKnown => 0,
            BlockStatus::BodyKnown => 1,
            BlockStatus::Validated => 2,
            BlockStatus::InMainChain => 3,
            BlockStatus::Failed => 4,
        }
    }

    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BlockStatus::HeaderKnown,
            1 => BlockStatus::BodyKnown,
            2 => BlockStatus::Validated,
            3 => BlockStatus::InMainChain,
            4 => BlockStatus::Failed,
            _ => return None,
        })
    }

    /// True when the body is available for connecting.
    fn body_available(self) -> bool {
        matches!(
            self,
            BlockStatus::BodyKnown | BlockStatus::Validated | BlockStatus::InMainChain
        )
    }
}

/// One entry of the block index.
#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    pub height: u32,
    pub header: BlockHeader,
    pub status: BlockStatus,
    /// Cumulative expected hashes along the ancestor path.
    pub total_work: BigUint,
    pub parent: Hash,
    /// Arrival order, used to break total-work ties (earliest wins).
    pub seq: u64,
}

impl BlockIndexEntry {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(160);
        out.extend_from_slice(&self.height.to_le_bytes());
        out.push(self.status.to_u8());
        out.extend_from_slice(&self.seq.to_le_bytes());
        out.extend_from_slice(self.parent.as_bytes());
        self.header.encode_into(&mut out);
        let work = self.total_work.to_bytes_be();
        out.extend_from_slice(&(work.len() as u16).to_le_bytes());
        out.extend_from_slice(&work);
        out
    }

    fn decode(hash: Hash, bytes: &[u8]) -> StateResult<Self> {
        let mut r = Reader::new(bytes);
        let height = r.read_u32()?;
        let status = BlockStatus::from_u8(r.read_u8()?)
            .ok_or_else(|| StateError::Corruption("bad status byte in index".into()))?;
        let seq = r.read_u64()?;
        let parent = Hash::from_slice(r.read_bytes(32)?)
            .ok_or_else(|| StateError::Corruption("bad parent hash in index".into()))?;
        let header = BlockHeader::decode_from(&mut r)?;
        let work_len = r.read_u16()? as usize;
        let total_work = BigUint::from_bytes_be(r.read_bytes(work_len)?);
        Ok(Self {
            hash,
            height,
            header,
            status,
            total_work,
            parent,
            seq,
        })
    }
}

/// Outcome of `receive_block`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockAcceptance {
    /// The block extended the main chain.
    Extended { tip: Hash, height: u32 },
    /// The block triggered a reorganization.
    Reorganized {
        disconnected: u32,
        connected: u32,
        tip: Hash,
        height: u32,
    },
    /// Accepted onto a side chain; the main chain is unchanged.
    SideChain { hash: Hash },
    /// Already known.
    Duplicate { hash: Hash },
}

/// Receiver of reorg events: the mempool re-adds transactions from
/// disconnected blocks and drops the ones confirmed by connected blocks.
pub trait ReorgSink: Send + Sync {
    fn reorg_notification(&self, disconnected: &[Block], connected: &[Block]);
}

/// Options for opening a chain state.
#[derive(Clone)]
pub struct ChainOptions {
    pub utxo_cache_capacity: usize,
    /// Disable script execution during phase B. Test fixtures only.
    pub verify_scripts: bool,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            utxo_cache_capacity: crate::utxo::DEFAULT_UTXO_CACHE_CAPACITY,
            verify_scripts: true,
        }
    }
}

struct ChainInner {
    index: HashMap<Hash, BlockIndexEntry>,
    /// Main chain hashes indexed by height.
    main_chain: Vec<Hash>,
    next_seq: u64,
}

/// What one activation pass did.
struct ActivationOutcome {
    disconnected: Vec<Block>,
    connected: Vec<Block>,
    failures: Vec<(Hash, ValidationError)>,
}

/// The chain state. One value per node; tests construct as many isolated
/// instances as they need.
pub struct ChainState {
    chain_params: ChainParams,
    storage: Arc<dyn Storage>,
    utxo: UtxoStore,
    blocks: BlockStore,
    pow: PowEngine,
    difficulty: DifficultyEngine,
    validator: ContextualValidator,
    clock: Arc<dyn Clock>,
    inner: RwLock<ChainInner>,
    sinks: RwLock<Vec<Arc<dyn ReorgSink>>>,
    cancel: CancelFlag,
    genesis_hash: Hash,
}

impl ChainState {
    /// Open the chain state over `storage`, initializing genesis on first
    /// run and recovering from the stored tip otherwise.
    pub fn open(
        storage: Arc<dyn Storage>,
        chain_params: ChainParams,
        clock: Arc<dyn Clock>,
    ) -> StateResult<Self> {
        Self::open_with_options(storage, chain_params, clock, ChainOptions::default())
    }

    pub fn open_with_options(
        storage: Arc<dyn Storage>,
        chain_params: ChainParams,
        clock: Arc<dyn Clock>,
        options: ChainOptions,
    ) -> StateResult<Self> {
        let pow = PowEngine::default();
        let difficulty = DifficultyEngine::new(&chain_params);
        let genesis = chain_params.genesis();
        let genesis_hash = pow.block_hash(&Hash::ZERO, &genesis.header.encode());

        let validator = if options.verify_scripts {
            ContextualValidator::new()
        } else {
            ContextualValidator::without_scripts()
        };

        let state = Self {
            chain_params,
            utxo: UtxoStore::new(Arc::clone(&storage), options.utxo_cache_capacity),
            blocks: BlockStore::new(Arc::clone(&storage)),
            storage,
            pow,
            difficulty,
            validator,
            clock,
            inner: RwLock::new(ChainInner {
                index: HashMap::new(),
                main_chain: Vec::new(),
                next_seq: 0,
            }),
            sinks: RwLock::new(Vec::new()),
            cancel: CancelFlag::new(),
            genesis_hash,
        };

        if state.storage.get(ColumnFamily::Metadata, meta_keys::TIP)?.is_some() {
            state.load_from_storage()?;
        } else {
            state.init_genesis(&genesis)?;
        }

        Ok(state)
    }

    fn init_genesis(&self, genesis: &Block) -> StateResult<()> {
        let target = compact_to_target(genesis.header.target)
            .ok_or_else(|| StateError::Corruption("genesis target not canonical".into()))?;
        let entry = BlockIndexEntry {
            hash: self.genesis_hash,
            height: 0,
            header: genesis.header,
            status: BlockStatus::InMainChain,
            total_work: work_for_target(&target),
            parent: Hash::ZERO,
            seq: 0,
        };

        let mut batch = WriteBatch::new();
        self.blocks.stage_put_block(&mut batch, &self.genesis_hash, genesis);
        self.blocks.stage_set_main(&mut batch, 0, &self.genesis_hash);
        batch.put(ColumnFamily::Index, index_key(&self.genesis_hash), entry.encode());
        batch.put(ColumnFamily::Metadata, meta_keys::TIP.to_vec(), self.genesis_hash.to_vec());
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TIP_HEIGHT.to_vec(),
            0u32.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::UTXO_HEIGHT.to_vec(),
            0u32.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TOTAL_WORK.to_vec(),
            entry.total_work.to_bytes_be(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::SCHEMA_VERSION.to_vec(),
            SCHEMA_VERSION.to_le_bytes().to_vec(),
        );
        self.storage.write_batch(batch)?;

        let mut inner = self.inner.write();
        inner.main_chain.push(self.genesis_hash);
        inner.index.insert(self.genesis_hash, entry);
        inner.next_seq = 1;

        info!(genesis = %self.genesis_hash, network = self.chain_params.network.name(), "chain initialized");
        Ok(())
    }

    /// Recovery rule: the tip, the main index and the UTXO height must agree.
    /// Write groups are atomic, so any disagreement is corruption, not a
    /// partial batch.
    fn load_from_storage(&self) -> StateResult<()> {
        let schema = self
            .storage
            .get(ColumnFamily::Metadata, meta_keys::SCHEMA_VERSION)?
            .and_then(|b| b.try_into().ok().map(u32::from_le_bytes))
            .ok_or_else(|| StateError::Corruption("missing schema version".into()))?;
        if schema != SCHEMA_VERSION {
            return Err(StateError::Corruption(format!(
                "schema version {schema}, expected {SCHEMA_VERSION}"
            )));
        }

        let tip = self
            .storage
            .get(ColumnFamily::Metadata, meta_keys::TIP)?
            .and_then(|b| Hash::from_slice(&b))
            .ok_or_else(|| StateError::Corruption("missing tip".into()))?;
        let tip_height = self
            .storage
            .get(ColumnFamily::Metadata, meta_keys::TIP_HEIGHT)?
            .and_then(|b| b.try_into().ok().map(u32::from_le_bytes))
            .ok_or_else(|| StateError::Corruption("missing tip height".into()))?;
        let utxo_height = self
            .storage
            .get(ColumnFamily::Metadata, meta_keys::UTXO_HEIGHT)?
            .and_then(|b| b.try_into().ok().map(u32::from_le_bytes))
            .ok_or_else(|| StateError::Corruption("missing utxo height".into()))?;

        if utxo_height != tip_height {
            return Err(StateError::Corruption(format!(
                "UTXO set at height {utxo_height} but tip at {tip_height}"
            )));
        }

        let mut index = HashMap::new();
        let mut next_seq = 1u64;
        for (key, value) in self.storage.iter(ColumnFamily::Index)? {
            if key.len() != 33 || key[0] != b'h' {
                return Err(StateError::Corruption("bad index key".into()));
            }
            let hash = Hash::from_slice(&key[1..])
                .ok_or_else(|| StateError::Corruption("bad index key hash".into()))?;
            let entry = BlockIndexEntry::decode(hash, &value)?;
            next_seq = next_seq.max(entry.seq + 1);
            index.insert(hash, entry);
        }

        let mut main_chain = Vec::with_capacity(tip_height as usize + 1);
        for height in 0..=tip_height {
            let hash = self.blocks.main_hash_at(height)?.ok_or_else(|| {
                StateError::Corruption(format!("main index missing height {height}"))
            })?;
            if !index.contains_key(&hash) {
                return Err(StateError::Corruption(format!(
                    "main-chain block {hash} absent from index"
                )));
            }
            main_chain.push(hash);
        }
        if *main_chain.last().unwrap() != tip {
            return Err(StateError::Corruption("main index disagrees with tip".into()));
        }

        let mut inner = self.inner.write();
        inner.index = index;
        inner.main_chain = main_chain;
        inner.next_seq = next_seq;

        info!(%tip, tip_height, "chain state recovered");
        Ok(())
    }

    // ---- accessors ----

    pub fn chain_params(&self) -> &ChainParams {
        &self.chain_params
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Current main-chain tip.
    pub fn tip(&self) -> (Hash, u32) {
        let inner = self.inner.read();
        let hash = *inner.main_chain.last().expect("main chain never empty");
        (hash, (inner.main_chain.len() - 1) as u32)
    }

    pub fn height(&self) -> u32 {
        self.tip().1
    }

    pub fn total_work(&self) -> BigUint {
        let inner = self.inner.read();
        let tip = inner.main_chain.last().unwrap();
        inner.index[tip].total_work.clone()
    }

    pub fn entry(&self, hash: &Hash) -> Option<BlockIndexEntry> {
        self.inner.read().index.get(hash).cloned()
    }

    pub fn status_of(&self, hash: &Hash) -> Option<BlockStatus> {
        self.inner.read().index.get(hash).map(|e| e.status)
    }

    pub fn get_block(&self, hash: &Hash) -> StateResult<Option<Block>> {
        self.blocks.get_block(hash)
    }

    /// Main-chain block at a height.
    pub fn block_at(&self, height: u32) -> StateResult<Option<Block>> {
        match self.blocks.main_hash_at(height)? {
            Some(hash) => self.blocks.get_block(&hash),
            None => Ok(None),
        }
    }

    pub fn main_hash_at(&self, height: u32) -> Option<Hash> {
        let inner = self.inner.read();
        inner.main_chain.get(height as usize).copied()
    }

    pub fn utxo(&self) -> &UtxoStore {
        &self.utxo
    }

    /// Read-only isolated UTXO view for long-running readers.
    pub fn utxo_snapshot(&self) -> crate::UtxoSnapshot {
        self.utxo.snapshot()
    }

    pub fn register_sink(&self, sink: Arc<dyn ReorgSink>) {
        self.sinks.write().push(sink);
    }

    /// Flag that cancels an in-progress validation at the next transaction
    /// boundary.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Compact target required for a block extending the current tip.
    pub fn next_target(&self) -> u32 {
        let inner = self.inner.read();
        let tip = *inner.main_chain.last().unwrap();
        self.next_target_for_child(&inner, &tip)
    }

    /// Median time past of the current tip; a new block's time must exceed
    /// it.
    pub fn tip_median_time_past(&self) -> u32 {
        let inner = self.inner.read();
        let tip = *inner.main_chain.last().unwrap();
        self.median_time_past_at(&inner, &tip)
    }

    /// Epoch key for a block at the next height.
    pub fn next_epoch_key(&self) -> Hash {
        let inner = self.inner.read();
        let tip = *inner.main_chain.last().unwrap();
        let height = inner.main_chain.len() as u32;
        let key_height = PowEngine::epoch_key_height(height);
        self.ancestor_hash(&inner, &tip, key_height)
            .expect("epoch key ancestor below tip always exists")
    }

    pub fn pow(&self) -> &PowEngine {
        &self.pow
    }

    // ---- ingest ----

    /// Accept a header: resolve its parent, verify the header-only rules
    /// (target, PoW, timestamp window) and add it to the index.
    pub fn receive_header(&self, header: &BlockHeader) -> StateResult<Hash> {
        let mut inner = self.inner.write();
        self.receive_header_inner(&mut inner, header)
    }

    /// Accept a full block: header rules, phase A, body storage, then best-
    /// chain activation.
    #[instrument(skip_all)]
    pub fn receive_block(&self, block: &Block) -> StateResult<BlockAcceptance> {
        let (tip_before, outcome, hash) = {
            let mut inner = self.inner.write();
            let tip_before = *inner.main_chain.last().unwrap();

            let hash = self.receive_header_inner(&mut inner, &block.header)?;
            let status = inner.index[&hash].status;
            if status == BlockStatus::Failed {
                return Err(StateError::KnownInvalid(hash));
            }

            if status == BlockStatus::HeaderKnown {
                if let Err(err) = validate_block_stateless(block) {
                    self.mark_failed_subtree(&mut inner, &hash);
                    return Err(StateError::Validation(err));
                }
                self.blocks.put_block(&hash, block)?;
                self.set_status(&mut inner, &hash, BlockStatus::BodyKnown)?;
            }

            let outcome = self.activate(&mut inner)?;
            (tip_before, outcome, hash)
        };

        self.notify_sinks(&outcome);

        // Surface a phase-B failure of the submitted block (or of an
        // ancestor it depended on) to the caller.
        if let Some((_, err)) = outcome.failures.iter().find(|(h, _)| *h == hash) {
            return Err(StateError::Validation(err.clone()));
        }
        if self.status_of(&hash) == Some(BlockStatus::Failed) {
            return Err(StateError::KnownInvalid(hash));
        }

        let (tip_after, height_after) = self.tip();
        let (disconnected, connected) = (outcome.disconnected, outcome.connected);
        let acceptance = if tip_after == tip_before {
            if hash == tip_before {
                BlockAcceptance::Duplicate { hash }
            } else {
                BlockAcceptance::SideChain { hash }
            }
        } else if disconnected.is_empty() {
            BlockAcceptance::Extended {
                tip: tip_after,
                height: height_after,
            }
        } else {
            BlockAcceptance::Reorganized {
                disconnected: disconnected.len() as u32,
                connected: connected.len() as u32,
                tip: tip_after,
                height: height_after,
            }
        };
        Ok(acceptance)
    }

    /// Re-run best-chain activation (e.g. after a cancelled validation).
    pub fn activate_best_chain(&self) -> StateResult<()> {
        let outcome = {
            let mut inner = self.inner.write();
            self.activate(&mut inner)?
        };
        self.notify_sinks(&outcome);
        Ok(())
    }

    fn notify_sinks(&self, outcome: &ActivationOutcome) {
        if outcome.disconnected.is_empty() && outcome.connected.is_empty() {
            return;
        }
        let sinks: Vec<_> = self.sinks.read().clone();
        for sink in sinks {
            sink.reorg_notification(&outcome.disconnected, &outcome.connected);
        }
    }

    // ---- internals ----

    fn receive_header_inner(
        &self,
        inner: &mut ChainInner,
        header: &BlockHeader,
    ) -> StateResult<Hash> {
        let parent_hash = header.prev_block;
        let parent = inner
            .index
            .get(&parent_hash)
            .cloned()
            .ok_or(StateError::OrphanHeader(parent_hash))?;
        if parent.status == BlockStatus::Failed {
            return Err(StateError::ParentFailed(parent_hash));
        }
        let height = parent.height + 1;

        let key_height = PowEngine::epoch_key_height(height);
        let epoch_key = self
            .ancestor_hash(inner, &parent_hash, key_height)
            .ok_or_else(|| StateError::Corruption("missing epoch key ancestor".into()))?;
        let header_bytes = header.encode();
        let hash = self.pow.block_hash(&epoch_key, &header_bytes);

        if let Some(existing) = inner.index.get(&hash) {
            if existing.status == BlockStatus::Failed {
                return Err(StateError::KnownInvalid(hash));
            }
            return Ok(hash);
        }

        // Finality window: refuse headers forking deeper than the maximum
        // reorg depth below the current tip.
        let tip_height = (inner.main_chain.len() - 1) as u32;
        let fork_height = self.fork_height(inner, &parent_hash);
        if tip_height.saturating_sub(fork_height) > params::MAX_REORG_DEPTH {
            warn!(
                height,
                fork_height, tip_height, "refusing header beyond the finality window"
            );
            return Err(StateError::ReorgTooDeep {
                fork_height,
                tip_height,
                max: params::MAX_REORG_DEPTH,
            });
        }

        // Header-only consensus rules. A violation creates a Failed entry so
        // descendants are rejected terminally.
        let expected_target = self.next_target_for_child(inner, &parent_hash);
        let target = match compact_to_target(header.target) {
            Some(t) if header.target == expected_target => t,
            _ => {
                return self.fail_new_header(
                    inner,
                    hash,
                    header,
                    &parent,
                    ValidationError::WrongTarget {
                        got: header.target,
                        expected: expected_target,
                    },
                );
            }
        };

        let lower = self.median_time_past_at(inner, &parent_hash);
        let upper = self.clock.now().saturating_add(params::MAX_FUTURE_DRIFT_SECS);
        if header.time <= lower || header.time > upper {
            return self.fail_new_header(
                inner,
                hash,
                header,
                &parent,
                ValidationError::BadTimestamp {
                    time: header.time,
                    lower,
                    upper,
                },
            );
        }

        if !self.pow.check(&epoch_key, &header_bytes, &target) {
            return self.fail_new_header(
                inner,
                hash,
                header,
                &parent,
                ValidationError::PowInsufficient,
            );
        }

        let entry = BlockIndexEntry {
            hash,
            height,
            header: *header,
            status: BlockStatus::HeaderKnown,
            total_work: &parent.total_work + work_for_target(&target),
            parent: parent_hash,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        self.persist_entry(&entry)?;
        debug!(height, %hash, "header accepted");
        inner.index.insert(hash, entry);
        Ok(hash)
    }

    fn fail_new_header(
        &self,
        inner: &mut ChainInner,
        hash: Hash,
        header: &BlockHeader,
        parent: &BlockIndexEntry,
        err: ValidationError,
    ) -> StateResult<Hash> {
        let entry = BlockIndexEntry {
            hash,
            height: parent.height + 1,
            header: *header,
            status: BlockStatus::Failed,
            total_work: parent.total_work.clone(),
            parent: parent.hash,
            seq: inner.next_seq,
        };
        inner.next_seq += 1;
        self.persist_entry(&entry)?;
        inner.index.insert(hash, entry);
        warn!(%hash, %err, "header rejected");
        Err(StateError::Validation(err))
    }

    /// Best-chain activation loop. Returns the blocks disconnected and
    /// connected, in the order the mempool should see them, plus any blocks
    /// that failed phase B along the way.
    fn activate(&self, inner: &mut ChainInner) -> StateResult<ActivationOutcome> {
        let mut disconnected = Vec::new();
        let mut connected = Vec::new();
        let mut failures: Vec<(Hash, ValidationError)> = Vec::new();
        let mut rejected: HashSet<Hash> = HashSet::new();

        loop {
            let tip_hash = *inner.main_chain.last().unwrap();
            let Some(candidate) = self.best_candidate(inner, &rejected) else {
                break;
            };
            if candidate == tip_hash {
                break;
            }

            let (lca_height, path) = self.path_from_main(inner, &candidate);
            let tip_height = (inner.main_chain.len() - 1) as u32;
            let depth = tip_height - lca_height;
            if depth > params::MAX_REORG_DEPTH {
                warn!(%candidate, depth, "candidate beyond finality window, ignoring");
                rejected.insert(candidate);
                continue;
            }

            if depth > 0 {
                info!(
                    depth,
                    target = %candidate,
                    "reorganizing main chain"
                );
            }

            while (inner.main_chain.len() - 1) as u32 > lca_height {
                let block = self.disconnect_tip(inner)?;
                disconnected.push(block);
            }

            for hash in path {
                match self.connect_block(inner, &hash) {
                    Ok(block) => connected.push(block),
                    Err(StateError::Validation(ValidationError::Cancelled)) => {
                        self.cancel.reset();
                        break;
                    }
                    Err(StateError::Validation(err)) => {
                        warn!(%hash, %err, "connect failed, marking subtree failed");
                        self.mark_failed_subtree(inner, &hash);
                        failures.push((hash, err));
                        break;
                    }
                    Err(other) => return Err(other),
                }
            }
        }

        Ok(ActivationOutcome {
            disconnected,
            connected,
            failures,
        })
    }

    /// Highest-work connectable entry strictly better than the tip, ties
    /// broken by earliest arrival.
    fn best_candidate(&self, inner: &ChainInner, rejected: &HashSet<Hash>) -> Option<Hash> {
        let tip_hash = inner.main_chain.last().unwrap();
        let tip_work = &inner.index[tip_hash].total_work;

        let mut best: Option<&BlockIndexEntry> = None;
        for entry in inner.index.values() {
            if rejected.contains(&entry.hash)
                || !entry.status.body_available()
                || entry.total_work <= *tip_work
            {
                continue;
            }
            if !self.branch_connectable(inner, entry) {
                continue;
            }
            best = match best {
                None => Some(entry),
                Some(cur) => {
                    if entry.total_work > cur.total_work
                        || (entry.total_work == cur.total_work && entry.seq < cur.seq)
                    {
                        Some(entry)
                    } else {
                        Some(cur)
                    }
                }
            };
        }
        best.map(|e| e.hash)
    }

    /// True when every block between `entry` and the main chain has its body
    /// available and none is failed.
    fn branch_connectable(&self, inner: &ChainInner, entry: &BlockIndexEntry) -> bool {
        let mut cursor = entry;
        loop {
            if self.on_main_chain(inner, cursor) {
                return true;
            }
            if !cursor.status.body_available() {
                return false;
            }
            match inner.index.get(&cursor.parent) {
                Some(parent) => cursor = parent,
                None => return false,
            }
        }
    }

    fn on_main_chain(&self, inner: &ChainInner, entry: &BlockIndexEntry) -> bool {
        inner
            .main_chain
            .get(entry.height as usize)
            .is_some_and(|h| *h == entry.hash)
    }

    /// Height of the deepest ancestor of `from` on the main chain.
    fn fork_height(&self, inner: &ChainInner, from: &Hash) -> u32 {
        let mut cursor = &inner.index[from];
        loop {
            if self.on_main_chain(inner, cursor) {
                return cursor.height;
            }
            cursor = &inner.index[&cursor.parent];
        }
    }

    /// LCA height plus the branch path (exclusive of the LCA, ascending).
    fn path_from_main(&self, inner: &ChainInner, to: &Hash) -> (u32, Vec<Hash>) {
        let mut path = Vec::new();
        let mut cursor = &inner.index[to];
        loop {
            if self.on_main_chain(inner, cursor) {
                path.reverse();
                return (cursor.height, path);
            }
            path.push(cursor.hash);
            cursor = &inner.index[&cursor.parent];
        }
    }

    fn ancestor_hash(&self, inner: &ChainInner, from: &Hash, height: u32) -> Option<Hash> {
        let mut cursor = inner.index.get(from)?;
        while cursor.height > height {
            cursor = inner.index.get(&cursor.parent)?;
        }
        (cursor.height == height).then_some(cursor.hash)
    }

    fn timing_window(&self, inner: &ChainInner, parent: &Hash, count: usize) -> Vec<HeaderTiming> {
        let mut window = Vec::with_capacity(count);
        let mut cursor = inner.index.get(parent);
        while let Some(entry) = cursor {
            window.push(HeaderTiming {
                height: entry.height,
                time: entry.header.time,
                target_bits: entry.header.target,
            });
            if window.len() == count || entry.height == 0 {
                break;
            }
            cursor = inner.index.get(&entry.parent);
        }
        window.reverse();
        window
    }

    fn next_target_for_child(&self, inner: &ChainInner, parent: &Hash) -> u32 {
        let window = self.timing_window(
            inner,
            parent,
            self.chain_params.retarget_window as usize + 1,
        );
        self.difficulty.next_target(&window)
    }

    fn median_time_past_at(&self, inner: &ChainInner, parent: &Hash) -> u32 {
        let times: Vec<u32> = self
            .timing_window(inner, parent, params::MEDIAN_TIME_SPAN)
            .iter()
            .map(|t| t.time)
            .collect();
        median_time_past(&times)
    }

    /// Connect the child of the current tip in one atomic write group.
    fn connect_block(&self, inner: &mut ChainInner, hash: &Hash) -> StateResult<Block> {
        let entry = inner.index[hash].clone();
        let tip_hash = *inner.main_chain.last().unwrap();
        if entry.parent != tip_hash {
            return Err(StateError::Corruption(format!(
                "connect of {hash} does not extend tip {tip_hash}"
            )));
        }

        let block = self.blocks.expect_block(hash)?;
        let ctx = BlockContext {
            height: entry.height,
            expected_target: self.next_target_for_child(inner, &entry.parent),
            median_time_past: self.median_time_past_at(inner, &entry.parent),
            now: self.clock.now(),
        };

        let change = self
            .validator
            .validate_block(
                &block,
                &ctx,
                |op| self.utxo.get(op).ok().flatten(),
                Some(&self.cancel),
            )
            .map_err(StateError::Validation)?;

        self.utxo
            .preserve_for_snapshots(&UtxoStore::connect_footprint(&change))?;

        let mut batch = WriteBatch::new();
        let undo = self.utxo.stage_connect(&mut batch, &change)?;
        self.blocks.stage_put_undo(&mut batch, hash, &undo);
        self.blocks.stage_set_main(&mut batch, entry.height, hash);
        batch.put(ColumnFamily::Metadata, meta_keys::TIP.to_vec(), hash.to_vec());
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TIP_HEIGHT.to_vec(),
            entry.height.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::UTXO_HEIGHT.to_vec(),
            entry.height.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TOTAL_WORK.to_vec(),
            entry.total_work.to_bytes_be(),
        );
        let mut updated = entry.clone();
        updated.status = BlockStatus::InMainChain;
        batch.put(ColumnFamily::Index, index_key(hash), updated.encode());

        self.storage.write_batch(batch)?;

        self.utxo.commit_connect(&change);
        inner.main_chain.push(*hash);
        inner.index.insert(*hash, updated);

        info!(height = entry.height, %hash, fees = change.fees, "block connected");
        Ok(block)
    }

    /// Disconnect the current tip in one atomic write group, using its undo
    /// record.
    fn disconnect_tip(&self, inner: &mut ChainInner) -> StateResult<Block> {
        if inner.main_chain.len() == 1 {
            return Err(StateError::Corruption("cannot disconnect genesis".into()));
        }
        let tip_hash = *inner.main_chain.last().unwrap();
        let entry = inner.index[&tip_hash].clone();
        let parent = inner.index[&entry.parent].clone();

        let block = self.blocks.expect_block(&tip_hash)?;
        let undo = self.blocks.expect_undo(&tip_hash)?;

        self.utxo
            .preserve_for_snapshots(&UtxoStore::disconnect_footprint(&block))?;

        let mut batch = WriteBatch::new();
        self.utxo.stage_disconnect(&mut batch, &block, &undo)?;
        self.blocks.stage_clear_main(&mut batch, entry.height);
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TIP.to_vec(),
            parent.hash.to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TIP_HEIGHT.to_vec(),
            parent.height.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::UTXO_HEIGHT.to_vec(),
            parent.height.to_le_bytes().to_vec(),
        );
        batch.put(
            ColumnFamily::Metadata,
            meta_keys::TOTAL_WORK.to_vec(),
            parent.total_work.to_bytes_be(),
        );
        let mut updated = entry.clone();
        updated.status = BlockStatus::Validated;
        batch.put(ColumnFamily::Index, index_key(&tip_hash), updated.encode());

        self.storage.write_batch(batch)?;

        self.utxo.commit_disconnect(&block, &undo);
        inner.main_chain.pop();
        inner.index.insert(tip_hash, updated);

        info!(height = entry.height, hash = %tip_hash, "block disconnected");
        Ok(block)
    }

    /// Mark an entry and all its descendants failed. Terminal.
    fn mark_failed_subtree(&self, inner: &mut ChainInner, root: &Hash) {
        let mut stack = vec![*root];
        while let Some(hash) = stack.pop() {
            if let Some(entry) = inner.index.get_mut(&hash) {
                if entry.status == BlockStatus::Failed {
                    continue;
                }
                entry.status = BlockStatus::Failed;
                let encoded = entry.encode();
                let _ = self
                    .storage
                    .put(ColumnFamily::Index, &index_key(&hash), &encoded);
            }
            stack.extend(
                inner
                    .index
                    .values()
                    .filter(|e| e.parent == hash)
                    .map(|e| e.hash),
            );
        }
    }

    fn set_status(
        &self,
        inner: &mut ChainInner,
        hash: &Hash,
        status: BlockStatus,
    ) -> StateResult<()> {
        if let Some(entry) = inner.index.get_mut(hash) {
            entry.status = status;
            let encoded = entry.encode();
            self.storage
                .put(ColumnFamily::Index, &index_key(hash), &encoded)?;
        }
        Ok(())
    }

    fn persist_entry(&self, entry: &BlockIndexEntry) -> StateResult<()> {
        self.storage
            .put(ColumnFamily::Index, &index_key(&entry.hash), &entry.encode())?;
        Ok(())
    }
}

/// Index column key: `h` + block hash.
fn index_key(hash: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(33);
    key.push(b'h');
    key.extend_from_slice(hash.as_bytes());
    key
}
