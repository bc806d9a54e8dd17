//! Test harness: an in-memory regtest node that mines real blocks.

use qbit_consensus::{params, subsidy, PowEngine};
use qbit_core::{
    compact_to_target, merkle_root, Block, BlockHeader, Encodable, Hash, Transaction,
};
use qbit_mining::build_coinbase;
use qbit_node::{Node, NodeConfig};
use qbit_state::{BlockAcceptance, Clock, ManualClock};
use qbit_storage::MemoryStorage;
use std::sync::Arc;

/// Starting wall-clock for test chains, comfortably after the regtest
/// genesis time.
pub const TEST_START_TIME: u32 = 1_700_001_000;

/// A full node over in-memory storage with a manual clock.
pub struct TestNode {
    pub node: Node,
    pub clock: Arc<ManualClock>,
    pub storage: Arc<MemoryStorage>,
}

impl TestNode {
    pub fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(TEST_START_TIME));
        let node = Node::open_with(
            NodeConfig::default_for_network("regtest"),
            Arc::clone(&storage) as Arc<dyn qbit_storage::Storage>,
            Arc::clone(&clock) as Arc<dyn qbit_state::Clock>,
        )
        .expect("open test node");
        Self {
            node,
            clock,
            storage,
        }
    }

    pub fn tip(&self) -> (Hash, u32) {
        self.node.chain().tip()
    }

    /// Mine one block on the tip through the template path, paying the
    /// destination script. Panics unless the block is accepted.
    pub fn mine_block(&self, destination_script: &[u8]) -> Block {
        let template = self
            .node
            .get_block_template(destination_script, self.node.chain().height())
            .expect("template");
        let block = self
            .node
            .templates()
            .solve(&template, 1 << 24)
            .expect("solvable at regtest difficulty");
        let result = self.node.templates().submit_block(block.clone());
        assert!(result.is_accepted(), "mined block rejected: {result:?}");
        self.clock.advance(2);
        block
    }

    /// Mine `n` blocks on the tip.
    pub fn mine_blocks(&self, n: u32, destination_script: &[u8]) -> Vec<Block> {
        (0..n).map(|_| self.mine_block(destination_script)).collect()
    }

    /// Build a valid block on an arbitrary parent, outside the template
    /// path. Used to construct forks.
    ///
    /// `fee` must equal the total fees of `txs` so the coinbase claim is
    /// exact.
    pub fn build_block_on(
        &self,
        parent: &Hash,
        txs: Vec<Transaction>,
        fee: u64,
        extra_nonce: u32,
    ) -> Block {
        self.build_block_on_with_time(parent, txs, fee, extra_nonce, self.clock.now())
    }

    /// [`TestNode::build_block_on`] with an explicit header time, for
    /// timestamp-boundary tests.
    pub fn build_block_on_with_time(
        &self,
        parent: &Hash,
        txs: Vec<Transaction>,
        fee: u64,
        extra_nonce: u32,
        time: u32,
    ) -> Block {
        let chain = self.node.chain();
        let parent_entry = chain.entry(parent).expect("parent in index");
        let height = parent_entry.height + 1;

        let coinbase =
            build_coinbase(height, subsidy(height) + fee, &[0x51], extra_nonce).expect("coinbase");
        let mut transactions = vec![coinbase];
        transactions.extend(txs);

        // Fork headers use the parent branch's rules; at regtest difficulty
        // the expected target is the maximum for every block.
        let target_bits = chain.chain_params().max_target_bits;
        let header = BlockHeader {
            version: params::HEADER_VERSION,
            prev_block: *parent,
            merkle_root: Hash::ZERO,
            time,
            target: target_bits,
            nonce: 0,
        };
        self.solve_body(Block {
            header,
            transactions,
        })
    }

    /// Recompute the Merkle root and grind the nonce until the block meets
    /// its declared target on its parent branch.
    pub fn solve_body(&self, mut block: Block) -> Block {
        let chain = self.node.chain();
        let parent = block.header.prev_block;
        let parent_entry = chain.entry(&parent).expect("parent in index");
        let height = parent_entry.height + 1;

        let basis: Vec<Hash> = block.transactions.iter().map(|tx| tx.txid()).collect();
        block.header.merkle_root = merkle_root(&basis);

        let target = compact_to_target(block.header.target).expect("canonical target");
        let epoch_key = self.epoch_key_on(&parent, height);
        block.header.nonce = 0;
        loop {
            if chain.pow().check(&epoch_key, &block.header.encode(), &target) {
                return block;
            }
            block.header.nonce += 1;
        }
    }

    /// Submit a pre-built block, returning the acceptance.
    pub fn submit(&self, block: &Block) -> Result<BlockAcceptance, qbit_node::NodeError> {
        let result = self.node.receive_block(&block.encode());
        self.clock.advance(2);
        result
    }

    /// Epoch key for a block at `height` on the branch ending at `parent`.
    fn epoch_key_on(&self, parent: &Hash, height: u32) -> Hash {
        let chain = self.node.chain();
        let key_height = PowEngine::epoch_key_height(height);
        let mut cursor = chain.entry(parent).expect("parent known");
        while cursor.height > key_height {
            cursor = chain.entry(&cursor.parent).expect("ancestor known");
        }
        cursor.hash
    }

    /// Hash of the coinbase output created by a mined block.
    pub fn coinbase_outpoint(block: &Block) -> qbit_core::OutPoint {
        qbit_core::OutPoint::new(block.transactions[0].txid(), 0)
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_mines() {
        let node = TestNode::new();
        assert_eq!(node.tip().1, 0);
        node.mine_blocks(3, &[0x51]);
        assert_eq!(node.tip().1, 3);
    }

    #[test]
    fn test_build_block_on_arbitrary_parent() {
        let node = TestNode::new();
        node.mine_blocks(2, &[0x51]);
        let genesis = node.node.chain().genesis_hash();

        let fork = node.build_block_on(&genesis, vec![], 0, 99);
        let acceptance = node.submit(&fork).unwrap();
        assert!(matches!(acceptance, BlockAcceptance::SideChain { .. }));
        assert_eq!(node.tip().1, 2);
    }
}
