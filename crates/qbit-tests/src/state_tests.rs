//! Chain state scenarios: linear extension, UTXO determinism, reversibility,
//! supply conservation and crash consistency.

use crate::harness::TestNode;
use crate::generators::TestWallet;
use qbit_consensus::{subsidy, subsidy_up_to};
use qbit_core::{work_for_target, compact_to_target, Encodable};
use qbit_state::{BlockAcceptance, ChainState, Clock, ManualClock, StateError};
use qbit_storage::Storage;
use std::sync::Arc;

#[test]
fn test_linear_extension_scenario() {
    // Scenario A: mine B1 from genesis; tip, UTXO and total work all move.
    let node = TestNode::new();
    let wallet = TestWallet::from_seed(b"scenario a wallet");

    let genesis_work = node.node.chain().total_work();
    let b1 = node.mine_block(&wallet.lock_script());

    let (tip, height) = node.tip();
    assert_eq!(height, 1);

    // The only non-genesis UTXO is B1's coinbase, paying the full subsidy.
    let outpoint = TestNode::coinbase_outpoint(&b1);
    let entry = node.node.chain().utxo().get(&outpoint).unwrap().unwrap();
    assert_eq!(entry.output.amount, subsidy(1));
    assert_eq!(entry.height, 1);
    assert!(entry.is_coinbase);

    // Total work grew by the work of B1's target.
    let b1_work = work_for_target(&compact_to_target(b1.header.target).unwrap());
    assert_eq!(node.node.chain().total_work(), genesis_work + b1_work);
    assert_eq!(node.node.chain().entry(&tip).unwrap().hash, tip);
}

#[test]
fn test_utxo_set_determinism() {
    // Two nodes fed the same blocks in order produce byte-identical UTXO
    // dumps.
    let a = TestNode::new();
    let blocks = a.mine_blocks(5, &[0x51]);

    let b = TestNode::new();
    for block in &blocks {
        b.node.receive_block(&block.encode()).unwrap();
    }

    assert_eq!(a.tip(), b.tip());
    assert_eq!(
        a.node.chain().utxo().dump().unwrap(),
        b.node.chain().utxo().dump().unwrap()
    );
    assert_eq!(
        a.node.chain().utxo().dump_digest().unwrap(),
        b.node.chain().utxo().dump_digest().unwrap()
    );
}

#[test]
fn test_reorg_restores_pre_block_utxo_set() {
    // Reversibility: disconnecting a block through a reorg removes exactly
    // what it added.
    let node = TestNode::new();
    node.mine_blocks(2, &[0x51]);
    let (fork_parent, _) = node.tip();
    let digest_before = node.node.chain().utxo().dump_digest().unwrap();

    // A3 extends the tip.
    let a3 = node.mine_block(&[0x52]);
    let a3_coinbase = TestNode::coinbase_outpoint(&a3);
    assert_ne!(
        node.node.chain().utxo().dump_digest().unwrap(),
        digest_before
    );

    // A two-block fork from A3's parent replaces it.
    let f1 = node.build_block_on(&fork_parent, vec![], 0, 1);
    let f1_hash = match node.submit(&f1).unwrap() {
        BlockAcceptance::SideChain { hash } => hash,
        other => panic!("expected side chain, got {other:?}"),
    };
    let f2 = node.build_block_on(&f1_hash, vec![], 0, 2);
    let acceptance = node.submit(&f2).unwrap();
    assert!(matches!(acceptance, BlockAcceptance::Reorganized { .. }));

    // A3's coinbase is gone; the fork's coinbases are live.
    assert!(node.node.chain().utxo().get(&a3_coinbase).unwrap().is_none());
    assert!(node
        .node
        .chain()
        .utxo()
        .get(&TestNode::coinbase_outpoint(&f1))
        .unwrap()
        .is_some());
    assert!(node
        .node
        .chain()
        .utxo()
        .get(&TestNode::coinbase_outpoint(&f2))
        .unwrap()
        .is_some());
}

#[test]
fn test_supply_never_exceeds_emission() {
    // Conservation: the UTXO total never exceeds the subsidy emitted up to
    // the tip height.
    let node = TestNode::new();
    node.mine_blocks(6, &[0x53]);

    let height = node.tip().1;
    let total = node.node.chain().utxo().total_amount().unwrap();
    assert!(total <= subsidy_up_to(height));
    // All coinbases claimed the full subsidy, and genesis pays nothing.
    assert_eq!(total, subsidy_up_to(height) - subsidy(0));
}

#[test]
fn test_crash_consistency_on_connect() {
    // Scenario F: a crash during a connect leaves either the old state or
    // the new one, never a partial mix.
    let node = TestNode::new();
    node.mine_blocks(2, &[0x51]);
    let tip_before = node.tip();
    let digest_before = node.node.chain().utxo().dump_digest().unwrap();

    // Build a valid block, then drop the connect write group as a crash
    // would.
    let block = node.build_block_on(&tip_before.0, vec![], 0, 7);
    node.storage.fail_next_batch();
    let result = node.submit(&block);
    assert!(result.is_err(), "dropped write group must surface an error");

    // In-memory and durable state still agree on the old tip.
    assert_eq!(node.tip(), tip_before);
    assert_eq!(
        node.node.chain().utxo().dump_digest().unwrap(),
        digest_before
    );

    // Recovery: reopening over the same storage finds a consistent state at
    // the old tip.
    let clock = Arc::new(ManualClock::new(crate::harness::TEST_START_TIME + 1_000));
    let reopened = ChainState::open(
        Arc::clone(&node.storage) as Arc<dyn Storage>,
        qbit_consensus::ChainParams::regtest(),
        clock as Arc<dyn Clock>,
    )
    .unwrap();
    assert_eq!(reopened.tip(), tip_before);
    assert_eq!(reopened.utxo().dump_digest().unwrap(), digest_before);
}

#[test]
fn test_corrupted_metadata_refuses_to_open() {
    let node = TestNode::new();
    node.mine_blocks(1, &[0x51]);

    // Desynchronize the UTXO height marker.
    node.storage
        .put(
            qbit_storage::ColumnFamily::Metadata,
            qbit_storage::meta_keys::UTXO_HEIGHT,
            &99u32.to_le_bytes(),
        )
        .unwrap();

    let clock = Arc::new(ManualClock::new(crate::harness::TEST_START_TIME));
    let result = ChainState::open(
        Arc::clone(&node.storage) as Arc<dyn Storage>,
        qbit_consensus::ChainParams::regtest(),
        clock as Arc<dyn Clock>,
    );
    assert!(matches!(result, Err(StateError::Corruption(_))));
}

#[test]
fn test_snapshot_isolated_from_reorg() {
    // A snapshot taken before a reorg keeps serving the pre-reorg view.
    let node = TestNode::new();
    node.mine_blocks(2, &[0x51]);
    let (fork_parent, _) = node.tip();

    let a3 = node.mine_block(&[0x52]);
    let a3_coinbase = TestNode::coinbase_outpoint(&a3);
    let snapshot = node.node.chain().utxo_snapshot();
    assert!(snapshot.get(&a3_coinbase).unwrap().is_some());

    // Two-block fork replaces A3.
    let f1 = node.build_block_on(&fork_parent, vec![], 0, 11);
    let f1_hash = match node.submit(&f1).unwrap() {
        BlockAcceptance::SideChain { hash } => hash,
        other => panic!("unexpected {other:?}"),
    };
    let f2 = node.build_block_on(&f1_hash, vec![], 0, 12);
    node.submit(&f2).unwrap();

    // Live view lost A3's coinbase; the snapshot still has it.
    assert!(node.node.chain().utxo().get(&a3_coinbase).unwrap().is_none());
    assert!(snapshot.get(&a3_coinbase).unwrap().is_some());
}
