//! Validation boundary cases: timestamp window, coinbase maturity, block
//! size and the sigop ceiling.

use crate::generators::TestWallet;
use crate::harness::TestNode;
use qbit_consensus::{
    params, script, subsidy, BlockContext, ContextualValidator, ValidationError,
};
use qbit_core::{Encodable, OutPoint, Transaction, TxInput, TxOutput, UtxoEntry};
use qbit_node::NodeError;
use qbit_state::{Clock, StateError};

#[test]
fn test_timestamp_future_drift_boundary() {
    let node = TestNode::new();
    node.mine_blocks(1, &[0x51]);
    let (tip, _) = node.tip();
    let now = node.clock.now();

    // Exactly now + drift: accepted.
    let at_limit = node.build_block_on_with_time(
        &tip,
        vec![],
        0,
        1,
        now + params::MAX_FUTURE_DRIFT_SECS,
    );
    node.submit(&at_limit).unwrap();

    // One second past the drift: rejected. (The clock advanced 2s on the
    // previous submit; measure from the current reading.)
    let (tip, _) = node.tip();
    let now = node.clock.now();
    let past_limit = node.build_block_on_with_time(
        &tip,
        vec![],
        0,
        2,
        now + params::MAX_FUTURE_DRIFT_SECS + 1,
    );
    let err = node.submit(&past_limit).unwrap_err();
    assert!(matches!(
        err,
        NodeError::State(StateError::Validation(ValidationError::BadTimestamp { .. }))
    ));
}

#[test]
fn test_timestamp_must_exceed_median_past() {
    let node = TestNode::new();
    node.mine_blocks(12, &[0x51]);
    let (tip, _) = node.tip();
    let mpt = node.node.chain().tip_median_time_past();

    // Exactly the median: rejected (must be strictly greater).
    let stale = node.build_block_on_with_time(&tip, vec![], 0, 1, mpt);
    let err = node.submit(&stale).unwrap_err();
    assert!(matches!(
        err,
        NodeError::State(StateError::Validation(ValidationError::BadTimestamp { .. }))
    ));

    // One past the median: accepted.
    let fresh = node.build_block_on_with_time(&tip, vec![], 0, 2, mpt + 1);
    node.submit(&fresh).unwrap();
}

#[test]
fn test_coinbase_maturity_boundaries() {
    let node = TestNode::new();
    let wallet = TestWallet::from_seed(b"maturity wallet");

    let funding = node.mine_block(&wallet.lock_script());
    let funding_outpoint = TestNode::coinbase_outpoint(&funding);
    let entry = node
        .node
        .chain()
        .utxo()
        .get(&funding_outpoint)
        .unwrap()
        .unwrap();

    // 98 blocks on top: a spend at height 100 has 99 confirmations.
    node.mine_blocks(params::COINBASE_MATURITY - 2, &[0x51]);
    assert_eq!(node.tip().1, params::COINBASE_MATURITY - 1);

    let spend = wallet.send(funding_outpoint, &entry, vec![0x51, 0x51], 0);
    let (tip, _) = node.tip();
    let immature = node.build_block_on(&tip, vec![spend.clone()], 0, 1);
    let err = node.submit(&immature).unwrap_err();
    assert!(matches!(
        err,
        NodeError::State(StateError::Validation(
            ValidationError::CoinbaseImmature { .. }
        ))
    ));

    // One more block buries it 100 deep; the same spend connects.
    node.mine_blocks(1, &[0x51]);
    let (tip, _) = node.tip();
    let mature = node.build_block_on(&tip, vec![spend], 0, 2);
    node.submit(&mature).unwrap();
}

/// Encoded size of one zero-amount pad output carrying a maximum-size
/// unspendable script: 8 (amount) + 3 (length prefix) + script.
const PAD: usize = 8 + 3 + qbit_core::limits::MAX_SCRIPT_BYTES;

#[test]
fn test_block_size_boundary() {
    // A block of exactly MAX_BLOCK_BYTES connects; one byte more is
    // rejected. The per-transaction cap is 1 MiB, so a maximum-size block
    // takes several carrier transactions: four wallet spends padded with
    // unspendable outputs, plus a coinbase fine-tuned to the exact size.
    let node = TestNode::new();
    let wallet = TestWallet::from_seed(b"size wallet");

    let fundings: Vec<_> = (0..4).map(|_| node.mine_block(&wallet.lock_script())).collect();
    node.mine_blocks(params::COINBASE_MATURITY, &[0x51]);

    let pad_output = || {
        TxOutput::new(
            0,
            script::unspendable(&[0u8; qbit_core::limits::MAX_SCRIPT_BYTES - 1]),
        )
    };

    // Each carrier spend: ~90 pad outputs (~0.93 MiB), change for the full
    // coin, zero fee.
    let spends: Vec<_> = fundings
        .iter()
        .map(|funding| {
            let outpoint = TestNode::coinbase_outpoint(funding);
            let entry = node.node.chain().utxo().get(&outpoint).unwrap().unwrap();
            let mut outputs: Vec<TxOutput> = (0..90).map(|_| pad_output()).collect();
            outputs.push(TxOutput::new(entry.output.amount, vec![0x55]));
            wallet.spend(&[(outpoint, entry)], outputs)
        })
        .collect();
    for spend in &spends {
        assert!(spend.encoded_size() <= params::MAX_TX_BYTES);
    }

    // Bulk-pad the coinbase, then close the gap with one or two filler
    // outputs whose script lengths are chosen exactly. A script of length
    // L >= 253 adds 11 + L bytes.
    let (tip, _) = node.tip();
    let mut block = node.build_block_on(&tip, spends, 0, 1);
    while block.encoded_size() + PAD + 300 < params::MAX_BLOCK_BYTES {
        block.transactions[0].outputs.push(pad_output());
    }
    let mut remaining = params::MAX_BLOCK_BYTES - block.encoded_size();
    if remaining > PAD {
        block.transactions[0]
            .outputs
            .push(TxOutput::new(0, script::unspendable(&[0u8; 4_999])));
        remaining = params::MAX_BLOCK_BYTES - block.encoded_size();
    }
    assert!(
        (264..=PAD).contains(&remaining),
        "fine-tune window missed: {remaining}"
    );
    let filler = vec![0u8; remaining - 11 - 1];
    block.transactions[0]
        .outputs
        .push(TxOutput::new(0, script::unspendable(&filler)));
    assert_eq!(block.encoded_size(), params::MAX_BLOCK_BYTES);
    assert!(block.transactions[0].encoded_size() <= params::MAX_TX_BYTES);

    let exact = node.solve_body(block);
    let height_before = node.tip().1;
    node.submit(&exact).unwrap();
    assert_eq!(node.tip().1, height_before + 1, "exact-size block connected");

    // One byte over: rejected at decode before PoW is even consulted.
    let mut oversized = exact;
    let last = oversized.transactions[0].outputs.last_mut().unwrap();
    last.script.push(0);
    assert_eq!(oversized.encoded_size(), params::MAX_BLOCK_BYTES + 1);

    let err = node.submit(&oversized).unwrap_err();
    assert!(matches!(err, NodeError::Codec(_)));
}

#[test]
fn test_sigop_ceiling() {
    // Consensus-level: spending inputs whose lock scripts are packed with
    // CHECK_SIG_PQ pushes the block over the sigop ceiling.
    let validator = ContextualValidator::without_scripts();
    let sigop_script = vec![script::opcodes::OP_CHECKSIG; qbit_core::limits::MAX_SCRIPT_BYTES];
    let per_script = script::count_sigops(&sigop_script);
    assert_eq!(per_script as usize, qbit_core::limits::MAX_SCRIPT_BYTES);

    let lookup_entry = UtxoEntry::new(TxOutput::new(1_000, sigop_script), 10, false);
    let build_block = |inputs: usize| {
        let coinbase = qbit_mining::build_coinbase(200, subsidy(200), &[0x51], 0).unwrap();
        let spends: Vec<Transaction> = (0..inputs)
            .map(|i| Transaction {
                version: 1,
                inputs: vec![TxInput::new(
                    OutPoint::new(crate::generators::test_hash(i as u8), 0),
                    vec![],
                )],
                outputs: vec![TxOutput::new(1_000, vec![0x51])],
                lock_time: 0,
            })
            .collect();
        let mut transactions = vec![coinbase];
        transactions.extend(spends);
        let merkle = qbit_core::merkle_root(
            &transactions.iter().map(|t| t.txid()).collect::<Vec<_>>(),
        );
        qbit_core::Block {
            header: qbit_core::BlockHeader {
                version: params::HEADER_VERSION,
                prev_block: qbit_core::Hash::ZERO,
                merkle_root: merkle,
                time: 1_700_000_100,
                target: params::MAX_TARGET_BITS,
                nonce: 0,
            },
            transactions,
        }
    };
    let ctx = BlockContext {
        height: 200,
        expected_target: params::MAX_TARGET_BITS,
        median_time_past: 1_700_000_000,
        now: 1_700_000_200,
    };

    // 7 inputs: 71,680 sigops, under the cap.
    let ok = validator.validate_block(
        &build_block(7),
        &ctx,
        |_| Some(lookup_entry.clone()),
        None,
    );
    assert!(ok.is_ok(), "{:?}", ok.err());
    assert_eq!(ok.unwrap().sigop_cost, 7 * per_script);

    // 8 inputs: 81,920 sigops, over the cap.
    let err = validator
        .validate_block(&build_block(8), &ctx, |_| Some(lookup_entry.clone()), None)
        .unwrap_err();
    assert!(matches!(err, ValidationError::TooManySigops { .. }));
}
