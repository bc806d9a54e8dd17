//! Context-free (phase A) block validation.
//!
//! Everything here is checkable from the block bytes alone: structure, size,
//! coinbase shape, Merkle root, and the canonical form of the declared
//! target. The PoW comparison and every chain-dependent rule live in phase B
//! and in the chain state, which can resolve the epoch key and parent
//! context.

use crate::error::{ValidationError, ValidationResult};
use crate::params;
use qbit_core::{merkle_root, Block, Encodable, Reader, Transaction, is_canonical_compact};
use std::collections::HashSet;

/// Decode the height commitment from the front of a coinbase unlock script.
///
/// The commitment is a canonical VarInt; `None` means the script is
/// malformed.
pub fn parse_coinbase_height(unlock_script: &[u8]) -> Option<u32> {
    let mut r = Reader::new(unlock_script);
    let height = r.read_var_int().ok()?;
    u32::try_from(height).ok()
}

/// Phase A validation of a whole block.
pub fn validate_block_stateless(block: &Block) -> ValidationResult<()> {
    let size = block.encoded_size();
    if size > params::MAX_BLOCK_BYTES {
        return Err(ValidationError::BlockTooLarge {
            size,
            max: params::MAX_BLOCK_BYTES,
        });
    }

    if !is_canonical_compact(block.header.target) {
        return Err(ValidationError::WrongTarget {
            got: block.header.target,
            expected: 0,
        });
    }

    if block.transactions.is_empty() {
        return Err(ValidationError::CoinbaseMalformed(
            "block has no transactions".into(),
        ));
    }

    validate_coinbase_shape(&block.transactions[0])?;

    for (i, tx) in block.transactions.iter().enumerate() {
        if i > 0 && tx.is_coinbase() {
            return Err(ValidationError::CoinbaseMalformed(format!(
                "transaction {i} is a second coinbase"
            )));
        }
        validate_tx_stateless(tx, i == 0)?;
    }

    let expected = merkle_root(&block.txids());
    if block.header.merkle_root != expected {
        return Err(ValidationError::BadMerkleRoot {
            got: block.header.merkle_root,
            expected,
        });
    }

    Ok(())
}

/// Phase A validation of a single transaction.
pub fn validate_tx_stateless(tx: &Transaction, is_coinbase: bool) -> ValidationResult<()> {
    if tx.inputs.is_empty() {
        return Err(ValidationError::TxMalformed("no inputs".into()));
    }
    if tx.outputs.is_empty() {
        return Err(ValidationError::TxMalformed("no outputs".into()));
    }
    if !params::SUPPORTED_TX_VERSIONS.contains(&tx.version) {
        return Err(ValidationError::TxMalformed(format!(
            "unsupported version {}",
            tx.version
        )));
    }

    let size = tx.encoded_size();
    if size > params::MAX_TX_BYTES {
        return Err(ValidationError::TxMalformed(format!(
            "transaction size {size} exceeds {}",
            params::MAX_TX_BYTES
        )));
    }

    if tx.output_total().is_none() {
        return Err(ValidationError::TxMalformed("output total overflows".into()));
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for input in &tx.inputs {
        if !is_coinbase && input.prev.is_coinbase_sentinel() {
            return Err(ValidationError::TxMalformed(
                "non-coinbase input carries the coinbase sentinel".into(),
            ));
        }
        if !seen.insert(input.prev) {
            return Err(ValidationError::DuplicateInput(input.prev));
        }
    }

    Ok(())
}

/// Coinbase shape: one sentinel input, unlock script 2..=100 bytes beginning
/// with a decodable height commitment.
fn validate_coinbase_shape(coinbase: &Transaction) -> ValidationResult<()> {
    if !coinbase.is_coinbase() {
        return Err(ValidationError::CoinbaseMalformed(
            "first transaction is not a coinbase".into(),
        ));
    }

    let unlock = &coinbase.inputs[0].unlock_script;
    if unlock.len() < params::COINBASE_SCRIPT_MIN || unlock.len() > params::COINBASE_SCRIPT_MAX {
        return Err(ValidationError::CoinbaseMalformed(format!(
            "unlock script length {} outside {}..={}",
            unlock.len(),
            params::COINBASE_SCRIPT_MIN,
            params::COINBASE_SCRIPT_MAX
        )));
    }

    if parse_coinbase_height(unlock).is_none() {
        return Err(ValidationError::CoinbaseMalformed(
            "unlock script does not begin with a height commitment".into(),
        ));
    }

    Ok(())
}
