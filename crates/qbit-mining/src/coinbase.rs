//! Coinbase construction.

use crate::{MiningError, MiningResult};
use qbit_consensus::params;
use qbit_core::{OutPoint, Transaction, TxInput, TxOutput};

/// Build the coinbase for a block at `height` paying `reward` to the
/// destination locking script.
///
/// The unlock script commits the height as a canonical VarInt, then carries
/// four extra-nonce bytes miners may vary to refresh the Merkle root.
pub fn build_coinbase(
    height: u32,
    reward: u64,
    destination_script: &[u8],
    extra_nonce: u32,
) -> MiningResult<Transaction> {
    if destination_script.is_empty() || destination_script.len() > qbit_core::limits::MAX_SCRIPT_BYTES
    {
        return Err(MiningError::BadDestination(format!(
            "destination script of {} bytes",
            destination_script.len()
        )));
    }

    let mut unlock = Vec::with_capacity(9);
    write_var_int(&mut unlock, height as u64);
    unlock.extend_from_slice(&extra_nonce.to_le_bytes());
    debug_assert!(
        unlock.len() >= params::COINBASE_SCRIPT_MIN && unlock.len() <= params::COINBASE_SCRIPT_MAX
    );

    Ok(Transaction {
        version: 1,
        inputs: vec![TxInput::new(OutPoint::COINBASE, unlock)],
        outputs: vec![TxOutput::new(reward, destination_script.to_vec())],
        lock_time: 0,
    })
}

fn write_var_int(out: &mut Vec<u8>, v: u64) {
    if v < 0xFD {
        out.push(v as u8);
    } else if v <= u16::MAX as u64 {
        out.push(0xFD);
        out.extend_from_slice(&(v as u16).to_le_bytes());
    } else if v <= u32::MAX as u64 {
        out.push(0xFE);
        out.extend_from_slice(&(v as u32).to_le_bytes());
    } else {
        out.push(0xFF);
        out.extend_from_slice(&v.to_le_bytes());
    }
}
