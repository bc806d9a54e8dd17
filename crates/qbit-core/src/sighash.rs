//! Transaction signature hash.

use crate::codec::{write_var_bytes, Encodable};
use crate::hash::{hash_tagged, tags, Hash};
use crate::types::Transaction;

/// Digest signed by `CHECK_SIG_PQ` for one input.
///
/// The transaction is hashed with every unlock script cleared (a signature
/// cannot cover itself), then the input index, the prevout's locking script
/// and the prevout's amount are appended. Committing to script and amount
/// binds each signature to the exact coin it spends.
pub fn tx_sighash(
    tx: &Transaction,
    input_index: usize,
    prevout_script: &[u8],
    amount: u64,
) -> Hash {
    let mut stripped = tx.clone();
    for input in &mut stripped.inputs {
        input.unlock_script.clear();
    }

    let mut preimage = stripped.encode();
    preimage.extend_from_slice(&(input_index as u32).to_le_bytes());
    write_var_bytes(&mut preimage, prevout_script);
    preimage.extend_from_slice(&amount.to_le_bytes());

    hash_tagged(tags::SIGHASH, &preimage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn two_input_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TxInput::new(OutPoint::new(hash_tagged(tags::TX, b"a"), 0), vec![1, 2]),
                TxInput::new(OutPoint::new(hash_tagged(tags::TX, b"b"), 1), vec![3, 4]),
            ],
            outputs: vec![TxOutput::new(100, vec![9])],
            lock_time: 0,
        }
    }

    #[test]
    fn test_independent_of_unlock_scripts() {
        let tx1 = two_input_tx();
        let mut tx2 = tx1.clone();
        tx2.inputs[0].unlock_script = vec![0xAA; 64];
        tx2.inputs[1].unlock_script.clear();
        assert_eq!(
            tx_sighash(&tx1, 0, b"lock", 5),
            tx_sighash(&tx2, 0, b"lock", 5)
        );
    }

    #[test]
    fn test_commits_to_input_index() {
        let tx = two_input_tx();
        assert_ne!(tx_sighash(&tx, 0, b"lock", 5), tx_sighash(&tx, 1, b"lock", 5));
    }

    #[test]
    fn test_commits_to_prevout_script_and_amount() {
        let tx = two_input_tx();
        assert_ne!(
            tx_sighash(&tx, 0, b"lock", 5),
            tx_sighash(&tx, 0, b"other", 5)
        );
        assert_ne!(tx_sighash(&tx, 0, b"lock", 5), tx_sighash(&tx, 0, b"lock", 6));
    }

    #[test]
    fn test_commits_to_outputs() {
        let tx1 = two_input_tx();
        let mut tx2 = tx1.clone();
        tx2.outputs[0].amount += 1;
        assert_ne!(tx_sighash(&tx1, 0, b"lock", 5), tx_sighash(&tx2, 0, b"lock", 5));
    }
}
