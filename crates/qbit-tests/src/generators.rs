//! Deterministic wallets and transaction builders for tests.

use qbit_consensus::script;
use qbit_core::{sig, tx_sighash, Hash, OutPoint, Transaction, TxInput, TxOutput, UtxoEntry};

/// A single-key wallet over the post-quantum scheme. Seeded, so test runs
/// are reproducible.
pub struct TestWallet {
    keypair: sig::Keypair,
}

impl TestWallet {
    pub fn from_seed(seed: &[u8]) -> Self {
        Self {
            keypair: sig::Keypair::generate(Some(seed)),
        }
    }

    pub fn public_bytes(&self) -> Vec<u8> {
        self.keypair.public_bytes()
    }

    /// Pay-to-key locking script for this wallet.
    pub fn lock_script(&self) -> Vec<u8> {
        script::pay_to_key(&self.keypair.public_bytes())
    }

    /// Build and sign a transaction spending `inputs` (outpoint plus the
    /// entry it refers to, which must be locked to this wallet) into
    /// `outputs`.
    pub fn spend(
        &self,
        inputs: &[(OutPoint, UtxoEntry)],
        outputs: Vec<TxOutput>,
    ) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: inputs
                .iter()
                .map(|(op, _)| TxInput::new(*op, Vec::new()))
                .collect(),
            outputs,
            lock_time: 0,
        };

        for (index, (_, entry)) in inputs.iter().enumerate() {
            let digest = tx_sighash(&tx, index, &entry.output.script, entry.output.amount);
            let signature = self.keypair.sign(digest.as_bytes());
            tx.inputs[index].unlock_script = script::unlock_with_sig(&signature);
        }
        tx
    }

    /// Convenience: spend one coin entirely to `dest_script`, minus `fee`.
    pub fn send(
        &self,
        outpoint: OutPoint,
        entry: &UtxoEntry,
        dest_script: Vec<u8>,
        fee: u64,
    ) -> Transaction {
        let amount = entry.output.amount.checked_sub(fee).expect("fee exceeds coin");
        self.spend(
            &[(outpoint, entry.clone())],
            vec![TxOutput::new(amount, dest_script)],
        )
    }
}

/// Distinct deterministic hash for test fixtures.
pub fn test_hash(tag: u8) -> Hash {
    qbit_core::hash_tagged(qbit_core::tags::TX, &[tag])
}

#[cfg(test)]
mod tests {
    use super::*;
    use qbit_consensus::ScriptVm;

    #[test]
    fn test_wallet_spend_verifies() {
        let wallet = TestWallet::from_seed(b"generator wallet 1");
        let entry = UtxoEntry::new(TxOutput::new(1_000, wallet.lock_script()), 1, false);
        let outpoint = OutPoint::new(test_hash(1), 0);

        let tx = wallet.send(outpoint, &entry, vec![0x51], 100);
        assert_eq!(tx.outputs[0].amount, 900);

        let digest = tx_sighash(&tx, 0, &entry.output.script, entry.output.amount);
        assert!(
            ScriptVm::eval_input(&tx.inputs[0].unlock_script, &entry.output.script, &digest)
                .is_ok()
        );
    }

    #[test]
    fn test_wallets_are_deterministic() {
        let a = TestWallet::from_seed(b"same");
        let b = TestWallet::from_seed(b"same");
        assert_eq!(a.lock_script(), b.lock_script());
    }
}
