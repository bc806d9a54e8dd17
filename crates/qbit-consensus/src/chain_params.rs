//! Per-network chain parameters and genesis construction.

use crate::params;
use qbit_core::{merkle_root, Block, BlockHeader, Hash, OutPoint, Transaction, TxInput, TxOutput};

/// Network selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    /// Local testing network: trivial difficulty, short block time.
    Regtest,
}

impl Network {
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }
}

/// Consensus profile for one network. Everything that differs between
/// mainnet, testnet and regtest lives here; the constants in
/// [`crate::params`] are shared by all three.
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub network: Network,
    /// Target solve time per block, in seconds.
    pub target_block_time: u32,
    /// Retarget averaging window in blocks.
    pub retarget_window: u32,
    /// Easiest permitted target, compact form. Also the genesis target.
    pub max_target_bits: u32,
    /// Genesis block timestamp.
    pub genesis_time: u32,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            target_block_time: params::TARGET_BLOCK_TIME,
            retarget_window: params::RETARGET_WINDOW,
            max_target_bits: params::MAX_TARGET_BITS,
            genesis_time: 1_735_689_600, // 2025-01-01 00:00:00 UTC
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            genesis_time: 1_735_693_200,
            ..Self::mainnet()
        }
    }

    /// Regtest keeps the easiest target for every block and a one-second
    /// solve target so tests can mine chains quickly.
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            target_block_time: 1,
            retarget_window: params::RETARGET_WINDOW,
            max_target_bits: params::MAX_TARGET_BITS,
            genesis_time: 1_700_000_000,
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// The genesis block. Height 0, all-zero parent, an unspendable coinbase
    /// carrying the network name, no reward.
    pub fn genesis(&self) -> Block {
        let mut unlock = vec![0u8]; // height commitment: varint 0
        unlock.extend_from_slice(self.network.name().as_bytes());

        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxInput::new(OutPoint::COINBASE, unlock)],
            outputs: vec![TxOutput::new(0, crate::script::unspendable(b"qbit genesis"))],
            lock_time: 0,
        };

        let header = BlockHeader {
            version: params::HEADER_VERSION,
            prev_block: Hash::ZERO,
            merkle_root: merkle_root(&[coinbase.txid()]),
            time: self.genesis_time,
            target: self.max_target_bits,
            nonce: 0,
        };

        Block {
            header,
            transactions: vec![coinbase],
        }
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
