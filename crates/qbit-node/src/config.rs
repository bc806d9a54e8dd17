//! Node configuration.

use qbit_consensus::{ChainParams, Network};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node name, for logs.
    pub node_name: String,
    /// Network (mainnet, testnet, regtest).
    pub network: String,
    /// Data directory for the database.
    pub data_dir: PathBuf,
    /// Storage tuning.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Mining configuration.
    #[serde(default)]
    pub mining: MiningConfig,
}

/// Storage tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// UTXO cache capacity in entries.
    pub utxo_cache_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            utxo_cache_capacity: qbit_state::DEFAULT_UTXO_CACHE_CAPACITY,
        }
    }
}

/// Mining configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Enable the built-in regtest solver loop.
    pub enabled: bool,
    /// Hex-encoded coinbase destination locking script.
    pub destination_script: Option<String>,
    /// Nonce attempts per template before refreshing.
    pub max_solve_attempts: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destination_script: None,
            max_solve_attempts: 1 << 20,
        }
    }
}

impl NodeConfig {
    /// Default configuration for a network.
    pub fn default_for_network(network: &str) -> Self {
        let data_dir = match network {
            "testnet" => PathBuf::from(".qbit-testnet"),
            "regtest" => PathBuf::from(".qbit-regtest"),
            _ => PathBuf::from(".qbit"),
        };
        Self {
            node_name: "qbit-node".to_string(),
            network: network.to_string(),
            data_dir,
            storage: StorageConfig::default(),
            mining: MiningConfig::default(),
        }
    }

    /// Load from a TOML file, falling back to network defaults when the file
    /// does not exist.
    pub fn load(path: &Path, network: &str) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default_for_network(network))
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    /// The consensus profile this configuration selects.
    pub fn chain_params(&self) -> ChainParams {
        let network = match self.network.as_str() {
            "testnet" => Network::Testnet,
            "regtest" => Network::Regtest,
            _ => Network::Mainnet,
        };
        ChainParams::for_network(network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default_for_network("mainnet");
        assert_eq!(config.network, "mainnet");
        assert_eq!(
            config.storage.utxo_cache_capacity,
            qbit_state::DEFAULT_UTXO_CACHE_CAPACITY
        );
        assert!(!config.mining.enabled);
    }

    #[test]
    fn test_network_selection() {
        assert!(matches!(
            NodeConfig::default_for_network("regtest").chain_params().network,
            Network::Regtest
        ));
        assert!(matches!(
            NodeConfig::default_for_network("mainnet").chain_params().network,
            Network::Mainnet
        ));
    }

    #[test]
    fn test_toml_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("qbit.toml");

        let mut config = NodeConfig::default_for_network("testnet");
        config.storage.utxo_cache_capacity = 77;
        config.save(&path).unwrap();

        let loaded = NodeConfig::load(&path, "mainnet").unwrap();
        assert_eq!(loaded.network, "testnet");
        assert_eq!(loaded.storage.utxo_cache_capacity, 77);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let loaded = NodeConfig::load(Path::new("/nonexistent/qbit.toml"), "regtest").unwrap();
        assert_eq!(loaded.network, "regtest");
    }
}
