//! Wallet configuration.
//!
//! [`WalletConfig::load`] layers, lowest priority first: built-in defaults,
//! an optional TOML/JSON/YAML file, and `SLUICE_`-prefixed environment
//! variables (`SLUICE_LOG_LEVEL`, `SLUICE_SYNC__WORKERS`, ...).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use sluice_core::constants::{ChainParams, NetworkType};
use sluice_sync::SyncConfig;

use crate::error::WalletError;
use crate::ordering::OrderingPolicy;

/// Default fee rate in atoms per 1000 bytes.
pub const DEFAULT_FEE_PER_KB: u64 = 1_000;
/// Change below this value is added to the fee instead of creating an output.
pub const DEFAULT_DUST_LIMIT: u64 = 546;
/// Default time key material stays unlocked.
pub const DEFAULT_UNLOCK_TIMEOUT_SECS: u64 = 300;

const ENV_PREFIX: &str = "SLUICE";

/// Coin selection defaults applied when a request does not override them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// Input cap override. `None` uses the legacy/segwit caps.
    pub max_inputs: Option<usize>,
    /// How candidate inputs are ranked before selection.
    pub ordering: OrderingPolicy,
}

/// Configuration for a wallet instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Root directory for persistent data.
    pub data_dir: PathBuf,
    /// Network the wallet's addresses and chain parameters belong to.
    pub network: NetworkType,
    /// Log filter string (e.g. "info", "sluice_sync=debug").
    pub log_level: String,
    /// "text" or "json".
    pub log_format: String,
    /// Sync engine tuning.
    pub sync: SyncConfig,
    /// Coin selection defaults.
    pub selection: SelectionConfig,
    /// Fee rate in atoms per 1000 bytes.
    pub fee_per_kb: u64,
    /// Smallest change output worth creating.
    pub dust_limit: u64,
    /// Seconds key material stays unlocked after `unlock`.
    pub unlock_timeout_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sluice");

        Self {
            data_dir,
            network: NetworkType::Mainnet,
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            sync: SyncConfig::default(),
            selection: SelectionConfig::default(),
            fee_per_kb: DEFAULT_FEE_PER_KB,
            dust_limit: DEFAULT_DUST_LIMIT,
            unlock_timeout_secs: DEFAULT_UNLOCK_TIMEOUT_SECS,
        }
    }
}

impl WalletConfig {
    /// Defaults for `network`, with the data directory namespaced per network.
    pub fn for_network(network: NetworkType) -> Self {
        let mut config = Self { network, ..Self::default() };
        let suffix = network.data_dir_suffix();
        if !suffix.is_empty() {
            config.data_dir = config.data_dir.join(suffix);
        }
        config
    }

    /// Merge defaults, the optional file at `path` and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, WalletError> {
        let defaults = config::Config::try_from(&Self::default())
            .map_err(|e| WalletError::Config(e.to_string()))?;
        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| WalletError::Config(e.to_string()))
    }

    /// Path to the ledger database directory.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("ledger.db")
    }

    pub fn chain_params(&self) -> ChainParams {
        ChainParams::for_network(self.network)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults() {
        let config = WalletConfig::default();
        assert_eq!(config.fee_per_kb, DEFAULT_FEE_PER_KB);
        assert_eq!(config.sync.workers, 6);
        assert_eq!(config.selection.ordering, OrderingPolicy::AmountDesc);
        assert!(config.db_path().ends_with("sluice/ledger.db"));
        assert_eq!(config.chain_params(), ChainParams::mainnet());
    }

    #[test]
    fn regtest_namespaces_data_dir() {
        let config = WalletConfig::for_network(NetworkType::Regtest);
        assert!(config.data_dir.ends_with("sluice/regtest"));
        assert_eq!(config.chain_params().coinbase_maturity, 5);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "network = \"testnet\"\nfee_per_kb = 2500\n\n[sync]\nworkers = 2").unwrap();
        writeln!(file, "\n[selection]\nordering = \"oldest-first\"").unwrap();

        let config = WalletConfig::load(Some(&path)).unwrap();
        assert_eq!(config.network, NetworkType::Testnet);
        assert_eq!(config.fee_per_kb, 2500);
        assert_eq!(config.sync.workers, 2);
        assert_eq!(config.sync.batch_size, 8);
        assert_eq!(config.selection.ordering, OrderingPolicy::OldestFirst);
        assert_eq!(config.dust_limit, DEFAULT_DUST_LIMIT);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WalletConfig::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.fee_per_kb, DEFAULT_FEE_PER_KB);
    }
}
