//! Protocol constants and per-network chain parameters.
//! All monetary values in atoms (1 coin = 10^8 atoms).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const COIN: u64 = 100_000_000;

/// Input cap for a selection group with no segwit-capable members.
pub const MAX_INPUTS_LEGACY: usize = 499;

/// Input cap for a selection group containing segwit-capable members.
pub const MAX_INPUTS_SEGWIT: usize = 1460;

/// Default coinbase maturity on mainnet and testnet.
pub const DEFAULT_COINBASE_MATURITY: u32 = 100;

/// Network type: Mainnet, Testnet, or Regtest.
///
/// # Examples
///
/// ```
/// use sluice_core::constants::NetworkType;
/// let net: NetworkType = "regtest".parse().unwrap();
/// assert_eq!(net, NetworkType::Regtest);
/// assert_eq!(NetworkType::default(), NetworkType::Mainnet);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Production network.
    #[default]
    Mainnet,
    /// Public test network.
    Testnet,
    /// Local regression-test network with short maturity.
    Regtest,
}

impl NetworkType {
    /// Subdirectory name under the data directory.
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Mainnet => "",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for NetworkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Ok(Self::Mainnet),
            "testnet" | "test" => Ok(Self::Testnet),
            "regtest" => Ok(Self::Regtest),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Chain-specific parameters the wallet core depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainParams {
    pub network: NetworkType,
    /// Confirmations a coinbase output needs before it may be spent.
    pub coinbase_maturity: u32,
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network: NetworkType::Mainnet,
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: NetworkType::Testnet,
            coinbase_maturity: DEFAULT_COINBASE_MATURITY,
        }
    }

    pub fn regtest() -> Self {
        Self {
            network: NetworkType::Regtest,
            coinbase_maturity: 5,
        }
    }

    /// Parameters for a named network.
    pub fn for_network(network: NetworkType) -> Self {
        match network {
            NetworkType::Mainnet => Self::mainnet(),
            NetworkType::Testnet => Self::testnet(),
            NetworkType::Regtest => Self::regtest(),
        }
    }

    /// Whether a coinbase output mined at `height` is spendable at `tip`.
    ///
    /// ```
    /// use sluice_core::constants::ChainParams;
    /// let p = ChainParams::regtest();
    /// assert!(!p.is_coinbase_mature(10, 12));
    /// assert!(p.is_coinbase_mature(10, 14));
    /// ```
    pub fn is_coinbase_mature(&self, height: u32, tip: u32) -> bool {
        crate::types::confirmations(Some(height), tip) >= self.coinbase_maturity
    }
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}
