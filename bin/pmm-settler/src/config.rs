//! Network tables and rebalance policy, loaded from a TOML file. Process-
//! level flags and secrets ride on the CLI/environment instead (see
//! `SettlerArgs` in `lib.rs`).

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("Failed to read config file {path}: {source}"))]
    ReadConfig {
        path: String,
        source: config::ConfigError,
    },

    #[snafu(display("Invalid config value: {reason}"))]
    InvalidValue { reason: String },
}

pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Deserialize)]
pub struct SettlerConfig {
    #[serde(default)]
    pub evm_networks: Vec<EvmNetworkConfig>,
    pub bitcoin: BitcoinConfig,
    pub solana: Option<SolanaConfig>,
    pub rebalance: RebalanceSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmNetworkConfig {
    /// Router-side network id (the chain id as a decimal string).
    pub network_id: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Hard ceiling on the gas price in gwei; unset means only the 3× base
    /// fee cap applies.
    pub max_gas_price_gwei: Option<u64>,
    /// Liquidation deployment, when this network has one.
    pub liquidation_vault: Option<String>,
    #[serde(default)]
    pub liquidation_approver_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinConfig {
    /// "bitcoin" or "testnet".
    pub network: String,
    /// Esplora-compatible backends, raced on every read.
    pub provider_urls: Vec<String>,
    #[serde(default = "default_max_fee_rate")]
    pub max_fee_rate: f64,
    #[serde(default)]
    pub allow_unconfirmed: bool,
}

fn default_max_fee_rate() -> f64 {
    100.0
}

impl BitcoinConfig {
    pub fn parse_network(&self) -> Result<bitcoin::Network> {
        match self.network.as_str() {
            "bitcoin" | "mainnet" => Ok(bitcoin::Network::Bitcoin),
            "testnet" => Ok(bitcoin::Network::Testnet),
            "regtest" => Ok(bitcoin::Network::Regtest),
            other => InvalidValueSnafu {
                reason: format!("unknown bitcoin network {other}"),
            }
            .fail(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub program_id: String,
    pub fee_vault: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceSettings {
    pub slippage_threshold_bps: u64,
    /// Final recipient of the swapped asset.
    pub vault_recipient: String,
    #[serde(default = "default_to_asset")]
    pub to_asset: String,
    /// Idle balance threshold that opens a rebalance.
    pub min_idle_sats: u64,
    /// Hours of retrying before a record is parked as Stuck.
    #[serde(default = "default_max_retry_hours")]
    pub max_retry_hours: i64,
}

fn default_to_asset() -> String {
    "USDC".to_string()
}

fn default_max_retry_hours() -> i64 {
    12
}

impl SettlerConfig {
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .context(ReadConfigSnafu {
                path: path.to_string(),
            })?;
        let parsed: SettlerConfig = settings.try_deserialize().context(ReadConfigSnafu {
            path: path.to_string(),
        })?;

        if parsed.bitcoin.provider_urls.is_empty() {
            return InvalidValueSnafu {
                reason: "bitcoin.provider_urls must list at least one backend".to_string(),
            }
            .fail();
        }
        parsed.bitcoin.parse_network()?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let toml = r#"
            [[evm_networks]]
            network_id = "8453"
            chain_id = 8453
            rpc_url = "http://localhost:8545"
            max_gas_price_gwei = 50
            liquidation_vault = "0x3333333333333333333333333333333333333333"
            liquidation_approver_keys = ["0xaa", "0xbb"]

            [bitcoin]
            network = "testnet"
            provider_urls = ["http://explorer-a", "http://explorer-b"]
            max_fee_rate = 80.0
            allow_unconfirmed = false

            [solana]
            rpc_url = "http://localhost:8899"
            program_id = "Sett1ement111111111111111111111111111111111"
            fee_vault = "Fee1111111111111111111111111111111111111111"

            [rebalance]
            slippage_threshold_bps = 50
            vault_recipient = "0x4444444444444444444444444444444444444444"
            min_idle_sats = 1000000
        "#;
        let settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap();
        let parsed: SettlerConfig = settings.try_deserialize().unwrap();

        assert_eq!(parsed.evm_networks.len(), 1);
        assert_eq!(parsed.evm_networks[0].chain_id, 8453);
        assert_eq!(parsed.bitcoin.provider_urls.len(), 2);
        assert_eq!(parsed.bitcoin.parse_network().unwrap(), bitcoin::Network::Testnet);
        assert!(parsed.solana.is_some());
        // defaults
        assert_eq!(parsed.rebalance.to_asset, "USDC");
        assert_eq!(parsed.rebalance.max_retry_hours, 12);
    }

    #[test]
    fn rejects_unknown_bitcoin_network() {
        let config = BitcoinConfig {
            network: "dogecoin".to_string(),
            provider_urls: vec!["http://x".to_string()],
            max_fee_rate: 10.0,
            allow_unconfirmed: false,
        };
        assert!(config.parse_network().is_err());
    }
}
