//! Configuration management for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub node: NodeConfig,
    #[serde(default)]
    pub txm: TxmConfig,
    #[serde(default)]
    pub gas_estimator: GasEstimatorConfig,
    pub da_oracle: Option<DaOracleConfig>,
    pub database: Option<DatabaseConfig>,
    pub metrics: MetricsConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TxmConfig {
    pub min_confirmations: u64,
    /// Blocks an attempt may stay unmined before it is bumped; 0 disables bumping
    pub gas_bump_threshold: u64,
    pub gas_bump_wei: u64,
    /// Minimum replacement increase the node enforces
    pub gas_bump_percent: u16,
    pub gas_limit_default: u64,
    pub max_bump_retries: u32,
    pub poll_interval_ms: u64,
}

impl Default for TxmConfig {
    fn default() -> Self {
        Self {
            min_confirmations: 12,
            gas_bump_threshold: 3,
            gas_bump_wei: 5_000_000_000,
            gas_bump_percent: 20,
            gas_limit_default: 500_000,
            max_bump_retries: 5,
            poll_interval_ms: 5_000,
        }
    }
}

impl TxmConfig {
    pub fn gas_bump_wei(&self) -> U256 {
        U256::from(self.gas_bump_wei)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GasEstimatorConfig {
    pub eip1559_dynamic_fees: bool,
    pub price_default_wei: u64,
    pub price_min_wei: u64,
    pub price_max_wei: u64,
    pub tip_cap_default_wei: u64,
    pub tip_cap_min_wei: u64,
    pub refresh_interval_ms: u64,
    pub block_history: BlockHistoryConfig,
}

impl Default for GasEstimatorConfig {
    fn default() -> Self {
        Self {
            eip1559_dynamic_fees: false,
            price_default_wei: 20_000_000_000,
            price_min_wei: 1_000_000_000,
            price_max_wei: 500_000_000_000,
            tip_cap_default_wei: 1_000_000_000,
            tip_cap_min_wei: 1,
            refresh_interval_ms: 5_000,
            block_history: BlockHistoryConfig::default(),
        }
    }
}

impl GasEstimatorConfig {
    pub fn price_default(&self) -> U256 {
        U256::from(self.price_default_wei)
    }

    pub fn price_min(&self) -> U256 {
        U256::from(self.price_min_wei)
    }

    pub fn price_max(&self) -> U256 {
        U256::from(self.price_max_wei)
    }

    pub fn tip_cap_default(&self) -> U256 {
        U256::from(self.tip_cap_default_wei)
    }

    pub fn tip_cap_min(&self) -> U256 {
        U256::from(self.tip_cap_min_wei)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BlockHistoryConfig {
    /// Blocks requested per RPC batch; 0 fetches everything in one batch
    pub batch_size: u32,
    pub block_history_size: u16,
    /// Blocks to trail behind the reported head
    pub block_delay: u16,
    pub transaction_percentile: u16,
    /// 0 disables the inclusion check
    pub check_inclusion_blocks: u16,
    pub check_inclusion_percentile: u16,
    /// Defaults to `gas_bump_threshold + 1` when unset
    pub eip1559_fee_cap_buffer_blocks: Option<u16>,
}

impl Default for BlockHistoryConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            block_history_size: 8,
            block_delay: 1,
            transaction_percentile: 60,
            check_inclusion_blocks: 12,
            check_inclusion_percentile: 50,
            eip1559_fee_cap_buffer_blocks: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DaOracleType {
    OpStack,
    Arbitrum,
    Custom,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaOracleConfig {
    pub oracle_type: DaOracleType,
    pub oracle_address: String,
    pub custom_calldata: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.node.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.node.name);
        }

        let gas = &self.gas_estimator;
        if gas.price_min_wei > gas.price_default_wei || gas.price_default_wei > gas.price_max_wei {
            anyhow::bail!("gas prices must satisfy price_min <= price_default <= price_max");
        }
        if gas.tip_cap_min_wei > gas.tip_cap_default_wei {
            anyhow::bail!("tip_cap_min must not exceed tip_cap_default");
        }

        let history = &gas.block_history;
        if history.block_history_size == 0 {
            anyhow::bail!("block_history_size must be greater than 0");
        }
        if history.transaction_percentile > 100 || history.check_inclusion_percentile > 100 {
            anyhow::bail!("percentiles must be between 0 and 100");
        }

        if self.txm.gas_bump_percent == 0 {
            anyhow::bail!("gas_bump_percent must be at least 1, nodes reject equal-priced replacements");
        }

        if let Some(da) = &self.da_oracle {
            if da.oracle_address.is_empty() {
                anyhow::bail!("da_oracle.oracle_address is required");
            }
            if da.oracle_type == DaOracleType::Custom && da.custom_calldata.is_none() {
                anyhow::bail!("da_oracle.custom_calldata is required for the custom oracle type");
            }
        }

        if self.database.is_none() {
            tracing::warn!("No database configured - transactions will not survive a restart");
        }

        Ok(())
    }

    /// Fee cap buffer blocks, falling back to one more than the bump threshold
    pub fn fee_cap_buffer_blocks(&self) -> u16 {
        fee_cap_buffer_blocks(&self.gas_estimator.block_history, self.txm.gas_bump_threshold)
    }
}

pub fn fee_cap_buffer_blocks(history: &BlockHistoryConfig, gas_bump_threshold: u64) -> u16 {
    history
        .eip1559_fee_cap_buffer_blocks
        .unwrap_or_else(|| {
            u16::try_from(gas_bump_threshold.saturating_add(1)).unwrap_or(u16::MAX)
        })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
    }

    let mut result = input.to_string();
    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [node]
        chain_id = 10
        name = "optimism"
        rpc_urls = ["https://rpc.example.com/${TXM_TEST_RPC_KEY}"]
        request_timeout_ms = 10000

        [txm]
        min_confirmations = 3
        gas_bump_threshold = 12

        [gas_estimator]
        eip1559_dynamic_fees = true

        [gas_estimator.block_history]
        block_history_size = 24
        transaction_percentile = 55

        [da_oracle]
        oracle_type = "op_stack"
        oracle_address = "0x420000000000000000000000000000000000000F"

        [metrics]
        enabled = false
        port = 9100

        [wallet]
        private_key_env = "TXM_PRIVATE_KEY"
    "#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_parse_sample_with_defaults() {
        env::set_var("TXM_TEST_RPC_KEY", "secret");
        let settings = Settings::from_toml_str(SAMPLE).unwrap();

        assert_eq!(settings.node.rpc_urls[0], "https://rpc.example.com/secret");
        assert_eq!(settings.txm.min_confirmations, 3);
        assert_eq!(settings.txm.gas_bump_percent, 20);
        assert_eq!(settings.gas_estimator.block_history.block_history_size, 24);
        assert_eq!(settings.gas_estimator.block_history.batch_size, 25);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert_eq!(
            settings.da_oracle.as_ref().map(|d| d.oracle_type),
            Some(DaOracleType::OpStack)
        );
        // unset buffer falls back to bump threshold + 1
        assert_eq!(settings.fee_cap_buffer_blocks(), 13);
    }

    #[test]
    fn test_fee_cap_buffer_blocks_fallback() {
        let mut history = BlockHistoryConfig::default();
        history.eip1559_fee_cap_buffer_blocks = None;
        assert_eq!(fee_cap_buffer_blocks(&history, 3), 4);
        assert_eq!(fee_cap_buffer_blocks(&history, 70_000), u16::MAX);
        assert_eq!(fee_cap_buffer_blocks(&history, u64::MAX), u16::MAX);

        history.eip1559_fee_cap_buffer_blocks = Some(2);
        assert_eq!(fee_cap_buffer_blocks(&history, u64::MAX), 2);
    }

    #[test]
    fn test_rejects_out_of_range_percentile() {
        let bad = SAMPLE.replace("transaction_percentile = 55", "transaction_percentile = 101");
        assert!(Settings::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_rejects_custom_oracle_without_calldata() {
        let bad = SAMPLE.replace("\"op_stack\"", "\"custom\"");
        assert!(Settings::from_toml_str(&bad).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.node.chain_id, 10);
        assert!(settings.gas_estimator.eip1559_dynamic_fees);
    }

    #[test]
    fn test_shipped_default_config_parses() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let settings = Settings::load_from(&path).unwrap();

        assert_eq!(settings.txm.gas_bump_threshold, 3);
        assert_eq!(settings.fee_cap_buffer_blocks(), 4);
        assert!(settings.database.is_some());
        assert!(settings.da_oracle.is_none());
    }
}
