//! Configuration management for the transaction engine
//!
//! Loads a TOML file with `${VAR}` environment substitution, then applies
//! `TXPILOT__SECTION__KEY` environment overrides on top.

use crate::tx::{ConfirmationTiers, RetryPolicy};

use anyhow::{Context, Result};
use ethers::types::U256;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    pub chain: ChainConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub verification: VerificationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Records are kept in memory only when absent
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_gas_limit_buffer")]
    pub gas_limit_buffer_percent: u64,
    /// Block hashes older than this many blocks below head are forgotten
    #[serde(default = "default_reorg_retention")]
    pub reorg_retention_blocks: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    #[serde(default)]
    pub name: String,
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_gas_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price")]
    pub max_gas_price_gwei: u64,
    #[serde(default = "default_priority_fee")]
    pub priority_fee_gwei: u64,
    /// Multicall3 deployment used to batch reads
    #[serde(default)]
    pub multicall_address: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
    Arbitrum,
    Optimism,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmationConfig {
    /// Values at or below this (in wei) need a single confirmation
    #[serde(default = "default_negligible_value")]
    pub negligible_value_wei: String,
    /// Values at or above this (in wei) need the deepest tier
    #[serde(default = "default_large_value")]
    pub large_value_wei: String,
    #[serde(default = "default_confirmation_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_bump_percent")]
    pub bump_percent: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_max_poll_errors")]
    pub max_poll_errors: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerificationConfig {
    #[serde(default = "default_gas_warning_ratio")]
    pub gas_warning_ratio: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Name of the environment variable holding the hex private key
    #[serde(default = "default_private_key_env")]
    pub private_key_env: String,
}

fn default_instance_id() -> String {
    "txpilot".to_string()
}
fn default_event_capacity() -> usize {
    crate::events::DEFAULT_EVENT_CAPACITY
}
fn default_gas_limit_buffer() -> u64 {
    crate::tx::gas::DEFAULT_GAS_LIMIT_BUFFER_PERCENT
}
fn default_reorg_retention() -> u64 {
    256
}
fn default_gas_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}
fn default_max_gas_price() -> u64 {
    500
}
fn default_priority_fee() -> u64 {
    2
}
fn default_request_timeout() -> u64 {
    30
}
fn default_negligible_value() -> String {
    // 0.001 ether
    "1000000000000000".to_string()
}
fn default_large_value() -> String {
    // 10 ether
    "10000000000000000000".to_string()
}
fn default_confirmation_timeout() -> u64 {
    60
}
fn default_poll_interval() -> u64 {
    2_000
}
fn default_bump_percent() -> u64 {
    120
}
fn default_max_attempts() -> u32 {
    5
}
fn default_backoff() -> Vec<u64> {
    vec![1_000, 2_000, 5_000]
}
fn default_max_poll_errors() -> u32 {
    20
}
fn default_gas_warning_ratio() -> f64 {
    0.95
}
fn default_cache_ttl() -> u64 {
    30
}
fn default_purge_interval() -> u64 {
    60
}
fn default_max_connections() -> u32 {
    10
}
fn default_min_connections() -> u32 {
    1
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}
fn default_metrics_port() -> u16 {
    9090
}
fn default_private_key_env() -> String {
    "TXPILOT_PRIVATE_KEY".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            event_capacity: default_event_capacity(),
            gas_limit_buffer_percent: default_gas_limit_buffer(),
            reorg_retention_blocks: default_reorg_retention(),
        }
    }
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            negligible_value_wei: default_negligible_value(),
            large_value_wei: default_large_value(),
            timeout_secs: default_confirmation_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            bump_percent: default_bump_percent(),
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff(),
            max_poll_errors: default_max_poll_errors(),
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            gas_warning_ratio: default_gas_warning_ratio(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_api_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_metrics_port(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: default_private_key_env(),
        }
    }
}

impl ConfirmationConfig {
    pub fn tiers(&self) -> Result<ConfirmationTiers> {
        Ok(ConfirmationTiers {
            negligible_value: parse_wei("negligible_value_wei", &self.negligible_value_wei)?,
            large_value: parse_wei("large_value_wei", &self.large_value_wei)?,
            timeout: Duration::from_secs(self.timeout_secs),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        })
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            bump_percent: self.bump_percent,
            max_attempts: self.max_attempts,
            backoff: self.backoff_ms.iter().map(|ms| Duration::from_millis(*ms)).collect(),
            max_poll_errors: self.max_poll_errors,
        }
    }
}

impl VerificationConfig {
    /// Ratio as basis points
    pub fn gas_warning_bps(&self) -> u64 {
        (self.gas_warning_ratio * 10_000.0).round() as u64
    }
}

impl Settings {
    /// Load settings from `TXPILOT_CONFIG` (default `config/default.toml`)
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXPILOT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));
        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let raw = substitute_env_vars(&raw);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(&raw, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("TXPILOT")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| "Failed to assemble configuration")?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string, without environment overrides
    pub fn parse(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(&substitute_env_vars(raw))
            .with_context(|| "Failed to parse configuration")?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.chain_id == 0 {
            anyhow::bail!("chain.chain_id must be set");
        }
        if self.chain.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.chain.chain_id);
        }
        if self.retry.bump_percent <= 100 {
            anyhow::bail!("retry.bump_percent must be above 100, got {}", self.retry.bump_percent);
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        let ratio = self.verification.gas_warning_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            anyhow::bail!("verification.gas_warning_ratio must be in (0, 1], got {}", ratio);
        }

        let tiers = self.confirmation.tiers()?;
        if tiers.negligible_value >= tiers.large_value {
            anyhow::bail!("confirmation.negligible_value_wei must be below large_value_wei");
        }
        if self.chain.multicall_address.is_none() {
            tracing::warn!("No multicall address for chain {} - reads will not be batched", self.chain.chain_id);
        }

        Ok(())
    }
}

fn parse_wei(field: &str, value: &str) -> Result<U256> {
    U256::from_dec_str(value.trim())
        .map_err(|e| anyhow::anyhow!("confirmation.{} is not a decimal wei amount: {}", field, e))
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    ENV_VAR
        .replace_all(input, |caps: &regex::Captures| env::var(&caps[1]).unwrap_or_default())
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
        [chain]
        chain_id = 11155111
        rpc_urls = ["https://rpc.example.org"]
    "#;

    #[test]
    fn env_var_substitution() {
        env::set_var("TXPILOT_TEST_RPC_KEY", "secret");
        let input = "url = \"https://rpc.example.org/${TXPILOT_TEST_RPC_KEY}/v1\"";
        assert_eq!(
            substitute_env_vars(input),
            "url = \"https://rpc.example.org/secret/v1\""
        );
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let settings = Settings::parse(MINIMAL).unwrap();
        assert_eq!(settings.chain.gas_price_strategy, GasPriceStrategy::Eip1559);
        assert!(settings.database.is_none());
        assert_eq!(settings.retry.policy(), RetryPolicy::default());
        assert_eq!(settings.verification.gas_warning_bps(), 9_500);

        let tiers = settings.confirmation.tiers().unwrap();
        assert_eq!(tiers.timeout, Duration::from_secs(60));
        assert_eq!(tiers.large_value, U256::exp10(19));
    }

    #[test]
    fn rejects_non_increasing_bump() {
        let raw = format!("{}\n[retry]\nbump_percent = 100\n", MINIMAL);
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn rejects_garbled_value_thresholds() {
        let raw = format!("{}\n[confirmation]\nlarge_value_wei = \"ten ether\"\n", MINIMAL);
        assert!(Settings::parse(&raw).is_err());
    }

    #[test]
    fn file_is_layered_with_environment_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}\n[api]\nport = 8181\n[database]\nurl = \"postgres://localhost/txpilot\"\n",
            MINIMAL
        )
        .unwrap();

        env::set_var("TXPILOT__METRICS__PORT", "9999");
        let settings = Settings::load_from(file.path()).unwrap();
        env::remove_var("TXPILOT__METRICS__PORT");

        assert_eq!(settings.api.port, 8181);
        assert_eq!(settings.metrics.port, 9999);
        assert_eq!(settings.database.unwrap().max_connections, 10);
    }
}
