//! Configuration management for the ETH-like support library
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub chain: ChainConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub resubscribe: ResubscribeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub ws_url: String,
    /// Account whose nonce is reconciled on start
    pub account: Option<Address>,
    #[serde(default = "default_block_poll_interval_ms")]
    pub block_poll_interval_ms: u64,
    /// How long a seen head hash is remembered for deduplication
    #[serde(default = "default_head_dedupe_secs")]
    pub head_dedupe_secs: u64,
}

impl ChainConfig {
    pub fn block_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_poll_interval_ms)
    }

    pub fn head_dedupe_window(&self) -> Duration {
        Duration::from_secs(self.head_dedupe_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// 0 disables the token bucket
    pub requests_per_second: u32,
    /// 0 disables the in-flight bound
    pub concurrency_limit: usize,
    /// 0 selects the default of five minutes
    pub acquire_permit_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 0,
            concurrency_limit: 0,
            acquire_permit_timeout_secs: 300,
        }
    }
}

impl RateLimitConfig {
    pub fn acquire_permit_timeout(&self) -> Option<Duration> {
        (self.acquire_permit_timeout_secs > 0)
            .then(|| Duration::from_secs(self.acquire_permit_timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    pub check_interval_secs: u64,
    pub receipt_poll_interval_ms: u64,
    /// Ceiling for both the legacy gas price and the dynamic fee cap
    pub max_gas_price_gwei: u64,
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            receipt_poll_interval_ms: 1000,
            max_gas_price_gwei: 500,
        }
    }
}

impl MiningConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms)
    }

    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::exp10(9)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResubscribeConfig {
    pub backoff_max_secs: u64,
    pub alert_threshold_secs: u64,
    /// Unset retries forever
    pub max_elapsed_secs: Option<u64>,
    pub event_buffer: usize,
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            backoff_max_secs: 120,
            alert_threshold_secs: 15,
            max_elapsed_secs: None,
            event_buffer: 16,
        }
    }
}

impl ResubscribeConfig {
    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn alert_threshold(&self) -> Duration {
        Duration::from_secs(self.alert_threshold_secs)
    }

    pub fn max_elapsed(&self) -> Option<Duration> {
        self.max_elapsed_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".to_string(),
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset
    pub filter: Option<String>,
}

fn default_block_poll_interval_ms() -> u64 {
    1000
}

fn default_head_dedupe_secs() -> u64 {
    600
}

impl Settings {
    /// Load settings from `$ETHLIKE_CONFIG`, falling back to `config/default.toml`
    pub fn load() -> Result<Self> {
        let config_path = env::var("ETHLIKE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text, substituting environment variables first
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str)?;

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.chain.ws_url.is_empty() {
            anyhow::bail!("Chain {} has no WebSocket URL configured", self.chain.name);
        }
        if self.mining.check_interval_secs == 0 {
            anyhow::bail!("mining.check_interval_secs must be positive");
        }
        if self.mining.receipt_poll_interval_ms == 0 {
            anyhow::bail!("mining.receipt_poll_interval_ms must be positive");
        }
        if self.chain.block_poll_interval_ms == 0 {
            anyhow::bail!("chain.block_poll_interval_ms must be positive");
        }
        if self.chain.head_dedupe_secs == 0 {
            anyhow::bail!("chain.head_dedupe_secs must be positive");
        }
        if self.resubscribe.backoff_max_secs == 0 {
            anyhow::bail!("resubscribe.backoff_max_secs must be positive");
        }
        if self.mining.max_gas_price_gwei == 0 {
            tracing::warn!("mining.max_gas_price_gwei is 0 - stuck transactions will never be escalated");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .context("Invalid environment variable pattern")?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    Ok(result)
}
