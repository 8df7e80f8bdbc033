//! Configuration management for the basis bot.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange API credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Account + instrument under management
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    /// Rebalance controller parameters
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Record store location
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// API passphrase (set at key creation)
    #[serde(default)]
    pub passphrase: String,
    /// Use the demo-trading endpoints instead of production
    #[serde(default)]
    pub testnet: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Account identifier scoping all ledger/portfolio records
    #[serde(default = "default_account_id")]
    pub account_id: i64,
    /// Underlying coin, e.g. "BTC"
    #[serde(default = "default_instrument")]
    pub instrument: String,
    /// Target swap leverage
    #[serde(default = "default_leverage")]
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Hours before an in-flight rebalance operation is accelerated
    #[serde(default = "default_accelerate_after_hours")]
    pub accelerate_after_hours: u32,
    /// Lookback window for spread statistics when no override applies
    #[serde(default = "default_stat_lookback_hours")]
    pub stat_lookback_hours: u32,
    /// Minimum wall-clock spacing between controller ticks, seconds
    #[serde(default = "default_min_tick_spacing_secs")]
    pub min_tick_spacing_secs: u64,
    /// Funding settlement cycle, hours (8 on most venues)
    #[serde(default = "default_funding_cycle_hours")]
    pub funding_cycle_hours: u32,
    /// Width of the pre-funding window in which the close decision is taken
    #[serde(default = "default_pre_funding_close_hours")]
    pub pre_funding_close_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database holding ledger/portfolio/checkpoints
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_account_id() -> i64 {
    1
}

fn default_instrument() -> String {
    "BTC".to_string()
}

fn default_leverage() -> u32 {
    3
}

fn default_accelerate_after_hours() -> u32 {
    2
}

fn default_stat_lookback_hours() -> u32 {
    4
}

fn default_min_tick_spacing_secs() -> u64 {
    10
}

fn default_funding_cycle_hours() -> u32 {
    8
}

fn default_pre_funding_close_hours() -> u32 {
    4
}

fn default_db_path() -> String {
    "data/basis_bot.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("BASIS"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.portfolio.leverage >= 2,
            "leverage must be >= 2: the add/reduce thresholds divide by (leverage - 1)"
        );

        anyhow::ensure!(
            !self.portfolio.instrument.is_empty(),
            "instrument must not be empty"
        );

        anyhow::ensure!(
            self.monitor.accelerate_after_hours >= 1,
            "accelerate_after_hours must be >= 1"
        );

        anyhow::ensure!(
            self.monitor.pre_funding_close_hours < self.monitor.funding_cycle_hours,
            "pre_funding_close_hours must be shorter than the funding cycle"
        );

        Ok(())
    }

    /// Leverage as a `Decimal` for threshold arithmetic.
    pub fn leverage_dec(&self) -> Decimal {
        Decimal::from(self.portfolio.leverage)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exchange: ExchangeConfig::default(),
            portfolio: PortfolioConfig::default(),
            monitor: MonitorConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            passphrase: String::new(),
            testnet: false,
        }
    }
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            account_id: default_account_id(),
            instrument: default_instrument(),
            leverage: default_leverage(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            accelerate_after_hours: default_accelerate_after_hours(),
            stat_lookback_hours: default_stat_lookback_hours(),
            min_tick_spacing_secs: default_min_tick_spacing_secs(),
            funding_cycle_hours: default_funding_cycle_hours(),
            pre_funding_close_hours: default_pre_funding_close_hours(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_leverage_floor_rejected() {
        let mut config = Config::default();
        config.portfolio.leverage = 1;
        assert!(config.validate().is_err());
    }
}
