//! Application configuration.
//!
//! Loaded from TOML (`CASCADE_CONFIG` env var, falling back to
//! `config/default.toml`), with API credentials overridable from the
//! environment so secrets stay out of config files.

use crate::error::{AppError, AppResult};
use cascade_core::{Symbol, SymbolSettings, TimeInForce};
use cascade_position::TranchePnlBasis;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Venue connectivity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,
    #[serde(default = "default_call_deadline_ms")]
    pub call_deadline_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_base_url() -> String {
    "https://fapi.asterdex.com".to_string()
}

fn default_ws_url() -> String {
    "wss://fstream.asterdex.com".to_string()
}

fn default_recv_window_ms() -> u64 {
    5000
}

fn default_call_deadline_ms() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for VenueConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            api_key: String::new(),
            api_secret: String::new(),
            recv_window_ms: default_recv_window_ms(),
            call_deadline_ms: default_call_deadline_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Engine behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Rolling volume window.
    #[serde(default = "default_window_ms")]
    pub window_ms: i64,
    #[serde(default)]
    pub simulate_only: bool,
    #[serde(default = "default_true")]
    pub hedge_mode: bool,
    #[serde(default)]
    pub multi_assets_mode: bool,
    /// Max age for unfilled entry orders.
    #[serde(default = "default_order_ttl_ms")]
    pub order_ttl_ms: u64,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders_per_symbol: u32,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure_usdt: Decimal,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    /// Rate governor safety buffer (fraction, e.g. 0.10).
    #[serde(default = "default_rate_buffer")]
    pub rate_limit_buffer_pct: f64,
    #[serde(default = "default_tranche_increment")]
    pub tranche_pnl_increment_pct: Decimal,
    #[serde(default = "default_max_tranches")]
    pub max_tranches_per_symbol_side: usize,
    #[serde(default)]
    pub tranche_pnl_basis: TranchePnlBasis,
    /// Enables the mark-price fast path (C9).
    #[serde(default = "default_true")]
    pub use_position_monitor: bool,
    #[serde(default = "default_true")]
    pub instant_tp_enabled: bool,
    #[serde(default = "default_reconnect_ms")]
    pub price_monitor_reconnect_ms: u64,
    #[serde(default = "default_true")]
    pub batch_orders_enabled: bool,
    /// Intake burst coalescing window; 0 disables.
    #[serde(default)]
    pub buffer_window_ms: u64,
    #[serde(default = "default_max_stop_orders")]
    pub max_stop_orders_per_symbol: usize,
    #[serde(default = "default_reconcile_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_hard_stop_secs")]
    pub hard_stop_timeout_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_window_ms() -> i64 {
    60_000
}

fn default_true() -> bool {
    true
}

fn default_order_ttl_ms() -> u64 {
    60_000
}

fn default_max_open_orders() -> u32 {
    5
}

fn default_max_total_exposure() -> Decimal {
    Decimal::from(10_000)
}

fn default_rate_buffer() -> f64 {
    0.10
}

fn default_tranche_increment() -> Decimal {
    Decimal::from(5)
}

fn default_max_tranches() -> usize {
    5
}

fn default_reconnect_ms() -> u64 {
    5000
}

fn default_max_stop_orders() -> usize {
    8
}

fn default_reconcile_secs() -> u64 {
    60
}

fn default_hard_stop_secs() -> u64 {
    15
}

fn default_db_path() -> String {
    "cascade.db".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty engine config uses defaults")
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub venue: VenueConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub symbols: HashMap<Symbol, SymbolSettings>,
}

impl AppConfig {
    /// Load from `CASCADE_CONFIG` or `config/default.toml`.
    pub fn load() -> AppResult<Self> {
        let path =
            std::env::var("CASCADE_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        if Path::new(&path).exists() {
            Self::from_file(&path)
        } else {
            tracing::warn!(path = %path, "Config file not found, using defaults");
            Ok(Self::default().into_env())
        }
    }

    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("failed to read {path}: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("failed to parse {path}: {e}")))?;
        Ok(config.into_env())
    }

    fn into_env(mut self) -> Self {
        if let Ok(key) = std::env::var("CASCADE_API_KEY") {
            self.venue.api_key = key;
        }
        if let Ok(secret) = std::env::var("CASCADE_API_SECRET") {
            self.venue.api_secret = secret;
        }
        self
    }

    /// Validate; failures are fatal (exit code 2).
    pub fn validate(&self) -> AppResult<()> {
        if !self.engine.simulate_only
            && (self.venue.api_key.is_empty() || self.venue.api_secret.is_empty())
        {
            return Err(AppError::Config(
                "api_key/api_secret required unless simulate_only is set".into(),
            ));
        }
        if !(0.0..=0.5).contains(&self.engine.rate_limit_buffer_pct) {
            return Err(AppError::Config(format!(
                "rate_limit_buffer_pct {} outside [0, 0.5]",
                self.engine.rate_limit_buffer_pct
            )));
        }
        if self.engine.window_ms <= 0 {
            return Err(AppError::Config("window_ms must be positive".into()));
        }
        if self.engine.tranche_pnl_increment_pct <= Decimal::ZERO {
            return Err(AppError::Config(
                "tranche_pnl_increment_pct must be positive".into(),
            ));
        }
        if self.engine.max_tranches_per_symbol_side < 1 {
            return Err(AppError::Config(
                "max_tranches_per_symbol_side must be at least 1".into(),
            ));
        }
        for (symbol, settings) in &self.symbols {
            if settings.leverage == 0 {
                return Err(AppError::Config(format!("{symbol}: leverage must be >= 1")));
            }
            if settings.trade_value_usdt <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "{symbol}: trade_value_usdt must be positive"
                )));
            }
            if settings.take_profit_enabled && settings.take_profit_pct <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "{symbol}: take_profit_pct must be positive"
                )));
            }
            if settings.stop_loss_enabled && settings.stop_loss_pct <= Decimal::ZERO {
                return Err(AppError::Config(format!(
                    "{symbol}: stop_loss_pct must be positive"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_full_config() {
        let raw = r#"
            [venue]
            base_url = "https://fapi.example.com"
            api_key = "k"
            api_secret = "s"

            [engine]
            window_ms = 30000
            hedge_mode = true
            max_total_exposure_usdt = "5000"
            tranche_pnl_increment_pct = "4"
            tranche_pnl_basis = "latest"

            [symbols.BTCUSDT]
            volume_threshold_long = "100000"
            trade_value_usdt = "100"
            leverage = 10
            take_profit_pct = "2"
            stop_loss_pct = "1"
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.engine.window_ms, 30_000);
        assert_eq!(config.engine.tranche_pnl_basis, TranchePnlBasis::Latest);
        let settings = config.symbols.get(&Symbol::new("BTCUSDT")).unwrap();
        assert_eq!(settings.volume_threshold_long, dec!(100000));
        assert_eq!(settings.leverage, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.window_ms, 60_000);
        assert!(config.engine.hedge_mode);
        assert!(config.engine.instant_tp_enabled);
        assert_eq!(config.engine.max_tranches_per_symbol_side, 5);
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_simulate_only_skips_credentials() {
        let config: AppConfig = toml::from_str("[engine]\nsimulate_only = true").unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_buffer_rejected() {
        let raw = r#"
            [engine]
            simulate_only = true
            rate_limit_buffer_pct = 0.9
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_leverage_rejected() {
        let raw = r#"
            [engine]
            simulate_only = true

            [symbols.BTCUSDT]
            leverage = 0
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert!(config.validate().is_err());
    }
}
