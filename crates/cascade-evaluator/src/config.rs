//! Evaluator configuration.

use cascade_core::{Symbol, SymbolSettings, TimeInForce};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Track LONG and SHORT positions independently.
    #[serde(default)]
    pub hedge_mode: bool,
    /// Record orders without submitting them.
    #[serde(default)]
    pub simulate_only: bool,
    #[serde(default)]
    pub time_in_force: TimeInForce,
    #[serde(default = "default_max_total_exposure")]
    pub max_total_exposure_usdt: Decimal,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders_per_symbol: u32,
    /// Depth fetched for entry pricing; small limits keep the weight at 2.
    #[serde(default = "default_depth_limit")]
    pub depth_limit: u32,
    #[serde(default)]
    pub symbols: HashMap<Symbol, SymbolSettings>,
}

fn default_max_total_exposure() -> Decimal {
    Decimal::from(10_000)
}

fn default_max_open_orders() -> u32 {
    5
}

fn default_depth_limit() -> u32 {
    20
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            hedge_mode: false,
            simulate_only: false,
            time_in_force: TimeInForce::default(),
            max_total_exposure_usdt: default_max_total_exposure(),
            max_open_orders_per_symbol: default_max_open_orders(),
            depth_limit: default_depth_limit(),
            symbols: HashMap::new(),
        }
    }
}

impl EvaluatorConfig {
    pub fn settings(&self, symbol: &Symbol) -> Option<&SymbolSettings> {
        self.symbols.get(symbol)
    }
}
