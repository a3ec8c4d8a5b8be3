//! Per-symbol trading settings.
//!
//! Shared by the evaluator (thresholds, sizing, pricing) and the position
//! engine (protection percentages, working type).

use crate::{MarginType, TradeSide, WorkingType};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSettings {
    /// Windowed USDT volume required to open a LONG.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold_long: Decimal,
    /// Windowed USDT volume required to open a SHORT.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold_short: Decimal,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub margin_type: MarginType,
    #[serde(default)]
    pub trade_side: TradeSide,
    /// Collateral committed per entry, in USDT. Position size is
    /// `trade_value_usdt * leverage`.
    #[serde(default = "default_trade_value")]
    pub trade_value_usdt: Decimal,
    /// Limit price offset from the reference price, in percent.
    #[serde(default = "default_price_offset_pct")]
    pub price_offset_pct: Decimal,
    /// Maximum notional for this symbol and side, in USDT.
    #[serde(default = "default_max_position")]
    pub max_position_usdt: Decimal,
    #[serde(default = "default_true")]
    pub take_profit_enabled: bool,
    #[serde(default = "default_tp_pct")]
    pub take_profit_pct: Decimal,
    #[serde(default = "default_true")]
    pub stop_loss_enabled: bool,
    #[serde(default = "default_sl_pct")]
    pub stop_loss_pct: Decimal,
    #[serde(default)]
    pub working_type: WorkingType,
    #[serde(default)]
    pub price_protect: bool,
}

fn default_volume_threshold() -> Decimal {
    Decimal::from(10_000)
}

fn default_leverage() -> u32 {
    10
}

fn default_trade_value() -> Decimal {
    Decimal::from(10)
}

fn default_price_offset_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_max_position() -> Decimal {
    Decimal::from(10_000)
}

fn default_true() -> bool {
    true
}

fn default_tp_pct() -> Decimal {
    Decimal::from(2)
}

fn default_sl_pct() -> Decimal {
    Decimal::ONE
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            volume_threshold_long: default_volume_threshold(),
            volume_threshold_short: default_volume_threshold(),
            leverage: default_leverage(),
            margin_type: MarginType::default(),
            trade_side: TradeSide::default(),
            trade_value_usdt: default_trade_value(),
            price_offset_pct: default_price_offset_pct(),
            max_position_usdt: default_max_position(),
            take_profit_enabled: true,
            take_profit_pct: default_tp_pct(),
            stop_loss_enabled: true,
            stop_loss_pct: default_sl_pct(),
            working_type: WorkingType::default(),
            price_protect: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let parsed: SymbolSettings =
            serde_json::from_str(r#"{"volume_threshold_long": "100000"}"#).unwrap();
        assert_eq!(parsed.volume_threshold_long, dec!(100000));
        assert_eq!(parsed.volume_threshold_short, dec!(10000));
        assert_eq!(parsed.leverage, 10);
        assert_eq!(parsed.take_profit_pct, dec!(2));
        assert!(parsed.stop_loss_enabled);
    }
}
