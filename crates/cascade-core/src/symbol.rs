//! Symbol identifier and per-symbol trading rules.

use crate::{CoreError, Price, Qty, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A venue symbol, e.g. "BTCUSDT".
///
/// Stored uppercase; comparisons are exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        let s: String = s.into();
        Self(s.to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Per-symbol trading rules from exchange info.
///
/// Cached after the first `exchangeInfo` fetch and used for all price and
/// quantity rounding before submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: Symbol,
    /// Minimum price increment.
    pub tick_size: Price,
    /// Minimum quantity increment.
    pub step_size: Qty,
    pub min_qty: Qty,
    pub max_qty: Qty,
    /// Minimum order notional in quote currency.
    pub min_notional: Decimal,
    pub price_precision: u32,
    pub quantity_precision: u32,
}

impl SymbolSpec {
    /// Validate that the spec is usable for order construction.
    pub fn validate(&self) -> Result<()> {
        if !self.tick_size.is_positive() {
            return Err(CoreError::InvalidSpec(format!(
                "{}: tick_size must be positive",
                self.symbol
            )));
        }
        if !self.step_size.is_positive() {
            return Err(CoreError::InvalidSpec(format!(
                "{}: step_size must be positive",
                self.symbol
            )));
        }
        Ok(())
    }

    /// Round a quantity down to the step size and clamp to [min_qty, max_qty].
    pub fn clamp_qty(&self, qty: Qty) -> Qty {
        let floored = qty.floor_to_step(self.step_size);
        if floored.inner() < self.min_qty.inner() {
            self.min_qty
        } else if floored.inner() > self.max_qty.inner() {
            self.max_qty
        } else {
            floored
        }
    }

    /// Check whether a (qty, price) pair meets the min-notional rule.
    pub fn meets_min_notional(&self, qty: Qty, price: Price) -> bool {
        qty.notional(price) >= self.min_notional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            symbol: Symbol::new("BTCUSDT"),
            tick_size: Price::new(dec!(0.1)),
            step_size: Qty::new(dec!(0.001)),
            min_qty: Qty::new(dec!(0.001)),
            max_qty: Qty::new(dec!(1000)),
            min_notional: dec!(5),
            price_precision: 1,
            quantity_precision: 3,
        }
    }

    #[test]
    fn test_symbol_uppercased() {
        assert_eq!(Symbol::new("btcusdt").as_str(), "BTCUSDT");
    }

    #[test]
    fn test_clamp_qty_floors_to_step() {
        let s = spec();
        assert_eq!(s.clamp_qty(Qty::new(dec!(0.0127))).inner(), dec!(0.012));
    }

    #[test]
    fn test_clamp_qty_respects_min() {
        let s = spec();
        assert_eq!(s.clamp_qty(Qty::new(dec!(0.0001))), s.min_qty);
    }

    #[test]
    fn test_min_notional() {
        let s = spec();
        assert!(s.meets_min_notional(Qty::new(dec!(0.001)), Price::new(dec!(60000))));
        assert!(!s.meets_min_notional(Qty::new(dec!(0.001)), Price::new(dec!(100))));
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let mut s = spec();
        s.tick_size = Price::ZERO;
        assert!(s.validate().is_err());
    }
}
