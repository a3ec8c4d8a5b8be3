//! Pending-exposure ledger.
//!
//! Entries placed but not yet final contribute to exposure checks so a
//! burst of liquidations within a few hundred milliseconds cannot blow
//! through the caps before fills arrive.

use cascade_core::Symbol;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
pub struct ExposureTracker {
    pending: Mutex<HashMap<Symbol, Decimal>>,
}

impl ExposureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve notional for an in-flight entry order.
    pub fn add_pending(&self, symbol: &Symbol, notional: Decimal) {
        let mut pending = self.pending.lock();
        *pending.entry(symbol.clone()).or_default() += notional;
        debug!(%symbol, %notional, "Pending exposure added");
    }

    /// Release notional once the order is final (filled, canceled, failed).
    pub fn remove_pending(&self, symbol: &Symbol, notional: Decimal) {
        let mut pending = self.pending.lock();
        if let Some(entry) = pending.get_mut(symbol) {
            *entry -= notional;
            if entry.is_sign_negative() || entry.is_zero() {
                pending.remove(symbol);
            }
        }
    }

    pub fn pending_for(&self, symbol: &Symbol) -> Decimal {
        self.pending.lock().get(symbol).copied().unwrap_or_default()
    }

    pub fn total_pending(&self) -> Decimal {
        self.pending.lock().values().copied().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_add_remove() {
        let tracker = ExposureTracker::new();
        let btc = Symbol::new("BTCUSDT");
        tracker.add_pending(&btc, dec!(1000));
        tracker.add_pending(&btc, dec!(500));
        assert_eq!(tracker.pending_for(&btc), dec!(1500));
        assert_eq!(tracker.total_pending(), dec!(1500));

        tracker.remove_pending(&btc, dec!(1000));
        assert_eq!(tracker.pending_for(&btc), dec!(500));
        tracker.remove_pending(&btc, dec!(600));
        assert_eq!(tracker.pending_for(&btc), dec!(0));
    }
}
