//! Rolling per-(symbol, side) USDT-volume windows.
//!
//! Each key holds a deque of `(event_time, usdt_value)` and an incrementally
//! maintained sum, so queries are O(1) aside from expiring stale heads.
//! Backed by the store only for crash recovery.

use cascade_core::{LiquidationEvent, Side, Symbol};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Default)]
struct SideWindow {
    entries: VecDeque<(i64, Decimal)>,
    sum: Decimal,
}

impl SideWindow {
    fn push(&mut self, event_time_ms: i64, value: Decimal) {
        self.entries.push_back((event_time_ms, value));
        self.sum += value;
    }

    fn expire(&mut self, cutoff_ms: i64) {
        while self.entries.front().is_some_and(|&(t, _)| t < cutoff_ms) {
            let (_, value) = self.entries.pop_front().expect("front checked");
            self.sum -= value;
        }
    }
}

/// Rolling volume aggregator.
pub struct WindowAggregator {
    window_ms: i64,
    windows: Mutex<HashMap<(Symbol, Side), SideWindow>>,
}

impl WindowAggregator {
    pub fn new(window_ms: i64) -> Self {
        Self {
            window_ms,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    /// Record an event into its window.
    pub fn record(&self, event: &LiquidationEvent) {
        self.record_at(event, chrono::Utc::now().timestamp_millis());
    }

    pub(crate) fn record_at(&self, event: &LiquidationEvent, now_ms: i64) {
        let mut windows = self.windows.lock();
        let window = windows
            .entry((event.symbol.clone(), event.liquidated_side))
            .or_default();
        window.push(event.event_time_ms, event.usdt_value);
        window.expire(now_ms - self.window_ms);
    }

    /// Current windowed sum for `(symbol, side)`.
    pub fn current(&self, symbol: &Symbol, side: Side) -> Decimal {
        self.current_at(symbol, side, chrono::Utc::now().timestamp_millis())
    }

    pub(crate) fn current_at(&self, symbol: &Symbol, side: Side, now_ms: i64) -> Decimal {
        let mut windows = self.windows.lock();
        match windows.get_mut(&(symbol.clone(), side)) {
            Some(window) => {
                window.expire(now_ms - self.window_ms);
                window.sum
            }
            None => Decimal::ZERO,
        }
    }

    /// Rebuild from persisted events (startup recovery).
    pub fn rebuild(&self, events: &[LiquidationEvent]) {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut windows = self.windows.lock();
        windows.clear();
        for event in events {
            let window = windows
                .entry((event.symbol.clone(), event.liquidated_side))
                .or_default();
            window.push(event.event_time_ms, event.usdt_value);
        }
        for window in windows.values_mut() {
            window.expire(now_ms - self.window_ms);
        }
        debug!(keys = windows.len(), "Window aggregator rebuilt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{Price, Qty};
    use rust_decimal_macros::dec;

    fn event(symbol: &str, side: Side, qty: Decimal, price: Decimal, t: i64) -> LiquidationEvent {
        LiquidationEvent::new(
            Symbol::new(symbol),
            side,
            Qty::new(qty),
            Price::new(price),
            t,
            t,
        )
    }

    #[test]
    fn test_incremental_sum() {
        let agg = WindowAggregator::new(60_000);
        let now = 1_700_000_060_000;
        agg.record_at(&event("BTCUSDT", Side::Buy, dec!(1), dec!(60000), now - 10_000), now);
        agg.record_at(&event("BTCUSDT", Side::Buy, dec!(0.5), dec!(60000), now - 5_000), now);
        assert_eq!(agg.current_at(&Symbol::new("BTCUSDT"), Side::Buy, now), dec!(90000));
    }

    #[test]
    fn test_sides_tracked_separately() {
        let agg = WindowAggregator::new(60_000);
        let now = 1_700_000_060_000;
        agg.record_at(&event("BTCUSDT", Side::Buy, dec!(1), dec!(60000), now), now);
        agg.record_at(&event("BTCUSDT", Side::Sell, dec!(2), dec!(60000), now), now);
        assert_eq!(agg.current_at(&Symbol::new("BTCUSDT"), Side::Buy, now), dec!(60000));
        assert_eq!(agg.current_at(&Symbol::new("BTCUSDT"), Side::Sell, now), dec!(120000));
    }

    #[test]
    fn test_head_expiry() {
        let agg = WindowAggregator::new(60_000);
        let now = 1_700_000_060_000;
        agg.record_at(&event("BTCUSDT", Side::Buy, dec!(1), dec!(60000), now - 70_000), now);
        agg.record_at(&event("BTCUSDT", Side::Buy, dec!(1), dec!(30000), now - 1_000), now);
        // First event is outside the window at query time.
        assert_eq!(agg.current_at(&Symbol::new("BTCUSDT"), Side::Buy, now), dec!(30000));
        // Advance past the second event too.
        assert_eq!(
            agg.current_at(&Symbol::new("BTCUSDT"), Side::Buy, now + 61_000),
            dec!(0)
        );
    }

    #[test]
    fn test_unknown_key_zero() {
        let agg = WindowAggregator::new(60_000);
        assert_eq!(agg.current(&Symbol::new("XRPUSDT"), Side::Buy), dec!(0));
    }

    #[test]
    fn test_rebuild() {
        let agg = WindowAggregator::new(i64::MAX / 2);
        agg.rebuild(&[
            event("BTCUSDT", Side::Buy, dec!(1), dec!(60000), 1),
            event("BTCUSDT", Side::Buy, dec!(1), dec!(60000), 2),
        ]);
        assert_eq!(agg.current(&Symbol::new("BTCUSDT"), Side::Buy), dec!(120000));
    }
}
