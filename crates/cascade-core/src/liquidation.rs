//! Forced-liquidation event record.

use crate::{Price, Qty, Side, Symbol};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A venue-emitted forced-liquidation event.
///
/// Append-only; never mutated after creation. `event_id` is derived
/// deterministically from the wire fields so re-delivered frames are
/// idempotent at the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub event_id: String,
    pub symbol: Symbol,
    /// Side of the forced order (SELL = longs liquidated).
    pub liquidated_side: Side,
    pub qty: Qty,
    pub price: Price,
    /// qty * price in quote currency.
    pub usdt_value: Decimal,
    /// Venue-supplied event time.
    pub event_time_ms: i64,
    /// Local receive time.
    pub received_time_ms: i64,
}

impl LiquidationEvent {
    pub fn new(
        symbol: Symbol,
        liquidated_side: Side,
        qty: Qty,
        price: Price,
        event_time_ms: i64,
        received_time_ms: i64,
    ) -> Self {
        let usdt_value = qty.notional(price);
        let event_id = format!("{symbol}:{event_time_ms}:{liquidated_side}:{qty}@{price}");
        Self {
            event_id,
            symbol,
            liquidated_side,
            qty,
            price,
            usdt_value,
            event_time_ms,
            received_time_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_usdt_value_derived() {
        let e = LiquidationEvent::new(
            Symbol::new("BTCUSDT"),
            Side::Buy,
            Qty::new(dec!(2)),
            Price::new(dec!(60000)),
            1_700_000_000_000,
            1_700_000_000_050,
        );
        assert_eq!(e.usdt_value, dec!(120000));
    }

    #[test]
    fn test_event_id_deterministic() {
        let mk = || {
            LiquidationEvent::new(
                Symbol::new("ETHUSDT"),
                Side::Sell,
                Qty::new(dec!(1.5)),
                Price::new(dec!(3000)),
                1_700_000_000_000,
                1_700_000_000_051,
            )
        };
        assert_eq!(mk().event_id, mk().event_id);
    }
}
