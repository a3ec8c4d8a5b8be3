//! Entry limit pricing.
//!
//! With a book: wide spreads (> 0.2% of the near side) are worked 20% into
//! the spread; tight spreads improve the near side by 0.01% for queue
//! priority. Without a book: a plain percentage offset on the conservative
//! side of the reference price.

use cascade_core::{Price, Side, SymbolSpec};
use rust_decimal::Decimal;

fn pct(n: i64, scale: u32) -> Decimal {
    Decimal::new(n, scale)
}

/// Price from top-of-book.
pub fn book_entry_price(side: Side, best_bid: Price, best_ask: Price) -> Price {
    let spread = best_ask.inner() - best_bid.inner();
    match side {
        Side::Buy => {
            if spread > best_bid.inner() * pct(2, 3) {
                // Wide spread: 20% in from the bid.
                Price::new(best_bid.inner() + spread * pct(2, 1))
            } else {
                // Tight spread: improve the bid by 0.01%.
                Price::new(best_bid.inner() * (Decimal::ONE + pct(1, 4)))
            }
        }
        Side::Sell => {
            if spread > best_ask.inner() * pct(2, 3) {
                Price::new(best_ask.inner() - spread * pct(2, 1))
            } else {
                Price::new(best_ask.inner() * (Decimal::ONE - pct(1, 4)))
            }
        }
    }
}

/// Fallback: offset from the reference price on the conservative side.
pub fn offset_entry_price(side: Side, reference: Price, offset_pct: Decimal) -> Price {
    match side {
        Side::Buy => reference.offset_pct(-offset_pct),
        Side::Sell => reference.offset_pct(offset_pct),
    }
}

/// Round toward the less aggressive side: buys down, sells up.
pub fn round_conservative(side: Side, price: Price, spec: &SymbolSpec) -> Price {
    match side {
        Side::Buy => price.floor_to_tick(spec.tick_size),
        Side::Sell => price.ceil_to_tick(spec.tick_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::{Qty, Symbol};
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
    fn test_tight_spread_improves_near_side() {
        // Spread 1 on 60000 = ~0.0017% -> tight.
        let buy = book_entry_price(Side::Buy, Price::new(dec!(60000)), Price::new(dec!(60001)));
        assert_eq!(buy.inner(), dec!(60006.0000)); // bid * 1.0001

        let sell = book_entry_price(Side::Sell, Price::new(dec!(60000)), Price::new(dec!(60001)));
        assert_eq!(sell.inner(), dec!(59994.9999)); // ask * 0.9999
    }

    #[test]
    fn test_wide_spread_works_into_spread() {
        // Spread 200 on 60000 = 0.33% -> wide.
        let buy = book_entry_price(Side::Buy, Price::new(dec!(60000)), Price::new(dec!(60200)));
        assert_eq!(buy.inner(), dec!(60040.0)); // bid + 20% of spread

        let sell = book_entry_price(Side::Sell, Price::new(dec!(60000)), Price::new(dec!(60200)));
        assert_eq!(sell.inner(), dec!(60160.0)); // ask - 20% of spread
    }

    #[test]
    fn test_offset_fallback() {
        // Scenario: 0.1% offset below for a buy.
        let p = offset_entry_price(Side::Buy, Price::new(dec!(60000)), dec!(0.1));
        assert_eq!(p.inner(), dec!(59940.000));
        let p = offset_entry_price(Side::Sell, Price::new(dec!(60000)), dec!(0.1));
        assert_eq!(p.inner(), dec!(60060.000));
    }

    #[test]
    fn test_conservative_rounding() {
        let s = spec();
        assert_eq!(
            round_conservative(Side::Buy, Price::new(dec!(59940.17)), &s).inner(),
            dec!(59940.1)
        );
        assert_eq!(
            round_conservative(Side::Sell, Price::new(dec!(60060.01)), &s).inner(),
            dec!(60060.1)
        );
    }
}
