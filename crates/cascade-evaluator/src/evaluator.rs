//! The trade evaluator.

use crate::config::EvaluatorConfig;
use crate::error::EvalResult;
use crate::exposure::ExposureTracker;
use crate::gates::{self, GateInputs, GateRejection};
use crate::pricing;
use cascade_core::{
    ClientOrderId, LiquidationEvent, OrderKind, OrderRecord, OrderStatus, PositionSide, Price,
    Qty, Side, Symbol, SymbolSettings, TimeInForce,
};
use cascade_feed::WindowAggregator;
use cascade_governor::Priority;
use cascade_store::Store;
use cascade_venue::{NewOrder, OrderType, VenueClient, VenueError};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to an evaluated event.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalOutcome {
    NotConfigured,
    BelowThreshold { volume: Decimal, threshold: Decimal },
    Vetoed(GateRejection),
    /// Quantity rounded to zero or below the lot minimum.
    NoViableQty,
    Placed { order_id: String },
    Simulated { order_id: String },
}

pub struct TradeEvaluator {
    config: EvaluatorConfig,
    venue: Arc<dyn VenueClient>,
    store: Arc<dyn Store>,
    windows: Arc<WindowAggregator>,
    exposure: Arc<ExposureTracker>,
    /// Symbols whose leverage/margin-type have been applied this session.
    initialized: Mutex<HashSet<Symbol>>,
}

impl TradeEvaluator {
    pub fn new(
        config: EvaluatorConfig,
        venue: Arc<dyn VenueClient>,
        store: Arc<dyn Store>,
        windows: Arc<WindowAggregator>,
        exposure: Arc<ExposureTracker>,
    ) -> Self {
        Self {
            config,
            venue,
            store,
            windows,
            exposure,
            initialized: Mutex::new(HashSet::new()),
        }
    }

    pub fn exposure(&self) -> Arc<ExposureTracker> {
        self.exposure.clone()
    }

    /// Evaluate one liquidation event end to end.
    pub async fn evaluate(&self, event: &LiquidationEvent) -> EvalResult<EvalOutcome> {
        let Some(settings) = self.config.settings(&event.symbol) else {
            return Ok(EvalOutcome::NotConfigured);
        };
        let settings = settings.clone();

        let entry_side = settings.trade_side.entry_side(event.liquidated_side);
        let position_side = if self.config.hedge_mode {
            entry_side.opens()
        } else {
            PositionSide::Both
        };

        // Threshold check against the rolling window (>= triggers).
        let threshold = match entry_side {
            Side::Buy => settings.volume_threshold_long,
            Side::Sell => settings.volume_threshold_short,
        };
        let volume = self.windows.current(&event.symbol, event.liquidated_side);
        if volume < threshold {
            debug!(
                symbol = %event.symbol,
                %volume,
                %threshold,
                "Below volume threshold"
            );
            return Ok(EvalOutcome::BelowThreshold { volume, threshold });
        }
        info!(
            symbol = %event.symbol,
            side = %entry_side,
            %volume,
            %threshold,
            "Volume threshold met"
        );

        // Position size; bump to min-notional when configured size is too
        // small (venue refuses orders under the minimum).
        let spec = self.venue.symbol_spec(&event.symbol).await?;
        let mut position_size = settings.trade_value_usdt * Decimal::from(settings.leverage);
        if position_size < spec.min_notional {
            let bumped = spec.min_notional * Decimal::new(11, 1);
            warn!(
                symbol = %event.symbol,
                %position_size,
                min_notional = %spec.min_notional,
                %bumped,
                "Position size below minimum notional, bumping"
            );
            position_size = bumped;
        }

        // Admission gates.
        let inputs = self.gate_inputs(&event.symbol, position_side)?;
        if let Err(rejection) = gates::check(
            &event.symbol,
            &inputs,
            position_size,
            spec.min_notional,
            self.config.max_total_exposure_usdt,
            self.config.max_open_orders_per_symbol,
            settings.max_position_usdt,
        ) {
            warn!(symbol = %event.symbol, %rejection, "Entry vetoed");
            return Ok(EvalOutcome::Vetoed(rejection));
        }

        // Entry price from the book, falling back to the offset formula.
        let entry_price = match self
            .venue
            .depth(&event.symbol, self.config.depth_limit, Priority::Critical)
            .await
        {
            Ok(depth) => match (depth.best_bid(), depth.best_ask()) {
                (Some(bid), Some(ask)) if bid.is_positive() && ask.is_positive() => {
                    pricing::book_entry_price(entry_side, bid, ask)
                }
                _ => pricing::offset_entry_price(entry_side, event.price, settings.price_offset_pct),
            },
            Err(e) => {
                debug!(symbol = %event.symbol, error = %e, "Depth unavailable, using offset price");
                pricing::offset_entry_price(entry_side, event.price, settings.price_offset_pct)
            }
        };
        let entry_price = pricing::round_conservative(entry_side, entry_price, &spec);

        // Quantity from position size, rounded down to step; one step up is
        // allowed when rounding dropped the notional under the minimum.
        let raw_qty = Qty::new(position_size / entry_price.inner());
        let mut qty = raw_qty.floor_to_step(spec.step_size);
        if !spec.meets_min_notional(qty, entry_price) {
            let bumped = qty + spec.step_size;
            if bumped.inner() <= spec.max_qty.inner() && spec.meets_min_notional(bumped, entry_price)
            {
                qty = bumped;
            } else {
                debug!(symbol = %event.symbol, %qty, "Rounded below min notional");
                return Ok(EvalOutcome::Vetoed(GateRejection::MinNotional {
                    notional: qty.notional(entry_price),
                    min_notional: spec.min_notional,
                }));
            }
        }
        if !qty.is_positive() || qty.inner() < spec.min_qty.inner() {
            return Ok(EvalOutcome::NoViableQty);
        }

        self.ensure_symbol_initialized(&event.symbol, &settings).await;

        let client_id = ClientOrderId::new();
        let order = NewOrder {
            symbol: event.symbol.clone(),
            side: entry_side,
            position_side,
            order_type: OrderType::Limit,
            qty,
            price: Some(entry_price),
            stop_price: None,
            time_in_force: Some(self.config.time_in_force),
            reduce_only: false,
            working_type: None,
            price_protect: false,
            client_id: Some(client_id.clone()),
        };

        if self.config.simulate_only {
            let order_id = format!("sim-{client_id}");
            self.record_entry(
                &order_id,
                &client_id,
                &order,
                OrderStatus::Simulated,
                self.config.time_in_force,
            )?;
            info!(symbol = %event.symbol, side = %entry_side, %qty, price = %entry_price,
                  "Simulated entry recorded");
            return Ok(EvalOutcome::Simulated { order_id });
        }

        let notional = qty.notional(entry_price);
        self.exposure.add_pending(&event.symbol, notional);

        match self.venue.place_order(&order, Priority::Critical).await {
            Ok(ack) => {
                let order_id = ack.order_id_str();
                info!(
                    symbol = %event.symbol,
                    side = %entry_side,
                    %qty,
                    price = %entry_price,
                    order_id,
                    "Entry order placed"
                );
                self.record_entry(
                    &order_id,
                    &client_id,
                    &order,
                    ack.status,
                    self.config.time_in_force,
                )?;
                Ok(EvalOutcome::Placed { order_id })
            }
            Err(e) => {
                self.exposure.remove_pending(&event.symbol, notional);
                warn!(symbol = %event.symbol, error = %e, "Entry order failed");
                Err(e.into())
            }
        }
    }

    fn gate_inputs(&self, symbol: &Symbol, position_side: PositionSide) -> EvalResult<GateInputs> {
        let tranches = self.store.list_all_tranches()?;
        let mut total = Decimal::ZERO;
        let mut symbol_side = Decimal::ZERO;
        for t in &tranches {
            let notional = t.quantity.notional(t.avg_entry_price);
            total += notional.abs();
            if &t.symbol == symbol && t.position_side == position_side {
                symbol_side += notional.abs();
            }
        }
        let open = self.store.open_entry_orders(symbol)?.len() as u32;
        Ok(GateInputs {
            total_position_notional: total,
            symbol_side_notional: symbol_side,
            open_entry_orders: open,
            total_pending: self.exposure.total_pending(),
            symbol_pending: self.exposure.pending_for(symbol),
        })
    }

    /// Apply leverage and margin type once per symbol per session.
    /// The venue treats re-applies as no-ops, so failures only log.
    async fn ensure_symbol_initialized(&self, symbol: &Symbol, settings: &SymbolSettings) {
        if self.initialized.lock().contains(symbol) {
            return;
        }
        if let Err(e) = self.venue.set_leverage(symbol, settings.leverage).await {
            warn!(%symbol, error = %e, "Failed to set leverage");
        }
        match self.venue.set_margin_type(symbol, settings.margin_type).await {
            Ok(()) => {}
            Err(VenueError::InvalidParam { .. }) => {}
            Err(e) => warn!(%symbol, error = %e, "Failed to set margin type"),
        }
        self.initialized.lock().insert(symbol.clone());
    }

    fn record_entry(
        &self,
        order_id: &str,
        client_id: &ClientOrderId,
        order: &NewOrder,
        status: OrderStatus,
        time_in_force: TimeInForce,
    ) -> EvalResult<()> {
        let record = OrderRecord {
            order_id: order_id.to_string(),
            client_id: Some(client_id.clone()),
            symbol: order.symbol.clone(),
            position_side: order.position_side,
            side: order.side,
            kind: OrderKind::Entry,
            qty: order.qty,
            price: order.price,
            stop_price: None,
            status,
            tranche_id: None,
            parent_order_id: None,
            placed_at_ms: chrono::Utc::now().timestamp_millis(),
            final_at_ms: None,
            executed_qty: Qty::ZERO,
            avg_fill_price: None,
            time_in_force,
        };
        self.store.upsert_order(&record)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cascade_core::MarginType;
    use cascade_store::SqliteStore;
    use cascade_venue::{AccountInfo, DepthSnapshot, OpenOrder, OrderAck, PositionRisk, VenueResult};
    use cascade_core::SymbolSpec;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Venue fake: fixed book and spec, records placed orders.
    struct FakeVenue {
        bid: Decimal,
        ask: Decimal,
        next_id: AtomicI64,
        placed: Mutex<Vec<NewOrder>>,
        fail_place: bool,
    }

    impl FakeVenue {
        fn new(bid: Decimal, ask: Decimal) -> Self {
            Self {
                bid,
                ask,
                next_id: AtomicI64::new(100),
                placed: Mutex::new(Vec::new()),
                fail_place: false,
            }
        }
    }

    #[async_trait]
    impl VenueClient for FakeVenue {
        async fn exchange_info(&self) -> VenueResult<Vec<SymbolSpec>> {
            Ok(vec![])
        }

        async fn symbol_spec(&self, symbol: &Symbol) -> VenueResult<SymbolSpec> {
            Ok(SymbolSpec {
                symbol: symbol.clone(),
                tick_size: Price::new(dec!(0.1)),
                step_size: Qty::new(dec!(0.001)),
                min_qty: Qty::new(dec!(0.001)),
                max_qty: Qty::new(dec!(1000)),
                min_notional: dec!(5),
                price_precision: 1,
                quantity_precision: 3,
            })
        }

        async fn depth(
            &self,
            _symbol: &Symbol,
            _limit: u32,
            _priority: Priority,
        ) -> VenueResult<DepthSnapshot> {
            Ok(DepthSnapshot {
                bids: vec![(self.bid, dec!(5))],
                asks: vec![(self.ask, dec!(5))],
            })
        }

        async fn place_order(&self, order: &NewOrder, _p: Priority) -> VenueResult<OrderAck> {
            if self.fail_place {
                return Err(VenueError::InsufficientBalance);
            }
            self.placed.lock().push(order.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(OrderAck {
                order_id: id,
                client_order_id: order.client_id.as_ref().map(|c| c.to_string()),
                status: OrderStatus::New,
                executed_qty: None,
                avg_price: None,
            })
        }

        async fn place_batch(
            &self,
            orders: &[NewOrder],
            priority: Priority,
        ) -> VenueResult<Vec<VenueResult<OrderAck>>> {
            let mut out = Vec::new();
            for o in orders {
                out.push(self.place_order(o, priority).await);
            }
            Ok(out)
        }

        async fn cancel_order(&self, _s: &Symbol, _id: &str, _p: Priority) -> VenueResult<()> {
            Ok(())
        }

        async fn cancel_all_open(&self, _s: &Symbol) -> VenueResult<()> {
            Ok(())
        }

        async fn open_orders(&self, _s: Option<&Symbol>) -> VenueResult<Vec<OpenOrder>> {
            Ok(vec![])
        }

        async fn account(&self) -> VenueResult<AccountInfo> {
            Ok(AccountInfo {
                total_wallet_balance: dec!(1000),
                available_balance: dec!(1000),
                total_unrealized_profit: None,
            })
        }

        async fn position_risk(&self) -> VenueResult<Vec<PositionRisk>> {
            Ok(vec![])
        }

        async fn set_leverage(&self, _s: &Symbol, _l: u32) -> VenueResult<()> {
            Ok(())
        }

        async fn set_margin_type(&self, _s: &Symbol, _m: MarginType) -> VenueResult<()> {
            Ok(())
        }

        async fn set_position_mode(&self, _h: bool) -> VenueResult<()> {
            Ok(())
        }

        async fn get_position_mode(&self) -> VenueResult<bool> {
            Ok(true)
        }

        async fn set_multi_assets_mode(&self, _e: bool) -> VenueResult<()> {
            Ok(())
        }

        async fn get_multi_assets_mode(&self) -> VenueResult<bool> {
            Ok(false)
        }

        async fn listen_key_create(&self) -> VenueResult<String> {
            Ok("key".into())
        }

        async fn listen_key_keepalive(&self) -> VenueResult<()> {
            Ok(())
        }

        async fn listen_key_delete(&self) -> VenueResult<()> {
            Ok(())
        }
    }

    fn config() -> EvaluatorConfig {
        let mut symbols = std::collections::HashMap::new();
        symbols.insert(
            Symbol::new("BTCUSDT"),
            SymbolSettings {
                volume_threshold_long: dec!(100000),
                volume_threshold_short: dec!(100000),
                leverage: 10,
                trade_value_usdt: dec!(100),
                price_offset_pct: dec!(0.1),
                max_position_usdt: dec!(50000),
                ..Default::default()
            },
        );
        EvaluatorConfig {
            hedge_mode: true,
            max_total_exposure_usdt: dec!(100000),
            symbols,
            ..Default::default()
        }
    }

    fn liquidation(symbol: &str, side: Side, qty: Decimal, price: Decimal) -> LiquidationEvent {
        let now = chrono::Utc::now().timestamp_millis();
        LiquidationEvent::new(
            Symbol::new(symbol),
            side,
            Qty::new(qty),
            Price::new(price),
            now,
            now,
        )
    }

    fn setup(
        venue: FakeVenue,
    ) -> (Arc<FakeVenue>, Arc<WindowAggregator>, TradeEvaluator) {
        let venue = Arc::new(venue);
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let windows = Arc::new(WindowAggregator::new(60_000));
        let evaluator = TradeEvaluator::new(
            config(),
            venue.clone(),
            store,
            windows.clone(),
            Arc::new(ExposureTracker::new()),
        );
        (venue, windows, evaluator)
    }

    #[tokio::test]
    async fn test_unconfigured_symbol_ignored() {
        let (_venue, _windows, evaluator) = setup(FakeVenue::new(dec!(59999), dec!(60000)));
        let event = liquidation("XRPUSDT", Side::Buy, dec!(1000), dec!(0.5));
        assert_eq!(
            evaluator.evaluate(&event).await.unwrap(),
            EvalOutcome::NotConfigured
        );
    }

    #[tokio::test]
    async fn test_below_threshold_skips() {
        let (_venue, windows, evaluator) = setup(FakeVenue::new(dec!(59999), dec!(60000)));
        let event = liquidation("BTCUSDT", Side::Buy, dec!(1), dec!(60000));
        windows.record(&event);
        // 60k < 100k threshold.
        assert!(matches!(
            evaluator.evaluate(&event).await.unwrap(),
            EvalOutcome::BelowThreshold { .. }
        ));
    }

    #[tokio::test]
    async fn test_threshold_at_boundary_triggers() {
        let (venue, windows, evaluator) = setup(FakeVenue::new(dec!(59999.9), dec!(60000.1)));
        // Exactly 100_000 USDT: 2 * 50_000... use qty so qty*price == threshold.
        let event = liquidation("BTCUSDT", Side::Buy, dec!(2), dec!(50000));
        windows.record(&event);
        let outcome = evaluator.evaluate(&event).await.unwrap();
        assert!(matches!(outcome, EvalOutcome::Placed { .. }), "{outcome:?}");
        assert_eq!(venue.placed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_contrarian_mapping_and_pricing() {
        let (venue, windows, evaluator) = setup(FakeVenue::new(dec!(59999.9), dec!(60000.1)));
        // Forced BUY (shorts liquidated) -> contrarian opens LONG.
        let event = liquidation("BTCUSDT", Side::Buy, dec!(2), dec!(60000));
        windows.record(&event);
        let outcome = evaluator.evaluate(&event).await.unwrap();
        assert!(matches!(outcome, EvalOutcome::Placed { .. }));

        let placed = venue.placed.lock();
        let order = &placed[0];
        assert_eq!(order.side, Side::Buy);
        assert_eq!(order.position_side, PositionSide::Long);
        // Tight spread: improve bid by 0.01%, floored to tick.
        // 59999.9 * 1.0001 = 60005.89999 -> 60005.8
        assert_eq!(order.price.unwrap().inner(), dec!(60005.8));
        assert!(!order.reduce_only);
        assert!(order.client_id.is_some());
        // qty = 1000 / price floored to 0.001 step
        assert_eq!(order.qty.inner(), dec!(0.016));
    }

    #[tokio::test]
    async fn test_exposure_veto() {
        let (_venue, windows, evaluator) = setup(FakeVenue::new(dec!(59999), dec!(60000)));
        // Saturate pending exposure above the cap.
        evaluator
            .exposure()
            .add_pending(&Symbol::new("BTCUSDT"), dec!(99999));
        let event = liquidation("BTCUSDT", Side::Buy, dec!(3), dec!(60000));
        windows.record(&event);
        assert!(matches!(
            evaluator.evaluate(&event).await.unwrap(),
            EvalOutcome::Vetoed(GateRejection::TotalExposure { .. })
        ));
    }

    #[tokio::test]
    async fn test_failed_place_releases_pending() {
        let mut venue = FakeVenue::new(dec!(59999), dec!(60000));
        venue.fail_place = true;
        let (_venue, windows, evaluator) = setup(venue);
        let event = liquidation("BTCUSDT", Side::Buy, dec!(3), dec!(60000));
        windows.record(&event);
        assert!(evaluator.evaluate(&event).await.is_err());
        assert_eq!(evaluator.exposure().total_pending(), dec!(0));
    }

    #[tokio::test]
    async fn test_simulate_only_records_without_submitting() {
        let venue = Arc::new(FakeVenue::new(dec!(59999), dec!(60000)));
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let windows = Arc::new(WindowAggregator::new(60_000));
        let mut cfg = config();
        cfg.simulate_only = true;
        let evaluator = TradeEvaluator::new(
            cfg,
            venue.clone(),
            store,
            windows.clone(),
            Arc::new(ExposureTracker::new()),
        );
        let event = liquidation("BTCUSDT", Side::Buy, dec!(3), dec!(60000));
        windows.record(&event);
        assert!(matches!(
            evaluator.evaluate(&event).await.unwrap(),
            EvalOutcome::Simulated { .. }
        ));
        assert!(venue.placed.lock().is_empty());
    }
}
