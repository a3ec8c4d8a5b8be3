//! Application assembly and lifecycle.
//!
//! Builds every component, wires the channels, runs the startup sequence
//! (auth probe, venue mode setup, state recovery), and drives the shutdown
//! cascade: cancel, drain, flush, hard-stop.

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use cascade_core::Symbol;
use cascade_dashboard::EngineProjections;
use cascade_evaluator::{
    spawn_evaluator_workers, EvaluatorConfig, ExposureTracker, TradeEvaluator,
};
use cascade_feed::{spawn_intake, IntakeConfig, WindowAggregator};
use cascade_governor::{GovernorConfig, RateGovernor};
use cascade_position::{
    spawn_fill_router, spawn_price_monitor, spawn_protection_manager, spawn_reconciler,
    BreakerConfig, CircuitBreaker, MonitorConfig, PriceMonitor, ProtectionConfig,
    ProtectionManager, Reconciler, ReconcilerConfig, RouterDeps, TrancheBook, TrancheConfig,
};
use cascade_store::{SqliteStore, Store};
use cascade_telemetry::EngineCounters;
use cascade_venue::{HttpVenueClient, SpecCache, VenueClient, VenueClientConfig, VenueError};
use cascade_ws::{spawn_stream, StaticUrl, StreamConfig, UrlProvider};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Listen-key URL provider: fetches a fresh key for every connect attempt.
struct ListenKeyUrl {
    venue: Arc<dyn VenueClient>,
    ws_base: String,
}

#[async_trait]
impl UrlProvider for ListenKeyUrl {
    async fn url(&self) -> cascade_ws::WsResult<String> {
        let key = self
            .venue
            .listen_key_create()
            .await
            .map_err(|e| cascade_ws::WsError::UrlProvider(e.to_string()))?;
        Ok(format!("{}/ws/{}", self.ws_base, key))
    }
}

pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run until `shutdown` fires; returns the final outcome.
    pub async fn run(self, shutdown: CancellationToken) -> AppResult<()> {
        let config = self.config;
        let engine = &config.engine;

        // --- Shared infrastructure -------------------------------------
        let governor = Arc::new(RateGovernor::new(GovernorConfig {
            buffer_pct: engine.rate_limit_buffer_pct,
            ..GovernorConfig::default()
        }));
        let specs = Arc::new(SpecCache::default());
        let venue: Arc<dyn VenueClient> = Arc::new(HttpVenueClient::new(
            VenueClientConfig {
                base_url: config.venue.base_url.clone(),
                api_key: config.venue.api_key.clone(),
                api_secret: config.venue.api_secret.clone(),
                recv_window_ms: config.venue.recv_window_ms,
                call_deadline: Duration::from_millis(config.venue.call_deadline_ms),
                max_retries: config.venue.max_retries,
            },
            governor.clone(),
            specs.clone(),
        )?);
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&engine.db_path)?);
        let counters = Arc::new(EngineCounters::default());

        // --- Startup sequence ------------------------------------------
        if !engine.simulate_only {
            auth_probe(venue.as_ref()).await?;
            init_venue_modes(venue.as_ref(), &config).await;
        }
        match venue.exchange_info().await {
            Ok(fetched) => specs.replace(fetched),
            Err(e) if engine.simulate_only => {
                warn!(error = %e, "Exchange info unavailable in simulate mode")
            }
            Err(e) => return Err(e.into()),
        }

        let windows = Arc::new(WindowAggregator::new(engine.window_ms));
        let since = chrono::Utc::now().timestamp_millis() - engine.window_ms;
        match store.liquidations_since(since) {
            Ok(events) => windows.rebuild(&events),
            Err(e) => warn!(error = %e, "Window rebuild failed, starting cold"),
        }

        let book = Arc::new(TrancheBook::new(
            TrancheConfig {
                tranche_increment_pct: engine.tranche_pnl_increment_pct,
                max_tranches_per_symbol_side: engine.max_tranches_per_symbol_side,
                pnl_basis: engine.tranche_pnl_basis,
            },
            store.clone(),
        ));
        book.load_from_store()?;

        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
        let symbols: HashMap<Symbol, _> = config.symbols.clone();

        // --- Channels ---------------------------------------------------
        let (force_frame_tx, force_frame_rx) = mpsc::channel::<String>(1024);
        let (mark_frame_tx, mark_frame_rx) = mpsc::channel::<String>(1024);
        let (user_frame_tx, user_frame_rx) = mpsc::channel::<String>(1024);
        let (batch_tx, batch_rx) = mpsc::channel(256);
        let (protection_tx, protection_rx) = mpsc::channel(256);
        let (reconcile_tx, reconcile_rx) = mpsc::channel(8);

        // --- Components -------------------------------------------------
        let protection = Arc::new(ProtectionManager::new(
            ProtectionConfig {
                batch_enabled: engine.batch_orders_enabled,
                max_stop_orders_per_symbol_side: engine.max_stop_orders_per_symbol,
                tp_time_in_force: engine.time_in_force,
                ..ProtectionConfig::default()
            },
            venue.clone(),
            store.clone(),
            book.clone(),
            breaker.clone(),
            symbols.clone(),
            counters.clone(),
        ));
        let monitor = Arc::new(PriceMonitor::new(
            MonitorConfig {
                enabled: engine.use_position_monitor && engine.instant_tp_enabled,
                epsilon: rust_decimal::Decimal::ZERO,
            },
            book.clone(),
            breaker.clone(),
            protection_tx.clone(),
            protection.inflight_closes(),
        ));
        let exposure = Arc::new(ExposureTracker::new());
        let evaluator = Arc::new(TradeEvaluator::new(
            EvaluatorConfig {
                hedge_mode: engine.hedge_mode,
                simulate_only: engine.simulate_only,
                time_in_force: engine.time_in_force,
                max_total_exposure_usdt: engine.max_total_exposure_usdt,
                max_open_orders_per_symbol: engine.max_open_orders_per_symbol,
                depth_limit: 20,
                symbols: symbols.clone(),
            },
            venue.clone(),
            store.clone(),
            windows.clone(),
            exposure.clone(),
        ));
        let reconciler = Arc::new(Reconciler::new(
            ReconcilerConfig {
                interval: Duration::from_secs(engine.reconcile_interval_secs),
                order_ttl: Duration::from_millis(engine.order_ttl_ms),
                hedge_mode: engine.hedge_mode,
                ..ReconcilerConfig::default()
            },
            venue.clone(),
            store.clone(),
            book.clone(),
            symbols.clone(),
            counters.clone(),
            protection_tx.clone(),
        ));

        // Startup sweep brings the recovered book in line with the venue.
        if !engine.simulate_only {
            if let Err(e) = reconciler.run_once().await {
                warn!(error = %e, "Startup reconcile failed, periodic sweep will retry");
            }
        }

        // --- Tasks ------------------------------------------------------
        let inner = shutdown.child_token();
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let stream_config = |name: &str| StreamConfig {
            name: name.to_string(),
            reconnect_base_delay_ms: engine.price_monitor_reconnect_ms.max(1000),
            reconnect_max_delay_ms: 60_000,
            degraded_after_ms: 30_000,
        };

        let (force_handle, force_join) = spawn_stream(
            stream_config("force-orders"),
            Arc::new(StaticUrl(format!(
                "{}/ws/!forceOrder@arr",
                config.venue.ws_url
            ))),
            force_frame_tx,
            inner.clone(),
        );
        tasks.push(("force-stream", force_join));

        let mut stream_handles = vec![("force-orders".to_string(), force_handle)];

        if engine.use_position_monitor {
            let (mark_handle, mark_join) = spawn_stream(
                stream_config("mark-price"),
                Arc::new(StaticUrl(format!(
                    "{}/ws/!markPrice@arr@1s",
                    config.venue.ws_url
                ))),
                mark_frame_tx,
                inner.clone(),
            );
            tasks.push(("mark-stream", mark_join));
            stream_handles.push(("mark-price".to_string(), mark_handle));
        }

        if !engine.simulate_only {
            let (user_handle, user_join) = spawn_stream(
                stream_config("user-data"),
                Arc::new(ListenKeyUrl {
                    venue: venue.clone(),
                    ws_base: config.venue.ws_url.clone(),
                }),
                user_frame_tx,
                inner.clone(),
            );
            tasks.push(("user-stream", user_join));
            stream_handles.push(("user-data".to_string(), user_handle));

            // Listen-key keepalive every 30 minutes.
            let keepalive_venue = venue.clone();
            let keepalive_token = inner.clone();
            tasks.push((
                "listen-key-keepalive",
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(1800));
                    tick.tick().await; // skip the immediate tick
                    loop {
                        tokio::select! {
                            _ = keepalive_token.cancelled() => return,
                            _ = tick.tick() => {
                                if let Err(e) = keepalive_venue.listen_key_keepalive().await {
                                    warn!(error = %e, "Listen-key keepalive failed");
                                }
                            }
                        }
                    }
                }),
            ));
        }

        let (_intake_stats, intake_join) = spawn_intake(
            IntakeConfig {
                buffer_window_ms: engine.buffer_window_ms,
                max_batch: 64,
            },
            store.clone(),
            windows.clone(),
            force_frame_rx,
            batch_tx,
            inner.clone(),
        );
        tasks.push(("intake", intake_join));

        tasks.push((
            "evaluator",
            spawn_evaluator_workers(evaluator.clone(), counters.clone(), batch_rx, inner.clone()),
        ));
        tasks.push((
            "protection",
            spawn_protection_manager(protection.clone(), protection_rx, inner.clone()),
        ));
        tasks.push((
            "price-monitor",
            spawn_price_monitor(monitor.clone(), mark_frame_rx, inner.clone()),
        ));
        tasks.push((
            "fill-router",
            spawn_fill_router(
                RouterDeps {
                    store: store.clone(),
                    book: book.clone(),
                    exposure: exposure.clone(),
                    counters: counters.clone(),
                    protection_tx: protection_tx.clone(),
                    reconcile_tx: reconcile_tx.clone(),
                },
                user_frame_rx,
                inner.clone(),
            ),
        ));
        tasks.push((
            "reconciler",
            spawn_reconciler(reconciler.clone(), reconcile_rx, inner.clone()),
        ));

        // --- Projections + periodic health line -------------------------
        let projections = Arc::new(EngineProjections::new(
            store.clone(),
            book.clone(),
            monitor.clone(),
            governor.clone(),
            counters.clone(),
            stream_handles,
            protection_tx.clone(),
        ));
        {
            let projections = projections.clone();
            let health_token = inner.clone();
            tasks.push((
                "health",
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(60));
                    tick.tick().await;
                    loop {
                        tokio::select! {
                            _ = health_token.cancelled() => return,
                            _ = tick.tick() => {
                                let health = projections.engine_health();
                                info!(
                                    positions = health.open_positions,
                                    tranches = health.live_tranches,
                                    weight = health.rate_used_weight,
                                    banned = health.rate_banned,
                                    "Engine health"
                                );
                            }
                        }
                    }
                }),
            ));
        }

        info!(
            symbols = config.symbols.len(),
            simulate = engine.simulate_only,
            hedge = engine.hedge_mode,
            "Engine running"
        );

        // --- Shutdown cascade -------------------------------------------
        shutdown.cancelled().await;
        info!("Shutdown requested, draining tasks");
        inner.cancel();

        let drain = async {
            for (name, task) in tasks {
                if let Err(e) = task.await {
                    warn!(task = name, error = %e, "Task join error");
                }
            }
        };
        let hard_stop = Duration::from_secs(engine.hard_stop_timeout_secs);
        if tokio::time::timeout(hard_stop, drain).await.is_err() {
            let stats = governor.stats();
            error!(
                queued_critical = stats.queued[0],
                queued_normal = stats.queued[1],
                queued_low = stats.queued[2],
                "Hard-stop timeout reached with undrained work"
            );
            return Err(AppError::HardStopTimeout);
        }

        info!("Shutdown complete");
        Ok(())
    }
}

async fn auth_probe(venue: &dyn VenueClient) -> AppResult<()> {
    match venue.account().await {
        Ok(account) => {
            info!(
                balance = %account.total_wallet_balance,
                available = %account.available_balance,
                "Authenticated"
            );
            Ok(())
        }
        Err(VenueError::Auth(msg)) => Err(AppError::Auth(msg)),
        Err(e) => Err(e.into()),
    }
}

/// Idempotent venue mode and per-symbol setup.
async fn init_venue_modes(venue: &dyn VenueClient, config: &AppConfig) {
    let engine = &config.engine;

    match venue.get_position_mode().await {
        Ok(current) if current != engine.hedge_mode => {
            if let Err(e) = venue.set_position_mode(engine.hedge_mode).await {
                error!(error = %e, "Failed to set position mode");
            } else {
                info!(hedge = engine.hedge_mode, "Position mode updated");
            }
        }
        Ok(_) => info!(hedge = engine.hedge_mode, "Position mode already correct"),
        Err(e) => warn!(error = %e, "Could not query position mode"),
    }

    match venue.get_multi_assets_mode().await {
        Ok(current) if current != engine.multi_assets_mode => {
            if let Err(e) = venue.set_multi_assets_mode(engine.multi_assets_mode).await {
                error!(error = %e, "Failed to set multi-assets mode");
            }
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Could not query multi-assets mode"),
    }

    for (symbol, settings) in &config.symbols {
        if let Err(e) = venue.set_leverage(symbol, settings.leverage).await {
            error!(%symbol, error = %e, "Failed to set leverage");
        }
        // Multi-assets margin only supports crossed; skip per-symbol margin
        // type there.
        if !engine.multi_assets_mode {
            if let Err(e) = venue.set_margin_type(symbol, settings.margin_type).await {
                error!(%symbol, error = %e, "Failed to set margin type");
            }
        }
    }
}
