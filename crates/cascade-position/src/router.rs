//! User-data stream routing.
//!
//! Parses `ORDER_TRADE_UPDATE` events and routes them: entry fills to the
//! partitioner (then protection work), TP/SL fills to the protection
//! actor, account drift to the reconciler. Events for the same order
//! arrive and are processed in venue order; no cross-order ordering is
//! assumed.

use crate::protection::{ProtectionManager, ProtectionWork};
use crate::tranche::TrancheBook;
use cascade_core::{OrderKind, OrderStatus, Qty};
use cascade_evaluator::ExposureTracker;
use cascade_feed::parser::{parse_user_frame, OrderUpdate, UserEvent};
use cascade_store::{FillRow, Store};
use cascade_telemetry::EngineCounters;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dependencies for the router task.
pub struct RouterDeps {
    pub store: Arc<dyn Store>,
    pub book: Arc<TrancheBook>,
    pub exposure: Arc<ExposureTracker>,
    pub counters: Arc<EngineCounters>,
    pub protection_tx: mpsc::Sender<ProtectionWork>,
    /// Pokes the reconciler on account drift.
    pub reconcile_tx: mpsc::Sender<()>,
}

/// Spawn the fill-router task over raw user-data frames.
pub fn spawn_fill_router(
    deps: RouterDeps,
    mut frame_rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Fill router started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Fill router exiting");
                    return;
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        info!("User-data channel closed, router exiting");
                        return;
                    };
                    match parse_user_frame(&frame) {
                        Ok(UserEvent::Order(update)) => route_order_update(&deps, update).await,
                        Ok(UserEvent::AccountUpdate { .. }) => {
                            debug!("Account update, poking reconciler");
                            let _ = deps.reconcile_tx.try_send(());
                        }
                        Ok(UserEvent::ListenKeyExpired) => {
                            // The stream task recreates the key on its next
                            // reconnect; the sweep covers any gap.
                            warn!("Listen key expired");
                            let _ = deps.reconcile_tx.try_send(());
                        }
                        Ok(UserEvent::Ignored) => {}
                        Err(e) => debug!(error = %e, "Unparseable user-data frame"),
                    }
                }
            }
        }
    })
}

async fn route_order_update(deps: &RouterDeps, update: OrderUpdate) {
    // Persist the status transition first.
    let final_at = update.status.is_terminal().then_some(update.event_time_ms);
    let avg = (!update.avg_price.is_zero()).then_some(update.avg_price);
    if let Err(e) = deps.store.update_order_status(
        &update.order_id,
        update.status,
        update.filled_qty,
        avg,
        final_at,
    ) {
        warn!(order_id = %update.order_id, error = %e, "Failed to persist order status");
    }
    if update.last_fill_qty.is_positive() {
        let fill = FillRow {
            order_id: update.order_id.clone(),
            seq: update.trade_id,
            qty: update.last_fill_qty,
            price: if update.last_price.is_zero() {
                update.avg_price
            } else {
                update.last_price
            },
            time_ms: update.event_time_ms,
            commission: update.commission,
        };
        if let Err(e) = deps.store.insert_fill(&fill) {
            warn!(order_id = %update.order_id, error = %e, "Failed to persist fill");
        }
    }

    // Classify by the recorded order kind; orders we never recorded (manual
    // or pre-restart) fall back to the tranche book's protection ids.
    let kind = match deps.store.get_order(&update.order_id) {
        Ok(Some(record)) => Some(record.kind),
        Ok(None) => deps
            .book
            .find_by_order(&update.order_id)
            .map(|tranche| {
                if tranche.tp_order_id.as_deref() == Some(update.order_id.as_str()) {
                    OrderKind::Tp
                } else {
                    OrderKind::Sl
                }
            }),
        Err(e) => {
            warn!(order_id = %update.order_id, error = %e, "Order lookup failed");
            None
        }
    };

    match kind {
        Some(OrderKind::Entry) => route_entry(deps, &update).await,
        Some(OrderKind::Tp) => route_protection(deps, update, OrderKind::Tp).await,
        Some(OrderKind::Sl) => route_protection(deps, update, OrderKind::Sl).await,
        Some(OrderKind::Close) => {
            if update.status == OrderStatus::Filled {
                route_close_fill(deps, &update).await;
            }
        }
        None => debug!(order_id = %update.order_id, "Update for untracked order"),
    }
}

async fn route_entry(deps: &RouterDeps, update: &OrderUpdate) {
    match update.status {
        OrderStatus::Filled => {
            // Release the pending-exposure reservation now that the fill is
            // real exposure.
            deps.exposure.remove_pending(
                &update.symbol,
                update.filled_qty.notional(update.avg_price),
            );

            let effect = match deps.book.apply_entry_fill(
                &update.symbol,
                update.position_side,
                update.filled_qty,
                update.avg_price,
            ) {
                Ok(effect) => effect,
                Err(e) => {
                    warn!(
                        symbol = %update.symbol,
                        order_id = %update.order_id,
                        error = %e,
                        "Failed to apply entry fill"
                    );
                    return;
                }
            };
            info!(
                symbol = %update.symbol,
                order_id = %update.order_id,
                qty = %update.filled_qty,
                price = %update.avg_price,
                "Entry filled"
            );
            match &effect {
                crate::tranche::EntryFillEffect::Created { .. } => {
                    EngineCounters::incr(&deps.counters.tranches_created);
                }
                crate::tranche::EntryFillEffect::MergedAndCreated { .. } => {
                    EngineCounters::incr(&deps.counters.tranches_created);
                    EngineCounters::incr(&deps.counters.tranches_merged);
                }
                crate::tranche::EntryFillEffect::Absorbed { .. } => {}
            }
            for work in ProtectionManager::work_for_entry_effect(&effect, &update.order_id) {
                if deps.protection_tx.send(work).await.is_err() {
                    warn!("Protection channel closed");
                    return;
                }
            }
        }
        OrderStatus::Canceled | OrderStatus::Expired | OrderStatus::Rejected => {
            // Remaining reservation is released against the order's limit
            // price recorded at submission.
            if let Ok(Some(record)) = deps.store.get_order(&update.order_id) {
                if let Some(price) = record.price {
                    let unfilled = record.qty.saturating_sub(update.filled_qty);
                    deps.exposure
                        .remove_pending(&update.symbol, unfilled.notional(price));
                }
            }
            debug!(order_id = %update.order_id, status = %update.status, "Entry terminal without full fill");
        }
        _ => {}
    }
}

async fn route_protection(deps: &RouterDeps, update: OrderUpdate, kind: OrderKind) {
    match update.status {
        OrderStatus::Filled => {
            let work = ProtectionWork::ProtectionFill { update, kind };
            if deps.protection_tx.send(work).await.is_err() {
                warn!("Protection channel closed");
            }
        }
        OrderStatus::Canceled | OrderStatus::Expired => {
            // A protection leg died while its tranche lives: rebuild.
            // Rebuild requests for legs the engine itself is replacing are
            // no-ops by the time the actor processes them.
            if let Some(tranche) = deps.book.find_by_order(&update.order_id) {
                debug!(
                    symbol = %update.symbol,
                    order_id = %update.order_id,
                    tranche_id = tranche.id,
                    "Protection leg terminated, scheduling rebuild"
                );
                let work = ProtectionWork::Rebuild {
                    symbol: tranche.symbol.clone(),
                    position_side: tranche.position_side,
                    tranche_id: tranche.id,
                    main_order_id: None,
                };
                let _ = deps.protection_tx.send(work).await;
            }
        }
        _ => {}
    }
}

async fn route_close_fill(deps: &RouterDeps, update: &OrderUpdate) {
    // Market reduce (fast path or close command) filled: reduce the tranche
    // it targeted, or walk tranches oldest-first for a whole-position close.
    if let Ok(Some(record)) = deps.store.get_order(&update.order_id) {
        if let Some(tranche_id) = record.tranche_id {
            match deps.book.reduce(
                &update.symbol,
                update.position_side,
                tranche_id,
                update.filled_qty,
            ) {
                Ok(crate::tranche::ReduceEffect::Closed { tranche }) => {
                    info!(
                        symbol = %update.symbol,
                        tranche_id,
                        pnl = %update.realized_pnl,
                        "Tranche closed by market reduce"
                    );
                    let work = ProtectionWork::CancelPair {
                        symbol: update.symbol.clone(),
                        tp_order_id: tranche.tp_order_id,
                        sl_order_id: tranche.sl_order_id,
                    };
                    let _ = deps.protection_tx.send(work).await;
                }
                Ok(crate::tranche::ReduceEffect::Reduced { tranche }) => {
                    let work = ProtectionWork::Rebuild {
                        symbol: update.symbol.clone(),
                        position_side: update.position_side,
                        tranche_id: tranche.id,
                        main_order_id: None,
                    };
                    let _ = deps.protection_tx.send(work).await;
                }
                Err(e) => {
                    debug!(symbol = %update.symbol, tranche_id, error = %e, "Close fill for missing tranche");
                }
            }
            return;
        }
    }

    // Whole-position close: drain tranches oldest-first.
    let mut remaining = update.filled_qty;
    for tranche in deps.book.snapshot(&update.symbol, update.position_side) {
        if !remaining.is_positive() {
            break;
        }
        let take = if tranche.quantity.inner() <= remaining.inner() {
            tranche.quantity
        } else {
            remaining
        };
        remaining = remaining.saturating_sub(take);
        match deps
            .book
            .reduce(&update.symbol, update.position_side, tranche.id, take)
        {
            Ok(crate::tranche::ReduceEffect::Closed { tranche }) => {
                let work = ProtectionWork::CancelPair {
                    symbol: update.symbol.clone(),
                    tp_order_id: tranche.tp_order_id,
                    sl_order_id: tranche.sl_order_id,
                };
                let _ = deps.protection_tx.send(work).await;
            }
            Ok(crate::tranche::ReduceEffect::Reduced { tranche }) => {
                let work = ProtectionWork::Rebuild {
                    symbol: update.symbol.clone(),
                    position_side: update.position_side,
                    tranche_id: tranche.id,
                    main_order_id: None,
                };
                let _ = deps.protection_tx.send(work).await;
            }
            Err(e) => warn!(error = %e, "Whole-position close reduce failed"),
        }
    }
}
