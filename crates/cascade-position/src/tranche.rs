//! Tranche partitioning.
//!
//! A tranche is an independently protected slice of a position. Each
//! (symbol, position_side) key owns an ordered set of tranches with
//! monotonically increasing ids. New entry fills are absorbed into the most
//! recent tranche while the aggregate position is near its average; once
//! the aggregate is sufficiently underwater a fresh tranche is opened so
//! earlier slices keep their own exits.

use crate::error::{PositionError, PositionResult};
use cascade_core::{PositionSide, Price, Qty, Symbol};
use cascade_store::{Store, TrancheRow};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Basis for the aggregate-PnL percentage that decides when a new tranche
/// opens. The original system had both candidates; `Aggregate` is the
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranchePnlBasis {
    /// Weighted-average entry across all live tranches.
    #[default]
    Aggregate,
    /// Entry price of the most recent tranche only.
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheConfig {
    /// Adverse aggregate move (percent) that opens a new tranche.
    pub tranche_increment_pct: Decimal,
    pub max_tranches_per_symbol_side: usize,
    #[serde(default)]
    pub pnl_basis: TranchePnlBasis,
}

impl Default for TrancheConfig {
    fn default() -> Self {
        Self {
            tranche_increment_pct: Decimal::from(5),
            max_tranches_per_symbol_side: 5,
            pnl_basis: TranchePnlBasis::Aggregate,
        }
    }
}

/// An independently protected slice of a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tranche {
    pub id: u64,
    pub symbol: Symbol,
    pub position_side: PositionSide,
    pub avg_entry_price: Price,
    pub quantity: Qty,
    pub tp_order_id: Option<String>,
    pub sl_order_id: Option<String>,
    /// Target prices for the current protection legs; consumed by the
    /// fast-path monitor.
    pub tp_price: Option<Price>,
    pub sl_price: Option<Price>,
    /// Raised when a protection rebuild failed repeatedly; cleared by the
    /// reconciler once protection is restored.
    pub unprotected: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Tranche {
    fn to_row(&self) -> TrancheRow {
        TrancheRow {
            symbol: self.symbol.clone(),
            position_side: self.position_side,
            tranche_id: self.id,
            avg_entry_price: self.avg_entry_price,
            quantity: self.quantity,
            tp_order_id: self.tp_order_id.clone(),
            sl_order_id: self.sl_order_id.clone(),
            created_at_ms: self.created_at_ms,
            updated_at_ms: self.updated_at_ms,
        }
    }

    pub fn notional(&self) -> Decimal {
        self.quantity.notional(self.avg_entry_price)
    }
}

/// Effect of applying an entry fill; tells the caller which tranches need
/// protection work.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryFillEffect {
    /// Fill absorbed into the most recent tranche (weighted average).
    Absorbed { tranche: Tranche },
    /// Aggregate was underwater: new tranche created.
    Created { tranche: Tranche },
    /// Cap reached: two tranches merged first, then the new one created.
    /// The removed tranche's protection orders still rest and must be
    /// canceled by the protection manager.
    MergedAndCreated {
        merged_into: Tranche,
        removed: Tranche,
        created: Tranche,
    },
}

/// Effect of a reduction (TP/SL/close fill).
#[derive(Debug, Clone, PartialEq)]
pub enum ReduceEffect {
    /// Quantity hit zero; the tranche is gone.
    Closed { tranche: Tranche },
    /// Partial reduction; protection should be resized.
    Reduced { tranche: Tranche },
}

/// One merge performed by the opportunistic profitable-pair pass.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub merged_into: Tranche,
    pub removed: Tranche,
}

#[derive(Debug, Default)]
struct KeyBook {
    tranches: BTreeMap<u64, Tranche>,
    next_id: u64,
}

impl KeyBook {
    fn total_qty(&self) -> Qty {
        self.tranches
            .values()
            .fold(Qty::ZERO, |acc, t| acc + t.quantity)
    }

    fn weighted_avg_entry(&self) -> Option<Price> {
        let total = self.total_qty();
        if !total.is_positive() {
            return None;
        }
        let notional: Decimal = self.tranches.values().map(|t| t.notional()).sum();
        Some(Price::new(notional / total.inner()))
    }

    fn latest(&self) -> Option<&Tranche> {
        self.tranches.values().next_back()
    }
}

type Key = (Symbol, PositionSide);

/// The partitioner. Single writer per key: all mutation goes through the
/// per-key mutex; different keys proceed in parallel.
pub struct TrancheBook {
    config: TrancheConfig,
    store: Arc<dyn Store>,
    books: Mutex<HashMap<Key, Arc<Mutex<KeyBook>>>>,
}

impl TrancheBook {
    pub fn new(config: TrancheConfig, store: Arc<dyn Store>) -> Self {
        Self {
            config,
            store,
            books: Mutex::new(HashMap::new()),
        }
    }

    fn key_book(&self, symbol: &Symbol, position_side: PositionSide) -> Arc<Mutex<KeyBook>> {
        let mut books = self.books.lock();
        books
            .entry((symbol.clone(), position_side))
            .or_default()
            .clone()
    }

    /// Read-only lookup that does not allocate an entry for unknown keys.
    fn peek_key_book(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
    ) -> Option<Arc<Mutex<KeyBook>>> {
        let books = self.books.lock();
        books.get(&(symbol.clone(), position_side)).cloned()
    }

    /// Signed aggregate return (percent) for a prospective fill price.
    fn aggregate_pnl_pct(&self, book: &KeyBook, position_side: PositionSide, price: Price) -> Decimal {
        let basis = match self.config.pnl_basis {
            TranchePnlBasis::Aggregate => book.weighted_avg_entry(),
            TranchePnlBasis::Latest => book.latest().map(|t| t.avg_entry_price),
        };
        match basis {
            Some(entry) => position_side.signed_return_pct(entry, price),
            None => Decimal::ZERO,
        }
    }

    /// Apply an entry fill: absorb into the latest tranche or open a new
    /// one, merging first when the cap is hit.
    pub fn apply_entry_fill(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        qty: Qty,
        fill_price: Price,
    ) -> PositionResult<EntryFillEffect> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();

        if book.tranches.is_empty() {
            let tranche = self.create_locked(&mut book, symbol, position_side, qty, fill_price, now_ms)?;
            return Ok(EntryFillEffect::Created { tranche });
        }

        let pnl_pct = self.aggregate_pnl_pct(&book, position_side, fill_price);
        let needs_new = pnl_pct <= -self.config.tranche_increment_pct;

        if !needs_new {
            // Absorb into the most recent tranche.
            let latest_id = book.latest().expect("non-empty").id;
            let tranche = book.tranches.get_mut(&latest_id).expect("latest exists");
            let new_qty = tranche.quantity + qty;
            let avg = (tranche.notional() + qty.notional(fill_price)) / new_qty.inner();
            tranche.avg_entry_price = Price::new(avg);
            tranche.quantity = new_qty;
            tranche.updated_at_ms = now_ms;
            let snapshot = tranche.clone();
            self.store.update_tranche(&snapshot.to_row())?;
            info!(
                %symbol,
                %position_side,
                tranche_id = snapshot.id,
                pnl_pct = %pnl_pct,
                qty = %snapshot.quantity,
                avg = %snapshot.avg_entry_price,
                "Fill absorbed into tranche"
            );
            return Ok(EntryFillEffect::Absorbed { tranche: snapshot });
        }

        // Aggregate is underwater: new tranche. Merge first if at the cap.
        let merged = if book.tranches.len() >= self.config.max_tranches_per_symbol_side {
            Some(self.merge_most_favorable_locked(&mut book, symbol, position_side, now_ms)?)
        } else {
            None
        };

        let created = self.create_locked(&mut book, symbol, position_side, qty, fill_price, now_ms)?;
        info!(
            %symbol,
            %position_side,
            tranche_id = created.id,
            pnl_pct = %pnl_pct,
            increment = %self.config.tranche_increment_pct,
            "Aggregate underwater, opened new tranche"
        );
        match merged {
            Some(outcome) => Ok(EntryFillEffect::MergedAndCreated {
                merged_into: outcome.merged_into,
                removed: outcome.removed,
                created,
            }),
            None => Ok(EntryFillEffect::Created { tranche: created }),
        }
    }

    fn create_locked(
        &self,
        book: &mut KeyBook,
        symbol: &Symbol,
        position_side: PositionSide,
        qty: Qty,
        price: Price,
        now_ms: i64,
    ) -> PositionResult<Tranche> {
        let id = book.next_id;
        book.next_id += 1;
        let tranche = Tranche {
            id,
            symbol: symbol.clone(),
            position_side,
            avg_entry_price: price,
            quantity: qty,
            tp_order_id: None,
            sl_order_id: None,
            tp_price: None,
            sl_price: None,
            unprotected: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        };
        self.store.create_tranche(&tranche.to_row())?;
        book.tranches.insert(id, tranche.clone());
        Ok(tranche)
    }

    /// Merge the pair whose combined weighted-average entry is least
    /// adverse for the position side. Keeps the lower id; returns the
    /// merged survivor and the removed id.
    fn merge_most_favorable_locked(
        &self,
        book: &mut KeyBook,
        symbol: &Symbol,
        position_side: PositionSide,
        now_ms: i64,
    ) -> PositionResult<MergeOutcome> {
        let ids: Vec<u64> = book.tranches.keys().copied().collect();
        let mut best: Option<(u64, u64, Decimal)> = None;
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                let ta = &book.tranches[&a];
                let tb = &book.tranches[&b];
                let qty = ta.quantity + tb.quantity;
                if !qty.is_positive() {
                    continue;
                }
                let avg = (ta.notional() + tb.notional()) / qty.inner();
                // Lower combined entry is favorable for a LONG; higher for
                // a SHORT. Normalize to "smaller score is better".
                let score = match position_side {
                    PositionSide::Short => -avg,
                    _ => avg,
                };
                if best.map(|(.., s)| score < s).unwrap_or(true) {
                    best = Some((a, b, score));
                }
            }
        }
        let (keep_id, remove_id, _) = best.expect("merge called with >= 2 tranches");
        self.merge_pair_locked(book, symbol, position_side, keep_id, remove_id, now_ms)
    }

    fn merge_pair_locked(
        &self,
        book: &mut KeyBook,
        symbol: &Symbol,
        position_side: PositionSide,
        keep_id: u64,
        remove_id: u64,
        now_ms: i64,
    ) -> PositionResult<MergeOutcome> {
        let removed = book
            .tranches
            .remove(&remove_id)
            .ok_or_else(|| PositionError::UnknownTranche {
                symbol: symbol.to_string(),
                position_side: position_side.to_string(),
                tranche_id: remove_id,
            })?;
        let kept = book.tranches.get_mut(&keep_id).expect("keep id exists");
        let qty = kept.quantity + removed.quantity;
        let avg = (kept.notional() + removed.notional()) / qty.inner();
        kept.avg_entry_price = Price::new(avg);
        kept.quantity = qty;
        kept.updated_at_ms = now_ms;
        let snapshot = kept.clone();
        self.store.update_tranche(&snapshot.to_row())?;
        self.store.delete_tranche(symbol, position_side, remove_id)?;
        info!(
            %symbol,
            %position_side,
            keep_id,
            remove_id,
            qty = %snapshot.quantity,
            avg = %snapshot.avg_entry_price,
            "Tranches merged"
        );
        Ok(MergeOutcome {
            merged_into: snapshot,
            removed,
        })
    }

    /// Opportunistic pass: merge any pair whose combined position is
    /// currently profitable at `mark`. Runs until no such pair remains.
    pub fn merge_profitable_pairs(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        mark: Price,
    ) -> PositionResult<Vec<MergeOutcome>> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        let mut outcomes = Vec::new();

        loop {
            let ids: Vec<u64> = book.tranches.keys().copied().collect();
            let mut found = None;
            'outer: for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    let ta = &book.tranches[&a];
                    let tb = &book.tranches[&b];
                    let qty = ta.quantity + tb.quantity;
                    if !qty.is_positive() {
                        continue;
                    }
                    let avg = Price::new((ta.notional() + tb.notional()) / qty.inner());
                    if position_side.signed_return_pct(avg, mark) > Decimal::ZERO {
                        found = Some((a, b));
                        break 'outer;
                    }
                }
            }
            match found {
                Some((keep, remove)) => {
                    let outcome =
                        self.merge_pair_locked(&mut book, symbol, position_side, keep, remove, now_ms)?;
                    outcomes.push(outcome);
                }
                None => break,
            }
        }
        Ok(outcomes)
    }

    /// Reduce a tranche after a TP/SL/close fill.
    pub fn reduce(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        qty: Qty,
    ) -> PositionResult<ReduceEffect> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        let tranche = book
            .tranches
            .get_mut(&tranche_id)
            .ok_or_else(|| PositionError::UnknownTranche {
                symbol: symbol.to_string(),
                position_side: position_side.to_string(),
                tranche_id,
            })?;

        let remaining = tranche.quantity.saturating_sub(qty);
        if remaining.is_zero() {
            let closed = book.tranches.remove(&tranche_id).expect("present");
            self.store.delete_tranche(symbol, position_side, tranche_id)?;
            info!(%symbol, %position_side, tranche_id, "Tranche closed");
            Ok(ReduceEffect::Closed { tranche: closed })
        } else {
            tranche.quantity = remaining;
            tranche.updated_at_ms = now_ms;
            let snapshot = tranche.clone();
            self.store.update_tranche(&snapshot.to_row())?;
            debug!(%symbol, %position_side, tranche_id, remaining = %remaining, "Tranche reduced");
            Ok(ReduceEffect::Reduced { tranche: snapshot })
        }
    }

    /// Remove a tranche without a fill (reconciler resolution).
    pub fn remove(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> PositionResult<Option<Tranche>> {
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        match book.tranches.remove(&tranche_id) {
            Some(t) => {
                self.store.delete_tranche(symbol, position_side, tranche_id)?;
                warn!(%symbol, %position_side, tranche_id, "Tranche removed without fill");
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    /// Create a recovery tranche for an orphan venue position.
    pub fn adopt_recovery(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        qty: Qty,
        mark: Price,
    ) -> PositionResult<Tranche> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        let tranche = self.create_locked(&mut book, symbol, position_side, qty, mark, now_ms)?;
        warn!(
            %symbol,
            %position_side,
            tranche_id = tranche.id,
            qty = %qty,
            mark = %mark,
            "Recovery tranche adopted for orphan position"
        );
        Ok(tranche)
    }

    /// Update protection bookkeeping (owned by the protection manager).
    #[allow(clippy::too_many_arguments)]
    pub fn set_protection(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
        tp_order_id: Option<String>,
        sl_order_id: Option<String>,
        tp_price: Option<Price>,
        sl_price: Option<Price>,
    ) -> PositionResult<()> {
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        let tranche = book
            .tranches
            .get_mut(&tranche_id)
            .ok_or_else(|| PositionError::UnknownTranche {
                symbol: symbol.to_string(),
                position_side: position_side.to_string(),
                tranche_id,
            })?;
        tranche.tp_order_id = tp_order_id;
        tranche.sl_order_id = sl_order_id;
        tranche.tp_price = tp_price;
        tranche.sl_price = sl_price;
        tranche.unprotected = false;
        tranche.updated_at_ms = chrono::Utc::now().timestamp_millis();
        let snapshot = tranche.clone();
        drop(book);
        self.store.update_tranche(&snapshot.to_row())?;
        Ok(())
    }

    /// Flag a tranche as unprotected after repeated rebuild failures.
    pub fn mark_unprotected(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
    ) {
        let book = self.key_book(symbol, position_side);
        let mut book = book.lock();
        if let Some(t) = book.tranches.get_mut(&tranche_id) {
            t.unprotected = true;
        }
    }

    /// Find the tranche whose TP or SL order id matches.
    pub fn find_by_order(&self, order_id: &str) -> Option<Tranche> {
        let books = self.books.lock();
        for book in books.values() {
            let book = book.lock();
            for t in book.tranches.values() {
                if t.tp_order_id.as_deref() == Some(order_id)
                    || t.sl_order_id.as_deref() == Some(order_id)
                {
                    return Some(t.clone());
                }
            }
        }
        None
    }

    pub fn get(
        &self,
        symbol: &Symbol,
        position_side: PositionSide,
        tranche_id: u64,
    ) -> Option<Tranche> {
        let book = self.peek_key_book(symbol, position_side)?;
        let book = book.lock();
        book.tranches.get(&tranche_id).cloned()
    }

    /// Snapshot of all tranches for a key, id-ordered.
    pub fn snapshot(&self, symbol: &Symbol, position_side: PositionSide) -> Vec<Tranche> {
        match self.peek_key_book(symbol, position_side) {
            Some(book) => {
                let book = book.lock();
                book.tranches.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Every key currently holding tranches.
    pub fn keys(&self) -> Vec<(Symbol, PositionSide)> {
        let books = self.books.lock();
        books
            .iter()
            .filter(|(_, b)| !b.lock().tranches.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn total_qty(&self, symbol: &Symbol, position_side: PositionSide) -> Qty {
        match self.peek_key_book(symbol, position_side) {
            Some(book) => {
                let book = book.lock();
                book.total_qty()
            }
            None => Qty::ZERO,
        }
    }

    /// Rebuild the in-memory books from persisted rows (startup recovery).
    pub fn load_from_store(&self) -> PositionResult<usize> {
        let rows = self.store.list_all_tranches()?;
        let mut count = 0;
        let mut books = self.books.lock();
        for row in rows {
            let book = books
                .entry((row.symbol.clone(), row.position_side))
                .or_default();
            let mut book = book.lock();
            let id = row.tranche_id;
            book.next_id = book.next_id.max(id + 1);
            book.tranches.insert(
                id,
                Tranche {
                    id,
                    symbol: row.symbol.clone(),
                    position_side: row.position_side,
                    avg_entry_price: row.avg_entry_price,
                    quantity: row.quantity,
                    tp_order_id: row.tp_order_id.clone(),
                    sl_order_id: row.sl_order_id.clone(),
                    tp_price: None,
                    sl_price: None,
                    unprotected: false,
                    created_at_ms: row.created_at_ms,
                    updated_at_ms: row.updated_at_ms,
                },
            );
            count += 1;
        }
        info!(count, "Tranche book recovered from store");
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_store::SqliteStore;
    use rust_decimal_macros::dec;

    fn book() -> TrancheBook {
        book_with(TrancheConfig {
            tranche_increment_pct: dec!(5),
            max_tranches_per_symbol_side: 5,
            pnl_basis: TranchePnlBasis::Aggregate,
        })
    }

    fn book_with(config: TrancheConfig) -> TrancheBook {
        TrancheBook::new(config, Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    #[test]
    fn test_first_fill_creates_tranche_zero() {
        let book = book();
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(0.02)), Price::new(dec!(60000)))
            .unwrap();
        let EntryFillEffect::Created { tranche } = effect else {
            panic!("expected create");
        };
        assert_eq!(tranche.id, 0);
        assert_eq!(tranche.avg_entry_price.inner(), dec!(60000));
    }

    #[test]
    fn test_small_adverse_move_absorbs() {
        // Scenario: second fill at -0.67% averages into tranche 0.
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(59600)))
            .unwrap();
        let EntryFillEffect::Absorbed { tranche } = effect else {
            panic!("expected absorb, got {effect:?}");
        };
        assert_eq!(tranche.id, 0);
        assert_eq!(tranche.avg_entry_price.inner(), dec!(59800));
        assert_eq!(tranche.quantity.inner(), dec!(2));
        assert_eq!(book.snapshot(&btc(), PositionSide::Long).len(), 1);
    }

    #[test]
    fn test_deep_adverse_move_creates_second_tranche() {
        // Scenario: fill at -5.33% opens tranche 1, tranche 0 untouched.
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(56800)))
            .unwrap();
        let EntryFillEffect::Created { tranche } = effect else {
            panic!("expected create, got {effect:?}");
        };
        assert_eq!(tranche.id, 1);
        assert_eq!(tranche.avg_entry_price.inner(), dec!(56800));

        let all = book.snapshot(&btc(), PositionSide::Long);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].avg_entry_price.inner(), dec!(60000));
    }

    #[test]
    fn test_boundary_exactly_at_increment_creates() {
        // -5.00% exactly must create (<=, not <).
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(57000)))
            .unwrap();
        assert!(matches!(effect, EntryFillEffect::Created { .. }), "{effect:?}");
    }

    #[test]
    fn test_short_side_symmetry() {
        // For a SHORT, adverse = price rising.
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Short, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Short, Qty::new(dec!(1)), Price::new(dec!(63100)))
            .unwrap();
        assert!(matches!(effect, EntryFillEffect::Created { .. }));
        // Favorable move absorbs.
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Short, Qty::new(dec!(1)), Price::new(dec!(60100)))
            .unwrap();
        assert!(matches!(effect, EntryFillEffect::Absorbed { .. }));
    }

    #[test]
    fn test_max_tranches_forces_merge_then_create() {
        let book = book_with(TrancheConfig {
            tranche_increment_pct: dec!(5),
            max_tranches_per_symbol_side: 2,
            pnl_basis: TranchePnlBasis::Aggregate,
        });
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(56800)))
            .unwrap();
        // Aggregate avg = 58400; -5% of that is 55480.
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(55000)))
            .unwrap();
        let EntryFillEffect::MergedAndCreated {
            merged_into,
            removed,
            created,
        } = effect
        else {
            panic!("expected merge+create, got {effect:?}");
        };
        assert_eq!(merged_into.id, 0);
        assert_eq!(removed.id, 1);
        assert_eq!(merged_into.avg_entry_price.inner(), dec!(58400));
        // Id monotonicity: next tranche id is 2, never reused.
        assert_eq!(created.id, 2);
        assert_eq!(book.snapshot(&btc(), PositionSide::Long).len(), 2);
    }

    #[test]
    fn test_merge_profitable_pairs() {
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(56800)))
            .unwrap();
        // Mark above both entries: combined position is profitable.
        let outcomes = book
            .merge_profitable_pairs(&btc(), PositionSide::Long, Price::new(dec!(61000)))
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(book.snapshot(&btc(), PositionSide::Long).len(), 1);

        // Mark below both: nothing merges.
        let book2 = book_with(TrancheConfig::default());
        book2
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book2
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(56800)))
            .unwrap();
        let outcomes = book2
            .merge_profitable_pairs(&btc(), PositionSide::Long, Price::new(dec!(50000)))
            .unwrap();
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_reduce_to_zero_closes() {
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(0.02)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .reduce(&btc(), PositionSide::Long, 0, Qty::new(dec!(0.02)))
            .unwrap();
        assert!(matches!(effect, ReduceEffect::Closed { .. }));
        assert!(book.snapshot(&btc(), PositionSide::Long).is_empty());
    }

    #[test]
    fn test_partial_reduce() {
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(0.02)), Price::new(dec!(60000)))
            .unwrap();
        let effect = book
            .reduce(&btc(), PositionSide::Long, 0, Qty::new(dec!(0.01)))
            .unwrap();
        let ReduceEffect::Reduced { tranche } = effect else {
            panic!("expected partial reduce");
        };
        assert_eq!(tranche.quantity.inner(), dec!(0.01));
    }

    #[test]
    fn test_ids_monotonic_after_close() {
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.reduce(&btc(), PositionSide::Long, 0, Qty::new(dec!(1)))
            .unwrap();
        // New tranche after full close gets id 1, not 0.
        let effect = book
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        let EntryFillEffect::Created { tranche } = effect else {
            panic!("expected create");
        };
        assert_eq!(tranche.id, 1);
    }

    #[test]
    fn test_set_protection_and_find_by_order() {
        let book = book();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.set_protection(
            &btc(),
            PositionSide::Long,
            0,
            Some("201".into()),
            Some("202".into()),
            Some(Price::new(dec!(61200))),
            Some(Price::new(dec!(59400))),
        )
        .unwrap();
        let found = book.find_by_order("202").unwrap();
        assert_eq!(found.id, 0);
        assert_eq!(found.tp_price.unwrap().inner(), dec!(61200));
    }

    #[test]
    fn test_replay_rebuilds_equivalent_book() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let book = TrancheBook::new(TrancheConfig::default(), store.clone());
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(60000)))
            .unwrap();
        book.apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(56800)))
            .unwrap();

        let recovered = TrancheBook::new(TrancheConfig::default(), store);
        assert_eq!(recovered.load_from_store().unwrap(), 2);
        let a = book.snapshot(&btc(), PositionSide::Long);
        let b = recovered.snapshot(&btc(), PositionSide::Long);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.quantity, y.quantity);
            assert_eq!(x.avg_entry_price, y.avg_entry_price);
        }
        // Next id continues monotonically after recovery.
        let effect = recovered
            .apply_entry_fill(&btc(), PositionSide::Long, Qty::new(dec!(1)), Price::new(dec!(50000)))
            .unwrap();
        let EntryFillEffect::Created { tranche } = effect else {
            panic!("expected create");
        };
        assert_eq!(tranche.id, 2);
    }
}
