//! Symbol specification cache.
//!
//! Specs are cached after the first exchange-info fetch, invalidated on a
//! refresh interval or when a response references lot/tick rules.

use cascade_core::{Symbol, SymbolSpec};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

pub struct SpecCache {
    specs: DashMap<Symbol, SymbolSpec>,
    fetched_at: Mutex<Option<Instant>>,
    refresh_interval: Duration,
}

impl SpecCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            specs: DashMap::new(),
            fetched_at: Mutex::new(None),
            refresh_interval,
        }
    }

    /// Replace the cache contents after an exchange-info fetch.
    pub fn replace(&self, specs: Vec<SymbolSpec>) {
        self.specs.clear();
        for spec in specs {
            self.specs.insert(spec.symbol.clone(), spec);
        }
        *self.fetched_at.lock() = Some(Instant::now());
        debug!(count = self.specs.len(), "Symbol spec cache refreshed");
    }

    pub fn get(&self, symbol: &Symbol) -> Option<SymbolSpec> {
        self.specs.get(symbol).map(|r| r.clone())
    }

    /// Drop a single symbol so the next lookup forces a refetch.
    pub fn invalidate(&self, symbol: &Symbol) {
        if self.specs.remove(symbol).is_some() {
            debug!(%symbol, "Symbol spec invalidated");
        }
    }

    /// Whether the whole cache is due for a refresh.
    pub fn is_stale(&self) -> bool {
        match *self.fetched_at.lock() {
            Some(at) => at.elapsed() >= self.refresh_interval,
            None => true,
        }
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

impl Default for SpecCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
