//! Engine counters.
//!
//! Lock-free counters incremented across the engine and snapshotted into
//! the `engine_health` projection.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct EngineCounters {
    pub liquidations_seen: AtomicU64,
    pub entries_submitted: AtomicU64,
    pub tranches_created: AtomicU64,
    pub tranches_merged: AtomicU64,
    pub protection_rebuilds: AtomicU64,
    pub protection_failures: AtomicU64,
    pub fast_path_closes: AtomicU64,
    pub reconcile_repairs: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub liquidations_seen: u64,
    pub entries_submitted: u64,
    pub tranches_created: u64,
    pub tranches_merged: u64,
    pub protection_rebuilds: u64,
    pub protection_failures: u64,
    pub fast_path_closes: u64,
    pub reconcile_repairs: u64,
}

impl EngineCounters {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            liquidations_seen: self.liquidations_seen.load(Ordering::Relaxed),
            entries_submitted: self.entries_submitted.load(Ordering::Relaxed),
            tranches_created: self.tranches_created.load(Ordering::Relaxed),
            tranches_merged: self.tranches_merged.load(Ordering::Relaxed),
            protection_rebuilds: self.protection_rebuilds.load(Ordering::Relaxed),
            protection_failures: self.protection_failures.load(Ordering::Relaxed),
            fast_path_closes: self.fast_path_closes.load(Ordering::Relaxed),
            reconcile_repairs: self.reconcile_repairs.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_increments() {
        let counters = EngineCounters::default();
        EngineCounters::incr(&counters.liquidations_seen);
        EngineCounters::add(&counters.entries_submitted, 3);
        let snap = counters.snapshot();
        assert_eq!(snap.liquidations_seen, 1);
        assert_eq!(snap.entries_submitted, 3);
        assert_eq!(snap.tranches_created, 0);
    }
}
