//! Per-tranche circuit breaker.
//!
//! Disables the protection-rebuild and fast-path close paths for a cooldown
//! after repeated consecutive failures, so a venue that keeps rejecting
//! (reduce-only rejected, margin insufficient) cannot drive an infinite
//! cancel/place loop.

use cascade_core::{PositionSide, Symbol};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub max_failures: u32,
    /// How long the path stays disabled once open.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 3,
            cooldown: Duration::from_secs(300),
        }
    }
}

type Key = (Symbol, PositionSide, u64);

#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Tracks failure streaks per tranche.
pub struct CircuitBreaker {
    config: BreakerConfig,
    states: Mutex<HashMap<Key, BreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the guarded path may run for this tranche.
    pub fn allows(&self, symbol: &Symbol, position_side: PositionSide, tranche_id: u64) -> bool {
        let mut states = self.states.lock();
        let key = (symbol.clone(), position_side, tranche_id);
        match states.get_mut(&key) {
            Some(state) => match state.open_until {
                Some(until) if Instant::now() < until => false,
                Some(_) => {
                    // Cooldown expired: reset the streak.
                    state.failures = 0;
                    state.open_until = None;
                    true
                }
                None => true,
            },
            None => true,
        }
    }

    /// Record a failure; opens the breaker once the streak hits the limit.
    pub fn record_failure(&self, symbol: &Symbol, position_side: PositionSide, tranche_id: u64) {
        let mut states = self.states.lock();
        let key = (symbol.clone(), position_side, tranche_id);
        let state = states.entry(key).or_default();
        state.failures += 1;
        if state.failures >= self.config.max_failures && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.config.cooldown);
            warn!(
                %symbol,
                %position_side,
                tranche_id,
                failures = state.failures,
                cooldown_secs = self.config.cooldown.as_secs(),
                "Circuit breaker opened"
            );
        }
    }

    /// Record a success; clears the streak.
    pub fn record_success(&self, symbol: &Symbol, position_side: PositionSide, tranche_id: u64) {
        let mut states = self.states.lock();
        states.remove(&(symbol.clone(), position_side, tranche_id));
    }

    /// Forget a tranche entirely (tranche destroyed).
    pub fn forget(&self, symbol: &Symbol, position_side: PositionSide, tranche_id: u64) {
        self.record_success(symbol, position_side, tranche_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Symbol {
        Symbol::new("BTCUSDT")
    }

    #[test]
    fn test_opens_after_max_failures() {
        let b = CircuitBreaker::new(BreakerConfig {
            max_failures: 3,
            cooldown: Duration::from_secs(60),
        });
        assert!(b.allows(&btc(), PositionSide::Long, 0));
        b.record_failure(&btc(), PositionSide::Long, 0);
        b.record_failure(&btc(), PositionSide::Long, 0);
        assert!(b.allows(&btc(), PositionSide::Long, 0));
        b.record_failure(&btc(), PositionSide::Long, 0);
        assert!(!b.allows(&btc(), PositionSide::Long, 0));
        // Other tranches unaffected.
        assert!(b.allows(&btc(), PositionSide::Long, 1));
    }

    #[test]
    fn test_success_clears_streak() {
        let b = CircuitBreaker::new(BreakerConfig {
            max_failures: 2,
            cooldown: Duration::from_secs(60),
        });
        b.record_failure(&btc(), PositionSide::Short, 5);
        b.record_success(&btc(), PositionSide::Short, 5);
        b.record_failure(&btc(), PositionSide::Short, 5);
        assert!(b.allows(&btc(), PositionSide::Short, 5));
    }

    #[test]
    fn test_cooldown_expiry_resets() {
        let b = CircuitBreaker::new(BreakerConfig {
            max_failures: 1,
            cooldown: Duration::from_millis(0),
        });
        b.record_failure(&btc(), PositionSide::Long, 0);
        // Zero cooldown: immediately allowed again with a fresh streak.
        assert!(b.allows(&btc(), PositionSide::Long, 0));
    }
}
