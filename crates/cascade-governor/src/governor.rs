//! Admission controller over weight and order quotas.
//!
//! Thread-safe; callers may race `try_admit` concurrently. Admission is
//! never retried internally: denied callers get a wait hint and decide for
//! themselves (or park in the opt-in priority queue).

use crate::error::{GovernorError, GovernorResult};
use crate::weights::Endpoint;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const WINDOW: Duration = Duration::from_secs(60);
/// Header snapshots go stale quickly; past this age the local window wins.
const HEADER_TTL: Duration = Duration::from_secs(10);

/// Request priority. A fraction of capacity is reserved for `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Critical,
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

/// Operating mode; elevated modes widen the effective limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GovernorMode {
    Normal,
    /// ~95% of raw capacity, reserve 10%.
    Burst,
    /// ~95% of raw capacity, reserve shrunk to 5%.
    Liquidation,
}

/// Governor configuration.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    /// Raw venue weight limit per minute.
    pub weight_limit: u32,
    /// Raw venue order limit per minute.
    pub order_limit: u32,
    /// Safety buffer fraction in normal mode (0.10 = use 90%).
    pub buffer_pct: f64,
    /// Fraction of the effective limit reserved for critical requests.
    pub reserve_pct: f64,
    /// Maximum queued requests per priority.
    pub max_queue: usize,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            weight_limit: 2400,
            order_limit: 1200,
            buffer_pct: 0.10,
            reserve_pct: 0.20,
            max_queue: 100,
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Admitted,
    Denied { retry_after: Duration },
}

/// Snapshot of governor state for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorStats {
    pub used_weight: u32,
    pub weight_limit: u32,
    pub used_orders: u32,
    pub order_limit: u32,
    pub mode: GovernorMode,
    pub banned: bool,
    pub consecutive_429s: u32,
    pub queued: [usize; 3],
}

#[derive(Debug)]
struct QueuedRequest {
    endpoint: Endpoint,
    enqueued_at: Instant,
}

struct State {
    weight_window: VecDeque<(Instant, u32)>,
    order_window: VecDeque<(Instant, u32)>,
    header_weight: Option<(Instant, u32)>,
    header_orders: Option<(Instant, u32)>,
    consecutive_429s: u32,
    banned_until: Option<Instant>,
    mode: GovernorMode,
    mode_until: Option<Instant>,
    critical_queue: VecDeque<QueuedRequest>,
    normal_queue: VecDeque<QueuedRequest>,
    low_queue: VecDeque<QueuedRequest>,
}

impl State {
    fn prune(&mut self, now: Instant) {
        let cutoff = now - WINDOW;
        while self.weight_window.front().is_some_and(|&(t, _)| t < cutoff) {
            self.weight_window.pop_front();
        }
        while self.order_window.front().is_some_and(|&(t, _)| t < cutoff) {
            self.order_window.pop_front();
        }
        if let Some(until) = self.mode_until {
            if now >= until {
                self.mode = GovernorMode::Normal;
                self.mode_until = None;
                info!("Governor elevated mode expired, back to normal limits");
            }
        }
    }

    fn local_weight(&self) -> u32 {
        self.weight_window.iter().map(|&(_, w)| w).sum()
    }

    fn local_orders(&self) -> u32 {
        self.order_window.iter().map(|&(_, n)| n).sum()
    }

    /// Weight usage: headers are authoritative when fresh.
    fn used_weight(&self, now: Instant) -> u32 {
        match self.header_weight {
            Some((t, w)) if now.duration_since(t) < HEADER_TTL => w,
            _ => self.local_weight(),
        }
    }

    fn used_orders(&self, now: Instant) -> u32 {
        match self.header_orders {
            Some((t, n)) if now.duration_since(t) < HEADER_TTL => n,
            _ => self.local_orders(),
        }
    }

    fn queue_for(&mut self, priority: Priority) -> &mut VecDeque<QueuedRequest> {
        match priority {
            Priority::Critical => &mut self.critical_queue,
            Priority::Normal => &mut self.normal_queue,
            Priority::Low => &mut self.low_queue,
        }
    }

    /// Wait until the oldest window entry ages out.
    fn retry_hint(&self, now: Instant) -> Duration {
        match self.weight_window.front() {
            Some(&(t, _)) => WINDOW.saturating_sub(now.duration_since(t)).max(Duration::from_millis(100)),
            None => Duration::from_millis(100),
        }
    }
}

/// Thread-safe admission controller. See module docs.
pub struct RateGovernor {
    config: GovernorConfig,
    state: Mutex<State>,
}

impl RateGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        info!(
            weight_limit = config.weight_limit,
            order_limit = config.order_limit,
            buffer_pct = config.buffer_pct,
            reserve_pct = config.reserve_pct,
            "Rate governor initialized"
        );
        Self {
            config,
            state: Mutex::new(State {
                weight_window: VecDeque::new(),
                order_window: VecDeque::new(),
                header_weight: None,
                header_orders: None,
                consecutive_429s: 0,
                banned_until: None,
                mode: GovernorMode::Normal,
                mode_until: None,
                critical_queue: VecDeque::new(),
                normal_queue: VecDeque::new(),
                low_queue: VecDeque::new(),
            }),
        }
    }

    fn limits(&self, mode: GovernorMode) -> (u32, u32, u32, u32) {
        let (buffer, reserve) = match mode {
            GovernorMode::Normal => (self.config.buffer_pct, self.config.reserve_pct),
            GovernorMode::Burst => (0.05, 0.10),
            GovernorMode::Liquidation => (0.05, 0.05),
        };
        let weight_eff = (self.config.weight_limit as f64 * (1.0 - buffer)) as u32;
        let order_eff = (self.config.order_limit as f64 * (1.0 - buffer)) as u32;
        let weight_normal = weight_eff - (weight_eff as f64 * reserve) as u32;
        let order_normal = order_eff - (order_eff as f64 * reserve) as u32;
        (weight_eff, order_eff, weight_normal, order_normal)
    }

    /// Check whether a request may go out now.
    ///
    /// Does not consume capacity; call [`record`](Self::record) once the
    /// request is actually sent.
    pub fn try_admit(&self, endpoint: &Endpoint, priority: Priority) -> GovernorResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock();

        if let Some(until) = state.banned_until {
            if now < until {
                return Err(GovernorError::Banned {
                    remaining: until.duration_since(now),
                });
            }
            state.banned_until = None;
            info!("Governor ban expired, resuming admissions");
        }

        state.prune(now);

        let (weight_eff, order_eff, weight_normal, order_normal) = self.limits(state.mode);
        let (weight_limit, order_limit) = match priority {
            Priority::Critical => (weight_eff, order_eff),
            _ => (weight_normal, order_normal),
        };

        let weight = endpoint.weight();
        if state.used_weight(now) + weight > weight_limit {
            let retry_after = state.retry_hint(now);
            debug!(
                endpoint = %endpoint,
                weight,
                used = state.used_weight(now),
                limit = weight_limit,
                "Admission denied: weight window full"
            );
            return Err(GovernorError::RateLimited { retry_after });
        }

        if endpoint.counts_as_order()
            && state.used_orders(now) + endpoint.order_count() > order_limit
        {
            let retry_after = state.retry_hint(now);
            debug!(
                endpoint = %endpoint,
                used = state.used_orders(now),
                limit = order_limit,
                "Admission denied: order window full"
            );
            return Err(GovernorError::RateLimited { retry_after });
        }

        Ok(())
    }

    /// Record a sent request against the local windows.
    pub fn record(&self, endpoint: &Endpoint) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.weight_window.push_back((now, endpoint.weight()));
        if endpoint.counts_as_order() {
            state.order_window.push_back((now, endpoint.order_count()));
        }
    }

    /// Reconcile the local windows with venue quota headers.
    ///
    /// Headers (`X-MBX-USED-WEIGHT*`, `X-MBX-ORDER-COUNT*`) are authoritative
    /// when present.
    pub fn on_headers(&self, used_weight: Option<u32>, order_count: Option<u32>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(w) = used_weight {
            state.header_weight = Some((now, w));
            let (weight_eff, ..) = self.limits(state.mode);
            if w * 10 >= weight_eff * 9 {
                warn!(used = w, limit = weight_eff, "Weight usage above 90% of effective limit");
            }
        }
        if let Some(n) = order_count {
            state.header_orders = Some((now, n));
        }
    }

    /// Record an HTTP outcome. Returns the backoff the caller should apply
    /// before its next attempt, if any.
    pub fn on_response(&self, status: u16, retry_after: Option<Duration>) -> Option<Duration> {
        let mut state = self.state.lock();
        match status {
            429 => {
                state.consecutive_429s += 1;
                let n = state.consecutive_429s.min(6);
                let backoff = Duration::from_secs((1u64 << n).min(60));
                warn!(
                    consecutive = state.consecutive_429s,
                    backoff_secs = backoff.as_secs(),
                    "429 rate limited"
                );
                Some(backoff)
            }
            418 => {
                let n = state.consecutive_429s.min(5);
                let ban = retry_after.unwrap_or(Duration::from_secs(120 * (1 << n)));
                state.banned_until = Some(Instant::now() + ban);
                warn!(ban_secs = ban.as_secs(), "418 IP ban, halting all admissions");
                Some(ban)
            }
            s if s < 400 => {
                if state.consecutive_429s > 0 {
                    debug!(was = state.consecutive_429s, "429 streak cleared");
                    state.consecutive_429s = 0;
                }
                None
            }
            _ => None,
        }
    }

    /// Whether admissions are currently halted by a ban.
    pub fn is_banned(&self) -> bool {
        let state = self.state.lock();
        state.banned_until.is_some_and(|until| Instant::now() < until)
    }

    /// Enable burst mode for `duration`. Idempotent; extends the expiry.
    pub fn elevate_burst(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.mode != GovernorMode::Burst {
            info!(secs = duration.as_secs(), "Burst mode enabled");
        }
        state.mode = GovernorMode::Burst;
        state.mode_until = Some(Instant::now() + duration);
    }

    /// Enable liquidation mode for `duration`. Idempotent; extends the expiry.
    pub fn elevate_liquidation(&self, duration: Duration) {
        let mut state = self.state.lock();
        if state.mode != GovernorMode::Liquidation {
            info!(secs = duration.as_secs(), "Liquidation mode enabled");
        }
        state.mode = GovernorMode::Liquidation;
        state.mode_until = Some(Instant::now() + duration);
    }

    /// Park a request descriptor in the opt-in priority queue.
    pub fn enqueue(&self, endpoint: Endpoint, priority: Priority) -> GovernorResult<()> {
        let mut state = self.state.lock();
        let max = self.config.max_queue;
        let queue = state.queue_for(priority);
        if queue.len() >= max {
            return Err(GovernorError::QueueFull {
                priority: priority.as_str(),
            });
        }
        queue.push_back(QueuedRequest {
            endpoint,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Pop the highest-priority queued request that can be admitted now.
    pub fn next_ready(&self) -> Option<(Endpoint, Priority)> {
        for priority in [Priority::Critical, Priority::Normal, Priority::Low] {
            let endpoint = {
                let mut state = self.state.lock();
                state.queue_for(priority).front().map(|q| q.endpoint)
            };
            if let Some(endpoint) = endpoint {
                if self.try_admit(&endpoint, priority).is_ok() {
                    let mut state = self.state.lock();
                    let popped = state.queue_for(priority).pop_front();
                    if let Some(q) = popped {
                        debug!(
                            endpoint = %q.endpoint,
                            waited_ms = q.enqueued_at.elapsed().as_millis() as u64,
                            "Dequeued request"
                        );
                    }
                    return Some((endpoint, priority));
                }
            }
        }
        None
    }

    /// Poll until the request is admitted (or a ban blocks it).
    ///
    /// Used by callers that would rather wait than handle the denial.
    pub async fn wait_for_admission(
        &self,
        endpoint: &Endpoint,
        priority: Priority,
    ) -> GovernorResult<()> {
        loop {
            match self.try_admit(endpoint, priority) {
                Ok(()) => return Ok(()),
                Err(GovernorError::Banned { remaining }) => {
                    return Err(GovernorError::Banned { remaining })
                }
                Err(GovernorError::RateLimited { retry_after }) => {
                    tokio::time::sleep(retry_after.min(Duration::from_millis(250))).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Snapshot for health reporting.
    pub fn stats(&self) -> GovernorStats {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.prune(now);
        let (weight_eff, order_eff, ..) = self.limits(state.mode);
        GovernorStats {
            used_weight: state.used_weight(now),
            weight_limit: weight_eff,
            used_orders: state.used_orders(now),
            order_limit: order_eff,
            mode: state.mode,
            banned: state.banned_until.is_some_and(|u| now < u),
            consecutive_429s: state.consecutive_429s,
            queued: [
                state.critical_queue.len(),
                state.normal_queue.len(),
                state.low_queue.len(),
            ],
        }
    }

    #[cfg(test)]
    fn push_weight_at(&self, at: Instant, weight: u32) {
        self.state.lock().weight_window.push_back((at, weight));
    }
}
