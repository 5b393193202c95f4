use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;

/// Configuration for per-category circuit breakers.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed circuit (default: 5).
    pub failure_threshold: u32,
    /// Half-open successes required to close the circuit again (default: 3).
    pub success_threshold: u32,
    /// How long an open circuit blocks attempts before probing (default: 60s).
    pub open_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, attempts flow through.
    Closed,
    /// Downstream judged unhealthy, attempts fast-fail.
    Open,
    /// Probing recovery after the open timeout elapsed.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            last_failure_at: None,
        }
    }
}

/// Registry of circuit breakers, one per failure category (e.g. "network",
/// "git"), shared by every caller using that category.
///
/// The open → half-open transition is computed lazily inside [`is_open`] from
/// `(state, last_failure_at, now)` — no background timer. Each category's
/// state sits behind its own mutex reached through the registry map, so
/// unrelated categories never serialize on one lock.
///
/// [`is_open`]: CircuitBreakers::is_open
pub struct CircuitBreakers {
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    categories: Mutex<HashMap<String, Arc<Mutex<BreakerInner>>>>,
}

impl CircuitBreakers {
    pub fn new(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            categories: Mutex::new(HashMap::new()),
        }
    }

    fn category(&self, category: &str) -> Arc<Mutex<BreakerInner>> {
        let mut categories = self.categories.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            categories
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(BreakerInner::new()))),
        )
    }

    fn open_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.open_timeout)
            .unwrap_or_else(|_| chrono::Duration::MAX)
    }

    /// Whether attempts for the category must fast-fail right now.
    ///
    /// An open circuit whose timeout has elapsed flips to half-open here and
    /// lets the caller through as a probe.
    pub fn is_open(&self, category: &str) -> bool {
        let inner = self.category(category);
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.state != CircuitState::Open {
            return false;
        }

        let elapsed = inner
            .last_failure_at
            .map(|at| self.clock.now() - at)
            .unwrap_or_else(chrono::Duration::zero);

        if elapsed > self.open_timeout() {
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            info!(category, "Circuit half-open, probing recovery");
            return false;
        }

        true
    }

    /// Time left before an open circuit starts probing. Zero when the
    /// circuit is not open.
    pub fn remaining_timeout(&self, category: &str) -> Duration {
        let inner = self.category(category);
        let inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        if inner.state != CircuitState::Open {
            return Duration::ZERO;
        }

        let elapsed = inner
            .last_failure_at
            .map(|at| self.clock.now() - at)
            .unwrap_or_else(chrono::Duration::zero);

        (self.open_timeout() - elapsed).to_std().unwrap_or_default()
    }

    pub fn record_success(&self, category: &str) {
        let inner = self.category(category);
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_successes += 1;
                debug!(
                    category,
                    successes = inner.half_open_successes,
                    needed = self.config.success_threshold,
                    "Half-open probe succeeded"
                );
                if inner.half_open_successes >= self.config.success_threshold {
                    *inner = BreakerInner::new();
                    info!(category, "Circuit closed");
                }
            }
            // A success can land here from an attempt that was already in
            // flight when the circuit opened; it carries no signal.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, category: &str) {
        let inner = self.category(category);
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.last_failure_at = Some(self.clock.now());
                    warn!(
                        category,
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.last_failure_at = Some(self.clock.now());
                inner.half_open_successes = 0;
                warn!(category, "Half-open probe failed, circuit reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Stored state for the category, without the lazy half-open check.
    pub fn state(&self, category: &str) -> CircuitState {
        let inner = self.category(category);
        let inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state
    }
}
