use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::breaker::CircuitBreakers;
use crate::error::{EngineError, Result};

/// A classified failure from a unit of external work.
///
/// Classification travels as a variant, not an error-type hierarchy: the
/// operation (or a classifier wrapping it) decides whether a failure is worth
/// retrying.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct WorkError {
    pub kind: WorkErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkErrorKind {
    /// Transient; retrying with backoff may succeed.
    Retryable,
    /// Permanent; retrying cannot help.
    Terminal,
}

impl WorkError {
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        Self {
            kind: WorkErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal<S: Into<String>>(message: S) -> Self {
        Self {
            kind: WorkErrorKind::Terminal,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == WorkErrorKind::Retryable
    }
}

/// Backoff and retry budget for one failure category.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (default: 3).
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt (default: 1s).
    pub base: Duration,
    /// Backoff ceiling before jitter (default: 30s).
    pub max: Duration,
    /// Jitter fraction added on top of the capped delay (default: 0.25).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Preset for network-bound work, which tolerates longer outages.
    pub fn network() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// `min(base * 2^attempt, max)` plus uniform jitter in
    /// `[0, capped * jitter]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self.base.saturating_mul(factor).min(self.max);

        let jitter_max = capped.as_secs_f64() * self.jitter;
        let jitter = if jitter_max > 0.0 {
            rand::thread_rng().gen_range(0.0..=jitter_max)
        } else {
            0.0
        };

        capped + Duration::from_secs_f64(jitter)
    }
}

/// Per-category retry policies with a default fallback.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    default: RetryPolicy,
    overrides: HashMap<String, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        let mut overrides = HashMap::new();
        overrides.insert("network".to_string(), RetryPolicy::network());
        Self {
            default: RetryPolicy::default(),
            overrides,
        }
    }
}

impl RetryPolicies {
    pub fn with_override<S: Into<String>>(mut self, category: S, policy: RetryPolicy) -> Self {
        self.overrides.insert(category.into(), policy);
        self
    }

    pub fn for_category(&self, category: &str) -> &RetryPolicy {
        self.overrides.get(category).unwrap_or(&self.default)
    }
}

/// Wraps a unit of work with backoff retries and circuit-breaker checks.
///
/// Retryable failures are fully absorbed here; callers only see the final
/// outcome. The backoff sleep is the one suspension point, and cancellation
/// is observed there and before each attempt — never mid call.
pub struct RetryExecutor {
    breakers: Arc<CircuitBreakers>,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<CircuitBreakers>) -> Self {
        Self { breakers }
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub async fn run<T, F, Fut>(
        &self,
        category: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, WorkError>>,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            if self.breakers.is_open(category) {
                return Err(EngineError::CircuitOpen {
                    category: category.to_string(),
                    retry_after: self.breakers.remaining_timeout(category),
                });
            }

            match operation(attempt).await {
                Ok(value) => {
                    self.breakers.record_success(category);
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    self.breakers.record_failure(category);

                    if attempt >= policy.max_retries {
                        warn!(
                            category,
                            attempts = attempt + 1,
                            error = %err,
                            "Retry budget exhausted"
                        );
                        return Err(EngineError::MaxRetriesExceeded {
                            attempts: attempt + 1,
                            last_error: err.message,
                        });
                    }

                    let delay = policy.backoff_delay(attempt);
                    debug!(
                        category,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, backing off"
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    }

                    attempt += 1;
                }
                Err(err) => {
                    // Terminal failures bypass the breaker and the budget.
                    return Err(EngineError::Operation(err.message));
                }
            }
        }
    }
}
