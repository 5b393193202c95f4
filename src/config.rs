use crate::breaker::BreakerConfig;
use crate::concurrency::DEFAULT_PER_OWNER_LIMIT;
use crate::retry::RetryPolicies;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrently running jobs allowed per owner.
    pub per_owner_limit: usize,
    /// Optional cap on running jobs across all owners.
    pub global_limit: Option<usize>,
    /// Circuit breaker thresholds shared by every category.
    pub breaker: BreakerConfig,
    /// Backoff policies, keyed by failure category.
    pub retry: RetryPolicies,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            per_owner_limit: DEFAULT_PER_OWNER_LIMIT,
            global_limit: None,
            breaker: BreakerConfig::default(),
            retry: RetryPolicies::default(),
        }
    }
}
