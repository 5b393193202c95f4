pub mod breaker;
pub mod clock;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod manager;
pub mod retry;
pub mod runner;
pub mod store;

pub use breaker::{BreakerConfig, CircuitBreakers, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use concurrency::ConcurrencyController;
pub use config::EngineConfig;
pub use engine::JobEngine;
pub use error::{EngineError, Result};
pub use job::{Job, JobId, JobInfo, JobStatus};
pub use manager::JobManager;
pub use retry::{RetryExecutor, RetryPolicies, RetryPolicy, WorkError, WorkErrorKind};
pub use runner::{JobRunner, SyncOperation, WorkContext};
pub use store::{JobStore, SqliteJobStore, StoreError};
