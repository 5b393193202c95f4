use std::time::Duration;

use thiserror::Error;

use crate::job::{JobId, JobStatus};
use crate::store::StoreError;

/// Errors surfaced by the job engine.
///
/// Retryable work failures never appear here directly: they are absorbed by
/// the retry executor and only the final outcome (`MaxRetriesExceeded`,
/// `CircuitOpen`, `Operation`, `Cancelled`) reaches callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {job_id} is already terminal ({status})")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },

    #[error("Progress for job {job_id} may not decrease ({current} -> {requested})")]
    InvalidProgress {
        job_id: JobId,
        current: u8,
        requested: u8,
    },

    #[error("No execution slot available (queue position {queue_position})")]
    CapacityExceeded { queue_position: u64 },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} belongs to another owner")]
    Forbidden(JobId),

    #[error("Concurrent update of job {0}, reload and retry")]
    Conflict(JobId),

    #[error("Circuit open for category '{category}', retry in {retry_after:?}")]
    CircuitOpen {
        category: String,
        retry_after: Duration,
    },

    #[error("Gave up after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },

    #[error("Job was cancelled")]
    Cancelled,

    #[error("{0}")]
    Operation(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, EngineError>;
