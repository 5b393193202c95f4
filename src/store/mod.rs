pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::job::{Job, JobId, JobStatus};

pub use sqlite::SqliteJobStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Stale write for job {job_id}: expected version {expected_version}")]
    Conflict { job_id: JobId, expected_version: i64 },

    #[error("Corrupt job record {job_id}: {reason}")]
    Corrupt { job_id: JobId, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable storage contract for job records.
///
/// One row per job, keyed by id, carrying every `Job` attribute plus a
/// monotonically increasing version token. A successful save must survive an
/// immediate crash.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upsert the job by id and return the new version token.
    ///
    /// A save based on a stale read (the job's `version` no longer matches
    /// the stored row) fails with [`StoreError::Conflict`] rather than
    /// overwriting silently. Jobs with `version == 0` are inserted fresh.
    async fn save_job(&self, job: &Job) -> Result<i64>;

    async fn load_job(&self, id: &JobId) -> Result<Job>;

    /// Jobs matching every given filter, ordered by `created_at` descending.
    async fn query_jobs(
        &self,
        owner_id: Option<&str>,
        status: Option<JobStatus>,
        older_than: Option<DateTime<Utc>>,
    ) -> Result<Vec<Job>>;

    /// Number of Created/Queued jobs for the owner created at or before the
    /// given instant. Feeds queue-position reporting; an eventual estimate.
    async fn count_pending_through(
        &self,
        owner_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Remove terminal jobs whose `completed_at` is older than the retention
    /// window. Returns the number of rows removed.
    async fn delete_expired(&self, retention: Duration) -> Result<u64>;
}
