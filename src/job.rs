use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current lifecycle state of a job.
///
/// Legal edges: Created → Queued → Running → {Completed | Failed | Cancelled},
/// plus Cancelled reachable from Created and Queued. Completed, Failed and
/// Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(status: &str) -> Self {
        match status {
            "created" => JobStatus::Created,
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Created,
        }
    }

    /// Whether no further transitions are possible from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A long-running synchronization job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: String,
    pub subject_id: String,
    pub status: JobStatus,
    /// Percent complete, 0–100. Meaningful only while Running; monotonic per job.
    pub progress: u8,
    /// Free-form stage label, e.g. "FETCHING" or "INDEXING".
    pub phase: Option<String>,
    pub error: Option<String>,
    /// Immutable key-value options captured at creation.
    pub options: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Optimistic-concurrency token, incremented by the store on every save.
    /// 0 means the job has never been persisted.
    pub version: i64,
}

impl Job {
    pub fn new<S1, S2>(owner_id: S1, subject_id: S2, options: BTreeMap<String, String>) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self {
            id: JobId::new(),
            owner_id: owner_id.into(),
            subject_id: subject_id.into(),
            status: JobStatus::Created,
            progress: 0,
            phase: None,
            error: None,
            options,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            version: 0,
        }
    }
}

/// Status view of a job exposed at the query boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub phase: Option<String>,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Job> for JobInfo {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            phase: job.phase.clone(),
            error: job.error.clone(),
            completed_at: job.completed_at,
        }
    }
}
