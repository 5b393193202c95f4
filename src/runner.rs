use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::job::{JobId, JobStatus};
use crate::manager::JobManager;
use crate::retry::{RetryExecutor, RetryPolicies, WorkError};

/// Handle passed into sync operations for progress reporting and
/// cancellation checks.
pub struct WorkContext {
    job_id: JobId,
    manager: Arc<JobManager>,
    cancel: CancellationToken,
}

impl WorkContext {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Cooperative cancellation check for phase boundaries. Operations should
    /// look at this between stages and return promptly when set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn report_progress(&self, progress: u8, phase: &str) -> Result<()> {
        self.manager
            .update_progress(&self.job_id, progress, Some(phase))
            .await?;
        Ok(())
    }
}

/// One unit of sync work, injected by the embedder.
///
/// Failures must come back classified: [`WorkError::retryable`] for transient
/// conditions worth backing off on, [`WorkError::terminal`] for everything
/// retrying cannot fix.
#[async_trait]
pub trait SyncOperation: Send + Sync {
    /// Failure category the operation's retries and breaker state are keyed
    /// on, e.g. "network" or "git".
    fn category(&self) -> &str;

    async fn execute(&self, ctx: &WorkContext) -> std::result::Result<(), WorkError>;
}

/// Drives one job's execution end to end.
///
/// Exactly one loop drives a Running job: `start()` flips the status, and
/// whoever wins that edge owns the loop until a terminal transition.
pub struct JobRunner {
    manager: Arc<JobManager>,
    executor: RetryExecutor,
    policies: RetryPolicies,
}

impl JobRunner {
    pub fn new(manager: Arc<JobManager>, executor: RetryExecutor, policies: RetryPolicies) -> Self {
        Self {
            manager,
            executor,
            policies,
        }
    }

    /// Start the job and run its operation through retry and breaker
    /// protection, then persist the terminal outcome.
    ///
    /// `CapacityExceeded` propagates untouched so the caller can retry when a
    /// slot frees up. Every other outcome lands the job in a terminal state
    /// and returns it.
    pub async fn run_job(&self, job_id: &JobId, operation: &dyn SyncOperation) -> Result<JobStatus> {
        self.manager.start(job_id).await?;

        let cancel = self.manager.cancel_token(job_id).await?;
        let ctx = WorkContext {
            job_id: job_id.clone(),
            manager: Arc::clone(&self.manager),
            cancel: cancel.clone(),
        };

        let category = operation.category();
        let policy = self.policies.for_category(category);
        debug!(job_id = %job_id, category, "Driving job");

        let outcome = self
            .executor
            .run(category, policy, &cancel, |_attempt| operation.execute(&ctx))
            .await;

        match outcome {
            Ok(()) => {
                self.manager.complete(job_id).await?;
                Ok(JobStatus::Completed)
            }
            Err(EngineError::Cancelled) => {
                self.manager.finish_cancelled(job_id).await?;
                info!(job_id = %job_id, "Job observed cancellation");
                Ok(JobStatus::Cancelled)
            }
            Err(
                err @ (EngineError::CircuitOpen { .. }
                | EngineError::MaxRetriesExceeded { .. }
                | EngineError::Operation(_)),
            ) => {
                self.manager.fail(job_id, &err.to_string()).await?;
                Ok(JobStatus::Failed)
            }
            Err(other) => Err(other),
        }
    }
}
