use std::collections::BTreeMap;
use std::sync::Arc;

use crate::breaker::CircuitBreakers;
use crate::clock::SystemClock;
use crate::concurrency::ConcurrencyController;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::job::{Job, JobId, JobStatus};
use crate::manager::JobManager;
use crate::retry::RetryExecutor;
use crate::runner::{JobRunner, SyncOperation};
use crate::store::{JobStore, SqliteJobStore, StoreError};

/// Wires the engine together: store, slot accounting, breakers, manager and
/// runner, all owned by one long-lived instance so independent engines can
/// coexist in tests.
pub struct JobEngine {
    manager: Arc<JobManager>,
    breakers: Arc<CircuitBreakers>,
    runner: JobRunner,
}

impl JobEngine {
    /// Open (or create) a SQLite-backed engine.
    pub async fn new(database_url: &str, config: EngineConfig) -> Result<Self> {
        let store = SqliteJobStore::new(database_url)
            .await
            .map_err(StoreError::from)?;
        Ok(Self::with_store(Arc::new(store), config))
    }

    pub fn with_store(store: Arc<dyn JobStore>, config: EngineConfig) -> Self {
        let slots = Arc::new(ConcurrencyController::new(
            config.per_owner_limit,
            config.global_limit,
        ));
        let manager = Arc::new(JobManager::new(store, slots));
        let breakers = Arc::new(CircuitBreakers::new(config.breaker, Arc::new(SystemClock)));
        let runner = JobRunner::new(
            Arc::clone(&manager),
            RetryExecutor::new(Arc::clone(&breakers)),
            config.retry,
        );

        Self {
            manager,
            breakers,
            runner,
        }
    }

    pub fn manager(&self) -> &Arc<JobManager> {
        &self.manager
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Submission boundary: persist a Created job and hand it back.
    pub async fn submit(
        &self,
        owner_id: &str,
        subject_id: &str,
        options: BTreeMap<String, String>,
    ) -> Result<Job> {
        self.manager.create(owner_id, subject_id, options).await
    }

    /// Queue the job and drive it to a terminal state.
    ///
    /// Safe to call again after `CapacityExceeded`: a job that is already
    /// queued is not re-enqueued.
    pub async fn execute(
        &self,
        job_id: &JobId,
        operation: &dyn SyncOperation,
    ) -> Result<JobStatus> {
        if self.manager.get(job_id).await?.status == JobStatus::Created {
            self.manager.enqueue(job_id).await?;
        }
        self.runner.run_job(job_id, operation).await
    }

    /// Reload persisted jobs after a restart; see [`JobManager::recover`].
    pub async fn recover(&self) -> Result<u64> {
        self.manager.recover().await
    }

    /// Retention sweep over terminal jobs older than the window.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<u64> {
        self.manager.purge_expired(retention).await
    }
}
