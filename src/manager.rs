use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::concurrency::ConcurrencyController;
use crate::error::{EngineError, Result};
use crate::job::{Job, JobId, JobInfo, JobStatus};
use crate::store::{JobStore, StoreError};

struct JobEntry {
    job: Job,
    cancel: CancellationToken,
}

/// Orchestrates the job lifecycle.
///
/// Jobs live in memory behind per-job async mutexes reached through a
/// registry map; every transition takes the job's lock, so concurrent
/// requests for the same legal edge cannot both succeed — the loser observes
/// the new status and gets `InvalidTransition` or `AlreadyTerminal`. The
/// durable snapshot is written through the store before a transition is
/// considered done.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    slots: Arc<ConcurrencyController>,
    jobs: Mutex<HashMap<JobId, Arc<AsyncMutex<JobEntry>>>>,
}

impl JobManager {
    pub fn new(store: Arc<dyn JobStore>, slots: Arc<ConcurrencyController>) -> Self {
        Self {
            store,
            slots,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn slots(&self) -> &Arc<ConcurrencyController> {
        &self.slots
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    async fn entry(&self, job_id: &JobId) -> Result<Arc<AsyncMutex<JobEntry>>> {
        let known = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.get(job_id).cloned()
        };
        if let Some(entry) = known {
            return Ok(entry);
        }

        // Not in this instance's registry; fall back to the durable row so
        // jobs persisted by an earlier process stay visible after a restart.
        let job = match self.store.load_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::NotFound(id)) => return Err(EngineError::NotFound(id)),
            Err(err) => return Err(err.into()),
        };

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(jobs.entry(job_id.clone()).or_insert_with(|| {
            Arc::new(AsyncMutex::new(JobEntry {
                job,
                cancel: CancellationToken::new(),
            }))
        })))
    }

    fn insert_entry(&self, job: Job) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.insert(
            job.id.clone(),
            Arc::new(AsyncMutex::new(JobEntry {
                job,
                cancel: CancellationToken::new(),
            })),
        );
    }

    async fn persist(&self, job: &mut Job) -> Result<()> {
        match self.store.save_job(job).await {
            Ok(version) => {
                job.version = version;
                Ok(())
            }
            Err(StoreError::Conflict { job_id, .. }) => Err(EngineError::Conflict(job_id)),
            Err(err) => Err(err.into()),
        }
    }

    fn check_edge(job: &Job, to: JobStatus) -> Result<()> {
        if job.status.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                job_id: job.id.clone(),
                status: job.status,
            });
        }

        let legal = matches!(
            (job.status, to),
            (JobStatus::Created, JobStatus::Queued)
                | (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Created, JobStatus::Cancelled)
                | (JobStatus::Queued, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Cancelled)
        );

        if legal {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                job_id: job.id.clone(),
                from: job.status,
                to,
            })
        }
    }

    /// Create a job in the Created state and persist it immediately.
    pub async fn create(
        &self,
        owner_id: &str,
        subject_id: &str,
        options: BTreeMap<String, String>,
    ) -> Result<Job> {
        if owner_id.trim().is_empty() {
            return Err(EngineError::Validation("owner id must not be empty".into()));
        }
        if subject_id.trim().is_empty() {
            return Err(EngineError::Validation(
                "subject id must not be empty".into(),
            ));
        }
        if options.keys().any(|k| k.trim().is_empty()) {
            return Err(EngineError::Validation(
                "option keys must not be empty".into(),
            ));
        }

        let mut job = Job::new(owner_id, subject_id, options);
        self.persist(&mut job).await?;

        info!(job_id = %job.id, owner_id, subject_id, "Job created");
        self.insert_entry(job.clone());
        Ok(job)
    }

    /// Created → Queued.
    pub async fn enqueue(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Queued)?;

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Queued;
        self.persist(&mut updated).await?;
        entry.job = updated.clone();

        info!(job_id = %job_id, "Job queued");
        Ok(updated)
    }

    /// Queued → Running, gated by a concurrency slot.
    ///
    /// Returns `CapacityExceeded` with the owner's queue position when no
    /// slot is available; the caller retries later. Never blocks waiting for
    /// a slot.
    pub async fn start(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Running)?;

        let owner_id = entry.job.owner_id.clone();
        if !self.slots.try_acquire(&owner_id, job_id) {
            let queue_position = self
                .store
                .count_pending_through(&owner_id, entry.job.created_at)
                .await?;
            return Err(EngineError::CapacityExceeded { queue_position });
        }

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Running;
        updated.started_at = Some(Utc::now());

        if let Err(err) = self.persist(&mut updated).await {
            self.slots.release(&owner_id, job_id);
            return Err(err);
        }
        entry.job = updated.clone();

        info!(job_id = %job_id, owner_id = %owner_id, "Job running");
        Ok(updated)
    }

    /// Record progress and phase for a Running job.
    ///
    /// Progress clamps to 100 and is monotonic per job: a decreasing value is
    /// rejected with `InvalidProgress`.
    pub async fn update_progress(
        &self,
        job_id: &JobId,
        progress: u8,
        phase: Option<&str>,
    ) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        if entry.job.status != JobStatus::Running {
            // Running → Running is the only edge progress rides on
            Self::check_edge(&entry.job, JobStatus::Running)?;
        }

        let progress = progress.min(100);
        if progress < entry.job.progress {
            return Err(EngineError::InvalidProgress {
                job_id: job_id.clone(),
                current: entry.job.progress,
                requested: progress,
            });
        }

        let mut updated = entry.job.clone();
        updated.progress = progress;
        if let Some(phase) = phase {
            updated.phase = Some(phase.to_string());
        }
        self.persist(&mut updated).await?;
        entry.job = updated.clone();

        Ok(updated)
    }

    /// Running → Completed. Fixes progress at 100 and releases the slot.
    pub async fn complete(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Completed)?;

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Completed;
        updated.progress = 100;
        updated.completed_at = Some(Utc::now());
        self.persist(&mut updated).await?;
        entry.job = updated.clone();

        self.slots.release(&updated.owner_id, job_id);
        info!(job_id = %job_id, "Job completed");
        Ok(updated)
    }

    /// Running → Failed. Stores one human-readable error string and releases
    /// the slot. A failed job is never resurrected; recovery is a new job.
    pub async fn fail(&self, job_id: &JobId, error: &str) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Failed)?;

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Failed;
        updated.error = Some(error.to_string());
        updated.completed_at = Some(Utc::now());
        self.persist(&mut updated).await?;
        entry.job = updated.clone();

        self.slots.release(&updated.owner_id, job_id);
        warn!(job_id = %job_id, error, "Job failed");
        Ok(updated)
    }

    /// Cancel from Created, Queued or Running.
    ///
    /// A Created/Queued job becomes Cancelled right away. For a Running job
    /// this only raises the cooperative flag; the execution loop observes it
    /// between attempts and finishes the job, which is when the slot is
    /// released.
    pub async fn cancel(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Cancelled)?;

        if entry.job.status == JobStatus::Running {
            entry.cancel.cancel();
            info!(job_id = %job_id, "Cancellation requested");
            return Ok(entry.job.clone());
        }

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Cancelled;
        updated.completed_at = Some(Utc::now());
        self.persist(&mut updated).await?;
        entry.cancel.cancel();
        entry.job = updated.clone();

        info!(job_id = %job_id, "Job cancelled");
        Ok(updated)
    }

    /// Running → Cancelled, once the execution loop has observed the flag.
    pub(crate) async fn finish_cancelled(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let mut entry = entry.lock().await;

        Self::check_edge(&entry.job, JobStatus::Cancelled)?;

        let mut updated = entry.job.clone();
        updated.status = JobStatus::Cancelled;
        updated.completed_at = Some(Utc::now());
        self.persist(&mut updated).await?;
        entry.job = updated.clone();

        self.slots.release(&updated.owner_id, job_id);
        info!(job_id = %job_id, "Job cancelled");
        Ok(updated)
    }

    pub async fn get(&self, job_id: &JobId) -> Result<Job> {
        let entry = self.entry(job_id).await?;
        let entry = entry.lock().await;
        Ok(entry.job.clone())
    }

    /// All jobs for one owner, newest first. The owner identity comes from
    /// the trusted boundary layer, never from client input.
    pub async fn list(&self, owner_id: &str) -> Result<Vec<Job>> {
        Ok(self.store.query_jobs(Some(owner_id), None, None).await?)
    }

    /// Status view for the query boundary: `NotFound` for unknown ids,
    /// `Forbidden` when the requester does not own the job.
    pub async fn status_for(&self, job_id: &JobId, requesting_owner: &str) -> Result<JobInfo> {
        let job = self.get(job_id).await?;
        if job.owner_id != requesting_owner {
            return Err(EngineError::Forbidden(job_id.clone()));
        }
        Ok(JobInfo::from(&job))
    }

    /// Cooperative cancellation token for the job's execution loop.
    pub async fn cancel_token(&self, job_id: &JobId) -> Result<CancellationToken> {
        let entry = self.entry(job_id).await?;
        let entry = entry.lock().await;
        Ok(entry.cancel.clone())
    }

    /// Reload persisted jobs after a restart.
    ///
    /// Created/Queued jobs come back as-is and can be driven again. Jobs
    /// persisted as Running lost their execution loop with the process, so
    /// they are marked Failed. Slot accounting is in-memory and restarts
    /// empty, so no slots leak. Returns the number of jobs failed this way.
    pub async fn recover(&self) -> Result<u64> {
        let mut recovered_failures = 0u64;

        for status in [JobStatus::Created, JobStatus::Queued, JobStatus::Running] {
            let jobs = self.store.query_jobs(None, Some(status), None).await?;
            for mut job in jobs {
                if job.status == JobStatus::Running {
                    job.status = JobStatus::Failed;
                    job.error = Some("interrupted by restart".to_string());
                    job.completed_at = Some(Utc::now());
                    self.persist(&mut job).await?;
                    warn!(job_id = %job.id, "Recovered interrupted job as failed");
                    recovered_failures += 1;
                }
                self.insert_entry(job);
            }
        }

        Ok(recovered_failures)
    }

    /// Retention sweep: remove terminal jobs older than the window from the
    /// store and evict their registry entries, so purged ids stop resolving
    /// and the registry does not grow for the life of the process. Returns
    /// the number of rows removed.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<u64> {
        let removed = self.store.delete_expired(retention).await?;
        let cutoff = Utc::now() - retention;

        let snapshot: Vec<(JobId, Arc<AsyncMutex<JobEntry>>)> = {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            jobs.iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(entry)))
                .collect()
        };

        let mut evicted = Vec::new();
        for (id, entry) in snapshot {
            let entry = entry.lock().await;
            if entry.job.status.is_terminal()
                && entry.job.completed_at.map_or(false, |at| at < cutoff)
            {
                evicted.push(id);
            }
        }

        if !evicted.is_empty() {
            let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            for id in &evicted {
                jobs.remove(id);
            }
            info!(evicted = evicted.len(), "Evicted purged job entries");
        }

        Ok(removed)
    }
}
