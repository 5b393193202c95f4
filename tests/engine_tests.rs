use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use sync_jobs::{
    BreakerConfig, CircuitBreakers, CircuitState, ConcurrencyController, EngineConfig,
    EngineError, JobEngine, JobManager, JobStatus, ManualClock, RetryExecutor, RetryPolicies,
    RetryPolicy, SqliteJobStore, SyncOperation, WorkContext, WorkError,
};

fn no_options() -> BTreeMap<String, String> {
    BTreeMap::new()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn in_memory_engine(config: EngineConfig) -> JobEngine {
    init_tracing();
    let store = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    JobEngine::with_store(store, config)
}

struct ScriptedOp {
    category: &'static str,
    calls: AtomicU32,
    fail_first: u32,
    error: fn() -> WorkError,
}

impl ScriptedOp {
    fn succeeding(category: &'static str) -> Self {
        Self {
            category,
            calls: AtomicU32::new(0),
            fail_first: 0,
            error: || WorkError::retryable("unused"),
        }
    }

    fn always_failing(category: &'static str, error: fn() -> WorkError) -> Self {
        Self {
            category,
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            error,
        }
    }
}

#[async_trait]
impl SyncOperation for ScriptedOp {
    fn category(&self) -> &str {
        self.category
    }

    async fn execute(&self, ctx: &WorkContext) -> Result<(), WorkError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err((self.error)());
        }
        ctx.report_progress(50, "INDEXING").await.ok();
        Ok(())
    }
}

// Scenario A: the happy path ends Completed with progress pinned at 100.
#[tokio::test]
async fn completed_job_carries_full_progress() {
    let engine = in_memory_engine(EngineConfig::default()).await;

    let job = engine.submit("u1", "repo-42", no_options()).await.unwrap();
    assert_eq!(job.status, JobStatus::Created);

    let op = ScriptedOp::succeeding("git");
    let status = engine.execute(&job.id, &op).await.unwrap();
    assert_eq!(status, JobStatus::Completed);

    let info = engine.manager().status_for(&job.id, "u1").await.unwrap();
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(info.progress, 100);
    assert_eq!(info.phase.as_deref(), Some("INDEXING"));
    assert!(info.completed_at.is_some());
}

// Scenario B, concurrent variant: 11 parallel starts against a limit of 10.
#[tokio::test]
async fn eleven_concurrent_starts_grant_exactly_ten_slots() {
    let engine = Arc::new(in_memory_engine(EngineConfig::default()).await);

    let mut job_ids = Vec::new();
    for n in 0..11 {
        let job = engine
            .submit("u1", &format!("repo-{n}"), no_options())
            .await
            .unwrap();
        engine.manager().enqueue(&job.id).await.unwrap();
        job_ids.push(job.id);
    }

    let mut handles = Vec::new();
    for job_id in &job_ids {
        let manager = Arc::clone(engine.manager());
        let job_id = job_id.clone();
        handles.push(tokio::spawn(async move { manager.start(&job_id).await }));
    }

    let mut granted = 0;
    let mut refused = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => granted += 1,
            Err(EngineError::CapacityExceeded { queue_position }) => {
                assert!(queue_position >= 1);
                refused += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(granted, 10);
    assert_eq!(refused, 1);
    assert_eq!(engine.manager().slots().owner_running("u1"), 10);
}

// Scenario B, deterministic variant: with every slot held, the one queued
// job is first in line.
#[tokio::test]
async fn refused_start_reports_first_queue_position() {
    let engine = in_memory_engine(EngineConfig::default()).await;
    let manager = engine.manager();

    for n in 0..10 {
        let job = engine
            .submit("u1", &format!("repo-{n}"), no_options())
            .await
            .unwrap();
        manager.enqueue(&job.id).await.unwrap();
        manager.start(&job.id).await.unwrap();
    }

    let eleventh = engine.submit("u1", "repo-10", no_options()).await.unwrap();
    manager.enqueue(&eleventh.id).await.unwrap();

    match manager.start(&eleventh.id).await.unwrap_err() {
        EngineError::CapacityExceeded { queue_position } => assert_eq!(queue_position, 1),
        other => panic!("unexpected error: {other}"),
    }
}

// Scenario C: five consecutive network failures open the circuit; the sixth
// call fast-fails without invoking the operation; after the timeout the
// breaker probes half-open and closes on enough successes.
#[tokio::test]
async fn network_breaker_opens_probes_and_recloses() {
    init_tracing();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let breakers = Arc::new(CircuitBreakers::new(
        BreakerConfig::default(),
        Arc::clone(&clock) as Arc<dyn sync_jobs::Clock>,
    ));
    let executor = RetryExecutor::new(Arc::clone(&breakers));

    // One attempt per run so each run records exactly one failure
    let policy = RetryPolicy {
        max_retries: 0,
        base: Duration::from_millis(1),
        max: Duration::from_millis(1),
        jitter: 0.0,
    };
    let cancel = CancellationToken::new();

    for _ in 0..5 {
        let err = executor
            .run("network", &policy, &cancel, |_| async {
                Err::<(), _>(WorkError::retryable("connect timeout"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MaxRetriesExceeded { .. }));
    }
    assert_eq!(breakers.state("network"), CircuitState::Open);

    // Sixth call: fast fail, operation untouched
    let calls = AtomicU32::new(0);
    let err = executor
        .run("network", &policy, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, WorkError>(()) }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // After the timeout the breaker lets probes through
    clock.advance(chrono::Duration::seconds(61));
    for _ in 0..3 {
        executor
            .run("network", &policy, &cancel, |_| async {
                Ok::<_, WorkError>(())
            })
            .await
            .unwrap();
    }
    assert_eq!(breakers.state("network"), CircuitState::Closed);
}

// Scenario D: cancelling a running job mid backoff-sleep ends it Cancelled
// with its slot released and no further attempt.
#[tokio::test]
async fn cancellation_mid_backoff_ends_cancelled() {
    let config = EngineConfig {
        retry: RetryPolicies::default().with_override(
            "git",
            RetryPolicy {
                max_retries: 5,
                base: Duration::from_secs(30),
                max: Duration::from_secs(30),
                jitter: 0.0,
            },
        ),
        ..EngineConfig::default()
    };
    let engine = Arc::new(in_memory_engine(config).await);

    let job = engine.submit("u1", "repo", no_options()).await.unwrap();
    let job_id = job.id.clone();

    let op = Arc::new(ScriptedOp::always_failing("git", || {
        WorkError::retryable("remote flapping")
    }));

    let task = {
        let engine = Arc::clone(&engine);
        let job_id = job_id.clone();
        let op = Arc::clone(&op);
        tokio::spawn(async move { engine.execute(&job_id, op.as_ref()).await })
    };

    // Wait for the first attempt to fail and park in the 30s backoff
    while op.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.manager().cancel(&job_id).await.unwrap();

    let status = task.await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Cancelled);
    assert_eq!(op.calls.load(Ordering::SeqCst), 1);

    let job = engine.manager().get(&job_id).await.unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());
    assert_eq!(engine.manager().slots().owner_running("u1"), 0);
}

// Restart recovery: a job persisted Running comes back Failed, queued work
// survives, and the new instance can drive it to completion.
#[tokio::test]
async fn engine_recovers_from_a_shared_store() {
    init_tracing();
    let store = Arc::new(SqliteJobStore::in_memory().await.unwrap());

    let interrupted_id;
    let queued_id;
    {
        let first = JobEngine::with_store(
            Arc::clone(&store) as Arc<dyn sync_jobs::JobStore>,
            EngineConfig::default(),
        );
        let running = first.submit("u1", "repo-a", no_options()).await.unwrap();
        first.manager().enqueue(&running.id).await.unwrap();
        first.manager().start(&running.id).await.unwrap();
        interrupted_id = running.id;

        let queued = first.submit("u1", "repo-b", no_options()).await.unwrap();
        first.manager().enqueue(&queued.id).await.unwrap();
        queued_id = queued.id;
    }

    let second = JobEngine::with_store(
        Arc::clone(&store) as Arc<dyn sync_jobs::JobStore>,
        EngineConfig::default(),
    );
    assert_eq!(second.recover().await.unwrap(), 1);

    let interrupted = second.manager().get(&interrupted_id).await.unwrap();
    assert_eq!(interrupted.status, JobStatus::Failed);
    assert_eq!(interrupted.error.as_deref(), Some("interrupted by restart"));

    second.manager().start(&queued_id).await.unwrap();
    second.manager().complete(&queued_id).await.unwrap();
    let done = second.manager().get(&queued_id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);

    // A fresh instance answers the status boundary even for jobs it never
    // drove, matching what list() reports
    let third = JobEngine::with_store(
        Arc::clone(&store) as Arc<dyn sync_jobs::JobStore>,
        EngineConfig::default(),
    );
    let info = third.manager().status_for(&queued_id, "u1").await.unwrap();
    assert_eq!(info.status, JobStatus::Completed);
    assert_eq!(third.manager().list("u1").await.unwrap().len(), 2);
}

// Slot exclusivity doubles as the mutual-exclusion marker: the same legal
// edge cannot be won twice.
#[tokio::test]
async fn racing_transitions_have_one_winner() {
    init_tracing();
    let store = Arc::new(SqliteJobStore::in_memory().await.unwrap());
    let slots = Arc::new(ConcurrencyController::new(10, None));
    let manager = Arc::new(JobManager::new(store, slots));

    let job = manager.create("u1", "repo", no_options()).await.unwrap();
    manager.enqueue(&job.id).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let manager = Arc::clone(&manager);
        let job_id = job.id.clone();
        handles.push(tokio::spawn(async move { manager.start(&job_id).await }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(EngineError::InvalidTransition { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(manager.slots().owner_running("u1"), 1);
}
