//! Engine end-to-end tests
//!
//! Drives the full engine (store, queue, state machine, tick loop, admission) with a
//! manual clock and fake collaborators. The tick loop's own wakes are disabled so
//! every tick is issued by the test.
//!
//! Run: cargo nextest run --test engine_tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use tabq::admission::{Priority, SlotRequest, TaskKind};
use tabq::{
    AdmissionError, Clock, Disposition, Engine, EngineConfig, ErrorCode, ExecutionDelegate, Job,
    JobError, JobId, JobProgress, JobStatus, KeyValueStore, ManualClock, MemoryStore,
    RuntimeStatus, StepReason, StoreFactory, TenantId, TenantLiveness, Timestamp,
};

const T0: Timestamp = 1_700_000_000_000;

#[derive(Default)]
struct RecordingDelegate {
    executed: Mutex<Vec<(JobId, Option<String>)>>,
}

impl RecordingDelegate {
    fn executed(&self) -> Vec<(JobId, Option<String>)> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ExecutionDelegate for RecordingDelegate {
    async fn execute(&self, job: &Job) {
        self.executed
            .lock()
            .unwrap()
            .push((job.id.clone(), job.runtime.lease.op_id.clone()));
    }
}

#[derive(Default)]
struct ClosableTabs {
    closed: Mutex<HashSet<TenantId>>,
    hold_next: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl ClosableTabs {
    fn close(&self, tenant: &str) {
        self.closed.lock().unwrap().insert(TenantId::new(tenant));
    }

    /// Blocks the next liveness check until `release` is notified.
    fn hold_next_check(&self) {
        self.hold_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl TenantLiveness for ClosableTabs {
    async fn is_reachable(&self, tenant_id: &TenantId) -> bool {
        if self.hold_next.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        !self.closed.lock().unwrap().contains(tenant_id)
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<dyn KeyValueStore>,
    delegate: Arc<RecordingDelegate>,
    tabs: Arc<ClosableTabs>,
    engine: Engine,
}

impl Harness {
    fn new(config: EngineConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()), ManualClock::shared(T0))
    }

    fn with_store(config: EngineConfig, store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> Self {
        let delegate = Arc::new(RecordingDelegate::default());
        let tabs = Arc::new(ClosableTabs::default());
        let engine = Engine::builder()
            .config(config)
            .store(store.clone())
            .clock(clock.clone())
            .delegate(delegate.clone())
            .liveness(tabs.clone())
            .build()
            .unwrap();
        // Ticks are issued by the tests only.
        engine.scheduler().shutdown();
        Self {
            clock,
            store,
            delegate,
            tabs,
            engine,
        }
    }

    async fn submit(&self, id: &str, tenant: &str) {
        let job = Job::new(id, tenant, self.clock.now_ms());
        self.engine.submit(job).await.unwrap();
    }

    async fn job(&self, id: &str) -> Job {
        self.engine.job(&JobId::new(id)).await.unwrap().unwrap()
    }

    async fn tick(&self) -> Vec<(String, Disposition)> {
        let report = self.engine.tick(StepReason::Manual).await;
        assert!(!report.skipped);
        report
            .outcomes
            .into_iter()
            .map(|(id, disposition)| (id.to_string(), disposition))
            .collect()
    }
}

fn ids(outcomes: &[(String, Disposition)]) -> Vec<&str> {
    outcomes.iter().map(|(id, _)| id.as_str()).collect()
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Fairness
// =============================================================================

#[tokio::test]
async fn test_tick_rotates_across_tenants() {
    let h = Harness::new(EngineConfig::default());
    h.submit("a1", "tab-a").await;
    h.clock.advance(1);
    h.submit("a2", "tab-a").await;
    h.clock.advance(1);
    h.submit("b1", "tab-b").await;
    h.clock.advance(10);

    let report = h.engine.tick(StepReason::Manual).await;
    let outcomes: Vec<&str> = report.outcomes.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(outcomes, vec!["a1", "b1", "a2"]);
    assert!(report
        .outcomes
        .iter()
        .all(|(_, d)| *d == Disposition::Requeued));
    // The next pick was a job already stepped this tick.
    assert!(report.more_work);
    h.engine.shutdown();
}

#[tokio::test]
async fn test_paused_tenants_are_skipped() {
    let h = Harness::new(EngineConfig::default());
    h.submit("a1", "tab-a").await;
    h.submit("b1", "tab-b").await;
    h.submit("b2", "tab-b").await;
    h.engine
        .set_active_tenant(Some(TenantId::new("tab-b")), true)
        .await;
    h.clock.advance(10);

    let outcomes = h.tick().await;
    let stepped = ids(&outcomes);
    assert_eq!(stepped.len(), 2);
    assert!(stepped.iter().all(|id| id.starts_with('b')));

    h.engine.set_active_tenant(None, false).await;
    h.clock.advance(10);
    assert!(ids(&h.tick().await).contains(&"a1"));
    h.engine.shutdown();
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_job_runs_and_completes() {
    let h = Harness::new(EngineConfig::default());
    h.submit("j1", "tab-a").await;

    assert_eq!(h.tick().await, vec![("j1".to_string(), Disposition::Requeued)]);
    let job = h.job("j1").await;
    assert_eq!(job.runtime.status, RuntimeStatus::Running);
    assert_eq!(job.runtime.lease.lease_until_ts, Some(T0 + 60_000));
    assert_eq!(job.runtime.lease.op_id.as_deref(), Some("j1:0"));

    settle().await;
    assert_eq!(
        h.delegate.executed(),
        vec![(JobId::new("j1"), Some("j1:0".to_string()))]
    );

    assert!(h.engine.complete(&JobId::new("j1")).await.unwrap());
    assert_eq!(
        h.tick().await,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Done
            }
        )]
    );
    let job = h.job("j1").await;
    assert_eq!(job.runtime.status, RuntimeStatus::Done);
    assert!(!job.runtime.lease.is_held());
    assert_eq!(h.engine.queue_stats().await.total, 0);
    assert_eq!(h.engine.metrics().jobs_completed, 1);
    h.engine.shutdown();
}

#[tokio::test]
async fn test_retry_hints_then_exhaustion() {
    let mut config = EngineConfig::default();
    config.job.max_attempts = 2;
    let h = Harness::new(config);
    let j1 = JobId::new("j1");
    h.submit("j1", "tab-a").await;
    h.tick().await;

    for attempt in 1..=2 {
        let fault = JobError::rate_limited(Some(5_000), h.clock.now_ms());
        assert!(h.engine.report_fault(&j1, fault).await.unwrap());

        let now = h.clock.now_ms();
        let report = h.engine.tick(StepReason::Manual).await;
        assert_eq!(
            report.outcomes,
            vec![(
                j1.clone(),
                Disposition::Waiting {
                    next_at_ts: now + 5_000
                }
            )]
        );
        assert_eq!(report.wake_in_ms, Some(5_000));
        assert_eq!(h.job("j1").await.runtime.retry.attempt, attempt);

        // Nothing is ready while the retry is pending.
        assert!(h.tick().await.is_empty());

        h.clock.advance(5_000);
        assert_eq!(h.tick().await, vec![("j1".to_string(), Disposition::Requeued)]);
        let job = h.job("j1").await;
        assert_eq!(job.runtime.status, RuntimeStatus::Running);
        assert_eq!(job.runtime.lease.op_id, Some(format!("j1:{attempt}")));
    }

    let fault = JobError::rate_limited(Some(5_000), h.clock.now_ms());
    h.engine.report_fault(&j1, fault).await.unwrap();
    assert_eq!(
        h.tick().await,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Failed
            }
        )]
    );

    let job = h.job("j1").await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.message.as_deref(),
        Some("RATE_LIMITED: upstream rate limit")
    );
    let metrics = h.engine.metrics();
    assert_eq!(metrics.retries_scheduled, 2);
    assert_eq!(metrics.jobs_failed, 1);
    h.engine.shutdown();
}

#[tokio::test]
async fn test_watchdog_recovers_stalled_job() {
    let h = Harness::new(EngineConfig::default());
    h.submit("stalled", "tab-a").await;
    h.submit("busy", "tab-b").await;
    h.tick().await;

    for i in 1..=4u64 {
        h.clock.advance(30_000);
        h.engine
            .report_progress(
                &JobId::new("busy"),
                JobProgress {
                    completed: i,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let outcomes = h.tick().await;
        assert!(outcomes.iter().all(|(_, d)| *d == Disposition::Requeued));
    }

    h.clock.advance(30_000);
    let outcomes = h.tick().await;
    let stalled = outcomes.iter().find(|(id, _)| id == "stalled").unwrap();
    assert!(matches!(stalled.1, Disposition::Waiting { .. }));
    let busy = outcomes.iter().find(|(id, _)| id == "busy").unwrap();
    assert_eq!(busy.1, Disposition::Requeued);

    let job = h.job("stalled").await;
    assert_eq!(job.runtime.retry.attempt, 1);
    assert_eq!(
        job.runtime.retry.last_error.map(|e| e.code),
        Some(ErrorCode::NoProgressWatchdog)
    );
    h.engine.shutdown();
}

#[tokio::test]
async fn test_closed_tab_fails_job() {
    let h = Harness::new(EngineConfig::default());
    h.submit("j1", "tab-a").await;
    h.tabs.close("tab-a");

    assert_eq!(
        h.tick().await,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Failed
            }
        )]
    );
    let message = h.job("j1").await.message.unwrap();
    assert!(message.starts_with("TAB_GONE"));
    h.engine.shutdown();
}

#[tokio::test]
async fn test_awaiting_input_parks_until_input_arrives() {
    let h = Harness::new(EngineConfig::default());
    let mut job = Job::new("j1", "tab-a", T0);
    job.status = JobStatus::AwaitingInput;
    h.engine.submit(job).await.unwrap();

    assert_eq!(
        h.tick().await,
        vec![("j1".to_string(), Disposition::AwaitingInput)]
    );
    assert_eq!(h.engine.queue_stats().await.waiting, 1);

    h.clock.advance(3_600_000);
    assert!(h.tick().await.is_empty());

    assert!(h.engine.input_arrived(&JobId::new("j1")).await.unwrap());
    assert_eq!(h.tick().await, vec![("j1".to_string(), Disposition::Requeued)]);
    let job = h.job("j1").await;
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.runtime.status, RuntimeStatus::Running);
    h.engine.shutdown();
}

#[tokio::test]
async fn test_cancel_drops_job_everywhere() {
    let mut config = EngineConfig::default();
    config.admission.requests_per_window = 1;
    let h = Harness::new(config);
    let j1 = JobId::new("j1");
    h.submit("j1", "tab-a").await;
    h.tick().await;

    let admission = h.engine.admission();
    admission
        .reserve_slot(SlotRequest::new(TaskKind::Translate, Priority::High))
        .await
        .unwrap();

    let pending = admission.reserve_slot(SlotRequest::new(TaskKind::Translate, Priority::High).job("j1"));
    let cancel = async {
        assert_eq!(admission.get_availability().high_pending, 1);
        assert!(h.engine.cancel(&j1, "closed by user").await.unwrap());
    };
    let (slot, ()) = tokio::join!(pending, cancel);
    assert_eq!(slot, Err(AdmissionError::Cancelled { job_id: j1.clone() }));

    let job = h.job("j1").await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.runtime.status, RuntimeStatus::Cancelled);
    assert!(job.message.unwrap().starts_with("CANCELLED"));
    assert_eq!(h.engine.queue_stats().await.total, 0);
    assert!(h.tick().await.is_empty());

    assert!(!h.engine.cancel(&JobId::new("ghost"), "n/a").await.unwrap());
    h.engine.shutdown();
}

#[tokio::test]
async fn test_failed_job_drops_pending_slot_requests() {
    let mut config = EngineConfig::default();
    config.admission.requests_per_window = 1;
    let h = Harness::new(config);
    let j1 = JobId::new("j1");
    h.submit("j1", "tab-a").await;
    h.tick().await;

    let admission = h.engine.admission();
    admission
        .reserve_slot(SlotRequest::new(TaskKind::Translate, Priority::High))
        .await
        .unwrap();

    let pending = admission.reserve_slot(SlotRequest::new(TaskKind::Translate, Priority::High).job("j1"));
    let fail = async {
        assert_eq!(admission.get_availability().high_pending, 1);
        h.tabs.close("tab-a");
        h.tick().await
    };
    let (slot, outcomes) = tokio::join!(pending, fail);
    assert_eq!(
        outcomes,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Failed
            }
        )]
    );
    assert_eq!(slot, Err(AdmissionError::Cancelled { job_id: j1.clone() }));
    assert_eq!(admission.get_availability().high_pending, 0);
    assert_eq!(h.job("j1").await.status, JobStatus::Failed);
    h.engine.shutdown();
}

// =============================================================================
// Host events during a step
// =============================================================================

#[tokio::test]
async fn test_completion_during_step_is_kept() {
    let h = Harness::new(EngineConfig::default());
    let j1 = JobId::new("j1");
    h.submit("j1", "tab-a").await;
    h.tabs.hold_next_check();

    let complete = async {
        h.tabs.entered.notified().await;
        assert!(h.engine.complete(&j1).await.unwrap());
        h.tabs.release.notify_one();
    };
    let (outcomes, ()) = tokio::join!(h.tick(), complete);
    assert_eq!(
        outcomes,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Done
            }
        )]
    );

    let job = h.job("j1").await;
    assert_eq!(job.status, JobStatus::Done);
    assert!(!job.runtime.lease.is_held());
    assert_eq!(h.engine.queue_stats().await.total, 0);
    settle().await;
    assert!(h.delegate.executed().is_empty());
    h.engine.shutdown();
}

#[tokio::test]
async fn test_cancel_during_step_is_kept() {
    let h = Harness::new(EngineConfig::default());
    let j1 = JobId::new("j1");
    h.submit("j1", "tab-a").await;
    h.tabs.hold_next_check();

    let cancel = async {
        h.tabs.entered.notified().await;
        assert!(h.engine.cancel(&j1, "closed by user").await.unwrap());
        h.tabs.release.notify_one();
    };
    let (outcomes, ()) = tokio::join!(h.tick(), cancel);
    assert_eq!(
        outcomes,
        vec![(
            "j1".to_string(),
            Disposition::Removed {
                status: JobStatus::Cancelled
            }
        )]
    );

    let job = h.job("j1").await;
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.runtime.status, RuntimeStatus::Cancelled);
    assert!(!job.runtime.lease.is_held());
    assert_eq!(h.engine.queue_stats().await.total, 0);
    assert!(h.tick().await.is_empty());
    h.engine.shutdown();
}

// =============================================================================
// Restart
// =============================================================================

#[tokio::test]
async fn test_restart_recovers_lapsed_lease() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreFactory::file(dir.path());
    let clock = ManualClock::shared(T0);

    let first = Harness::with_store(EngineConfig::default(), store.clone(), clock.clone());
    first.submit("j1", "tab-a").await;
    first.tick().await;
    // Crash between dequeue and disposition: the entry stays running.
    first
        .engine
        .queue()
        .mark_running(&JobId::new("j1"), T0 + 60_000)
        .await;
    first.engine.shutdown();
    drop(first);

    clock.advance(61_000);
    let second = Harness::with_store(EngineConfig::default(), store, clock.clone());
    let report = second.engine.recover_on_startup(None).await.unwrap();

    assert_eq!(report.processed, 1);
    let (job_id, disposition) = &report.outcomes[0];
    assert_eq!(job_id.as_str(), "j1");
    assert!(matches!(disposition, Disposition::Waiting { .. }));

    let job = second.job("j1").await;
    assert_eq!(job.runtime.retry.attempt, 1);
    assert_eq!(
        job.runtime.retry.last_error.map(|e| e.code),
        Some(ErrorCode::LeaseExpired)
    );
    assert!(!job.runtime.lease.is_held());
    second.engine.shutdown();
}

#[tokio::test]
async fn test_startup_sync_drops_orphans_and_requeues() {
    let h = Harness::new(EngineConfig::default());
    h.submit("j1", "tab-a").await;
    h.submit("j2", "tab-b").await;
    h.engine
        .cancel(&JobId::new("j2"), "gone")
        .await
        .unwrap();

    // A queue entry whose job record vanished.
    h.engine
        .queue()
        .enqueue(&JobId::new("ghost"), 0, "test", Some(&TenantId::new("tab-c")))
        .await;
    assert_eq!(h.engine.queue_stats().await.total, 2);

    let report = h.engine.recover_on_startup(None).await.unwrap();
    assert_eq!(
        report
            .outcomes
            .iter()
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>(),
        vec!["j1"]
    );
    assert_eq!(h.engine.queue_stats().await.total, 1);
    assert!(h.store.get("jobs").await.unwrap().is_some());
    h.engine.shutdown();
}
