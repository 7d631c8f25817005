//! Bounded, single-flight tick loop over the fair queue.
//!
//! A tick dequeues up to `max_jobs_per_tick` jobs, steps each one through the
//! [`JobStateMachine`] and re-derives its queue disposition from the job it stepped.
//! Ticks are triggered by enqueues, by a coalesced wake timer and by a periodic
//! backstop; at most one runs at a time.

mod wake;

pub use wake::WakeTimer;

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::clock::{Clock, FAR_FUTURE, Timestamp};
use crate::ids::JobId;
use crate::job::{ErrorCode, Job, JobError, JobStateMachine, JobStatus, StepReason};
use crate::observability::{EngineMetrics, tick_span};
use crate::queue::FairJobQueue;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_jobs_per_tick: usize,
    /// Wall-clock ceiling for one tick.
    pub max_ms_per_tick: u64,
    pub max_wake_delay_ms: u64,
    /// Delay before the next tick when a tick stopped with work left.
    pub continue_delay_ms: u64,
    pub periodic_interval_ms: u64,
    /// Backoff applied to a job whose step panicked.
    pub step_error_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_tick: 8,
            max_ms_per_tick: 250,
            max_wake_delay_ms: 30_000,
            continue_delay_ms: 1_000,
            periodic_interval_ms: 60_000,
            step_error_delay_ms: 5_000,
        }
    }
}

/// Queue disposition chosen for a stepped job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Terminal; removed from the queue.
    Removed { status: JobStatus },
    /// Parked until external input arrives.
    AwaitingInput,
    /// Waiting for a retry time.
    Waiting { next_at_ts: Timestamp },
    /// Re-enqueued for the next round.
    Requeued,
    /// Queue entry without a job record; removed.
    Orphaned,
    /// The step panicked or the job could not be loaded.
    StepFailed { next_at_ts: Timestamp },
}

impl Disposition {
    fn next_at_ts(&self) -> Option<Timestamp> {
        match self {
            Self::Waiting { next_at_ts } | Self::StepFailed { next_at_ts } => Some(*next_at_ts),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub reason: StepReason,
    /// Another tick was in flight; nothing ran.
    pub skipped: bool,
    pub processed: usize,
    pub outcomes: Vec<(JobId, Disposition)>,
    /// The tick stopped on a limit with ready work left.
    pub more_work: bool,
    /// Earliest known time parked work becomes ready.
    pub next_ready_at_ts: Option<Timestamp>,
    /// Delay of the wake requested at the end of the tick.
    pub wake_in_ms: Option<u64>,
}

impl TickReport {
    fn new(reason: StepReason) -> Self {
        Self {
            reason,
            ..Default::default()
        }
    }
}

/// Releases the single-flight flag when dropped, including on unwind.
pub(crate) struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct TickScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<FairJobQueue>,
    machine: Arc<JobStateMachine>,
    metrics: Arc<EngineMetrics>,
    in_flight: AtomicBool,
    rerun: AtomicBool,
    wake: WakeTimer,
    shutdown: CancellationToken,
    periodic: Mutex<Option<JoinHandle<()>>>,
    this: Weak<TickScheduler>,
}

impl TickScheduler {
    pub fn new(
        config: SchedulerConfig,
        queue: Arc<FairJobQueue>,
        machine: Arc<JobStateMachine>,
        clock: Arc<dyn Clock>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            clock,
            queue,
            machine,
            metrics,
            in_flight: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
            wake: WakeTimer::new(),
            shutdown: CancellationToken::new(),
            periodic: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_ticking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Deadline of the pending wake, if one is armed.
    pub fn next_wake(&self) -> Option<Instant> {
        self.wake.deadline()
    }

    /// Spawns the periodic backstop. The first tick runs immediately.
    pub fn start(&self) {
        let mut periodic = self.periodic.lock().unwrap_or_else(|e| e.into_inner());
        if periodic.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let this = self.this.clone();
        let token = self.shutdown.clone();
        let period = Duration::from_millis(self.config.periodic_interval_ms.max(1));
        *periodic = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut reason = StepReason::Startup;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let Some(scheduler) = this.upgrade() else { break };
                        scheduler.tick(reason).await;
                        reason = StepReason::Periodic;
                    }
                }
            }
            debug!("Periodic tick loop stopped");
        }));
    }

    /// Stops the periodic loop and disarms pending wakes. Later ticks still run when
    /// called directly but no longer schedule follow-ups.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.wake.cancel();
        let periodic = self
            .periodic
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = periodic {
            handle.abort();
        }
    }

    /// Asks for a tick as soon as possible.
    pub fn request_tick(&self, reason: StepReason) {
        debug!(%reason, "Tick requested");
        self.arm_wake(0);
    }

    /// Runs one bounded pass over the queue. A call made while another tick is in
    /// flight returns a skipped report; the running tick then schedules a rerun.
    pub async fn tick(&self, reason: StepReason) -> TickReport {
        let Some(_guard) = FlightGuard::acquire(&self.in_flight) else {
            self.metrics.ticks_skipped.inc();
            self.rerun.store(true, Ordering::Release);
            debug!(%reason, "Tick already in flight");
            return TickReport {
                skipped: true,
                ..TickReport::new(reason)
            };
        };
        self.metrics.ticks.inc();

        let span = tick_span(reason.as_str());
        let report = self.run(reason).instrument(span.clone()).await;
        span.record("processed", report.processed);
        report
    }

    async fn run(&self, reason: StepReason) -> TickReport {
        let started = Instant::now();
        let ceiling = Duration::from_millis(self.config.max_ms_per_tick);
        let lease_ms = self.machine.config().lease_ms as i64;
        let mut report = TickReport::new(reason);
        let mut stepped: HashSet<JobId> = HashSet::new();
        let mut next_ready: Option<Timestamp> = None;

        loop {
            if report.processed >= self.config.max_jobs_per_tick || started.elapsed() >= ceiling {
                report.more_work = true;
                break;
            }

            let now = self.clock.now_ms();
            let dequeued = self.queue.dequeue_next(now, None).await;
            let Some(job_id) = dequeued.job_id else {
                next_ready = earliest(next_ready, dequeued.next_at_ts);
                break;
            };
            if !stepped.insert(job_id.clone()) {
                // Each job is stepped at most once per tick.
                report.more_work = true;
                break;
            }

            self.queue.mark_running(&job_id, now + lease_ms).await;
            let disposition = self.process(&job_id, reason, now).await;
            next_ready = earliest(next_ready, disposition.next_at_ts());
            report.outcomes.push((job_id, disposition));
            report.processed += 1;
        }

        if self.rerun.swap(false, Ordering::AcqRel) {
            report.more_work = true;
        }
        report.next_ready_at_ts = next_ready;

        let now = self.clock.now_ms();
        let wait_ms = if report.more_work {
            Some(self.config.continue_delay_ms)
        } else {
            next_ready.map(|at| (at - now).max(0) as u64)
        };
        if let Some(wait_ms) = wait_ms {
            let wait_ms = wait_ms.min(self.config.max_wake_delay_ms);
            self.arm_wake(wait_ms);
            report.wake_in_ms = Some(wait_ms);
        }

        debug!(
            processed = report.processed,
            more_work = report.more_work,
            wake_in_ms = ?report.wake_in_ms,
            "Tick finished"
        );
        report
    }

    async fn process(&self, job_id: &JobId, reason: StepReason, now: Timestamp) -> Disposition {
        let repository = self.machine.repository();
        let mut job = match repository.load(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id = %job_id, "Queue entry has no job record, dropping");
                self.queue.mark_done(job_id).await;
                return Disposition::Orphaned;
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load job");
                return self.park_failed(job_id, now).await;
            }
        };

        let stepped = AssertUnwindSafe(self.machine.step(&mut job, reason))
            .catch_unwind()
            .await;
        if stepped.is_err() {
            self.metrics.step_errors.inc();
            warn!(job_id = %job_id, "Job step panicked");
            // The next step routes this through recovery and consumes an attempt.
            let fault = JobError::new(ErrorCode::StepFailed, "step panicked", now);
            let recorded = repository
                .update(job_id, Box::new(move |job: &mut Job| job.report_fault(fault)))
                .await;
            if let Err(e) = recorded {
                warn!(job_id = %job_id, error = %e, "Failed to record step fault");
            }
            return self.park_failed(job_id, now).await;
        }

        // The delegate may have moved the job on since the step persisted it.
        let job = match repository.load(job_id).await {
            Ok(Some(latest)) => latest,
            _ => job,
        };
        self.dispose(&job, now).await
    }

    async fn dispose(&self, job: &Job, now: Timestamp) -> Disposition {
        if job.is_terminal() {
            self.queue.mark_done(&job.id).await;
            if job.status == JobStatus::Done {
                self.metrics.jobs_completed.inc();
            }
            return Disposition::Removed { status: job.status };
        }
        if job.is_awaiting_input() {
            self.queue.mark_waiting(&job.id, FAR_FUTURE).await;
            return Disposition::AwaitingInput;
        }
        if let Some(next_at_ts) = job.pending_retry_at(now) {
            self.queue.mark_waiting(&job.id, next_at_ts).await;
            return Disposition::Waiting { next_at_ts };
        }
        self.queue
            .enqueue(&job.id, job.priority, "continue", Some(&job.tenant_id))
            .await;
        Disposition::Requeued
    }

    async fn park_failed(&self, job_id: &JobId, now: Timestamp) -> Disposition {
        let next_at_ts = now + self.config.step_error_delay_ms as i64;
        self.queue.mark_waiting(job_id, next_at_ts).await;
        Disposition::StepFailed { next_at_ts }
    }

    fn arm_wake(&self, delay_ms: u64) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let this = self.this.clone();
        self.wake
            .arm(Duration::from_millis(delay_ms), move || async move {
                if let Some(scheduler) = this.upgrade() {
                    scheduler.tick(StepReason::Wake).await;
                }
            });
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.wake.cancel();
    }
}

fn earliest(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}
