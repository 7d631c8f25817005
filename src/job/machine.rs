//! The per-job step state machine.
//!
//! Runtime states: `IDLE -> QUEUED -> RUNNING -> {RUNNING, QUEUED, terminal}`. `IDLE`
//! also covers jobs parked on external input. Mutual exclusion across restarts comes
//! from the persisted lease: a RUNNING job whose lease has passed is treated as
//! abandoned and routed through recovery.

use std::sync::Arc;

use tracing::{Instrument, debug, info, warn};

use crate::clock::{Clock, Timestamp, system_clock};
use crate::ids::JobId;
use crate::observability::{EngineMetrics, step_span};

use super::{
    AlwaysReachable, ErrorCode, ExecutionDelegate, ExponentialBackoff, Job, JobConfig, JobError,
    JobRepository, JobStatus, NoopCanceller, NoopDelegate, RequestCanceller, RuntimeStatus,
    TenantLiveness,
};

/// What triggered a tick or step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StepReason {
    #[default]
    Manual,
    Wake,
    Periodic,
    Enqueue,
    InputArrived,
    Startup,
}

impl StepReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Wake => "wake",
            Self::Periodic => "periodic",
            Self::Enqueue => "enqueue",
            Self::InputArrived => "input_arrived",
            Self::Startup => "startup",
        }
    }
}

impl std::fmt::Display for StepReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Job is done, failed or cancelled; never re-enqueue.
    Terminal { status: JobStatus },
    /// Parked until external input arrives; do not retry.
    AwaitingInput,
    /// Still inside a previously scheduled backoff window.
    Backoff { next_retry_at_ts: Timestamp },
    /// Recovery scheduled a new attempt.
    RetryScheduled {
        attempt: u32,
        next_retry_at_ts: Timestamp,
    },
    /// Lease acquired or renewed; the delegate was handed the job.
    Running { lease_until_ts: Timestamp },
}

impl StepOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }

    pub fn requeued(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. })
    }

    pub fn has_more_work(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. } | Self::Running { .. })
    }
}

pub struct JobStateMachine {
    config: JobConfig,
    backoff: ExponentialBackoff,
    clock: Arc<dyn Clock>,
    repository: Arc<dyn JobRepository>,
    delegate: Arc<dyn ExecutionDelegate>,
    liveness: Arc<dyn TenantLiveness>,
    canceller: Arc<dyn RequestCanceller>,
    metrics: Arc<EngineMetrics>,
}

impl JobStateMachine {
    pub fn new(config: JobConfig, repository: Arc<dyn JobRepository>) -> Self {
        let backoff = ExponentialBackoff::new(&config.backoff);
        Self {
            config,
            backoff,
            clock: system_clock(),
            repository,
            delegate: Arc::new(NoopDelegate),
            liveness: Arc::new(AlwaysReachable),
            canceller: Arc::new(NoopCanceller),
            metrics: Arc::new(EngineMetrics::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        self.delegate = delegate;
        self
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn TenantLiveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_canceller(mut self, canceller: Arc<dyn RequestCanceller>) -> Self {
        self.canceller = canceller;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    /// Advances `job` by one bounded unit of work and persists the result.
    ///
    /// `job` should be the stored record. Host updates that land while the step runs
    /// are merged into the write, and a job the host finished meanwhile stays
    /// finished; `job` is left holding the stored result.
    pub async fn step(&self, job: &mut Job, reason: StepReason) -> StepOutcome {
        let span = step_span(&job.id, &job.tenant_id, reason.as_str());
        self.metrics.steps.inc();
        let base = job.clone();
        let outcome = self.step_inner(job, &base).instrument(span).await;
        if job.is_terminal() && !outcome.is_terminal() {
            debug!(job_id = %job.id, status = ?job.status, "Job finished by host during step");
            return StepOutcome::Terminal { status: job.status };
        }
        outcome
    }

    async fn step_inner(&self, job: &mut Job, base: &Job) -> StepOutcome {
        let now = self.clock.now_ms();

        if job.is_terminal() {
            job.runtime.status = terminal_runtime_status(job.status);
            job.runtime.lease.clear();
            job.runtime.retry.next_retry_at_ts = None;
            self.persist(job, base, now).await;
            return StepOutcome::Terminal { status: job.status };
        }

        if job.is_awaiting_input() {
            job.runtime.status = RuntimeStatus::Idle;
            job.runtime.lease.clear();
            job.runtime.retry.next_retry_at_ts = None;
            self.persist(job, base, now).await;
            return StepOutcome::AwaitingInput;
        }

        if let Some(error) = self.check_watchdog(job, now) {
            return self.recover(job, base, error, now).await;
        }

        if let Some(fault) = job.runtime.fault.take() {
            debug!(code = %fault.code, "Delegate reported a fault");
            return self.recover(job, base, fault, now).await;
        }

        if let Some(next_retry_at_ts) = job.runtime.retry.next_retry_at_ts.filter(|at| *at > now) {
            job.runtime.status = RuntimeStatus::Queued;
            job.runtime.lease.clear();
            self.persist(job, base, now).await;
            return StepOutcome::Backoff { next_retry_at_ts };
        }

        if job.runtime.status == RuntimeStatus::Running && job.runtime.lease.is_expired(now) {
            let error = JobError::new(
                ErrorCode::LeaseExpired,
                "execution lease expired without renewal",
                now,
            );
            return self.recover(job, base, error, now).await;
        }

        if !self.liveness.is_reachable(&job.tenant_id).await {
            let error = JobError::new(ErrorCode::TabGone, "owning tab is no longer reachable", now);
            return self.fail(job, base, error, now).await;
        }

        if job.status == JobStatus::Preparing
            && now - job.status_changed_at > self.config.preparing_grace_ms as i64
        {
            debug!("Job stuck preparing, sending reconnect nudge");
            if let Err(error) = self.delegate.reconnect(job).await {
                return self.recover(job, base, error, now).await;
            }
        }

        self.acquire_lease(job, base, now).await
    }

    /// Refreshes the progress fingerprint and reports a stall while RUNNING.
    fn check_watchdog(&self, job: &mut Job, now: Timestamp) -> Option<JobError> {
        let key = job.progress_key();
        let watchdog = &mut job.runtime.watchdog;

        let unchanged = watchdog.last_progress_key.as_deref() == Some(key.as_str());
        let Some(last_ts) = watchdog.last_progress_ts.filter(|_| unchanged) else {
            watchdog.last_progress_key = Some(key);
            watchdog.last_progress_ts = Some(now);
            return None;
        };

        let stalled_ms = now - last_ts;
        if job.runtime.status == RuntimeStatus::Running
            && stalled_ms > self.config.watchdog_no_progress_ms as i64
        {
            return Some(JobError::new(
                ErrorCode::NoProgressWatchdog,
                format!("no progress for {stalled_ms}ms"),
                now,
            ));
        }
        None
    }

    async fn acquire_lease(&self, job: &mut Job, base: &Job, now: Timestamp) -> StepOutcome {
        let runtime = &mut job.runtime;
        let fresh = runtime.status != RuntimeStatus::Running || !runtime.lease.is_held();

        if fresh {
            if runtime.retry.first_attempt_ts.is_none() {
                runtime.retry.first_attempt_ts = Some(now);
                runtime.retry.max_attempts = self.config.max_attempts;
            }
            runtime.lease.op_id = Some(format!("{}:{}", job.id, runtime.retry.attempt));
            // The clock restarts whenever work is (re)claimed.
            runtime.watchdog.last_progress_ts = Some(now);
        }

        let lease_until_ts = now + self.config.lease_ms as i64;
        runtime.status = RuntimeStatus::Running;
        runtime.retry.next_retry_at_ts = None;
        runtime.lease.lease_until_ts = Some(lease_until_ts);
        runtime.lease.heartbeat_ts = Some(now);
        runtime.lease.op = Some(
            runtime
                .stage
                .clone()
                .unwrap_or_else(|| "execute".to_string()),
        );

        self.persist(job, base, now).await;
        if job.is_terminal() {
            return StepOutcome::Terminal { status: job.status };
        }

        // Renewals only extend the lease; the delegate already owns this op.
        if fresh {
            debug!(op_id = ?job.runtime.lease.op_id, "Lease acquired");
            let delegate = Arc::clone(&self.delegate);
            let snapshot = job.clone();
            tokio::spawn(async move {
                delegate.execute(&snapshot).await;
            });
        }

        StepOutcome::Running { lease_until_ts }
    }

    /// Schedules a retry when the error and budget allow it, otherwise fails the job.
    async fn recover(
        &self,
        job: &mut Job,
        base: &Job,
        error: JobError,
        now: Timestamp,
    ) -> StepOutcome {
        let retry = &job.runtime.retry;
        let within_window = retry
            .first_attempt_ts
            .is_none_or(|first| now - first < self.config.max_total_ms as i64);
        let can_retry = error.is_retryable() && retry.attempt < retry.max_attempts && within_window;

        if !can_retry {
            let code = if error.is_retryable() {
                error.code.exhausted()
            } else {
                error.code.clone()
            };
            return self.fail(job, base, JobError { code, ..error }, now).await;
        }

        let retry = &mut job.runtime.retry;
        retry.attempt += 1;
        retry.first_attempt_ts.get_or_insert(now);

        let delay_ms = match error.retry_after_ms {
            Some(hint) => hint.clamp(
                self.config.retry_after_min_ms,
                self.config.retry_after_max_ms,
            ),
            None => self.backoff.delay_ms(retry.attempt),
        };
        let next_retry_at_ts = now + delay_ms as i64;
        let attempt = retry.attempt;
        let max_attempts = retry.max_attempts;
        retry.next_retry_at_ts = Some(next_retry_at_ts);
        retry.last_error = Some(error.clone());

        job.runtime.status = RuntimeStatus::Queued;
        job.runtime.lease.clear();
        job.runtime.watchdog.last_progress_ts = Some(now);
        if job.status == JobStatus::Completing {
            job.set_status(JobStatus::Running, now);
        }
        job.message = Some(format!(
            "{}: retrying (attempt {attempt}/{max_attempts})",
            error.code
        ));

        self.cancel_inflight(&job.id).await;
        self.persist(job, base, now).await;
        if job.is_terminal() {
            return StepOutcome::Terminal { status: job.status };
        }
        self.metrics.retries_scheduled.inc();
        info!(code = %error.code, attempt, delay_ms, "Retry scheduled");

        StepOutcome::RetryScheduled {
            attempt,
            next_retry_at_ts,
        }
    }

    async fn fail(&self, job: &mut Job, base: &Job, error: JobError, now: Timestamp) -> StepOutcome {
        job.set_status(JobStatus::Failed, now);
        job.runtime.status = RuntimeStatus::Failed;
        job.runtime.lease.clear();
        job.runtime.retry.next_retry_at_ts = None;
        job.message = Some(error.display_message());
        info!(code = %error.code, "Job failed");
        job.runtime.retry.last_error = Some(error);

        self.cancel_inflight(&job.id).await;
        self.persist(job, base, now).await;
        if job.status != JobStatus::Failed {
            return StepOutcome::Terminal { status: job.status };
        }
        self.metrics.jobs_failed.inc();

        StepOutcome::Terminal {
            status: JobStatus::Failed,
        }
    }

    /// Cancels a job: clears its lease, cancels in-flight requests and persists.
    pub async fn cancel(&self, job: &mut Job, reason: &str) -> StepOutcome {
        let now = self.clock.now_ms();
        if job.is_terminal() {
            return StepOutcome::Terminal { status: job.status };
        }
        let base = job.clone();

        job.set_status(JobStatus::Cancelled, now);
        job.runtime.status = RuntimeStatus::Cancelled;
        job.runtime.lease.clear();
        job.runtime.retry.next_retry_at_ts = None;
        job.runtime.fault = None;
        job.message = Some(JobError::new(ErrorCode::Cancelled, reason, now).display_message());

        self.cancel_inflight(&job.id).await;
        self.persist(job, &base, now).await;
        if job.status != JobStatus::Cancelled {
            return StepOutcome::Terminal { status: job.status };
        }
        self.metrics.jobs_cancelled.inc();
        info!(job_id = %job.id, reason, "Job cancelled");

        StepOutcome::Terminal {
            status: JobStatus::Cancelled,
        }
    }

    async fn cancel_inflight(&self, job_id: &JobId) {
        for attempt in 1..=self.config.cancel_attempts.max(1) {
            match self.canceller.cancel_job_requests(job_id).await {
                Ok(cancelled) => {
                    if cancelled > 0 {
                        debug!(job_id = %job_id, cancelled, "Cancelled in-flight requests");
                    }
                    return;
                }
                Err(e) => {
                    warn!(job_id = %job_id, attempt, error = %e, "Request cancellation failed");
                }
            }
        }
    }

    /// Writes the step result over the stored record, keeping host updates made
    /// since `base` was loaded, and leaves `job` holding what was stored.
    async fn persist(&self, job: &mut Job, base: &Job, now: Timestamp) {
        job.updated_at = now;
        let stepped = job.clone();
        let base = base.clone();
        let result = self
            .repository
            .update(
                &job.id,
                Box::new(move |stored: &mut Job| stored.apply_step(&base, stepped)),
            )
            .await;
        match result {
            Ok(Some(stored)) => *job = stored,
            Ok(None) => debug!(job_id = %job.id, "Job record gone, step result dropped"),
            Err(e) => warn!(job_id = %job.id, error = %e, "Failed to persist job"),
        }
    }
}

fn terminal_runtime_status(status: JobStatus) -> RuntimeStatus {
    match status {
        JobStatus::Done => RuntimeStatus::Done,
        JobStatus::Cancelled => RuntimeStatus::Cancelled,
        _ => RuntimeStatus::Failed,
    }
}
