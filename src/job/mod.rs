//! Jobs, their recovery record, and the step state machine.

mod backoff;
mod delegate;
mod error;
mod machine;
mod repository;

pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use delegate::{
    AlwaysReachable, ExecutionDelegate, NoopCanceller, NoopDelegate, RequestCanceller,
    TenantLiveness,
};
pub use error::{ErrorCode, JobError};
pub use machine::{JobStateMachine, StepOutcome, StepReason};
pub use repository::{JobRepository, JobUpdate, KvJobRepository};

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::ids::{JobId, TenantId};

/// User-visible job status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Preparing,
    AwaitingInput,
    Running,
    Completing,
    Done,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

/// Recovery-facing status kept in the [`RuntimeRecord`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuntimeStatus {
    #[default]
    Idle,
    Queued,
    Running,
    Failed,
    Done,
    Cancelled,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Lease {
    pub lease_until_ts: Option<Timestamp>,
    pub heartbeat_ts: Option<Timestamp>,
    pub op: Option<String>,
    pub op_id: Option<String>,
}

impl Lease {
    pub fn is_held(&self) -> bool {
        self.lease_until_ts.is_some()
    }

    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.lease_until_ts.is_some_and(|until| until <= now)
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_retry_at_ts: Option<Timestamp>,
    pub first_attempt_ts: Option<Timestamp>,
    pub last_error: Option<JobError>,
}

impl Default for RetryState {
    fn default() -> Self {
        Self {
            attempt: 0,
            max_attempts: JobConfig::default().max_attempts,
            next_retry_at_ts: None,
            first_attempt_ts: None,
            last_error: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WatchdogState {
    pub last_progress_ts: Option<Timestamp>,
    pub last_progress_key: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeRecord {
    pub status: RuntimeStatus,
    pub stage: Option<String>,
    pub lease: Lease,
    pub retry: RetryState,
    pub watchdog: WatchdogState,
    /// Failure reported by the execution delegate, consumed by the next step.
    pub fault: Option<JobError>,
}

/// Observable counters the watchdog fingerprints.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobProgress {
    pub completed: u64,
    pub failed: u64,
    pub pending: u64,
    pub last_applied_seq: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub runtime: RuntimeRecord,
    #[serde(default)]
    pub progress: JobProgress,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_changed_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
    /// Opaque collaborator state (segments, plan, model choice).
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new(id: impl Into<JobId>, tenant_id: impl Into<TenantId>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            status: JobStatus::Preparing,
            priority: 0,
            runtime: RuntimeRecord::default(),
            progress: JobProgress::default(),
            message: None,
            status_changed_at: now,
            updated_at: now,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.status == JobStatus::AwaitingInput
    }

    pub fn set_status(&mut self, status: JobStatus, now: Timestamp) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = now;
        }
        self.updated_at = now;
    }

    /// Records progress from the execution delegate.
    pub fn report_progress(&mut self, progress: JobProgress, now: Timestamp) {
        self.progress = progress;
        self.updated_at = now;
    }

    /// Records a failure from the execution delegate; the next step routes it through
    /// recovery.
    pub fn report_fault(&mut self, error: JobError) {
        self.updated_at = error.at_ts;
        self.runtime.fault = Some(error);
    }

    /// Fingerprint of observable progress used by the watchdog.
    pub fn progress_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.progress.completed,
            self.progress.failed,
            self.progress.pending,
            self.progress
                .last_applied_seq
                .map(|s| s.to_string())
                .unwrap_or_default(),
            self.runtime.stage.as_deref().unwrap_or(""),
        )
    }

    /// Folds a step result computed from `base` into this stored record.
    ///
    /// A job the host finished after `base` was read stays as stored. Otherwise the
    /// step result wins, except for fields the host changed in the meantime.
    pub(crate) fn apply_step(&mut self, base: &Job, stepped: Job) {
        let host_status = self.status != base.status;
        if host_status && self.is_terminal() {
            return;
        }

        let mut merged = stepped;
        if host_status && !merged.is_terminal() {
            merged.status = self.status;
            merged.status_changed_at = self.status_changed_at;
        }
        if self.progress != base.progress {
            merged.progress = std::mem::take(&mut self.progress);
        }
        if self.runtime.fault != base.runtime.fault {
            merged.runtime.fault = self.runtime.fault.take();
        }
        if self.payload != base.payload {
            merged.payload = std::mem::take(&mut self.payload);
        }
        if self.priority != base.priority {
            merged.priority = self.priority;
        }
        merged.updated_at = merged.updated_at.max(self.updated_at);
        *self = merged;
    }

    /// Whether the queue should keep this job parked until a retry time.
    pub fn pending_retry_at(&self, now: Timestamp) -> Option<Timestamp> {
        self.runtime
            .retry
            .next_retry_at_ts
            .filter(|at| *at > now && !self.is_terminal())
    }
}

/// Tunables for the step state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub lease_ms: u64,
    pub max_attempts: u32,
    pub max_total_ms: u64,
    pub watchdog_no_progress_ms: u64,
    pub preparing_grace_ms: u64,
    pub retry_after_min_ms: u64,
    pub retry_after_max_ms: u64,
    /// Bounded number of tries when cancelling a job's in-flight requests.
    pub cancel_attempts: u32,
    pub backoff: BackoffConfig,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            lease_ms: 60_000,
            max_attempts: 4,
            max_total_ms: 20 * 60_000,
            watchdog_no_progress_ms: 2 * 60_000,
            preparing_grace_ms: 20_000,
            retry_after_min_ms: 250,
            retry_after_max_ms: 60_000,
            cancel_attempts: 3,
            backoff: BackoffConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Done.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::AwaitingInput.is_terminal());
    }

    #[test]
    fn test_progress_key_tracks_stage_and_counters() {
        let mut job = Job::new("j1", "t1", 0);
        let before = job.progress_key();
        job.runtime.stage = Some("translate".into());
        let staged = job.progress_key();
        assert_ne!(before, staged);

        job.report_progress(
            JobProgress {
                completed: 3,
                pending: 7,
                ..Default::default()
            },
            10,
        );
        assert_ne!(staged, job.progress_key());
    }

    #[test]
    fn test_job_deserializes_with_missing_fields() {
        let job: Job = serde_json::from_value(serde_json::json!({
            "id": "j1",
            "tenantId": "tab-1",
            "status": "running",
        }))
        .unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.runtime.retry.max_attempts, 4);
        assert_eq!(job.runtime.status, RuntimeStatus::Idle);
    }

    #[test]
    fn test_apply_step_keeps_host_updates() {
        let mut base = Job::new("j1", "t1", 0);
        base.set_status(JobStatus::Running, 0);

        let mut stepped = base.clone();
        stepped.runtime.status = RuntimeStatus::Running;
        stepped.runtime.lease.lease_until_ts = Some(60_000);
        stepped.updated_at = 10;

        let mut stored = base.clone();
        stored.report_progress(
            JobProgress {
                completed: 5,
                ..Default::default()
            },
            20,
        );
        stored.report_fault(JobError::new(ErrorCode::Network, "reset", 20));

        stored.apply_step(&base, stepped);
        assert_eq!(stored.runtime.lease.lease_until_ts, Some(60_000));
        assert_eq!(stored.progress.completed, 5);
        assert!(stored.runtime.fault.is_some());
        assert_eq!(stored.updated_at, 20);
    }

    #[test]
    fn test_apply_step_never_reopens_finished_job() {
        let mut base = Job::new("j1", "t1", 0);
        base.set_status(JobStatus::Running, 0);

        let mut stepped = base.clone();
        stepped.runtime.status = RuntimeStatus::Queued;
        stepped.runtime.retry.attempt = 1;

        let mut stored = base.clone();
        stored.set_status(JobStatus::Done, 5);
        stored.runtime.status = RuntimeStatus::Done;

        stored.apply_step(&base, stepped);
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.runtime.status, RuntimeStatus::Done);
        assert_eq!(stored.runtime.retry.attempt, 0);
    }

    #[test]
    fn test_lease_expiry() {
        let mut lease = Lease {
            lease_until_ts: Some(100),
            ..Default::default()
        };
        assert!(!lease.is_expired(99));
        assert!(lease.is_expired(100));
        lease.clear();
        assert!(!lease.is_held());
        assert!(!lease.is_expired(1_000));
    }
}
