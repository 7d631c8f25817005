//! Collaborator seams used by the step state machine.

use crate::ids::{JobId, TenantId};

use super::{Job, JobError};

/// Performs the actual work for a job.
///
/// `execute` is fire-and-forget: it must return quickly and report completion by
/// mutating the stored job (status, progress, fault) for a later step to observe.
/// It may be invoked again for the same `op_id` after a restart and must tolerate that.
#[async_trait::async_trait]
pub trait ExecutionDelegate: Send + Sync {
    async fn execute(&self, job: &Job);

    /// Lightweight nudge for a job stuck preparing (e.g. re-attach to its tab).
    async fn reconnect(&self, _job: &Job) -> Result<(), JobError> {
        Ok(())
    }
}

/// Tells whether the tab owning a job still exists.
#[async_trait::async_trait]
pub trait TenantLiveness: Send + Sync {
    async fn is_reachable(&self, tenant_id: &TenantId) -> bool;
}

/// Best-effort cancellation of upstream requests issued for a job.
#[async_trait::async_trait]
pub trait RequestCanceller: Send + Sync {
    /// Returns how many requests were cancelled.
    async fn cancel_job_requests(&self, job_id: &JobId) -> Result<usize, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopDelegate;

#[async_trait::async_trait]
impl ExecutionDelegate for NoopDelegate {
    async fn execute(&self, job: &Job) {
        tracing::debug!(job_id = %job.id, "No execution delegate configured");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReachable;

#[async_trait::async_trait]
impl TenantLiveness for AlwaysReachable {
    async fn is_reachable(&self, _tenant_id: &TenantId) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCanceller;

#[async_trait::async_trait]
impl RequestCanceller for NoopCanceller {
    async fn cancel_job_requests(&self, _job_id: &JobId) -> Result<usize, String> {
        Ok(0)
    }
}
