//! Host-facing facade wiring every component over one store.

use std::sync::Arc;

use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::budget::BudgetStore;
use crate::clock::{Clock, system_clock};
use crate::config::EngineConfig;
use crate::ids::{JobId, TenantId};
use crate::job::{
    AlwaysReachable, ExecutionDelegate, Job, JobError, JobProgress, JobRepository, JobStateMachine,
    JobStatus, KvJobRepository, NoopCanceller, NoopDelegate, RequestCanceller, StepReason,
    TenantLiveness,
};
use crate::observability::{EngineMetrics, MetricsSummary};
use crate::queue::{FairJobQueue, QueueStats};
use crate::scheduler::{TickReport, TickScheduler};
use crate::store::{KeyValueStore, MemoryStore};
use crate::{Error, Result};

/// Builder for [`Engine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<Arc<dyn Clock>>,
    delegate: Option<Arc<dyn ExecutionDelegate>>,
    liveness: Option<Arc<dyn TenantLiveness>>,
    canceller: Option<Arc<dyn RequestCanceller>>,
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Durable store for jobs, queue and budget. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn ExecutionDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn liveness(mut self, liveness: Arc<dyn TenantLiveness>) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn canceller(mut self, canceller: Arc<dyn RequestCanceller>) -> Self {
        self.canceller = Some(canceller);
        self
    }

    /// Validates the configuration and wires the components.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let config = self.config;
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let clock = self.clock.unwrap_or_else(system_clock);
        let metrics = Arc::new(EngineMetrics::new());

        let repository: Arc<dyn JobRepository> = Arc::new(KvJobRepository::new(store.clone()));
        let queue = Arc::new(
            FairJobQueue::new(store.clone(), config.queue.clone())
                .with_clock(clock.clone())
                .with_metrics(metrics.clone()),
        );
        let budget = Arc::new(
            BudgetStore::new(store, config.budget.clone())
                .with_clock(clock.clone())
                .with_metrics(metrics.clone()),
        );
        let admission = AdmissionController::new(
            config.admission.clone(),
            clock.clone(),
            Some(budget.clone()),
            metrics.clone(),
        );
        let canceller = Arc::new(SlotCanceller {
            admission: admission.clone(),
            inner: self.canceller.unwrap_or_else(|| Arc::new(NoopCanceller)),
        });
        let machine = Arc::new(
            JobStateMachine::new(config.job.clone(), repository.clone())
                .with_clock(clock.clone())
                .with_delegate(self.delegate.unwrap_or_else(|| Arc::new(NoopDelegate)))
                .with_liveness(self.liveness.unwrap_or_else(|| Arc::new(AlwaysReachable)))
                .with_canceller(canceller)
                .with_metrics(metrics.clone()),
        );
        let scheduler = TickScheduler::new(
            config.scheduler.clone(),
            queue.clone(),
            machine.clone(),
            clock.clone(),
            metrics.clone(),
        );

        Ok(Engine {
            config,
            clock,
            metrics,
            repository,
            queue,
            machine,
            scheduler,
            admission,
            budget,
        })
    }
}

/// Drops a job's parked admission waiters before cancelling its upstream requests.
struct SlotCanceller {
    admission: Arc<AdmissionController>,
    inner: Arc<dyn RequestCanceller>,
}

#[async_trait::async_trait]
impl RequestCanceller for SlotCanceller {
    async fn cancel_job_requests(&self, job_id: &JobId) -> std::result::Result<usize, String> {
        let slots = self.admission.cancel_job(job_id).await;
        let requests = self.inner.cancel_job_requests(job_id).await?;
        Ok(slots + requests)
    }
}

/// The background job engine.
///
/// Submissions and host events go through here; the tick loop does the rest.
pub struct Engine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    metrics: Arc<EngineMetrics>,
    repository: Arc<dyn JobRepository>,
    queue: Arc<FairJobQueue>,
    machine: Arc<JobStateMachine>,
    scheduler: Arc<TickScheduler>,
    admission: Arc<AdmissionController>,
    budget: Arc<BudgetStore>,
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<FairJobQueue> {
        &self.queue
    }

    pub fn machine(&self) -> &Arc<JobStateMachine> {
        &self.machine
    }

    pub fn scheduler(&self) -> &Arc<TickScheduler> {
        &self.scheduler
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn budget(&self) -> &Arc<BudgetStore> {
        &self.budget
    }

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// Persists a new job and queues it for the next tick.
    pub async fn submit(&self, job: Job) -> Result<()> {
        if !job.id.is_valid() || !job.tenant_id.is_valid() {
            return Err(Error::InvalidJob(format!(
                "job '{}' needs a non-empty id and tenant",
                job.id
            )));
        }
        if job.is_terminal() {
            return Err(Error::InvalidJob(format!(
                "job '{}' is already {:?}",
                job.id, job.status
            )));
        }

        self.repository.save(&job).await?;
        self.queue
            .enqueue(&job.id, job.priority, "submit", Some(&job.tenant_id))
            .await;
        info!(job_id = %job.id, tenant_id = %job.tenant_id, "Job submitted");
        self.scheduler.request_tick(StepReason::Enqueue);
        Ok(())
    }

    pub async fn job(&self, job_id: &JobId) -> Result<Option<Job>> {
        Ok(self.repository.load(job_id).await?)
    }

    /// Cancels a job and drops its queue entry and pending slot requests.
    /// Returns `false` for unknown jobs.
    pub async fn cancel(&self, job_id: &JobId, reason: &str) -> Result<bool> {
        let Some(mut job) = self.repository.load(job_id).await? else {
            return Ok(false);
        };
        self.machine.cancel(&mut job, reason).await;
        self.queue.mark_done(job_id).await;
        // Already-finished jobs skip the machine's cancellation.
        self.admission.cancel_job(job_id).await;
        Ok(true)
    }

    /// Resumes a job parked on user input.
    pub async fn input_arrived(&self, job_id: &JobId) -> Result<bool> {
        let now = self.clock.now_ms();
        let updated = self
            .repository
            .update(
                job_id,
                Box::new(move |job: &mut Job| {
                    if job.is_awaiting_input() {
                        job.set_status(JobStatus::Running, now);
                    }
                }),
            )
            .await?;
        let Some(job) = updated else {
            return Ok(false);
        };
        if job.is_terminal() {
            debug!(job_id = %job_id, status = ?job.status, "Input for finished job ignored");
            return Ok(false);
        }
        self.queue
            .enqueue(&job.id, job.priority, "input_arrived", Some(&job.tenant_id))
            .await;
        self.scheduler.request_tick(StepReason::InputArrived);
        Ok(true)
    }

    /// Records delegate progress; the watchdog sees it on the next step.
    pub async fn report_progress(&self, job_id: &JobId, progress: JobProgress) -> Result<bool> {
        let now = self.clock.now_ms();
        let updated = self
            .repository
            .update(
                job_id,
                Box::new(move |job: &mut Job| job.report_progress(progress, now)),
            )
            .await?;
        Ok(updated.is_some())
    }

    /// Records a delegate failure and asks for a tick so recovery runs promptly.
    pub async fn report_fault(&self, job_id: &JobId, error: JobError) -> Result<bool> {
        let updated = self
            .repository
            .update(job_id, Box::new(move |job: &mut Job| job.report_fault(error)))
            .await?;
        if let Some(job) = &updated {
            self.queue
                .enqueue(&job.id, job.priority, "fault", Some(&job.tenant_id))
                .await;
            self.scheduler.request_tick(StepReason::Manual);
        }
        Ok(updated.is_some())
    }

    /// Marks a job done; the next tick releases its lease and queue entry.
    pub async fn complete(&self, job_id: &JobId) -> Result<bool> {
        let now = self.clock.now_ms();
        let updated = self
            .repository
            .update(
                job_id,
                Box::new(move |job: &mut Job| {
                    if !job.is_terminal() {
                        job.set_status(JobStatus::Done, now);
                    }
                }),
            )
            .await?;
        if let Some(job) = &updated {
            self.queue
                .enqueue(&job.id, job.priority, "complete", Some(&job.tenant_id))
                .await;
            self.scheduler.request_tick(StepReason::Manual);
        }
        Ok(updated.is_some())
    }

    /// Focuses a tenant; with `pause_others` only its jobs are dequeued.
    pub async fn set_active_tenant(&self, tenant_id: Option<TenantId>, pause_others: bool) {
        self.queue.set_active_tenant(tenant_id, pause_others).await;
        self.scheduler.request_tick(StepReason::Manual);
    }

    /// Reconciles the queue with the persisted jobs and runs a first tick.
    ///
    /// Leases left behind by a previous process expire on their own and are
    /// recovered by the steps this tick performs. `None` keeps the persisted
    /// active tenant.
    pub async fn recover_on_startup(&self, active_tenant_id: Option<&TenantId>) -> Result<TickReport> {
        let jobs = self.repository.list().await?;
        self.queue.sync_from_jobs(&jobs, active_tenant_id).await;
        info!(jobs = jobs.len(), "Recovered job queue");
        Ok(self.scheduler.tick(StepReason::Startup).await)
    }

    pub async fn tick(&self, reason: StepReason) -> TickReport {
        self.scheduler.tick(reason).await
    }

    pub async fn queue_stats(&self) -> QueueStats {
        self.queue.stats().await
    }

    /// Starts the periodic backstop.
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        self.admission.shutdown();
        info!("Engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigError;

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.admission.window_ms = 0;
        let result = Engine::builder().config(config).build();
        assert!(matches!(
            result,
            Err(Error::Config(ConfigError::ValidationErrors(_)))
        ));
    }

    #[tokio::test]
    async fn test_submit_rejects_blank_tenant() {
        let engine = Engine::builder().build().unwrap();
        let err = engine.submit(Job::new("j1", " ", 0)).await.unwrap_err();
        assert!(matches!(err, Error::InvalidJob(_)));
        assert!(engine.job(&JobId::new("j1")).await.unwrap().is_none());
        engine.shutdown();
    }
}
