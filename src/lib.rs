//! # tabq
//!
//! Fair multi-tenant scheduling for long-running LLM jobs.
//!
//! Jobs from many tenants (browser tabs) share one upstream API with strict
//! per-minute quotas. `tabq` rotates fairly across tenants, drives every job through
//! a lease/retry/watchdog state machine, gates outbound calls with token buckets and
//! a durable reservation ledger, and recovers from a host restart at any point.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tabq::{Clock, Engine, Job, StoreFactory, SystemClock};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tabq::Error> {
//!     let engine = Engine::builder()
//!         .store(StoreFactory::file("./state"))
//!         .build()?;
//!
//!     engine.recover_on_startup(None).await?;
//!     engine.start();
//!
//!     engine
//!         .submit(Job::new("job-1", "tab-7", SystemClock.now_ms()))
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Admission
//!
//! ```rust,no_run
//! use tabq::admission::{Priority, SlotRequest, TaskKind, Usage};
//!
//! # async fn example(engine: &tabq::Engine) -> Result<(), tabq::Error> {
//! let permit = engine
//!     .admission()
//!     .reserve_slot(
//!         SlotRequest::new(TaskKind::Translate, Priority::High)
//!             .tokens(1_200)
//!             .job("job-1")
//!             .provider("anthropic", Some("claude-haiku".into())),
//!     )
//!     .await?;
//! // ... upstream call ...
//! engine.admission().release(permit, Usage::default()).await;
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod admission;
pub mod budget;
pub mod clock;
pub mod config;
pub mod engine;
pub mod ids;
pub mod job;
pub mod observability;
pub mod queue;
pub mod scheduler;
pub mod store;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionError, Availability, Priority, SlotPermit,
    SlotRequest, TaskKind, Usage,
};
pub use budget::{
    BudgetConfig, BudgetStore, Grant, ProviderBudget, QuotaWindow, RejectReason, ReleaseRequest,
    ReserveRequest, ReserveResult,
};
pub use clock::{Clock, FAR_FUTURE, ManualClock, SystemClock, Timestamp};
pub use config::{ConfigError, EngineConfig};
pub use engine::{Engine, EngineBuilder};
pub use ids::{GrantId, JobId, TenantId};
pub use job::{
    ErrorCode, ExecutionDelegate, Job, JobConfig, JobError, JobProgress, JobRepository,
    JobStateMachine, JobStatus, JobUpdate, RequestCanceller, RuntimeRecord, RuntimeStatus,
    StepOutcome, StepReason, TenantLiveness,
};
pub use observability::{EngineMetrics, MetricsSummary};
pub use queue::{Dequeued, FairJobQueue, QueueConfig, QueueStats};
pub use scheduler::{Disposition, SchedulerConfig, TickReport, TickScheduler};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError, StoreFactory};

/// Error type for tabq operations.
///
/// Background components absorb persistence failures and log them; only host-facing
/// calls on [`Engine`] surface errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Durable store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid or unreadable configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Slot reservation failed.
    #[error("Admission error: {0}")]
    Admission(#[from] AdmissionError),

    /// Submitted job is malformed or already finished.
    #[error("Invalid job: {0}")]
    InvalidJob(String),
}

impl Error {
    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store(StoreError::Io(_) | StoreError::Storage { .. }) => true,
            Error::Admission(AdmissionError::BenchmarkFrozen { .. }) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
