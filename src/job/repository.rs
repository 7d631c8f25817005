//! Job persistence.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::ids::JobId;
use crate::store::{self, JOBS_KEY, KeyValueStore, StoreResult};

use super::Job;

/// Mutation applied to a stored job under the repository's write lock.
pub type JobUpdate = Box<dyn for<'j> FnOnce(&'j mut Job) + Send>;

/// Authoritative storage for job records.
#[async_trait::async_trait]
pub trait JobRepository: Send + Sync {
    async fn load(&self, id: &JobId) -> StoreResult<Option<Job>>;

    async fn save(&self, job: &Job) -> StoreResult<()>;

    async fn delete(&self, id: &JobId) -> StoreResult<bool>;

    async fn list(&self) -> StoreResult<Vec<Job>>;

    /// Applies `f` to the stored job under the repository's write lock.
    ///
    /// Delegates use this to report progress without clobbering a concurrent step.
    async fn update(
        &self,
        id: &JobId,
        f: JobUpdate,
    ) -> StoreResult<Option<Job>>;
}

/// All jobs kept as one document under [`JOBS_KEY`].
pub struct KvJobRepository {
    store: Arc<dyn KeyValueStore>,
    lock: Mutex<()>,
}

impl KvJobRepository {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> BTreeMap<JobId, Job> {
        normalize_jobs(store::read_or_default(self.store.as_ref(), JOBS_KEY).await)
    }

    async fn write_all(&self, jobs: &BTreeMap<JobId, Job>) -> StoreResult<()> {
        let value = serde_json::to_value(jobs)?;
        self.store.set(JOBS_KEY, value).await
    }
}

/// Parses the jobs document, dropping entries that do not deserialize or whose key
/// disagrees with the embedded id.
pub(crate) fn normalize_jobs(value: Value) -> BTreeMap<JobId, Job> {
    let Value::Object(map) = value else {
        return BTreeMap::new();
    };

    let mut jobs = BTreeMap::new();
    for (key, raw) in map {
        match serde_json::from_value::<Job>(raw) {
            Ok(job) if job.id.is_valid() && job.id.as_str() == key => {
                jobs.insert(job.id.clone(), job);
            }
            Ok(_) => tracing::warn!(key = %key, "Dropping job stored under mismatched key"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Dropping malformed job record"),
        }
    }
    jobs
}

#[async_trait::async_trait]
impl JobRepository for KvJobRepository {
    async fn load(&self, id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.read_all().await.remove(id))
    }

    async fn save(&self, job: &Job) -> StoreResult<()> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read_all().await;
        jobs.insert(job.id.clone(), job.clone());
        self.write_all(&jobs).await
    }

    async fn delete(&self, id: &JobId) -> StoreResult<bool> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read_all().await;
        let removed = jobs.remove(id).is_some();
        if removed {
            self.write_all(&jobs).await?;
        }
        Ok(removed)
    }

    async fn list(&self) -> StoreResult<Vec<Job>> {
        Ok(self.read_all().await.into_values().collect())
    }

    async fn update(
        &self,
        id: &JobId,
        f: JobUpdate,
    ) -> StoreResult<Option<Job>> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read_all().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        f(job);
        let updated = job.clone();
        self.write_all(&jobs).await?;
        Ok(Some(updated))
    }
}
