//! Fair multi-tenant job queue.
//!
//! Persistent weighted round-robin across tenants. Every operation loads the queue
//! document, normalizes it, mutates and saves it back, so stale or half-written
//! state from a previous process heals on the next access.

mod state;

pub use state::{EntryStatus, QueueEntry, QueueState, normalize};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::{Clock, FAR_FUTURE, Timestamp, system_clock};
use crate::ids::{JobId, TenantId};
use crate::job::Job;
use crate::observability::EngineMetrics;
use crate::store::{self, KeyValueStore, QUEUE_STATE_KEY};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Share of picks the active tenant gets relative to each other tenant.
    pub active_weight: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { active_weight: 2 }
    }
}

/// Result of [`FairJobQueue::dequeue_next`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Dequeued {
    pub job_id: Option<JobId>,
    pub tenant_id: Option<TenantId>,
    /// Earliest time a currently ineligible entry becomes ready, when nothing was
    /// handed out.
    pub next_at_ts: Option<Timestamp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    pub waiting: usize,
    pub running: usize,
    pub ready: usize,
    pub by_tenant: BTreeMap<TenantId, usize>,
}

pub struct FairJobQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
    metrics: Arc<EngineMetrics>,
    lock: Mutex<()>,
}

impl FairJobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, config: QueueConfig) -> Self {
        Self {
            store,
            clock: system_clock(),
            config,
            metrics: Arc::new(EngineMetrics::new()),
            lock: Mutex::new(()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn load(&self) -> QueueState {
        normalize(&store::read_or_default(self.store.as_ref(), QUEUE_STATE_KEY).await)
    }

    async fn save(&self, state: &QueueState) {
        self.metrics
            .queue_depth
            .set(state.entries_by_job_id.len() as i64);
        match serde_json::to_value(state) {
            Ok(value) => {
                store::write_logged(self.store.as_ref(), QUEUE_STATE_KEY, value).await;
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize queue state"),
        }
    }

    /// Normalized copy of the persisted state.
    pub async fn snapshot(&self) -> QueueState {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    /// Idempotent upsert: the entry becomes `queued` and immediately eligible.
    ///
    /// `tenant_id` may be omitted for jobs that already have an entry.
    pub async fn enqueue(
        &self,
        job_id: &JobId,
        priority: i32,
        reason: &str,
        tenant_id: Option<&TenantId>,
    ) -> bool {
        if !job_id.is_valid() {
            return false;
        }
        let now = self.clock.now_ms();

        let _guard = self.lock.lock().await;
        let mut state = self.load().await;

        let tenant = match (tenant_id.filter(|t| t.is_valid()), state.entries_by_job_id.get(job_id)) {
            (Some(tenant), _) => tenant.clone(),
            (None, Some(existing)) => existing.tenant_id.clone(),
            (None, None) => {
                debug!(job_id = %job_id, "Ignoring enqueue without tenant");
                return false;
            }
        };

        let entry = state
            .entries_by_job_id
            .entry(job_id.clone())
            .or_insert_with(|| QueueEntry::new(job_id.clone(), tenant.clone(), priority, now));
        entry.tenant_id = tenant;
        entry.priority = priority;
        entry.status = EntryStatus::Queued;
        entry.next_at_ts = 0;
        entry.lease_until_ts = None;
        entry.updated_at = now;

        debug!(job_id = %job_id, reason, "Enqueued");
        state.rebuild_order();
        self.save(&state).await;
        true
    }

    /// Hands out at most one ready job, fairly across tenants.
    pub async fn dequeue_next(&self, now: Timestamp, active_tenant_id: Option<&TenantId>) -> Dequeued {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;

        let active = active_tenant_id
            .cloned()
            .or_else(|| state.active_tenant_id.clone());
        let Some((job_id, tenant_id)) = select(&mut state, now, active.as_ref(), self.config.active_weight)
        else {
            return Dequeued {
                job_id: None,
                tenant_id: None,
                next_at_ts: state.earliest_ready_at(now),
            };
        };

        if let Some(entry) = state.entries_by_job_id.get_mut(&job_id) {
            entry.dequeued_count += 1;
            entry.last_dequeued_ts = Some(now);
        }
        self.save(&state).await;

        Dequeued {
            job_id: Some(job_id),
            tenant_id: Some(tenant_id),
            next_at_ts: None,
        }
    }

    pub async fn mark_running(&self, job_id: &JobId, lease_until_ts: Timestamp) -> bool {
        self.update_entry(job_id, |entry, now| {
            entry.status = EntryStatus::Running;
            entry.lease_until_ts = Some(lease_until_ts);
            entry.next_at_ts = 0;
            entry.updated_at = now;
        })
        .await
    }

    /// Parks an entry until `next_at_ts` ([`FAR_FUTURE`] for input waits).
    pub async fn mark_waiting(&self, job_id: &JobId, next_at_ts: Timestamp) -> bool {
        self.update_entry(job_id, |entry, now| {
            entry.status = EntryStatus::Waiting;
            entry.next_at_ts = next_at_ts;
            entry.lease_until_ts = None;
            entry.updated_at = now;
        })
        .await
    }

    /// Removes the entry; used for terminal jobs and cancellation.
    pub async fn mark_done(&self, job_id: &JobId) -> bool {
        if !job_id.is_valid() {
            return false;
        }
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;
        if state.entries_by_job_id.remove(job_id).is_none() {
            return false;
        }
        state.rebuild_order();
        self.save(&state).await;
        true
    }

    async fn update_entry(&self, job_id: &JobId, f: impl FnOnce(&mut QueueEntry, Timestamp)) -> bool {
        if !job_id.is_valid() {
            return false;
        }
        let now = self.clock.now_ms();
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;
        let Some(entry) = state.entries_by_job_id.get_mut(job_id) else {
            return false;
        };
        f(entry, now);
        self.save(&state).await;
        true
    }

    pub async fn set_active_tenant(&self, tenant_id: Option<TenantId>, pause_other_tenants: bool) {
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;
        let tenant_id = tenant_id.filter(TenantId::is_valid);
        if state.active_tenant_id != tenant_id {
            state.active_streak = 0;
        }
        state.active_tenant_id = tenant_id;
        state.pause_other_tenants = pause_other_tenants;
        self.save(&state).await;
    }

    /// Reconciles entries with the authoritative job records.
    ///
    /// Entries for unknown or terminal jobs are removed; input waits and scheduled
    /// retries are parked; everything else gets an entry. Running entries are left
    /// alone so their lease can lapse naturally.
    pub async fn sync_from_jobs(&self, jobs: &[Job], active_tenant_id: Option<&TenantId>) {
        let now = self.clock.now_ms();
        let _guard = self.lock.lock().await;
        let mut state = self.load().await;

        let known: HashSet<&JobId> = jobs.iter().map(|j| &j.id).collect();
        state.entries_by_job_id.retain(|id, _| known.contains(id));

        for job in jobs {
            if !job.id.is_valid() || !job.tenant_id.is_valid() {
                continue;
            }
            if job.is_terminal() {
                state.entries_by_job_id.remove(&job.id);
                continue;
            }

            let entry = state
                .entries_by_job_id
                .entry(job.id.clone())
                .or_insert_with(|| {
                    QueueEntry::new(job.id.clone(), job.tenant_id.clone(), job.priority, now)
                });
            entry.tenant_id = job.tenant_id.clone();
            entry.priority = job.priority;

            if job.is_awaiting_input() {
                entry.status = EntryStatus::Waiting;
                entry.next_at_ts = FAR_FUTURE;
                entry.lease_until_ts = None;
            } else if let Some(retry_at) = job.pending_retry_at(now) {
                entry.status = EntryStatus::Waiting;
                entry.next_at_ts = retry_at;
                entry.lease_until_ts = None;
            } else if entry.status == EntryStatus::Waiting {
                entry.status = EntryStatus::Queued;
                entry.next_at_ts = 0;
            }
        }

        if let Some(active) = active_tenant_id.filter(|t| t.is_valid()) {
            if state.active_tenant_id.as_ref() != Some(active) {
                state.active_streak = 0;
            }
            state.active_tenant_id = Some(active.clone());
        }

        state.rebuild_order();
        self.save(&state).await;
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now_ms();
        let state = self.snapshot().await;

        let mut stats = QueueStats {
            total: state.entries_by_job_id.len(),
            ..Default::default()
        };
        for entry in state.entries_by_job_id.values() {
            match entry.status {
                EntryStatus::Queued => stats.queued += 1,
                EntryStatus::Waiting => stats.waiting += 1,
                EntryStatus::Running => stats.running += 1,
            }
            if entry.is_eligible(now) {
                stats.ready += 1;
            }
            *stats.by_tenant.entry(entry.tenant_id.clone()).or_default() += 1;
        }
        stats
    }
}

/// Picks the next job and advances the rotation.
///
/// The active tenant is boosted to the front for up to `active_weight` consecutive
/// wins, then placed behind everyone else for one pick, so other tenants keep
/// their relative order and are never starved.
fn select(
    state: &mut QueueState,
    now: Timestamp,
    active: Option<&TenantId>,
    active_weight: u32,
) -> Option<(JobId, TenantId)> {
    let eligible = state.eligible_tenants(now);
    if eligible.is_empty() || state.tenant_order.is_empty() {
        return None;
    }

    let n = state.tenant_order.len();
    let cursor = state.tenant_cursor % n;
    let mut ordered: Vec<TenantId> = (0..n)
        .map(|i| &state.tenant_order[(cursor + i) % n])
        .filter(|t| eligible.contains(t))
        .cloned()
        .collect();
    let natural_first = ordered.first().cloned();

    let active = active.filter(|t| t.is_valid());
    if let Some(active) = active {
        if state.pause_other_tenants {
            ordered.retain(|t| t == active);
        } else if eligible.contains(active) {
            ordered.retain(|t| t != active);
            if state.active_streak < active_weight {
                ordered.insert(0, active.clone());
            } else {
                ordered.push(active.clone());
            }
        }
    }

    let weight = |tenant: &TenantId| {
        if Some(tenant) == active {
            active_weight.max(1) as usize
        } else {
            1
        }
    };
    let weighted: Vec<&TenantId> = ordered
        .iter()
        .flat_map(|t| std::iter::repeat_n(t, weight(t)))
        .collect();

    let (job_id, tenant_id) = weighted.into_iter().find_map(|tenant| {
        state
            .best_entry(tenant, now)
            .map(|e| (e.job_id.clone(), e.tenant_id.clone()))
    })?;

    let won_by_active = Some(&tenant_id) == active;
    if won_by_active {
        state.active_streak = state.active_streak.saturating_add(1);
    } else {
        state.active_streak = 0;
    }
    if !won_by_active || natural_first.as_ref() == Some(&tenant_id) {
        if let Some(pos) = state.tenant_order.iter().position(|t| t == &tenant_id) {
            state.tenant_cursor = (pos + 1) % n;
        }
    }

    Some((job_id, tenant_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::JobStatus;
    use crate::store::MemoryStore;
    use serde_json::json;

    const T0: Timestamp = 1_700_000_000_000;

    fn queue() -> (FairJobQueue, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::shared(T0);
        let queue = FairJobQueue::new(store.clone(), QueueConfig::default()).with_clock(clock.clone());
        (queue, store, clock)
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id)
    }

    async fn enqueue(queue: &FairJobQueue, job: &str, tenant_id: &str) {
        assert!(
            queue
                .enqueue(&JobId::new(job), 0, "test", Some(&tenant(tenant_id)))
                .await
        );
    }

    #[tokio::test]
    async fn test_round_robin_across_tenants() {
        let (queue, _, _) = queue();
        for t in ["t1", "t2", "t3", "t4"] {
            enqueue(&queue, &format!("job-{t}"), t).await;
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            let d = queue.dequeue_next(T0, None).await;
            let job_id = d.job_id.unwrap();
            queue.mark_running(&job_id, T0 + 60_000).await;
            seen.push(d.tenant_id.unwrap().0);
        }
        assert_eq!(seen, vec!["t1", "t2", "t3", "t4"]);

        let d = queue.dequeue_next(T0, None).await;
        assert!(d.job_id.is_none());
        assert_eq!(d.next_at_ts, Some(T0 + 60_000));
    }

    #[tokio::test]
    async fn test_rotation_continues_with_requeued_jobs() {
        let (queue, _, _) = queue();
        for t in ["t1", "t2", "t3"] {
            enqueue(&queue, &format!("job-{t}"), t).await;
        }

        let mut seen = Vec::new();
        for _ in 0..6 {
            let d = queue.dequeue_next(T0, None).await;
            let job_id = d.job_id.unwrap();
            queue.enqueue(&job_id, 0, "continue", None).await;
            seen.push(d.tenant_id.unwrap().0);
        }
        assert_eq!(seen, vec!["t1", "t2", "t3", "t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_active_tenant_boost() {
        let (queue, _, _) = queue();
        enqueue(&queue, "a1", "ta").await;
        enqueue(&queue, "a2", "ta").await;
        enqueue(&queue, "b1", "tb").await;
        enqueue(&queue, "b2", "tb").await;

        let active = tenant("tb");
        let mut picks = Vec::new();
        for _ in 0..3 {
            let d = queue.dequeue_next(T0, Some(&active)).await;
            let job_id = d.job_id.unwrap();
            queue.enqueue(&job_id, 0, "continue", None).await;
            picks.push(d.tenant_id.unwrap());
        }
        assert!(picks.iter().filter(|t| **t == active).count() >= 2);
        // Boost, not starvation: the other tenant still gets its turn.
        assert!(picks.contains(&tenant("ta")));
    }

    #[tokio::test]
    async fn test_pause_other_tenants() {
        let (queue, _, _) = queue();
        enqueue(&queue, "a1", "ta").await;
        enqueue(&queue, "b1", "tb").await;
        queue.set_active_tenant(Some(tenant("tb")), true).await;

        for _ in 0..3 {
            let d = queue.dequeue_next(T0, None).await;
            assert_eq!(d.tenant_id, Some(tenant("tb")));
            queue.enqueue(d.job_id.as_ref().unwrap(), 0, "continue", None).await;
        }

        queue.mark_done(&JobId::new("b1")).await;
        let d = queue.dequeue_next(T0, None).await;
        assert!(d.job_id.is_none());
    }

    #[tokio::test]
    async fn test_priority_within_tenant() {
        let (queue, _, _) = queue();
        queue
            .enqueue(&JobId::new("low"), 0, "test", Some(&tenant("t1")))
            .await;
        queue
            .enqueue(&JobId::new("high"), 5, "test", Some(&tenant("t1")))
            .await;

        let d = queue.dequeue_next(T0, None).await;
        assert_eq!(d.job_id, Some(JobId::new("high")));
    }

    #[tokio::test]
    async fn test_waiting_entry_reports_next_at() {
        let (queue, _, clock) = queue();
        enqueue(&queue, "a1", "t1").await;
        queue.mark_waiting(&JobId::new("a1"), T0 + 5_000).await;

        let d = queue.dequeue_next(T0, None).await;
        assert_eq!(
            d,
            Dequeued {
                job_id: None,
                tenant_id: None,
                next_at_ts: Some(T0 + 5_000)
            }
        );

        clock.advance(5_000);
        let d = queue.dequeue_next(clock.now_ms(), None).await;
        assert_eq!(d.job_id, Some(JobId::new("a1")));
    }

    #[tokio::test]
    async fn test_input_wait_is_parked_indefinitely() {
        let (queue, _, _) = queue();
        enqueue(&queue, "a1", "t1").await;
        queue.mark_waiting(&JobId::new("a1"), FAR_FUTURE).await;

        let d = queue.dequeue_next(T0 + 86_400_000, None).await;
        assert!(d.job_id.is_none());
        assert!(d.next_at_ts.is_none());
    }

    #[tokio::test]
    async fn test_malformed_ids_are_noops() {
        let (queue, _, _) = queue();
        assert!(!queue.enqueue(&JobId::new(""), 0, "test", Some(&tenant("t1"))).await);
        assert!(!queue.enqueue(&JobId::new("j"), 0, "test", None).await);
        assert!(!queue.mark_done(&JobId::new(" ")).await);
        assert!(!queue.mark_running(&JobId::new("missing"), T0).await);
        assert_eq!(queue.stats().await.total, 0);
    }

    #[tokio::test]
    async fn test_restart_self_heals_stale_order() {
        let (queue, store, _) = queue();
        store
            .set(
                QUEUE_STATE_KEY,
                json!({
                    "tenantOrder": ["closed-tab", "t2", "t1"],
                    "tenantCursor": 7,
                    "entriesByJobId": {
                        "a": {"tenantId": "t1", "status": "queued"},
                        "b": {"tenantId": "t2", "status": "queued"},
                        "c": {"tenantId": "t3", "status": "bogus"},
                    }
                }),
            )
            .await
            .unwrap();

        let state = queue.snapshot().await;
        let order: Vec<&str> = state.tenant_order.iter().map(TenantId::as_str).collect();
        assert_eq!(order, vec!["t2", "t1"]);
        assert!(state.tenant_cursor < state.tenant_order.len());
    }

    #[tokio::test]
    async fn test_sync_from_jobs() {
        let (queue, _, _) = queue();
        enqueue(&queue, "stale", "t9").await;

        let mut done = Job::new("done", "t1", T0);
        done.set_status(JobStatus::Done, T0);
        let mut waiting = Job::new("waiting", "t1", T0);
        waiting.set_status(JobStatus::AwaitingInput, T0);
        let mut retrying = Job::new("retrying", "t2", T0);
        retrying.runtime.retry.next_retry_at_ts = Some(T0 + 3_000);
        let fresh = Job::new("fresh", "t2", T0);

        queue
            .sync_from_jobs(&[done, waiting, retrying, fresh], Some(&tenant("t2")))
            .await;

        let state = queue.snapshot().await;
        assert_eq!(state.entries_by_job_id.len(), 3);
        assert_eq!(state.active_tenant_id, Some(tenant("t2")));
        let waiting = &state.entries_by_job_id[&JobId::new("waiting")];
        assert_eq!(waiting.next_at_ts, FAR_FUTURE);
        let retrying = &state.entries_by_job_id[&JobId::new("retrying")];
        assert_eq!(retrying.next_at_ts, T0 + 3_000);
        assert_eq!(retrying.status, EntryStatus::Waiting);

        let d = queue.dequeue_next(T0, None).await;
        assert_eq!(d.job_id, Some(JobId::new("fresh")));
    }

    #[tokio::test]
    async fn test_stats() {
        let (queue, _, _) = queue();
        enqueue(&queue, "a", "t1").await;
        enqueue(&queue, "b", "t1").await;
        enqueue(&queue, "c", "t2").await;
        queue.mark_waiting(&JobId::new("b"), T0 + 1_000).await;

        let stats = queue.stats().await;
        assert_eq!(stats.total, 3);
        assert_eq!(stats.queued, 2);
        assert_eq!(stats.waiting, 1);
        assert_eq!(stats.ready, 2);
        assert_eq!(stats.by_tenant[&tenant("t1")], 2);
    }
}
