//! Persisted queue state and its normalization.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{FAR_FUTURE, Timestamp};
use crate::ids::{JobId, TenantId};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    #[default]
    Queued,
    Waiting,
    Running,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub priority: i32,
    pub status: EntryStatus,
    pub next_at_ts: Timestamp,
    pub lease_until_ts: Option<Timestamp>,
    pub dequeued_count: u64,
    pub last_dequeued_ts: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl QueueEntry {
    pub fn new(job_id: JobId, tenant_id: TenantId, priority: i32, now: Timestamp) -> Self {
        Self {
            job_id,
            tenant_id,
            priority,
            status: EntryStatus::Queued,
            next_at_ts: 0,
            lease_until_ts: None,
            dequeued_count: 0,
            last_dequeued_ts: None,
            updated_at: now,
        }
    }

    /// Ready to be handed out at `now`.
    ///
    /// A `running` entry whose lease has lapsed is ready again: the worker that
    /// dequeued it never reported a disposition.
    pub fn is_eligible(&self, now: Timestamp) -> bool {
        if self.next_at_ts > now {
            return false;
        }
        match self.status {
            EntryStatus::Queued | EntryStatus::Waiting => true,
            EntryStatus::Running => self.lease_until_ts.is_none_or(|until| until <= now),
        }
    }

    /// Earliest future time this entry becomes eligible, ignoring parked entries.
    pub fn ready_at(&self) -> Option<Timestamp> {
        let at = match self.status {
            EntryStatus::Running => self
                .lease_until_ts
                .map_or(self.next_at_ts, |until| until.max(self.next_at_ts)),
            EntryStatus::Queued | EntryStatus::Waiting => self.next_at_ts,
        };
        (at < FAR_FUTURE).then_some(at)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueState {
    pub active_tenant_id: Option<TenantId>,
    pub pause_other_tenants: bool,
    pub entries_by_job_id: BTreeMap<JobId, QueueEntry>,
    pub tenant_order: Vec<TenantId>,
    pub tenant_cursor: usize,
    /// Consecutive picks won by the active tenant.
    pub active_streak: u32,
}

impl QueueState {
    /// Rebuilds `tenant_order` from the entries.
    ///
    /// Persisted order is kept for tenants that still have entries, unknown tenants
    /// are dropped, new tenants are appended in sorted order. The cursor keeps
    /// pointing at the same upcoming tenant where possible.
    pub fn rebuild_order(&mut self) {
        let live: BTreeSet<&TenantId> = self
            .entries_by_job_id
            .values()
            .map(|e| &e.tenant_id)
            .collect();

        let mut order: Vec<TenantId> = Vec::with_capacity(live.len());
        let mut dropped_before_cursor = 0;
        for (idx, tenant) in self.tenant_order.iter().enumerate() {
            if live.contains(tenant) && !order.contains(tenant) {
                order.push(tenant.clone());
            } else if idx < self.tenant_cursor {
                dropped_before_cursor += 1;
            }
        }
        for tenant in live {
            if !order.contains(tenant) {
                order.push(tenant.clone());
            }
        }

        let cursor = self.tenant_cursor.saturating_sub(dropped_before_cursor);
        self.tenant_cursor = if order.is_empty() {
            0
        } else {
            cursor % order.len()
        };
        self.tenant_order = order;
    }

    /// Highest-priority eligible entry for `tenant`: priority desc, oldest update,
    /// then job id.
    pub fn best_entry(&self, tenant: &TenantId, now: Timestamp) -> Option<&QueueEntry> {
        self.entries_by_job_id
            .values()
            .filter(|e| &e.tenant_id == tenant && e.is_eligible(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.updated_at.cmp(&b.updated_at))
                    .then(a.job_id.cmp(&b.job_id))
            })
    }

    pub fn eligible_tenants(&self, now: Timestamp) -> BTreeSet<&TenantId> {
        self.entries_by_job_id
            .values()
            .filter(|e| e.is_eligible(now))
            .map(|e| &e.tenant_id)
            .collect()
    }

    pub fn earliest_ready_at(&self, now: Timestamp) -> Option<Timestamp> {
        self.entries_by_job_id
            .values()
            .filter(|e| !e.is_eligible(now))
            .filter_map(QueueEntry::ready_at)
            .min()
    }
}

/// Parses a persisted queue document, resetting anything malformed to defaults.
pub fn normalize(value: &Value) -> QueueState {
    let obj = value.as_object();
    let field = |name: &str| obj.and_then(|o| o.get(name));

    let mut entries_by_job_id = BTreeMap::new();
    if let Some(raw_entries) = field("entriesByJobId").and_then(Value::as_object) {
        for (key, raw) in raw_entries {
            let mut entry = match serde_json::from_value::<QueueEntry>(raw.clone()) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(job_id = %key, error = %e, "Dropping malformed queue entry");
                    continue;
                }
            };
            entry.job_id = JobId::new(key.as_str());
            if !entry.job_id.is_valid() || !entry.tenant_id.is_valid() {
                tracing::warn!(job_id = %key, "Dropping queue entry without job or tenant id");
                continue;
            }
            entries_by_job_id.insert(entry.job_id.clone(), entry);
        }
    }

    let tenant_order = field("tenantOrder")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(TenantId::from)
                .collect()
        })
        .unwrap_or_default();

    let mut state = QueueState {
        active_tenant_id: field("activeTenantId")
            .and_then(Value::as_str)
            .map(TenantId::from)
            .filter(TenantId::is_valid),
        pause_other_tenants: field("pauseOtherTenants")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        entries_by_job_id,
        tenant_order,
        tenant_cursor: field("tenantCursor")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(0),
        active_streak: field("activeStreak")
            .and_then(Value::as_u64)
            .map(|s| s.min(u32::MAX as u64) as u32)
            .unwrap_or(0),
    };
    state.rebuild_order();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_rebuilds_stale_order() {
        let state = normalize(&json!({
            "tenantOrder": ["ghost", "t2", "t1", "t2"],
            "tenantCursor": 1,
            "entriesByJobId": {
                "a": {"tenantId": "t1"},
                "b": {"tenantId": "t2"},
                "c": {"tenantId": "t3"},
            }
        }));
        let order: Vec<&str> = state.tenant_order.iter().map(TenantId::as_str).collect();
        assert_eq!(order, vec!["t2", "t1", "t3"]);
        // Cursor pointed at "t2", which moved from index 1 to 0.
        assert_eq!(state.tenant_cursor, 0);
    }

    #[test]
    fn test_normalize_is_deterministic() {
        let raw = json!({
            "tenantOrder": ["zz", "t9"],
            "entriesByJobId": {
                "x": {"tenantId": "t4"},
                "y": {"tenantId": "t1"},
                "z": {"tenantId": "t9"},
            }
        });
        let first = normalize(&raw);
        let second = normalize(&serde_json::to_value(&first).unwrap());
        assert_eq!(first.tenant_order, second.tenant_order);
        let order: Vec<&str> = first.tenant_order.iter().map(TenantId::as_str).collect();
        assert_eq!(order, vec!["t9", "t1", "t4"]);
    }

    #[test]
    fn test_normalize_drops_malformed_entries() {
        let state = normalize(&json!({
            "activeTenantId": "",
            "pauseOtherTenants": "yes",
            "entriesByJobId": {
                "ok": {"tenantId": "t1", "priority": 3},
                "no-tenant": {"priority": 1},
                "bad": {"tenantId": "t1", "priority": "high"},
                "": {"tenantId": "t1"},
            },
            "tenantCursor": -4,
        }));
        assert_eq!(state.entries_by_job_id.len(), 1);
        assert!(state.active_tenant_id.is_none());
        assert!(!state.pause_other_tenants);
        assert_eq!(state.tenant_cursor, 0);
    }

    #[test]
    fn test_normalize_garbage_is_default() {
        assert_eq!(normalize(&json!(null)), QueueState::default());
        assert_eq!(normalize(&json!([1, 2, 3])), QueueState::default());
    }

    #[test]
    fn test_running_entry_with_lapsed_lease_is_eligible() {
        let mut entry = QueueEntry::new(JobId::new("a"), TenantId::new("t1"), 0, 0);
        entry.status = EntryStatus::Running;
        entry.lease_until_ts = Some(100);
        assert!(!entry.is_eligible(50));
        assert_eq!(entry.ready_at(), Some(100));
        assert!(entry.is_eligible(100));
    }

    #[test]
    fn test_parked_entries_have_no_ready_time() {
        let mut entry = QueueEntry::new(JobId::new("a"), TenantId::new("t1"), 0, 0);
        entry.status = EntryStatus::Waiting;
        entry.next_at_ts = FAR_FUTURE;
        assert_eq!(entry.ready_at(), None);
    }

    #[test]
    fn test_best_entry_ordering() {
        let mut state = QueueState::default();
        let tenant = TenantId::new("t1");
        for (id, priority, updated_at) in [("c", 0, 5), ("b", 1, 9), ("a", 1, 9), ("d", 1, 10)] {
            let entry = QueueEntry::new(JobId::new(id), tenant.clone(), priority, updated_at);
            state.entries_by_job_id.insert(entry.job_id.clone(), entry);
        }
        assert_eq!(state.best_entry(&tenant, 100).unwrap().job_id.as_str(), "a");
    }
}
