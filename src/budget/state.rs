//! Persisted reservation ledger.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::Timestamp;
use crate::ids::{GrantId, JobId};

/// Remaining quota as last reported by the provider.
///
/// Every field is optional: an absent value is unknown and never blocks admission.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaWindow {
    pub requests_remaining: Option<u64>,
    pub tokens_remaining: Option<u64>,
    pub reset_at: Option<Timestamp>,
}

impl QuotaWindow {
    /// Remaining counts are only trusted until the window resets.
    pub fn is_current(&self, now: Timestamp) -> bool {
        self.reset_at.is_none_or(|at| at > now)
    }

    /// Overwrites the fields `update` knows about.
    pub fn merge(&mut self, update: &QuotaWindow) {
        if update.requests_remaining.is_some() {
            self.requests_remaining = update.requests_remaining;
        }
        if update.tokens_remaining.is_some() {
            self.tokens_remaining = update.tokens_remaining;
        }
        if update.reset_at.is_some() {
            self.reset_at = update.reset_at;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.requests_remaining.is_none() && self.tokens_remaining.is_none()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub grant_id: GrantId,
    pub provider: String,
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub est_tokens: u64,
    #[serde(default)]
    pub est_requests: u64,
    pub created_ts: Timestamp,
    pub lease_until_ts: Timestamp,
    #[serde(default)]
    pub reservation_key: Option<String>,
}

impl Grant {
    pub fn is_live(&self, now: Timestamp) -> bool {
        self.lease_until_ts > now
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderBudget {
    pub global: QuotaWindow,
    pub per_model: BTreeMap<String, QuotaWindow>,
    pub cooldown_until_ts: Option<Timestamp>,
    pub grants: Vec<Grant>,
}

impl ProviderBudget {
    pub fn in_cooldown(&self, now: Timestamp) -> bool {
        self.cooldown_until_ts.is_some_and(|until| until > now)
    }

    /// Sum of live reservations, optionally restricted to one model.
    pub fn reserved(&self, model: Option<&str>, now: Timestamp) -> (u64, u64) {
        self.grants
            .iter()
            .filter(|g| g.is_live(now))
            .filter(|g| model.is_none_or(|m| g.model.as_deref() == Some(m)))
            .fold((0, 0), |(requests, tokens), g| {
                (
                    requests.saturating_add(g.est_requests),
                    tokens.saturating_add(g.est_tokens),
                )
            })
    }

    /// Earliest lease expiry among live grants.
    pub fn next_grant_expiry(&self, model: Option<&str>, now: Timestamp) -> Option<Timestamp> {
        self.grants
            .iter()
            .filter(|g| g.is_live(now))
            .filter(|g| model.is_none_or(|m| g.model.as_deref() == Some(m)))
            .map(|g| g.lease_until_ts)
            .min()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetState {
    pub by_provider: BTreeMap<String, ProviderBudget>,
}

/// Parses the persisted ledger, dropping malformed providers and grants and
/// pruning grants that expired before `now`.
pub fn normalize(value: &Value, now: Timestamp) -> BudgetState {
    let Some(providers) = value
        .as_object()
        .and_then(|o| o.get("byProvider"))
        .and_then(Value::as_object)
    else {
        return BudgetState::default();
    };

    let mut by_provider = BTreeMap::new();
    for (provider, raw) in providers {
        if provider.trim().is_empty() {
            continue;
        }
        let Some(obj) = raw.as_object() else {
            tracing::warn!(provider = %provider, "Dropping malformed provider budget");
            continue;
        };

        let window = |v: Option<&Value>| {
            v.cloned()
                .and_then(|v| serde_json::from_value::<QuotaWindow>(v).ok())
                .unwrap_or_default()
        };

        let per_model = obj
            .get("perModel")
            .and_then(Value::as_object)
            .map(|models| {
                models
                    .iter()
                    .filter_map(|(model, w)| {
                        serde_json::from_value::<QuotaWindow>(w.clone())
                            .ok()
                            .map(|w| (model.clone(), w))
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut grants = Vec::new();
        for raw_grant in obj.get("grants").and_then(Value::as_array).into_iter().flatten() {
            match serde_json::from_value::<Grant>(raw_grant.clone()) {
                Ok(grant) if grant.grant_id.is_valid() && grant.is_live(now) => grants.push(grant),
                Ok(_) => {}
                Err(e) => tracing::warn!(provider = %provider, error = %e, "Dropping malformed grant"),
            }
        }

        by_provider.insert(
            provider.clone(),
            ProviderBudget {
                global: window(obj.get("global")),
                per_model,
                cooldown_until_ts: obj.get("cooldownUntilTs").and_then(Value::as_i64),
                grants,
            },
        );
    }

    BudgetState { by_provider }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grant(id: &str, model: Option<&str>, requests: u64, until: Timestamp) -> Grant {
        Grant {
            grant_id: GrantId::new(id),
            provider: "anthropic".into(),
            model: model.map(str::to_string),
            est_requests: requests,
            est_tokens: requests * 100,
            lease_until_ts: until,
            ..Default::default()
        }
    }

    #[test]
    fn test_reserved_counts_only_live_grants() {
        let budget = ProviderBudget {
            grants: vec![
                grant("a", Some("m1"), 1, 100),
                grant("b", Some("m2"), 2, 200),
                grant("c", Some("m1"), 4, 50),
            ],
            ..Default::default()
        };
        assert_eq!(budget.reserved(None, 60), (3, 300));
        assert_eq!(budget.reserved(Some("m1"), 60), (1, 100));
        assert_eq!(budget.next_grant_expiry(None, 60), Some(100));
    }

    #[test]
    fn test_normalize_prunes_and_drops_garbage() {
        let state = normalize(
            &json!({
                "byProvider": {
                    "anthropic": {
                        "global": {"requestsRemaining": 10, "resetAt": 5000},
                        "perModel": {"m1": {"tokensRemaining": 800}, "bad": {"tokensRemaining": "lots"}},
                        "cooldownUntilTs": 3000,
                        "grants": [
                            {"grantId": "live", "provider": "anthropic", "createdTs": 0, "leaseUntilTs": 2000},
                            {"grantId": "stale", "provider": "anthropic", "createdTs": 0, "leaseUntilTs": 900},
                            {"grantId": "broken"}
                        ]
                    },
                    "openai": "nonsense",
                    "": {}
                }
            }),
            1000,
        );

        assert_eq!(state.by_provider.len(), 1);
        let budget = &state.by_provider["anthropic"];
        assert_eq!(budget.global.requests_remaining, Some(10));
        assert_eq!(budget.per_model.len(), 1);
        assert_eq!(budget.cooldown_until_ts, Some(3000));
        let ids: Vec<&str> = budget.grants.iter().map(|g| g.grant_id.as_str()).collect();
        assert_eq!(ids, vec!["live"]);
    }

    #[test]
    fn test_stale_window_is_not_current() {
        let window = QuotaWindow {
            requests_remaining: Some(0),
            reset_at: Some(1000),
            ..Default::default()
        };
        assert!(window.is_current(999));
        assert!(!window.is_current(1000));
    }
}
