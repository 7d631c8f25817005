use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, Timestamp, system_clock};
use crate::ids::{GrantId, JobId};
use crate::observability::EngineMetrics;
use crate::store::{self, BUDGET_STATE_KEY, KeyValueStore};

use super::{BudgetConfig, BudgetState, Grant, ProviderBudget, QuotaWindow, normalize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReserveRequest {
    pub provider: String,
    pub job_id: Option<JobId>,
    pub model: Option<String>,
    pub est_tokens: u64,
    pub est_requests: u64,
    pub lease_ms: Option<u64>,
    /// Retrying with the same key returns the existing live grant.
    pub reservation_key: Option<String>,
}

impl ReserveRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            est_requests: 1,
            ..Default::default()
        }
    }

    pub fn job(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn estimate(mut self, tokens: u64, requests: u64) -> Self {
        self.est_tokens = tokens;
        self.est_requests = requests;
        self
    }

    pub fn lease_ms(mut self, lease_ms: u64) -> Self {
        self.lease_ms = Some(lease_ms);
        self
    }

    pub fn reservation_key(mut self, key: impl Into<String>) -> Self {
        self.reservation_key = Some(key.into());
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidRequest,
    Cooldown,
    GlobalQuota,
    ModelQuota,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveResult {
    pub ok: bool,
    pub grant_id: Option<GrantId>,
    pub lease_until_ts: Option<Timestamp>,
    pub wait_ms: u64,
    pub reason: Option<RejectReason>,
}

impl ReserveResult {
    fn granted(grant: &Grant) -> Self {
        Self {
            ok: true,
            grant_id: Some(grant.grant_id.clone()),
            lease_until_ts: Some(grant.lease_until_ts),
            ..Default::default()
        }
    }

    fn rejected(reason: RejectReason, wait_ms: u64) -> Self {
        Self {
            ok: false,
            wait_ms,
            reason: Some(reason),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRequest {
    pub grant_id: GrantId,
    /// Informational; the next header update is the ground truth.
    #[serde(default)]
    pub used_tokens: Option<u64>,
    #[serde(default)]
    pub used_requests: Option<u64>,
}

impl ReleaseRequest {
    pub fn new(grant_id: GrantId) -> Self {
        Self {
            grant_id,
            ..Default::default()
        }
    }
}

/// Persistent reservation ledger.
///
/// Every call loads the `budget_state` document (pruning expired grants), mutates it
/// and writes it back under one lock. Store failures are logged and the call proceeds
/// on whatever state was readable.
pub struct BudgetStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: BudgetConfig,
    metrics: Arc<EngineMetrics>,
    lock: Mutex<()>,
}

impl BudgetStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: BudgetConfig) -> Self {
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

    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    async fn load(&self, now: Timestamp) -> BudgetState {
        normalize(
            &store::read_or_default(self.store.as_ref(), BUDGET_STATE_KEY).await,
            now,
        )
    }

    async fn save(&self, state: &BudgetState) {
        match serde_json::to_value(state) {
            Ok(value) => {
                store::write_logged(self.store.as_ref(), BUDGET_STATE_KEY, value).await;
            }
            Err(e) => warn!(error = %e, "Failed to serialize budget state"),
        }
    }

    /// Ingests remaining-quota headers observed at `ts`.
    ///
    /// The provider-wide window always takes the snapshot; with a model that model's
    /// window takes it as well. Returns the parsed window; headers that do not parse
    /// leave the stored values untouched.
    pub async fn update_from_headers<I, K, V>(
        &self,
        provider: &str,
        model: Option<&str>,
        headers: I,
        ts: Timestamp,
    ) -> QuotaWindow
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let parsed = super::parse_quota_headers(headers, ts);
        if provider.trim().is_empty() || (parsed.is_empty() && parsed.reset_at.is_none()) {
            return parsed;
        }

        let _guard = self.lock.lock().await;
        let mut state = self.load(self.clock.now_ms()).await;
        let budget = state.by_provider.entry(provider.to_string()).or_default();
        budget.global.merge(&parsed);
        if let Some(model) = model.filter(|m| !m.trim().is_empty()) {
            budget
                .per_model
                .entry(model.to_string())
                .or_default()
                .merge(&parsed);
        }
        debug!(
            provider,
            model,
            requests_remaining = ?parsed.requests_remaining,
            tokens_remaining = ?parsed.tokens_remaining,
            "Quota headers ingested"
        );
        self.save(&state).await;
        parsed
    }

    /// Reserves budget for one upstream call.
    pub async fn reserve(&self, request: ReserveRequest) -> ReserveResult {
        if request.provider.trim().is_empty() {
            return ReserveResult::rejected(RejectReason::InvalidRequest, 0);
        }

        let _guard = self.lock.lock().await;
        let now = self.clock.now_ms();
        let mut state = self.load(now).await;
        let budget = state
            .by_provider
            .entry(request.provider.clone())
            .or_default();

        if let Some(key) = request.reservation_key.as_deref()
            && let Some(existing) = budget
                .grants
                .iter()
                .find(|g| g.reservation_key.as_deref() == Some(key))
        {
            debug!(grant_id = %existing.grant_id, key, "Reservation key already granted");
            return ReserveResult::granted(existing);
        }

        if let Some(until) = budget.cooldown_until_ts.filter(|until| *until > now) {
            self.metrics.budget_rejections.inc();
            return ReserveResult::rejected(RejectReason::Cooldown, (until - now) as u64);
        }

        let model = request.model.as_deref().filter(|m| !m.trim().is_empty());
        let global_wait = self.shortfall_wait(budget, &budget.global, None, &request, now);
        let model_wait = model.and_then(|m| {
            budget
                .per_model
                .get(m)
                .and_then(|window| self.shortfall_wait(budget, window, Some(m), &request, now))
        });
        if let Some(wait_ms) = global_wait {
            self.metrics.budget_rejections.inc();
            return ReserveResult::rejected(RejectReason::GlobalQuota, wait_ms.max(model_wait.unwrap_or(0)));
        }
        if let Some(wait_ms) = model_wait {
            self.metrics.budget_rejections.inc();
            return ReserveResult::rejected(RejectReason::ModelQuota, wait_ms);
        }

        let grant = Grant {
            grant_id: GrantId::generate(),
            provider: request.provider.clone(),
            job_id: request.job_id.clone(),
            model: model.map(str::to_string),
            est_tokens: request.est_tokens,
            est_requests: request.est_requests,
            created_ts: now,
            lease_until_ts: now + self.config.clamp_lease(request.lease_ms) as i64,
            reservation_key: request.reservation_key.clone(),
        };
        let result = ReserveResult::granted(&grant);
        debug!(
            grant_id = %grant.grant_id,
            provider = %grant.provider,
            est_tokens = grant.est_tokens,
            "Budget reserved"
        );
        budget.grants.push(grant);
        self.save(&state).await;
        result
    }

    /// Wait until the window could cover `request`, or `None` if it already can.
    fn shortfall_wait(
        &self,
        budget: &ProviderBudget,
        window: &QuotaWindow,
        model: Option<&str>,
        request: &ReserveRequest,
        now: Timestamp,
    ) -> Option<u64> {
        if !window.is_current(now) {
            return None;
        }
        let (reserved_requests, reserved_tokens) = budget.reserved(model, now);
        let short_requests = window
            .requests_remaining
            .is_some_and(|r| r.saturating_sub(reserved_requests) < request.est_requests);
        let short_tokens = window
            .tokens_remaining
            .is_some_and(|t| t.saturating_sub(reserved_tokens) < request.est_tokens);
        if !short_requests && !short_tokens {
            return None;
        }

        let until = [window.reset_at, budget.next_grant_expiry(model, now)]
            .into_iter()
            .flatten()
            .min();
        let wait_ms = until.map_or(0, |at| (at - now).max(0) as u64);
        Some(wait_ms.max(self.config.min_wait_ms))
    }

    /// Deletes a grant. Returns `false` if it was unknown or already expired.
    pub async fn release(&self, request: ReleaseRequest) -> bool {
        let _guard = self.lock.lock().await;
        let now = self.clock.now_ms();
        let mut state = self.load(now).await;

        let mut released = false;
        for budget in state.by_provider.values_mut() {
            let before = budget.grants.len();
            budget.grants.retain(|g| g.grant_id != request.grant_id);
            released |= budget.grants.len() != before;
        }

        if released {
            debug!(
                grant_id = %request.grant_id,
                used_tokens = ?request.used_tokens,
                used_requests = ?request.used_requests,
                "Budget released"
            );
            self.save(&state).await;
        }
        released
    }

    /// Records a 429: ingests any headers and starts a jittered cooldown. Returns the
    /// cooldown end.
    pub async fn on_429<I, K, V>(
        &self,
        provider: &str,
        model: Option<&str>,
        retry_after_ms: Option<u64>,
        headers: I,
    ) -> Timestamp
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let now = self.clock.now_ms();
        if provider.trim().is_empty() {
            return now;
        }
        self.update_from_headers(provider, model, headers, now).await;

        let cooldown_ms = self.config.clamp_cooldown(retry_after_ms);
        let jitter_ms = if self.config.cooldown_jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=self.config.cooldown_jitter_ms)
        };

        let _guard = self.lock.lock().await;
        let mut state = self.load(now).await;
        let budget = state.by_provider.entry(provider.to_string()).or_default();
        let until = now + (cooldown_ms + jitter_ms) as i64;
        let cooldown_until = budget.cooldown_until_ts.map_or(until, |c| c.max(until));
        budget.cooldown_until_ts = Some(cooldown_until);
        self.save(&state).await;

        self.metrics.rate_limited.inc();
        info!(provider, cooldown_ms, jitter_ms, "Provider rate limited, cooling down");
        cooldown_until
    }

    /// Normalized, pruned view of one provider's budget.
    pub async fn snapshot(&self, provider: &str) -> Option<ProviderBudget> {
        let _guard = self.lock.lock().await;
        let mut state = self.load(self.clock.now_ms()).await;
        state.by_provider.remove(provider)
    }
}
