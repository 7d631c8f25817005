//! Admission control for outbound LLM calls.
//!
//! Two in-memory token buckets (requests and tokens per window) gate a high and a
//! low FIFO lane. High drains first and blocks on its head; low is served only while
//! the buckets keep a configurable headroom for high. A granted slot is then checked
//! against the [`BudgetStore`] ledger when a provider is named.

mod bucket;

pub use bucket::TokenBucket;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, info, warn};

use crate::budget::{BudgetStore, RejectReason, ReleaseRequest, ReserveRequest, parse_retry_after};
use crate::clock::{Clock, Timestamp};
use crate::ids::{GrantId, JobId};
use crate::observability::{EngineMetrics, admission_span};
use crate::scheduler::{FlightGuard, WakeTimer};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub requests_per_window: u64,
    pub tokens_per_window: u64,
    pub window_ms: u64,
    /// Low is only considered while the high backlog is below this.
    pub high_backlog_threshold: usize,
    /// Share of the request bucket low priority work must leave untouched.
    pub low_min_rpm_fraction: f64,
    /// Share of the token bucket low priority work must leave untouched.
    pub low_min_tpm_fraction: f64,
    pub rate_limit_backoff_ms: u64,
    /// Bounds applied to a provider's retry-after hint.
    pub min_rate_limit_backoff_ms: u64,
    pub max_rate_limit_backoff_ms: u64,
    pub benchmark_freeze_ms: u64,
    /// Lease requested for budget grants.
    pub grant_lease_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 50,
            tokens_per_window: 40_000,
            window_ms: 60_000,
            high_backlog_threshold: 1,
            low_min_rpm_fraction: 0.15,
            low_min_tpm_fraction: 0.10,
            rate_limit_backoff_ms: 30_000,
            min_rate_limit_backoff_ms: 250,
            max_rate_limit_backoff_ms: 15 * 60_000,
            benchmark_freeze_ms: 20 * 60_000,
            grant_lease_ms: 60_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Translate,
    Plan,
    /// Low-value probing; frozen for a long time after a rate limit.
    Benchmark,
    Other,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Translate => "translate",
            Self::Plan => "plan",
            Self::Benchmark => "benchmark",
            Self::Other => "other",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    High,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Low => "low",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlotRequest {
    pub kind: TaskKind,
    pub priority: Priority,
    pub est_tokens: u64,
    pub est_requests: u64,
    pub job_id: Option<JobId>,
    /// When set, the slot also needs a grant from the budget ledger.
    pub provider: Option<String>,
    pub model: Option<String>,
    pub reservation_key: Option<String>,
}

impl SlotRequest {
    pub fn new(kind: TaskKind, priority: Priority) -> Self {
        Self {
            kind,
            priority,
            est_requests: 1,
            ..Default::default()
        }
    }

    pub fn tokens(mut self, est_tokens: u64) -> Self {
        self.est_tokens = est_tokens;
        self
    }

    pub fn requests(mut self, est_requests: u64) -> Self {
        self.est_requests = est_requests;
        self
    }

    pub fn job(mut self, job_id: impl Into<JobId>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn provider(mut self, provider: impl Into<String>, model: Option<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = model;
        self
    }

    pub fn reservation_key(mut self, key: impl Into<String>) -> Self {
        self.reservation_key = Some(key.into());
        self
    }
}

/// Proof of admission; hand it back through [`AdmissionController::release`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotPermit {
    pub permit_id: u64,
    pub kind: TaskKind,
    pub priority: Priority,
    pub job_id: Option<JobId>,
    pub est_tokens: u64,
    pub est_requests: u64,
    pub provider: Option<String>,
    pub grant_id: Option<GrantId>,
    pub granted_at_ts: Timestamp,
}

/// Actual consumption reported on release.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Usage {
    pub used_tokens: Option<u64>,
    pub used_requests: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub rpm_fraction: f64,
    pub tpm_fraction: f64,
    pub requests_available: f64,
    pub tokens_available: f64,
    pub high_pending: usize,
    pub low_pending: usize,
    pub backoff_until_ts: Option<Timestamp>,
    pub frozen_until_ts: Option<Timestamp>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Benchmark tasks are frozen until {until_ts}")]
    BenchmarkFrozen { until_ts: Timestamp },

    #[error("Slot request for job {job_id} cancelled")]
    Cancelled { job_id: JobId },

    #[error("Budget rejected request: {0}")]
    Rejected(String),

    #[error("Admission controller closed")]
    Closed,
}

/// Outcome of one processing pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub skipped: bool,
    pub granted: usize,
    /// Delay until the blocked head could be served.
    pub wait_ms: Option<u64>,
}

type Reply = oneshot::Sender<Result<SlotPermit, AdmissionError>>;

struct Waiter {
    request: SlotRequest,
    reply: Reply,
}

impl Waiter {
    fn needs(&self) -> (f64, f64) {
        (
            self.request.est_requests as f64,
            self.request.est_tokens as f64,
        )
    }
}

struct Lanes {
    requests: TokenBucket,
    tokens: TokenBucket,
    high: VecDeque<Waiter>,
    low: VecDeque<Waiter>,
    backoff_until_ts: Option<Timestamp>,
    frozen_until_ts: Option<Timestamp>,
    next_permit_id: u64,
    closed: bool,
}

impl Lanes {
    fn lane(&mut self, priority: Priority) -> &mut VecDeque<Waiter> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Low => &mut self.low,
        }
    }

    fn pending(&self) -> usize {
        self.high.len() + self.low.len()
    }

    fn refund(&mut self, requests: f64, tokens: f64, now: Timestamp) {
        self.requests.refund(requests, now);
        self.tokens.refund(tokens, now);
    }

    /// Removes waiters matching `pred` from both lanes.
    fn extract(&mut self, pred: impl Fn(&Waiter) -> bool) -> Vec<Waiter> {
        let mut out = Vec::new();
        for lane in [&mut self.high, &mut self.low] {
            let (matched, kept): (VecDeque<Waiter>, VecDeque<Waiter>) =
                lane.drain(..).partition(|w| pred(w));
            *lane = kept;
            out.extend(matched);
        }
        out
    }
}

enum Budgeted {
    Granted(Option<GrantId>),
    Wait(u64),
    Invalid(String),
}

pub struct AdmissionController {
    config: AdmissionConfig,
    clock: Arc<dyn Clock>,
    budget: Option<Arc<BudgetStore>>,
    metrics: Arc<EngineMetrics>,
    lanes: Mutex<Lanes>,
    processing: AtomicBool,
    dirty: AtomicBool,
    wake: WakeTimer,
    this: Weak<AdmissionController>,
}

impl AdmissionController {
    pub fn new(
        config: AdmissionConfig,
        clock: Arc<dyn Clock>,
        budget: Option<Arc<BudgetStore>>,
        metrics: Arc<EngineMetrics>,
    ) -> Arc<Self> {
        let now = clock.now_ms();
        let lanes = Lanes {
            requests: TokenBucket::new(config.requests_per_window, config.window_ms, now),
            tokens: TokenBucket::new(config.tokens_per_window, config.window_ms, now),
            high: VecDeque::new(),
            low: VecDeque::new(),
            backoff_until_ts: None,
            frozen_until_ts: None,
            next_permit_id: 1,
            closed: false,
        };
        Arc::new_cyclic(|this| Self {
            config,
            clock,
            budget,
            metrics,
            lanes: Mutex::new(lanes),
            processing: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            wake: WakeTimer::new(),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_pending(&self, lanes: &Lanes) {
        self.metrics.lanes_pending.set(lanes.pending() as i64);
    }

    /// Waits for a slot. Resolves once both buckets (and the budget ledger, if a
    /// provider is named) can cover the request, in lane order.
    pub async fn reserve_slot(&self, request: SlotRequest) -> Result<SlotPermit, AdmissionError> {
        let span = admission_span(request.kind.as_str(), request.priority.as_str());
        async move {
            let reply = self.enqueue(request)?;
            self.pump().await;
            reply.await.unwrap_or(Err(AdmissionError::Closed))
        }
        .instrument(span)
        .await
    }

    fn enqueue(
        &self,
        request: SlotRequest,
    ) -> Result<oneshot::Receiver<Result<SlotPermit, AdmissionError>>, AdmissionError> {
        let now = self.clock.now_ms();
        let mut lanes = self.lanes();
        if lanes.closed {
            return Err(AdmissionError::Closed);
        }
        if request.kind == TaskKind::Benchmark
            && let Some(until_ts) = lanes.frozen_until_ts.filter(|until| *until > now)
        {
            self.metrics.slots_rejected.inc();
            return Err(AdmissionError::BenchmarkFrozen { until_ts });
        }

        let (reply, receiver) = oneshot::channel();
        let priority = request.priority;
        lanes.lane(priority).push_back(Waiter { request, reply });
        self.publish_pending(&lanes);
        Ok(receiver)
    }

    /// Runs processing passes until no new work arrived meanwhile. Single-flight: a
    /// call made during a pass only marks the lanes dirty.
    pub async fn pump(&self) -> PumpReport {
        self.dirty.store(true, Ordering::Release);
        let mut report = PumpReport {
            skipped: true,
            ..Default::default()
        };

        loop {
            let Some(guard) = FlightGuard::acquire(&self.processing) else {
                return report;
            };
            report.skipped = false;
            while self.dirty.swap(false, Ordering::AcqRel) {
                let pass = self.process().await;
                report.granted += pass.granted;
                report.wait_ms = pass.wait_ms;
            }
            drop(guard);
            if !self.dirty.load(Ordering::Acquire) {
                break;
            }
        }

        if let Some(wait_ms) = report.wait_ms {
            self.arm_wake(wait_ms);
        }
        report
    }

    async fn process(&self) -> PumpReport {
        let mut report = PumpReport::default();
        loop {
            let now = self.clock.now_ms();
            let waiter = {
                let mut lanes = self.lanes();
                let next = self.next_candidate(&mut lanes, now);
                self.publish_pending(&lanes);
                match next {
                    Ok(waiter) => waiter,
                    Err(wait_ms) => {
                        report.wait_ms = wait_ms;
                        break;
                    }
                }
            };
            let (requests, tokens) = waiter.needs();

            let grant_id = match self.reserve_budget(&waiter.request).await {
                Budgeted::Granted(grant_id) => grant_id,
                Budgeted::Wait(wait_ms) => {
                    let mut lanes = self.lanes();
                    lanes.refund(requests, tokens, self.clock.now_ms());
                    let priority = waiter.request.priority;
                    lanes.lane(priority).push_front(waiter);
                    self.publish_pending(&lanes);
                    report.wait_ms = Some(wait_ms);
                    break;
                }
                Budgeted::Invalid(reason) => {
                    self.lanes().refund(requests, tokens, self.clock.now_ms());
                    self.metrics.slots_rejected.inc();
                    let _ = waiter.reply.send(Err(AdmissionError::Rejected(reason)));
                    continue;
                }
            };

            let permit = SlotPermit {
                permit_id: {
                    let mut lanes = self.lanes();
                    lanes.next_permit_id += 1;
                    lanes.next_permit_id - 1
                },
                kind: waiter.request.kind,
                priority: waiter.request.priority,
                job_id: waiter.request.job_id.clone(),
                est_tokens: waiter.request.est_tokens,
                est_requests: waiter.request.est_requests,
                provider: waiter.request.provider.clone(),
                grant_id,
                granted_at_ts: now,
            };

            match waiter.reply.send(Ok(permit)) {
                Ok(()) => {
                    report.granted += 1;
                    self.metrics.slots_granted.inc();
                }
                Err(unclaimed) => {
                    // The caller went away between reservation and hand-off.
                    debug!("Slot waiter dropped before hand-off, refunding");
                    self.lanes().refund(requests, tokens, self.clock.now_ms());
                    if let Ok(permit) = unclaimed {
                        self.release_grant(&permit, Usage::default()).await;
                    }
                }
            }
        }
        report
    }

    /// Pops the next waiter that both buckets can cover, consuming its estimate, or
    /// returns how long until the blocking head could be served.
    fn next_candidate(&self, lanes: &mut Lanes, now: Timestamp) -> Result<Waiter, Option<u64>> {
        for lane in [&mut lanes.high, &mut lanes.low] {
            lane.retain(|w| !w.reply.is_closed());
        }
        if lanes.pending() == 0 {
            return Err(None);
        }
        if let Some(until) = lanes.backoff_until_ts.filter(|until| *until > now) {
            return Err(Some((until - now) as u64));
        }

        let mut high_wait = None;
        if let Some((requests, tokens)) = lanes.high.front().map(Waiter::needs) {
            if lanes.requests.has(requests, now) && lanes.tokens.has(tokens, now) {
                lanes.requests.try_consume(requests, now);
                lanes.tokens.try_consume(tokens, now);
                return lanes.high.pop_front().ok_or(None);
            }
            let wait = lanes
                .requests
                .time_to(requests, now)
                .max(lanes.tokens.time_to(tokens, now));
            if lanes.high.len() >= self.config.high_backlog_threshold || lanes.low.is_empty() {
                return Err(Some(wait));
            }
            high_wait = Some(wait);
        }

        let Some((requests, tokens)) = lanes.low.front().map(Waiter::needs) else {
            return Err(high_wait);
        };
        let floor_requests = self.config.low_min_rpm_fraction * lanes.requests.capacity();
        let floor_tokens = self.config.low_min_tpm_fraction * lanes.tokens.capacity();
        let need_requests = (requests + floor_requests).min(lanes.requests.capacity());
        let need_tokens = (tokens + floor_tokens).min(lanes.tokens.capacity());

        if lanes.requests.has(need_requests, now) && lanes.tokens.has(need_tokens, now) {
            lanes.requests.try_consume(requests, now);
            lanes.tokens.try_consume(tokens, now);
            return lanes.low.pop_front().ok_or(None);
        }
        let low_wait = lanes
            .requests
            .time_to(need_requests, now)
            .max(lanes.tokens.time_to(need_tokens, now));
        Err(Some(high_wait.map_or(low_wait, |w| w.min(low_wait))))
    }

    async fn reserve_budget(&self, request: &SlotRequest) -> Budgeted {
        let (Some(budget), Some(provider)) = (self.budget.as_ref(), request.provider.as_ref()) else {
            return Budgeted::Granted(None);
        };

        let mut reserve = ReserveRequest::new(provider.as_str())
            .estimate(request.est_tokens, request.est_requests)
            .lease_ms(self.config.grant_lease_ms);
        reserve.job_id = request.job_id.clone();
        reserve.model = request.model.clone();
        reserve.reservation_key = request.reservation_key.clone();

        let result = budget.reserve(reserve).await;
        if result.ok {
            return Budgeted::Granted(result.grant_id);
        }
        match result.reason {
            Some(RejectReason::InvalidRequest) => {
                Budgeted::Invalid(format!("invalid budget request for provider '{provider}'"))
            }
            _ => {
                debug!(provider = %provider, wait_ms = result.wait_ms, reason = ?result.reason, "Budget not available");
                Budgeted::Wait(result.wait_ms.max(1))
            }
        }
    }

    async fn release_grant(&self, permit: &SlotPermit, usage: Usage) {
        let (Some(budget), Some(grant_id)) = (self.budget.as_ref(), permit.grant_id.clone()) else {
            return;
        };
        budget
            .release(ReleaseRequest {
                grant_id,
                used_tokens: usage.used_tokens,
                used_requests: usage.used_requests,
            })
            .await;
    }

    /// Returns a permit. Unused token estimate goes back to the bucket and the
    /// budget grant is released.
    pub async fn release(&self, permit: SlotPermit, usage: Usage) {
        if let Some(used) = usage.used_tokens.filter(|used| *used < permit.est_tokens) {
            let unused = (permit.est_tokens - used) as f64;
            self.lanes().tokens.refund(unused, self.clock.now_ms());
        }
        self.release_grant(&permit, usage).await;
        self.pump().await;
    }

    /// Applies a provider rate limit. Returns the end of the global backoff.
    ///
    /// Backoff and the benchmark freeze never stack: each keeps the later of its
    /// current and new deadline.
    pub fn on_rate_limited(&self, retry_after_ms: Option<u64>, kind: TaskKind) -> Timestamp {
        let now = self.clock.now_ms();
        let backoff_ms = retry_after_ms.unwrap_or(self.config.rate_limit_backoff_ms).clamp(
            self.config.min_rate_limit_backoff_ms,
            self.config
                .max_rate_limit_backoff_ms
                .max(self.config.min_rate_limit_backoff_ms),
        );
        let (backoff_until, frozen) = {
            let mut lanes = self.lanes();
            let until = now + backoff_ms as i64;
            let backoff_until = lanes.backoff_until_ts.map_or(until, |b| b.max(until));
            lanes.backoff_until_ts = Some(backoff_until);

            let mut frozen = Vec::new();
            if kind == TaskKind::Benchmark {
                let freeze = now + self.config.benchmark_freeze_ms as i64;
                let until_ts = lanes.frozen_until_ts.map_or(freeze, |f| f.max(freeze));
                lanes.frozen_until_ts = Some(until_ts);
                frozen = lanes
                    .extract(|w| w.request.kind == TaskKind::Benchmark)
                    .into_iter()
                    .map(|w| (w, until_ts))
                    .collect();
            }
            self.publish_pending(&lanes);
            (backoff_until, frozen)
        };

        for (waiter, until_ts) in frozen {
            self.metrics.slots_rejected.inc();
            let _ = waiter
                .reply
                .send(Err(AdmissionError::BenchmarkFrozen { until_ts }));
        }

        self.metrics.rate_limited.inc();
        info!(backoff_ms, kind = kind.as_str(), "Rate limited, admission backing off");
        self.arm_wake((backoff_until - now).max(0) as u64);
        backoff_until
    }

    /// Feeds an upstream response's headers to the budget ledger; a 429 also starts
    /// the provider cooldown and the global backoff.
    pub async fn on_response_headers(
        &self,
        provider: &str,
        model: Option<&str>,
        kind: TaskKind,
        status: u16,
        headers: &[(String, String)],
    ) {
        let now = self.clock.now_ms();
        let pairs = || headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));

        if let Some(budget) = self.budget.as_ref() {
            budget.update_from_headers(provider, model, pairs(), now).await;
        }
        if status != 429 {
            return;
        }

        let retry_after_ms = parse_retry_after(pairs(), now);
        if let Some(budget) = self.budget.as_ref() {
            budget
                .on_429(provider, model, retry_after_ms, std::iter::empty::<(&str, &str)>())
                .await;
        }
        self.on_rate_limited(retry_after_ms, kind);
    }

    /// Rejects every pending slot request of `job_id`. Returns how many were dropped.
    pub async fn cancel_job(&self, job_id: &JobId) -> usize {
        let cancelled = {
            let mut lanes = self.lanes();
            let cancelled = lanes.extract(|w| w.request.job_id.as_ref() == Some(job_id));
            self.publish_pending(&lanes);
            cancelled
        };

        let count = cancelled.len();
        self.metrics.slots_rejected.add(count as u64);
        for waiter in cancelled {
            let _ = waiter.reply.send(Err(AdmissionError::Cancelled {
                job_id: job_id.clone(),
            }));
        }
        if count > 0 {
            debug!(job_id = %job_id, count, "Cancelled pending slot requests");
            self.pump().await;
        }
        count
    }

    pub fn get_availability(&self) -> Availability {
        let now = self.clock.now_ms();
        let mut lanes = self.lanes();
        Availability {
            rpm_fraction: lanes.requests.fraction(now),
            tpm_fraction: lanes.tokens.fraction(now),
            requests_available: lanes.requests.available(now),
            tokens_available: lanes.tokens.available(now),
            high_pending: lanes.high.len(),
            low_pending: lanes.low.len(),
            backoff_until_ts: lanes.backoff_until_ts.filter(|until| *until > now),
            frozen_until_ts: lanes.frozen_until_ts.filter(|until| *until > now),
        }
    }

    /// Rejects every pending request and refuses new ones.
    pub fn shutdown(&self) {
        self.wake.cancel();
        let drained = {
            let mut lanes = self.lanes();
            lanes.closed = true;
            let drained = lanes.extract(|_| true);
            self.publish_pending(&lanes);
            drained
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "Admission closed with pending requests");
        }
        for waiter in drained {
            let _ = waiter.reply.send(Err(AdmissionError::Closed));
        }
    }

    fn arm_wake(&self, delay_ms: u64) {
        if self.lanes().closed {
            return;
        }
        let this = self.this.clone();
        self.wake
            .arm(Duration::from_millis(delay_ms), move || async move {
                if let Some(admission) = this.upgrade() {
                    admission.pump().await;
                }
            });
    }
}

impl Drop for AdmissionController {
    fn drop(&mut self) {
        self.wake.cancel();
    }
}
