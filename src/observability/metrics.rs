//! Local atomic metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Thread-safe atomic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Thread-safe atomic gauge.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Engine-wide counters shared by every component.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub ticks: Counter,
    pub ticks_skipped: Counter,
    pub steps: Counter,
    pub step_errors: Counter,
    pub retries_scheduled: Counter,
    pub jobs_failed: Counter,
    pub jobs_completed: Counter,
    pub jobs_cancelled: Counter,
    pub slots_granted: Counter,
    pub slots_rejected: Counter,
    pub rate_limited: Counter,
    pub budget_rejections: Counter,
    pub queue_depth: Gauge,
    pub lanes_pending: Gauge,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            ticks: self.ticks.get(),
            ticks_skipped: self.ticks_skipped.get(),
            steps: self.steps.get(),
            step_errors: self.step_errors.get(),
            retries_scheduled: self.retries_scheduled.get(),
            jobs_failed: self.jobs_failed.get(),
            jobs_completed: self.jobs_completed.get(),
            jobs_cancelled: self.jobs_cancelled.get(),
            slots_granted: self.slots_granted.get(),
            slots_rejected: self.slots_rejected.get(),
            rate_limited: self.rate_limited.get(),
            budget_rejections: self.budget_rejections.get(),
            queue_depth: self.queue_depth.get(),
            lanes_pending: self.lanes_pending.get(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSummary {
    pub ticks: u64,
    pub ticks_skipped: u64,
    pub steps: u64,
    pub step_errors: u64,
    pub retries_scheduled: u64,
    pub jobs_failed: u64,
    pub jobs_completed: u64,
    pub jobs_cancelled: u64,
    pub slots_granted: u64,
    pub slots_rejected: u64,
    pub rate_limited: u64,
    pub budget_rejections: u64,
    pub queue_depth: i64,
    pub lanes_pending: i64,
}
