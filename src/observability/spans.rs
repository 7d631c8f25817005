//! Structured span definitions for tracing.

use tracing::{Level, Span, span};

use crate::ids::{JobId, TenantId};

pub fn tick_span(reason: &str) -> Span {
    span!(
        Level::INFO,
        "scheduler.tick",
        reason = reason,
        processed = tracing::field::Empty,
        otel.name = "scheduler.tick",
    )
}

pub fn step_span(job_id: &JobId, tenant_id: &TenantId, reason: &str) -> Span {
    span!(
        Level::INFO,
        "job.step",
        job_id = %job_id,
        tenant_id = %tenant_id,
        reason = reason,
        otel.name = "job.step",
    )
}

pub fn admission_span(kind: &str, priority: &str) -> Span {
    span!(
        Level::DEBUG,
        "admission.reserve",
        kind = kind,
        priority = priority,
        otel.name = "admission.reserve",
    )
}
