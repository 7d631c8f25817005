//! Observability: structured tracing spans and local metrics.
//!
//! Every component logs through `tracing`; hosts install their own subscriber, or
//! enable the `subscriber` feature and call [`init_tracing`].

mod metrics;
mod spans;

pub use metrics::{Counter, EngineMetrics, Gauge, MetricsSummary};
pub use spans::{admission_span, step_span, tick_span};

/// Installs a formatting subscriber filtered by `RUST_LOG` (or `default_filter`).
///
/// Returns `false` if a global subscriber was already set.
#[cfg(feature = "subscriber")]
pub fn init_tracing(default_filter: &str) -> bool {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}
