//! Cross-field validation of [`EngineConfig`].

use super::{ConfigError, ConfigResult, EngineConfig, ValidationErrors};

#[derive(Default)]
struct Checks {
    errors: Vec<ConfigError>,
}

impl Checks {
    fn fail(&mut self, key: &str, message: String) {
        self.errors.push(ConfigError::InvalidValue {
            key: key.to_string(),
            message,
        });
    }

    fn positive(&mut self, key: &str, value: u64) {
        if value == 0 {
            self.fail(key, "must be greater than 0".into());
        }
    }

    fn fraction(&mut self, key: &str, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            self.fail(key, format!("{value} is outside [0, 1]"));
        }
    }

    fn ordered(&mut self, min_key: &str, min: u64, max_key: &str, max: u64) {
        if min > max {
            self.fail(min_key, format!("{min} exceeds {max_key} ({max})"));
        }
    }

    fn finish(self) -> ConfigResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::ValidationErrors(ValidationErrors(self.errors)))
        }
    }
}

pub(super) fn validate(config: &EngineConfig) -> ConfigResult<()> {
    let mut checks = Checks::default();

    let job = &config.job;
    checks.positive("job.lease_ms", job.lease_ms);
    checks.positive("job.max_attempts", job.max_attempts.into());
    checks.positive("job.watchdog_no_progress_ms", job.watchdog_no_progress_ms);
    checks.ordered(
        "job.retry_after_min_ms",
        job.retry_after_min_ms,
        "job.retry_after_max_ms",
        job.retry_after_max_ms,
    );
    checks.ordered(
        "job.backoff.base_ms",
        job.backoff.base_ms,
        "job.backoff.max_ms",
        job.backoff.max_ms,
    );
    if !(job.backoff.factor.is_finite() && job.backoff.factor >= 1.0) {
        checks.fail("job.backoff.factor", format!("{} must be >= 1", job.backoff.factor));
    }
    checks.fraction("job.backoff.jitter", job.backoff.jitter);

    checks.positive("queue.active_weight", config.queue.active_weight.into());

    let scheduler = &config.scheduler;
    checks.positive("scheduler.max_jobs_per_tick", scheduler.max_jobs_per_tick as u64);
    checks.positive("scheduler.max_ms_per_tick", scheduler.max_ms_per_tick);
    checks.positive("scheduler.max_wake_delay_ms", scheduler.max_wake_delay_ms);
    checks.positive("scheduler.periodic_interval_ms", scheduler.periodic_interval_ms);

    let admission = &config.admission;
    checks.positive("admission.requests_per_window", admission.requests_per_window);
    checks.positive("admission.tokens_per_window", admission.tokens_per_window);
    checks.positive("admission.window_ms", admission.window_ms);
    checks.positive(
        "admission.high_backlog_threshold",
        admission.high_backlog_threshold as u64,
    );
    checks.fraction("admission.low_min_rpm_fraction", admission.low_min_rpm_fraction);
    checks.fraction("admission.low_min_tpm_fraction", admission.low_min_tpm_fraction);
    checks.ordered(
        "admission.min_rate_limit_backoff_ms",
        admission.min_rate_limit_backoff_ms,
        "admission.max_rate_limit_backoff_ms",
        admission.max_rate_limit_backoff_ms,
    );

    let budget = &config.budget;
    checks.ordered(
        "budget.min_lease_ms",
        budget.min_lease_ms,
        "budget.max_lease_ms",
        budget.max_lease_ms,
    );
    checks.ordered(
        "budget.min_cooldown_ms",
        budget.min_cooldown_ms,
        "budget.max_cooldown_ms",
        budget.max_cooldown_ms,
    );

    checks.finish()
}
