//! Exponential backoff for job retries.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
    /// Fractional jitter applied symmetrically (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            factor: 1.5,
            jitter: 0.2,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base_ms: f64,
    max_ms: f64,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base_ms: config.base_ms as f64,
            max_ms: config.max_ms as f64,
            factor: config.factor.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let clamped = (self.base_ms * self.factor.powi(exponent)).min(self.max_ms);

        let jittered = if self.jitter > 0.0 {
            let range = clamped * self.jitter;
            clamped + rand::random::<f64>() * range * 2.0 - range
        } else {
            clamped
        };

        jittered.max(0.0) as u64
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}
