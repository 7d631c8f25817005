//! Job error taxonomy.
//!
//! Every failure that reaches a job is expressed as a [`JobError`] carrying an
//! [`ErrorCode`]. The code decides whether recovery may schedule a retry and is what
//! the UI-facing `message` shows.

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    LeaseExpired,
    LeaseExpiredNoRecovery,
    NoProgressWatchdog,
    TabGone,
    Network,
    Timeout,
    RateLimited,
    UpstreamUnavailable,
    BudgetExhausted,
    Cancelled,
    StepFailed,
    /// Code assigned by a collaborator (request builder, transport, planner).
    Collaborator(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::LeaseExpiredNoRecovery => "LEASE_EXPIRED_NO_RECOVERY",
            Self::NoProgressWatchdog => "NO_PROGRESS_WATCHDOG",
            Self::TabGone => "TAB_GONE",
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::RateLimited => "RATE_LIMITED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::BudgetExhausted => "BUDGET_EXHAUSTED",
            Self::Cancelled => "CANCELLED",
            Self::StepFailed => "STEP_FAILED",
            Self::Collaborator(code) => code,
        }
    }

    /// Whether recovery may schedule another attempt for this code.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::LeaseExpired
                | Self::NoProgressWatchdog
                | Self::Network
                | Self::Timeout
                | Self::RateLimited
                | Self::UpstreamUnavailable
                | Self::StepFailed
        )
    }

    /// Code recorded when a retryable error runs out of attempts or time.
    pub fn exhausted(&self) -> ErrorCode {
        match self {
            Self::LeaseExpired => Self::LeaseExpiredNoRecovery,
            other => other.clone(),
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error attached to a job's runtime record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(default)]
    pub at_ts: Timestamp,
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>, at_ts: Timestamp) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after_ms: None,
            at_ts,
        }
    }

    /// Retry-after hint supplied by the upstream provider.
    pub fn with_retry_after(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }

    pub fn rate_limited(retry_after_ms: Option<u64>, at_ts: Timestamp) -> Self {
        Self {
            code: ErrorCode::RateLimited,
            message: "upstream rate limit".into(),
            retry_after_ms,
            at_ts,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// UI-facing text; always leads with the taxonomy code.
    pub fn display_message(&self) -> String {
        if self.message.is_empty() {
            self.code.to_string()
        } else {
            format!("{}: {}", self.code, self.message)
        }
    }
}
