//! Durable per-provider reservation ledger.
//!
//! Remaining quota comes from provider headers; outstanding reservations are
//! short-lived [`Grant`] leases, so a crash before release only costs a lease
//! period and never needs a recovery sweep.

mod headers;
mod ledger;
mod state;

pub use headers::{parse_duration_ms, parse_quota_headers, parse_retry_after};
pub use ledger::{BudgetStore, RejectReason, ReleaseRequest, ReserveRequest, ReserveResult};
pub use state::{BudgetState, Grant, ProviderBudget, QuotaWindow, normalize};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub default_lease_ms: u64,
    pub min_lease_ms: u64,
    pub max_lease_ms: u64,
    pub default_cooldown_ms: u64,
    pub min_cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// Upper bound of the random jitter added to every cooldown.
    pub cooldown_jitter_ms: u64,
    /// Floor for any `wait_ms` handed back on rejection.
    pub min_wait_ms: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: 60_000,
            min_lease_ms: 10_000,
            max_lease_ms: 180_000,
            default_cooldown_ms: 30_000,
            min_cooldown_ms: 250,
            max_cooldown_ms: 15 * 60_000,
            cooldown_jitter_ms: 250,
            min_wait_ms: 250,
        }
    }
}

impl BudgetConfig {
    pub fn clamp_lease(&self, lease_ms: Option<u64>) -> u64 {
        lease_ms
            .unwrap_or(self.default_lease_ms)
            .clamp(self.min_lease_ms, self.max_lease_ms.max(self.min_lease_ms))
    }

    pub fn clamp_cooldown(&self, retry_after_ms: Option<u64>) -> u64 {
        retry_after_ms
            .unwrap_or(self.default_cooldown_ms)
            .clamp(self.min_cooldown_ms, self.max_cooldown_ms.max(self.min_cooldown_ms))
    }
}
