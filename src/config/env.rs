//! Environment variable overrides.
//!
//! `TABQ_LEASE_MS=30000` sets `job.lease_ms`; `TABQ_JOB__BACKOFF__BASE_MS=500` names
//! the field by its full path. Values are read as JSON when they parse, otherwise as
//! plain strings.

use serde_json::Value;

pub const DEFAULT_ENV_PREFIX: &str = "TABQ_";

/// Strips `prefix` from matching variable names, lowercasing the remainder.
pub(super) fn prefixed_vars<I>(prefix: &str, vars: I) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    vars.into_iter()
        .filter_map(|(name, value)| {
            let key = name.strip_prefix(prefix)?;
            (!key.is_empty()).then(|| (key.to_ascii_lowercase(), value))
        })
        .collect()
}

pub(super) fn parse_value(raw: &str) -> Value {
    let raw = raw.trim();
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
