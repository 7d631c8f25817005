//! Engine configuration.
//!
//! Every tunable lives in [`EngineConfig`], grouped per component. Sources layer in
//! order: defaults, a JSON file, then environment overrides.
//!
//! ```rust,no_run
//! use tabq::config::EngineConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = EngineConfig::from_file("tabq.json").await?;
//! config.apply_env("TABQ_")?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

mod env;
mod validator;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::admission::AdmissionConfig;
use crate::budget::BudgetConfig;
use crate::job::JobConfig;
use crate::queue::QueueConfig;
use crate::scheduler::SchedulerConfig;

pub use env::DEFAULT_ENV_PREFIX;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

const SECTIONS: [&str; 5] = ["job", "queue", "scheduler", "admission", "budget"];

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub job: JobConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub admission: AdmissionConfig,
    pub budget: BudgetConfig,
}

impl EngineConfig {
    /// Parses a (possibly partial) JSON document; missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON file. A missing file yields the defaults.
    pub async fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json_str(&content)
    }

    /// Applies `<PREFIX><KEY>` environment variables. Returns how many were applied.
    ///
    /// See [`EngineConfig::apply_overrides`] for the key format.
    pub fn apply_env(&mut self, prefix: &str) -> ConfigResult<usize> {
        self.apply_overrides(env::prefixed_vars(prefix, std::env::vars()))
    }

    /// Applies `(key, raw value)` overrides.
    ///
    /// A key is either qualified (`job__lease_ms`, `job__backoff__base_ms`) or a bare
    /// field name (`lease_ms`) resolved against the sections in declaration order.
    /// Unknown keys are skipped with a warning; a value that does not fit its field
    /// fails the whole batch.
    pub fn apply_overrides<I>(&mut self, overrides: I) -> ConfigResult<usize>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = serde_json::to_value(&*self)?;
        let mut applied = 0;

        for (key, raw) in overrides {
            let Some(path) = resolve_path(&root, &key) else {
                warn!(key = %key, "Ignoring unknown configuration override");
                continue;
            };
            let Some(slot) = root.pointer_mut(&path) else {
                continue;
            };
            *slot = env::parse_value(&raw);
            applied += 1;

            // Checked per key so the error names the offending override.
            serde_json::from_value::<EngineConfig>(root.clone()).map_err(|e| {
                ConfigError::InvalidValue {
                    key: key.clone(),
                    message: e.to_string(),
                }
            })?;
        }

        *self = serde_json::from_value(root)?;
        Ok(applied)
    }

    /// Checks cross-field constraints the types cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        validator::validate(self)
    }
}

/// JSON pointer for an override key, if it names an existing leaf.
fn resolve_path(root: &Value, key: &str) -> Option<String> {
    let key = key.trim().to_ascii_lowercase();
    if key.is_empty() {
        return None;
    }
    let segments: Vec<&str> = key.split("__").collect();

    let qualified = format!("/{}", segments.join("/"));
    if segments.len() > 1 && is_leaf(root.pointer(&qualified)) {
        return Some(qualified);
    }
    if segments.len() != 1 {
        return None;
    }

    let field = segments[0];
    SECTIONS.iter().find_map(|section| {
        let direct = format!("/{section}/{field}");
        if is_leaf(root.pointer(&direct)) {
            return Some(direct);
        }
        // One level of nesting, e.g. `job.backoff.base_ms`.
        root.get(section)?.as_object()?.iter().find_map(|(name, value)| {
            value
                .get(field)
                .filter(|leaf| !leaf.is_object())
                .map(|_| format!("/{section}/{name}/{field}"))
        })
    })
}

fn is_leaf(value: Option<&Value>) -> bool {
    value.is_some_and(|v| !v.is_object())
}
