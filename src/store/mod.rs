//! Durable key-value storage backends.
//!
//! Components persist whole JSON documents under a small set of keys and always
//! re-normalize what they read back, so a backend only has to provide get/set/delete.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Key holding every [`crate::job::Job`] document.
pub const JOBS_KEY: &str = "jobs";
/// Key holding the fair queue state.
pub const QUEUE_STATE_KEY: &str = "queue_state";
/// Key holding the reservation ledger.
pub const BUDGET_STATE_KEY: &str = "budget_state";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key: {key}")]
    InvalidKey { key: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Whole-document key-value store.
#[async_trait::async_trait]
pub trait KeyValueStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;
}

/// Reads a document, treating backend failures as an absent value.
///
/// Callers normalize whatever comes back, so a failed read degrades to defaults
/// instead of aborting the operation.
pub(crate) async fn read_or_default(store: &dyn KeyValueStore, key: &str) -> Value {
    match store.get(key).await {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::warn!(store = store.name(), key, error = %e, "Store read failed, using defaults");
            Value::Null
        }
    }
}

/// Writes a document, logging instead of propagating failures.
pub(crate) async fn write_logged(store: &dyn KeyValueStore, key: &str, value: Value) -> bool {
    match store.set(key, value).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(store = store.name(), key, error = %e, "Store write failed");
            false
        }
    }
}

/// Store factory for creating backends
pub struct StoreFactory;

impl StoreFactory {
    pub fn file(dir: impl Into<std::path::PathBuf>) -> Arc<dyn KeyValueStore> {
        Arc::new(JsonFileStore::new(dir))
    }
}
