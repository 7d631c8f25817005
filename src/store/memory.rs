//! In-memory store (for tests and hosts without durable storage).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use super::{KeyValueStore, StoreResult};

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    documents: Arc<RwLock<HashMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn clear(&self) {
        self.documents.write().await.clear();
    }
}

#[async_trait::async_trait]
impl KeyValueStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.documents.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.documents.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.documents.write().await.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        store.set("queue_state", json!({"tenantCursor": 2})).await.unwrap();

        let loaded = store.get("queue_state").await.unwrap();
        assert_eq!(loaded, Some(json!({"tenantCursor": 2})));
        assert_eq!(store.count().await, 1);

        assert!(store.delete("queue_state").await.unwrap());
        assert!(store.get("queue_state").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_clones_share_documents() {
        let store = MemoryStore::new();
        let other = store.clone();
        store.set("jobs", json!({})).await.unwrap();
        assert!(other.get("jobs").await.unwrap().is_some());
    }
}
