//! JSON file store.
//!
//! One `<key>.json` document per key inside a base directory. Writes go to a temp
//! file that is renamed over the target, so a crash mid-write leaves either the old
//! or the new document, never a torn one.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::Mutex;

use super::{KeyValueStore, StoreError, StoreResult};

#[derive(Debug)]
pub struct JsonFileStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.base_dir.join(format!("{key}.json")))
    }
}

#[async_trait::async_trait]
impl KeyValueStore for JsonFileStore {
    fn name(&self) -> &str {
        "json-file"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        let path = self.path_for(key)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                // A torn or hand-edited document reads as absent; callers reset to defaults.
                tracing::warn!(path = %path.display(), error = %e, "Discarding unreadable document");
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        let path = self.path_for(key)?;
        let bytes = serde_json::to_vec(&value)?;

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.base_dir).await?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("state"));

        assert!(store.get("budget_state").await.unwrap().is_none());
        store
            .set("budget_state", json!({"byProvider": {}}))
            .await
            .unwrap();
        assert_eq!(
            store.get("budget_state").await.unwrap(),
            Some(json!({"byProvider": {}}))
        );
        assert!(store.delete("budget_state").await.unwrap());
        assert!(!store.delete("budget_state").await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path());
        let err = store.set("../escape", json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_file_store_corrupt_document_reads_as_absent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("jobs.json"), b"{\"half\": ").unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.get("jobs").await.unwrap().is_none());
    }
}
