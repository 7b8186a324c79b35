//! JSON file storage implementation.
//!
//! Each record is one pretty-printed JSON object on disk. Records live on
//! storage shared between worker processes, which treat it as the single
//! source of truth; a process-local lock only serialises writers within
//! this process.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::Path;
use tokio::sync::Mutex;

use super::{MetadataStore, StorageError};

/// Storage backend keeping each record in its own JSON file.
#[derive(Debug, Default)]
pub struct JsonFileStore {
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    /// Create a new file-backed store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn load(record: &Path) -> Result<Map<String, Value>, StorageError> {
        let text = match tokio::fs::read_to_string(record).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StorageError::Io {
                    path: record.to_path_buf(),
                    source,
                });
            }
        };
        if text.trim().is_empty() {
            return Ok(Map::new());
        }
        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StorageError::Malformed {
                path: record.to_path_buf(),
                message: "top-level value is not an object".to_string(),
            }),
            Err(e) => Err(StorageError::Malformed {
                path: record.to_path_buf(),
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl MetadataStore for JsonFileStore {
    async fn read_variable(&self, record: &Path, key: &str) -> Result<Option<Value>, StorageError> {
        let mut map = Self::load(record).await?;
        Ok(map.remove(key))
    }

    async fn write_variable(
        &self,
        record: &Path,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut map = Self::load(record).await?;
        map.insert(key.to_string(), value);

        if let Some(parent) = record.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StorageError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let text = serde_json::to_string_pretty(&Value::Object(map))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        // Write-then-rename so concurrent readers never see a torn record.
        let tmp = record.with_extension("json.tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|source| StorageError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, record)
            .await
            .map_err(|source| StorageError::Io {
                path: record.to_path_buf(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("a/b/status.json");
        let store = JsonFileStore::new();

        store
            .write_variable(&record, "status", json!("waiting"))
            .await
            .unwrap();

        assert!(record.exists());
        let value = store.read_variable(&record, "status").await.unwrap();
        assert_eq!(value, Some(json!("waiting")));
    }

    #[tokio::test]
    async fn test_write_preserves_other_keys() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("config.json");
        std::fs::write(&record, r#"{"object_type": "task", "dependencies": ["x"]}"#).unwrap();
        let store = JsonFileStore::new();

        store
            .write_variable(&record, "machine_id", json!("m1"))
            .await
            .unwrap();

        let text = std::fs::read_to_string(&record).unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["object_type"], json!("task"));
        assert_eq!(value["dependencies"], json!(["x"]));
        assert_eq!(value["machine_id"], json!("m1"));
    }

    #[tokio::test]
    async fn test_missing_and_empty_records_read_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new();

        let missing = dir.path().join("missing.json");
        assert_eq!(store.read_variable(&missing, "k").await.unwrap(), None);

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "").unwrap();
        assert_eq!(store.read_variable(&empty, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_record_is_an_error() {
        let dir = TempDir::new().unwrap();
        let record = dir.path().join("bad.json");
        std::fs::write(&record, "[1, 2]").unwrap();
        let store = JsonFileStore::new();

        let result = store.read_variable(&record, "k").await;
        assert!(matches!(result, Err(StorageError::Malformed { .. })));
    }
}
