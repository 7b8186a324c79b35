//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use super::{MetadataStore, StorageError};

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<PathBuf, Map<String, Value>>>,
}

impl InMemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a whole record, if it exists.
    pub fn record(&self, record: &Path) -> Option<Map<String, Value>> {
        self.records.read().ok()?.get(record).cloned()
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether no record has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn read_variable(&self, record: &Path, key: &str) -> Result<Option<Value>, StorageError> {
        let records = self.records.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(records.get(record).and_then(|r| r.get(key)).cloned())
    }

    async fn write_variable(
        &self,
        record: &Path,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        let mut records = self
            .records
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        records
            .entry(record.to_path_buf())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }
}
