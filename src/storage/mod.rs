//! Storage abstraction for job, workflow and site metadata.
//!
//! Every durable fact this crate reads or writes is a variable on a named
//! record: a JSON object addressed by its path under the state root. The
//! trait keeps the backends pluggable (JSON files on shared storage in
//! production, in-memory for tests).

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading or writing the record failed.
    #[error("i/o error on record '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The record exists but is not a JSON object.
    #[error("record '{path}' is malformed: {message}")]
    Malformed { path: PathBuf, message: String },

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),
}

/// Key/value access to named metadata records.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Read one variable of a record. Missing records and keys read as `None`.
    async fn read_variable(&self, record: &Path, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write one variable of a record, creating the record if needed.
    async fn write_variable(&self, record: &Path, key: &str, value: Value)
    -> Result<(), StorageError>;
}

/// Read a typed variable, falling back to `default` when it is absent.
pub async fn read_or<T: DeserializeOwned>(
    store: &dyn MetadataStore,
    record: &Path,
    key: &str,
    default: T,
) -> Result<T, StorageError> {
    match store.read_variable(record, key).await? {
        Some(Value::Null) | None => Ok(default),
        Some(value) => serde_json::from_value(value).map_err(|e| {
            StorageError::SerializationError(format!(
                "'{}' in '{}': {}",
                key,
                record.display(),
                e
            ))
        }),
    }
}

/// Serialize and write a typed variable.
pub async fn write<T: Serialize + ?Sized>(
    store: &dyn MetadataStore,
    record: &Path,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let value =
        serde_json::to_value(value).map_err(|e| StorageError::SerializationError(e.to_string()))?;
    store.write_variable(record, key, value).await
}
