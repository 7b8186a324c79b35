//! Configuration error types.
//!
//! This module defines error types for settings loading and the site
//! registry.

use std::path::PathBuf;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file with context.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No home directory to derive the default state root from.
    #[error("cannot determine the home directory; set `root` explicitly")]
    NoHomeDir,

    /// A site name is not present in the registry.
    #[error("unknown site: {0}")]
    UnknownSite(String),

    /// A site name is already registered.
    #[error("site already registered: {0}")]
    DuplicateSite(String),

    /// Reading or writing the registry record failed.
    #[error("registry storage error: {0}")]
    Storage(#[from] StorageError),
}
