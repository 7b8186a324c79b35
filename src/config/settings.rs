//! Global settings and the on-disk layout derived from them.
//!
//! # Example
//!
//! ```yaml
//! root: /srv/impress
//! poll:
//!   max_attempts: 60
//!   delay_secs: 10
//! status_guard_len: 20
//! status_cache_ttl_ms: 1000
//! default_image: docker.io/reanahub/reana-env-root6:6.18.04
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::error::ConfigError;
use crate::core::{
    DEFAULT_STATUS_GUARD_LEN, DEFAULT_STATUS_TTL, ImpressionId, PollPolicy, ProjectId,
    StatusGuard, WorkflowId,
};

/// Baseline container image used for bookkeeping rules and input jobs.
pub const DEFAULT_IMAGE: &str = "docker.io/reanahub/reana-env-root6:6.18.04";

/// Name of the state directory created under the home directory.
const DEFAULT_ROOT_DIR: &str = ".impress";

/// Global settings for one worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// State root holding job, workflow and registry records.
    pub root: Option<PathBuf>,

    /// Dependency wait bound and delay.
    pub poll: PollPolicy,

    /// Observed statuses at or above this length are not stored.
    pub status_guard_len: usize,

    /// Lifetime of a cached workflow status in milliseconds.
    pub status_cache_ttl_ms: u64,

    /// Container image for bookkeeping rules and input jobs.
    pub default_image: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            root: None,
            poll: PollPolicy::default(),
            status_guard_len: DEFAULT_STATUS_GUARD_LEN,
            status_cache_ttl_ms: DEFAULT_STATUS_TTL.as_millis() as u64,
            default_image: DEFAULT_IMAGE.to_string(),
        }
    }
}

impl Settings {
    /// Parse settings from a YAML string.
    pub fn parse_str(yaml: &str) -> Result<Self, ConfigError> {
        let settings: Settings = serde_yaml::from_str(yaml).map_err(ConfigError::YamlError)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a YAML file.
    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let settings: Settings =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source: e,
            })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Builder: set the state root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Builder: set the polling policy.
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "poll.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.status_guard_len == 0 {
            return Err(ConfigError::InvalidConfig(
                "status_guard_len must be at least 1".to_string(),
            ));
        }
        if self.default_image.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "default_image must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The state root, falling back to `$HOME/.impress`.
    pub fn resolve_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.root {
            Some(root) => Ok(root.clone()),
            None => home::home_dir()
                .map(|home| home.join(DEFAULT_ROOT_DIR))
                .ok_or(ConfigError::NoHomeDir),
        }
    }

    /// Resolve the on-disk layout.
    pub fn layout(&self) -> Result<Layout, ConfigError> {
        Ok(Layout::new(self.resolve_root()?))
    }

    /// The configured status length guard.
    pub fn status_guard(&self) -> StatusGuard {
        StatusGuard::new(self.status_guard_len)
    }

    /// The configured status cache lifetime.
    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }
}

/// Paths of every record under the state root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The state root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Site registry record.
    pub fn registry_record(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Root of the job records, `Storage/`.
    pub fn storage_root(&self) -> PathBuf {
        self.root.join("Storage")
    }

    /// Directory of one job (impression).
    pub fn job_dir(&self, project: &ProjectId, impression: &ImpressionId) -> PathBuf {
        self.storage_root()
            .join(project.as_str())
            .join(impression.as_str())
    }

    /// Directory of one workflow's records.
    pub fn workflow_dir(&self, project: &ProjectId, workflow: &WorkflowId) -> PathBuf {
        self.root
            .join("Workflows")
            .join(project.as_str())
            .join(workflow.to_string())
    }

    /// Execution tree materialised by the local backend.
    pub fn local_workflow_dir(&self, workflow: &WorkflowId) -> PathBuf {
        self.root.join("LocalWorkflows").join(workflow.to_string())
    }
}
