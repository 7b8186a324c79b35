//! Core identifier types for the orchestrator.
//!
//! These types provide type-safe identifiers for projects, impressions
//! (content-addressed job records), execution sites and workflows.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Number of characters of an impression used for rule and directory names.
pub const SHORT_ID_LEN: usize = 7;

/// Identifier of the project that scopes jobs and workflows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectId(String);

/// Content-addressed identifier of one job record (an impression).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImpressionId(String);

/// Identifier of an execution site.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(String);

/// Unique identifier of a submitted workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(Uuid);

fn prefix(s: &str, len: usize) -> &str {
    match s.char_indices().nth(len) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl ProjectId {
    /// Create a new ProjectId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ImpressionId {
    /// Create a new ImpressionId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The short form used in rule names, markers and directories.
    pub fn short(&self) -> &str {
        prefix(&self.0, SHORT_ID_LEN)
    }

    /// Name of the job's private working directory inside a workflow.
    pub fn work_dir(&self) -> String {
        format!("imp{}", self.short())
    }

    /// Name of the build-script rule for this job.
    pub fn rule_name(&self) -> String {
        format!("step{}", self.short())
    }

    /// Completion marker written when the job's rule finishes.
    pub fn done_marker(&self) -> String {
        format!("{}.done", self.short())
    }
}

impl MachineId {
    /// Create a new MachineId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl WorkflowId {
    /// Generate a new random WorkflowId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a stored workflow identifier.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }

    /// Name under which the workflow is known to a remote engine.
    pub fn engine_name(&self, project: &ProjectId) -> String {
        let uuid = self.0.simple().to_string();
        format!("w-{}-{}", prefix(project.as_str(), 8), prefix(&uuid, 8))
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for ProjectId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ImpressionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ImpressionId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ImpressionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
