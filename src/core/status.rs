//! Job and workflow status values and the job status transition rule.
//!
//! Status values arrive from an external engine that is not fully under
//! our control, so both enums keep unrecognised values verbatim instead of
//! rejecting them. The transition rule in [`transition`] decides which
//! observed values are allowed to overwrite a stored job status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default maximum length of an observed status accepted as a job status.
pub const DEFAULT_STATUS_GUARD_LEN: usize = 20;

/// Lifecycle status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum JobStatus {
    /// Never scheduled, or reset after an aborted run.
    Raw,
    /// Part of a run that is waiting for its inputs.
    Waiting,
    /// Queued by the engine.
    Pending,
    /// Submitted and executing.
    Running,
    /// Step reported success.
    Success,
    /// Outputs available.
    Finished,
    /// Failed, killed, or dispatch error.
    Failed,
    /// Stopped by the engine.
    Stopped,
    /// Deleted on the engine.
    Deleted,
    /// Archived by an external process.
    Archived,
    /// Engine reported something we could not store.
    Unknown,
    /// Any other short value reported by the engine.
    Other(String),
}

impl JobStatus {
    /// Parse a stored or observed status string.
    pub fn parse(s: &str) -> Self {
        match s {
            "raw" => JobStatus::Raw,
            "waiting" => JobStatus::Waiting,
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "success" => JobStatus::Success,
            "finished" => JobStatus::Finished,
            "failed" => JobStatus::Failed,
            "stopped" => JobStatus::Stopped,
            "deleted" => JobStatus::Deleted,
            "archived" => JobStatus::Archived,
            "unknown" => JobStatus::Unknown,
            other => JobStatus::Other(other.to_string()),
        }
    }

    /// The stored string form.
    pub fn as_str(&self) -> &str {
        match self {
            JobStatus::Raw => "raw",
            JobStatus::Waiting => "waiting",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Finished => "finished",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
            JobStatus::Deleted => "deleted",
            JobStatus::Archived => "archived",
            JobStatus::Unknown => "unknown",
            JobStatus::Other(s) => s,
        }
    }

    /// Terminal statuses are never overwritten by a status sync.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Success | JobStatus::Failed
        )
    }

    /// Jobs in these statuses are not expanded during DAG assembly.
    pub fn blocks_expansion(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished
                | JobStatus::Failed
                | JobStatus::Pending
                | JobStatus::Running
                | JobStatus::Archived
        )
    }

    /// Whether an input job in this status satisfies the dependency wait.
    pub fn is_available(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Archived)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        JobStatus::parse(&s)
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a submitted workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowStatus {
    /// No status recorded yet.
    Unknown,
    /// Materialised and waiting for out-of-band execution.
    Ready,
    /// Executing.
    Running,
    /// All steps completed.
    Finished,
    /// At least one step failed.
    Failed,
    /// Stopped on request.
    Killed,
    /// Engine specific value (created, queued, ...).
    Other(String),
}

impl WorkflowStatus {
    /// Parse a stored or observed status string.
    pub fn parse(s: &str) -> Self {
        match s {
            "unknown" => WorkflowStatus::Unknown,
            "ready" => WorkflowStatus::Ready,
            "running" => WorkflowStatus::Running,
            "finished" => WorkflowStatus::Finished,
            "failed" => WorkflowStatus::Failed,
            "killed" => WorkflowStatus::Killed,
            other => WorkflowStatus::Other(other.to_string()),
        }
    }

    /// The stored string form.
    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStatus::Unknown => "unknown",
            WorkflowStatus::Ready => "ready",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Finished => "finished",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Killed => "killed",
            WorkflowStatus::Other(s) => s,
        }
    }

    /// Whether the workflow can no longer change status on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Finished | WorkflowStatus::Failed | WorkflowStatus::Killed
        )
    }
}

impl From<String> for WorkflowStatus {
    fn from(s: String) -> Self {
        WorkflowStatus::parse(&s)
    }
}

impl From<WorkflowStatus> for String {
    fn from(status: WorkflowStatus) -> Self {
        status.as_str().to_string()
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Length guard applied to observed step statuses before they are stored.
///
/// Values at or above the limit are treated as garbled (typically an error
/// payload that ended up in the status field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusGuard {
    max_len: usize,
}

impl StatusGuard {
    /// Create a guard accepting values shorter than `max_len` characters.
    pub fn new(max_len: usize) -> Self {
        Self { max_len }
    }

    /// Whether the observed value is short enough to store.
    pub fn accepts(&self, observed: &str) -> bool {
        observed.chars().count() < self.max_len
    }
}

impl Default for StatusGuard {
    fn default() -> Self {
        Self::new(DEFAULT_STATUS_GUARD_LEN)
    }
}

/// Compute the job status to write after observing a step and workflow.
///
/// Returns `None` when the stored status must stay as it is.
pub fn transition(
    current: &JobStatus,
    observed_step: &str,
    observed_workflow: &WorkflowStatus,
    guard: StatusGuard,
) -> Option<JobStatus> {
    match current {
        JobStatus::Raw => guard
            .accepts(observed_step)
            .then(|| JobStatus::parse(observed_step)),
        JobStatus::Running => match observed_step {
            "success" => Some(JobStatus::Success),
            "finished" => Some(JobStatus::Finished),
            "failed" | "stopped" => Some(JobStatus::Failed),
            _ if *observed_workflow == WorkflowStatus::Failed => Some(JobStatus::Failed),
            _ => None,
        },
        JobStatus::Stopped | JobStatus::Deleted => Some(JobStatus::Failed),
        JobStatus::Finished | JobStatus::Success | JobStatus::Failed => None,
        _ => {
            if guard.accepts(observed_step) {
                Some(JobStatus::parse(observed_step))
            } else {
                Some(JobStatus::Unknown)
            }
        }
    }
}
