//! Workflows: durable records, build scripts, orchestration and collection.

mod collect;
mod orchestrator;
mod records;
mod script;

pub use collect::{Collector, ImpressionStatus, Placement};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use records::{DESCRIPTOR_FILE, SCRIPT_FILE, WorkflowRecords, WorkflowStore, step_duration};
pub use script::{BuildScript, ENGINE_TYPE, FINALIZE_MARKER, SETUP_RULE, WorkflowDescriptor};

use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::core::{ImpressionId, JobError};
use crate::storage::StorageError;

/// Errors raised while running or inspecting workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The job graph could not be assembled or compiled.
    #[error("workflow construction failed: {0}")]
    Construction(String),

    /// Input jobs did not finish within the polling budget.
    #[error("{} input jobs unfinished after {attempts} attempts", unfinished.len())]
    DependencyTimeout {
        attempts: u32,
        unfinished: Vec<ImpressionId>,
    },

    /// The backend refused the workflow.
    #[error("submission failed: {0}")]
    BackendSubmission(#[source] BackendError),

    /// The backend could not report on the workflow.
    #[error("status sync failed: {0}")]
    StatusSync(#[source] BackendError),

    /// The request cannot start a run.
    #[error("workflow cannot run: {0}")]
    NotRunnable(String),

    /// Backend error outside submission.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Job record error.
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Site registry error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
