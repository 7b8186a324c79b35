//! Core domain types: identifiers, statuses, jobs and the algorithms over
//! them (assembly, compilation, polling).

pub mod cache;
pub mod compiler;
pub mod dag;
pub mod job;
pub mod poll;
pub mod status;
pub mod types;

pub use cache::{Clock, DEFAULT_STATUS_TTL, StatusCache, SystemClock};
pub use compiler::{Compiler, Resources, SETUP_MARKER, StepSpec};
pub use dag::{Assembler, DagError, rule_dependencies};
pub use job::{
    BuildSpec, DEFAULT_BUILD_MEMORY, DEFAULT_COMPUTE_BACKEND, DEFAULT_TASK_MEMORY,
    EXTERNAL_COMPUTE_BACKEND, ImpressionStore, Job, JobError, JobKind, JobSource, JobSpec,
    Manifest, RAWDATA_ENVIRONMENT, SCRIPT_ENVIRONMENT, TaskSpec,
};
pub use poll::PollPolicy;
pub use status::{
    DEFAULT_STATUS_GUARD_LEN, JobStatus, StatusGuard, WorkflowStatus, transition,
};
pub use types::{ImpressionId, MachineId, ProjectId, WorkflowId};
