//! impress - DAG batch orchestration of container builds and tasks.
//!
//! Jobs form a dependency graph stored on disk. A workflow takes the
//! transitive closure of a set of root jobs, waits for jobs already
//! running elsewhere, compiles every job into a step of a generated build
//! script, and hands the result to the execution site the workflow is bound
//! to: a remote workflow engine, or a local tree for manual execution.
//!
//! # Example
//!
//! ```no_run
//! use impress::{
//!     ImpressionId, ImpressionStore, JsonFileStore, MachineId, MetadataStore, Orchestrator,
//!     ProjectId, Settings, SiteBackends, SiteRegistry, WorkflowStore,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::default();
//! let layout = settings.layout()?;
//! let store: Arc<dyn MetadataStore> = Arc::new(JsonFileStore::new());
//!
//! let source = Arc::new(ImpressionStore::new(
//!     layout.storage_root(),
//!     store.clone(),
//!     settings.default_image.clone(),
//! ));
//! let registry = SiteRegistry::new(store.clone(), layout.registry_record());
//! let orchestrator = Orchestrator::new(
//!     source,
//!     WorkflowStore::new(layout, store),
//!     Arc::new(SiteBackends::new(registry)),
//! );
//!
//! let outcome = orchestrator
//!     .run(
//!         &ProjectId::new("project"),
//!         &[ImpressionId::new("0123456789abcdef0123456789abcdef")],
//!         &MachineId::new("machine"),
//!     )
//!     .await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod core;
pub mod storage;
pub mod testing;
pub mod workflow;

pub use backend::{
    Backend, BackendError, BackendProvider, EngineClient, HttpEngineClient, LocalBackend,
    RemoteBackend, SiteBackends, TransferReport,
};
pub use config::{BackendKind, ConfigError, Layout, Settings, Site, SiteRegistry};
pub use core::{
    Assembler, Compiler, DagError, ImpressionId, ImpressionStore, Job, JobError, JobKind,
    JobSource, JobStatus, MachineId, PollPolicy, ProjectId, StatusCache, StepSpec, WorkflowId,
    WorkflowStatus,
};
pub use storage::{InMemoryStore, JsonFileStore, MetadataStore, StorageError};
pub use workflow::{
    Collector, ImpressionStatus, Orchestrator, RunOutcome, WorkflowError, WorkflowRecords,
    WorkflowStore,
};
