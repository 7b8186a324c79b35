//! Execution strategies for workflows.
//!
//! A [`Backend`] turns the artifacts of a committed workflow (its jobs,
//! build script and descriptor) into an execution, and later reports on
//! it. Two strategies exist:
//!
//! - [`RemoteBackend`] submits to a remote workflow engine through an
//!   [`EngineClient`] and polls it.
//! - [`LocalBackend`] materialises the same tree on disk for an external
//!   tool to run out of band.
//!
//! Which strategy serves a workflow is decided per machine by the site
//! registry ([`SiteBackends`]).

pub mod client;
mod local;
mod remote;

pub use client::{EngineClient, HttpEngineClient, RemoteFile};
pub use local::LocalBackend;
pub use remote::RemoteBackend;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::config::{BackendKind, ConfigError, Site, SiteRegistry};
use crate::core::{ImpressionId, Job, JobStatus, MachineId, WorkflowStatus};
use crate::storage::StorageError;
use crate::workflow::{WorkflowDescriptor, WorkflowRecords};

/// Errors raised by execution strategies.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The engine rejected a request.
    #[error("engine request '{operation}' failed: {message}")]
    Request { operation: String, message: String },

    /// The engine could not be reached.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A status poll failed. The next poll retries.
    #[error("status sync failed: {0}")]
    StatusSync(String),

    /// Moving one artifact failed.
    #[error("transfer of '{path}' failed: {message}")]
    Transfer { path: String, message: String },

    /// Local file system failure.
    #[error("i/o error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Metadata store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Site lookup failure.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// A descriptor could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl BackendError {
    /// Whether the operation may simply be retried later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BackendError::StatusSync(_) | BackendError::Transfer { .. }
        )
    }

    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> BackendError + '_ {
        move |source| BackendError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Everything a backend needs to dispatch a workflow.
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Jobs of the workflow in execution order.
    pub jobs: &'a [Job],
    /// Descriptor of the build script.
    pub descriptor: &'a WorkflowDescriptor,
}

/// Artifact classes collected from a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Artifact {
    /// The job's stage-out tree.
    Outputs,
    /// The job's log directory.
    Logs,
}

impl Artifact {
    /// Directory name inside a job's working directory.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Artifact::Outputs => "stageout",
            Artifact::Logs => "logs",
        }
    }

    /// Marker written once every file of the class has been collected.
    pub fn marker(&self) -> &'static str {
        match self {
            Artifact::Outputs => "stageout.downloaded",
            Artifact::Logs => "logs.downloaded",
        }
    }
}

/// Outcome of one collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// Files copied.
    pub transferred: usize,
    /// Files that failed and were skipped.
    pub failed: usize,
    /// Classes skipped because they were already collected.
    pub skipped: usize,
}

impl TransferReport {
    /// Report of a class that was already collected.
    pub fn already_collected() -> Self {
        Self {
            skipped: 1,
            ..Self::default()
        }
    }

    /// Whether every attempted file made it.
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Add another report into this one.
    pub fn merge(&mut self, other: TransferReport) {
        self.transferred += other.transferred;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// An execution strategy bound to one workflow.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Records of the workflow this backend serves.
    fn records(&self) -> &WorkflowRecords;

    /// Strategy name.
    fn kind(&self) -> BackendKind;

    /// Dispatch the workflow. The build script is already written.
    async fn submit(&self, submission: Submission<'_>) -> Result<(), BackendError>;

    /// Refresh the workflow's status record from the authoritative source.
    async fn update_workflow_status(&self) -> Result<(), BackendError>;

    /// Last recorded workflow status.
    async fn status(&self) -> Result<WorkflowStatus, BackendError> {
        Ok(self.records().status().await?)
    }

    /// Reconcile the stored status of a job owned by this workflow.
    ///
    /// Reads only the last recorded status; callers refresh the workflow
    /// with [`Backend::update_workflow_status`] first, once per workflow.
    async fn sync_external_job_status(&self, job: &Job) -> Result<Option<JobStatus>, BackendError> {
        Ok(self.records().sync_job(job).await?)
    }

    /// Ask the execution to stop. Best effort; does not touch job records.
    async fn kill(&self) -> Result<(), BackendError>;

    /// Collect the stage-out tree of `impression`.
    async fn download_outputs(&self, impression: &ImpressionId)
    -> Result<TransferReport, BackendError>;

    /// Collect the logs of `impression`.
    async fn download_logs(&self, impression: &ImpressionId) -> Result<TransferReport, BackendError>;

    /// Collect outputs and logs of `impression`.
    async fn download(&self, impression: &ImpressionId) -> Result<TransferReport, BackendError> {
        let mut report = self.download_outputs(impression).await?;
        report.merge(self.download_logs(impression).await?);
        Ok(report)
    }

    /// Whether the execution side is reachable.
    async fn ping(&self) -> Result<bool, BackendError>;
}

/// Opens the backend serving a workflow.
#[async_trait]
pub trait BackendProvider: Send + Sync {
    /// Site configuration of `machine`.
    async fn site(&self, machine: &MachineId) -> Result<Site, BackendError>;

    /// Backend serving the workflow behind `records`.
    async fn open(&self, records: WorkflowRecords) -> Result<Box<dyn Backend>, BackendError>;
}

/// Builds the engine client of a remote site.
pub type EngineFactory = Arc<dyn Fn(&Site) -> Arc<dyn EngineClient> + Send + Sync>;

/// [`BackendProvider`] choosing the strategy from the site registry.
#[derive(Clone)]
pub struct SiteBackends {
    registry: SiteRegistry,
    engines: EngineFactory,
}

impl SiteBackends {
    /// Create a provider talking HTTP to remote sites.
    pub fn new(registry: SiteRegistry) -> Self {
        Self {
            registry,
            engines: Arc::new(|site: &Site| {
                Arc::new(HttpEngineClient::new(&site.url, &site.token)) as Arc<dyn EngineClient>
            }),
        }
    }

    /// Builder: replace how engine clients are built.
    pub fn with_engine_factory(mut self, engines: EngineFactory) -> Self {
        self.engines = engines;
        self
    }

    pub fn registry(&self) -> &SiteRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for SiteBackends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteBackends")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl BackendProvider for SiteBackends {
    async fn site(&self, machine: &MachineId) -> Result<Site, BackendError> {
        Ok(self.registry.site(machine).await?)
    }

    async fn open(&self, records: WorkflowRecords) -> Result<Box<dyn Backend>, BackendError> {
        let site = self.registry.site(records.machine()).await?;
        Ok(match site.kind {
            BackendKind::Remote => {
                let engine = (self.engines)(&site);
                Box::new(RemoteBackend::new(records, engine))
            }
            BackendKind::Local => Box::new(LocalBackend::new(records)),
        })
    }
}

/// Regular files directly inside `dir`. A missing directory has none.
pub(crate) async fn dir_files(dir: &Path) -> Result<Vec<PathBuf>, BackendError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BackendError::io(dir)(e)),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(BackendError::io(dir))? {
        let path = entry.path();
        let file_type = entry.file_type().await.map_err(BackendError::io(&path))?;
        if file_type.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Copy one file, creating the destination's parent directories.
pub(crate) async fn copy_file(src: &Path, dst: &Path) -> Result<(), BackendError> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(BackendError::io(parent))?;
    }
    tokio::fs::copy(src, dst)
        .await
        .map_err(BackendError::io(src))?;
    Ok(())
}

/// Write bytes to `path`, creating parent directories.
pub(crate) async fn write_file(path: &Path, content: &[u8]) -> Result<(), BackendError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(BackendError::io(parent))?;
    }
    tokio::fs::write(path, content)
        .await
        .map_err(BackendError::io(path))
}

/// Copy every file of `src` into `dst`, logging and counting failures.
pub(crate) async fn copy_dir_files(src: &Path, dst: &Path) -> Result<TransferReport, BackendError> {
    let mut report = TransferReport::default();
    for file in dir_files(src).await? {
        let Some(name) = file.file_name() else {
            continue;
        };
        match copy_file(&file, &dst.join(name)).await {
            Ok(()) => report.transferred += 1,
            Err(e) => {
                warn!(file = %file.display(), error = %e, "failed to copy file");
                report.failed += 1;
            }
        }
    }
    Ok(report)
}
