//! Job model: build and task jobs loaded from impression records.
//!
//! A job lives in a directory named by its impression under
//! `Storage/<project>/`. Its kind is read from the `object_type` field of
//! the job's `config.json` before anything else, and the manifest at
//! `contents/job.yaml` is then interpreted for that kind.
//!
//! Mutable lifecycle state (status, owning workflow, bulk-storage flag)
//! is never cached on the [`Job`]; every accessor goes to the metadata
//! store, which is shared between worker processes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::status::JobStatus;
use super::types::{ImpressionId, MachineId, ProjectId, WorkflowId};
use crate::storage::{self, MetadataStore, StorageError};

/// Environment sentinel marking a job whose outputs are supplied as raw data.
pub const RAWDATA_ENVIRONMENT: &str = "rawdata";

/// Build environment sentinel meaning "use the baseline image".
pub const SCRIPT_ENVIRONMENT: &str = "script";

/// Compute backend meaning "use the engine's default pool".
pub const DEFAULT_COMPUTE_BACKEND: &str = "unsigned";

/// Compute backend of the external batch cluster. Tasks routed there do
/// not run their user commands inside the generated rule.
pub const EXTERNAL_COMPUTE_BACKEND: &str = "htcondorcern";

/// Memory limit of a task that does not declare one.
pub const DEFAULT_TASK_MEMORY: &str = "4096Mi";

/// Memory limit of a build that does not declare one.
pub const DEFAULT_BUILD_MEMORY: &str = "256Mi";

/// Relative location of the job manifest inside the job directory.
pub const MANIFEST_PATH: &str = "contents/job.yaml";

/// Errors that can occur when loading jobs.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job record has no `object_type`.
    #[error("job {0} has no object type")]
    MissingKind(ImpressionId),

    /// Failed to read the manifest.
    #[error("failed to read manifest '{path}': {source}")]
    ManifestRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse the manifest.
    #[error("invalid manifest '{path}': {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Metadata store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Discriminator stored as `object_type` in a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Produces the code/image other jobs run against.
    Build,
    /// Runs commands inside a container.
    Task,
}

impl JobKind {
    /// Parse an `object_type` value. `algorithm` is the legacy build name.
    pub fn parse(object_type: &str) -> Option<Self> {
        match object_type {
            "build" | "algorithm" => Some(JobKind::Build),
            "task" => Some(JobKind::Task),
            _ => None,
        }
    }

    /// The stored string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Build => "build",
            JobKind::Task => "task",
        }
    }
}

/// Raw manifest as written by the client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Manifest {
    pub environment: Option<String>,
    pub build: Vec<String>,
    pub commands: Vec<String>,
    pub parameters: BTreeMap<String, serde_yaml::Value>,
    pub memory_limit: Option<String>,
    pub kubernetes_memory_limit: Option<String>,
    pub compute_backend: Option<String>,
}

impl Manifest {
    /// Parse a manifest from YAML. An empty document is an empty manifest.
    pub fn parse_str(yaml: &str) -> Result<Self, serde_yaml::Error> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Parameters rendered as the strings substituted into commands.
    pub fn parameter_strings(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .map(|(k, v)| (k.clone(), yaml_scalar(v)))
            .collect()
    }

    /// Interpret the manifest for a job of `kind`.
    pub fn into_spec(self, kind: JobKind, default_image: &str) -> JobSpec {
        match kind {
            JobKind::Build => {
                let environment = match self.environment {
                    Some(env) if env != SCRIPT_ENVIRONMENT && !env.is_empty() => env,
                    _ => default_image.to_string(),
                };
                JobSpec::Build(BuildSpec {
                    rules: self.build,
                    commands: self.commands,
                    environment,
                    memory: self
                        .kubernetes_memory_limit
                        .unwrap_or_else(|| DEFAULT_BUILD_MEMORY.to_string()),
                })
            }
            JobKind::Task => {
                let memory = self
                    .memory_limit
                    .filter(|m| !m.is_empty())
                    .or(self.kubernetes_memory_limit)
                    .unwrap_or_else(|| DEFAULT_TASK_MEMORY.to_string());
                JobSpec::Task(TaskSpec {
                    commands: self.commands,
                    environment: self.environment.unwrap_or_default(),
                    memory,
                    compute_backend: self
                        .compute_backend
                        .unwrap_or_else(|| DEFAULT_COMPUTE_BACKEND.to_string()),
                })
            }
        }
    }
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Configuration of a build job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSpec {
    /// Build rules, run inside the job's working directory.
    pub rules: Vec<String>,
    /// Commands dependant tasks run when they declare none of their own.
    pub commands: Vec<String>,
    /// Container image of the build rule.
    pub environment: String,
    /// Memory limit of the build rule.
    pub memory: String,
}

/// Configuration of a task job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Declarative command list.
    pub commands: Vec<String>,
    /// Container image, or [`RAWDATA_ENVIRONMENT`].
    pub environment: String,
    /// Memory limit.
    pub memory: String,
    /// Compute backend tag.
    pub compute_backend: String,
}

/// Kind-specific part of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    Build(BuildSpec),
    Task(TaskSpec),
}

/// One build or task job.
#[derive(Clone)]
pub struct Job {
    id: ImpressionId,
    project: ProjectId,
    dir: PathBuf,
    machine: Option<MachineId>,
    spec: JobSpec,
    dependencies: Vec<ImpressionId>,
    aliases: BTreeMap<String, ImpressionId>,
    parameters: BTreeMap<String, String>,
    files: Vec<String>,
    is_input: bool,
    store: Arc<dyn MetadataStore>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("machine", &self.machine)
            .field("dependencies", &self.dependencies)
            .field("is_input", &self.is_input)
            .finish()
    }
}

impl Job {
    /// Create a job with no dependencies, aliases, parameters or files.
    pub fn new(
        id: ImpressionId,
        project: ProjectId,
        dir: impl Into<PathBuf>,
        spec: JobSpec,
        store: Arc<dyn MetadataStore>,
    ) -> Self {
        let is_input = matches!(&spec, JobSpec::Task(t) if t.environment == RAWDATA_ENVIRONMENT);
        Self {
            id,
            project,
            dir: dir.into(),
            machine: None,
            spec,
            dependencies: Vec::new(),
            aliases: BTreeMap::new(),
            parameters: BTreeMap::new(),
            files: Vec::new(),
            is_input,
            store,
        }
    }

    /// Builder: set the target machine.
    pub fn with_machine(mut self, machine: MachineId) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Builder: set the dependency list.
    pub fn with_dependencies(mut self, dependencies: Vec<ImpressionId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Builder: map an alias to a dependency.
    pub fn with_alias(mut self, alias: impl Into<String>, target: ImpressionId) -> Self {
        self.aliases.insert(alias.into(), target);
        self
    }

    /// Builder: set a substitution parameter.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Builder: set the content files (relative to `contents/`).
    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn id(&self) -> &ImpressionId {
        &self.id
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// The job directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn machine(&self) -> Option<&MachineId> {
        self.machine.as_ref()
    }

    pub fn kind(&self) -> JobKind {
        match self.spec {
            JobSpec::Build(_) => JobKind::Build,
            JobSpec::Task(_) => JobKind::Task,
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn is_build(&self) -> bool {
        self.kind() == JobKind::Build
    }

    /// Ordered dependency list.
    pub fn dependencies(&self) -> &[ImpressionId] {
        &self.dependencies
    }

    /// Alias name to producing dependency.
    pub fn aliases(&self) -> &BTreeMap<String, ImpressionId> {
        &self.aliases
    }

    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    /// Content files, relative to the job's `contents/` directory.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    /// Declared container environment.
    pub fn environment(&self) -> &str {
        match &self.spec {
            JobSpec::Build(b) => &b.environment,
            JobSpec::Task(t) => &t.environment,
        }
    }

    /// Whether this job's outputs come from raw data rather than a rule.
    pub fn is_rawdata(&self) -> bool {
        self.environment() == RAWDATA_ENVIRONMENT
    }

    /// Whether the job is only waited upon, never executed, by a workflow.
    pub fn is_input(&self) -> bool {
        self.is_input
    }

    /// Mark the job as an input of the current workflow.
    pub fn mark_input(&mut self) {
        self.is_input = true;
    }

    /// Whether the job is executed by the workflow that assembled it.
    pub fn is_active(&self) -> bool {
        !self.is_input && !self.is_build()
    }

    fn status_record(&self) -> PathBuf {
        self.dir.join("status.json")
    }

    /// Per-site directory of this job on `machine`.
    pub fn site_dir(&self, machine: &MachineId) -> PathBuf {
        self.dir.join(machine.as_str())
    }

    fn site_config_record(&self) -> Option<PathBuf> {
        self.machine
            .as_ref()
            .map(|m| self.site_dir(m).join("config.json"))
    }

    /// Current status. Missing status reads as raw.
    pub async fn status(&self) -> Result<JobStatus, StorageError> {
        storage::read_or(
            self.store.as_ref(),
            &self.status_record(),
            "status",
            JobStatus::Raw,
        )
        .await
    }

    pub async fn set_status(&self, status: JobStatus) -> Result<(), StorageError> {
        storage::write(self.store.as_ref(), &self.status_record(), "status", &status).await
    }

    /// Record the machine this job's status refers to.
    pub async fn record_machine(&self) -> Result<(), StorageError> {
        match &self.machine {
            Some(machine) => {
                self.store
                    .write_variable(&self.status_record(), "machine_id", json!(machine.as_str()))
                    .await
            }
            None => Ok(()),
        }
    }

    /// Workflow currently (or last) responsible for this job on its machine.
    pub async fn workflow_id(&self) -> Result<Option<WorkflowId>, StorageError> {
        let Some(record) = self.site_config_record() else {
            return Ok(None);
        };
        let raw: String = storage::read_or(self.store.as_ref(), &record, "workflow", String::new())
            .await?;
        Ok(WorkflowId::parse(&raw))
    }

    /// Bind the job to `workflow` on its machine.
    pub async fn set_workflow_id(&self, workflow: WorkflowId) -> Result<(), StorageError> {
        match self.site_config_record() {
            Some(record) => {
                storage::write(self.store.as_ref(), &record, "workflow", &workflow.to_string())
                    .await
            }
            None => Ok(()),
        }
    }

    /// Whether outputs are shared through remote bulk storage.
    pub async fn use_eos(&self) -> Result<bool, StorageError> {
        match self.site_config_record() {
            Some(record) => storage::read_or(self.store.as_ref(), &record, "use_eos", false).await,
            None => Ok(false),
        }
    }

    pub async fn set_use_eos(&self, on: bool) -> Result<(), StorageError> {
        match self.site_config_record() {
            Some(record) => storage::write(self.store.as_ref(), &record, "use_eos", &on).await,
            None => Ok(()),
        }
    }
}

/// Source of jobs for assembly and compilation.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Load a job. With `machine = None` the machine recorded in the job's
    /// status is used, if any.
    async fn load(
        &self,
        project: &ProjectId,
        id: &ImpressionId,
        machine: Option<&MachineId>,
    ) -> Result<Job, JobError>;
}

/// Job source reading impression records under a storage root.
#[derive(Clone)]
pub struct ImpressionStore {
    storage_root: PathBuf,
    store: Arc<dyn MetadataStore>,
    default_image: String,
}

impl ImpressionStore {
    /// Create a source reading `<storage_root>/<project>/<impression>/`.
    pub fn new(
        storage_root: impl Into<PathBuf>,
        store: Arc<dyn MetadataStore>,
        default_image: impl Into<String>,
    ) -> Self {
        Self {
            storage_root: storage_root.into(),
            store,
            default_image: default_image.into(),
        }
    }

    /// Directory of one job.
    pub fn job_dir(&self, project: &ProjectId, id: &ImpressionId) -> PathBuf {
        self.storage_root.join(project.as_str()).join(id.as_str())
    }

    async fn read_manifest(dir: &Path) -> Result<Manifest, JobError> {
        let path = dir.join(MANIFEST_PATH);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Manifest::default()),
            Err(source) => return Err(JobError::ManifestRead { path, source }),
        };
        Manifest::parse_str(&text).map_err(|source| JobError::Manifest { path, source })
    }
}

/// Flatten a walk-style `tree` (`[dirpath, dirnames, filenames]` entries)
/// into paths relative to `contents/`, skipping the manifest.
pub fn tree_files(tree: &[(String, Vec<String>, Vec<String>)]) -> Vec<String> {
    let manifest_name = Path::new(MANIFEST_PATH)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let mut files = Vec::new();
    for (dirpath, _, filenames) in tree {
        for name in filenames {
            if name == manifest_name {
                continue;
            }
            if dirpath == "." || dirpath.is_empty() {
                files.push(name.clone());
            } else {
                files.push(format!("{}/{}", dirpath.trim_start_matches("./"), name));
            }
        }
    }
    files
}

#[async_trait]
impl JobSource for ImpressionStore {
    async fn load(
        &self,
        project: &ProjectId,
        id: &ImpressionId,
        machine: Option<&MachineId>,
    ) -> Result<Job, JobError> {
        let dir = self.job_dir(project, id);
        let config = dir.join("config.json");
        let store = self.store.as_ref();

        let object_type: String = storage::read_or(store, &config, "object_type", String::new()).await?;
        if object_type.is_empty() {
            return Err(JobError::MissingKind(id.clone()));
        }
        let kind = JobKind::parse(&object_type).unwrap_or_else(|| {
            warn!(job = %id, object_type = %object_type, "unknown object type, loading as task");
            JobKind::Task
        });

        let manifest = Self::read_manifest(&dir).await?;
        let parameters = manifest.parameter_strings();
        let spec = manifest.into_spec(kind, &self.default_image);

        let dependencies: Vec<String> = storage::read_or(store, &config, "dependencies", Vec::new()).await?;
        let aliases: BTreeMap<String, String> =
            storage::read_or(store, &config, "alias_to_impression", BTreeMap::new()).await?;
        let tree: Vec<(String, Vec<String>, Vec<String>)> =
            storage::read_or(store, &config, "tree", Vec::new()).await?;

        let machine = match machine {
            Some(m) => Some(m.clone()),
            None => {
                let recorded: Option<String> =
                    storage::read_or(store, &dir.join("status.json"), "machine_id", None).await?;
                recorded.filter(|m| !m.is_empty()).map(MachineId::new)
            }
        };

        let mut job = Job::new(id.clone(), project.clone(), dir, spec, self.store.clone())
            .with_dependencies(dependencies.into_iter().map(ImpressionId::new).collect())
            .with_files(tree_files(&tree));
        job.aliases = aliases
            .into_iter()
            .map(|(alias, target)| (alias, ImpressionId::new(target)))
            .collect();
        job.parameters = parameters;
        job.machine = machine;
        Ok(job)
    }
}
