//! Testing utilities for users of the impress library.
//!
//! This module provides in-memory stand-ins for every seam of the crate:
//!
//! - [`FakeClock`]: a [`Clock`] that only moves when told to
//! - [`FailingStore`]: an in-memory [`MetadataStore`] that fails on cue
//! - [`FixtureJobs`]: an in-memory [`JobSource`] with job constructors
//! - [`ScriptedEngine`]: an in-memory [`EngineClient`] recording its calls
//! - [`ScriptedBackends`]: a [`BackendProvider`] whose workflows finish on cue

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::backend::{
    Backend, BackendError, BackendProvider, EngineClient, RemoteFile, Submission, TransferReport,
};
use crate::config::{BackendKind, DEFAULT_EOS_MOUNT_POINT, DEFAULT_IMAGE, Site};
use crate::core::{
    BuildSpec, Clock, DEFAULT_BUILD_MEMORY, DEFAULT_COMPUTE_BACKEND, DEFAULT_TASK_MEMORY,
    ImpressionId, Job, JobError, JobSource, JobSpec, JobStatus, MachineId, ProjectId,
    RAWDATA_ENVIRONMENT, SCRIPT_ENVIRONMENT, TaskSpec, WorkflowId, WorkflowStatus,
};
use crate::storage::{self, InMemoryStore, MetadataStore, StorageError};
use crate::workflow::WorkflowRecords;

/// A clock that starts at creation time and advances only on request.
///
/// # Example
///
/// ```
/// use impress::core::Clock;
/// use impress::testing::FakeClock;
/// use std::time::Duration;
///
/// let clock = FakeClock::new();
/// let before = clock.now();
/// clock.advance(Duration::from_secs(5));
/// assert_eq!(clock.now() - before, Duration::from_secs(5));
/// ```
#[derive(Debug)]
pub struct FakeClock {
    start: Instant,
    offset: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("lock poisoned") += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *self.offset.lock().expect("lock poisoned")
    }
}

/// In-memory job source.
///
/// Jobs are built with the constructors below and made loadable with
/// [`FixtureJobs::insert`]. All of them share one store, so
/// statuses written through one copy of a job are seen by every other.
///
/// Names passed to the constructors become the short id of the job: the
/// impression id is the name padded with zeros to full length.
pub struct FixtureJobs {
    project: ProjectId,
    root: PathBuf,
    store: Arc<dyn MetadataStore>,
    jobs: RwLock<HashMap<ImpressionId, Job>>,
    loads: AtomicUsize,
}

impl FixtureJobs {
    /// Fixtures whose job directories never exist on disk.
    pub fn new(project: &str) -> Self {
        Self::with_root(project, PathBuf::from("/fixtures"))
    }

    /// Fixtures whose job directories live under `root` the way a
    /// [`Layout`](crate::config::Layout) rooted there expects them.
    pub fn rooted(project: &str, root: &Path) -> Self {
        Self::with_root(project, root.join("Storage"))
    }

    /// Like [`FixtureJobs::rooted`], keeping every record in `store`.
    pub fn rooted_on(project: &str, root: &Path, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            store,
            ..Self::rooted(project, root)
        }
    }

    fn with_root(project: &str, root: PathBuf) -> Self {
        Self {
            project: ProjectId::new(project),
            root,
            store: Arc::new(InMemoryStore::new()),
            jobs: RwLock::new(HashMap::new()),
            loads: AtomicUsize::new(0),
        }
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// The metadata store shared by every fixture job.
    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Full impression id for a short name.
    pub fn id(name: &str) -> ImpressionId {
        ImpressionId::new(format!("{:0<32}", name))
    }

    /// Number of loads served so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn job(&self, name: &str, spec: JobSpec) -> Job {
        let id = Self::id(name);
        let dir = self.root.join(self.project.as_str()).join(id.as_str());
        Job::new(id, self.project.clone(), dir, spec, self.store.clone())
    }

    /// A task job without commands.
    pub fn task(&self, name: &str) -> Job {
        self.task_with_commands(name, &[])
    }

    pub fn task_with_commands(&self, name: &str, commands: &[&str]) -> Job {
        self.task_on_backend(name, DEFAULT_COMPUTE_BACKEND, commands)
    }

    /// A task job tagged for `compute_backend`.
    pub fn task_on_backend(&self, name: &str, compute_backend: &str, commands: &[&str]) -> Job {
        self.job(
            name,
            JobSpec::Task(TaskSpec {
                commands: strings(commands),
                environment: SCRIPT_ENVIRONMENT.to_string(),
                memory: DEFAULT_TASK_MEMORY.to_string(),
                compute_backend: compute_backend.to_string(),
            }),
        )
    }

    /// A task job holding raw data. It is an input by construction.
    pub fn rawdata(&self, name: &str) -> Job {
        self.job(
            name,
            JobSpec::Task(TaskSpec {
                commands: Vec::new(),
                environment: RAWDATA_ENVIRONMENT.to_string(),
                memory: DEFAULT_TASK_MEMORY.to_string(),
                compute_backend: DEFAULT_COMPUTE_BACKEND.to_string(),
            }),
        )
    }

    /// A build job without rules.
    pub fn build(&self, name: &str) -> Job {
        self.build_with(name, &[], &[])
    }

    /// A build job with build `rules` and default task `commands`.
    pub fn build_with(&self, name: &str, rules: &[&str], commands: &[&str]) -> Job {
        self.job(
            name,
            JobSpec::Build(BuildSpec {
                rules: strings(rules),
                commands: strings(commands),
                environment: DEFAULT_IMAGE.to_string(),
                memory: DEFAULT_BUILD_MEMORY.to_string(),
            }),
        )
    }

    /// Make `job` loadable.
    pub fn insert(&self, job: Job) {
        self.jobs
            .write()
            .expect("lock poisoned")
            .insert(job.id().clone(), job);
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl JobSource for FixtureJobs {
    async fn load(
        &self,
        _project: &ProjectId,
        id: &ImpressionId,
        machine: Option<&MachineId>,
    ) -> Result<Job, JobError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let job = self
            .jobs
            .read()
            .expect("lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::MissingKind(id.clone()))?;

        if let Some(machine) = machine {
            return Ok(job.with_machine(machine.clone()));
        }
        let recorded: Option<String> = storage::read_or(
            self.store.as_ref(),
            &job.dir().join("status.json"),
            "machine_id",
            None,
        )
        .await?;
        Ok(match recorded.filter(|m| !m.is_empty()) {
            Some(machine) => job.with_machine(MachineId::new(machine)),
            None => job,
        })
    }
}

/// An in-memory metadata store that fails on chosen records.
///
/// Records are matched on their trailing components: `m/config.json`
/// matches the site record of every job on machine `m`.
#[derive(Debug, Default)]
pub struct FailingStore {
    inner: InMemoryStore,
    failing_reads: Mutex<Vec<PathBuf>>,
    failing_writes: Mutex<Vec<PathBuf>>,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every following read of records ending in `suffix`.
    pub fn fail_reads(&self, suffix: impl AsRef<Path>) {
        self.failing_reads
            .lock()
            .expect("lock poisoned")
            .push(suffix.as_ref().to_path_buf());
    }

    /// Fail every following write of records ending in `suffix`.
    pub fn fail_writes(&self, suffix: impl AsRef<Path>) {
        self.failing_writes
            .lock()
            .expect("lock poisoned")
            .push(suffix.as_ref().to_path_buf());
    }

    fn check(failing: &Mutex<Vec<PathBuf>>, record: &Path) -> Result<(), StorageError> {
        let failing = failing.lock().expect("lock poisoned");
        if failing.iter().any(|suffix| record.ends_with(suffix)) {
            return Err(StorageError::Io {
                path: record.to_path_buf(),
                source: std::io::Error::other("scripted failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for FailingStore {
    async fn read_variable(&self, record: &Path, key: &str) -> Result<Option<Value>, StorageError> {
        Self::check(&self.failing_reads, record)?;
        self.inner.read_variable(record, key).await
    }

    async fn write_variable(
        &self,
        record: &Path,
        key: &str,
        value: Value,
    ) -> Result<(), StorageError> {
        Self::check(&self.failing_writes, record)?;
        self.inner.write_variable(record, key, value).await
    }
}

/// In-memory workflow engine.
///
/// Files uploaded into any workflow land in one shared workspace; files
/// put with [`ScriptedEngine::put_file`] are listed and downloaded from it.
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    status: Mutex<Value>,
    workspace: Mutex<BTreeMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(json!({"status": "created", "logs": "{}"})),
            ..Default::default()
        }
    }

    /// Status record returned by the next polls.
    pub fn set_status(&self, status: Value) {
        *self.status.lock().expect("lock poisoned") = status;
    }

    /// Make an operation fail. `download_file:<path>` fails one download.
    pub fn fail_on(&self, operation: &str) {
        self.failing
            .lock()
            .expect("lock poisoned")
            .insert(operation.to_string());
    }

    /// Place a file in the workspace.
    pub fn put_file(&self, path: &str, content: &[u8]) {
        self.workspace
            .lock()
            .expect("lock poisoned")
            .insert(path.to_string(), content.to_vec());
    }

    /// Content of an uploaded file.
    pub fn uploaded(&self, path: &str) -> Option<Vec<u8>> {
        self.workspace.lock().expect("lock poisoned").get(path).cloned()
    }

    /// Operations called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock poisoned").clone()
    }

    fn call(&self, operation: &str, target: Option<&str>) -> Result<(), BackendError> {
        self.calls
            .lock()
            .expect("lock poisoned")
            .push(operation.to_string());
        let failing = self.failing.lock().expect("lock poisoned");
        let scoped = target.map(|t| format!("{}:{}", operation, t));
        if failing.contains(operation) || scoped.is_some_and(|s| failing.contains(&s)) {
            return Err(BackendError::Request {
                operation: operation.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EngineClient for ScriptedEngine {
    async fn create_workflow(&self, _name: &str, _specification: &Value) -> Result<(), BackendError> {
        self.call("create_workflow", None)
    }

    async fn upload_file(
        &self,
        _workflow: &str,
        path: &str,
        content: Vec<u8>,
    ) -> Result<(), BackendError> {
        self.call("upload_file", Some(path))?;
        self.put_file(path, &content);
        Ok(())
    }

    async fn start_workflow(&self, _workflow: &str) -> Result<(), BackendError> {
        self.call("start_workflow", None)
    }

    async fn stop_workflow(&self, _workflow: &str) -> Result<(), BackendError> {
        self.call("stop_workflow", None)
    }

    async fn workflow_status(&self, _workflow: &str) -> Result<Value, BackendError> {
        self.call("workflow_status", None)?;
        Ok(self.status.lock().expect("lock poisoned").clone())
    }

    async fn workflow_logs(&self, _workflow: &str) -> Result<String, BackendError> {
        self.call("workflow_logs", None)?;
        let status = self.status.lock().expect("lock poisoned");
        Ok(status
            .get("logs")
            .and_then(Value::as_str)
            .unwrap_or("{}")
            .to_string())
    }

    async fn list_files(
        &self,
        _workflow: &str,
        prefix: &str,
    ) -> Result<Vec<RemoteFile>, BackendError> {
        self.call("list_files", Some(prefix))?;
        Ok(self
            .workspace
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, content)| RemoteFile {
                name: name.clone(),
                size: Some(content.len() as u64),
            })
            .collect())
    }

    async fn download_file(&self, _workflow: &str, path: &str) -> Result<Vec<u8>, BackendError> {
        self.call("download_file", Some(path))?;
        self.uploaded(path).ok_or_else(|| BackendError::Request {
            operation: "download_file".to_string(),
            message: format!("no such file: {}", path),
        })
    }

    async fn ping(&self) -> Result<bool, BackendError> {
        self.call("ping", None)?;
        Ok(true)
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    finish_after: HashMap<WorkflowId, u32>,
    polls: HashMap<WorkflowId, u32>,
    syncs: HashMap<WorkflowId, u32>,
    submitted: HashMap<WorkflowId, Vec<String>>,
    downloads: HashMap<WorkflowId, Vec<String>>,
    killed: HashSet<WorkflowId>,
    fail_submissions: bool,
}

/// In-memory backend provider.
///
/// Workflows report `running` on every poll until they reach the poll
/// count given to [`ScriptedBackends::finish_after`], then `finished`.
#[derive(Debug, Default)]
pub struct ScriptedBackends {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `workflow` finish on its `polls`-th poll.
    pub fn finish_after(&self, workflow: WorkflowId, polls: u32) {
        self.lock().finish_after.insert(workflow, polls);
    }

    /// Reject every following submission.
    pub fn fail_submissions(&self) {
        self.lock().fail_submissions = true;
    }

    /// How often `workflow` was polled.
    pub fn polls(&self, workflow: WorkflowId) -> u32 {
        self.lock().polls.get(&workflow).copied().unwrap_or(0)
    }

    /// How many job statuses were reconciled against `workflow`.
    pub fn syncs(&self, workflow: WorkflowId) -> u32 {
        self.lock().syncs.get(&workflow).copied().unwrap_or(0)
    }

    /// Step names of the submitted descriptor of `workflow`.
    pub fn submitted(&self, workflow: WorkflowId) -> Option<Vec<String>> {
        self.lock().submitted.get(&workflow).cloned()
    }

    /// Artifacts collected from `workflow`, in order.
    pub fn downloads(&self, workflow: WorkflowId) -> Vec<String> {
        self.lock().downloads.get(&workflow).cloned().unwrap_or_default()
    }

    pub fn killed(&self, workflow: WorkflowId) -> bool {
        self.lock().killed.contains(&workflow)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl BackendProvider for ScriptedBackends {
    async fn site(&self, machine: &MachineId) -> Result<Site, BackendError> {
        Ok(Site {
            name: machine.to_string(),
            machine: machine.clone(),
            url: String::new(),
            token: String::new(),
            kind: BackendKind::Remote,
            use_kerberos: false,
            eos_mount_point: DEFAULT_EOS_MOUNT_POINT.to_string(),
        })
    }

    async fn open(&self, records: WorkflowRecords) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(ScriptedBackend {
            records,
            state: self.state.clone(),
        }))
    }
}

struct ScriptedBackend {
    records: WorkflowRecords,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedBackend {
    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().expect("lock poisoned")
    }

    fn collected(&self, artifact: &str) -> TransferReport {
        self.lock()
            .downloads
            .entry(self.records.id())
            .or_default()
            .push(artifact.to_string());
        TransferReport::default()
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn records(&self) -> &WorkflowRecords {
        &self.records
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<(), BackendError> {
        {
            let mut state = self.lock();
            if state.fail_submissions {
                return Err(BackendError::Request {
                    operation: "submit".to_string(),
                    message: "scripted failure".to_string(),
                });
            }
            let steps = submission
                .descriptor
                .step_names()
                .map(str::to_string)
                .collect();
            state.submitted.insert(self.records.id(), steps);
        }
        self.records.set_status(WorkflowStatus::Running).await?;
        Ok(())
    }

    async fn update_workflow_status(&self) -> Result<(), BackendError> {
        let finished = {
            let mut state = self.lock();
            let id = self.records.id();
            let polls = state.polls.entry(id).or_insert(0);
            *polls += 1;
            let polls = *polls;
            state.finish_after.get(&id).is_some_and(|n| polls >= *n)
        };
        let status = if finished { "finished" } else { "running" };
        self.records.write_results(json!({"status": status})).await?;
        Ok(())
    }

    async fn sync_external_job_status(&self, job: &Job) -> Result<Option<JobStatus>, BackendError> {
        *self.lock().syncs.entry(self.records.id()).or_insert(0) += 1;
        Ok(self.records.sync_job(job).await?)
    }

    async fn kill(&self) -> Result<(), BackendError> {
        self.lock().killed.insert(self.records.id());
        self.records.set_status(WorkflowStatus::Killed).await?;
        Ok(())
    }

    async fn download_outputs(
        &self,
        _impression: &ImpressionId,
    ) -> Result<TransferReport, BackendError> {
        Ok(self.collected("outputs"))
    }

    async fn download_logs(&self, _impression: &ImpressionId) -> Result<TransferReport, BackendError> {
        Ok(self.collected("logs"))
    }

    async fn ping(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}
