//! Durable records of one workflow.
//!
//! A workflow directory holds:
//!
//! - `config.json`: `machine_id` and the ledger of executed `jobs`
//! - `results.json`: `results`, the last status record (`status`, `progress`)
//! - `log.json`: `logs`, structured step logs keyed by step
//! - `Snakefile` and `workflow.json`: the build script and its descriptor
//!
//! Records are the only state shared between the worker that submitted a
//! workflow and the workers that later poll, collect or kill it.

use chrono::NaiveDateTime;
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Layout;
use crate::core::{
    ImpressionId, Job, JobStatus, MachineId, ProjectId, StatusCache, StatusGuard, WorkflowId,
    WorkflowStatus, transition,
};
use crate::storage::{self, MetadataStore, StorageError};

/// File name of the generated build script.
pub const SCRIPT_FILE: &str = "Snakefile";

/// File name of the workflow descriptor.
pub const DESCRIPTOR_FILE: &str = "workflow.json";

/// Timestamp format of step start and end times reported by the engine.
const STEP_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Shared handles used to open workflow records.
#[derive(Clone)]
pub struct WorkflowStore {
    layout: Layout,
    store: Arc<dyn MetadataStore>,
    cache: Arc<StatusCache>,
    guard: StatusGuard,
}

impl WorkflowStore {
    /// Create a record store with a default cache and status guard.
    pub fn new(layout: Layout, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            layout,
            store,
            cache: Arc::new(StatusCache::default()),
            guard: StatusGuard::default(),
        }
    }

    /// Builder: share `cache` between every workflow opened here.
    pub fn with_cache(mut self, cache: Arc<StatusCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Builder: set the status length guard.
    pub fn with_guard(mut self, guard: StatusGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    fn records(&self, project: &ProjectId, id: WorkflowId, machine: MachineId) -> WorkflowRecords {
        WorkflowRecords {
            id,
            project: project.clone(),
            machine,
            dir: self.layout.workflow_dir(project, &id),
            layout: self.layout.clone(),
            store: self.store.clone(),
            cache: self.cache.clone(),
            guard: self.guard,
        }
    }

    /// Create records for a new workflow bound to `machine`.
    pub async fn create(
        &self,
        project: &ProjectId,
        machine: &MachineId,
    ) -> Result<WorkflowRecords, StorageError> {
        self.create_with_id(project, machine, WorkflowId::new()).await
    }

    /// Create records for a workflow whose identifier is already known.
    pub async fn create_with_id(
        &self,
        project: &ProjectId,
        machine: &MachineId,
        id: WorkflowId,
    ) -> Result<WorkflowRecords, StorageError> {
        let records = self.records(project, id, machine.clone());
        tokio::fs::create_dir_all(&records.dir)
            .await
            .map_err(|source| StorageError::Io {
                path: records.dir.clone(),
                source,
            })?;
        records
            .store
            .write_variable(&records.config_record(), "machine_id", json!(machine.as_str()))
            .await?;
        Ok(records)
    }

    /// Records of a workflow that is never persisted, for checking a site.
    pub fn scratch(&self, project: &ProjectId, machine: &MachineId) -> WorkflowRecords {
        self.records(project, WorkflowId::new(), machine.clone())
    }

    /// Open the records of an existing workflow.
    pub async fn open(
        &self,
        project: &ProjectId,
        id: WorkflowId,
    ) -> Result<WorkflowRecords, StorageError> {
        let config = self.layout.workflow_dir(project, &id).join("config.json");
        let machine: String =
            storage::read_or(self.store.as_ref(), &config, "machine_id", String::new()).await?;
        if machine.is_empty() {
            warn!(workflow = %id, "workflow has no recorded machine");
        }
        Ok(self.records(project, id, MachineId::new(machine)))
    }
}

impl std::fmt::Debug for WorkflowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowStore")
            .field("layout", &self.layout)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

/// Records of one workflow.
#[derive(Clone)]
pub struct WorkflowRecords {
    id: WorkflowId,
    project: ProjectId,
    machine: MachineId,
    dir: PathBuf,
    layout: Layout,
    store: Arc<dyn MetadataStore>,
    cache: Arc<StatusCache>,
    guard: StatusGuard,
}

impl std::fmt::Debug for WorkflowRecords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowRecords")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("machine", &self.machine)
            .field("dir", &self.dir)
            .finish()
    }
}

impl WorkflowRecords {
    pub fn id(&self) -> WorkflowId {
        self.id
    }

    pub fn project(&self) -> &ProjectId {
        &self.project
    }

    /// Machine the workflow is bound to.
    pub fn machine(&self) -> &MachineId {
        &self.machine
    }

    /// The workflow directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn store(&self) -> &dyn MetadataStore {
        self.store.as_ref()
    }

    /// Name of the workflow on a remote engine.
    pub fn engine_name(&self) -> String {
        self.id.engine_name(&self.project)
    }

    fn config_record(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    fn results_record(&self) -> PathBuf {
        self.dir.join("results.json")
    }

    fn log_record(&self) -> PathBuf {
        self.dir.join("log.json")
    }

    /// Path of the generated build script.
    pub fn script_path(&self) -> PathBuf {
        self.dir.join(SCRIPT_FILE)
    }

    /// Path of the workflow descriptor.
    pub fn descriptor_path(&self) -> PathBuf {
        self.dir.join(DESCRIPTOR_FILE)
    }

    /// Where outputs and logs of `impression` are collected for this
    /// workflow's machine.
    pub fn collect_dir(&self, impression: &ImpressionId) -> PathBuf {
        self.layout
            .job_dir(&self.project, impression)
            .join(self.machine.as_str())
    }

    /// Current workflow status, served from the cache while fresh.
    pub async fn status(&self) -> Result<WorkflowStatus, StorageError> {
        if let Some(status) = self.cache.get(&self.id) {
            return Ok(status);
        }
        let status = self.read_status().await?;
        if status != WorkflowStatus::Unknown {
            self.cache.put(self.id, status.clone());
        }
        Ok(status)
    }

    async fn read_status(&self) -> Result<WorkflowStatus, StorageError> {
        let results = self.results().await?;
        Ok(results
            .get("status")
            .and_then(Value::as_str)
            .map(WorkflowStatus::parse)
            .unwrap_or(WorkflowStatus::Unknown))
    }

    /// The last status record.
    pub async fn results(&self) -> Result<Map<String, Value>, StorageError> {
        storage::read_or(self.store(), &self.results_record(), "results", Map::new()).await
    }

    /// Overwrite the status field of the status record.
    pub async fn set_status(&self, status: WorkflowStatus) -> Result<(), StorageError> {
        let mut results = self.results().await?;
        results.insert("status".to_string(), json!(status.as_str()));
        self.write_results(Value::Object(results)).await
    }

    /// Replace the status record.
    pub async fn write_results(&self, results: Value) -> Result<(), StorageError> {
        self.store
            .write_variable(&self.results_record(), "results", results)
            .await?;
        self.cache.invalidate(&self.id);
        Ok(())
    }

    /// Replace the structured step logs.
    pub async fn write_logs(&self, logs: Value) -> Result<(), StorageError> {
        self.store
            .write_variable(&self.log_record(), "logs", logs)
            .await
    }

    /// Structured step logs keyed by step.
    pub async fn logs(&self) -> Result<Map<String, Value>, StorageError> {
        storage::read_or(self.store(), &self.log_record(), "logs", Map::new()).await
    }

    /// Record the jobs this workflow executes.
    pub async fn record_jobs(&self, jobs: &[ImpressionId]) -> Result<(), StorageError> {
        storage::write(self.store(), &self.config_record(), "jobs", jobs).await
    }

    /// Jobs this workflow executes.
    pub async fn jobs(&self) -> Result<Vec<ImpressionId>, StorageError> {
        storage::read_or(self.store(), &self.config_record(), "jobs", Vec::new()).await
    }

    /// Reconcile `job`'s stored status with what this workflow reports.
    ///
    /// Returns the status written, if any. A status record that cannot be
    /// read is logged and leaves the job untouched.
    pub async fn sync_job(&self, job: &Job) -> Result<Option<JobStatus>, StorageError> {
        if job.is_build() {
            return Ok(None);
        }
        let current = job.status().await?;
        job.record_machine().await?;
        if current.is_terminal() {
            return Ok(None);
        }

        let workflow_status = match self.read_status().await {
            Ok(status) => status,
            Err(e) => {
                warn!(workflow = %self.id, job = %job.id(), error = %e, "status record unreadable");
                return Ok(None);
            }
        };

        let rule = job.id().rule_name();
        let matched = match self.logs().await {
            Ok(logs) => logs
                .into_iter()
                .map(|(_, step)| step)
                .find(|step| step.get("job_name").and_then(Value::as_str) == Some(rule.as_str())),
            Err(e) => {
                debug!(workflow = %self.id, error = %e, "no step logs");
                None
            }
        };

        let observed = match &matched {
            Some(step) => step
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            None => workflow_status.as_str().to_string(),
        };
        if let Some(step) = &matched {
            if observed == "finished" || observed == "failed" {
                self.write_step_logs(job, step, &observed).await?;
            }
        }

        let next = transition(&current, &observed, &workflow_status, self.guard);
        if let Some(status) = &next {
            debug!(job = %job.id(), from = %current, to = %status, "job status updated");
            job.set_status(status.clone()).await?;
        }
        Ok(next)
    }

    async fn write_step_logs(
        &self,
        job: &Job,
        step: &Value,
        status: &str,
    ) -> Result<(), StorageError> {
        let Some(machine) = job.machine() else {
            return Ok(());
        };
        let site_dir = job.site_dir(machine);
        let log_dir = site_dir.join("logs");
        tokio::fs::create_dir_all(&log_dir)
            .await
            .map_err(|source| StorageError::Io {
                path: log_dir.clone(),
                source,
            })?;
        let text = step.get("logs").and_then(Value::as_str).unwrap_or_default();
        let log_file = log_dir.join("job.stdout");
        tokio::fs::write(&log_file, text)
            .await
            .map_err(|source| StorageError::Io {
                path: log_file,
                source,
            })?;

        let record = site_dir.join("status.json");
        let started = step.get("started_at").and_then(Value::as_str).unwrap_or_default();
        let finished = step.get("finished_at").and_then(Value::as_str).unwrap_or_default();
        let store = self.store();
        store.write_variable(&record, "status", json!(status)).await?;
        store.write_variable(&record, "started_at", json!(started)).await?;
        store.write_variable(&record, "finished_at", json!(finished)).await?;
        match step_duration(started, finished) {
            Some(secs) => store.write_variable(&record, "duration", json!(secs)).await?,
            None => debug!(job = %job.id(), "step times not parseable, duration not recorded"),
        }
        Ok(())
    }
}

/// Seconds between two engine timestamps.
pub fn step_duration(started: &str, finished: &str) -> Option<i64> {
    let start = NaiveDateTime::parse_from_str(started, STEP_TIME_FORMAT).ok()?;
    let end = NaiveDateTime::parse_from_str(finished, STEP_TIME_FORMAT).ok()?;
    Some((end - start).num_seconds())
}
