//! Backend materialising workflows on disk for out-of-band execution.
//!
//! The execution tree lives in `LocalWorkflows/<uuid>/` and mirrors what a
//! remote engine would see: one `imp<short>/` directory per job, the build
//! script and a `workflow_info.json` manifest. Progress is read back from
//! the completion markers the script leaves in the tree.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::{
    Artifact, Backend, BackendError, Submission, TransferReport, copy_dir_files, copy_file,
    write_file,
};
use crate::config::BackendKind;
use crate::core::{ImpressionId, Job, WorkflowStatus};
use crate::workflow::{SCRIPT_FILE, WorkflowRecords};

/// Manifest of the local execution tree.
pub const WORKFLOW_INFO_FILE: &str = "workflow_info.json";

/// Local execution of one workflow.
pub struct LocalBackend {
    records: WorkflowRecords,
    exec_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(records: WorkflowRecords) -> Self {
        let exec_dir = records.layout().local_workflow_dir(&records.id());
        Self { records, exec_dir }
    }

    /// Root of the execution tree.
    pub fn exec_dir(&self) -> &std::path::Path {
        &self.exec_dir
    }

    async fn materialise_job(&self, job: &Job) -> Result<(), BackendError> {
        let work_dir = self.exec_dir.join(job.id().work_dir());
        let contents = job.dir().join("contents");
        for file in job.files() {
            let src = contents.join(file);
            if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
                warn!(job = %job.id(), file = %file, "content file missing, not copied");
                continue;
            }
            copy_file(&src, &work_dir.join(file)).await?;
        }

        let staged = if job.is_rawdata() {
            Some(job.dir().join("rawdata"))
        } else if job.is_input() {
            job.machine()
                .map(|m| job.site_dir(m).join(Artifact::Outputs.dir_name()))
        } else {
            None
        };
        if let Some(src) = staged {
            let report = copy_dir_files(&src, &work_dir.join(Artifact::Outputs.dir_name())).await?;
            debug!(job = %job.id(), files = report.transferred, "staged inputs");
            if !report.is_complete() {
                return Err(BackendError::Transfer {
                    path: src.display().to_string(),
                    message: format!("{} files could not be staged", report.failed),
                });
            }
        }
        Ok(())
    }

    async fn step_shorts(&self) -> Result<Vec<String>, BackendError> {
        let path = self.exec_dir.join(WORKFLOW_INFO_FILE);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BackendError::StatusSync(format!("{}: {}", path.display(), e)))?;
        let info: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::StatusSync(format!("{}: {}", path.display(), e)))?;
        let steps = info["workflow"]["specification"]["steps"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        Ok(steps
            .iter()
            .filter_map(|s| s.get("name").and_then(Value::as_str))
            .map(|name| name.strip_prefix("step").unwrap_or(name).to_string())
            .collect())
    }

    async fn collect(
        &self,
        impression: &ImpressionId,
        artifact: Artifact,
    ) -> Result<TransferReport, BackendError> {
        let target = self.records.collect_dir(impression);
        if tokio::fs::try_exists(target.join(artifact.marker()))
            .await
            .unwrap_or(false)
        {
            return Ok(TransferReport::already_collected());
        }
        let src = self
            .exec_dir
            .join(impression.work_dir())
            .join(artifact.dir_name());
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            debug!(impression = %impression, dir = artifact.dir_name(), "nothing to collect yet");
            return Ok(TransferReport::default());
        }

        let report = copy_dir_files(&src, &target.join(artifact.dir_name())).await?;
        if report.is_complete() {
            write_file(&target.join(artifact.marker()), b"").await?;
        }
        Ok(report)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn records(&self) -> &WorkflowRecords {
        &self.records
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<(), BackendError> {
        tokio::fs::create_dir_all(&self.exec_dir)
            .await
            .map_err(BackendError::io(&self.exec_dir))?;

        let descriptor = submission.descriptor;
        let info = json!({
            "workflow": {
                "uuid": self.records.id().to_string(),
                "name": self.records.engine_name(),
                "specification": {
                    "job_dependencies": descriptor.job_dependencies,
                    "steps": descriptor.steps,
                },
                "type": descriptor.engine,
                "file": descriptor.file,
            }
        });
        let text = serde_json::to_string_pretty(&info)
            .map_err(|e| BackendError::Serialization(e.to_string()))?;
        write_file(&self.exec_dir.join(WORKFLOW_INFO_FILE), text.as_bytes()).await?;

        for job in submission.jobs {
            self.materialise_job(job).await?;
        }
        copy_file(&self.records.script_path(), &self.exec_dir.join(SCRIPT_FILE)).await?;

        self.records.set_status(WorkflowStatus::Ready).await?;
        info!(
            workflow = %self.records.id(),
            dir = %self.exec_dir.display(),
            "workflow prepared for local execution"
        );
        Ok(())
    }

    async fn update_workflow_status(&self) -> Result<(), BackendError> {
        let shorts = self.step_shorts().await?;
        let mut completed = 0;
        for short in &shorts {
            let marker = self.exec_dir.join(format!("{}.done", short));
            if tokio::fs::try_exists(&marker).await.unwrap_or(false) {
                completed += 1;
            }
        }
        let status = if completed == shorts.len() {
            WorkflowStatus::Finished
        } else {
            WorkflowStatus::Running
        };
        debug!(workflow = %self.records.id(), completed, total = shorts.len(), "local progress");
        self.records
            .write_results(json!({
                "status": status.as_str(),
                "progress": {"total": shorts.len(), "completed": completed},
            }))
            .await?;
        Ok(())
    }

    async fn kill(&self) -> Result<(), BackendError> {
        info!(workflow = %self.records.id(), "local workflow marked killed, stop the runner by hand");
        self.records.set_status(WorkflowStatus::Killed).await?;
        Ok(())
    }

    async fn download_outputs(
        &self,
        impression: &ImpressionId,
    ) -> Result<TransferReport, BackendError> {
        self.collect(impression, Artifact::Outputs).await
    }

    async fn download_logs(&self, impression: &ImpressionId) -> Result<TransferReport, BackendError> {
        self.collect(impression, Artifact::Logs).await
    }

    async fn ping(&self) -> Result<bool, BackendError> {
        Ok(true)
    }
}
