//! Backend submitting workflows to a remote workflow engine.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    Artifact, Backend, BackendError, EngineClient, Submission, TransferReport, dir_files,
    write_file,
};
use crate::config::BackendKind;
use crate::core::{ImpressionId, Job};
use crate::workflow::{ENGINE_TYPE, SCRIPT_FILE, WorkflowRecords};

/// Name of the engine's workflow manifest uploaded next to the script.
const ENGINE_MANIFEST: &str = "reana.yaml";

/// Remote execution of one workflow.
pub struct RemoteBackend {
    records: WorkflowRecords,
    engine: Arc<dyn EngineClient>,
}

impl RemoteBackend {
    /// Serve `records` through `engine`.
    pub fn new(records: WorkflowRecords, engine: Arc<dyn EngineClient>) -> Self {
        Self { records, engine }
    }

    fn name(&self) -> String {
        self.records.engine_name()
    }

    async fn upload(&self, path: &Path, target: &str) -> Result<(), BackendError> {
        let content = tokio::fs::read(path)
            .await
            .map_err(BackendError::io(path))?;
        debug!(file = %path.display(), target, "uploading");
        self.engine.upload_file(&self.name(), target, content).await
    }

    /// Upload the files of `job`. A file that cannot be read or uploaded
    /// is counted as failed and the rest still go out.
    async fn upload_job(&self, job: &Job) -> Result<TransferReport, BackendError> {
        let work_dir = job.id().work_dir();
        let contents = job.dir().join("contents");
        let mut uploads: Vec<(PathBuf, String)> = job
            .files()
            .iter()
            .map(|file| (contents.join(file), format!("{}/{}", work_dir, file)))
            .collect();

        let staged = if job.is_rawdata() {
            Some(job.dir().join("rawdata"))
        } else if let (true, Some(machine)) = (job.is_input(), job.machine()) {
            if machine == self.records.machine() && job.use_eos().await? {
                // Read straight from bulk storage by the setup rule.
                None
            } else {
                Some(job.site_dir(machine).join(Artifact::Outputs.dir_name()))
            }
        } else {
            None
        };

        if let Some(dir) = staged {
            for file in dir_files(&dir).await? {
                let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let target = format!("{}/stageout/{}", work_dir, name);
                uploads.push((file, target));
            }
        }

        let mut report = TransferReport::default();
        for (path, target) in uploads {
            match self.upload(&path, &target).await {
                Ok(()) => report.transferred += 1,
                Err(e) => {
                    warn!(job = %job.id(), file = %path.display(), error = %e, "upload failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
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

        let name = self.name();
        let prefix = format!("{}/{}", impression.work_dir(), artifact.dir_name());
        let files = self
            .engine
            .list_files(&name, &prefix)
            .await
            .map_err(|e| BackendError::Transfer {
                path: prefix.clone(),
                message: e.to_string(),
            })?;

        tokio::fs::create_dir_all(target.join(artifact.dir_name()))
            .await
            .map_err(BackendError::io(&target))?;

        let scope = format!("{}/", impression.work_dir());
        let mut report = TransferReport::default();
        for file in files {
            let Some(relative) = file.name.strip_prefix(&scope) else {
                warn!(file = %file.name, "remote file outside the job directory, skipping");
                continue;
            };
            if !is_contained(relative) {
                warn!(file = %file.name, "remote file escapes the job directory, skipping");
                report.failed += 1;
                continue;
            }
            let result = match self.engine.download_file(&name, &file.name).await {
                Ok(content) => write_file(&target.join(relative), &content).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    debug!(file = %file.name, "downloaded");
                    report.transferred += 1;
                }
                Err(e) => {
                    warn!(file = %file.name, error = %e, "download failed");
                    report.failed += 1;
                }
            }
        }

        if report.is_complete() {
            write_file(&target.join(artifact.marker()), b"").await?;
        }
        Ok(report)
    }
}

/// Whether a remote relative path stays below the directory it is joined to.
fn is_contained(relative: &str) -> bool {
    !relative.is_empty()
        && Path::new(relative)
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
}

#[async_trait]
impl Backend for RemoteBackend {
    fn records(&self) -> &WorkflowRecords {
        &self.records
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn submit(&self, submission: Submission<'_>) -> Result<(), BackendError> {
        let name = self.name();
        info!(workflow = %name, "creating remote workflow");
        self.engine
            .create_workflow(&name, &submission.descriptor.engine_specification())
            .await?;

        let mut uploads = TransferReport::default();
        for job in submission.jobs {
            uploads.merge(self.upload_job(job).await?);
        }
        if !uploads.is_complete() {
            warn!(workflow = %name, failed = uploads.failed, "some job files were not uploaded");
        }
        self.upload(&self.records.script_path(), SCRIPT_FILE).await?;

        let manifest = serde_yaml::to_string(&serde_json::json!({
            "workflow": {"type": ENGINE_TYPE, "file": SCRIPT_FILE}
        }))
        .map_err(|e| BackendError::Serialization(e.to_string()))?;
        self.engine
            .upload_file(&name, ENGINE_MANIFEST, manifest.into_bytes())
            .await?;

        info!(workflow = %name, "starting remote workflow");
        self.engine.start_workflow(&name).await
    }

    async fn update_workflow_status(&self) -> Result<(), BackendError> {
        let name = self.name();
        let sync = |e: BackendError| BackendError::StatusSync(e.to_string());

        let results = self.engine.workflow_status(&name).await.map_err(sync)?;
        self.records.write_results(results.clone()).await?;

        let text = match results.get("logs").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None => self.engine.workflow_logs(&name).await.map_err(sync)?,
        };
        let logs: Value = serde_json::from_str(&text)
            .map_err(|e| BackendError::StatusSync(format!("malformed step logs: {}", e)))?;
        self.records.write_logs(logs).await?;
        debug!(workflow = %name, "status record refreshed");
        Ok(())
    }

    async fn kill(&self) -> Result<(), BackendError> {
        info!(workflow = %self.name(), "stopping remote workflow");
        self.engine.stop_workflow(&self.name()).await
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
        self.engine.ping().await
    }
}
