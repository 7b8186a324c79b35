//! Impression-level operations across every registered site.
//!
//! An impression may have been executed on several sites over its life.
//! Each site keeps its own `<machine>/config.json` naming the workflow that
//! last handled the impression there; the collector visits the sites in
//! registration order and works through those workflows.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::WorkflowError;
use super::records::WorkflowStore;
use crate::backend::{Backend, BackendProvider, TransferReport};
use crate::config::{Site, SiteRegistry};
use crate::core::{ImpressionId, Job, JobError, JobSource, JobStatus, ProjectId, WorkflowId};

/// Status of an impression as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImpressionStatus {
    /// No job record exists.
    Empty,
    /// The record exists but no site knows its status.
    Deposited,
    /// Status reported by the first site that knows it.
    Job(JobStatus),
}

impl fmt::Display for ImpressionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImpressionStatus::Empty => write!(f, "empty"),
            ImpressionStatus::Deposited => write!(f, "deposited"),
            ImpressionStatus::Job(status) => write!(f, "{}", status),
        }
    }
}

/// Where an impression was last executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub site: String,
    pub workflow: WorkflowId,
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.site, self.workflow)
    }
}

/// A site on which the impression has a workflow.
struct SiteContext {
    site: Site,
    job: Job,
    backend: Box<dyn Backend>,
}

/// Collects, kills and reports on single impressions.
pub struct Collector {
    source: Arc<dyn JobSource>,
    workflows: WorkflowStore,
    backends: Arc<dyn BackendProvider>,
    registry: SiteRegistry,
}

impl Collector {
    pub fn new(
        source: Arc<dyn JobSource>,
        workflows: WorkflowStore,
        backends: Arc<dyn BackendProvider>,
        registry: SiteRegistry,
    ) -> Self {
        Self {
            source,
            workflows,
            backends,
            registry,
        }
    }

    async fn contexts(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<Vec<SiteContext>, WorkflowError> {
        let mut contexts = Vec::new();
        for site in self.registry.sites().await? {
            let job = self
                .source
                .load(project, impression, Some(&site.machine))
                .await?;
            let Some(workflow) = job.workflow_id().await? else {
                continue;
            };
            let records = self.workflows.open(project, workflow).await?;
            let backend = self.backends.open(records).await?;
            contexts.push(SiteContext { site, job, backend });
        }
        Ok(contexts)
    }

    /// Kill every workflow that handled the impression, then mark it failed.
    pub async fn kill(&self, project: &ProjectId, impression: &ImpressionId) -> Result<(), WorkflowError> {
        for ctx in self.contexts(project, impression).await? {
            info!(site = %ctx.site.name, workflow = %ctx.backend.records().id(), "killing workflow");
            if let Err(e) = ctx.backend.kill().await {
                warn!(site = %ctx.site.name, error = %e, "kill failed");
            }
        }
        let job = self.source.load(project, impression, None).await?;
        job.set_status(JobStatus::Failed).await?;
        Ok(())
    }

    /// Bring back outputs and logs of finished runs, logs of failed ones.
    pub async fn collect(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<TransferReport, WorkflowError> {
        let mut report = TransferReport::default();
        for ctx in self.contexts(project, impression).await? {
            let transfer = match ctx.job.status().await? {
                JobStatus::Finished => {
                    info!(site = %ctx.site.name, "collecting results");
                    ctx.backend.download(impression).await
                }
                JobStatus::Failed => {
                    info!(site = %ctx.site.name, "collecting logs of failed run");
                    ctx.backend.download_logs(impression).await
                }
                _ => continue,
            };
            merge(&mut report, &ctx.site, transfer);
        }
        Ok(report)
    }

    /// Bring back outputs of finished runs.
    pub async fn collect_outputs(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<TransferReport, WorkflowError> {
        let mut report = TransferReport::default();
        for ctx in self.contexts(project, impression).await? {
            if ctx.job.status().await? == JobStatus::Finished {
                info!(site = %ctx.site.name, "collecting outputs");
                merge(&mut report, &ctx.site, ctx.backend.download_outputs(impression).await);
            }
        }
        Ok(report)
    }

    /// Bring back logs of finished and failed runs.
    pub async fn collect_logs(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<TransferReport, WorkflowError> {
        let mut report = TransferReport::default();
        for ctx in self.contexts(project, impression).await? {
            if matches!(ctx.job.status().await?, JobStatus::Finished | JobStatus::Failed) {
                info!(site = %ctx.site.name, "collecting logs");
                merge(&mut report, &ctx.site, ctx.backend.download_logs(impression).await);
            }
        }
        Ok(report)
    }

    /// Current status of the impression.
    ///
    /// The job is first reconciled with each owning workflow; workflows
    /// still in flight are refreshed from their backend on the way.
    pub async fn status(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<ImpressionStatus, WorkflowError> {
        let plain = match self.source.load(project, impression, None).await {
            Ok(job) => job,
            Err(JobError::MissingKind(_)) => return Ok(ImpressionStatus::Empty),
            Err(e) => return Err(e.into()),
        };

        for ctx in self.contexts(project, impression).await? {
            let records = ctx.backend.records();
            if let Err(e) = ctx.backend.sync_external_job_status(&ctx.job).await {
                warn!(site = %ctx.site.name, error = %e, "job status sync failed");
            }
            if !records.status().await?.is_terminal() {
                debug!(workflow = %records.id(), "refreshing workflow in flight");
                if let Err(e) = ctx.backend.update_workflow_status().await {
                    warn!(workflow = %records.id(), error = %e, "status refresh failed");
                }
            }

            let status = ctx.job.status().await?;
            if status != JobStatus::Unknown {
                return Ok(ImpressionStatus::Job(status));
            }
            if tokio::fs::try_exists(ctx.job.dir()).await.unwrap_or(false) {
                return Ok(ImpressionStatus::Deposited);
            }
        }
        Ok(ImpressionStatus::Job(plain.status().await?))
    }

    /// The first site with a workflow for the impression.
    pub async fn info(
        &self,
        project: &ProjectId,
        impression: &ImpressionId,
    ) -> Result<Option<Placement>, WorkflowError> {
        Ok(self
            .contexts(project, impression)
            .await?
            .into_iter()
            .next()
            .map(|ctx| Placement {
                workflow: ctx.backend.records().id(),
                site: ctx.site.name,
            }))
    }
}

fn merge(
    report: &mut TransferReport,
    site: &Site,
    transfer: Result<TransferReport, crate::backend::BackendError>,
) {
    match transfer {
        Ok(part) => report.merge(part),
        Err(e) => {
            warn!(site = %site.name, error = %e, "collection failed");
            report.failed += 1;
        }
    }
}
