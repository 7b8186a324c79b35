//! Drives one workflow run from root jobs to a dispatched execution.
//!
//! A run goes through these phases, in order:
//!
//! 1. construct: assemble the transitive closure of the root jobs
//! 2. mark waiting: every active job is set `waiting`
//! 3. wait: poll the workflows owning the input jobs until they finish
//! 4. commit: bind the active jobs to this workflow and set them `running`
//! 5. emit: compile every job and write the build script and descriptor
//! 6. dispatch: hand the workflow to the site's backend
//!
//! A dependency wait that runs out of attempts resets the active jobs to
//! `raw` and aborts the run; the caller resubmits later. A wait that fails
//! outright resets them too, then returns the error. Failures while
//! committing, emitting or dispatching mark the workflow and its active
//! jobs `failed`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::WorkflowError;
use super::records::{WorkflowRecords, WorkflowStore};
use super::script::BuildScript;
use crate::backend::{Artifact, Backend, BackendProvider, Submission};
use crate::config::DEFAULT_IMAGE;
use crate::core::{
    Assembler, Compiler, ImpressionId, Job, JobKind, JobSource, JobStatus, MachineId, PollPolicy,
    ProjectId, WorkflowId, WorkflowStatus, rule_dependencies,
};

/// How a run ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The workflow was handed to its backend.
    Dispatched(WorkflowId),
    /// Input jobs did not finish in time; active jobs were reset to `raw`.
    Aborted {
        workflow: WorkflowId,
        unfinished: Vec<ImpressionId>,
    },
}

/// Runs, refreshes and kills workflows.
#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn JobSource>,
    records: WorkflowStore,
    backends: Arc<dyn BackendProvider>,
    poll: PollPolicy,
    default_image: String,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("records", &self.records)
            .field("poll", &self.poll)
            .field("default_image", &self.default_image)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator with the default polling policy and image.
    pub fn new(
        source: Arc<dyn JobSource>,
        records: WorkflowStore,
        backends: Arc<dyn BackendProvider>,
    ) -> Self {
        Self {
            source,
            records,
            backends,
            poll: PollPolicy::default(),
            default_image: DEFAULT_IMAGE.to_string(),
        }
    }

    /// Builder: set the dependency wait policy.
    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    /// Builder: set the image of bookkeeping rules and input jobs.
    pub fn with_default_image(mut self, image: impl Into<String>) -> Self {
        self.default_image = image.into();
        self
    }

    pub fn workflows(&self) -> &WorkflowStore {
        &self.records
    }

    /// Open the backend of an existing workflow.
    pub async fn rehydrate(
        &self,
        project: &ProjectId,
        workflow: WorkflowId,
    ) -> Result<Box<dyn Backend>, WorkflowError> {
        let records = self.records.open(project, workflow).await?;
        Ok(self.backends.open(records).await?)
    }

    /// Run a new workflow for `roots` on `machine`.
    pub async fn run(
        &self,
        project: &ProjectId,
        roots: &[ImpressionId],
        machine: &MachineId,
    ) -> Result<RunOutcome, WorkflowError> {
        if roots.is_empty() {
            return Err(WorkflowError::NotRunnable(
                "a workflow needs at least one root job".to_string(),
            ));
        }
        let records = self.records.create(project, machine).await?;
        let span = info_span!(
            "workflow_run",
            workflow = %records.id(),
            project = %project,
            machine = %machine
        );
        self.run_in(records, roots).instrument(span).await
    }

    async fn run_in(
        &self,
        records: WorkflowRecords,
        roots: &[ImpressionId],
    ) -> Result<RunOutcome, WorkflowError> {
        let project = records.project().clone();
        let machine = records.machine().clone();

        info!(roots = roots.len(), "constructing workflow");
        let jobs = self.construct(&project, &machine, roots).await?;
        for (i, job) in jobs.iter().enumerate() {
            debug!(
                index = i + 1,
                total = jobs.len(),
                job = %job.id(),
                kind = job.kind().as_str(),
                input = job.is_input(),
                "job in workflow"
            );
        }
        let active: Vec<&Job> = jobs.iter().filter(|j| j.is_active()).collect();

        for job in &active {
            job.set_status(JobStatus::Waiting).await?;
        }
        info!(active = active.len(), "jobs waiting for dependencies");

        if let Err(e) = self.wait_for_dependencies(&project, &jobs).await {
            for job in &active {
                if let Err(reset) = job.set_status(JobStatus::Raw).await {
                    warn!(job = %job.id(), error = %reset, "could not reset waiting job");
                }
            }
            let WorkflowError::DependencyTimeout { unfinished, .. } = e else {
                error!(error = %e, "dependency wait failed, waiting jobs reset");
                return Err(e);
            };
            warn!(unfinished = unfinished.len(), "dependencies not finished, run aborted");
            return Ok(RunOutcome::Aborted {
                workflow: records.id(),
                unfinished,
            });
        }

        if let Err(e) = self.commit(&records, &active).await {
            return Err(self.fail_run(&records, &active, e).await);
        }

        self.stage_inputs(&project, &machine, &jobs).await;

        let descriptor = match self.emit(&records, &jobs).await {
            Ok(descriptor) => descriptor,
            Err(e) => return Err(self.fail_run(&records, &active, e).await),
        };

        info!("dispatching workflow");
        let dispatched = match self.backends.open(records.clone()).await {
            Ok(backend) => {
                backend
                    .submit(Submission {
                        jobs: &jobs,
                        descriptor: &descriptor,
                    })
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = dispatched {
            let e = WorkflowError::BackendSubmission(e);
            return Err(self.fail_run(&records, &active, e).await);
        }

        info!("workflow dispatched");
        Ok(RunOutcome::Dispatched(records.id()))
    }

    /// Bind the active jobs to the workflow and record them in its ledger.
    async fn commit(&self, records: &WorkflowRecords, active: &[&Job]) -> Result<(), WorkflowError> {
        let mut ledger = Vec::with_capacity(active.len());
        for job in active {
            job.set_workflow_id(records.id()).await?;
            job.set_status(JobStatus::Running).await?;
            ledger.push(job.id().clone());
        }
        records.record_jobs(&ledger).await?;
        info!(jobs = ledger.len(), "jobs committed to workflow");
        Ok(())
    }

    async fn construct(
        &self,
        project: &ProjectId,
        machine: &MachineId,
        roots: &[ImpressionId],
    ) -> Result<Vec<Job>, WorkflowError> {
        let mut root_jobs = Vec::with_capacity(roots.len());
        for id in roots {
            let job = self
                .source
                .load(project, id, Some(machine))
                .await
                .map_err(|e| WorkflowError::Construction(format!("root {}: {}", id, e)))?;
            root_jobs.push(job);
        }
        Assembler::new(self.source.as_ref(), project)
            .with_machine(machine)
            .assemble(root_jobs)
            .await
            .map_err(|e| WorkflowError::Construction(e.to_string()))
    }

    async fn fail_run(
        &self,
        records: &WorkflowRecords,
        active: &[&Job],
        cause: WorkflowError,
    ) -> WorkflowError {
        error!(error = %cause, "workflow run failed");
        if let Err(e) = records.set_status(WorkflowStatus::Failed).await {
            warn!(error = %e, "could not mark workflow failed");
        }
        for job in active {
            if let Err(e) = job.set_status(JobStatus::Failed).await {
                warn!(job = %job.id(), error = %e, "could not mark job failed");
            }
        }
        cause
    }

    /// Block until every input job is finished, polling the workflows that
    /// own them.
    async fn wait_for_dependencies(
        &self,
        project: &ProjectId,
        jobs: &[Job],
    ) -> Result<(), WorkflowError> {
        debug!(
            max_attempts = self.poll.max_attempts,
            max_wait_secs = self.poll.total_wait().as_secs(),
            "waiting on input workflows"
        );
        let mut attempt = 0;
        loop {
            attempt += 1;
            info!(attempt, max = self.poll.max_attempts, "checking dependencies");

            let mut pending = Vec::new();
            for job in jobs {
                if !job.is_input() || job.is_build() || job.is_rawdata() {
                    continue;
                }
                if !job.status().await?.is_available() {
                    pending.push(job);
                }
            }

            let mut owners: HashMap<WorkflowId, Box<dyn Backend>> = HashMap::new();
            for job in &pending {
                let Some(id) = job.workflow_id().await? else {
                    debug!(job = %job.id(), "input job has no workflow");
                    continue;
                };
                if owners.contains_key(&id) {
                    continue;
                }
                match self.rehydrate(project, id).await {
                    Ok(backend) => {
                        owners.insert(id, backend);
                    }
                    Err(e) => warn!(workflow = %id, error = %e, "cannot open dependency workflow"),
                }
            }

            for (id, backend) in &owners {
                if let Err(e) = backend.update_workflow_status().await {
                    warn!(workflow = %id, error = %e, "dependency poll failed");
                }
            }

            let mut unfinished = Vec::new();
            for job in pending {
                if let Some(backend) = match job.workflow_id().await? {
                    Some(id) => owners.get(&id),
                    None => None,
                } {
                    if let Err(e) = backend.sync_external_job_status(job).await {
                        warn!(job = %job.id(), error = %e, "dependency status sync failed");
                    }
                }
                let status = job.status().await?;
                if !status.is_available() {
                    debug!(job = %job.id(), status = %status, "dependency not finished");
                    unfinished.push(job.id().clone());
                }
            }

            if unfinished.is_empty() {
                info!(attempt, "all dependencies finished");
                return Ok(());
            }
            if !self.poll.has_next(attempt) {
                return Err(WorkflowError::DependencyTimeout {
                    attempts: attempt,
                    unfinished,
                });
            }
            tokio::time::sleep(self.poll.delay).await;
        }
    }

    /// Bring outputs of input jobs computed elsewhere into local storage.
    async fn stage_inputs(&self, project: &ProjectId, machine: &MachineId, jobs: &[Job]) {
        for job in jobs {
            if !job.is_input() || job.kind() != JobKind::Task || job.is_rawdata() {
                continue;
            }
            let Some(job_machine) = job.machine() else {
                continue;
            };
            let site_dir = job.site_dir(job_machine);
            if tokio::fs::try_exists(site_dir.join(Artifact::Outputs.marker()))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            if job_machine == machine && job.use_eos().await.unwrap_or(false) {
                continue;
            }
            let owner = match job.workflow_id().await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    debug!(job = %job.id(), "input job has no workflow to stage from");
                    continue;
                }
                Err(e) => {
                    warn!(job = %job.id(), error = %e, "cannot read input job workflow");
                    continue;
                }
            };
            let staged = match self.rehydrate(project, owner).await {
                Ok(backend) => backend.download_outputs(job.id()).await.map_err(WorkflowError::from),
                Err(e) => Err(e),
            };
            match staged {
                Ok(report) => debug!(job = %job.id(), files = report.transferred, "input staged"),
                Err(e) => warn!(job = %job.id(), error = %e, "failed to stage input"),
            }
        }
    }

    /// Compile every job and write the build script and its descriptor.
    async fn emit(
        &self,
        records: &WorkflowRecords,
        jobs: &[Job],
    ) -> Result<super::WorkflowDescriptor, WorkflowError> {
        let project = records.project();
        let machine = records.machine();
        let site = self
            .backends
            .site(machine)
            .await
            .map_err(|e| WorkflowError::Construction(e.to_string()))?;

        let compiler = Compiler::new(project, &self.default_image, &site.eos_mount_point)
            .with_kerberos(site.use_kerberos);
        let mut script = BuildScript::new(self.default_image.clone(), rule_dependencies(jobs))
            .with_kerberos(site.use_kerberos);

        for job in jobs {
            if job.kind() == JobKind::Task
                && job.is_input()
                && job.machine() == Some(machine)
                && job.use_eos().await?
            {
                script.extend_setup(compiler.setup_commands(job));
                script.extend_finalize(compiler.finalize_commands(job));
            }
        }

        let by_id: HashMap<&ImpressionId, &Job> = jobs.iter().map(|j| (j.id(), j)).collect();
        let mut seen = HashSet::new();
        for (i, job) in jobs.iter().enumerate() {
            if !seen.insert(job.id()) {
                continue;
            }
            let build = self.build_of(project, job, &by_id).await;
            let step = compiler.compile(job, build.as_ref(), job.use_eos().await?);
            debug!(index = i + 1, total = jobs.len(), step = %step.name, "compiled step");
            script.push_step(step);
        }

        let script_path = records.script_path();
        tokio::fs::write(&script_path, script.render())
            .await
            .map_err(|e| {
                WorkflowError::Construction(format!("{}: {}", script_path.display(), e))
            })?;

        let descriptor = script.descriptor(super::SCRIPT_FILE);
        let text = serde_json::to_string_pretty(&descriptor)
            .map_err(|e| WorkflowError::Construction(e.to_string()))?;
        let descriptor_path = records.descriptor_path();
        tokio::fs::write(&descriptor_path, text).await.map_err(|e| {
            WorkflowError::Construction(format!("{}: {}", descriptor_path.display(), e))
        })?;
        info!(steps = descriptor.steps.len(), "build script written");
        Ok(descriptor)
    }

    /// The build job a task runs against: its first build dependency.
    /// Dependencies whose records cannot be loaded are skipped.
    async fn build_of(
        &self,
        project: &ProjectId,
        job: &Job,
        assembled: &HashMap<&ImpressionId, &Job>,
    ) -> Option<Job> {
        if job.is_build() {
            return None;
        }
        for dep in job.dependencies() {
            let candidate = match assembled.get(dep) {
                Some(found) => (*found).clone(),
                None => match self.source.load(project, dep, None).await {
                    Ok(candidate) => candidate,
                    Err(e) => {
                        warn!(
                            job = %job.id(),
                            dependency = %dep,
                            error = %e,
                            "skipping unloadable dependency"
                        );
                        continue;
                    }
                },
            };
            if candidate.is_build() {
                return Some(candidate);
            }
        }
        None
    }

    /// Refresh a workflow's status record from its backend.
    pub async fn refresh(
        &self,
        project: &ProjectId,
        workflow: WorkflowId,
    ) -> Result<WorkflowStatus, WorkflowError> {
        let backend = self.rehydrate(project, workflow).await?;
        backend
            .update_workflow_status()
            .await
            .map_err(WorkflowError::StatusSync)?;
        Ok(backend.status().await?)
    }

    /// Stop a workflow and fail the jobs it executes.
    pub async fn kill(&self, project: &ProjectId, workflow: WorkflowId) -> Result<(), WorkflowError> {
        let backend = self.rehydrate(project, workflow).await?;
        backend.kill().await?;
        let records = backend.records();
        for id in records.jobs().await? {
            match self.source.load(project, &id, Some(records.machine())).await {
                Ok(job) => job.set_status(JobStatus::Failed).await?,
                Err(e) => warn!(job = %id, error = %e, "cannot load job of killed workflow"),
            }
        }
        info!(workflow = %workflow, "workflow killed");
        Ok(())
    }

    /// Whether the execution side of `machine` answers.
    pub async fn ping(&self, project: &ProjectId, machine: &MachineId) -> Result<bool, WorkflowError> {
        let backend = self.backends.open(self.records.scratch(project, machine)).await?;
        Ok(backend.ping().await?)
    }
}
