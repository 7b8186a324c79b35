//! DAG assembly over stored job dependencies.
//!
//! The graph is never held in memory as a whole: the assembler walks it
//! from a set of roots, loading each dependency through a [`JobSource`]
//! as it is reached. The walk uses an explicit stack because job graphs
//! can be deep, and tracks visited impressions because a job is often
//! reachable through several paths.

use std::collections::{BTreeMap, HashSet};

use thiserror::Error;
use tracing::{debug, warn};

use super::job::{Job, JobError, JobKind, JobSource};
use super::types::{ImpressionId, MachineId, ProjectId};
use crate::storage::StorageError;

/// Rule name of the umbrella target.
pub const ALL_RULE: &str = "all";

/// Rule name of the bookkeeping rule that runs after every job.
pub const FINALIZE_RULE: &str = "finalize";

/// Errors that can occur while assembling a workflow's jobs.
#[derive(Debug, Error)]
pub enum DagError {
    /// A dependency could not be loaded.
    #[error("failed to load job: {0}")]
    Job(#[from] JobError),

    /// A job's status could not be read.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Expands root jobs into their execution-ordered transitive closure.
pub struct Assembler<'a> {
    source: &'a dyn JobSource,
    project: &'a ProjectId,
    machine: Option<&'a MachineId>,
}

impl<'a> Assembler<'a> {
    /// Create an assembler loading dependencies of `project` from `source`.
    pub fn new(source: &'a dyn JobSource, project: &'a ProjectId) -> Self {
        Self {
            source,
            project,
            machine: None,
        }
    }

    /// Builder: machine assigned to jobs that have none recorded.
    pub fn with_machine(mut self, machine: &'a MachineId) -> Self {
        self.machine = Some(machine);
        self
    }

    /// Walk the graph below `roots`.
    ///
    /// Jobs already running, queued or done elsewhere are emitted as soon
    /// as they are reached and are not expanded; task jobs among them are
    /// marked as inputs. Every other job is emitted after all of its
    /// dependencies. Jobs without a resolvable machine are dropped with a
    /// warning. The graph must be acyclic.
    pub async fn assemble(&self, roots: Vec<Job>) -> Result<Vec<Job>, DagError> {
        let mut visited: HashSet<ImpressionId> = HashSet::new();
        let mut jobs = Vec::new();
        let mut stack: Vec<(Job, bool)> = roots.into_iter().map(|job| (job, false)).collect();

        while let Some((mut job, expanded)) = stack.pop() {
            if visited.contains(job.id()) {
                continue;
            }

            if job.machine().is_none() {
                match self.machine {
                    Some(machine) => job = job.with_machine(machine.clone()),
                    None => {
                        warn!(job = %job.id(), "no machine for job, dropping it from the workflow");
                        continue;
                    }
                }
            }

            let status = job.status().await?;
            if status.blocks_expansion() {
                if job.kind() == JobKind::Task {
                    job.mark_input();
                }
                debug!(job = %job.id(), status = %status, "not expanding job");
                visited.insert(job.id().clone());
                jobs.push(job);
                continue;
            }

            if expanded {
                visited.insert(job.id().clone());
                jobs.push(job);
                continue;
            }

            let dependencies = job.dependencies().to_vec();
            stack.push((job, true));
            for dep in dependencies {
                if visited.contains(&dep) {
                    continue;
                }
                let dep_job = self.source.load(self.project, &dep, None).await?;
                stack.push((dep_job, false));
            }
        }

        Ok(jobs)
    }
}

/// Rule-name dependency map of the build script: every job's rule lists
/// the rules of its dependencies, and `all` depends on `finalize`.
pub fn rule_dependencies(jobs: &[Job]) -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(ALL_RULE.to_string(), vec![FINALIZE_RULE.to_string()]);
    for job in jobs {
        let deps = job.dependencies().iter().map(|d| d.rule_name()).collect();
        map.insert(job.id().rule_name(), deps);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::JobStatus;
    use crate::testing::FixtureJobs;

    fn ids(jobs: &[Job]) -> Vec<String> {
        jobs.iter().map(|j| j.id().short().to_string()).collect()
    }

    fn position(jobs: &[Job], short: &str) -> usize {
        jobs.iter()
            .position(|j| j.id().short() == short)
            .unwrap_or_else(|| panic!("{} missing", short))
    }

    #[tokio::test]
    async fn test_build_before_task() {
        let fixtures = FixtureJobs::new("p");
        let b = fixtures.build("bbbbbbb");
        fixtures.insert(b.clone());
        let t = fixtures.task("ttttttt").with_dependencies(vec![b.id().clone()]);
        fixtures.insert(t.clone());

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let jobs = assembler.assemble(vec![t]).await.unwrap();

        assert_eq!(ids(&jobs), vec!["bbbbbbb", "ttttttt"]);
        assert!(jobs.iter().all(|j| j.machine() == Some(&machine)));
    }

    #[tokio::test]
    async fn test_diamond_emits_each_job_once() {
        let fixtures = FixtureJobs::new("p");
        let a = fixtures.task("aaaaaaa");
        let b = fixtures.task("bbbbbbb").with_dependencies(vec![a.id().clone()]);
        let c = fixtures.task("ccccccc").with_dependencies(vec![a.id().clone()]);
        let d = fixtures
            .task("ddddddd")
            .with_dependencies(vec![b.id().clone(), c.id().clone()]);
        for job in [&a, &b, &c, &d] {
            fixtures.insert(job.clone());
        }

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let jobs = assembler.assemble(vec![d.clone(), b.clone()]).await.unwrap();

        assert_eq!(jobs.len(), 4);
        assert!(position(&jobs, "aaaaaaa") < position(&jobs, "bbbbbbb"));
        assert!(position(&jobs, "aaaaaaa") < position(&jobs, "ccccccc"));
        assert!(position(&jobs, "bbbbbbb") < position(&jobs, "ddddddd"));
        assert!(position(&jobs, "ccccccc") < position(&jobs, "ddddddd"));
    }

    #[tokio::test]
    async fn test_terminal_jobs_are_not_expanded() {
        let fixtures = FixtureJobs::new("p");
        let hidden = fixtures.task("hhhhhhh");
        let done = fixtures
            .task("fffffff")
            .with_dependencies(vec![hidden.id().clone()]);
        let root = fixtures
            .task("rrrrrrr")
            .with_dependencies(vec![done.id().clone()]);
        fixtures.insert(hidden);
        fixtures.insert(done.clone());
        fixtures.insert(root.clone());
        done.set_status(JobStatus::Finished).await.unwrap();

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let jobs = assembler.assemble(vec![root]).await.unwrap();

        assert_eq!(ids(&jobs), vec!["fffffff", "rrrrrrr"]);
        assert!(jobs[0].is_input());
        assert!(!jobs[1].is_input());
    }

    #[tokio::test]
    async fn test_running_build_is_not_marked_input() {
        let fixtures = FixtureJobs::new("p");
        let b = fixtures.build("bbbbbbb");
        fixtures.insert(b.clone());
        b.set_status(JobStatus::Running).await.unwrap();

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let jobs = assembler.assemble(vec![b]).await.unwrap();

        assert_eq!(jobs.len(), 1);
        assert!(!jobs[0].is_input());
    }

    #[tokio::test]
    async fn test_job_without_machine_is_dropped() {
        let fixtures = FixtureJobs::new("p");
        let dep = fixtures.task("ddddddd");
        let root = fixtures
            .task("rrrrrrr")
            .with_dependencies(vec![dep.id().clone()])
            .with_machine(MachineId::new("m1"));
        fixtures.insert(dep);
        fixtures.insert(root.clone());

        let assembler = Assembler::new(&fixtures, fixtures.project());
        let jobs = assembler.assemble(vec![root]).await.unwrap();

        assert_eq!(ids(&jobs), vec!["rrrrrrr"]);
    }

    #[tokio::test]
    async fn test_missing_dependency_is_an_error() {
        let fixtures = FixtureJobs::new("p");
        let root = fixtures
            .task("rrrrrrr")
            .with_dependencies(vec![FixtureJobs::id("nothere")]);
        fixtures.insert(root.clone());

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let result = assembler.assemble(vec![root]).await;
        assert!(matches!(result, Err(DagError::Job(_))));
    }

    #[tokio::test]
    async fn test_deep_chain_does_not_recurse() {
        let fixtures = FixtureJobs::new("p");
        let mut previous: Option<Job> = None;
        for i in 0..5000 {
            let mut job = fixtures.task(&format!("{:07}", i));
            if let Some(prev) = &previous {
                job = job.with_dependencies(vec![prev.id().clone()]);
            }
            fixtures.insert(job.clone());
            previous = Some(job);
        }

        let machine = MachineId::new("m1");
        let assembler = Assembler::new(&fixtures, fixtures.project()).with_machine(&machine);
        let jobs = assembler
            .assemble(vec![previous.unwrap()])
            .await
            .unwrap();

        assert_eq!(jobs.len(), 5000);
        assert_eq!(jobs[0].id().short(), "0000000");
        assert_eq!(jobs[4999].id().short(), "0004999");
    }

    #[test]
    fn test_rule_dependencies() {
        let fixtures = FixtureJobs::new("p");
        let b = fixtures.build("abcdef1");
        let t = fixtures.task("1234567").with_dependencies(vec![b.id().clone()]);
        let map = rule_dependencies(&[b, t]);

        assert_eq!(map["all"], vec!["finalize"]);
        assert_eq!(map["stepabcdef1"], Vec::<String>::new());
        assert_eq!(map["step1234567"], vec!["stepabcdef1"]);
    }
}
