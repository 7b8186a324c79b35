//! Compiles a job into the shell commands and step descriptor of its rule.
//!
//! Every job runs in a private directory `imp<short>` next to the
//! directories of the other jobs of the workflow. Dependencies are exposed
//! through symbolic links, and completion is signalled by `<short>.done`
//! in the workflow root.

use serde::{Deserialize, Serialize};

use super::job::{
    BuildSpec, DEFAULT_COMPUTE_BACKEND, EXTERNAL_COMPUTE_BACKEND, Job, JobSpec, TaskSpec,
};
use super::types::{ImpressionId, ProjectId};

/// Marker produced by the setup rule.
pub const SETUP_MARKER: &str = "setup.done";

/// Runtime class requested for steps on a non-default compute backend.
pub const EXTERNAL_RUNTIME_CLASS: &str = "espresso";

/// Resource directives of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Resources {
    /// Runs on the external batch cluster.
    External {
        compute_backend: String,
        #[serde(rename = "htcondor_max_runtime")]
        runtime_class: String,
        kerberos: bool,
    },
    /// Runs in the engine's default pool.
    Kubernetes {
        #[serde(rename = "kubernetes_memory_limit")]
        memory_limit: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        kerberos: bool,
    },
}

impl Resources {
    /// Whether the step needs kerberos credentials.
    pub fn kerberos(&self) -> bool {
        match self {
            Resources::External { kerberos, .. } | Resources::Kubernetes { kerberos, .. } => {
                *kerberos
            }
        }
    }
}

/// Backend-agnostic description of one job's rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Rule name, `step<short>`.
    pub name: String,
    /// Container image.
    pub environment: String,
    #[serde(flatten)]
    pub resources: Resources,
    /// Commands, in order.
    pub commands: Vec<String>,
    /// Markers that must exist before the rule runs.
    pub inputs: Vec<String>,
    /// Marker created when the rule completes.
    pub output: String,
}

impl StepSpec {
    /// The rule's shell command.
    pub fn shell(&self) -> String {
        self.commands.join(" && ")
    }
}

/// Per-workflow inputs of the compiler.
#[derive(Debug, Clone)]
pub struct Compiler<'a> {
    project: &'a ProjectId,
    default_image: &'a str,
    eos_mount_point: &'a str,
    use_kerberos: bool,
}

impl<'a> Compiler<'a> {
    /// Create a compiler for workflows of `project`.
    pub fn new(project: &'a ProjectId, default_image: &'a str, eos_mount_point: &'a str) -> Self {
        Self {
            project,
            default_image,
            eos_mount_point,
            use_kerberos: false,
        }
    }

    /// Builder: whether the workflow's site wants kerberos for bulk storage.
    pub fn with_kerberos(mut self, use_kerberos: bool) -> Self {
        self.use_kerberos = use_kerberos;
        self
    }

    /// Compile `job`.
    ///
    /// `build` is the build job a task runs against, if it has one.
    /// `use_eos` says whether the job's outputs go through bulk storage.
    pub fn compile(&self, job: &Job, build: Option<&Job>, use_eos: bool) -> StepSpec {
        match job.spec() {
            JobSpec::Task(spec) => self.compile_task(job, spec, build, use_eos),
            JobSpec::Build(spec) => self.compile_build(job, spec, use_eos),
        }
    }

    fn compile_task(
        &self,
        job: &Job,
        spec: &TaskSpec,
        build: Option<&Job>,
        use_eos: bool,
    ) -> StepSpec {
        let id = job.id();
        let mut commands = directory_commands(id);
        if let Some(build) = build {
            commands.push(format!("ln -s ../{} code", build.id().work_dir()));
        }
        commands.extend(alias_links(job));

        if !job.is_input() && spec.compute_backend != EXTERNAL_COMPUTE_BACKEND {
            let declared: &[String] = if spec.commands.is_empty() {
                match build.map(|b| b.spec()) {
                    Some(JobSpec::Build(b)) => &b.commands,
                    _ => &[],
                }
            } else {
                &spec.commands
            };
            for (i, line) in declared.iter().enumerate() {
                let line = substitute_task_line(line, job, build);
                let wrapped = format!("{{ {} ; }} >> logs/user_step{}.log 2>&1", line, i);
                commands.push(wrapped.replace('"', "\\\""));
            }
        }

        if use_eos && !job.is_input() {
            let target = self.eos_path(id);
            commands.push(format!("mkdir -p {}/", target));
            commands.push(format!("cp -r stageout/* {}/", target));
        }
        commands.extend(completion_commands(id));

        let environment = if job.is_input() {
            self.default_image.to_string()
        } else {
            spec.environment.clone()
        };
        let resources = if spec.compute_backend != DEFAULT_COMPUTE_BACKEND {
            Resources::External {
                compute_backend: spec.compute_backend.clone(),
                runtime_class: EXTERNAL_RUNTIME_CLASS.to_string(),
                kerberos: true,
            }
        } else {
            Resources::Kubernetes {
                memory_limit: spec.memory.clone(),
                kerberos: use_eos && self.use_kerberos,
            }
        };

        let inputs = if job.is_input() {
            vec![SETUP_MARKER.to_string()]
        } else {
            let mut inputs = vec![SETUP_MARKER.to_string()];
            let markers = job
                .dependencies()
                .iter()
                .chain(job.aliases().values())
                .chain(build.map(|b| b.id()))
                .map(|d| d.done_marker());
            for marker in markers {
                if !inputs.contains(&marker) {
                    inputs.push(marker);
                }
            }
            inputs
        };

        StepSpec {
            name: id.rule_name(),
            environment,
            resources,
            commands,
            inputs,
            output: id.done_marker(),
        }
    }

    fn compile_build(&self, job: &Job, spec: &BuildSpec, use_eos: bool) -> StepSpec {
        let id = job.id();
        let mut commands = directory_commands(id);
        commands.extend(alias_links(job));
        for rule in &spec.rules {
            let rule = substitute_aliases(rule, job)
                .replace("${workspace}", "..")
                .replace("${code}", &format!("../{}", id.work_dir()));
            commands.push(rule);
        }
        commands.extend(completion_commands(id));

        let mut inputs = vec![SETUP_MARKER.to_string()];
        for marker in job.dependencies().iter().map(|d| d.done_marker()) {
            if !inputs.contains(&marker) {
                inputs.push(marker);
            }
        }

        StepSpec {
            name: id.rule_name(),
            environment: spec.environment.clone(),
            resources: Resources::Kubernetes {
                memory_limit: spec.memory.clone(),
                kerberos: use_eos && self.use_kerberos,
            },
            commands,
            inputs,
            output: id.done_marker(),
        }
    }

    fn eos_path(&self, id: &ImpressionId) -> String {
        format!("{}/{}/{}", self.eos_mount_point, self.project, id)
    }

    /// Commands the setup rule runs to bring an input job's outputs in from
    /// bulk storage.
    pub fn setup_commands(&self, job: &Job) -> Vec<String> {
        let dir = job.id().work_dir();
        vec![
            format!("mkdir -p {}/stageout", dir),
            format!("cp -r {}/* {}/stageout/", self.eos_path(job.id()), dir),
        ]
    }

    /// Commands the finalize rule runs to drop staged-in outputs again.
    pub fn finalize_commands(&self, job: &Job) -> Vec<String> {
        vec![format!("rm -rf {}/stageout", job.id().work_dir())]
    }
}

fn directory_commands(id: &ImpressionId) -> Vec<String> {
    let dir = id.work_dir();
    vec![
        format!("mkdir -p {}/stageout", dir),
        format!("mkdir -p {}/logs", dir),
        format!("cd {}", dir),
    ]
}

fn alias_links(job: &Job) -> Vec<String> {
    job.aliases()
        .iter()
        .map(|(alias, target)| format!("ln -s ../{} {}", target.work_dir(), alias))
        .collect()
}

fn completion_commands(id: &ImpressionId) -> Vec<String> {
    vec!["cd ..".to_string(), format!("touch {}", id.done_marker())]
}

fn placeholder(name: &str) -> String {
    format!("${{{}}}", name)
}

fn substitute_aliases(line: &str, job: &Job) -> String {
    job.aliases()
        .iter()
        .fold(line.to_string(), |acc, (alias, target)| {
            acc.replace(&placeholder(alias), &format!("../{}", target.work_dir()))
        })
}

fn substitute_task_line(line: &str, job: &Job, build: Option<&Job>) -> String {
    let line = job
        .parameters()
        .iter()
        .fold(line.to_string(), |acc, (name, value)| {
            acc.replace(&placeholder(name), value)
        });
    let mut line = substitute_aliases(&line, job)
        .replace("${workspace}", "..")
        .replace("${output}", &job.id().work_dir());
    if let Some(build) = build {
        line = line.replace("${code}", &format!("../{}", build.id().work_dir()));
    }
    line
}
