//! The build script handed to the execution engine, and its descriptor.
//!
//! The script declares one rule per job plus three bookkeeping rules:
//! `setup` (stages bulk-storage inputs in), `finalize` (waits for every
//! job and cleans staged inputs up) and the umbrella `all`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::core::dag::{ALL_RULE, FINALIZE_RULE};
use crate::core::{Resources, SETUP_MARKER, StepSpec};

/// Engine tag of the build script format.
pub const ENGINE_TYPE: &str = "snakemake";

/// Rule name of the setup rule.
pub const SETUP_RULE: &str = "setup";

/// Marker produced by the finalize rule.
pub const FINALIZE_MARKER: &str = "finalize.done";

/// Memory limit of the bookkeeping rules.
const BOOKKEEPING_MEMORY: &str = "1Gi";

const INDENT: &str = "    ";

/// Structured description of a workflow: its dependency map and steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    /// Rule name to the rules it depends on.
    pub job_dependencies: BTreeMap<String, Vec<String>>,
    /// One step per job, in execution order.
    pub steps: Vec<StepSpec>,
    /// Build script format.
    #[serde(rename = "type")]
    pub engine: String,
    /// Build script file name.
    pub file: String,
}

impl WorkflowDescriptor {
    /// Rule names of the job steps.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Request body creating this workflow on a remote engine.
    pub fn engine_specification(&self) -> Value {
        json!({
            "workflow": {
                "specification": {
                    "job_dependencies": self.job_dependencies,
                    "steps": self.steps,
                },
                "type": self.engine,
                "file": self.file,
            }
        })
    }
}

/// A build script under construction.
#[derive(Debug, Clone)]
pub struct BuildScript {
    image: String,
    use_kerberos: bool,
    dependencies: BTreeMap<String, Vec<String>>,
    setup: Vec<String>,
    finalize: Vec<String>,
    steps: Vec<StepSpec>,
}

impl BuildScript {
    /// Start a script whose bookkeeping rules run in `image`, with the
    /// job rule dependency map `dependencies`.
    pub fn new(image: impl Into<String>, dependencies: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            image: image.into(),
            use_kerberos: false,
            dependencies,
            setup: Vec::new(),
            finalize: Vec::new(),
            steps: Vec::new(),
        }
    }

    /// Builder: whether the site wants kerberos for bulk-storage access.
    pub fn with_kerberos(mut self, use_kerberos: bool) -> Self {
        self.use_kerberos = use_kerberos;
        self
    }

    /// Append commands to the setup rule.
    pub fn extend_setup(&mut self, commands: impl IntoIterator<Item = String>) {
        self.setup.extend(commands);
    }

    /// Append commands to the finalize rule.
    pub fn extend_finalize(&mut self, commands: impl IntoIterator<Item = String>) {
        self.finalize.extend(commands);
    }

    /// Append a job step.
    pub fn push_step(&mut self, step: StepSpec) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[StepSpec] {
        &self.steps
    }

    /// The descriptor of this script.
    pub fn descriptor(&self, file: &str) -> WorkflowDescriptor {
        let mut job_dependencies = self.dependencies.clone();
        job_dependencies
            .entry(ALL_RULE.to_string())
            .or_insert_with(|| vec![FINALIZE_RULE.to_string()]);
        job_dependencies.insert(SETUP_RULE.to_string(), Vec::new());
        job_dependencies.insert(
            FINALIZE_RULE.to_string(),
            self.steps.iter().map(|s| s.name.clone()).collect(),
        );
        WorkflowDescriptor {
            job_dependencies,
            steps: self.steps.clone(),
            engine: ENGINE_TYPE.to_string(),
            file: file.to_string(),
        }
    }

    /// Render the script text.
    pub fn render(&self) -> String {
        let mut out = Writer::default();

        out.line(0, &format!("rule {}:", ALL_RULE));
        out.line(1, "input:");
        out.line(2, &format!("\"{}\",", FINALIZE_MARKER));

        out.blank();
        out.line(0, &format!("rule {}:", SETUP_RULE));
        out.line(1, "input:");
        out.line(1, "output:");
        out.line(2, &format!("\"{}\",", SETUP_MARKER));
        self.bookkeeping_body(&mut out, &self.setup, SETUP_MARKER, !self.setup.is_empty());

        out.blank();
        out.line(0, &format!("rule {}:", FINALIZE_RULE));
        out.line(1, "input:");
        for step in &self.steps {
            out.line(2, &format!("\"{}\",", step.output));
        }
        out.line(1, "output:");
        out.line(2, &format!("\"{}\"", FINALIZE_MARKER));
        self.bookkeeping_body(&mut out, &self.finalize, FINALIZE_MARKER, false);

        for step in &self.steps {
            out.blank();
            render_step(&mut out, step);
        }
        out.finish()
    }

    fn bookkeeping_body(&self, out: &mut Writer, commands: &[String], marker: &str, kerberos: bool) {
        out.line(1, "container:");
        out.line(2, &format!("\"docker://{}\"", self.image));
        out.line(1, "resources:");
        if kerberos && self.use_kerberos {
            out.line(2, "kerberos=True,");
        }
        out.line(2, &format!("kubernetes_memory_limit=\"{}\"", BOOKKEEPING_MEMORY));
        out.line(1, "shell:");
        let touch = format!("touch {}", marker);
        if commands.is_empty() {
            out.line(2, &format!("\"{}\"", touch));
        } else {
            let shell = escape_braces(&commands.join(" && "));
            out.line(2, &format!("\"{} && {}\"", shell, touch));
        }
    }
}

fn render_step(out: &mut Writer, step: &StepSpec) {
    out.line(0, &format!("rule {}:", step.name));
    out.line(1, "input:");
    for input in &step.inputs {
        out.line(2, &format!("\"{}\",", input));
    }
    out.line(1, "output:");
    out.line(2, &format!("\"{}\"", step.output));
    out.line(1, "container:");
    out.line(2, &format!("\"docker://{}\"", step.environment));
    out.line(1, "resources:");
    match &step.resources {
        Resources::External {
            compute_backend,
            runtime_class,
            ..
        } => {
            out.line(2, &format!("compute_backend=\"{}\",", compute_backend));
            out.line(2, &format!("htcondor_max_runtime=\"{}\",", runtime_class));
            out.line(2, "kerberos=True,");
        }
        Resources::Kubernetes {
            memory_limit,
            kerberos,
        } => {
            if *kerberos {
                out.line(2, "kerberos=True,");
            }
            out.line(2, &format!("kubernetes_memory_limit=\"{}\"", memory_limit));
        }
    }
    out.line(1, "shell:");
    out.line(2, &format!("\"{}\"", escape_braces(&step.shell())));
}

/// Shell strings are format strings to the engine.
fn escape_braces(shell: &str) -> String {
    shell.replace('{', "{{").replace('}', "}}")
}

#[derive(Default)]
struct Writer {
    text: String,
}

impl Writer {
    fn line(&mut self, level: usize, content: &str) {
        for _ in 0..level {
            self.text.push_str(INDENT);
        }
        self.text.push_str(content);
        self.text.push('\n');
    }

    fn blank(&mut self) {
        self.text.push('\n');
    }

    fn finish(self) -> String {
        self.text
    }
}
