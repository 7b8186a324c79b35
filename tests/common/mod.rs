//! Common test utilities shared across integration tests.
//!
//! A [`Stage`] is a state root in a temporary directory, laid out the way
//! a worker sees it: job records under `Storage/`, the site registry, and
//! records written through a [`JsonFileStore`].

use impress::backend::EngineFactory;
use impress::config::Site;
use impress::testing::ScriptedEngine;
use impress::{
    BackendKind, Collector, EngineClient, ImpressionId, ImpressionStore, JobStatus, JsonFileStore,
    Layout, MachineId, MetadataStore, Orchestrator, PollPolicy, ProjectId, SiteBackends,
    SiteRegistry, WorkflowStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const IMAGE: &str = "docker.io/library/base:1";

/// Full impression id for a seven character name.
pub fn imp(name: &str) -> ImpressionId {
    ImpressionId::new(format!("{:0<32}", name))
}

/// One job record to write on disk.
pub struct JobRecord<'a> {
    pub name: &'a str,
    pub object_type: &'a str,
    pub dependencies: &'a [&'a str],
    pub aliases: &'a [(&'a str, &'a str)],
    pub manifest: &'a str,
    pub files: &'a [(&'a str, &'a str)],
}

impl<'a> JobRecord<'a> {
    pub fn task(name: &'a str, manifest: &'a str) -> Self {
        Self {
            name,
            object_type: "task",
            dependencies: &[],
            aliases: &[],
            manifest,
            files: &[],
        }
    }

    pub fn build(name: &'a str, manifest: &'a str) -> Self {
        Self {
            object_type: "algorithm",
            ..Self::task(name, manifest)
        }
    }
}

pub struct Stage {
    pub dir: TempDir,
    pub layout: Layout,
    pub store: Arc<dyn MetadataStore>,
    pub registry: SiteRegistry,
    pub project: ProjectId,
}

impl Stage {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let store: Arc<dyn MetadataStore> = Arc::new(JsonFileStore::new());
        let registry = SiteRegistry::new(store.clone(), layout.registry_record());
        Self {
            dir,
            layout,
            store,
            registry,
            project: ProjectId::new("0f1e2d3c4b5a69788796a5b4c3d2e1f0"),
        }
    }

    pub async fn site(&self, name: &str, kind: BackendKind) -> MachineId {
        self.registry
            .register(name, "https://engine.example", "secret", kind)
            .await
            .unwrap()
    }

    /// Write the records and contents of one job.
    pub async fn write_job(&self, record: JobRecord<'_>) -> ImpressionId {
        let id = imp(record.name);
        let dir = self.layout.job_dir(&self.project, &id);
        let config = dir.join("config.json");

        let deps: Vec<String> = record.dependencies.iter().map(|d| imp(d).to_string()).collect();
        let aliases: serde_json::Map<String, serde_json::Value> = record
            .aliases
            .iter()
            .map(|(alias, target)| (alias.to_string(), json!(imp(target).as_str())))
            .collect();
        let names: Vec<&str> = record.files.iter().map(|(name, _)| *name).collect();

        let store = self.store.as_ref();
        store.write_variable(&config, "object_type", json!(record.object_type)).await.unwrap();
        store.write_variable(&config, "dependencies", json!(deps)).await.unwrap();
        store
            .write_variable(&config, "alias_to_impression", aliases.into())
            .await
            .unwrap();
        store
            .write_variable(&config, "tree", json!([[".", [], names]]))
            .await
            .unwrap();

        let contents = dir.join("contents");
        std::fs::create_dir_all(&contents).unwrap();
        std::fs::write(contents.join("job.yaml"), record.manifest).unwrap();
        for (name, content) in record.files {
            std::fs::write(contents.join(name), content).unwrap();
        }
        id
    }

    /// Status of a job as stored in its record.
    pub async fn status(&self, id: &ImpressionId) -> JobStatus {
        let record = self.layout.job_dir(&self.project, id).join("status.json");
        impress::storage::read_or(self.store.as_ref(), &record, "status", JobStatus::Raw)
            .await
            .unwrap()
    }

    pub async fn set_status(&self, id: &ImpressionId, status: &str) {
        let record = self.layout.job_dir(&self.project, id).join("status.json");
        self.store
            .write_variable(&record, "status", json!(status))
            .await
            .unwrap();
    }

    pub fn workflows(&self) -> WorkflowStore {
        WorkflowStore::new(self.layout.clone(), self.store.clone())
    }

    /// Orchestrator and collector over the stage, talking to `engine` for
    /// every remote site.
    pub fn worker(&self, engine: Arc<ScriptedEngine>, poll: PollPolicy) -> (Orchestrator, Collector) {
        let source = Arc::new(ImpressionStore::new(
            self.layout.storage_root(),
            self.store.clone(),
            IMAGE,
        ));
        let factory: EngineFactory =
            Arc::new(move |_: &Site| engine.clone() as Arc<dyn EngineClient>);
        let backends =
            Arc::new(SiteBackends::new(self.registry.clone()).with_engine_factory(factory));

        let orchestrator = Orchestrator::new(source.clone(), self.workflows(), backends.clone())
            .with_poll(poll)
            .with_default_image(IMAGE);
        let collector = Collector::new(source, self.workflows(), backends, self.registry.clone());
        (orchestrator, collector)
    }
}

/// Poll once, without waiting.
pub fn no_wait() -> PollPolicy {
    PollPolicy::fixed(1, Duration::ZERO)
}
