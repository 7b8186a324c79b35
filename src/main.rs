//! impress - worker entry point.
//!
//! Each invocation performs one unit of work, the way a task queue calls it:
//!   impress run -p <project> -m <machine> <impression>...   Run a workflow
//!   impress refresh -p <project> <workflow>                Refresh its status
//!   impress kill -p <project> <impression>                 Kill and fail an impression
//!   impress collect -p <project> <impression>              Collect outputs or logs
//!   impress status -p <project> <impression>               Report an impression's status
//!   impress info -p <project> <impression>                 Report where it last ran
//!   impress ping <site>                                    Probe a site
//!   impress sites list|register|remove                     Manage the site registry

use clap::{Parser, Subcommand, ValueEnum};
use impress::{
    BackendKind, Collector, ImpressionId, ImpressionStore, JsonFileStore, MachineId,
    MetadataStore, Orchestrator, ProjectId, RunOutcome, Settings, SiteBackends, SiteRegistry,
    StatusCache, WorkflowId, WorkflowStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// impress - DAG batch orchestration worker
#[derive(Parser)]
#[command(name = "impress")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Settings file (YAML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow for a set of root impressions
    Run {
        #[arg(short, long)]
        project: String,

        /// Machine the workflow is bound to
        #[arg(short, long)]
        machine: String,

        #[arg(value_name = "IMPRESSION", required = true)]
        impressions: Vec<String>,
    },

    /// Refresh the status record of a workflow
    Refresh {
        #[arg(short, long)]
        project: String,

        #[arg(value_name = "WORKFLOW")]
        workflow: String,
    },

    /// Kill every workflow of an impression and mark it failed
    Kill {
        #[arg(short, long)]
        project: String,

        #[arg(value_name = "IMPRESSION")]
        impression: String,
    },

    /// Collect the results of an impression
    Collect {
        #[arg(short, long)]
        project: String,

        #[arg(value_name = "IMPRESSION")]
        impression: String,

        /// What to collect (default: by job status)
        #[arg(long, value_enum)]
        only: Option<Artifacts>,
    },

    /// Print the status of an impression
    Status {
        #[arg(short, long)]
        project: String,

        #[arg(value_name = "IMPRESSION")]
        impression: String,
    },

    /// Print the site and workflow an impression last ran on
    Info {
        #[arg(short, long)]
        project: String,

        #[arg(value_name = "IMPRESSION")]
        impression: String,
    },

    /// Check whether a site answers
    Ping {
        #[arg(value_name = "SITE")]
        site: String,
    },

    /// Manage execution sites
    Sites {
        #[command(subcommand)]
        command: SiteCommands,
    },
}

#[derive(Subcommand)]
enum SiteCommands {
    /// List registered sites
    List,

    /// Register a new site
    Register {
        name: String,

        /// Engine endpoint
        #[arg(long, default_value = "")]
        url: String,

        /// Engine access token
        #[arg(long, default_value = "")]
        token: String,

        /// Run workflows locally instead of on a remote engine
        #[arg(long)]
        local: bool,
    },

    /// Remove a site
    Remove { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Artifacts {
    Outputs,
    Logs,
}

/// Everything a unit of work needs, built from the settings.
struct Worker {
    orchestrator: Orchestrator,
    collector: Collector,
    registry: SiteRegistry,
}

impl Worker {
    fn new(settings: &Settings) -> Result<Self, Box<dyn std::error::Error>> {
        let layout = settings.layout()?;
        let store: Arc<dyn MetadataStore> = Arc::new(JsonFileStore::new());

        let source = Arc::new(ImpressionStore::new(
            layout.storage_root(),
            store.clone(),
            settings.default_image.clone(),
        ));
        let workflows = WorkflowStore::new(layout.clone(), store.clone())
            .with_cache(Arc::new(StatusCache::new(settings.status_cache_ttl())))
            .with_guard(settings.status_guard());
        let registry = SiteRegistry::new(store, layout.registry_record());
        let backends = Arc::new(SiteBackends::new(registry.clone()));

        let orchestrator = Orchestrator::new(source.clone(), workflows.clone(), backends.clone())
            .with_poll(settings.poll)
            .with_default_image(settings.default_image.clone());
        let collector = Collector::new(source, workflows, backends, registry.clone());
        Ok(Self {
            orchestrator,
            collector,
            registry,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let settings = match &cli.config {
        Some(path) => Settings::load_file(path)?,
        None => Settings::default(),
    };
    let worker = Worker::new(&settings)?;

    match cli.command {
        Commands::Run {
            project,
            machine,
            impressions,
        } => run_workflow(&worker, project, machine, impressions).await?,
        Commands::Refresh { project, workflow } => {
            let workflow = WorkflowId::parse(&workflow)
                .ok_or_else(|| format!("invalid workflow id '{}'", workflow))?;
            let status = worker
                .orchestrator
                .refresh(&ProjectId::new(project), workflow)
                .await?;
            println!("{}", status);
        }
        Commands::Kill {
            project,
            impression,
        } => {
            worker
                .collector
                .kill(&ProjectId::new(project), &ImpressionId::new(impression))
                .await?;
            println!("ok");
        }
        Commands::Collect {
            project,
            impression,
            only,
        } => {
            let project = ProjectId::new(project);
            let impression = ImpressionId::new(impression);
            let collector = &worker.collector;
            let report = match only {
                None => collector.collect(&project, &impression).await?,
                Some(Artifacts::Outputs) => collector.collect_outputs(&project, &impression).await?,
                Some(Artifacts::Logs) => collector.collect_logs(&project, &impression).await?,
            };
            if report.failed > 0 {
                warn!(failed = report.failed, "some files were not collected");
            }
            info!(
                transferred = report.transferred,
                skipped = report.skipped,
                "collection done"
            );
            println!("ok");
        }
        Commands::Status {
            project,
            impression,
        } => {
            let status = worker
                .collector
                .status(&ProjectId::new(project), &ImpressionId::new(impression))
                .await?;
            println!("{}", status);
        }
        Commands::Info {
            project,
            impression,
        } => {
            let placement = worker
                .collector
                .info(&ProjectId::new(project), &ImpressionId::new(impression))
                .await?;
            match placement {
                Some(placement) => println!("{}", placement),
                None => println!("UNDEFINED"),
            }
        }
        Commands::Ping { site } => ping(&worker, &site).await?,
        Commands::Sites { command } => manage_sites(&worker.registry, command).await?,
    }

    Ok(())
}

/// Run one workflow and report how it ended.
async fn run_workflow(
    worker: &Worker,
    project: String,
    machine: String,
    impressions: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let roots: Vec<ImpressionId> = impressions.into_iter().map(ImpressionId::new).collect();
    let outcome = worker
        .orchestrator
        .run(&ProjectId::new(project), &roots, &MachineId::new(machine))
        .await;

    match outcome {
        Ok(RunOutcome::Dispatched(id)) => {
            println!("{}", id);
            Ok(())
        }
        Ok(RunOutcome::Aborted {
            workflow,
            unfinished,
        }) => {
            warn!(
                workflow = %workflow,
                unfinished = unfinished.len(),
                "dependencies did not finish, resubmit later"
            );
            println!("aborted");
            Ok(())
        }
        Err(e) => {
            error!("Workflow run failed: {}", e);
            Err(e.into())
        }
    }
}

async fn ping(worker: &Worker, site: &str) -> Result<(), Box<dyn std::error::Error>> {
    let Some(machine) = worker.registry.machine_id(site).await? else {
        return Err(format!("unknown site '{}'", site).into());
    };
    // Scratch records are never written, so the project is arbitrary.
    let alive = worker
        .orchestrator
        .ping(&ProjectId::new("ping"), &machine)
        .await?;
    println!("{}", if alive { "ok" } else { "unreachable" });
    Ok(())
}

async fn manage_sites(
    registry: &SiteRegistry,
    command: SiteCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        SiteCommands::List => {
            let sites = registry.sites().await?;
            if sites.is_empty() {
                println!("No sites registered");
            }
            for site in sites {
                println!("{} ({})", site.name, site.machine);
                println!("  Backend: {}", site.kind);
                if !site.url.is_empty() {
                    println!("  URL: {}", site.url);
                }
                println!("  Kerberos: {}", site.use_kerberos);
                println!("  Bulk storage: {}", site.eos_mount_point);
            }
        }
        SiteCommands::Register {
            name,
            url,
            token,
            local,
        } => {
            let kind = if local {
                BackendKind::Local
            } else {
                BackendKind::Remote
            };
            let machine = registry.register(&name, &url, &token, kind).await?;
            println!("{}", machine);
        }
        SiteCommands::Remove { name } => {
            registry.remove(&name).await?;
            println!("ok");
        }
    }
    Ok(())
}
