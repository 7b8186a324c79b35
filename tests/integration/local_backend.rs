//! Workflows run on a local site.
//!
//! The local backend only materialises the execution tree; these tests
//! play the part of the external runner by writing completion markers and
//! outputs into it.

use crate::common::{JobRecord, Stage, imp, no_wait};
use impress::testing::ScriptedEngine;
use impress::{BackendKind, ImpressionStatus, JobStatus, RunOutcome, WorkflowId, WorkflowStatus};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

const BUILD_MANIFEST: &str = "build:\n  - make\ncommands:\n  - ./bin/run\n";
const TASK_MANIFEST: &str = "commands:\n  - sh run.sh ${n}\nparameters:\n  n: 3\n";

async fn two_job_stage(stage: &Stage) {
    stage
        .write_job(JobRecord {
            files: &[("Makefile", "all:\n")],
            ..JobRecord::build("bbbbbbb", BUILD_MANIFEST)
        })
        .await;
    stage
        .write_job(JobRecord {
            dependencies: &["bbbbbbb"],
            aliases: &[("code", "bbbbbbb")],
            files: &[("run.sh", "echo $1")],
            ..JobRecord::task("ttttttt", TASK_MANIFEST)
        })
        .await;
}

fn exec_dir(stage: &Stage, id: WorkflowId) -> PathBuf {
    stage.layout.local_workflow_dir(&id)
}

/// Pretend the runner finished `shorts`, leaving outputs for `ttttttt`.
fn run_by_hand(exec: &std::path::Path, shorts: &[&str]) {
    for short in shorts {
        std::fs::write(exec.join(format!("{}.done", short)), "").unwrap();
    }
    let work = exec.join("impttttttt");
    std::fs::create_dir_all(work.join("stageout")).unwrap();
    std::fs::create_dir_all(work.join("logs")).unwrap();
    std::fs::write(work.join("stageout/hist.root"), "h").unwrap();
    std::fs::write(work.join("logs/user_step0.log"), "3").unwrap();
}

#[tokio::test]
async fn test_run_materialises_execution_tree() {
    let stage = Stage::new();
    let machine = stage.site("laptop", BackendKind::Local).await;
    two_job_stage(&stage).await;
    let (orchestrator, _) = stage.worker(Arc::new(ScriptedEngine::new()), no_wait());

    let outcome = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap();
    let RunOutcome::Dispatched(id) = outcome else {
        panic!("expected dispatch, got {:?}", outcome);
    };

    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Running);
    assert_eq!(stage.status(&imp("bbbbbbb")).await, JobStatus::Raw);

    let exec = exec_dir(&stage, id);
    assert!(exec.join("Snakefile").exists());
    assert!(exec.join("workflow_info.json").exists());
    assert_eq!(
        std::fs::read_to_string(exec.join("impttttttt/run.sh")).unwrap(),
        "echo $1"
    );
    assert!(exec.join("impbbbbbbb/Makefile").exists());

    let script = std::fs::read_to_string(exec.join("Snakefile")).unwrap();
    assert!(script.contains("sh run.sh 3"));
    assert!(script.contains("bbbbbbb.done"));

    let records = stage.workflows().open(&stage.project, id).await.unwrap();
    assert_eq!(records.status().await.unwrap(), WorkflowStatus::Ready);
    assert_eq!(records.jobs().await.unwrap(), vec![imp("ttttttt")]);
}

#[tokio::test]
async fn test_refresh_reports_marker_progress() {
    let stage = Stage::new();
    let machine = stage.site("laptop", BackendKind::Local).await;
    two_job_stage(&stage).await;
    let (orchestrator, _) = stage.worker(Arc::new(ScriptedEngine::new()), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };
    let exec = exec_dir(&stage, id);

    run_by_hand(&exec, &["bbbbbbb"]);
    let status = orchestrator.refresh(&stage.project, id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Running);
    let records = stage.workflows().open(&stage.project, id).await.unwrap();
    assert_eq!(
        records.results().await.unwrap()["progress"],
        json!({"total": 2, "completed": 1})
    );

    run_by_hand(&exec, &["ttttttt"]);
    let status = orchestrator.refresh(&stage.project, id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Finished);
}

#[tokio::test]
async fn test_collect_after_manual_run() {
    let stage = Stage::new();
    let machine = stage.site("laptop", BackendKind::Local).await;
    two_job_stage(&stage).await;
    let (orchestrator, collector) = stage.worker(Arc::new(ScriptedEngine::new()), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };
    run_by_hand(&exec_dir(&stage, id), &["bbbbbbb", "ttttttt"]);
    orchestrator.refresh(&stage.project, id).await.unwrap();

    let t = imp("ttttttt");
    let status = collector.status(&stage.project, &t).await.unwrap();
    assert_eq!(status, ImpressionStatus::Job(JobStatus::Finished));

    let report = collector.collect(&stage.project, &t).await.unwrap();
    assert_eq!(report.transferred, 2);
    assert_eq!(report.failed, 0);

    let site = stage.layout.job_dir(&stage.project, &t).join(machine.as_str());
    assert_eq!(std::fs::read_to_string(site.join("stageout/hist.root")).unwrap(), "h");
    assert!(site.join("logs/user_step0.log").exists());
    assert!(site.join("stageout.downloaded").exists());
    assert!(site.join("logs.downloaded").exists());

    let again = collector.collect(&stage.project, &t).await.unwrap();
    assert_eq!(again.transferred, 0);

    let placement = collector.info(&stage.project, &t).await.unwrap().unwrap();
    assert_eq!(placement.to_string(), format!("laptop {}", id));
}

#[tokio::test]
async fn test_dependant_run_stages_finished_inputs() {
    let stage = Stage::new();
    let machine = stage.site("laptop", BackendKind::Local).await;
    two_job_stage(&stage).await;
    stage
        .write_job(JobRecord {
            dependencies: &["ttttttt"],
            aliases: &[("hist", "ttttttt")],
            ..JobRecord::task("uuuuuuu", "commands:\n  - draw ${hist}/stageout/hist.root\n")
        })
        .await;
    let (orchestrator, _) = stage.worker(Arc::new(ScriptedEngine::new()), no_wait());

    let RunOutcome::Dispatched(first) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };
    // The runner is done but nobody has looked at the workflow yet.
    run_by_hand(&exec_dir(&stage, first), &["bbbbbbb", "ttttttt"]);

    let RunOutcome::Dispatched(second) = orchestrator
        .run(&stage.project, &[imp("uuuuuuu")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };

    let t_site = stage
        .layout
        .job_dir(&stage.project, &imp("ttttttt"))
        .join(machine.as_str());
    assert!(t_site.join("stageout.downloaded").exists());

    let exec = exec_dir(&stage, second);
    assert!(exec.join("impttttttt/stageout/hist.root").exists());
    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Finished);
    assert_eq!(stage.status(&imp("uuuuuuu")).await, JobStatus::Running);

    let records = stage.workflows().open(&stage.project, second).await.unwrap();
    assert_eq!(records.jobs().await.unwrap(), vec![imp("uuuuuuu")]);
    let script = std::fs::read_to_string(exec.join("Snakefile")).unwrap();
    assert!(script.contains("draw ../impttttttt/stageout/hist.root"));
}

#[tokio::test]
async fn test_kill_fails_impression() {
    let stage = Stage::new();
    let machine = stage.site("laptop", BackendKind::Local).await;
    two_job_stage(&stage).await;
    let (orchestrator, collector) = stage.worker(Arc::new(ScriptedEngine::new()), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };

    collector.kill(&stage.project, &imp("ttttttt")).await.unwrap();
    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Failed);
    let records = stage.workflows().open(&stage.project, id).await.unwrap();
    assert_eq!(records.status().await.unwrap(), WorkflowStatus::Killed);
}
