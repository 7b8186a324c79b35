//! Workflows submitted to a remote engine.

use crate::common::{JobRecord, Stage, imp, no_wait};
use impress::testing::ScriptedEngine;
use impress::{
    BackendKind, ImpressionStatus, JobStatus, RunOutcome, WorkflowError, WorkflowId,
    WorkflowStatus,
};
use serde_json::json;
use std::sync::Arc;

async fn two_job_stage(stage: &Stage) {
    stage
        .write_job(JobRecord {
            files: &[("Makefile", "all:\n")],
            ..JobRecord::build("bbbbbbb", "build:\n  - make\n")
        })
        .await;
    stage
        .write_job(JobRecord {
            dependencies: &["bbbbbbb"],
            aliases: &[("code", "bbbbbbb")],
            files: &[("run.sh", "echo $1")],
            ..JobRecord::task("ttttttt", "commands:\n  - sh run.sh\n")
        })
        .await;
}

fn only_workflow(stage: &Stage) -> WorkflowId {
    let dir = stage.dir.path().join("Workflows").join(stage.project.as_str());
    let entries: Vec<_> = std::fs::read_dir(dir).unwrap().collect();
    assert_eq!(entries.len(), 1);
    let name = entries[0].as_ref().unwrap().file_name();
    WorkflowId::parse(name.to_str().unwrap()).unwrap()
}

#[tokio::test]
async fn test_submit_uploads_workspace_and_starts() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    two_job_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    let (orchestrator, _) = stage.worker(engine.clone(), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };

    let calls = engine.calls();
    assert_eq!(calls.first().map(String::as_str), Some("create_workflow"));
    assert_eq!(calls.last().map(String::as_str), Some("start_workflow"));

    assert_eq!(engine.uploaded("impttttttt/run.sh"), Some(b"echo $1".to_vec()));
    assert_eq!(engine.uploaded("impbbbbbbb/Makefile"), Some(b"all:\n".to_vec()));

    let records = stage.workflows().open(&stage.project, id).await.unwrap();
    let script = std::fs::read(records.script_path()).unwrap();
    assert_eq!(engine.uploaded("Snakefile"), Some(script));

    let manifest = String::from_utf8(engine.uploaded("reana.yaml").unwrap()).unwrap();
    assert!(manifest.contains("snakemake"));
    assert!(manifest.contains("Snakefile"));
}

#[tokio::test]
async fn test_refresh_and_collect_finished_step() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    two_job_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    let (orchestrator, collector) = stage.worker(engine.clone(), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };

    let logs = json!({
        "1f": {
            "job_name": "stepttttttt",
            "status": "finished",
            "logs": "drawing\n",
            "started_at": "2024-05-01T10:00:00",
            "finished_at": "2024-05-01T10:02:00"
        }
    });
    engine.set_status(json!({"status": "finished", "logs": logs.to_string()}));
    let status = orchestrator.refresh(&stage.project, id).await.unwrap();
    assert_eq!(status, WorkflowStatus::Finished);

    let t = imp("ttttttt");
    let status = collector.status(&stage.project, &t).await.unwrap();
    assert_eq!(status, ImpressionStatus::Job(JobStatus::Finished));

    let site = stage.layout.job_dir(&stage.project, &t).join(machine.as_str());
    assert_eq!(
        std::fs::read_to_string(site.join("logs/job.stdout")).unwrap(),
        "drawing\n"
    );
    let duration = stage
        .store
        .read_variable(&site.join("status.json"), "duration")
        .await
        .unwrap();
    assert_eq!(duration, Some(json!(120)));

    engine.put_file("impttttttt/stageout/hist.root", b"h");
    let report = collector.collect_outputs(&stage.project, &t).await.unwrap();
    assert_eq!(report.transferred, 1);
    assert_eq!(std::fs::read(site.join("stageout/hist.root")).unwrap(), b"h");
    assert!(site.join("stageout.downloaded").exists());
}

#[tokio::test]
async fn test_rejected_start_fails_run() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    two_job_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    engine.fail_on("start_workflow");
    let (orchestrator, _) = stage.worker(engine, no_wait());

    let result = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await;
    assert!(matches!(result, Err(WorkflowError::BackendSubmission(_))));
    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Failed);

    let id = only_workflow(&stage);
    let records = stage.workflows().open(&stage.project, id).await.unwrap();
    assert_eq!(records.status().await.unwrap(), WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_unreachable_engine_is_recoverable_on_refresh() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    two_job_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    let (orchestrator, _) = stage.worker(engine.clone(), no_wait());

    let RunOutcome::Dispatched(id) = orchestrator
        .run(&stage.project, &[imp("ttttttt")], &machine)
        .await
        .unwrap()
    else {
        panic!("expected dispatch");
    };

    engine.fail_on("workflow_status");
    let Err(WorkflowError::StatusSync(e)) = orchestrator.refresh(&stage.project, id).await else {
        panic!("expected a status sync error");
    };
    assert!(e.is_recoverable());
}

#[tokio::test]
async fn test_ping_reaches_engine() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    let engine = Arc::new(ScriptedEngine::new());
    let (orchestrator, _) = stage.worker(engine.clone(), no_wait());

    assert!(orchestrator.ping(&stage.project, &machine).await.unwrap());
    assert_eq!(engine.calls(), vec!["ping"]);
}
