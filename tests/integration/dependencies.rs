//! Runs whose inputs are still being computed by other workflows.

use crate::common::{JobRecord, Stage, imp, no_wait};
use impress::testing::ScriptedEngine;
use impress::{BackendKind, JobStatus, MachineId, PollPolicy, RunOutcome};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

async fn chain_stage(stage: &Stage) {
    stage
        .write_job(JobRecord::build("bbbbbbb", "build:\n  - make\n"))
        .await;
    for name in ["ttttttt", "vvvvvvv"] {
        stage
            .write_job(JobRecord {
                dependencies: &["bbbbbbb"],
                ..JobRecord::task(name, "commands:\n  - ./fill\n")
            })
            .await;
    }
    stage
        .write_job(JobRecord {
            dependencies: &["ttttttt", "vvvvvvv"],
            aliases: &[("a", "ttttttt"), ("b", "vvvvvvv")],
            ..JobRecord::task("uuuuuuu", "commands:\n  - hadd ${a} ${b}\n")
        })
        .await;
}

fn status_polls(engine: &ScriptedEngine) -> usize {
    engine
        .calls()
        .iter()
        .filter(|call| call.as_str() == "workflow_status")
        .count()
}

fn finished_steps() -> serde_json::Value {
    let logs = json!({
        "a": {"job_name": "stepttttttt", "status": "finished", "logs": ""},
        "b": {"job_name": "stepvvvvvvv", "status": "finished", "logs": ""}
    });
    json!({"status": "finished", "logs": logs.to_string()})
}

async fn dispatch_inputs(stage: &Stage, engine: Arc<ScriptedEngine>, machine: &MachineId) {
    let (orchestrator, _) = stage.worker(engine, no_wait());
    let outcome = orchestrator
        .run(&stage.project, &[imp("ttttttt"), imp("vvvvvvv")], machine)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Dispatched(_)));
}

#[tokio::test]
async fn test_unfinished_inputs_abort_after_attempts() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    chain_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    dispatch_inputs(&stage, engine.clone(), &machine).await;
    engine.set_status(json!({"status": "running", "logs": "{}"}));

    let before = status_polls(&engine);
    let (orchestrator, _) = stage.worker(engine.clone(), PollPolicy::fixed(3, Duration::ZERO));
    let outcome = orchestrator
        .run(&stage.project, &[imp("uuuuuuu")], &machine)
        .await
        .unwrap();

    let RunOutcome::Aborted {
        workflow,
        mut unfinished,
    } = outcome
    else {
        panic!("expected abort, got {:?}", outcome);
    };
    unfinished.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(unfinished, vec![imp("ttttttt"), imp("vvvvvvv")]);

    // Both inputs share one workflow, polled once per attempt.
    assert_eq!(status_polls(&engine) - before, 3);

    assert_eq!(stage.status(&imp("uuuuuuu")).await, JobStatus::Raw);
    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Running);

    let records = stage.workflows().open(&stage.project, workflow).await.unwrap();
    assert!(records.jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_inputs_finishing_mid_wait_release_the_run() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    chain_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    dispatch_inputs(&stage, engine.clone(), &machine).await;
    engine.set_status(json!({"status": "running", "logs": "{}"}));

    let finisher = {
        let engine = engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.set_status(finished_steps());
        })
    };

    let (orchestrator, _) =
        stage.worker(engine.clone(), PollPolicy::fixed(50, Duration::from_millis(10)));
    let outcome = orchestrator
        .run(&stage.project, &[imp("uuuuuuu")], &machine)
        .await
        .unwrap();
    finisher.await.unwrap();

    assert!(matches!(outcome, RunOutcome::Dispatched(_)));
    assert_eq!(stage.status(&imp("ttttttt")).await, JobStatus::Finished);
    assert_eq!(stage.status(&imp("vvvvvvv")).await, JobStatus::Finished);
    assert_eq!(stage.status(&imp("uuuuuuu")).await, JobStatus::Running);
}

#[tokio::test]
async fn test_finished_inputs_are_staged_from_their_workflow() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    chain_stage(&stage).await;
    let engine = Arc::new(ScriptedEngine::new());
    dispatch_inputs(&stage, engine.clone(), &machine).await;
    engine.set_status(finished_steps());
    engine.put_file("impttttttt/stageout/t.root", b"t");
    engine.put_file("impvvvvvvv/stageout/v.root", b"v");

    let (orchestrator, _) = stage.worker(engine.clone(), no_wait());
    let outcome = orchestrator
        .run(&stage.project, &[imp("uuuuuuu")], &machine)
        .await
        .unwrap();
    assert!(matches!(outcome, RunOutcome::Dispatched(_)));

    let site = stage
        .layout
        .job_dir(&stage.project, &imp("ttttttt"))
        .join(machine.as_str());
    assert_eq!(std::fs::read(site.join("stageout/t.root")).unwrap(), b"t");
    assert!(site.join("stageout.downloaded").exists());
}

#[tokio::test]
async fn test_rawdata_inputs_are_available_without_a_workflow() {
    let stage = Stage::new();
    let machine = stage.site("cern", BackendKind::Remote).await;
    let raw = stage
        .write_job(JobRecord::task("rrrrrrr", "environment: rawdata\n"))
        .await;
    let rawdata = stage.layout.job_dir(&stage.project, &raw).join("rawdata");
    std::fs::create_dir_all(&rawdata).unwrap();
    std::fs::write(rawdata.join("events.root"), b"events").unwrap();
    stage
        .write_job(JobRecord {
            dependencies: &["rrrrrrr"],
            aliases: &[("data", "rrrrrrr")],
            ..JobRecord::task("sssssss", "commands:\n  - skim ${data}\n")
        })
        .await;

    let engine = Arc::new(ScriptedEngine::new());
    let (orchestrator, _) = stage.worker(engine.clone(), no_wait());
    let outcome = orchestrator
        .run(&stage.project, &[imp("sssssss")], &machine)
        .await
        .unwrap();

    assert!(matches!(outcome, RunOutcome::Dispatched(_)));
    assert_eq!(status_polls(&engine), 0);
    assert_eq!(stage.status(&raw).await, JobStatus::Raw);
    assert_eq!(stage.status(&imp("sssssss")).await, JobStatus::Running);
    assert_eq!(
        engine.uploaded("imprrrrrrr/stageout/events.root"),
        Some(b"events".to_vec())
    );
}
