//! Orchestrator Integration Tests
//!
//! End-to-end deployments over in-memory fakes: stage ordering, halting,
//! inconclusive runs and resumption from the run log.

mod common;

use std::time::Duration;

use lakehouse_deploy::core::{DeploymentPlan, EventStore, Orchestrator, PollSettings};
use lakehouse_deploy::domain::{EventType, RunState, Stage, WorkflowStatus};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

use common::{ctx, orchestrator, FakeControlPlane, FakeWorkflowService};

fn sample_plan() -> DeploymentPlan {
    DeploymentPlan::from_yaml(include_str!("../deployments/analytics-lakehouse.yaml")).unwrap()
}

fn polling(max_attempts: u32) -> PollSettings {
    PollSettings {
        interval_seconds: 5,
        max_attempts,
    }
}

async fn event_types(runs_dir: &std::path::Path, run_id: uuid::Uuid) -> Vec<EventType> {
    let store = EventStore::open(runs_dir, run_id).await.unwrap();
    store
        .replay()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_full_deployment() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    workflows.script("copy-data", &["ACTIVE", "SUCCEEDED"]);
    workflows.script("project-setup", &["QUEUED", "ACTIVE", "SUCCEEDED"]);
    let plan = sample_plan();
    let ctx = ctx();

    let run = assert_ok!(
        orchestrator(&control_plane, &workflows, polling(150))
            .deploy(&ctx, &plan, temp.path())
            .await
    );

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.resources.len(), plan.resources.len());
    assert_eq!(workflows.started_workflows(), vec!["copy-data", "project-setup"]);
    assert_eq!(run.workflow_status("copy-data"), Some(WorkflowStatus::Succeeded));
    assert_eq!(run.workflow_status("project-setup"), Some(WorkflowStatus::Succeeded));

    // Rendered arguments
    let starts = workflows.starts();
    assert_eq!(
        starts[0].1["destination_bucket"],
        "gcp-lakehouse-edw-export-p1"
    );
    assert_eq!(starts[1].1["project_id"], "p1");
    assert_eq!(starts[1].1["region"], "r1");

    // The log replays to the same run
    let replayed = Orchestrator::get_run_status(temp.path(), run.id).await.unwrap();
    assert_eq!(replayed.state, RunState::Completed);
    assert_eq!(replayed.resources, run.resources);
    assert_eq!(replayed.context, Some(ctx.clone()));

    let types = event_types(temp.path(), run.id).await;
    assert_eq!(types.first(), Some(&EventType::RunStarted));
    assert_eq!(types.last(), Some(&EventType::RunCompleted));
    let triggered = types
        .iter()
        .position(|t| *t == EventType::WorkflowTriggered)
        .unwrap();
    let last_resource = types
        .iter()
        .rposition(|t| *t == EventType::ResourceRealized)
        .unwrap();
    assert!(last_resource < triggered);
}

#[tokio::test(start_paused = true)]
async fn test_slow_creates_finish_before_dependents_and_triggers() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    control_plane.complete_after("network", 4);
    control_plane.complete_after("copy_data_workflow", 2);
    let workflows = FakeWorkflowService::new();
    let plan = sample_plan();

    let run = assert_ok!(
        orchestrator(&control_plane, &workflows, polling(150))
            .with_operation_polling(PollSettings {
                interval_seconds: 5,
                max_attempts: 10,
            })
            .deploy(&ctx(), &plan, temp.path())
            .await
    );

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(control_plane.calls().len(), plan.resources.len());
    assert_eq!(control_plane.operation_polls("network"), 4);
    assert_eq!(control_plane.operation_polls("copy_data_workflow"), 2);
    assert_eq!(workflows.started_workflows(), vec!["copy-data", "project-setup"]);
}

#[tokio::test(start_paused = true)]
async fn test_provisioning_failure_halts_before_any_trigger() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    control_plane.fail("notebook", 403, "Permission denied on notebooks.instances.create");
    let workflows = FakeWorkflowService::new();

    let run = orchestrator(&control_plane, &workflows, polling(150))
        .deploy(&ctx(), &sample_plan(), temp.path())
        .await
        .unwrap();

    match &run.state {
        RunState::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Provision);
            assert!(error.contains("notebook"));
        }
        other => panic!("unexpected state: {:?}", other),
    }
    assert!(workflows.starts().is_empty());
    // Everything realized before the failure was logged
    assert!(run.resources.contains_key("network"));
    assert!(!run.resources.contains_key("notebook"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_workflow_halts_run() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    workflows.script("copy-data", &["ACTIVE", "FAILED"]);

    let run = orchestrator(&control_plane, &workflows, polling(150))
        .deploy(&ctx(), &sample_plan(), temp.path())
        .await
        .unwrap();

    match &run.state {
        RunState::Failed { stage, error } => {
            assert_eq!(*stage, Stage::Poll);
            assert!(error.contains("copy-data"));
        }
        other => panic!("unexpected state: {:?}", other),
    }
    assert_eq!(workflows.started_workflows(), vec!["copy-data"]);
    assert_eq!(workflows.describe_calls().len(), 1);

    let store = EventStore::open(temp.path(), run.id).await.unwrap();
    let failed = store
        .replay()
        .await
        .unwrap()
        .into_iter()
        .rev()
        .find(|e| e.event_type == EventType::WorkflowFailed)
        .unwrap();
    assert!(failed.data.unwrap()["error"]["payload"]
        .as_str()
        .unwrap()
        .contains("permission denied"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_inconclusive_then_resume_reuses_execution() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    workflows.script("copy-data", &["ACTIVE"]);
    let plan = sample_plan();

    let run = orchestrator(&control_plane, &workflows, polling(3))
        .deploy(&ctx(), &plan, temp.path())
        .await
        .unwrap();

    assert_eq!(
        run.state,
        RunState::Inconclusive {
            workflow: "copy-data".to_string(),
            attempts: 3
        }
    );
    assert_eq!(run.workflow_status("copy-data"), Some(WorkflowStatus::TimedOut));

    // The execution finishes later; resume must poll it, not start another
    workflows.rescript_running("copy-data", &["SUCCEEDED"]);
    let calls_before = control_plane.calls().len();

    let resumed = orchestrator(&control_plane, &workflows, polling(3))
        .resume_run(run.id, &plan, temp.path())
        .await
        .unwrap();

    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(workflows.started_workflows(), vec!["copy-data", "project-setup"]);
    assert_eq!(control_plane.calls().len(), calls_before);
}

#[tokio::test(start_paused = true)]
async fn test_resume_after_failure_retriggers_only_unfinished_work() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    workflows.script("project-setup", &["FAILED"]);
    let plan = sample_plan();

    let run = orchestrator(&control_plane, &workflows, polling(150))
        .deploy(&ctx(), &plan, temp.path())
        .await
        .unwrap();
    assert!(matches!(run.state, RunState::Failed { stage: Stage::Poll, .. }));

    workflows.script("project-setup", &["SUCCEEDED"]);
    let resumed = orchestrator(&control_plane, &workflows, polling(150))
        .resume_run(run.id, &plan, temp.path())
        .await
        .unwrap();

    assert_eq!(resumed.state, RunState::Completed);
    assert_eq!(
        workflows.started_workflows(),
        vec!["copy-data", "project-setup", "project-setup"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_readiness_waits() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    let plan = DeploymentPlan::from_yaml(
        r#"
name: waits
resources:
  - name: workflows_api
    kind: project_service
    attributes:
      id: workflows.googleapis.com
workflows:
  - name: copy-data
    depends_on: [workflows_api]
"#,
    )
    .unwrap();

    let orchestrator = Orchestrator::new(
        control_plane.clone(),
        workflows.clone(),
        common::builtin_retry(3),
        lakehouse_deploy::core::ReadinessGate::default(),
        polling(150),
    );

    let start = tokio::time::Instant::now();
    let run = orchestrator.deploy(&ctx(), &plan, temp.path()).await.unwrap();

    assert_eq!(run.state, RunState::Completed);
    // api propagation before the trigger, settle after the last workflow
    assert!(start.elapsed() >= Duration::from_secs(30 + 300));

    let types = event_types(temp.path(), run.id).await;
    assert_eq!(
        types,
        vec![
            EventType::RunStarted,
            EventType::ResourceRealized,
            EventType::GateWaited,
            EventType::WorkflowTriggered,
            EventType::WorkflowSucceeded,
            EventType::GateWaited,
            EventType::RunCompleted,
        ]
    );
}

#[tokio::test]
async fn test_invalid_plan_rejected_before_run() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    let plan = DeploymentPlan::from_yaml(
        r#"
name: broken
workflows:
  - name: copy-data
    parameters:
      bucket: "{{ missing.name }}"
"#,
    )
    .unwrap();

    let result = orchestrator(&control_plane, &workflows, polling(150))
        .deploy(&ctx(), &plan, temp.path())
        .await;

    assert_err!(result);
    assert!(Orchestrator::list_runs(temp.path(), 10).await.unwrap().is_empty());
    assert!(workflows.starts().is_empty());
}

#[tokio::test]
async fn test_list_runs_most_recent_first() {
    let temp = TempDir::new().unwrap();
    let control_plane = FakeControlPlane::new();
    let workflows = FakeWorkflowService::new();
    let plan = DeploymentPlan::from_yaml("name: empty\n").unwrap();
    let orchestrator = orchestrator(&control_plane, &workflows, polling(150));

    let first = orchestrator.deploy(&ctx(), &plan, temp.path()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = orchestrator.deploy(&ctx(), &plan, temp.path()).await.unwrap();

    let runs = Orchestrator::list_runs(temp.path(), 10).await.unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    let limited = Orchestrator::list_runs(temp.path(), 1).await.unwrap();
    assert_eq!(limited.len(), 1);
}
