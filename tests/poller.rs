//! Poller Integration Tests
//!
//! Poll loop timing and outcomes against a scripted workflow service.

mod common;

use std::time::Duration;

use chrono::Utc;
use lakehouse_deploy::core::{CompletionPoller, RetryPolicy, TriggerError, WorkflowTrigger};
use lakehouse_deploy::domain::{ExecutionHandle, ExecutionState, PollOutcome};
use serde_json::json;
use tokio::time::Instant;

use common::{ctx, FakeWorkflowService};

const INTERVAL: Duration = Duration::from_secs(5);

async fn started(service: &std::sync::Arc<FakeWorkflowService>, workflow: &str) -> ExecutionHandle {
    let trigger = WorkflowTrigger::new(service.clone());
    trigger.start(&ctx(), workflow, &json!({})).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_pending_pending_succeeded() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["PENDING", "PENDING", "SUCCEEDED"]);
    let handle = started(&service, "copy-data").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let start = Instant::now();
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap();

    assert_eq!(outcome, PollOutcome::Succeeded { attempts: 3 });
    assert_eq!(service.list_calls("copy-data"), 3);
    assert_eq!(start.elapsed(), INTERVAL * 2);
}

#[tokio::test(start_paused = true)]
async fn test_running_failed_describes_execution() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["ACTIVE", "FAILED"]);
    let handle = started(&service, "copy-data").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap();

    match outcome {
        PollOutcome::Failed {
            attempts,
            diagnostics,
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(diagnostics["state"], "FAILED");
            assert!(diagnostics["error"]["payload"]
                .as_str()
                .unwrap()
                .contains("permission denied"));
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(service.list_calls("copy-data"), 2);
    assert_eq!(service.describe_calls(), vec![handle.execution_name.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_never_leaving_pending_times_out() {
    let service = FakeWorkflowService::new();
    service.script("project-setup", &["QUEUED"]);
    let handle = started(&service, "project-setup").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let start = Instant::now();
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 4)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PollOutcome::TimedOut {
            attempts: 4,
            last_state: ExecutionState::Pending
        }
    );
    assert_eq!(service.list_calls("project-setup"), 4);
    // No sleep after the final attempt
    assert_eq!(start.elapsed(), INTERVAL * 3);
}

#[tokio::test(start_paused = true)]
async fn test_copy_data_scenario() {
    // Project p1, region r1: the trigger returns an ACTIVE execution which
    // reports ACTIVE on the first poll and SUCCEEDED on the second.
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["ACTIVE", "SUCCEEDED"]);
    let handle = started(&service, "copy-data").await;

    assert_eq!(
        handle.execution_name,
        "projects/p1/locations/r1/workflows/copy-data/executions/exec-0"
    );

    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap();

    assert_eq!(outcome, PollOutcome::Succeeded { attempts: 2 });
}

#[tokio::test(start_paused = true)]
async fn test_lookup_by_handle_ignores_newer_executions() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["ACTIVE", "ACTIVE", "SUCCEEDED"]);
    let handle = started(&service, "copy-data").await;

    // A newer execution started elsewhere, failing straight away
    service.seed_execution(&ctx(), "copy-data", "someone-else", &["FAILED"]);

    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap();

    assert_eq!(outcome, PollOutcome::Succeeded { attempts: 3 });
    assert!(service.describe_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unlisted_execution_is_pending() {
    let service = FakeWorkflowService::new();
    let handle = ExecutionHandle::from_name(
        "copy-data",
        "projects/p1/locations/r1/workflows/copy-data/executions/not-yet-visible",
        Utc::now(),
    )
    .unwrap();
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 2)
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        PollOutcome::TimedOut {
            last_state: ExecutionState::Pending,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stale_read_does_not_move_state_backwards() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["ACTIVE", "QUEUED", "SUCCEEDED"]);
    let handle = started(&service, "copy-data").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let first = poller
        .poll_once(&ctx(), &handle, ExecutionState::Pending)
        .await
        .unwrap();
    assert_eq!(first.state, ExecutionState::Running);

    let second = poller.poll_once(&ctx(), &handle, first.state).await.unwrap();
    assert_eq!(second.state, ExecutionState::Running);

    let third = poller.poll_once(&ctx(), &handle, second.state).await.unwrap();
    assert_eq!(third.state, ExecutionState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_transient_listing_error_is_retried() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["SUCCEEDED"]);
    let handle = started(&service, "copy-data").await;
    service.fail_next_list(400, common::SUBNET_DRAINING);

    let poller = CompletionPoller::new(service.clone(), common::builtin_retry(3));
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap();

    assert_eq!(outcome, PollOutcome::Succeeded { attempts: 1 });
    assert_eq!(service.list_calls("copy-data"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_listing_error_propagates() {
    let service = FakeWorkflowService::new();
    let handle = started(&service, "copy-data").await;
    service.fail_next_list(403, "Permission denied on workflow copy-data");

    let poller = CompletionPoller::new(service.clone(), common::builtin_retry(3));
    let err = poller
        .await_completion(&ctx(), &handle, INTERVAL, 150)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Permission denied"));
    assert_eq!(service.list_calls("copy-data"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adopt_latest_waits_for_an_execution() {
    let service = FakeWorkflowService::new();
    service.seed_execution(&ctx(), "project-setup", "older", &["SUCCEEDED"]);
    let newest = service.seed_execution(&ctx(), "project-setup", "newest", &["ACTIVE"]);

    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());
    let handle = poller
        .adopt_latest(&ctx(), "project-setup", INTERVAL, 3)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(handle.execution_name, newest);
    assert_eq!(handle.execution_id, "newest");

    let none = poller
        .adopt_latest(&ctx(), "copy-data", INTERVAL, 3)
        .await
        .unwrap();
    assert!(none.is_none());
    assert_eq!(service.list_calls("copy-data"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_state_counts_as_pending_until_timeout() {
    let service = FakeWorkflowService::new();
    service.script("copy-data", &["PAUSED"]);
    let handle = started(&service, "copy-data").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let start = Instant::now();
    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 3)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PollOutcome::TimedOut {
            attempts: 3,
            last_state: ExecutionState::Pending
        }
    );
    assert_eq!(service.list_calls("copy-data"), 3);
    assert_eq!(start.elapsed(), INTERVAL * 2);
    assert!(service.describe_calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_unknown_state_after_running_keeps_running() {
    let service = FakeWorkflowService::new();
    service.script("project-setup", &["ACTIVE", "PAUSED"]);
    let handle = started(&service, "project-setup").await;
    let poller = CompletionPoller::new(service.clone(), RetryPolicy::no_retry());

    let outcome = poller
        .await_completion(&ctx(), &handle, INTERVAL, 4)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        PollOutcome::TimedOut {
            attempts: 4,
            last_state: ExecutionState::Running
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_start_is_not_retried() {
    let service = FakeWorkflowService::new();
    service.fail_next_start(503, "The service is currently unavailable");
    let trigger = WorkflowTrigger::new(service.clone());

    let err = trigger
        .start(&ctx(), "copy-data", &json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, TriggerError::Api { ref workflow, .. } if workflow == "copy-data"));
    assert_eq!(service.started_workflows(), vec!["copy-data"]);
}
