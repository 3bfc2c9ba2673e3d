//! Main orchestrator for deployment runs.
//!
//! Drives provisioning, readiness waits, workflow triggers and completion
//! polling in order, recording every state change in the run log.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{ControlPlane, WorkflowService};
use crate::domain::{
    DeploymentRun, Event, EventType, ExecutionHandle, PollOutcome, Realization, RunContext,
    RunStartedData, RunState, Stage, WorkflowStatus,
};

use super::event_store::{generate_idempotency_key, EventStore};
use super::gate::ReadinessGate;
use super::plan::{DeploymentPlan, WorkflowSpec};
use super::poller::{CompletionPoller, PollSettings};
use super::provisioner::{ResourceProvisioner, ResourceRegistry};
use super::retry::RetryPolicy;
use super::trigger::WorkflowTrigger;

/// Main deployment orchestrator
pub struct Orchestrator {
    provisioner: ResourceProvisioner,
    trigger: WorkflowTrigger,
    poller: CompletionPoller,
    gate: ReadinessGate,
    polling: PollSettings,
}

/// How the workflow stage ended
enum WorkflowsOutcome {
    Done,
    Halted,
}

impl Orchestrator {
    /// Create a new orchestrator. The same retry policy wraps provisioning
    /// and polling calls; execution starts are never retried.
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        workflows: Arc<dyn WorkflowService>,
        retry: RetryPolicy,
        gate: ReadinessGate,
        polling: PollSettings,
    ) -> Self {
        Self {
            provisioner: ResourceProvisioner::new(control_plane, retry.clone(), gate.clone()),
            trigger: WorkflowTrigger::new(workflows.clone()),
            poller: CompletionPoller::new(workflows, retry),
            gate,
            polling,
        }
    }

    /// Poll create operations with `operations` instead of the defaults
    pub fn with_operation_polling(mut self, operations: PollSettings) -> Self {
        self.provisioner = self.provisioner.with_operation_polling(operations);
        self
    }

    /// Apply a plan as a new run
    #[instrument(skip(self, ctx, plan, runs_dir), fields(run_id = %ctx.run_id, plan = %plan.name))]
    pub async fn deploy(
        &self,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        runs_dir: &Path,
    ) -> Result<DeploymentRun> {
        plan.validate()
            .with_context(|| format!("Invalid deployment plan '{}'", plan.name))?;

        info!(project = %ctx.project_id, region = %ctx.region, "Starting deployment");

        let store = EventStore::open(runs_dir, ctx.run_id).await?;
        let mut run = DeploymentRun::new(plan.name.clone(), ctx.clone());

        self.start(&store, &mut run, ctx, plan).await?;
        self.execute(&store, &mut run, ctx, plan, ResourceRegistry::new())
            .await
    }

    /// Resume a run that failed or was interrupted.
    ///
    /// Resources realized earlier are not recreated, workflows that already
    /// succeeded are not re-triggered, and a workflow triggered with the
    /// same argument but not yet finished is polled again instead of being
    /// started a second time.
    #[instrument(skip(self, plan, runs_dir), fields(run_id = %run_id, plan = %plan.name))]
    pub async fn resume_run(
        &self,
        run_id: Uuid,
        plan: &DeploymentPlan,
        runs_dir: &Path,
    ) -> Result<DeploymentRun> {
        let mut run = Self::get_run_status(runs_dir, run_id).await?;

        if run.plan_name != plan.name {
            anyhow::bail!(
                "Run {} applied plan '{}', not '{}'",
                run_id,
                run.plan_name,
                plan.name
            );
        }

        if run.state == RunState::Completed {
            info!("Run already completed, nothing to resume");
            return Ok(run);
        }

        plan.validate()
            .with_context(|| format!("Invalid deployment plan '{}'", plan.name))?;

        let ctx = run
            .context
            .clone()
            .context("Run log does not record the run context")?;

        info!(
            resources = run.resources.len(),
            workflows = run.workflows.len(),
            previous = run.state.label(),
            "Resuming run"
        );

        let store = EventStore::open(runs_dir, run_id).await?;
        let registry = ResourceRegistry::from_identities(run.resources.values().cloned());

        self.start(&store, &mut run, &ctx, plan).await?;
        self.execute(&store, &mut run, &ctx, plan, registry).await
    }

    /// All stages after `RunStarted`
    async fn execute(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        mut registry: ResourceRegistry,
    ) -> Result<DeploymentRun> {
        // Stage 1: resources
        let provisioned = self
            .provisioner
            .provision(ctx, &plan.resources, &mut registry)
            .await;

        // Whatever was realized is logged, even if a later resource failed
        for realized in registry.drain_unreported() {
            let identity = &realized.identity;
            let summary = match realized.realization {
                Realization::Created => format!("Created {} '{}'", identity.kind, identity.spec_name),
                Realization::AlreadyExisted => {
                    format!("{} '{}' already existed", identity.kind, identity.spec_name)
                }
            };
            let event = Event::new(
                run.id,
                Some(identity.spec_name.clone()),
                EventType::ResourceRealized,
                format!("{}:resource:{}", run.id, identity.spec_name),
                summary,
            )
            .with_duration(realized.duration_ms)
            .with_data(serde_json::to_value(identity)?);
            self.record(store, run, event).await?;
        }

        if let Err(e) = provisioned {
            return self.halt(store, run, Stage::Provision, e.to_string()).await;
        }

        if registry.has_pending_propagation() {
            let waited = self.gate.wait_for_api_propagation().await;
            registry.clear_pending_propagation();
            self.record_gate(store, run, Stage::Provision, "api_propagation", waited.as_secs())
                .await?;
        }

        // Stage 2: workflows, strictly in declared order
        if let WorkflowsOutcome::Halted = self.run_workflows(store, run, ctx, plan, &registry).await? {
            return Ok(run.clone());
        }

        // Stage 3: settle
        let waited = self.gate.wait_to_settle().await;
        self.record_gate(store, run, Stage::Settle, "settle", waited.as_secs())
            .await?;

        self.complete_run(store, run).await
    }

    async fn run_workflows(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        ctx: &RunContext,
        plan: &DeploymentPlan,
        registry: &ResourceRegistry,
    ) -> Result<WorkflowsOutcome> {
        for workflow in &plan.workflows {
            if run.workflow_status(&workflow.name) == Some(WorkflowStatus::Succeeded) {
                info!(workflow = %workflow.name, "Workflow already succeeded, skipping");
                continue;
            }

            if let Err(defect) = check_preconditions(run, workflow, registry) {
                error!(workflow = %workflow.name, %defect, "Workflow preconditions not met");
                self.halt(store, run, Stage::Trigger, defect).await?;
                return Ok(WorkflowsOutcome::Halted);
            }

            let argument = match WorkflowTrigger::render_argument(
                ctx,
                &workflow.name,
                &workflow.parameters,
                registry.identities(),
            ) {
                Ok(argument) => argument,
                Err(e) => {
                    self.halt(store, run, Stage::Trigger, e.to_string()).await?;
                    return Ok(WorkflowsOutcome::Halted);
                }
            };

            let idem_key = generate_idempotency_key(run.id, &workflow.name, &argument.to_string());

            let handle = match reusable_handle(run, &workflow.name, &idem_key) {
                Some(handle) => {
                    info!(
                        workflow = %workflow.name,
                        execution_id = %handle.execution_id,
                        "Execution already triggered with this argument, polling it again"
                    );
                    handle
                }
                None => match self.trigger.start(ctx, &workflow.name, &argument).await {
                    Ok(handle) => {
                        let event = Event::new(
                            run.id,
                            Some(workflow.name.clone()),
                            EventType::WorkflowTriggered,
                            idem_key.clone(),
                            format!(
                                "Triggered '{}' (execution {})",
                                workflow.name, handle.execution_id
                            ),
                        )
                        .with_data(serde_json::to_value(&handle)?);
                        self.record(store, run, event).await?;
                        handle
                    }
                    Err(e) => {
                        self.halt(store, run, Stage::Trigger, e.to_string()).await?;
                        return Ok(WorkflowsOutcome::Halted);
                    }
                },
            };

            let poll_start = std::time::Instant::now();
            let outcome = match self
                .poller
                .await_completion(ctx, &handle, self.polling.interval(), self.polling.max_attempts)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.halt(store, run, Stage::Poll, e.to_string()).await?;
                    return Ok(WorkflowsOutcome::Halted);
                }
            };
            let duration_ms = poll_start.elapsed().as_millis() as u64;

            match outcome {
                PollOutcome::Succeeded { attempts } => {
                    let event = Event::new(
                        run.id,
                        Some(workflow.name.clone()),
                        EventType::WorkflowSucceeded,
                        idem_key,
                        format!("'{}' succeeded after {} polls", workflow.name, attempts),
                    )
                    .with_duration(duration_ms)
                    .with_data(json!({ "attempts": attempts }));
                    self.record(store, run, event).await?;
                }
                PollOutcome::Failed {
                    attempts,
                    diagnostics,
                } => {
                    let message = format!(
                        "Workflow '{}' execution {} failed",
                        workflow.name, handle.execution_id
                    );
                    let event = Event::new(
                        run.id,
                        Some(workflow.name.clone()),
                        EventType::WorkflowFailed,
                        idem_key,
                        format!("'{}' failed after {} polls", workflow.name, attempts),
                    )
                    .with_duration(duration_ms)
                    .with_error(message.clone())
                    .with_data(diagnostics);
                    self.record(store, run, event).await?;
                    self.halt(store, run, Stage::Poll, message).await?;
                    return Ok(WorkflowsOutcome::Halted);
                }
                PollOutcome::TimedOut {
                    attempts,
                    last_state,
                } => {
                    let event = Event::new(
                        run.id,
                        Some(workflow.name.clone()),
                        EventType::WorkflowTimedOut,
                        idem_key,
                        format!(
                            "'{}' still {} after {} polls",
                            workflow.name, last_state, attempts
                        ),
                    )
                    .with_duration(duration_ms)
                    .with_data(json!({ "attempts": attempts, "last_state": last_state }));
                    self.record(store, run, event).await?;
                    self.inconclusive(store, run, &workflow.name, attempts).await?;
                    return Ok(WorkflowsOutcome::Halted);
                }
            }
        }

        Ok(WorkflowsOutcome::Done)
    }

    /// Log `RunStarted` for a fresh or resumed attempt
    async fn start(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        ctx: &RunContext,
        plan: &DeploymentPlan,
    ) -> Result<()> {
        let data = RunStartedData {
            plan: plan.name.clone(),
            context: ctx.clone(),
        };
        let event = Event::new(
            run.id,
            None,
            EventType::RunStarted,
            format!("{}:start", run.id),
            format!("Deployment '{}' started in {}/{}", plan.name, ctx.project_id, ctx.region),
        )
        .with_data(serde_json::to_value(&data)?);
        self.record(store, run, event).await
    }

    /// Append an event and fold it into the in-memory run
    async fn record(&self, store: &EventStore, run: &mut DeploymentRun, event: Event) -> Result<()> {
        store.append(&event).await?;
        run.apply_event(&event);
        Ok(())
    }

    async fn record_gate(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        stage: Stage,
        reason: &str,
        seconds: u64,
    ) -> Result<()> {
        let event = Event::new(
            run.id,
            None,
            EventType::GateWaited,
            format!("{}:gate:{}", run.id, reason),
            format!("Waited {}s for {}", seconds, reason),
        )
        .with_stage(stage)
        .with_duration(seconds * 1000)
        .with_data(json!({ "reason": reason, "seconds": seconds }));
        self.record(store, run, event).await
    }

    /// Stop the run at `stage`
    async fn halt(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        stage: Stage,
        error_msg: String,
    ) -> Result<DeploymentRun> {
        error!(%stage, %error_msg, "Run failed");

        let event = Event::new(
            run.id,
            None,
            EventType::RunFailed,
            format!("{}:complete", run.id),
            format!("Run failed at {} stage: {}", stage, error_msg),
        )
        .with_stage(stage)
        .with_error(error_msg);
        self.record(store, run, event).await?;

        Ok(run.clone())
    }

    async fn inconclusive(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        workflow: &str,
        attempts: u32,
    ) -> Result<DeploymentRun> {
        warn!(workflow, attempts, "Run inconclusive; execution may still be running");

        let event = Event::new(
            run.id,
            Some(workflow.to_string()),
            EventType::RunInconclusive,
            format!("{}:complete", run.id),
            format!("'{}' did not finish within {} polls", workflow, attempts),
        )
        .with_stage(Stage::Poll)
        .with_data(json!({ "attempts": attempts }));
        self.record(store, run, event).await?;

        Ok(run.clone())
    }

    /// Complete a successful run
    async fn complete_run(&self, store: &EventStore, run: &mut DeploymentRun) -> Result<DeploymentRun> {
        info!(run_id = %run.id, "Deployment completed successfully");

        let event = Event::new(
            run.id,
            None,
            EventType::RunCompleted,
            format!("{}:complete", run.id),
            format!("Deployment '{}' completed", run.plan_name),
        );
        self.record(store, run, event).await?;

        Ok(run.clone())
    }

    /// Get status of a run by ID
    pub async fn get_run_status(runs_dir: &Path, run_id: Uuid) -> Result<DeploymentRun> {
        if !runs_dir.join(run_id.to_string()).is_dir() {
            anyhow::bail!("Run {} not found", run_id);
        }

        let store = EventStore::open(runs_dir, run_id).await?;
        let events = store.replay().await?;

        DeploymentRun::from_events(&events)
            .with_context(|| format!("Run {} has no events", run_id))
    }

    /// List recent runs, most recent first
    pub async fn list_runs(runs_dir: &Path, limit: usize) -> Result<Vec<DeploymentRun>> {
        let run_ids = EventStore::list_runs(runs_dir).await?;
        let mut runs = Vec::new();

        for run_id in run_ids {
            match Self::get_run_status(runs_dir, run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }
}

/// Every resource a workflow needs must be realized, and every predecessor
/// must have succeeded. A miss here is a defect, not a transient state.
fn check_preconditions(
    run: &DeploymentRun,
    workflow: &WorkflowSpec,
    registry: &ResourceRegistry,
) -> std::result::Result<(), String> {
    if let Some(missing) = workflow
        .required_resources()
        .into_iter()
        .find(|r| !registry.contains(r))
    {
        return Err(format!(
            "Workflow '{}' requires resource '{}', which was not realized",
            workflow.name, missing
        ));
    }

    if let Some(pending) = workflow
        .after
        .iter()
        .find(|w| run.workflow_status(w) != Some(WorkflowStatus::Succeeded))
    {
        return Err(format!(
            "Workflow '{}' must run after '{}', which has not succeeded",
            workflow.name, pending
        ));
    }

    Ok(())
}

/// Handle of an unfinished execution started earlier with the same argument
fn reusable_handle(run: &DeploymentRun, workflow: &str, idem_key: &str) -> Option<ExecutionHandle> {
    let record = run.workflows.get(workflow)?;
    let unfinished = matches!(
        record.status,
        WorkflowStatus::Triggered | WorkflowStatus::TimedOut
    );
    if unfinished && record.trigger_key.as_deref() == Some(idem_key) {
        record.handle.clone()
    } else {
        None
    }
}
