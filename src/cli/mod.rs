//! Command-line interface for lakehouse-deploy.
//!
//! Provides commands for deploying a plan, checking status, listing runs,
//! resuming interrupted runs, verifying workflow executions and waiting for
//! compute instances to drain.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::adapters::token::default_provider;
use crate::adapters::gcp::GoogleApiClient;
use crate::adapters::{GcpControlPlane, WorkflowsClient};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    CompletionPoller, DrainOutcome, DrainSettings, InstanceDrain, Orchestrator, PollSettings,
    ReadinessGate,
};
use crate::domain::{DeploymentRun, PollOutcome, RunState};

/// Exit code of a run that failed at some stage
const EXIT_FAILED: u8 = 1;

/// Exit code of a run whose outcome is unknown (poll budget exhausted)
const EXIT_INCONCLUSIVE: u8 = 2;

/// lakehouse-deploy - Provision an analytics lakehouse and run its setup workflows
#[derive(Parser, Debug)]
#[command(name = "lakehouse-deploy")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply a deployment plan as a new run
    Deploy {
        /// Plan name (looks for deployments/<name>.yaml, then <name>.yaml)
        plan_name: String,

        /// Target project (overrides configuration)
        #[arg(long)]
        project: Option<String>,

        /// Target region (overrides configuration)
        #[arg(long)]
        region: Option<String>,

        /// Target zone (defaults to <region>-a)
        #[arg(long)]
        zone: Option<String>,

        /// Skip readiness waits
        #[arg(long)]
        skip_waits: bool,
    },

    /// Resume a failed or inconclusive run
    Resume {
        /// Run ID to resume
        run_id: String,

        /// Plan name (defaults to the plan recorded in the run)
        #[arg(long)]
        plan: Option<String>,

        /// Skip readiness waits
        #[arg(long)]
        skip_waits: bool,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Wait for the latest execution of each workflow to finish
    Verify {
        /// Workflow names, checked in order
        #[arg(default_values_t = ["copy-data".to_string(), "project-setup".to_string()])]
        workflows: Vec<String>,

        #[arg(long)]
        project: Option<String>,

        #[arg(long)]
        region: Option<String>,

        /// Seconds between polls
        #[arg(long)]
        interval: Option<u64>,

        /// Maximum polls per workflow
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Wait until at most --keep compute instances remain (before teardown)
    Drain {
        #[arg(long)]
        project: Option<String>,

        /// Instances allowed to remain
        #[arg(long)]
        keep: Option<usize>,

        /// Seconds between listings
        #[arg(long)]
        interval: Option<u64>,

        /// Maximum number of listings
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// Classify an error message against the transient-error table
    Classify {
        /// Error text
        message: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<ExitCode> {
        let cfg = config::load_config()?;

        match self.command {
            Commands::Deploy {
                plan_name,
                project,
                region,
                zone,
                skip_waits,
            } => {
                deploy(
                    &cfg,
                    &plan_name,
                    project.as_deref(),
                    region.as_deref(),
                    zone.as_deref(),
                    skip_waits,
                )
                .await
            }
            Commands::Resume {
                run_id,
                plan,
                skip_waits,
            } => resume_run(&cfg, &run_id, plan.as_deref(), skip_waits).await,
            Commands::Status { run_id } => show_status(&cfg, &run_id).await,
            Commands::Runs { limit } => list_runs(&cfg, limit).await,
            Commands::Verify {
                workflows,
                project,
                region,
                interval,
                max_attempts,
            } => {
                let mut polling = cfg.polling.clone();
                if let Some(interval) = interval {
                    polling.interval_seconds = interval;
                }
                if let Some(max_attempts) = max_attempts {
                    polling.max_attempts = max_attempts;
                }
                verify(&cfg, &workflows, project.as_deref(), region.as_deref(), &polling).await
            }
            Commands::Drain {
                project,
                keep,
                interval,
                max_attempts,
            } => {
                let mut settings = cfg.drain.clone();
                if let Some(keep) = keep {
                    settings.keep = keep;
                }
                if let Some(interval) = interval {
                    settings.interval_seconds = interval;
                }
                if let Some(max_attempts) = max_attempts {
                    settings.max_attempts = max_attempts;
                }
                drain(&cfg, project.as_deref(), &settings).await
            }
            Commands::Classify { message } => classify(&cfg, &message),
            Commands::Config => show_config(&cfg),
        }
    }
}

/// Wire the Google Cloud adapters into an orchestrator
fn build_orchestrator(cfg: &ResolvedConfig, skip_waits: bool) -> Result<Orchestrator> {
    let client = GoogleApiClient::new(default_provider());
    let control_plane = Arc::new(GcpControlPlane::new(client.clone(), cfg.api.clone()));
    let workflows = Arc::new(WorkflowsClient::new(client, cfg.api.clone()));

    let mut readiness = cfg.readiness.clone();
    readiness.skip |= skip_waits;

    Ok(Orchestrator::new(
        control_plane,
        workflows,
        cfg.retry_policy()?,
        ReadinessGate::new(readiness),
        cfg.polling.clone(),
    )
    .with_operation_polling(cfg.operations.clone()))
}

fn parse_run_id(run_id_str: &str) -> Result<Uuid> {
    Uuid::parse_str(run_id_str).with_context(|| format!("Invalid run ID: {}", run_id_str))
}

fn exit_code(state: &RunState) -> ExitCode {
    match state {
        RunState::Completed | RunState::Running => ExitCode::SUCCESS,
        RunState::Failed { .. } => ExitCode::from(EXIT_FAILED),
        RunState::Inconclusive { .. } => ExitCode::from(EXIT_INCONCLUSIVE),
    }
}

fn print_outcome(run: &DeploymentRun) {
    println!();
    match &run.state {
        RunState::Completed => println!("Deployment '{}' completed", run.plan_name),
        RunState::Running => println!("Deployment '{}' still running", run.plan_name),
        RunState::Failed { stage, error } => {
            println!("Deployment '{}' failed at {} stage", run.plan_name, stage);
            println!("  Error: {}", error);
        }
        RunState::Inconclusive { workflow, attempts } => {
            println!(
                "Deployment '{}' inconclusive: '{}' did not finish after {} polls",
                run.plan_name, workflow, attempts
            );
            println!("  Resume with: lakehouse-deploy resume {}", run.id);
        }
    }
    println!("Run ID: {}", run.id);
}

async fn deploy(
    cfg: &ResolvedConfig,
    plan_name: &str,
    project: Option<&str>,
    region: Option<&str>,
    zone: Option<&str>,
    skip_waits: bool,
) -> Result<ExitCode> {
    let plan = cfg.load_plan(plan_name)?;
    let ctx = cfg.run_context(project, region, zone)?;
    let orchestrator = build_orchestrator(cfg, skip_waits)?;

    println!(
        "Deploying '{}' to {} ({}, {})",
        plan.name, ctx.project_id, ctx.region, ctx.zone
    );
    println!("Run ID: {}", ctx.run_id);

    let run = orchestrator.deploy(&ctx, &plan, &cfg.runs_dir()).await?;
    print_outcome(&run);

    Ok(exit_code(&run.state))
}

async fn resume_run(
    cfg: &ResolvedConfig,
    run_id_str: &str,
    plan_name: Option<&str>,
    skip_waits: bool,
) -> Result<ExitCode> {
    let run_id = parse_run_id(run_id_str)?;
    let runs_dir = cfg.runs_dir();

    let previous = Orchestrator::get_run_status(&runs_dir, run_id).await?;
    let plan = cfg.load_plan(plan_name.unwrap_or(&previous.plan_name))?;
    let orchestrator = build_orchestrator(cfg, skip_waits)?;

    println!("Resuming run {} ({})", run_id, previous.state.label());

    let run = orchestrator.resume_run(run_id, &plan, &runs_dir).await?;
    print_outcome(&run);

    Ok(exit_code(&run.state))
}

async fn show_status(cfg: &ResolvedConfig, run_id_str: &str) -> Result<ExitCode> {
    let run_id = parse_run_id(run_id_str)?;
    let run = Orchestrator::get_run_status(&cfg.runs_dir(), run_id).await?;

    println!("Run ID: {}", run.id);
    println!("Plan: {}", run.plan_name);
    if let Some(ref ctx) = run.context {
        println!("Target: {} ({}, {})", ctx.project_id, ctx.region, ctx.zone);
    }
    println!("State: {}", run.state.label());
    match &run.state {
        RunState::Failed { stage, error } => {
            println!("  Stage: {}", stage);
            println!("  Error: {}", error);
        }
        RunState::Inconclusive { workflow, attempts } => {
            println!("  Workflow: {} ({} polls)", workflow, attempts);
        }
        _ => {}
    }
    println!("Started: {}", run.started_at);
    if let Some(completed) = run.completed_at {
        println!("Completed: {}", completed);
    }

    println!("\nResources ({}):", run.resources.len());
    for (name, identity) in &run.resources {
        let display = identity
            .get("self_link")
            .or_else(|| identity.get("name"))
            .unwrap_or_default();
        println!("  {:<24} {:<18} {}", name, identity.kind, display);
    }

    println!("\nWorkflows:");
    if run.workflows.is_empty() {
        println!("  (none triggered)");
    }
    for (name, record) in &run.workflows {
        let execution = record
            .handle
            .as_ref()
            .map(|h| h.execution_id.as_str())
            .unwrap_or("-");
        let status = format!("{:?}", record.status);
        println!("  {:<24} {:<10} {}", name, status, execution);
    }

    Ok(ExitCode::SUCCESS)
}

async fn list_runs(cfg: &ResolvedConfig, limit: usize) -> Result<ExitCode> {
    let runs = Orchestrator::list_runs(&cfg.runs_dir(), limit).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(ExitCode::SUCCESS);
    }

    println!("{:<38} {:<24} {:<14} {:<20}", "RUN ID", "PLAN", "STATE", "STARTED");
    println!("{}", "-".repeat(98));

    for run in runs {
        println!(
            "{:<38} {:<24} {:<14} {:<20}",
            run.id,
            run.plan_name,
            run.state.label(),
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(ExitCode::SUCCESS)
}

/// Adopt the newest execution of each workflow and wait for it
async fn verify(
    cfg: &ResolvedConfig,
    workflows: &[String],
    project: Option<&str>,
    region: Option<&str>,
    polling: &PollSettings,
) -> Result<ExitCode> {
    let ctx = cfg.run_context(project, region, None)?;
    let client = GoogleApiClient::new(default_provider());
    let service = Arc::new(WorkflowsClient::new(client, cfg.api.clone()));
    let poller = CompletionPoller::new(service, cfg.retry_policy()?);
    let interval = polling.interval();

    for workflow in workflows {
        let Some(handle) = poller
            .adopt_latest(&ctx, workflow, interval, polling.max_attempts)
            .await?
        else {
            println!("{}: no executions found", workflow);
            return Ok(ExitCode::from(EXIT_INCONCLUSIVE));
        };

        println!("{}: waiting for execution {}", workflow, handle.execution_id);
        let outcome = poller
            .await_completion(&ctx, &handle, interval, polling.max_attempts)
            .await?;

        match outcome {
            PollOutcome::Succeeded { attempts } => {
                println!("{}: succeeded ({} polls)", workflow, attempts);
            }
            PollOutcome::Failed { diagnostics, .. } => {
                println!("{}: FAILED", workflow);
                println!("{}", serde_json::to_string_pretty(&diagnostics)?);
                return Ok(ExitCode::from(EXIT_FAILED));
            }
            PollOutcome::TimedOut {
                attempts,
                last_state,
            } => {
                println!(
                    "{}: still {} after {} polls, outcome unknown",
                    workflow, last_state, attempts
                );
                return Ok(ExitCode::from(EXIT_INCONCLUSIVE));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn drain(
    cfg: &ResolvedConfig,
    project: Option<&str>,
    settings: &DrainSettings,
) -> Result<ExitCode> {
    let ctx = cfg.run_context(project, None, None)?;
    let client = GoogleApiClient::new(default_provider());
    let control_plane = Arc::new(GcpControlPlane::new(client, cfg.api.clone()));
    let drain = InstanceDrain::new(control_plane, cfg.retry_policy()?);

    println!(
        "Waiting for at most {} compute instance(s) in {}",
        settings.keep, ctx.project_id
    );

    match drain.await_drained(&ctx, settings).await? {
        DrainOutcome::Drained {
            attempts,
            remaining,
        } => {
            println!("Drained after {} listing(s), {} remaining", attempts, remaining.len());
            for instance in remaining {
                println!("  {:<32} {:<16} {}", instance.name, instance.zone, instance.status);
            }
            Ok(ExitCode::SUCCESS)
        }
        DrainOutcome::TimedOut {
            attempts,
            remaining,
        } => {
            println!("Still {} instance(s) after {} listings:", remaining.len(), attempts);
            for instance in remaining {
                println!("  {:<32} {:<16} {}", instance.name, instance.zone, instance.status);
            }
            Ok(ExitCode::from(EXIT_INCONCLUSIVE))
        }
    }
}

fn classify(cfg: &ResolvedConfig, message: &str) -> Result<ExitCode> {
    let classifier = cfg.classifier()?;
    println!("{}", classifier.classify(message));
    Ok(ExitCode::SUCCESS)
}

fn show_config(cfg: &ResolvedConfig) -> Result<ExitCode> {
    let classifier = cfg.classifier()?;

    println!("lakehouse-deploy configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Runs:                {}", cfg.runs_dir().display());
    println!("  Plans:               {}", cfg.base_dir.join(config::DEPLOYMENTS_DIR).display());
    println!();
    println!("Project:");
    println!("  ID:     {}", cfg.project_id.as_deref().unwrap_or("(unset)"));
    println!("  Region: {}", cfg.region);
    println!("  Zone:   {}", cfg.zone.as_deref().unwrap_or("(<region>-a)"));
    println!("  API:    {}", cfg.api.host);
    println!();
    println!("Retry:");
    println!("  Max attempts: {}", cfg.retry.max_attempts);
    println!("  Delay:        {}s", cfg.retry.delay_seconds);
    if let Some(multiplier) = cfg.retry.backoff_multiplier {
        println!("  Backoff:      x{} (max {}s)", multiplier, cfg.retry.max_delay_seconds);
    }
    println!("  Patterns:     {} (table v{})", classifier.len(), classifier.version());
    println!();
    println!("Polling:");
    println!("  Interval:     {}s", cfg.polling.interval_seconds);
    println!("  Max attempts: {}", cfg.polling.max_attempts);
    println!("  Operations:   every {}s, {} attempts", cfg.operations.interval_seconds, cfg.operations.max_attempts);
    println!();
    println!("Drain:");
    println!("  Keep:         {}", cfg.drain.keep);
    println!("  Interval:     {}s", cfg.drain.interval_seconds);
    println!("  Max attempts: {}", cfg.drain.max_attempts);
    println!();
    println!("Readiness:");
    println!("  API propagation: {}s", cfg.readiness.api_propagation_seconds);
    println!("  Settle:          {}s", cfg.readiness.settle_seconds);
    println!("  Skip:            {}", cfg.readiness.skip);

    Ok(ExitCode::SUCCESS)
}
