//! Workflow run command.
//!
//! Runs the selected matrix cells and prints the run record. Ctrl-C cancels
//! every running cell; the record is still written with the cancelled
//! cells marked.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::ValueEnum;
use tessera_ci::RunContext;
use tessera_ci::RunStatus;
use tessera_ci::RunnerConfig;
use tessera_ci::WorkflowOrchestrator;
use tessera_ci::load_workflow_config;
use tessera_ci_core::MatrixSelection;
use tessera_ci_core::config::TriggerEvent;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::output::RunOutput;
use crate::output::print_output;

/// Event to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    /// A push to `--branch`.
    Push,
    /// A pull request targeting `--branch`.
    #[value(name = "pull_request", alias = "pull-request")]
    PullRequest,
    /// A manual run; branch filters do not apply.
    Manual,
}

impl From<EventArg> for TriggerEvent {
    fn from(event: EventArg) -> Self {
        match event {
            EventArg::Push => TriggerEvent::Push,
            EventArg::PullRequest => TriggerEvent::PullRequest,
            EventArg::Manual => TriggerEvent::Manual,
        }
    }
}

/// Matrix cell filter.
#[derive(Args, Debug, Clone, Default)]
pub struct SelectionArgs {
    /// Only run cells with this OS (repeatable).
    #[arg(long)]
    pub os: Vec<String>,

    /// Only run cells with this version (repeatable).
    #[arg(long)]
    pub version: Vec<String>,
}

impl From<SelectionArgs> for MatrixSelection {
    fn from(args: SelectionArgs) -> Self {
        MatrixSelection {
            os: args.os,
            version: args.version,
        }
    }
}

#[derive(Args)]
pub struct RunArgs {
    /// Workflow file.
    pub workflow: PathBuf,

    /// Triggering event.
    #[arg(long, value_enum, default_value = "manual")]
    pub event: EventArg,

    /// Branch the event is for (`refs/heads/` prefix accepted).
    #[arg(long, default_value = "main")]
    pub branch: String,

    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Source tree copied by checkout steps.
    #[arg(long, default_value = ".")]
    pub source_dir: PathBuf,

    /// Run even if the workflow's triggers do not match.
    #[arg(long)]
    pub force: bool,
}

impl RunArgs {
    /// Run the workflow and report. Fails when the run did not succeed.
    pub async fn run(self, config: RunnerConfig, json: bool) -> Result<()> {
        let workflow = load_workflow_config(&self.workflow)
            .with_context(|| format!("failed to load workflow {}", self.workflow.display()))?;

        let context = RunContext {
            event: self.event.into(),
            branch: self.branch,
            selection: self.selection.into(),
            source_dir: self.source_dir,
            force: self.force,
        };

        let orchestrator = WorkflowOrchestrator::new(config);
        let cancel = CancellationToken::new();
        let interrupt = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling run");
                    cancel.cancel();
                }
            })
        };

        let result = orchestrator.run_with_cancel(workflow, context, cancel).await;
        interrupt.abort();
        let run = result.context("workflow run failed to start")?;

        let (id, status) = (run.id.clone(), run.status);
        print_output(&RunOutput { run }, json);

        if status != RunStatus::Success {
            anyhow::bail!("run {id} finished with status {status}");
        }
        Ok(())
    }
}
