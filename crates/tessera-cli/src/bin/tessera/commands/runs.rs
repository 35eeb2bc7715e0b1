//! Run record commands.

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use tessera_ci::RunStore;
use tessera_ci::RunnerConfig;

use crate::output::RunDetailOutput;
use crate::output::RunListOutput;
use crate::output::print_output;

/// Recorded run operations.
#[derive(Subcommand)]
pub enum RunsCommand {
    /// List recorded runs, newest first.
    List(ListArgs),

    /// Show a run with per-step detail.
    Show(ShowArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show runs of this workflow.
    #[arg(long)]
    pub workflow: Option<String>,

    /// Maximum results (default 20, max 500).
    #[arg(long, default_value = "20")]
    pub limit: usize,
}

#[derive(Args)]
pub struct ShowArgs {
    /// Run ID.
    pub run_id: String,
}

impl RunsCommand {
    /// Execute the runs command.
    pub async fn run(self, config: &RunnerConfig, json: bool) -> Result<()> {
        let store = RunStore::new(config.runs_dir());
        match self {
            RunsCommand::List(args) => runs_list(&store, args, json).await,
            RunsCommand::Show(args) => runs_show(&store, args, json).await,
        }
    }
}

async fn runs_list(store: &RunStore, args: ListArgs, json: bool) -> Result<()> {
    let mut runs = store.list().await.context("failed to list runs")?;
    if let Some(workflow) = &args.workflow {
        runs.retain(|r| &r.workflow == workflow);
    }
    runs.truncate(args.limit);
    print_output(&RunListOutput { runs }, json);
    Ok(())
}

async fn runs_show(store: &RunStore, args: ShowArgs, json: bool) -> Result<()> {
    let run = store.load(&args.run_id).await.with_context(|| format!("failed to load run {}", args.run_id))?;
    print_output(&RunDetailOutput { run }, json);
    Ok(())
}
