//! Workflow inspection commands: matrix, validate, schema.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use tessera_ci::RunnerConfig;
use tessera_ci::config::workflow_schema;
use tessera_ci::load_workflow_config;
use tessera_ci_core::MatrixSelection;

use super::run::SelectionArgs;
use crate::output::MatrixOutput;
use crate::output::ValidateOutput;
use crate::output::print_output;

#[derive(Args)]
pub struct MatrixArgs {
    /// Workflow file.
    pub workflow: PathBuf,

    #[command(flatten)]
    pub selection: SelectionArgs,
}

#[derive(Args)]
pub struct ValidateArgs {
    /// Workflow file.
    pub workflow: PathBuf,
}

/// Print the cells a run would execute.
pub fn matrix(args: MatrixArgs, config: &RunnerConfig, json: bool) -> Result<()> {
    let workflow = load_workflow_config(&args.workflow)
        .with_context(|| format!("failed to load workflow {}", args.workflow.display()))?;
    let selection = MatrixSelection::from(args.selection);
    let cells = workflow.matrix.expand_selected(&selection).context("no cells selected")?;

    let output = MatrixOutput {
        parallelism: config.cell_parallelism(&workflow.matrix, cells.len()),
        fail_fast: workflow.matrix.fail_fast,
        workflow: workflow.name,
        cells,
    };
    print_output(&output, json);
    Ok(())
}

/// Load and validate a workflow, then summarize it.
pub fn validate(args: ValidateArgs, json: bool) -> Result<()> {
    let workflow = load_workflow_config(&args.workflow)
        .with_context(|| format!("workflow {} is invalid", args.workflow.display()))?;
    let cells = workflow.matrix.expand().context("matrix does not expand")?;

    let output = ValidateOutput {
        cells: cells.len(),
        steps: workflow.steps.iter().map(|s| (s.name.clone(), s.action.kind_name().to_string())).collect(),
        workflow: workflow.name,
    };
    print_output(&output, json);
    Ok(())
}

/// Print the workflow JSON schema. Always JSON.
pub fn schema() -> Result<()> {
    let schema = workflow_schema().context("failed to build workflow schema")?;
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}
