//! Workflow orchestrator.
//!
//! Expands the matrix and runs every cell as an independent task.
//!
//! # Architecture
//!
//! ```text
//! WorkflowConfig ──► expand_selected ──► [cell, cell, ...]
//!                                             │
//!                        Semaphore(max_parallel)
//!                                             │
//!                            ┌────────────────┼────────────────┐
//!                            ▼                ▼                ▼
//!                        run_cell         run_cell         run_cell
//!                        (workspace,      (workspace,      (workspace,
//!                         steps...)        steps...)        steps...)
//!                            │                │                │
//!                            └───────► WorkflowRun ◄───────────┘
//!                                         │
//!                                    RunStore (runs/<id>.json)
//! ```
//!
//! With `fail_fast` off, a failing cell affects nothing but itself. With it
//! on, the first failure cancels the shared token and every other cell
//! stops at its next step boundary or has its running process group
//! terminated.

mod cell;
pub mod persistence;
pub mod run;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use futures::FutureExt;
use snafu::ResultExt;
use tessera_cache::CacheStore;
use tessera_cache::FsCacheStore;
use tessera_ci_core::MatrixSelection;
use tessera_ci_core::WorkflowConfig;
use tessera_ci_core::config::TriggerEvent;
use tessera_ci_executor_shell::Executor;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::instrument;
use tracing::warn;

pub use self::persistence::RunStore;
pub use self::run::CellFailure;
pub use self::run::CellRun;
pub use self::run::RunStatus;
pub use self::run::StepRun;
pub use self::run::StepStatus;
pub use self::run::WorkflowRun;
use self::cell::CellContext;
use self::cell::run_cell;
use crate::config::RunnerConfig;
use crate::error::InvalidWorkflowSnafu;
use crate::error::Result;
use crate::trigger::check_trigger;

/// What a run is for.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Triggering event.
    pub event: TriggerEvent,
    /// Branch name (`refs/heads/` is accepted).
    pub branch: String,
    /// Cells to run. Empty axes select everything.
    pub selection: MatrixSelection,
    /// Source tree copied by `checkout` steps.
    pub source_dir: PathBuf,
    /// Run even if the trigger filters do not match.
    pub force: bool,
}

impl RunContext {
    /// Manual run of every cell from `source_dir`.
    pub fn manual(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            event: TriggerEvent::Manual,
            branch: "main".to_string(),
            selection: MatrixSelection::default(),
            source_dir: source_dir.into(),
            force: false,
        }
    }
}

/// Runs workflows on the local machine.
pub struct WorkflowOrchestrator {
    config: Arc<RunnerConfig>,
    cache: Arc<dyn CacheStore>,
    runs: RunStore,
}

impl WorkflowOrchestrator {
    /// Create an orchestrator using the filesystem cache under the state dir.
    pub fn new(config: RunnerConfig) -> Self {
        let config = absolute_state_dir(config);
        let cache = Arc::new(FsCacheStore::new(config.cache_dir()));
        Self::with_cache(config, cache)
    }

    /// Create an orchestrator with a custom cache store.
    ///
    /// A relative `state_dir` is resolved against the current directory.
    pub fn with_cache(config: RunnerConfig, cache: Arc<dyn CacheStore>) -> Self {
        let config = absolute_state_dir(config);
        let runs = RunStore::new(config.runs_dir());
        Self {
            config: Arc::new(config),
            cache,
            runs,
        }
    }

    /// Runner configuration.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run record storage.
    pub fn runs(&self) -> &RunStore {
        &self.runs
    }

    /// Cache store.
    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    /// Run a workflow to completion.
    pub async fn run(&self, workflow: WorkflowConfig, context: RunContext) -> Result<WorkflowRun> {
        self.run_with_cancel(workflow, context, CancellationToken::new()).await
    }

    /// Run a workflow, stopping early when `cancel` fires.
    ///
    /// Returns an error only when the run cannot start (not triggered,
    /// invalid workflow, unwritable state directory). Cell failures are
    /// reported in the returned record.
    #[instrument(skip_all, fields(workflow = %workflow.name, event = %context.event, branch = %context.branch))]
    pub async fn run_with_cancel(
        &self,
        workflow: WorkflowConfig,
        context: RunContext,
        cancel: CancellationToken,
    ) -> Result<WorkflowRun> {
        workflow.validate().context(InvalidWorkflowSnafu)?;
        check_trigger(&workflow, context.event, &context.branch, context.force)?;
        let cells = workflow.matrix.expand_selected(&context.selection).context(InvalidWorkflowSnafu)?;

        let mut run = WorkflowRun::new(
            workflow.name.clone(),
            context.event,
            context.branch.clone(),
            workflow.permissions.contents,
        );
        run.cells = cells.iter().cloned().map(CellRun::pending).collect();
        run.status = RunStatus::Running;
        self.runs.save(&run).await?;

        let parallelism = self.config.cell_parallelism(&workflow.matrix, cells.len());
        let fail_fast = workflow.matrix.fail_fast;
        info!(run_id = %run.id, cells = cells.len(), parallelism, fail_fast, "run started");

        let ctx = Arc::new(CellContext {
            run_id: run.id.clone(),
            workflow: Arc::new(workflow),
            event: context.event,
            branch: context.branch.clone(),
            source_dir: context.source_dir.clone(),
            config: self.config.clone(),
            executor: Arc::new(Executor::new(self.config.workspaces_dir())),
            cache: self.cache.clone(),
            host_env: host_env(&self.config.passthrough_env),
            base_path: self.config.effective_base_path(),
        });

        // Cells never share the caller's token directly so fail-fast does
        // not cancel the caller.
        let run_token = cancel.child_token();
        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut tasks = JoinSet::new();

        for (slot, cell) in cells.into_iter().enumerate() {
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            let token = run_token.clone();
            tasks.spawn(async move {
                let permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = token.cancelled() => None,
                };
                let fallback = CellRun::pending(cell.clone());
                let record = match AssertUnwindSafe(run_cell(ctx, cell, token)).catch_unwind().await {
                    Ok(record) => record,
                    Err(_) => {
                        let mut record = fallback;
                        record.fail_internal("cell task panicked");
                        record
                    }
                };
                drop(permit);
                (slot, record)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, record)) => {
                    if fail_fast && record.status == RunStatus::Failed && !run_token.is_cancelled() {
                        warn!(cell = %record.id, "cell failed, cancelling remaining cells (fail_fast)");
                        run_token.cancel();
                    }
                    run.cells[slot] = record;
                }
                Err(e) => {
                    // Only reachable if the runtime aborts the task; the
                    // pre-filled pending record is finalized below.
                    warn!(error = %e, "cell task failed");
                }
            }
        }

        for cell in run.cells.iter_mut().filter(|c| !c.status.is_terminal()) {
            cell.fail_internal("cell did not complete");
        }

        run.finish(cancel.is_cancelled());
        info!(run_id = %run.id, status = %run.status, failed_cells = run.failed_cells(), "run finished");
        self.runs.save(&run).await?;
        Ok(run)
    }
}

fn absolute_state_dir(mut config: RunnerConfig) -> RunnerConfig {
    if let Ok(path) = std::path::absolute(&config.state_dir) {
        config.state_dir = path;
    }
    config
}

fn host_env(names: &[String]) -> HashMap<String, String> {
    names.iter().filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value))).collect()
}
