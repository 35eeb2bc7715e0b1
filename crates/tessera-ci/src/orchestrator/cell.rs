//! Execution of a single matrix cell.
//!
//! A cell owns a fresh workspace and runs the workflow steps strictly in
//! order. Step failures are recorded, never propagated: whatever happens,
//! [`run_cell`] returns a finished [`CellRun`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use chrono::Utc;
use tessera_cache::CacheStore;
use tessera_cache::RestoreOutcome;
use tessera_ci_core::FailureKind;
use tessera_ci_core::MatrixCell;
use tessera_ci_core::StepConfig;
use tessera_ci_core::WorkflowConfig;
use tessera_ci_core::config::MAX_STEP_TIMEOUT_SECS;
use tessera_ci_core::config::NoFilesPolicy;
use tessera_ci_core::config::StepCondition;
use tessera_ci_core::config::TriggerEvent;
use tessera_ci_core::verified::build_search_path;
use tessera_ci_core::verified::effective_step_timeout_secs;
use tessera_ci_core::verified::failure_kind_for_phase;
use tessera_ci_core::verified::remaining_time_ms;
use tessera_ci_core::verified::render_template;
use tessera_ci_core::verified::should_run_step;
use tessera_ci_executor_shell::ExecutionOutcome;
use tessera_ci_executor_shell::ExecutionRequest;
use tessera_ci_executor_shell::Executor;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing::debug;
use tracing::info;
use tracing::info_span;
use tracing::warn;

use super::run::CellFailure;
use super::run::CellRun;
use super::run::RunStatus;
use super::run::StepRun;
use super::run::StepStatus;
use crate::artifacts::collect_artifact;
use crate::config::RunnerConfig;
use crate::error::CiError;
use crate::log_writer::SpawnedLogWriter;
use crate::steps::PlannedStep;
use crate::steps::StepPlan;
use crate::steps::plan_step;
use crate::steps::slug;
use crate::workspace::CellWorkspace;
use crate::workspace::checkout_sources;

/// Lines of output quoted in a failure message.
const FAILURE_TAIL_LINES: usize = 20;

/// Everything a cell needs that is shared across the run.
pub(crate) struct CellContext {
    pub run_id: String,
    pub workflow: Arc<WorkflowConfig>,
    pub event: TriggerEvent,
    pub branch: String,
    pub source_dir: PathBuf,
    pub config: Arc<RunnerConfig>,
    pub executor: Arc<Executor>,
    pub cache: Arc<dyn CacheStore>,
    /// Host variables copied into every step.
    pub host_env: HashMap<String, String>,
    pub base_path: String,
}

/// Result of one step before it is folded into the cell.
struct StepOutcome {
    record: StepRun,
    failure: Option<(FailureKind, String)>,
}

impl StepOutcome {
    fn new(step: &StepConfig) -> Self {
        Self {
            record: StepRun {
                name: step.name.clone(),
                kind: step.action.kind_name().to_string(),
                phase: step.phase(),
                status: StepStatus::Success,
                exit_code: None,
                duration_ms: 0,
                log_path: None,
                cache: None,
                message: None,
            },
            failure: None,
        }
    }

    fn fail(&mut self, status: StepStatus, kind: FailureKind, message: String) {
        self.record.status = status;
        self.record.message = Some(message.clone());
        self.failure = Some((kind, message));
    }
}

/// Cache entry to save once the job has succeeded.
struct PendingSave {
    key: String,
    paths: Vec<String>,
}

/// Mutable state threaded through the steps of a cell.
struct CellState {
    workspace: CellWorkspace,
    cell_id: String,
    base_env: HashMap<String, String>,
    search_additions: Vec<String>,
    pending_saves: Vec<PendingSave>,
    started: Instant,
    job_timeout_ms: u64,
    timed_out: Arc<AtomicBool>,
}

/// Run all steps of one cell.
pub(crate) async fn run_cell(ctx: Arc<CellContext>, cell: MatrixCell, cancel: CancellationToken) -> CellRun {
    let span = info_span!("cell", run_id = %ctx.run_id, cell = %cell.id());
    run_cell_inner(ctx, cell, cancel).instrument(span).await
}

async fn run_cell_inner(ctx: Arc<CellContext>, cell: MatrixCell, cancel: CancellationToken) -> CellRun {
    let mut record = CellRun::pending(cell.clone());
    record.status = RunStatus::Running;
    record.started_at = Some(Utc::now());

    if cancel.is_cancelled() {
        record.status = RunStatus::Cancelled;
        record.failure = Some(CellFailure {
            kind: FailureKind::Cancelled,
            step: None,
            message: "cancelled before start".to_string(),
        });
        record.completed_at = Some(Utc::now());
        return record;
    }

    info!(os = %cell.os, version = %cell.version, "cell started");

    let workspace_path = ctx.config.workspaces_dir().join(&ctx.run_id).join(&record.id);
    let workspace = match CellWorkspace::create(workspace_path).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(error = %e, "failed to create workspace");
            record.fail_internal(e.to_string());
            return record;
        }
    };

    let base_env = match base_env(&ctx, &cell, &record.id) {
        Ok(env) => env,
        Err(e) => {
            record.fail_internal(e.to_string());
            cleanup(&ctx, workspace).await;
            return record;
        }
    };

    // The job timeout cancels a child token so the rest of the run is untouched.
    let job_token = cancel.child_token();
    let timed_out = Arc::new(AtomicBool::new(false));
    let job_timeout = Duration::from_secs(ctx.workflow.timeout_minutes.saturating_mul(60));
    let timer = {
        let token = job_token.clone();
        let timed_out = timed_out.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(job_timeout) => {
                    timed_out.store(true, Ordering::SeqCst);
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        })
    };

    let mut state = CellState {
        workspace,
        cell_id: record.id.clone(),
        base_env,
        search_additions: Vec::new(),
        pending_saves: Vec::new(),
        started: Instant::now(),
        job_timeout_ms: job_timeout.as_millis() as u64,
        timed_out: timed_out.clone(),
    };

    let mut failure: Option<CellFailure> = None;
    for (index, step) in ctx.workflow.steps.iter().enumerate() {
        let cancelled = job_token.is_cancelled();
        let condition = step.effective_condition();
        if !should_run_step(condition, failure.is_some(), cancelled) {
            let reason = skip_reason(condition, cancelled, timed_out.load(Ordering::SeqCst));
            debug!(step = %step.name, reason, "step skipped");
            record.steps.push(StepRun::skipped(&step.name, step.action.kind_name(), step.phase(), reason));
            continue;
        }

        let outcome = run_step(&ctx, &cell, &mut state, index, step, &job_token, &mut record).await;
        if let Some((kind, message)) = &outcome.failure {
            if step.continue_on_error {
                warn!(step = %step.name, kind = %kind, "step failed, continuing");
            } else if failure.is_none() {
                failure = Some(CellFailure {
                    kind: *kind,
                    step: Some(step.name.clone()),
                    message: message.clone(),
                });
            }
        }
        record.steps.push(outcome.record);
    }

    timer.abort();

    if failure.is_none() && job_token.is_cancelled() {
        let kind = if timed_out.load(Ordering::SeqCst) {
            FailureKind::Timeout
        } else {
            FailureKind::Cancelled
        };
        failure = Some(CellFailure {
            kind,
            step: None,
            message: format!("job {kind} before all steps ran"),
        });
    }

    if failure.is_none() {
        save_caches(&ctx, &state).await;
    }

    record.status = match &failure {
        None => RunStatus::Success,
        Some(f) if f.kind == FailureKind::Cancelled => RunStatus::Cancelled,
        Some(_) => RunStatus::Failed,
    };
    record.failure = failure;
    record.completed_at = Some(Utc::now());

    match &record.failure {
        None => info!(duration_ms = state.started.elapsed().as_millis() as u64, "cell succeeded"),
        Some(f) => warn!(kind = %f.kind, step = ?f.step, "cell failed"),
    }

    cleanup(&ctx, state.workspace).await;
    record
}

fn skip_reason(condition: StepCondition, cancelled: bool, timed_out: bool) -> &'static str {
    match (cancelled, timed_out, condition) {
        (true, true, _) => "job timed out",
        (true, false, _) => "job cancelled",
        (false, _, StepCondition::Failure) => "no earlier step failed",
        (false, _, _) => "an earlier step failed",
    }
}

/// Environment shared by every step of the cell.
fn base_env(ctx: &CellContext, cell: &MatrixCell, cell_id: &str) -> Result<HashMap<String, String>, CiError> {
    let mut env = ctx.host_env.clone();

    let vars = cell.template_vars(&ctx.workflow.name, cell_id);
    for (key, value) in &ctx.workflow.env {
        let rendered = render_template(value, &vars).map_err(|source| CiError::RenderStep {
            step: "env".to_string(),
            source,
        })?;
        env.insert(key.clone(), rendered);
    }
    Ok(env)
}

fn ci_env(ctx: &CellContext, cell: &MatrixCell, workspace: &CellWorkspace) -> [(&'static str, String); 10] {
    [
        ("CI", "true".to_string()),
        ("TESSERA", "true".to_string()),
        ("TESSERA_WORKFLOW", ctx.workflow.name.clone()),
        ("TESSERA_MATRIX_OS", cell.os.clone()),
        ("TESSERA_MATRIX_VERSION", cell.version.clone()),
        ("TESSERA_RUN_ID", ctx.run_id.clone()),
        ("TESSERA_WORKSPACE", workspace.root().display().to_string()),
        ("TESSERA_EVENT", ctx.event.to_string()),
        ("TESSERA_BRANCH", ctx.branch.clone()),
        ("TESSERA_CONTENTS_PERMISSION", ctx.workflow.permissions.contents.to_string()),
    ]
}

async fn run_step(
    ctx: &CellContext,
    cell: &MatrixCell,
    state: &mut CellState,
    index: usize,
    step: &StepConfig,
    job_token: &CancellationToken,
    record: &mut CellRun,
) -> StepOutcome {
    let started = Instant::now();
    let mut outcome = StepOutcome::new(step);
    let phase_kind = failure_kind_for_phase(step.phase());

    let planned = match plan_step(step, cell, &ctx.workflow.name, state.workspace.root()) {
        Ok(planned) => planned,
        Err(e) => {
            let kind = match e {
                CiError::UnsupportedPlatform { .. } => phase_kind,
                _ => FailureKind::Internal,
            };
            outcome.fail(StepStatus::Failed, kind, e.to_string());
            return outcome;
        }
    };

    // Step search path entries apply to this and every later step.
    state.search_additions.extend(planned.path.iter().cloned());

    info!(step = %step.name, kind = step.action.kind_name(), "step started");

    match &planned.plan {
        StepPlan::Shell { script, path_after } => {
            run_shell(ctx, cell, state, index, step, &planned, script, job_token, &mut outcome).await;
            if outcome.failure.is_none() {
                state.search_additions.extend(path_after.iter().cloned());
            }
        }
        StepPlan::Checkout { exclude } => {
            let skip = Some(ctx.config.state_dir.as_path());
            match checkout_sources(&ctx.source_dir, state.workspace.root(), exclude, skip).await {
                Ok(stats) => {
                    outcome.record.message =
                        Some(format!("{} files, {} bytes", stats.files_written, stats.bytes_written));
                }
                Err(e) => outcome.fail(StepStatus::Failed, phase_kind, e.to_string()),
            }
        }
        StepPlan::Cache {
            key,
            restore_keys,
            paths,
        } => match ctx.cache.restore(key, restore_keys, state.workspace.root()).await {
            Ok(restored) => {
                match &restored {
                    RestoreOutcome::ExactHit { .. } => info!(key = %key, "cache hit"),
                    RestoreOutcome::PrefixHit { key: found, .. } => {
                        info!(key = %key, restored = %found, "cache restored from prefix")
                    }
                    RestoreOutcome::Miss => info!(key = %key, "cache miss, continuing"),
                }
                if !restored.is_exact_hit() {
                    state.pending_saves.push(PendingSave {
                        key: key.clone(),
                        paths: paths.clone(),
                    });
                }
                outcome.record.cache = Some(restored);
            }
            Err(source) => outcome.fail(StepStatus::Failed, phase_kind, CiError::Cache { source }.to_string()),
        },
        StepPlan::Artifact {
            name,
            path,
            pattern,
            policy,
        } => {
            let source = state.workspace.resolve(path);
            let dest_root = ctx.config.artifacts_dir().join(&ctx.run_id);
            match collect_artifact(&source, pattern, &dest_root, name).await {
                Ok(artifact) if artifact.is_empty() => {
                    let message = format!("no files matching '{pattern}' in '{path}'");
                    match policy {
                        NoFilesPolicy::Error => {
                            outcome.fail(StepStatus::Failed, FailureKind::ArtifactContract, message);
                        }
                        NoFilesPolicy::Warn => {
                            warn!(artifact = %name, "{message}");
                            outcome.record.message = Some(message);
                        }
                        NoFilesPolicy::Ignore => {}
                    }
                }
                Ok(artifact) => {
                    outcome.record.message = Some(format!("{} files", artifact.files.len()));
                    record.artifacts.push(artifact);
                }
                Err(e) => outcome.fail(StepStatus::Failed, phase_kind, e.to_string()),
            }
        }
    }

    outcome.record.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        step = %step.name,
        status = %outcome.record.status,
        duration_ms = outcome.record.duration_ms,
        "step finished"
    );
    outcome
}

#[allow(clippy::too_many_arguments)]
async fn run_shell(
    ctx: &CellContext,
    cell: &MatrixCell,
    state: &CellState,
    index: usize,
    step: &StepConfig,
    planned: &PlannedStep,
    script: &str,
    job_token: &CancellationToken,
    outcome: &mut StepOutcome,
) {
    let mut env = state.base_env.clone();
    env.extend(planned.env.iter().cloned());
    env.extend(ci_env(ctx, cell, &state.workspace).into_iter().map(|(k, v)| (k.to_string(), v)));
    env.insert("PATH".to_string(), build_search_path(&state.search_additions, &ctx.base_path));

    let remaining_ms = remaining_time_ms(state.job_timeout_ms, state.started.elapsed().as_millis() as u64);
    let timeout_secs = effective_step_timeout_secs(step.timeout_secs, MAX_STEP_TIMEOUT_SECS, remaining_ms);

    let log_path = ctx
        .config
        .logs_dir()
        .join(&ctx.run_id)
        .join(&state.cell_id)
        .join(format!("{:02}-{}.log", index + 1, slug(&step.name)));
    let log = match SpawnedLogWriter::spawn(log_path).await {
        Ok(log) => log,
        Err(e) => {
            outcome.fail(StepStatus::Failed, FailureKind::Internal, e.to_string());
            return;
        }
    };

    let request = ExecutionRequest {
        id: format!("{}/{}/{}", ctx.run_id, state.cell_id, index),
        command: "sh".to_string(),
        args: vec!["-e".to_string(), "-c".to_string(), script.to_string()],
        working_dir: state.workspace.resolve(planned.working_dir.as_deref().unwrap_or(".")),
        env,
        timeout_secs,
    };

    let result = ctx.executor.execute(request, log.sender(), job_token.clone()).await;
    let phase_kind = failure_kind_for_phase(step.phase());

    match result {
        Ok(result) => {
            outcome.record.exit_code = result.exit_code();
            match result.outcome {
                ExecutionOutcome::Exited { code: 0 } => {}
                ExecutionOutcome::Exited { code } => {
                    let message = format!("exited with code {code}{}", quote_tail(&result.stderr_tail, &result.stdout_tail));
                    outcome.fail(StepStatus::Failed, phase_kind, message);
                }
                ExecutionOutcome::Signaled { signal } => {
                    let message = format!("killed by signal {signal}{}", quote_tail(&result.stderr_tail, &result.stdout_tail));
                    outcome.fail(StepStatus::Failed, phase_kind, message);
                }
                ExecutionOutcome::TimedOut { timeout_secs } => {
                    outcome.fail(
                        StepStatus::TimedOut,
                        FailureKind::Timeout,
                        format!("step timed out after {timeout_secs}s"),
                    );
                }
                ExecutionOutcome::Cancelled => {
                    if state.timed_out.load(Ordering::SeqCst) {
                        let message = format!("job timed out after {} minutes", ctx.workflow.timeout_minutes);
                        outcome.fail(StepStatus::TimedOut, FailureKind::Timeout, message);
                    } else {
                        outcome.fail(StepStatus::Cancelled, FailureKind::Cancelled, "step cancelled".to_string());
                    }
                }
            }
        }
        Err(source) => {
            let e = CiError::Execute {
                step: step.name.clone(),
                source,
            };
            outcome.fail(StepStatus::Failed, phase_kind, e.to_string());
        }
    }

    outcome.record.log_path = log.finish(&outcome.record.status.to_string()).await;
}

/// Format the end of a failed step's output for its failure message.
fn quote_tail(stderr: &str, stdout: &str) -> String {
    let source = if stderr.trim().is_empty() { stdout } else { stderr };
    let lines: Vec<&str> = source.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let start = lines.len().saturating_sub(FAILURE_TAIL_LINES);
    format!(":\n{}", lines[start..].join("\n"))
}

async fn save_caches(ctx: &CellContext, state: &CellState) {
    for save in &state.pending_saves {
        match ctx.cache.save(&save.key, state.workspace.root(), &save.paths).await {
            Ok(entry) => info!(key = %entry.key, size_bytes = entry.size_bytes, "cache saved"),
            Err(source) => {
                let e = CiError::Cache { source };
                warn!(key = %save.key, error = %e, "failed to save cache");
            }
        }
    }
}

async fn cleanup(ctx: &CellContext, workspace: CellWorkspace) {
    if ctx.config.keep_workspaces {
        info!(path = %workspace.root().display(), "keeping workspace");
        return;
    }
    if let Err(e) = workspace.cleanup().await {
        warn!(error = %e, "failed to remove workspace");
    }
}
