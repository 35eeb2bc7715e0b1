//! Run records.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tessera_cache::RestoreOutcome;
use tessera_ci_core::FailureKind;
use tessera_ci_core::MatrixCell;
use tessera_ci_core::config::ContentsAccess;
use tessera_ci_core::config::StepPhase;
use tessera_ci_core::config::TriggerEvent;
use uuid::Uuid;

use crate::artifacts::ArtifactRecord;

/// Status of a run or a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Waiting to start.
    Pending,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Success,
    /// Completed with a failure.
    Failed,
    /// Stopped before completion.
    Cancelled,
}

impl RunStatus {
    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step succeeded.
    Success,
    /// Step failed.
    Failed,
    /// Step was not run.
    Skipped,
    /// Step hit its timeout.
    TimedOut,
    /// Step was cancelled.
    Cancelled,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a cell failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellFailure {
    /// Failure classification.
    pub kind: FailureKind,
    /// Step that caused the failure, if any.
    pub step: Option<String>,
    /// Human-readable detail.
    pub message: String,
}

/// Record of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    /// Step name.
    pub name: String,
    /// Step kind (`run`, `cache`, ...).
    pub kind: String,
    /// Step phase.
    pub phase: StepPhase,
    /// Outcome.
    pub status: StepStatus,
    /// Exit code of the shell, when there was one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Log file, for steps that run commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    /// Cache restore result for cache steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<RestoreOutcome>,
    /// Detail for failures, warnings and skips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StepRun {
    /// A step that did not run.
    pub fn skipped(name: &str, kind: &str, phase: StepPhase, reason: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            phase,
            status: StepStatus::Skipped,
            exit_code: None,
            duration_ms: 0,
            log_path: None,
            cache: None,
            message: Some(reason.into()),
        }
    }
}

/// Record of one matrix cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CellRun {
    /// Matrix coordinates.
    pub cell: MatrixCell,
    /// Cell id (`<os>-<version>`).
    pub id: String,
    /// Cell status.
    pub status: RunStatus,
    /// Failure detail for failed or cancelled cells.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<CellFailure>,
    /// When the cell started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the cell completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Step records in workflow order.
    pub steps: Vec<StepRun>,
    /// Stored artifact bundles.
    pub artifacts: Vec<ArtifactRecord>,
}

impl CellRun {
    /// A cell that has not started.
    pub fn pending(cell: MatrixCell) -> Self {
        let id = cell.id();
        Self {
            cell,
            id,
            status: RunStatus::Pending,
            failure: None,
            started_at: None,
            completed_at: None,
            steps: Vec::new(),
            artifacts: Vec::new(),
        }
    }

    /// Failure kind, if the cell failed.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.failure.as_ref().map(|f| f.kind)
    }

    /// Look up a step record by name.
    pub fn step(&self, name: &str) -> Option<&StepRun> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Mark the cell finished with an error that is not tied to a step.
    pub fn fail_internal(&mut self, message: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.failure = Some(CellFailure {
            kind: FailureKind::Internal,
            step: None,
            message: message.into(),
        });
        self.completed_at = Some(Utc::now());
    }
}

/// A workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Unique run ID.
    pub id: String,
    /// Workflow name.
    pub workflow: String,
    /// Triggering event.
    pub event: TriggerEvent,
    /// Branch the run is for.
    pub branch: String,
    /// Declared contents permission.
    pub permissions: ContentsAccess,
    /// Overall status.
    pub status: RunStatus,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// One record per selected cell, in expansion order.
    pub cells: Vec<CellRun>,
}

impl WorkflowRun {
    /// Create a new pending run.
    pub fn new(workflow: String, event: TriggerEvent, branch: String, permissions: ContentsAccess) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow,
            event,
            branch,
            permissions,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            cells: Vec::new(),
        }
    }

    /// Look up a cell by id.
    pub fn cell(&self, id: &str) -> Option<&CellRun> {
        self.cells.iter().find(|c| c.id == id)
    }

    /// Number of cells that did not succeed.
    pub fn failed_cells(&self) -> usize {
        self.cells.iter().filter(|c| c.status != RunStatus::Success).count()
    }

    /// Derive the run status from its cells.
    ///
    /// Any failed cell fails the run. A run whose only unsuccessful cells
    /// were cancelled from outside is cancelled.
    pub fn finish(&mut self, externally_cancelled: bool) {
        let any_failed = self.cells.iter().any(|c| c.status == RunStatus::Failed);
        let any_cancelled = self.cells.iter().any(|c| c.status != RunStatus::Success && c.status != RunStatus::Failed);
        self.status = if any_failed {
            RunStatus::Failed
        } else if any_cancelled || externally_cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Success
        };
        self.completed_at = Some(Utc::now());
    }
}
