//! Error types for the shell executor.

use snafu::Snafu;

/// Errors that prevent a command from running.
///
/// A command that runs and fails, times out or is cancelled is not an
/// error; see [`ExecutionOutcome`](crate::ExecutionOutcome).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ExecutorError {
    /// Failed to spawn process.
    #[snafu(display("failed to spawn process '{command}': {source}"))]
    SpawnProcess { command: String, source: std::io::Error },

    /// Child pipes were not available after spawning.
    #[snafu(display("failed to capture output of '{command}'"))]
    CaptureOutput { command: String },

    /// Invalid working directory.
    #[snafu(display("invalid working directory: {path}"))]
    InvalidWorkingDir { path: String },

    /// Working directory outside the workspace root.
    #[snafu(display("working directory must be under {root}, got: {path}"))]
    WorkingDirNotUnderWorkspace { root: String, path: String },

    /// A job with the same id is already running.
    #[snafu(display("job already running: {id}"))]
    DuplicateJob { id: String },

    /// Job not found for cancellation.
    #[snafu(display("job not found: {id}"))]
    JobNotFound { id: String },
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;
