//! Request, result and streaming types for step execution.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

/// A command to run in its own process group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Unique job ID for correlation and cancellation.
    pub id: String,

    /// Command to execute (absolute path or PATH lookup).
    pub command: String,

    /// Command arguments.
    pub args: Vec<String>,

    /// Working directory. Must be under the executor's workspace root.
    pub working_dir: PathBuf,

    /// Complete environment for the child. Nothing is inherited.
    pub env: HashMap<String, String>,

    /// Execution timeout in seconds.
    pub timeout_secs: u64,
}

/// How a command finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The process exited on its own.
    Exited {
        /// Exit code.
        code: i32,
    },
    /// The process was killed by a signal it did not get from us.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The timeout elapsed and the process group was terminated.
    TimedOut {
        /// Timeout that elapsed.
        timeout_secs: u64,
    },
    /// Cancellation was requested and the process group was terminated.
    Cancelled,
}

/// Final result of command execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Job ID (echoed from request).
    pub id: String,

    /// How the process finished.
    pub outcome: ExecutionOutcome,

    /// Last part of standard output.
    pub stdout_tail: String,

    /// Last part of standard error.
    pub stderr_tail: String,

    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// True if the process exited with code zero.
    pub fn success(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Exited { code: 0 })
    }

    /// Exit code, if the process exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self.outcome {
            ExecutionOutcome::Exited { code } => Some(code),
            _ => None,
        }
    }
}

/// Log message streamed during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum LogMessage {
    /// One line of stdout, newline included.
    Stdout(String),

    /// One line of stderr, newline included.
    Stderr(String),

    /// Periodic liveness signal during long steps.
    Heartbeat { elapsed_secs: u64 },
}
