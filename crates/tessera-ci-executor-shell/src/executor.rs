//! Command execution engine.
//!
//! Handles spawning processes, streaming output, enforcing timeouts,
//! and process lifecycle management.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use command_group::AsyncCommandGroup;
use command_group::AsyncGroupChild;
use snafu::ResultExt;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::error::Result;
use crate::error::{self};
use crate::output::OutputTail;
use crate::output::normalize_line;
use crate::protocol::ExecutionOutcome;
use crate::protocol::ExecutionRequest;
use crate::protocol::ExecutionResult;
use crate::protocol::LogMessage;

/// Heartbeat interval during execution.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Grace period for SIGTERM before SIGKILL.
pub const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for output pipes to close after the leader exits.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// PATH used when the request does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin:/usr/local/sbin:/usr/sbin:/sbin";

/// Handle to a running job, used for cancellation.
struct JobHandle {
    cancel: CancellationToken,
}

/// Executor that runs commands in process groups and streams output.
pub struct Executor {
    /// Currently running jobs, keyed by job ID.
    running_jobs: Arc<Mutex<HashMap<String, JobHandle>>>,

    /// Working directories must be under this path.
    workspace_root: PathBuf,
}

impl Executor {
    /// Create an executor confined to `workspace_root`.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            running_jobs: Arc::new(Mutex::new(HashMap::new())),
            workspace_root: workspace_root.into(),
        }
    }

    /// Workspace root.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Execute a command and stream output via the provided channel.
    ///
    /// Returns when the command completes, times out, or `cancel` fires.
    /// Timeout and cancellation terminate the whole process group.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        log_tx: mpsc::Sender<LogMessage>,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult> {
        let job_id = request.id.clone();
        let start = Instant::now();

        self.validate_working_dir(&request.working_dir)?;

        let job_cancel = cancel.child_token();
        {
            let mut jobs = self.running_jobs.lock().await;
            if jobs.contains_key(&job_id) {
                return error::DuplicateJobSnafu { id: job_id }.fail();
            }
            jobs.insert(job_id.clone(), JobHandle {
                cancel: job_cancel.clone(),
            });
        }

        let result = self.execute_inner(&request, log_tx, job_cancel).await;

        {
            let mut jobs = self.running_jobs.lock().await;
            jobs.remove(&job_id);
        }

        let (outcome, stdout_tail, stderr_tail) = result?;
        let duration_ms = start.elapsed().as_millis() as u64;

        info!(job_id = %job_id, outcome = ?outcome, duration_ms, "command finished");

        Ok(ExecutionResult {
            id: job_id,
            outcome,
            stdout_tail,
            stderr_tail,
            duration_ms,
        })
    }

    /// Cancel a running job by ID.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let jobs = self.running_jobs.lock().await;
        match jobs.get(job_id) {
            Some(handle) => {
                handle.cancel.cancel();
                info!(job_id = %job_id, "job cancelled");
                Ok(())
            }
            None => error::JobNotFoundSnafu { id: job_id }.fail(),
        }
    }

    /// Check if a job is running.
    pub async fn is_running(&self, job_id: &str) -> bool {
        let jobs = self.running_jobs.lock().await;
        jobs.contains_key(job_id)
    }

    /// Validate that working directory is safe.
    fn validate_working_dir(&self, path: &Path) -> Result<()> {
        if !path.is_absolute() || !path.starts_with(&self.workspace_root) {
            return error::WorkingDirNotUnderWorkspaceSnafu {
                root: self.workspace_root.display().to_string(),
                path: path.display().to_string(),
            }
            .fail();
        }

        if !path.is_dir() {
            return error::InvalidWorkingDirSnafu {
                path: path.display().to_string(),
            }
            .fail();
        }

        Ok(())
    }

    async fn execute_inner(
        &self,
        request: &ExecutionRequest,
        log_tx: mpsc::Sender<LogMessage>,
        cancel: CancellationToken,
    ) -> Result<(ExecutionOutcome, String, String)> {
        info!(
            job_id = %request.id,
            command = %request.command,
            working_dir = %request.working_dir.display(),
            timeout_secs = request.timeout_secs,
            "executing command"
        );

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        cmd.envs(&request.env);
        if !request.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        // Spawn as process group for clean termination
        let mut child: AsyncGroupChild = cmd.group_spawn().context(error::SpawnProcessSnafu {
            command: request.command.clone(),
        })?;
        let pid = child.inner().id();

        let capture_err = || error::CaptureOutputSnafu {
            command: request.command.clone(),
        };
        let stdout = child.inner().stdout.take().ok_or_else(|| capture_err().build())?;
        let stderr = child.inner().stderr.take().ok_or_else(|| capture_err().build())?;

        let mut stdout_handle = spawn_stream_reader(stdout, log_tx.clone(), LogMessage::Stdout);
        let mut stderr_handle = spawn_stream_reader(stderr, log_tx.clone(), LogMessage::Stderr);
        let heartbeat_handle = spawn_heartbeat(request.id.clone(), log_tx);

        let timeout = Duration::from_secs(request.timeout_secs);

        enum ExitReason {
            Completed(std::process::ExitStatus),
            WaitError(std::io::Error),
            Timeout,
            Cancelled,
        }

        let exit_reason = tokio::select! {
            wait_result = child.wait() => {
                match wait_result {
                    Ok(status) => ExitReason::Completed(status),
                    Err(e) => ExitReason::WaitError(e),
                }
            }
            _ = tokio::time::sleep(timeout) => ExitReason::Timeout,
            _ = cancel.cancelled() => ExitReason::Cancelled,
        };

        let outcome = match exit_reason {
            ExitReason::Completed(status) => outcome_from_status(status),
            ExitReason::WaitError(e) => {
                error!(job_id = %request.id, error = %e, "process wait failed");
                terminate_process_group(&mut child, pid, GRACE_PERIOD).await;
                ExecutionOutcome::Exited { code: -1 }
            }
            ExitReason::Timeout => {
                warn!(job_id = %request.id, timeout_secs = request.timeout_secs, "execution timed out");
                terminate_process_group(&mut child, pid, GRACE_PERIOD).await;
                ExecutionOutcome::TimedOut {
                    timeout_secs: request.timeout_secs,
                }
            }
            ExitReason::Cancelled => {
                info!(job_id = %request.id, "execution cancelled");
                terminate_process_group(&mut child, pid, GRACE_PERIOD).await;
                ExecutionOutcome::Cancelled
            }
        };

        heartbeat_handle.abort();

        // Background processes left in the group can hold the pipes open.
        let drained = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, async {
            let stdout = (&mut stdout_handle).await.unwrap_or_default();
            let stderr = (&mut stderr_handle).await.unwrap_or_default();
            (stdout, stderr)
        })
        .await;

        let (stdout_tail, stderr_tail) = match drained {
            Ok(tails) => tails,
            Err(_) => {
                warn!(job_id = %request.id, "output still open after exit, killing leftover processes");
                kill_group(pid);
                stdout_handle.abort();
                stderr_handle.abort();
                (String::new(), String::new())
            }
        };

        Ok((outcome, stdout_tail, stderr_tail))
    }
}

fn spawn_stream_reader<R>(
    stream: R,
    log_tx: mpsc::Sender<LogMessage>,
    wrap: fn(String) -> LogMessage,
) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut raw = Vec::new();
        let mut tail = OutputTail::default();

        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let line = normalize_line(&raw);
                    tail.push(&line);
                    // The receiver may be gone; keep draining so the child never blocks.
                    let _ = log_tx.send(wrap(line)).await;
                }
                Err(e) => {
                    warn!(error = %e, "error reading process output");
                    break;
                }
            }
        }
        tail.into_string()
    })
}

fn spawn_heartbeat(job_id: String, log_tx: mpsc::Sender<LogMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        interval.tick().await; // Skip first immediate tick

        loop {
            interval.tick().await;
            let elapsed_secs = start.elapsed().as_secs();
            debug!(job_id = %job_id, elapsed_secs, "sending heartbeat");
            if log_tx.send(LogMessage::Heartbeat { elapsed_secs }).await.is_err() {
                break;
            }
        }
    })
}

#[cfg(unix)]
fn outcome_from_status(status: std::process::ExitStatus) -> ExecutionOutcome {
    use std::os::unix::process::ExitStatusExt;

    match (status.code(), status.signal()) {
        (Some(code), _) => ExecutionOutcome::Exited { code },
        (None, Some(signal)) => ExecutionOutcome::Signaled { signal },
        (None, None) => ExecutionOutcome::Exited { code: -1 },
    }
}

#[cfg(not(unix))]
fn outcome_from_status(status: std::process::ExitStatus) -> ExecutionOutcome {
    ExecutionOutcome::Exited {
        code: status.code().unwrap_or(-1),
    }
}

/// Terminate a process group gracefully.
///
/// On Unix:
/// 1. Send SIGTERM to process group
/// 2. Wait for grace period
/// 3. Send SIGKILL if still running
/// 4. Reap the process
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, pid: Option<u32>, grace: Duration) {
    use nix::sys::signal::Signal;

    let Some(pid) = pid else {
        return; // Already exited
    };

    signal_group(pid, Signal::SIGTERM);

    // Wait for graceful exit
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.inner().try_wait().ok().flatten().is_some() {
            // The leader is gone; make sure nothing else in the group survives.
            signal_group(pid, Signal::SIGKILL);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    signal_group(pid, Signal::SIGKILL);

    // Reap
    let _ = child.wait().await;
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::unistd::Pid;

    let pgid = Pid::from_raw(-(pid as i32));
    if let Err(e) = nix::sys::signal::kill(pgid, signal)
        && e != nix::errno::Errno::ESRCH
    {
        warn!(pid, signal = ?signal, error = ?e, "signal to process group failed");
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        signal_group(pid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _pid: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_validate_working_dir_rejects_outside_workspace() {
        let root = tempfile::tempdir().unwrap();
        let executor = Executor::new(root.path());

        let result = executor.validate_working_dir(Path::new("/tmp/evil"));
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains(&root.path().display().to_string()));
    }

    #[tokio::test]
    async fn test_validate_working_dir_rejects_relative_path() {
        let executor = Executor::new("/srv/tessera");
        assert!(executor.validate_working_dir(Path::new("workspace/project")).is_err());
    }

    #[tokio::test]
    async fn test_validate_working_dir_rejects_missing() {
        let root = tempfile::tempdir().unwrap();
        let executor = Executor::new(root.path());
        let err = executor.validate_working_dir(&root.path().join("missing")).unwrap_err();
        assert!(err.to_string().contains("invalid working directory"));
    }

    #[tokio::test]
    async fn test_executor_is_running_empty() {
        let executor = Executor::new("/srv/tessera");
        assert!(!executor.is_running("nonexistent-job").await);
    }

    #[tokio::test]
    async fn test_cancel_nonexistent_job() {
        let executor = Executor::new("/srv/tessera");
        let err = executor.cancel("nonexistent-job").await.unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_constants() {
        assert_eq!(HEARTBEAT_INTERVAL, Duration::from_secs(30));
        assert_eq!(GRACE_PERIOD, Duration::from_secs(5));
    }
}
