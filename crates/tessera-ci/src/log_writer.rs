//! Per-step log files.
//!
//! The executor streams [`LogMessage`]s over a bounded channel; a spawned
//! task appends them to `logs/<run_id>/<cell_id>/<NN>-<step>.log`, one line
//! per message prefixed with the stream name.
//!
//! # Tiger Style
//!
//! - Bounded channel capacity (1000 messages) for backpressure
//! - Bounded file size (16 MB) to prevent disk exhaustion
//! - Periodic flush (500ms) so logs can be tailed while a step runs

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use snafu::ResultExt;
use tessera_ci_executor_shell::LogMessage;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::io::BufWriter;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::debug;
use tracing::warn;

use crate::error::CreateDirSnafu;
use crate::error::OpenLogSnafu;
use crate::error::Result;

/// Channel buffer capacity for log lines.
pub const LOG_CHANNEL_CAPACITY: usize = 1000;

/// Maximum bytes written to one step log (16 MB).
pub const MAX_LOG_FILE_BYTES: u64 = 16 * 1024 * 1024;

/// Interval between background flushes.
const LOG_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Buffered writer for one step log.
pub struct StepLogWriter {
    path: PathBuf,
    file: BufWriter<File>,
    bytes_written: u64,
    max_bytes: u64,
    limit_reached: bool,
}

impl StepLogWriter {
    /// Create the log file, including parent directories.
    pub async fn create(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.context(CreateDirSnafu { path: parent })?;
        }
        let file = File::create(&path).await.context(OpenLogSnafu { path: &path })?;
        Ok(Self {
            path,
            file: BufWriter::new(file),
            bytes_written: 0,
            max_bytes: MAX_LOG_FILE_BYTES,
            limit_reached: false,
        })
    }

    /// Override the size limit.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far, excluding the truncation notice.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Check if the size limit has been reached.
    pub fn is_limit_reached(&self) -> bool {
        self.limit_reached
    }

    /// Append a line, prefixed with its stream name.
    pub async fn write_line(&mut self, line: &str, stream: &str) -> std::io::Result<()> {
        if self.limit_reached {
            return Ok(());
        }

        let line = line.strip_suffix('\n').unwrap_or(line);
        let prefixed = format!("[{stream}] {line}\n");
        let new_total = self.bytes_written.saturating_add(prefixed.len() as u64);
        if new_total > self.max_bytes {
            self.limit_reached = true;
            warn!(path = %self.path.display(), max_bytes = self.max_bytes, "step log limit reached, dropping subsequent output");
            self.file
                .write_all(format!("[tessera] log truncated after {} bytes\n", self.bytes_written).as_bytes())
                .await?;
            return Ok(());
        }

        self.file.write_all(prefixed.as_bytes()).await?;
        self.bytes_written = new_total;
        Ok(())
    }

    /// Flush buffered output to disk.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush().await
    }

    /// Write a closing status line and flush.
    pub async fn complete(&mut self, status: &str) -> std::io::Result<()> {
        self.file.write_all(format!("[tessera] step finished: {status}\n").as_bytes()).await?;
        self.file.flush().await?;
        debug!(path = %self.path.display(), bytes = self.bytes_written, status, "step log completed");
        Ok(())
    }

    async fn write_message(&mut self, msg: LogMessage) -> std::io::Result<()> {
        match msg {
            LogMessage::Stdout(line) => self.write_line(&line, "stdout").await,
            LogMessage::Stderr(line) => self.write_line(&line, "stderr").await,
            LogMessage::Heartbeat { elapsed_secs } => {
                self.write_line(&format!("still running after {elapsed_secs}s"), "tessera").await
            }
        }
    }
}

/// Handle to a log writer running in a background task.
pub struct SpawnedLogWriter {
    tx: mpsc::Sender<LogMessage>,
    handle: tokio::task::JoinHandle<StepLogWriter>,
}

impl SpawnedLogWriter {
    /// Create the log file and spawn the writer task.
    pub async fn spawn(path: PathBuf) -> Result<Self> {
        let mut writer = StepLogWriter::create(path).await?;
        let (tx, mut rx) = mpsc::channel::<LogMessage>(LOG_CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            let mut flush_interval = interval(LOG_FLUSH_INTERVAL);
            // Skip the immediate first tick
            flush_interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        if let Err(e) = writer.write_message(msg).await {
                            warn!(path = %writer.path.display(), error = %e, "failed to write log line");
                        }
                    }
                    _ = flush_interval.tick() => {
                        if let Err(e) = writer.flush().await {
                            warn!(path = %writer.path.display(), error = %e, "failed to flush log buffer");
                        }
                    }
                }
            }
            writer
        });

        Ok(Self { tx, handle })
    }

    /// Sender to hand to the executor.
    pub fn sender(&self) -> mpsc::Sender<LogMessage> {
        self.tx.clone()
    }

    /// Close the channel, wait for pending lines and write the status line.
    ///
    /// Returns the log path. Write failures are logged, not returned.
    pub async fn finish(self, status: &str) -> Option<PathBuf> {
        let Self { tx, handle } = self;
        drop(tx);
        match handle.await {
            Ok(mut writer) => {
                if let Err(e) = writer.complete(status).await {
                    warn!(path = %writer.path.display(), error = %e, "failed to complete step log");
                }
                Some(writer.path)
            }
            Err(e) => {
                warn!(error = %e, "log writer task failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawned_writer_records_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/cell/01-test.log");
        let writer = SpawnedLogWriter::spawn(path.clone()).await.unwrap();

        let tx = writer.sender();
        tx.send(LogMessage::Stdout("hello\n".to_string())).await.unwrap();
        tx.send(LogMessage::Stderr("oops\n".to_string())).await.unwrap();
        drop(tx);

        let written = writer.finish("success").await.unwrap();
        assert_eq!(written, path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[stdout] hello\n[stderr] oops\n[tessera] step finished: success\n");
    }

    #[tokio::test]
    async fn test_size_limit_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.log");
        let mut writer = StepLogWriter::create(path.clone()).await.unwrap().with_max_bytes(20);

        writer.write_line("0123456789", "stdout").await.unwrap();
        writer.write_line("this one is dropped", "stdout").await.unwrap();
        writer.write_line("and so is this", "stdout").await.unwrap();
        writer.flush().await.unwrap();

        assert!(writer.is_limit_reached());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "[stdout] 0123456789\n[tessera] log truncated after 20 bytes\n");
    }
}
