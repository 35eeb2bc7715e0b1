//! Shell executor for Tessera workflow steps.
//!
//! Every step runs as a child process in its own process group with a
//! cleared environment. Output is streamed line by line to the caller while
//! a bounded tail of each stream is kept for failure reports.
//!
//! # Main Components
//!
//! - [`Executor`]: Command execution engine with streaming output
//! - [`ExecutionRequest`] / [`ExecutionResult`]: what to run and how it ended
//! - [`LogMessage`]: streamed stdout/stderr lines and heartbeats
//! - [`OutputTail`]: bounded tail buffer
//!
//! # Termination
//!
//! On timeout or cancellation the group receives SIGTERM, then SIGKILL after
//! [`GRACE_PERIOD`].

pub mod error;
pub mod executor;
pub mod output;
pub mod protocol;

pub use error::ExecutorError;
pub use executor::DEFAULT_PATH;
pub use executor::Executor;
pub use executor::GRACE_PERIOD;
pub use output::OutputTail;
pub use protocol::ExecutionOutcome;
pub use protocol::ExecutionRequest;
pub use protocol::ExecutionResult;
pub use protocol::LogMessage;
