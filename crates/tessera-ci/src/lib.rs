//! Matrix workflow runner.
//!
//! Loads a TOML workflow, expands its OS × version matrix and runs every
//! cell as an isolated job: fresh workspace, sequential steps, per-step
//! process groups, fixture cache restore and save, artifact collection and
//! a persisted run record.
//!
//! # Main Components
//!
//! - [`config`]: workflow loader, runner configuration and JSON schema
//! - [`WorkflowOrchestrator`]: fan-out over cells with bounded parallelism
//! - [`steps`]: rendering of declarative steps into shell scripts
//! - [`artifacts`]: glob-based artifact collection
//! - [`log_writer`]: per-step log files
//! - [`RunStore`]: `runs/<id>.json` persistence
//!
//! # Example
//!
//! ```no_run
//! use tessera_ci::config::RunnerConfig;
//! use tessera_ci::config::load_workflow_config;
//! use tessera_ci::orchestrator::RunContext;
//! use tessera_ci::orchestrator::WorkflowOrchestrator;
//!
//! # async fn example() -> tessera_ci::error::Result<()> {
//! let workflow = load_workflow_config(std::path::Path::new(".tessera/workflow.toml"))?;
//! let orchestrator = WorkflowOrchestrator::new(RunnerConfig::default().resolve()?);
//! let run = orchestrator.run(workflow, RunContext::manual(".")).await?;
//! println!("{}: {}", run.id, run.status);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

pub mod artifacts;
pub mod config;
pub mod error;
pub mod log_writer;
pub mod orchestrator;
pub mod steps;
pub mod trigger;
pub mod workspace;

pub use config::RunnerConfig;
pub use config::load_workflow_config;
pub use error::CiError;
pub use error::Result;
pub use orchestrator::RunContext;
pub use orchestrator::RunStatus;
pub use orchestrator::RunStore;
pub use orchestrator::WorkflowOrchestrator;
pub use orchestrator::WorkflowRun;
