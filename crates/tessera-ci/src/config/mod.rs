//! Workflow and runner configuration.
//!
//! Workflow files are TOML documents deserialized into
//! [`WorkflowConfig`](tessera_ci_core::WorkflowConfig) and validated before
//! use. The runner's own settings live in [`RunnerConfig`].

pub mod loader;
pub mod runner;
pub mod schema;

pub use loader::MAX_CONFIG_FILE_SIZE;
pub use loader::load_workflow_config;
pub use loader::load_workflow_config_str;
pub use runner::RunnerConfig;
pub use schema::workflow_schema;
