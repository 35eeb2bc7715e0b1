//! Error types for the workflow runner.
//!
//! Structured errors using `snafu` with source chains preserved. Core
//! configuration errors live in `tessera-ci-core::CiCoreError` and are
//! wrapped here.
//!
//! Step failures are not errors: a failing step is recorded on its cell
//! with a [`FailureKind`](tessera_ci_core::FailureKind). `CiError` is for
//! conditions that stop the runner itself.

use std::path::PathBuf;

use snafu::Snafu;
pub use tessera_ci_core::CiCoreError;

/// Result type for runner operations.
pub type Result<T, E = CiError> = std::result::Result<T, E>;

/// Runner errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CiError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Workflow or runner configuration file not found.
    #[snafu(display("Config not found: {}", path.display()))]
    ConfigNotFound {
        /// Path that was searched.
        path: PathBuf,
    },

    /// Configuration file too large.
    #[snafu(display("Config too large: {size} bytes (max: {max})"))]
    ConfigTooLarge {
        /// Actual size.
        size: u64,
        /// Maximum allowed.
        max: u64,
    },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read config file {}: {source}", path.display()))]
    ReadConfig {
        /// Path to the file.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Configuration is not valid TOML for the expected shape.
    #[snafu(display("Failed to parse {source_name}: {source}"))]
    ParseConfig {
        /// File name or other label of the source.
        source_name: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// Workflow failed validation.
    #[snafu(display("Invalid workflow: {source}"))]
    InvalidWorkflow {
        /// Validation error.
        source: CiCoreError,
    },

    /// Runner configuration value is invalid.
    #[snafu(display("Invalid runner config: {reason}"))]
    InvalidRunnerConfig {
        /// Reason for invalidity.
        reason: String,
    },

    /// Failed to serialize the workflow JSON schema.
    #[snafu(display("Failed to serialize schema: {source}"))]
    SerializeSchema {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    // ========================================================================
    // Trigger Errors
    // ========================================================================
    /// The workflow does not run for this event and branch.
    #[snafu(display("Workflow '{workflow}' is not triggered by {event} on '{branch}'"))]
    NotTriggered {
        /// Workflow name.
        workflow: String,
        /// Requested event.
        event: String,
        /// Requested branch.
        branch: String,
    },

    // ========================================================================
    // Workspace Errors
    // ========================================================================
    /// Failed to create a directory.
    #[snafu(display("Failed to create directory {}: {source}", path.display()))]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to remove a workspace.
    #[snafu(display("Failed to clean up workspace {}: {source}", path.display()))]
    CleanupWorkspace {
        /// Workspace path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to copy sources into a workspace.
    #[snafu(display("Checkout failed at {}: {source}", path.display()))]
    Checkout {
        /// Path being copied.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Checkout exceeded resource limits.
    #[snafu(display("Checkout exceeded limits: {reason}"))]
    CheckoutLimitExceeded {
        /// Which limit was exceeded.
        reason: String,
    },

    // ========================================================================
    // Step Errors
    // ========================================================================
    /// A step cannot run on this cell's OS.
    #[snafu(display("Step '{step}' cannot run on '{os}': {reason}"))]
    UnsupportedPlatform {
        /// Step name.
        step: String,
        /// Matrix OS value.
        os: String,
        /// What is missing.
        reason: String,
    },

    /// A step template could not be rendered.
    #[snafu(display("Failed to render step '{step}': {source}"))]
    RenderStep {
        /// Step name.
        step: String,
        /// Template error.
        source: CiCoreError,
    },

    /// Executor could not run a command.
    #[snafu(display("Failed to execute step '{step}': {source}"))]
    Execute {
        /// Step name.
        step: String,
        /// Executor error.
        source: tessera_ci_executor_shell::ExecutorError,
    },

    /// Cache store failure.
    #[snafu(display("Cache operation failed: {source}"))]
    Cache {
        /// Cache error.
        source: tessera_cache::CacheError,
    },

    // ========================================================================
    // Artifact Errors
    // ========================================================================
    /// Invalid artifact glob.
    #[snafu(display("Invalid artifact pattern '{pattern}': {source}"))]
    InvalidArtifactPattern {
        /// The pattern.
        pattern: String,
        /// Glob error.
        source: glob::PatternError,
    },

    /// Artifact name is not usable as a directory name.
    #[snafu(display("Invalid artifact name: '{name}'"))]
    InvalidArtifactName {
        /// The name.
        name: String,
    },

    /// Failed to copy an artifact file.
    #[snafu(display("Failed to store artifact file {}: {source}", path.display()))]
    StoreArtifact {
        /// File path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    // ========================================================================
    // Log Errors
    // ========================================================================
    /// Failed to open a step log.
    #[snafu(display("Failed to open log {}: {source}", path.display()))]
    OpenLog {
        /// Log path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    // ========================================================================
    // Persistence Errors
    // ========================================================================
    /// Failed to serialize a run record.
    #[snafu(display("Failed to serialize run record: {source}"))]
    SerializeRun {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Failed to write a run record.
    #[snafu(display("Failed to write run record {}: {source}", path.display()))]
    WriteRun {
        /// Record path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to read a run record.
    #[snafu(display("Failed to read run record {}: {source}", path.display()))]
    ReadRun {
        /// Record path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A run record is not valid JSON.
    #[snafu(display("Failed to parse run record {}: {source}", path.display()))]
    ParseRun {
        /// Record path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// No run with this ID.
    #[snafu(display("Run not found: {run_id}"))]
    RunNotFound {
        /// Run ID.
        run_id: String,
    },

    /// A blocking task panicked or was cancelled.
    #[snafu(display("Background task failed: {source}"))]
    BlockingTask {
        /// Join error.
        source: tokio::task::JoinError,
    },
}
