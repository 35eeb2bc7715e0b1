//! Configuration types for matrix workflows.
//!
//! These types are deserialized from TOML workflow files and validated
//! before any cell is scheduled.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::path::Component;
use std::path::Path;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

use crate::error::CiCoreError;
use crate::error::Result;
use crate::verified::branch_matches;
use crate::verified::references_matrix;
use crate::verified::validate_template;

/// Maximum steps per workflow.
pub const MAX_STEPS: usize = 64;
/// Maximum timeout for a single step (6 hours).
pub const MAX_STEP_TIMEOUT_SECS: u64 = 6 * 60 * 60;
/// Maximum job timeout (72 hours).
pub const MAX_JOB_TIMEOUT_MINUTES: u64 = 72 * 60;
/// Maximum restore keys per cache step.
pub const MAX_RESTORE_KEYS: usize = 16;

/// Event that requests a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A push to a branch.
    Push,
    /// A pull request targeting a branch.
    PullRequest,
    /// Started by hand; branch filters do not apply.
    Manual,
}

impl fmt::Display for TriggerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => f.write_str("push"),
            Self::PullRequest => f.write_str("pull_request"),
            Self::Manual => f.write_str("manual"),
        }
    }
}

/// Trigger configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    /// Events that start the workflow.
    #[serde(default = "default_events")]
    pub events: Vec<TriggerEvent>,

    /// Branch patterns (exact, or prefix with trailing `*`).
    #[serde(default = "default_branches")]
    pub branches: Vec<String>,
}

fn default_events() -> Vec<TriggerEvent> {
    vec![TriggerEvent::Push, TriggerEvent::PullRequest]
}

fn default_branches() -> Vec<String> {
    vec!["main".to_string()]
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            events: default_events(),
            branches: default_branches(),
        }
    }
}

impl TriggerConfig {
    /// Check whether an event on a branch starts the workflow.
    pub fn should_trigger(&self, event: TriggerEvent, branch: &str) -> bool {
        if !self.events.contains(&event) {
            return false;
        }
        event == TriggerEvent::Manual || self.branches.iter().any(|pattern| branch_matches(pattern, branch))
    }
}

/// Access level to repository contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ContentsAccess {
    /// Read-only.
    #[default]
    Read,
    /// Read and write.
    Write,
    /// No access.
    None,
}

impl fmt::Display for ContentsAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Write => f.write_str("write"),
            Self::None => f.write_str("none"),
        }
    }
}

/// Declared permissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Permissions {
    /// Repository contents access.
    #[serde(default)]
    pub contents: ContentsAccess,
}

/// Matrix exclusion. Unset fields match any value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixExclude {
    /// OS value to exclude.
    #[serde(default)]
    pub os: Option<String>,
    /// Version value to exclude.
    #[serde(default)]
    pub version: Option<String>,
}

impl MatrixExclude {
    /// Check whether this exclusion removes the given pair.
    pub fn matches(&self, os: &str, version: &str) -> bool {
        self.os.as_deref().is_none_or(|o| o == os) && self.version.as_deref().is_none_or(|v| v == version)
    }
}

/// Job matrix definition.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixConfig {
    /// Operating system identifiers.
    pub os: Vec<String>,

    /// Language version identifiers.
    pub version: Vec<String>,

    /// Pairs removed from the product.
    #[serde(default)]
    pub exclude: Vec<MatrixExclude>,

    /// Cancel remaining cells once one fails.
    #[serde(default)]
    pub fail_fast: bool,

    /// Maximum cells running at once.
    #[serde(default)]
    pub max_parallel: Option<u32>,
}

/// Phase a step belongs to. Decides the failure kind when it fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    /// OS packages and runtimes.
    Provision,
    /// External toolkit build.
    Build,
    /// Package-under-test installation.
    Install,
    /// Fixture cache.
    Cache,
    /// Test execution.
    #[default]
    Test,
    /// Artifact archival.
    Archive,
}

impl fmt::Display for StepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provision => "provision",
            Self::Build => "build",
            Self::Install => "install",
            Self::Cache => "cache",
            Self::Test => "test",
            Self::Archive => "archive",
        };
        f.write_str(s)
    }
}

/// When a step runs relative to earlier failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepCondition {
    /// Only if nothing failed so far.
    Success,
    /// Regardless of earlier failures.
    Always,
    /// Only if something failed.
    Failure,
}

/// Why a matrix cell failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// OS or runtime provisioning failed.
    Provisioning,
    /// External toolkit failed to build.
    Build,
    /// Package under test failed to install.
    Installation,
    /// Test script exited non-zero.
    Test,
    /// Expected artifacts were not produced.
    ArtifactContract,
    /// A step or the job exceeded its timeout.
    Timeout,
    /// Cancelled by fail-fast or by the user.
    Cancelled,
    /// Runner-side error (workspace, cache I/O, spawn).
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Provisioning => "provisioning",
            Self::Build => "build",
            Self::Installation => "installation",
            Self::Test => "test",
            Self::ArtifactContract => "artifact_contract",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// What to do when an artifact step matches no files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NoFilesPolicy {
    /// Fail the job.
    #[default]
    Error,
    /// Log a warning and succeed.
    Warn,
    /// Succeed silently.
    Ignore,
}

/// Language runtime required by a provision step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RuntimeSpec {
    /// Interpreter name (e.g. `python`).
    pub name: String,
    /// Version, usually `${{ matrix.version }}`.
    pub version: String,
}

/// Where the package under test comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PackageSource {
    /// Local source directory installed in editable mode.
    Editable(String),
    /// Published package name (optionally with a version specifier).
    Index(String),
}

/// Step action, selected by the `kind` field.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Copy the source tree into the cell workspace.
    Checkout {
        /// Top-level names to skip besides `.git`.
        #[serde(default)]
        exclude: Vec<String>,
    },

    /// Install OS packages and verify the language runtime.
    Provision {
        /// Packages for apt-based images.
        #[serde(default)]
        apt: Vec<String>,
        /// Packages for Homebrew-based images.
        #[serde(default)]
        brew: Vec<String>,
        /// Runtime to verify.
        #[serde(default)]
        runtime: Option<RuntimeSpec>,
    },

    /// Clone and build an external toolkit.
    ToolkitBuild {
        /// Upstream repository URL.
        repository: String,
        /// Fixed branch to build.
        branch: String,
        /// Subdirectory holding the build system.
        #[serde(default)]
        subdir: Option<String>,
        /// Extra `./configure` arguments.
        #[serde(default)]
        configure_args: Vec<String>,
        /// Linker flags tolerating duplicate definitions.
        #[serde(default = "default_linker_flags")]
        linker_flags: Vec<String>,
        /// Install prefix relative to the workspace.
        #[serde(default = "default_toolkit_prefix")]
        prefix: String,
        /// Command run after installation to check the toolkit works.
        #[serde(default)]
        smoke_check: Option<String>,
        /// Parallel make jobs.
        #[serde(default)]
        jobs: Option<u32>,
    },

    /// Install plotting libraries and the package under test.
    Install {
        /// Installer command prefix.
        #[serde(default = "default_installer")]
        installer: String,
        /// Auxiliary packages installed first.
        #[serde(default)]
        packages: Vec<String>,
        /// Package under test.
        #[serde(default)]
        source: Option<PackageSource>,
    },

    /// Restore a fixture archive, saved again after a successful job.
    Cache {
        /// Literal cache key.
        key: String,
        /// Key prefixes tried in order when the key is missing.
        #[serde(default)]
        restore_keys: Vec<String>,
        /// Workspace-relative paths stored in the archive.
        paths: Vec<String>,
    },

    /// Run a shell script.
    Run {
        /// Script body, run with `sh -e -c`.
        run: String,
        /// Phase used to classify failures.
        #[serde(default)]
        phase: StepPhase,
    },

    /// Collect produced files into a named artifact bundle.
    UploadArtifact {
        /// Bundle name; must vary per matrix cell.
        artifact: String,
        /// Workspace-relative directory searched for files.
        path: String,
        /// Glob relative to `path`.
        #[serde(default = "default_artifact_pattern")]
        pattern: String,
        /// Behaviour when nothing matches.
        #[serde(default)]
        if_no_files_found: NoFilesPolicy,
    },
}

fn default_linker_flags() -> Vec<String> {
    vec!["-z".to_string(), "muldefs".to_string()]
}

fn default_toolkit_prefix() -> String {
    "toolkit".to_string()
}

fn default_installer() -> String {
    "python${{ matrix.version }} -m pip install".to_string()
}

fn default_artifact_pattern() -> String {
    "*.png".to_string()
}

impl StepAction {
    /// Short name of the action kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Checkout { .. } => "checkout",
            Self::Provision { .. } => "provision",
            Self::ToolkitBuild { .. } => "toolkit_build",
            Self::Install { .. } => "install",
            Self::Cache { .. } => "cache",
            Self::Run { .. } => "run",
            Self::UploadArtifact { .. } => "upload_artifact",
        }
    }
}

/// Configuration for a single step.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepConfig {
    /// Step name (unique within the workflow).
    pub name: String,

    /// What the step does.
    #[serde(flatten)]
    pub action: StepAction,

    /// Working directory relative to the cell workspace.
    #[serde(default)]
    pub working_dir: Option<String>,

    /// Step environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Directories prepended to `PATH` for this and later steps.
    #[serde(default)]
    pub add_path: Vec<String>,

    /// Step timeout in seconds.
    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,

    /// Run condition. Defaults to `always` for artifact uploads.
    #[serde(default)]
    pub condition: Option<StepCondition>,

    /// Do not fail the job when this step fails.
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_step_timeout() -> u64 {
    3600 // 1 hour
}

impl StepConfig {
    /// Phase of this step.
    pub fn phase(&self) -> StepPhase {
        match &self.action {
            StepAction::Checkout { .. } | StepAction::Provision { .. } => StepPhase::Provision,
            StepAction::ToolkitBuild { .. } => StepPhase::Build,
            StepAction::Install { .. } => StepPhase::Install,
            StepAction::Cache { .. } => StepPhase::Cache,
            StepAction::Run { phase, .. } => *phase,
            StepAction::UploadArtifact { .. } => StepPhase::Archive,
        }
    }

    /// Run condition after applying the per-kind default.
    pub fn effective_condition(&self) -> StepCondition {
        match (self.condition, &self.action) {
            (Some(condition), _) => condition,
            (None, StepAction::UploadArtifact { .. }) => StepCondition::Always,
            (None, _) => StepCondition::Success,
        }
    }

    /// Every templated string the step carries.
    pub fn templates(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        out.extend(self.working_dir.as_deref());
        out.extend(self.env.values().map(String::as_str));
        out.extend(self.add_path.iter().map(String::as_str));
        match &self.action {
            StepAction::Checkout { exclude } => out.extend(exclude.iter().map(String::as_str)),
            StepAction::Provision { apt, brew, runtime } => {
                out.extend(apt.iter().chain(brew).map(String::as_str));
                if let Some(runtime) = runtime {
                    out.push(&runtime.name);
                    out.push(&runtime.version);
                }
            }
            StepAction::ToolkitBuild {
                repository,
                branch,
                subdir,
                configure_args,
                linker_flags,
                prefix,
                smoke_check,
                ..
            } => {
                out.push(repository);
                out.push(branch);
                out.extend(subdir.as_deref());
                out.extend(configure_args.iter().chain(linker_flags).map(String::as_str));
                out.push(prefix);
                out.extend(smoke_check.as_deref());
            }
            StepAction::Install {
                installer,
                packages,
                source,
            } => {
                out.push(installer);
                out.extend(packages.iter().map(String::as_str));
                match source {
                    Some(PackageSource::Editable(s)) | Some(PackageSource::Index(s)) => out.push(s),
                    None => {}
                }
            }
            StepAction::Cache {
                key,
                restore_keys,
                paths,
            } => {
                out.push(key);
                out.extend(restore_keys.iter().chain(paths).map(String::as_str));
            }
            StepAction::Run { run, .. } => out.push(run),
            StepAction::UploadArtifact {
                artifact, path, pattern, ..
            } => {
                out.push(artifact);
                out.push(path);
                out.push(pattern);
            }
        }
        out
    }

    /// Validate the step configuration.
    ///
    /// `cell_count` is the number of matrix cells the step will run in.
    pub fn validate(&self, cell_count: usize) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("Step name cannot be empty".to_string()));
        }

        if self.timeout_secs == 0 || self.timeout_secs > MAX_STEP_TIMEOUT_SECS {
            return Err(invalid(format!(
                "Step '{}' timeout must be between 1 and {} seconds",
                self.name, MAX_STEP_TIMEOUT_SECS
            )));
        }

        for template in self.templates() {
            validate_template(template)?;
        }

        if let Some(dir) = &self.working_dir {
            require_relative(&self.name, "working_dir", dir)?;
        }

        match &self.action {
            StepAction::Checkout { .. } => {}
            StepAction::Provision { apt, brew, runtime } => {
                if apt.is_empty() && brew.is_empty() && runtime.is_none() {
                    return Err(invalid(format!("Provision step '{}' has nothing to provision", self.name)));
                }
            }
            StepAction::ToolkitBuild {
                repository,
                branch,
                prefix,
                ..
            } => {
                if repository.trim().is_empty() || branch.trim().is_empty() {
                    return Err(invalid(format!("Toolkit step '{}' requires repository and branch", self.name)));
                }
                require_relative(&self.name, "prefix", prefix)?;
            }
            StepAction::Install { packages, source, .. } => {
                if packages.is_empty() && source.is_none() {
                    return Err(invalid(format!("Install step '{}' has nothing to install", self.name)));
                }
            }
            StepAction::Cache {
                key,
                restore_keys,
                paths,
            } => {
                if key.trim().is_empty() {
                    return Err(invalid(format!("Cache step '{}' requires a key", self.name)));
                }
                if restore_keys.len() > MAX_RESTORE_KEYS {
                    return Err(invalid(format!(
                        "Cache step '{}' has {} restore keys (max: {})",
                        self.name,
                        restore_keys.len(),
                        MAX_RESTORE_KEYS
                    )));
                }
                if restore_keys.iter().any(|k| k.trim().is_empty()) {
                    return Err(invalid(format!("Cache step '{}' has an empty restore key", self.name)));
                }
                if paths.is_empty() {
                    return Err(invalid(format!("Cache step '{}' requires at least one path", self.name)));
                }
                for path in paths {
                    require_relative(&self.name, "paths", path)?;
                }
            }
            StepAction::Run { run, .. } => {
                if run.trim().is_empty() {
                    return Err(invalid(format!("Run step '{}' requires a script", self.name)));
                }
            }
            StepAction::UploadArtifact { artifact, path, pattern, .. } => {
                if artifact.trim().is_empty() {
                    return Err(invalid(format!("Artifact step '{}' requires an artifact name", self.name)));
                }
                if cell_count > 1 && !references_matrix(artifact) {
                    return Err(invalid(format!(
                        "Artifact name '{}' in step '{}' must reference the matrix to stay unique per cell",
                        artifact, self.name
                    )));
                }
                require_relative(&self.name, "path", path)?;
                if pattern.trim().is_empty() {
                    return Err(invalid(format!("Artifact step '{}' requires a pattern", self.name)));
                }
            }
        }

        Ok(())
    }
}

/// Complete workflow configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowConfig {
    /// Workflow name.
    pub name: String,

    /// Workflow description.
    #[serde(default)]
    pub description: Option<String>,

    /// Trigger configuration.
    #[serde(default)]
    pub triggers: TriggerConfig,

    /// Declared permissions.
    #[serde(default)]
    pub permissions: Permissions,

    /// Job matrix.
    pub matrix: MatrixConfig,

    /// Global environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Whole-job timeout in minutes.
    #[serde(default = "default_job_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Ordered job steps.
    pub steps: Vec<StepConfig>,
}

fn default_job_timeout_minutes() -> u64 {
    360 // 6 hours
}

impl WorkflowConfig {
    /// Validate the complete workflow configuration.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("Workflow name cannot be empty".to_string()));
        }

        if self.triggers.events.is_empty() {
            return Err(invalid("Workflow must declare at least one trigger event".to_string()));
        }

        if self.timeout_minutes == 0 || self.timeout_minutes > MAX_JOB_TIMEOUT_MINUTES {
            return Err(invalid(format!("timeout_minutes must be between 1 and {}", MAX_JOB_TIMEOUT_MINUTES)));
        }

        let cell_count = self.matrix.expand()?.len();

        if self.steps.is_empty() {
            return Err(invalid("Workflow must have at least one step".to_string()));
        }

        if self.steps.len() > MAX_STEPS {
            return Err(invalid(format!("Workflow has {} steps (max: {})", self.steps.len(), MAX_STEPS)));
        }

        for value in self.env.values() {
            validate_template(value)?;
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(invalid(format!("Duplicate step name: {}", step.name)));
            }
            step.validate(cell_count)?;
        }

        Ok(())
    }

    /// Check whether an event on a branch starts the workflow.
    pub fn should_trigger(&self, event: TriggerEvent, branch: &str) -> bool {
        self.triggers.should_trigger(event, branch)
    }
}

fn invalid(reason: String) -> CiCoreError {
    CiCoreError::InvalidConfig { reason }
}

fn require_relative(step: &str, field: &str, value: &str) -> Result<()> {
    let path = Path::new(value);
    let escapes = path.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if value.trim().is_empty() || escapes {
        return Err(invalid(format!(
            "Step '{}' field '{}' must be a path inside the workspace, got '{}'",
            step, field, value
        )));
    }
    Ok(())
}
