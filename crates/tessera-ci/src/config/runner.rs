//! Runner configuration.
//!
//! Settings that belong to the machine running workflows rather than to a
//! workflow: where state lives, how many cells run at once, which host
//! variables leak into steps. Loaded from an optional TOML file, then
//! overridden by `TESSERA_*` environment variables.

use std::path::Path;
use std::path::PathBuf;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tessera_ci_core::config::MatrixConfig;
use tracing::debug;

use super::loader::read_config_file;
use crate::error::CiError;
use crate::error::ParseConfigSnafu;
use crate::error::Result;

/// Environment variable overriding [`RunnerConfig::state_dir`].
pub const ENV_STATE_DIR: &str = "TESSERA_STATE_DIR";
/// Environment variable overriding [`RunnerConfig::max_parallel`].
pub const ENV_MAX_PARALLEL: &str = "TESSERA_MAX_PARALLEL";
/// Environment variable overriding [`RunnerConfig::keep_workspaces`].
pub const ENV_KEEP_WORKSPACES: &str = "TESSERA_KEEP_WORKSPACES";
/// Environment variable overriding [`RunnerConfig::passthrough_env`] (comma separated).
pub const ENV_PASSTHROUGH: &str = "TESSERA_PASSTHROUGH_ENV";
/// Environment variable overriding [`RunnerConfig::base_path`].
pub const ENV_BASE_PATH: &str = "TESSERA_BASE_PATH";

/// Maximum concurrent cells regardless of configuration.
pub const MAX_PARALLEL_CELLS: usize = 64;

/// Runner settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunnerConfig {
    /// Root for workspaces, cache, artifacts, logs and run records.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Concurrent cells when the workflow does not set `max_parallel`.
    /// Defaults to the number of CPUs.
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Keep cell workspaces after the run for debugging.
    #[serde(default)]
    pub keep_workspaces: bool,

    /// Host variables copied into every step environment.
    #[serde(default = "default_passthrough_env")]
    pub passthrough_env: Vec<String>,

    /// Base search path for steps. Defaults to the host `PATH`.
    #[serde(default)]
    pub base_path: Option<String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".tessera")
}

fn default_passthrough_env() -> Vec<String> {
    ["HOME", "USER", "LANG", "LC_ALL", "TERM", "TMPDIR"].iter().map(|s| s.to_string()).collect()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_parallel: None,
            keep_workspaces: false,
            passthrough_env: default_passthrough_env(),
            base_path: None,
        }
    }
}

impl RunnerConfig {
    /// Load from an optional TOML file and apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = read_config_file(path)?;
                toml::from_str(&content).context(ParseConfigSnafu {
                    source_name: path.display().to_string(),
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(std::env::vars())?;
        config.validate()?;
        debug!(state_dir = %config.state_dir.display(), max_parallel = ?config.max_parallel, "runner config loaded");
        Ok(config)
    }

    /// Apply `TESSERA_*` overrides from a set of variables.
    pub fn apply_env_overrides<I>(&mut self, vars: I) -> Result<()>
    where I: IntoIterator<Item = (String, String)> {
        for (key, value) in vars {
            match key.as_str() {
                ENV_STATE_DIR => self.state_dir = PathBuf::from(value),
                ENV_MAX_PARALLEL => {
                    let parsed = value.parse::<usize>().map_err(|e| CiError::InvalidRunnerConfig {
                        reason: format!("{ENV_MAX_PARALLEL}='{value}': {e}"),
                    })?;
                    self.max_parallel = Some(parsed);
                }
                ENV_KEEP_WORKSPACES => self.keep_workspaces = parse_bool(ENV_KEEP_WORKSPACES, &value)?,
                ENV_PASSTHROUGH => {
                    self.passthrough_env =
                        value.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from).collect();
                }
                ENV_BASE_PATH => self.base_path = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(CiError::InvalidRunnerConfig {
                reason: "state_dir cannot be empty".to_string(),
            });
        }
        if let Some(n) = self.max_parallel
            && (n == 0 || n > MAX_PARALLEL_CELLS)
        {
            return Err(CiError::InvalidRunnerConfig {
                reason: format!("max_parallel must be between 1 and {MAX_PARALLEL_CELLS}, got {n}"),
            });
        }
        Ok(())
    }

    /// Make `state_dir` absolute relative to the current directory.
    pub fn resolve(mut self) -> Result<Self> {
        self.state_dir = std::path::absolute(&self.state_dir).map_err(|e| CiError::InvalidRunnerConfig {
            reason: format!("cannot resolve state_dir {}: {e}", self.state_dir.display()),
        })?;
        Ok(self)
    }

    /// Parallelism when the workflow sets no limit.
    pub fn default_parallelism(&self) -> usize {
        self.max_parallel
            .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1))
            .clamp(1, MAX_PARALLEL_CELLS)
    }

    /// Parallelism for a run of `cell_count` cells.
    ///
    /// The workflow's `max_parallel` wins; otherwise the runner default
    /// applies.
    pub fn cell_parallelism(&self, matrix: &MatrixConfig, cell_count: usize) -> usize {
        match matrix.max_parallel {
            Some(_) => matrix.parallelism(cell_count),
            None => self.default_parallelism().min(cell_count.max(1)),
        }
    }

    /// Search path that step additions are prepended to.
    pub fn effective_base_path(&self) -> String {
        self.base_path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| tessera_ci_executor_shell::DEFAULT_PATH.to_string())
    }

    /// Per-cell workspaces.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.state_dir.join("workspaces")
    }

    /// Fixture cache root.
    pub fn cache_dir(&self) -> PathBuf {
        self.state_dir.join("cache")
    }

    /// Uploaded artifact bundles.
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir.join("artifacts")
    }

    /// Step logs.
    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    /// Run records.
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(CiError::InvalidRunnerConfig {
            reason: format!("{key}='{value}' is not a boolean"),
        }),
    }
}
