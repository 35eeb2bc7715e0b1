//! CLI argument parsing and command dispatch.
//!
//! Uses clap derive macros for declarative argument definition with
//! support for environment variables and global options.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use tessera_ci::RunnerConfig;

use crate::commands::cache::CacheCommand;
use crate::commands::run::RunArgs;
use crate::commands::runs::RunsCommand;
use crate::commands::workflow;
use crate::commands::workflow::MatrixArgs;
use crate::commands::workflow::ValidateArgs;

/// Command-line interface for the tessera workflow runner.
#[derive(Parser)]
#[command(name = "tessera")]
#[command(version)]
#[command(about = "Run matrix CI workflows on the local machine")]
#[command(long_about = "Expands a workflow's OS × version matrix and runs every cell as an isolated job \
    with its own workspace, fixture cache and artifact bundle.")]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

/// Global options available to all commands.
#[derive(Args, Clone)]
pub struct GlobalOptions {
    /// Runner configuration file (TOML).
    ///
    /// Can also be set via TESSERA_CONFIG environment variable.
    #[arg(long, env = "TESSERA_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// State directory for workspaces, cache, artifacts, logs and run records.
    ///
    /// Overrides the config file and TESSERA_STATE_DIR.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Output JSON instead of human-readable format.
    #[arg(long = "json", global = true)]
    pub is_json: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose", global = true)]
    pub is_verbose: bool,

    /// Suppress all logging output (warnings, debug messages).
    ///
    /// Useful for scripting and when parsing JSON output.
    #[arg(short = 'q', long = "quiet", global = true)]
    pub is_quiet: bool,
}

impl GlobalOptions {
    /// Load the runner configuration and apply command-line overrides.
    fn runner_config(&self) -> Result<RunnerConfig> {
        let mut config = RunnerConfig::load(self.config.as_deref()).context("failed to load runner config")?;
        if let Some(dir) = &self.state_dir {
            config.state_dir = dir.clone();
        }
        config.resolve().context("invalid state directory")
    }
}

/// Top-level commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a workflow.
    ///
    /// Every selected matrix cell runs in its own workspace. Exits non-zero
    /// when any cell fails.
    Run(RunArgs),

    /// Show the cells a workflow expands to.
    Matrix(MatrixArgs),

    /// Check a workflow file without running it.
    Validate(ValidateArgs),

    /// Print the JSON schema of the workflow file.
    Schema,

    /// Fixture cache operations.
    #[command(subcommand)]
    Cache(CacheCommand),

    /// Recorded runs.
    #[command(subcommand)]
    Runs(RunsCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn run(self) -> Result<()> {
        let json = self.global.is_json;

        // Commands that need no runner state
        match self.command {
            Commands::Schema => return workflow::schema(),
            Commands::Validate(args) => return workflow::validate(args, json),
            _ => {}
        }

        let config = self.global.runner_config()?;
        match self.command {
            Commands::Run(args) => args.run(config, json).await,
            Commands::Matrix(args) => workflow::matrix(args, &config, json),
            Commands::Cache(cmd) => cmd.run(&config, json).await,
            Commands::Runs(cmd) => cmd.run(&config, json).await,
            Commands::Schema | Commands::Validate(_) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_selection() {
        let cli = Cli::try_parse_from([
            "tessera",
            "--json",
            "run",
            "ci.toml",
            "--event",
            "pull_request",
            "--branch",
            "refs/heads/main",
            "--os",
            "ubuntu-22.04",
            "--version",
            "3.11",
            "--version",
            "3.12",
        ])
        .unwrap();
        assert!(cli.global.is_json);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.selection.os, vec!["ubuntu-22.04"]);
        assert_eq!(args.selection.version, vec!["3.11", "3.12"]);
        assert_eq!(args.branch, "refs/heads/main");
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["tessera", "cache", "list", "--state-dir", "/tmp/t", "-q"]).unwrap();
        assert!(cli.global.is_quiet);
        assert_eq!(cli.global.state_dir, Some(PathBuf::from("/tmp/t")));
    }
}
