//! tessera - run matrix CI workflows on the local machine.
//!
//! Loads a TOML workflow, expands its OS × version matrix and runs every
//! selected cell, printing a summary of the run record.
//!
//! # Usage
//!
//! ```bash
//! # Run every cell of a workflow
//! tessera run .tessera/workflow.toml
//!
//! # Run one cell as if a push to main happened
//! tessera run .tessera/workflow.toml --event push --branch main --os ubuntu-22.04 --version 3.11
//!
//! # Inspect the expanded matrix
//! tessera matrix .tessera/workflow.toml
//!
//! # JSON output for scripting
//! tessera --json runs list | jq '.[0].status'
//!
//! # Using environment variables
//! export TESSERA_STATE_DIR=/var/lib/tessera
//! tessera cache list
//! ```
//!
//! # Tiger Style
//!
//! - Explicit error handling with anyhow
//! - Non-zero exit when any cell fails
//! - Ctrl-C cancels running cells and still writes the run record

mod cli;
mod commands;
mod output;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::Cli;

/// Initialize tracing subscriber with environment-based filtering.
///
/// - `quiet`: Suppress all logging output (for scripting)
/// - `verbose`: Enable debug-level logging
fn init_tracing(quiet: bool, verbose: bool) {
    let filter = if quiet {
        EnvFilter::new("off")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.global.is_quiet, cli.global.is_verbose);

    if !cli.global.is_quiet && !cli.global.is_json {
        eprintln!("tessera v{}", env!("CARGO_PKG_VERSION"));
    }

    cli.run().await
}
