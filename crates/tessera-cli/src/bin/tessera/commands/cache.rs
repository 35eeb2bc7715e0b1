//! Fixture cache commands.
//!
//! Operate on the filesystem cache under the state directory, the same
//! store `cache` steps restore from and save to.

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use clap::Subcommand;
use tessera_cache::CacheStore;
use tessera_cache::FsCacheStore;
use tessera_ci::RunnerConfig;

use crate::output::CacheEntryOutput;
use crate::output::CacheListOutput;
use crate::output::print_output;
use crate::output::print_success;

/// Fixture cache operations.
#[derive(Subcommand)]
pub enum CacheCommand {
    /// List cache entries.
    List(ListArgs),

    /// Show one entry by its literal key.
    Show(KeyArgs),

    /// Remove one entry by its literal key.
    Remove(KeyArgs),
}

#[derive(Args)]
pub struct ListArgs {
    /// Only show keys starting with this prefix.
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Args)]
pub struct KeyArgs {
    /// Cache key.
    pub key: String,
}

impl CacheCommand {
    /// Execute the cache command.
    pub async fn run(self, config: &RunnerConfig, json: bool) -> Result<()> {
        let store = FsCacheStore::new(config.cache_dir());
        match self {
            CacheCommand::List(args) => cache_list(&store, args, json).await,
            CacheCommand::Show(args) => cache_show(&store, args, json).await,
            CacheCommand::Remove(args) => cache_remove(&store, args, json).await,
        }
    }
}

async fn cache_list(store: &FsCacheStore, args: ListArgs, json: bool) -> Result<()> {
    let mut entries = store.list().await.context("failed to list cache entries")?;
    if let Some(prefix) = &args.prefix {
        entries.retain(|e| e.key.starts_with(prefix.as_str()));
    }
    print_output(&CacheListOutput { entries }, json);
    Ok(())
}

async fn cache_show(store: &FsCacheStore, args: KeyArgs, json: bool) -> Result<()> {
    match store.get(&args.key).await.context("failed to read cache entry")? {
        Some(entry) => {
            print_output(&CacheEntryOutput { entry }, json);
            Ok(())
        }
        None => anyhow::bail!("no cache entry for key '{}'", args.key),
    }
}

async fn cache_remove(store: &FsCacheStore, args: KeyArgs, json: bool) -> Result<()> {
    if store.remove(&args.key).await.context("failed to remove cache entry")? {
        print_success(&format!("Removed cache entry '{}'", args.key), json);
        Ok(())
    } else {
        anyhow::bail!("no cache entry for key '{}'", args.key)
    }
}
