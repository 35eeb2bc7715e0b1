//! Per-cell workspaces and source checkout.
//!
//! Each matrix cell gets a fresh directory under the runner's workspace
//! root. A `checkout` step copies the local source tree into it.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;

use snafu::ResultExt;
use tokio::fs;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::error::CheckoutLimitExceededSnafu;
use crate::error::CheckoutSnafu;
use crate::error::CleanupWorkspaceSnafu;
use crate::error::CreateDirSnafu;
use crate::error::Result;

// Tiger Style: Bounded resource limits
/// Maximum total checkout size (2 GB).
const MAX_CHECKOUT_SIZE_BYTES: u64 = 2 * 1024 * 1024 * 1024;
/// Maximum number of files in checkout.
const MAX_CHECKOUT_FILES: u32 = 100_000;
/// Maximum directory recursion depth.
const MAX_TREE_DEPTH: u32 = 64;

/// Ephemeral directory a cell runs in.
#[derive(Debug, Clone)]
pub struct CellWorkspace {
    root: PathBuf,
}

impl CellWorkspace {
    /// Create an empty workspace at `root`, removing leftovers from a
    /// previous run with the same path.
    pub async fn create(root: PathBuf) -> Result<Self> {
        if fs::try_exists(&root).await.unwrap_or(false) {
            warn!(path = %root.display(), "removing stale workspace");
            fs::remove_dir_all(&root).await.context(CleanupWorkspaceSnafu { path: &root })?;
        }
        fs::create_dir_all(&root).await.context(CreateDirSnafu { path: &root })?;
        debug!(path = %root.display(), "workspace created");
        Ok(Self { root })
    }

    /// Workspace root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a workspace-relative path.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        if relative.is_empty() || relative == "." {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    /// Delete the workspace.
    pub async fn cleanup(self) -> Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                debug!(path = %self.root.display(), "workspace removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(CleanupWorkspaceSnafu { path: self.root }),
        }
    }
}

/// Statistics tracked during checkout.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutStats {
    /// Files copied.
    pub files_written: u32,
    /// Bytes copied.
    pub bytes_written: u64,
    /// Symlinks not copied.
    pub symlinks_skipped: u32,
}

/// Copy `source` into `target`.
///
/// `.git`, any top-level entry named in `exclude`, and anything at
/// `skip_path` (the runner state directory when it lives inside the
/// sources) are left out. Symlinks are skipped with a warning.
pub async fn checkout_sources(
    source: &Path,
    target: &Path,
    exclude: &[String],
    skip_path: Option<&Path>,
) -> Result<CheckoutStats> {
    info!(source = %source.display(), target = %target.display(), "checking out sources");

    fs::create_dir_all(target).await.context(CreateDirSnafu { path: target })?;

    let mut top_level: HashSet<OsString> = exclude.iter().map(OsString::from).collect();
    top_level.insert(OsString::from(".git"));
    let skip_path = match skip_path {
        Some(path) => fs::canonicalize(path).await.ok(),
        None => None,
    };

    let mut stats = CheckoutStats::default();
    let filter = CheckoutFilter {
        top_level: &top_level,
        skip_path: skip_path.as_deref(),
        target,
    };
    copy_tree(source, target, &filter, &mut stats, 0).await?;

    if stats.symlinks_skipped > 0 {
        info!(
            files = stats.files_written,
            bytes = stats.bytes_written,
            symlinks_skipped = stats.symlinks_skipped,
            "checkout complete (some symlinks were skipped)"
        );
    } else {
        info!(files = stats.files_written, bytes = stats.bytes_written, "checkout complete");
    }
    Ok(stats)
}

struct CheckoutFilter<'a> {
    top_level: &'a HashSet<OsString>,
    skip_path: Option<&'a Path>,
    target: &'a Path,
}

async fn copy_tree(
    dir: &Path,
    dest: &Path,
    filter: &CheckoutFilter<'_>,
    stats: &mut CheckoutStats,
    depth: u32,
) -> Result<()> {
    // Tiger Style: Bounded recursion
    if depth > MAX_TREE_DEPTH {
        return CheckoutLimitExceededSnafu {
            reason: format!("directory depth exceeds limit of {MAX_TREE_DEPTH}"),
        }
        .fail();
    }

    let mut entries = fs::read_dir(dir).await.context(CheckoutSnafu { path: dir })?;
    while let Some(entry) = entries.next_entry().await.context(CheckoutSnafu { path: dir })? {
        let name = entry.file_name();
        if depth == 0 && filter.top_level.contains(&name) {
            continue;
        }

        let path = entry.path();
        if filter.target == path || filter.skip_path.is_some_and(|skip| fs_same(&path, skip)) {
            debug!(path = %path.display(), "skipping runner directory");
            continue;
        }

        let file_type = entry.file_type().await.context(CheckoutSnafu { path: &path })?;
        let dest_path = dest.join(&name);

        if file_type.is_symlink() {
            warn!(path = %path.display(), "skipping symlink in checkout");
            stats.symlinks_skipped += 1;
        } else if file_type.is_dir() {
            fs::create_dir_all(&dest_path).await.context(CreateDirSnafu { path: &dest_path })?;
            Box::pin(copy_tree(&path, &dest_path, filter, stats, depth + 1)).await?;
        } else if file_type.is_file() {
            // Tiger Style: Check limits before writing
            if stats.files_written >= MAX_CHECKOUT_FILES {
                return CheckoutLimitExceededSnafu {
                    reason: format!("checkout exceeds maximum file count of {MAX_CHECKOUT_FILES}"),
                }
                .fail();
            }
            let copied = fs::copy(&path, &dest_path).await.context(CheckoutSnafu { path: &path })?;
            let new_total = stats.bytes_written.saturating_add(copied);
            if new_total > MAX_CHECKOUT_SIZE_BYTES {
                return CheckoutLimitExceededSnafu {
                    reason: format!("checkout exceeds maximum size of {MAX_CHECKOUT_SIZE_BYTES} bytes"),
                }
                .fail();
            }
            stats.files_written += 1;
            stats.bytes_written = new_total;
        }
    }
    Ok(())
}

fn fs_same(path: &Path, canonical: &Path) -> bool {
    std::fs::canonicalize(path).is_ok_and(|p| p == canonical)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_checkout_skips_git_and_state_dir() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src.path().join(".git/objects")).unwrap();
        std::fs::create_dir_all(src.path().join(".tessera/cache")).unwrap();
        std::fs::create_dir_all(src.path().join("tests")).unwrap();
        std::fs::write(src.path().join("tests/goldenvalley.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(src.path().join("setup.py"), "").unwrap();
        std::fs::write(src.path().join("notes.tmp"), "").unwrap();

        let dst = tempfile::tempdir().unwrap();
        let stats = checkout_sources(
            src.path(),
            dst.path(),
            &["notes.tmp".to_string()],
            Some(&src.path().join(".tessera")),
        )
        .await
        .unwrap();

        assert_eq!(stats.files_written, 2);
        assert!(dst.path().join("tests/goldenvalley.sh").exists());
        assert!(dst.path().join("setup.py").exists());
        assert!(!dst.path().join(".git").exists());
        assert!(!dst.path().join(".tessera").exists());
        assert!(!dst.path().join("notes.tmp").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_checkout_preserves_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let src = tempfile::tempdir().unwrap();
        let script = src.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let dst = tempfile::tempdir().unwrap();
        checkout_sources(src.path(), dst.path(), &[], None).await.unwrap();
        let mode = std::fs::metadata(dst.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[tokio::test]
    async fn test_workspace_lifecycle() {
        let base = tempfile::tempdir().unwrap();
        let root = base.path().join("run/cell");
        let ws = CellWorkspace::create(root.clone()).await.unwrap();
        std::fs::write(root.join("leftover"), "x").unwrap();

        let ws_again = CellWorkspace::create(root.clone()).await.unwrap();
        assert!(!root.join("leftover").exists());
        assert_eq!(ws.resolve("tests"), root.join("tests"));
        assert_eq!(ws.resolve("."), root);

        ws_again.cleanup().await.unwrap();
        assert!(!root.exists());
        ws.cleanup().await.unwrap();
    }
}
