//! Artifact collection.
//!
//! Files matching a glob under a workspace directory are copied into
//! `artifacts/<run_id>/<name>/`, keeping their path relative to the search
//! directory. Whether an empty match is a failure is decided by the caller.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;

use crate::error::BlockingTaskSnafu;
use crate::error::CiError;
use crate::error::CreateDirSnafu;
use crate::error::InvalidArtifactPatternSnafu;
use crate::error::Result;
use crate::error::StoreArtifactSnafu;

// Tiger Style: Bounded resource limits
/// Maximum files in one artifact bundle.
pub const MAX_ARTIFACT_FILES: usize = 10_000;

/// A stored artifact bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Bundle name.
    pub name: String,
    /// Directory holding the copied files.
    pub dir: PathBuf,
    /// Stored files, relative to `dir`.
    pub files: Vec<PathBuf>,
    /// Total bytes copied.
    pub size_bytes: u64,
}

impl ArtifactRecord {
    /// True if nothing matched.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Check that an artifact name can be used as a single directory name.
pub fn validate_artifact_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if bad {
        return Err(CiError::InvalidArtifactName { name: name.to_string() });
    }
    Ok(())
}

/// Collect files matching `pattern` under `source_dir` into `dest_root/<name>`.
///
/// A missing `source_dir` yields an empty record. The destination directory
/// is only created when at least one file matches.
pub async fn collect_artifact(source_dir: &Path, pattern: &str, dest_root: &Path, name: &str) -> Result<ArtifactRecord> {
    validate_artifact_name(name)?;
    let source_dir = source_dir.to_path_buf();
    let dest = dest_root.join(name);
    let pattern = pattern.to_string();
    let name = name.to_string();

    tokio::task::spawn_blocking(move || collect_blocking(&source_dir, &pattern, &dest, name))
        .await
        .context(BlockingTaskSnafu)?
}

fn collect_blocking(source_dir: &Path, pattern: &str, dest: &Path, name: String) -> Result<ArtifactRecord> {
    let mut record = ArtifactRecord {
        name,
        dir: dest.to_path_buf(),
        files: Vec::new(),
        size_bytes: 0,
    };
    if !source_dir.is_dir() {
        debug!(dir = %source_dir.display(), "artifact directory does not exist");
        return Ok(record);
    }

    let full_pattern = format!("{}/{}", glob::Pattern::escape(&source_dir.display().to_string()), pattern);
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    let paths = glob::glob_with(&full_pattern, options).context(InvalidArtifactPatternSnafu { pattern })?;

    for entry in paths {
        let path = match entry {
            Ok(path) => path,
            Err(e) => {
                debug!(error = %e, "skipping unreadable artifact candidate");
                continue;
            }
        };
        if !path.is_file() {
            continue;
        }
        if record.files.len() >= MAX_ARTIFACT_FILES {
            return Err(CiError::StoreArtifact {
                path,
                source: std::io::Error::other(format!("artifact exceeds {MAX_ARTIFACT_FILES} files")),
            });
        }
        let Ok(relative) = path.strip_prefix(source_dir).map(Path::to_path_buf) else {
            continue;
        };

        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu { path: parent })?;
        }
        let copied = std::fs::copy(&path, &target).context(StoreArtifactSnafu { path: &path })?;
        debug!(file = %relative.display(), bytes = copied, "stored artifact file");
        record.size_bytes = record.size_bytes.saturating_add(copied);
        record.files.push(relative);
    }

    record.files.sort();
    if !record.files.is_empty() {
        info!(
            artifact = %record.name,
            files = record.files.len(),
            bytes = record.size_bytes,
            "artifact stored"
        );
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_artifact_name() {
        assert!(validate_artifact_name("golden-ubuntu-22.04-3.11").is_ok());
        assert!(validate_artifact_name("").is_err());
        assert!(validate_artifact_name("..").is_err());
        assert!(validate_artifact_name("a/b").is_err());
    }

    #[tokio::test]
    async fn test_collects_only_matching_files() {
        let ws = tempfile::tempdir().unwrap();
        let tests = ws.path().join("tests");
        std::fs::create_dir_all(tests.join("nested")).unwrap();
        std::fs::write(tests.join("phase.png"), b"png").unwrap();
        std::fs::write(tests.join("topo.png"), b"png2").unwrap();
        std::fs::write(tests.join("log.txt"), b"txt").unwrap();
        std::fs::write(tests.join("nested/deep.png"), b"deep").unwrap();

        let out = tempfile::tempdir().unwrap();
        let record = collect_artifact(&tests, "*.png", out.path(), "golden").await.unwrap();

        assert_eq!(record.files, vec![PathBuf::from("phase.png"), PathBuf::from("topo.png")]);
        assert_eq!(record.size_bytes, 7);
        assert!(out.path().join("golden/phase.png").exists());
        assert!(!out.path().join("golden/log.txt").exists());
    }

    #[tokio::test]
    async fn test_recursive_pattern_keeps_relative_paths() {
        let ws = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(ws.path().join("a/b")).unwrap();
        std::fs::write(ws.path().join("a/b/c.png"), b"x").unwrap();

        let out = tempfile::tempdir().unwrap();
        let record = collect_artifact(ws.path(), "**/*.png", out.path(), "all").await.unwrap();
        assert_eq!(record.files, vec![PathBuf::from("a/b/c.png")]);
        assert!(out.path().join("all/a/b/c.png").exists());
    }

    #[tokio::test]
    async fn test_no_matches_is_empty_record() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();

        let record = collect_artifact(&ws.path().join("missing"), "*.png", out.path(), "none").await.unwrap();
        assert!(record.is_empty());
        assert!(!out.path().join("none").exists());

        let record = collect_artifact(ws.path(), "*.png", out.path(), "none").await.unwrap();
        assert!(record.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_pattern() {
        let ws = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        let err = collect_artifact(ws.path(), "[", out.path(), "bad").await.unwrap_err();
        assert!(matches!(err, CiError::InvalidArtifactPattern { .. }));
    }
}
