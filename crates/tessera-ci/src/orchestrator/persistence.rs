//! Run record storage.
//!
//! Each run is one JSON file, `runs/<run_id>.json`, replaced atomically on
//! every save.

use std::path::Path;
use std::path::PathBuf;

use snafu::ResultExt;
use tokio::fs;
use tracing::debug;
use tracing::warn;

use super::run::WorkflowRun;
use crate::error::CiError;
use crate::error::CreateDirSnafu;
use crate::error::ParseRunSnafu;
use crate::error::ReadRunSnafu;
use crate::error::Result;
use crate::error::SerializeRunSnafu;
use crate::error::WriteRunSnafu;

/// Maximum runs returned by [`RunStore::list`].
pub const MAX_LIST_RUNS: usize = 500;

/// Directory of run records.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// Store records under `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Write a run record.
    pub async fn save(&self, run: &WorkflowRun) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).await.context(CreateDirSnafu { path: &self.dir })?;
        let json = serde_json::to_vec_pretty(run).context(SerializeRunSnafu)?;

        let path = self.record_path(&run.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", run.id));
        fs::write(&tmp, &json).await.context(WriteRunSnafu { path: &tmp })?;
        fs::rename(&tmp, &path).await.context(WriteRunSnafu { path: &path })?;
        debug!(run_id = %run.id, status = %run.status, "run record saved");
        Ok(path)
    }

    /// Load a run record.
    pub async fn load(&self, run_id: &str) -> Result<WorkflowRun> {
        if run_id.is_empty() || run_id.contains(['/', '\\']) || run_id.starts_with('.') {
            return Err(CiError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        let path = self.record_path(run_id);
        read_record(&path).await?.ok_or_else(|| CiError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// List run records, newest first.
    ///
    /// Unreadable records are skipped with a warning.
    pub async fn list(&self) -> Result<Vec<WorkflowRun>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(ReadRunSnafu { path: &self.dir }),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await.context(ReadRunSnafu { path: &self.dir })? {
            let path = entry.path();
            let is_record = path.extension().is_some_and(|e| e == "json")
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_record {
                continue;
            }
            match read_record(&path).await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable run record"),
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(MAX_LIST_RUNS);
        Ok(runs)
    }
}

async fn read_record(path: &Path) -> Result<Option<WorkflowRun>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context(ReadRunSnafu { path }),
    };
    let run = serde_json::from_slice(&bytes).context(ParseRunSnafu { path })?;
    Ok(Some(run))
}
