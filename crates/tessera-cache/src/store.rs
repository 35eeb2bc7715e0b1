//! Filesystem cache store.
//!
//! Layout under the cache root:
//!
//! ```text
//! <root>/<blake3(key)>/meta.json
//! <root>/<blake3(key)>/archive-<uuid>.tar.gz
//! ```
//!
//! A save writes a fresh archive under a unique name and then atomically
//! renames a new `meta.json` into place, so concurrent saves of the same key
//! are last-write-wins and readers never see a half-written archive.

use std::io;
use std::path::Component;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::Utc;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use snafu::ResultExt;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::entry::CacheEntry;
use crate::entry::KeyMatch;
use crate::entry::RestoreOutcome;
use crate::entry::key_digest;
use crate::entry::select_entry;
use crate::entry::validate_key;
use crate::error::BlockingTaskSnafu;
use crate::error::CacheError;
use crate::error::CreateArchiveSnafu;
use crate::error::CreateDirSnafu;
use crate::error::ExtractArchiveSnafu;
use crate::error::ListEntriesSnafu;
use crate::error::NoPathsFoundSnafu;
use crate::error::ParseMetaSnafu;
use crate::error::ReadMetaSnafu;
use crate::error::RemoveEntrySnafu;
use crate::error::Result;
use crate::error::SerializeMetaSnafu;
use crate::error::WriteMetaSnafu;

/// Metadata file name inside an entry directory.
pub const META_FILE: &str = "meta.json";

/// Maximum metadata file size (64 KB).
pub const MAX_META_SIZE: u64 = 64 * 1024;

/// Maximum paths stored per entry.
pub const MAX_CACHE_PATHS: usize = 64;

/// Superseded archives younger than this are kept, since a concurrent save
/// may still be about to publish them.
pub const STALE_ARCHIVE_AGE: Duration = Duration::from_secs(10 * 60);

/// Storage backend for fixture archives.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Restore the best entry for `key` into `dest`.
    ///
    /// Misses, and entries that turn out to be missing or corrupt, return
    /// [`RestoreOutcome::Miss`]; only runner-side I/O failures are errors.
    async fn restore(&self, key: &str, restore_keys: &[String], dest: &Path) -> Result<RestoreOutcome>;

    /// Archive `paths` (relative to `root`) under `key`.
    async fn save(&self, key: &str, root: &Path, paths: &[String]) -> Result<CacheEntry>;

    /// Look up the entry stored under the literal key.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// List all entries, sorted by key.
    async fn list(&self) -> Result<Vec<CacheEntry>>;

    /// Remove the entry stored under `key`. Returns false if absent.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// Cache store backed by a local directory.
#[derive(Debug, Clone)]
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`. The directory is created lazily.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, key: &str) -> PathBuf {
        self.root.join(key_digest(key))
    }

    async fn read_meta(&self, dir: &Path) -> Result<Option<CacheEntry>> {
        let path = dir.join(META_FILE);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(ReadMetaSnafu { path }),
        };
        if metadata.len() > MAX_META_SIZE {
            warn!(path = %path.display(), size = metadata.len(), "cache metadata too large, ignoring");
            return Ok(None);
        }
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context(ReadMetaSnafu { path }),
        };
        let entry = serde_json::from_slice(&bytes).context(ParseMetaSnafu { path })?;
        Ok(Some(entry))
    }

    async fn candidates(&self, key: &str, restore_keys: &[String]) -> Result<Vec<CacheEntry>> {
        if !restore_keys.is_empty() {
            return self.list().await;
        }
        match self.get(key).await {
            Ok(entry) => Ok(entry.into_iter().collect()),
            Err(e @ CacheError::ParseMeta { .. }) => {
                warn!(key = %key, error = %e, "cache metadata corrupted, treating as miss");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn restore(&self, key: &str, restore_keys: &[String], dest: &Path) -> Result<RestoreOutcome> {
        validate_key(key)?;

        let entries = self.candidates(key, restore_keys).await?;
        let Some((entry, how)) = select_entry(key, restore_keys, &entries) else {
            info!(key = %key, "cache miss");
            return Ok(RestoreOutcome::Miss);
        };

        let archive_path = self.entry_dir(&entry.key).join(&entry.archive);
        let digest = match tokio::task::spawn_blocking({
            let path = archive_path.clone();
            move || file_digest(&path)
        })
        .await
        .context(BlockingTaskSnafu)?
        {
            Ok((digest, _)) => digest,
            Err(e) => {
                warn!(key = %entry.key, archive = %archive_path.display(), error = %e, "cache archive unreadable, treating as miss");
                return Ok(RestoreOutcome::Miss);
            }
        };

        if digest != entry.digest {
            warn!(
                key = %entry.key,
                expected = %entry.digest,
                actual = %digest,
                "cache archive digest mismatch, treating as miss"
            );
            return Ok(RestoreOutcome::Miss);
        }

        tokio::fs::create_dir_all(dest).await.context(CreateDirSnafu { path: dest })?;
        let dest_owned = dest.to_path_buf();
        let path_owned = archive_path.clone();
        tokio::task::spawn_blocking(move || extract_archive(&path_owned, &dest_owned))
            .await
            .context(BlockingTaskSnafu)??;

        let outcome = match how {
            KeyMatch::Exact => RestoreOutcome::ExactHit {
                key: entry.key.clone(),
                digest,
            },
            KeyMatch::Prefix(prefix) => RestoreOutcome::PrefixHit {
                key: entry.key.clone(),
                restore_key: prefix.to_string(),
                digest,
            },
        };
        info!(key = %key, restored = %entry.key, exact = outcome.is_exact_hit(), "cache restored");
        Ok(outcome)
    }

    async fn save(&self, key: &str, root: &Path, paths: &[String]) -> Result<CacheEntry> {
        validate_key(key)?;
        for path in paths {
            check_relative(path)?;
        }
        if paths.len() > MAX_CACHE_PATHS {
            return Err(CacheError::InvalidPath {
                path: format!("{} paths (max: {MAX_CACHE_PATHS})", paths.len()),
            });
        }

        let dir = self.entry_dir(key);
        tokio::fs::create_dir_all(&dir).await.context(CreateDirSnafu { path: &dir })?;

        let archive = format!("archive-{}.tar.gz", uuid::Uuid::new_v4());
        let archive_path = dir.join(&archive);
        let (digest, size_bytes, stored) = tokio::task::spawn_blocking({
            let root = root.to_path_buf();
            let paths = paths.to_vec();
            let archive_path = archive_path.clone();
            let key = key.to_string();
            move || write_archive(&key, &root, &paths, &archive_path)
        })
        .await
        .context(BlockingTaskSnafu)??;

        let entry = CacheEntry {
            key: key.to_string(),
            archive,
            digest,
            size_bytes,
            created_at: Utc::now(),
            paths: stored,
        };

        let json = serde_json::to_vec_pretty(&entry).context(SerializeMetaSnafu)?;
        let tmp_path = dir.join(format!("{META_FILE}.{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp_path, &json).await.context(WriteMetaSnafu { path: &tmp_path })?;
        let meta_path = dir.join(META_FILE);
        tokio::fs::rename(&tmp_path, &meta_path).await.context(WriteMetaSnafu { path: &meta_path })?;

        remove_stale_archives(&dir, &entry.archive).await;

        info!(key = %key, digest = %entry.digest, size_bytes = entry.size_bytes, "cache saved");
        Ok(entry)
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        validate_key(key)?;
        let entry = self.read_meta(&self.entry_dir(key)).await?;
        Ok(entry.filter(|e| e.key == key))
    }

    async fn list(&self) -> Result<Vec<CacheEntry>> {
        let mut reader = match tokio::fs::read_dir(&self.root).await {
            Ok(r) => r,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context(ListEntriesSnafu { path: &self.root }),
        };

        let mut entries = Vec::new();
        while let Some(dirent) = reader.next_entry().await.context(ListEntriesSnafu { path: &self.root })? {
            if !dirent.file_type().await.is_ok_and(|t| t.is_dir()) {
                continue;
            }
            let path = dirent.path();
            match self.read_meta(&path).await {
                Ok(Some(entry)) => entries.push(entry),
                Ok(None) => {}
                Err(e) => warn!(dir = %path.display(), error = %e, "skipping unreadable cache entry"),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        let dir = self.entry_dir(key);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(key = %key, "cache entry removed");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context(RemoveEntrySnafu { path: dir }),
        }
    }
}

fn check_relative(path: &str) -> Result<()> {
    let escapes = Path::new(path)
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if path.is_empty() || escapes {
        return Err(CacheError::InvalidPath { path: path.to_string() });
    }
    Ok(())
}

/// Hash a file with BLAKE3, returning the hex digest and byte count.
fn file_digest(path: &Path) -> io::Result<(String, u64)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let size = io::copy(&mut file, &mut hasher)?;
    Ok((hasher.finalize().to_hex().to_string(), size))
}

fn write_archive(key: &str, root: &Path, paths: &[String], archive_path: &Path) -> Result<(String, u64, Vec<String>)> {
    let context = || CreateArchiveSnafu { path: archive_path };

    let file = std::fs::File::create(archive_path).with_context(|_| context())?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut stored = Vec::with_capacity(paths.len());
    for rel in paths {
        let src = root.join(rel);
        let metadata = match std::fs::metadata(&src) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, path = %rel, "cache path does not exist, skipping");
                continue;
            }
            Err(e) => return Err(e).with_context(|_| context()),
        };
        if metadata.is_dir() {
            builder.append_dir_all(rel, &src).with_context(|_| context())?;
        } else {
            builder.append_path_with_name(&src, rel).with_context(|_| context())?;
        }
        stored.push(rel.clone());
    }

    let encoder = builder.into_inner().with_context(|_| context())?;
    let file = encoder.finish().with_context(|_| context())?;
    file.sync_all().with_context(|_| context())?;
    drop(file);

    if stored.is_empty() {
        let _ = std::fs::remove_file(archive_path);
        return NoPathsFoundSnafu { key }.fail();
    }

    let (digest, size) = file_digest(archive_path).with_context(|_| context())?;
    debug!(key = %key, archive = %archive_path.display(), size, "cache archive written");
    Ok((digest, size, stored))
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive_path).context(ExtractArchiveSnafu { path: archive_path })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(dest).context(ExtractArchiveSnafu { path: archive_path })?;
    debug!(archive = %archive_path.display(), dest = %dest.display(), "cache archive extracted");
    Ok(())
}

async fn remove_stale_archives(dir: &Path, current: &str) {
    let Ok(mut reader) = tokio::fs::read_dir(dir).await else {
        return;
    };
    let now = SystemTime::now();
    while let Ok(Some(dirent)) = reader.next_entry().await {
        let name = dirent.file_name();
        let name = name.to_string_lossy();
        if name == current || !name.starts_with("archive-") {
            continue;
        }
        let age = dirent
            .metadata()
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|age| age >= STALE_ARCHIVE_AGE) {
            if let Err(e) = tokio::fs::remove_file(dirent.path()).await {
                debug!(archive = %name, error = %e, "failed to remove superseded archive");
            }
        }
    }
}
