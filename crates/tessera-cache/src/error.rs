//! Error types for the fixture cache.

use std::path::PathBuf;

use snafu::Snafu;

/// Result type for cache operations.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Errors raised by cache stores.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    /// Cache key is empty or too long.
    #[snafu(display("Invalid cache key: {reason}"))]
    InvalidKey {
        /// Reason the key was rejected.
        reason: String,
    },

    /// A cached path escapes the workspace.
    #[snafu(display("Cache path must be relative and inside the workspace: {path}"))]
    InvalidPath {
        /// The rejected path.
        path: String,
    },

    /// None of the configured paths exist.
    #[snafu(display("No cached paths exist for key '{key}'"))]
    NoPathsFound {
        /// Cache key being saved.
        key: String,
    },

    /// Failed to create a cache directory.
    #[snafu(display("Failed to create cache directory {}: {source}", path.display()))]
    CreateDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to read entry metadata.
    #[snafu(display("Failed to read cache metadata {}: {source}", path.display()))]
    ReadMeta {
        /// Metadata path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Entry metadata is not valid JSON.
    #[snafu(display("Failed to parse cache metadata {}: {source}", path.display()))]
    ParseMeta {
        /// Metadata path.
        path: PathBuf,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Failed to serialize entry metadata.
    #[snafu(display("Failed to serialize cache metadata: {source}"))]
    SerializeMeta {
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// Failed to write entry metadata.
    #[snafu(display("Failed to write cache metadata {}: {source}", path.display()))]
    WriteMeta {
        /// Metadata path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to build an archive.
    #[snafu(display("Failed to create cache archive {}: {source}", path.display()))]
    CreateArchive {
        /// Archive path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to unpack an archive.
    #[snafu(display("Failed to extract cache archive {}: {source}", path.display()))]
    ExtractArchive {
        /// Archive path.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to remove an entry.
    #[snafu(display("Failed to remove cache entry {}: {source}", path.display()))]
    RemoveEntry {
        /// Entry directory.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// Failed to list entries.
    #[snafu(display("Failed to list cache directory {}: {source}", path.display()))]
    ListEntries {
        /// Cache root.
        path: PathBuf,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// A blocking archive task panicked.
    #[snafu(display("Cache archive task failed: {source}"))]
    BlockingTask {
        /// Join error.
        source: tokio::task::JoinError,
    },
}
