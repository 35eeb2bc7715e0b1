//! Cache entry metadata and restore-key selection.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::InvalidKeySnafu;
use crate::error::Result;

/// Maximum length of a cache key in bytes.
pub const MAX_KEY_LENGTH: usize = 512;

/// Metadata stored next to each archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Literal cache key.
    pub key: String,
    /// Archive file name inside the entry directory.
    pub archive: String,
    /// BLAKE3 digest of the archive bytes, hex encoded.
    pub digest: String,
    /// Archive size in bytes.
    pub size_bytes: u64,
    /// When the archive was written.
    pub created_at: DateTime<Utc>,
    /// Workspace-relative paths stored in the archive.
    pub paths: Vec<String>,
}

/// Result of a restore attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RestoreOutcome {
    /// The literal key was found.
    ExactHit {
        /// Restored key.
        key: String,
        /// Digest of the restored archive.
        digest: String,
    },
    /// An entry matching a restore-key prefix was found.
    PrefixHit {
        /// Key of the restored entry.
        key: String,
        /// Prefix that matched.
        restore_key: String,
        /// Digest of the restored archive.
        digest: String,
    },
    /// Nothing usable was found.
    Miss,
}

impl RestoreOutcome {
    /// True if the literal key was restored.
    pub fn is_exact_hit(&self) -> bool {
        matches!(self, Self::ExactHit { .. })
    }

    /// True if anything was restored.
    pub fn is_hit(&self) -> bool {
        !matches!(self, Self::Miss)
    }
}

/// How a candidate entry was matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMatch<'a> {
    /// Literal key.
    Exact,
    /// Prefix from the restore-key list.
    Prefix(&'a str),
}

/// Directory name for a key: the hex BLAKE3 digest of the key bytes.
///
/// ```
/// use tessera_cache::key_digest;
///
/// assert_eq!(key_digest("fixtures").len(), 64);
/// assert_eq!(key_digest("a"), key_digest("a"));
/// assert_ne!(key_digest("a"), key_digest("b"));
/// ```
pub fn key_digest(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

/// Reject empty or oversized keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return InvalidKeySnafu {
            reason: "key cannot be empty",
        }
        .fail();
    }
    if key.len() > MAX_KEY_LENGTH {
        return InvalidKeySnafu {
            reason: format!("key is {} bytes (max: {MAX_KEY_LENGTH})", key.len()),
        }
        .fail();
    }
    Ok(())
}

/// Pick the entry to restore.
///
/// The literal key wins. Otherwise restore keys are tried in order and the
/// most recently created entry whose key starts with the prefix is chosen.
pub fn select_entry<'a, 'k>(
    key: &str,
    restore_keys: &'k [String],
    entries: &'a [CacheEntry],
) -> Option<(&'a CacheEntry, KeyMatch<'k>)> {
    if let Some(entry) = entries.iter().find(|e| e.key == key) {
        return Some((entry, KeyMatch::Exact));
    }
    restore_keys.iter().find_map(|prefix| {
        entries
            .iter()
            .filter(|e| e.key.starts_with(prefix.as_str()))
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)))
            .map(|entry| (entry, KeyMatch::Prefix(prefix.as_str())))
    })
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn entry(key: &str, minute: u32) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            archive: "archive.tar.gz".to_string(),
            digest: String::new(),
            size_bytes: 0,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap(),
            paths: vec![],
        }
    }

    #[test]
    fn test_exact_match_preferred() {
        let entries = vec![entry("S1A_Stack_v2", 30), entry("S1A_Stack_v1", 10)];
        let restore = vec!["S1A_".to_string()];
        let (found, how) = select_entry("S1A_Stack_v1", &restore, &entries).unwrap();
        assert_eq!(found.key, "S1A_Stack_v1");
        assert_eq!(how, KeyMatch::Exact);
    }

    #[test]
    fn test_newest_prefix_match() {
        let entries = vec![entry("S1A_Stack_v1", 10), entry("S1A_Stack_v3", 50), entry("S1A_Stack_v2", 30)];
        let restore = vec!["S1A_Stack_".to_string()];
        let (found, how) = select_entry("S1A_Stack_v4", &restore, &entries).unwrap();
        assert_eq!(found.key, "S1A_Stack_v3");
        assert_eq!(how, KeyMatch::Prefix("S1A_Stack_"));
    }

    #[test]
    fn test_restore_keys_tried_in_order() {
        let entries = vec![entry("other-new", 50), entry("dataset-old", 10)];
        let restore = vec!["dataset-".to_string(), "other-".to_string()];
        let (found, _) = select_entry("dataset-v9", &restore, &entries).unwrap();
        assert_eq!(found.key, "dataset-old");
    }

    #[test]
    fn test_no_match() {
        let entries = vec![entry("a", 0)];
        assert!(select_entry("b", &[], &entries).is_none());
        assert!(select_entry("b", &["c".to_string()], &entries).is_none());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("").is_err());
        assert!(validate_key(&"k".repeat(MAX_KEY_LENGTH + 1)).is_err());
        assert!(validate_key("S1A_Stack_CPGF_T173").is_ok());
    }
}
