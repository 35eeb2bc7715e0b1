//! Pure branch filter matching.

const HEADS_PREFIX: &str = "refs/heads/";

/// Strip a `refs/heads/` prefix if present.
///
/// ```
/// use tessera_ci_core::verified::normalize_branch;
///
/// assert_eq!(normalize_branch("refs/heads/main"), "main");
/// assert_eq!(normalize_branch("main"), "main");
/// ```
#[inline]
pub fn normalize_branch(branch: &str) -> &str {
    branch.strip_prefix(HEADS_PREFIX).unwrap_or(branch)
}

/// Match a branch against a filter pattern.
///
/// A trailing `*` matches any suffix; anything else must match exactly.
/// Both sides may carry a `refs/heads/` prefix.
///
/// ```
/// use tessera_ci_core::verified::branch_matches;
///
/// assert!(branch_matches("pygmtsar2", "refs/heads/pygmtsar2"));
/// assert!(branch_matches("release/*", "release/2024.1"));
/// assert!(!branch_matches("main", "main-old"));
/// ```
pub fn branch_matches(pattern: &str, branch: &str) -> bool {
    let pattern = normalize_branch(pattern);
    let branch = normalize_branch(branch);
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => branch == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_matches_everything() {
        assert!(branch_matches("*", "anything"));
        assert!(branch_matches("refs/heads/*", "feature/x"));
    }

    #[test]
    fn test_exact_mismatch() {
        assert!(!branch_matches("pygmtsar2", "master"));
        assert!(!branch_matches("feature/*", "feat/x"));
    }
}
