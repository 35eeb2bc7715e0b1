//! Matrix expansion.
//!
//! A matrix is the Cartesian product of the OS and version axes, minus
//! exclusions. Cells are produced OS-major in declaration order so run
//! records and logs are stable between runs.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;

use crate::config::MatrixConfig;
use crate::error::CiCoreError;
use crate::error::DuplicateAxisValueSnafu;
use crate::error::EmptyAxisSnafu;
use crate::error::Result;
use crate::verified::TemplateVars;

/// Maximum cells a single matrix may expand to.
pub const MAX_MATRIX_CELLS: usize = 256;

/// One (os, version) combination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixCell {
    /// Position in the full expansion.
    pub index: usize,
    /// OS identifier.
    pub os: String,
    /// Language version identifier.
    pub version: String,
}

impl MatrixCell {
    /// Filesystem-safe identifier, `<os>-<version>`.
    pub fn id(&self) -> String {
        format!("{}-{}", sanitize(&self.os), sanitize(&self.version))
    }

    /// OS family used to pick provisioning commands.
    pub fn os_family(&self) -> OsFamily {
        OsFamily::from_os(&self.os)
    }

    /// Placeholder values for this cell.
    pub fn template_vars<'a>(&'a self, workflow: &'a str, cell_id: &'a str) -> TemplateVars<'a> {
        TemplateVars {
            workflow,
            os: &self.os,
            version: &self.version,
            cell_id,
        }
    }
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

/// Operating system family of a matrix OS value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    /// Debian/Ubuntu style images.
    Linux,
    /// macOS images.
    MacOs,
    /// Windows images.
    Windows,
    /// Anything else.
    Unknown,
}

impl OsFamily {
    /// Classify an OS identifier such as `ubuntu-22.04` or `macos-13`.
    ///
    /// ```
    /// use tessera_ci_core::matrix::OsFamily;
    ///
    /// assert_eq!(OsFamily::from_os("ubuntu-22.04"), OsFamily::Linux);
    /// assert_eq!(OsFamily::from_os("macos-13"), OsFamily::MacOs);
    /// assert_eq!(OsFamily::from_os("plan9"), OsFamily::Unknown);
    /// ```
    pub fn from_os(os: &str) -> Self {
        let lower = os.to_ascii_lowercase();
        if ["ubuntu", "debian", "linux", "fedora"].iter().any(|p| lower.starts_with(p)) {
            Self::Linux
        } else if lower.starts_with("macos") || lower.starts_with("osx") {
            Self::MacOs
        } else if lower.starts_with("windows") {
            Self::Windows
        } else {
            Self::Unknown
        }
    }
}

/// Subset of the matrix requested by the caller. Empty axes select all.
#[derive(Debug, Clone, Default)]
pub struct MatrixSelection {
    /// OS values to keep.
    pub os: Vec<String>,
    /// Version values to keep.
    pub version: Vec<String>,
}

impl MatrixSelection {
    /// Check whether the cell is selected.
    pub fn accepts(&self, cell: &MatrixCell) -> bool {
        (self.os.is_empty() || self.os.contains(&cell.os))
            && (self.version.is_empty() || self.version.contains(&cell.version))
    }
}

impl MatrixConfig {
    /// Expand the matrix into its cells.
    pub fn expand(&self) -> Result<Vec<MatrixCell>> {
        check_axis("os", &self.os)?;
        check_axis("version", &self.version)?;

        let mut cells = Vec::new();
        for os in &self.os {
            for version in &self.version {
                if self.exclude.iter().any(|e| e.matches(os, version)) {
                    continue;
                }
                if cells.len() == MAX_MATRIX_CELLS {
                    return Err(CiCoreError::TooManyCells {
                        count: self.os.len().saturating_mul(self.version.len()),
                        max: MAX_MATRIX_CELLS,
                    });
                }
                cells.push(MatrixCell {
                    index: cells.len(),
                    os: os.clone(),
                    version: version.clone(),
                });
            }
        }

        if cells.is_empty() {
            return Err(CiCoreError::EmptyMatrix);
        }

        let mut ids = HashSet::with_capacity(cells.len());
        for cell in &cells {
            if !ids.insert(cell.id()) {
                return Err(CiCoreError::InvalidConfig {
                    reason: format!("matrix cell id '{}' is not unique after sanitizing", cell.id()),
                });
            }
        }

        Ok(cells)
    }

    /// Expand the matrix and keep only the selected cells.
    ///
    /// Cell indices refer to the full expansion.
    pub fn expand_selected(&self, selection: &MatrixSelection) -> Result<Vec<MatrixCell>> {
        let cells: Vec<MatrixCell> = self.expand()?.into_iter().filter(|c| selection.accepts(c)).collect();
        if cells.is_empty() {
            return Err(CiCoreError::EmptyMatrix);
        }
        Ok(cells)
    }

    /// Effective parallelism limit for `cell_count` cells.
    pub fn parallelism(&self, cell_count: usize) -> usize {
        match self.max_parallel {
            Some(limit) if limit > 0 => (limit as usize).min(cell_count.max(1)),
            _ => cell_count.max(1),
        }
    }
}

fn check_axis(axis: &str, values: &[String]) -> Result<()> {
    if values.is_empty() {
        return EmptyAxisSnafu { axis }.fail();
    }
    let mut seen = HashSet::with_capacity(values.len());
    for value in values {
        if value.trim().is_empty() {
            return Err(CiCoreError::InvalidConfig {
                reason: format!("matrix axis '{axis}' contains an empty value"),
            });
        }
        if !seen.insert(value.as_str()) {
            return DuplicateAxisValueSnafu { axis, value }.fail();
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::config::MatrixExclude;

    fn matrix(os: &[&str], version: &[&str]) -> MatrixConfig {
        MatrixConfig {
            os: os.iter().map(|s| s.to_string()).collect(),
            version: version.iter().map(|s| s.to_string()).collect(),
            exclude: vec![],
            fail_fast: false,
            max_parallel: None,
        }
    }

    #[test]
    fn test_expand_os_major_order() {
        let cells = matrix(&["ubuntu-22.04", "macos-13"], &["3.10", "3.11"]).expand().unwrap();
        let pairs: Vec<_> = cells.iter().map(|c| (c.os.as_str(), c.version.as_str())).collect();
        assert_eq!(pairs, vec![
            ("ubuntu-22.04", "3.10"),
            ("ubuntu-22.04", "3.11"),
            ("macos-13", "3.10"),
            ("macos-13", "3.11"),
        ]);
        assert_eq!(cells[3].index, 3);
        assert_eq!(cells[2].id(), "macos-13-3.10");
    }

    #[test]
    fn test_exclude_removes_pairs() {
        let mut config = matrix(&["ubuntu-22.04", "macos-13"], &["3.10", "3.11"]);
        config.exclude = vec![MatrixExclude {
            os: Some("macos-13".to_string()),
            version: None,
        }];
        let cells = config.expand().unwrap();
        assert_eq!(cells.len(), 2);
        assert!(cells.iter().all(|c| c.os == "ubuntu-22.04"));
    }

    #[test]
    fn test_everything_excluded() {
        let mut config = matrix(&["ubuntu-22.04"], &["3.10"]);
        config.exclude = vec![MatrixExclude::default()];
        assert_eq!(config.expand(), Err(CiCoreError::EmptyMatrix));
    }

    #[test]
    fn test_empty_axis() {
        assert!(matches!(matrix(&[], &["3.10"]).expand(), Err(CiCoreError::EmptyAxis { .. })));
    }

    #[test]
    fn test_duplicate_value() {
        assert!(matches!(
            matrix(&["ubuntu-22.04", "ubuntu-22.04"], &["3.10"]).expand(),
            Err(CiCoreError::DuplicateAxisValue { .. })
        ));
    }

    #[test]
    fn test_sanitized_id_collision() {
        assert!(matches!(
            matrix(&["a b", "a_b"], &["1"]).expand(),
            Err(CiCoreError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_too_many_cells() {
        let os: Vec<String> = (0..20).map(|i| format!("os{i}")).collect();
        let version: Vec<String> = (0..20).map(|i| format!("v{i}")).collect();
        let config = MatrixConfig {
            os,
            version,
            exclude: vec![],
            fail_fast: false,
            max_parallel: None,
        };
        assert!(matches!(config.expand(), Err(CiCoreError::TooManyCells { count: 400, .. })));
    }

    #[test]
    fn test_selection() {
        let config = matrix(&["ubuntu-22.04", "macos-13"], &["3.10", "3.11"]);
        let selection = MatrixSelection {
            os: vec!["macos-13".to_string()],
            version: vec![],
        };
        let cells = config.expand_selected(&selection).unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].index, 2);

        let none = MatrixSelection {
            os: vec!["windows-2022".to_string()],
            version: vec![],
        };
        assert_eq!(config.expand_selected(&none), Err(CiCoreError::EmptyMatrix));
    }

    #[test]
    fn test_parallelism() {
        let mut config = matrix(&["a"], &["1"]);
        assert_eq!(config.parallelism(4), 4);
        config.max_parallel = Some(2);
        assert_eq!(config.parallelism(4), 2);
        assert_eq!(config.parallelism(1), 1);
        config.max_parallel = Some(0);
        assert_eq!(config.parallelism(3), 3);
    }

    fn arb_axis(prefix: &'static str) -> impl Strategy<Value = Vec<String>> {
        prop::collection::hash_set(0u32..1000, 1..8)
            .prop_map(move |set| set.into_iter().map(|n| format!("{prefix}{n}")).collect())
    }

    proptest! {
        #[test]
        fn test_expansion_is_full_product(os in arb_axis("os-"), version in arb_axis("v")) {
            let config = MatrixConfig { os: os.clone(), version: version.clone(), exclude: vec![], fail_fast: false, max_parallel: None };
            let cells = config.expand().unwrap();
            prop_assert_eq!(cells.len(), os.len() * version.len());

            let pairs: HashSet<_> = cells.iter().map(|c| (c.os.clone(), c.version.clone())).collect();
            prop_assert_eq!(pairs.len(), cells.len());

            for (i, cell) in cells.iter().enumerate() {
                prop_assert_eq!(cell.index, i);
                prop_assert_eq!(&cell.os, &os[i / version.len()]);
                prop_assert_eq!(&cell.version, &version[i % version.len()]);
            }
        }
    }
}
