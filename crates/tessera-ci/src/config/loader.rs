//! TOML workflow loader.

use std::path::Path;

use snafu::ResultExt;
use tessera_ci_core::WorkflowConfig;
use tracing::debug;
use tracing::instrument;

use crate::error::CiError;
use crate::error::InvalidWorkflowSnafu;
use crate::error::ParseConfigSnafu;
use crate::error::ReadConfigSnafu;
use crate::error::Result;

/// Maximum configuration file size (Tiger Style: bounded resources).
pub const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024; // 1 MB

/// Read a configuration file after checking it exists and is not too large.
pub(crate) fn read_config_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(CiError::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    // Tiger Style: Check file size before reading
    let metadata = std::fs::metadata(path).context(ReadConfigSnafu { path })?;
    if metadata.len() > MAX_CONFIG_FILE_SIZE {
        return Err(CiError::ConfigTooLarge {
            size: metadata.len(),
            max: MAX_CONFIG_FILE_SIZE,
        });
    }

    debug!(size = metadata.len(), "reading config file");
    std::fs::read_to_string(path).context(ReadConfigSnafu { path })
}

/// Load and validate a workflow from a TOML file.
///
/// # Errors
///
/// - The file does not exist or is larger than [`MAX_CONFIG_FILE_SIZE`]
/// - The TOML does not describe a workflow
/// - The workflow fails validation (empty axes, bad templates, ...)
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_workflow_config(path: &Path) -> Result<WorkflowConfig> {
    let content = read_config_file(path)?;
    load_workflow_config_str(&content, path.display().to_string())
}

/// Load and validate a workflow from a TOML string.
///
/// `source_name` is only used in error messages.
#[instrument(skip(content), fields(source = %source_name))]
pub fn load_workflow_config_str(content: &str, source_name: String) -> Result<WorkflowConfig> {
    let config: WorkflowConfig = toml::from_str(content).context(ParseConfigSnafu { source_name })?;
    config.validate().context(InvalidWorkflowSnafu)?;

    debug!(
        name = %config.name,
        steps = config.steps.len(),
        os = config.matrix.os.len(),
        versions = config.matrix.version.len(),
        "workflow loaded"
    );
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        name = "demo"
        [matrix]
        os = ["ubuntu-22.04"]
        version = ["3.11"]
        [[steps]]
        name = "test"
        kind = "run"
        run = "true"
    "#;

    #[test]
    fn test_load_minimal() {
        let config = load_workflow_config_str(MINIMAL, "inline".to_string()).unwrap();
        assert_eq!(config.name, "demo");
        assert_eq!(config.timeout_minutes, 360);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ci.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert!(load_workflow_config(&path).is_ok());
    }

    #[test]
    fn test_missing_file() {
        let err = load_workflow_config(Path::new("/nonexistent/ci.toml")).unwrap_err();
        assert!(matches!(err, CiError::ConfigNotFound { .. }));
    }

    #[test]
    fn test_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.toml");
        std::fs::write(&path, vec![b'#'; (MAX_CONFIG_FILE_SIZE + 1) as usize]).unwrap();
        assert!(matches!(load_workflow_config(&path), Err(CiError::ConfigTooLarge { .. })));
    }

    #[test]
    fn test_parse_error_names_source() {
        let err = load_workflow_config_str("name = ", "broken.toml".to_string()).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_validation_error() {
        let content = MINIMAL.replace(r#"os = ["ubuntu-22.04"]"#, "os = []");
        let err = load_workflow_config_str(&content, "inline".to_string()).unwrap_err();
        assert!(matches!(err, CiError::InvalidWorkflow { .. }));
    }
}
