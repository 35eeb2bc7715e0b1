//! JSON schema of the workflow file.

use snafu::ResultExt;
use tessera_ci_core::WorkflowConfig;

use crate::error::Result;
use crate::error::SerializeSchemaSnafu;

/// JSON schema describing the workflow TOML document.
pub fn workflow_schema() -> Result<serde_json::Value> {
    let schema = schemars::schema_for!(WorkflowConfig);
    serde_json::to_value(schema).context(SerializeSchemaSnafu)
}
