//! Run admission based on workflow triggers.

use tessera_ci_core::WorkflowConfig;
use tessera_ci_core::config::TriggerEvent;
use tessera_ci_core::verified::normalize_branch;
use tracing::info;
use tracing::warn;

use crate::error::CiError;
use crate::error::Result;

/// Check whether a run request is accepted.
///
/// A rejected request is an error unless `force` is set, in which case it
/// is logged and accepted.
pub fn check_trigger(workflow: &WorkflowConfig, event: TriggerEvent, branch: &str, force: bool) -> Result<()> {
    let branch = normalize_branch(branch);
    if workflow.should_trigger(event, branch) {
        info!(workflow = %workflow.name, event = %event, branch = %branch, "run triggered");
        return Ok(());
    }
    if force {
        warn!(workflow = %workflow.name, event = %event, branch = %branch, "trigger filters do not match, forcing run");
        return Ok(());
    }
    Err(CiError::NotTriggered {
        workflow: workflow.name.clone(),
        event: event.to_string(),
        branch: branch.to_string(),
    })
}
