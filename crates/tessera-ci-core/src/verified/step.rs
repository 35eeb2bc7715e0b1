//! Pure step sequencing decisions.
//!
//! # Tiger Style
//!
//! - Time passed as explicit parameter
//! - Saturating arithmetic prevents overflow

use crate::config::FailureKind;
use crate::config::StepCondition;
use crate::config::StepPhase;

/// Decide whether a step runs given the state of its job.
///
/// Nothing runs once the job is cancelled.
///
/// ```
/// use tessera_ci_core::config::StepCondition;
/// use tessera_ci_core::verified::should_run_step;
///
/// assert!(should_run_step(StepCondition::Success, false, false));
/// assert!(!should_run_step(StepCondition::Success, true, false));
/// assert!(should_run_step(StepCondition::Always, true, false));
/// assert!(should_run_step(StepCondition::Failure, true, false));
/// assert!(!should_run_step(StepCondition::Always, false, true));
/// ```
#[inline]
pub const fn should_run_step(condition: StepCondition, job_failed: bool, cancelled: bool) -> bool {
    if cancelled {
        return false;
    }
    match condition {
        StepCondition::Success => !job_failed,
        StepCondition::Always => true,
        StepCondition::Failure => job_failed,
    }
}

/// Map the phase of a failed step to the job failure kind.
#[inline]
pub const fn failure_kind_for_phase(phase: StepPhase) -> FailureKind {
    match phase {
        StepPhase::Provision => FailureKind::Provisioning,
        StepPhase::Build => FailureKind::Build,
        StepPhase::Install => FailureKind::Installation,
        // A cache step only fails on runner errors; misses never fail.
        StepPhase::Cache => FailureKind::Internal,
        StepPhase::Test => FailureKind::Test,
        StepPhase::Archive => FailureKind::ArtifactContract,
    }
}

/// Compute remaining time until deadline.
///
/// ```
/// use tessera_ci_core::verified::remaining_time_ms;
///
/// assert_eq!(remaining_time_ms(5000, 3000), 2000);
/// assert_eq!(remaining_time_ms(3000, 5000), 0);
/// ```
#[inline]
pub const fn remaining_time_ms(deadline_ms: u64, now_ms: u64) -> u64 {
    deadline_ms.saturating_sub(now_ms)
}

/// Compute the timeout for a step so it never outlives its job.
///
/// The step timeout is capped at `max_timeout_secs` and at the job time
/// left, rounded up to whole seconds. Never returns zero.
///
/// ```
/// use tessera_ci_core::verified::effective_step_timeout_secs;
///
/// assert_eq!(effective_step_timeout_secs(600, 21_600, 3_600_000), 600);
/// assert_eq!(effective_step_timeout_secs(600, 21_600, 90_500), 91);
/// assert_eq!(effective_step_timeout_secs(90_000, 21_600, u64::MAX), 21_600);
/// assert_eq!(effective_step_timeout_secs(600, 21_600, 0), 1);
/// ```
#[inline]
pub const fn effective_step_timeout_secs(step_timeout_secs: u64, max_timeout_secs: u64, job_remaining_ms: u64) -> u64 {
    let capped = if step_timeout_secs > max_timeout_secs {
        max_timeout_secs
    } else {
        step_timeout_secs
    };
    let remaining_secs = job_remaining_ms.div_ceil(1000);
    let effective = if capped < remaining_secs { capped } else { remaining_secs };
    if effective == 0 { 1 } else { effective }
}

/// Build the executable search path for a step.
///
/// Additions are listed in the order the workflow made them; later additions
/// take precedence, matching how each step prepends to `PATH`. Duplicates
/// keep their first (highest precedence) position.
///
/// ```
/// use tessera_ci_core::verified::build_search_path;
///
/// let path = build_search_path(&["/opt/a/bin".into(), "/opt/b/bin".into()], "/usr/bin:/bin");
/// assert_eq!(path, "/opt/b/bin:/opt/a/bin:/usr/bin:/bin");
/// ```
pub fn build_search_path(additions: &[String], base: &str) -> String {
    let mut entries: Vec<&str> = Vec::with_capacity(additions.len() + 8);
    for entry in additions.iter().rev().map(String::as_str).chain(base.split(':')) {
        if !entry.is_empty() && !entries.contains(&entry) {
            entries.push(entry);
        }
    }
    entries.join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_condition_only_after_failure() {
        assert!(!should_run_step(StepCondition::Failure, false, false));
        assert!(should_run_step(StepCondition::Failure, true, false));
    }

    #[test]
    fn test_cancelled_runs_nothing() {
        for condition in [StepCondition::Success, StepCondition::Always, StepCondition::Failure] {
            assert!(!should_run_step(condition, true, true));
        }
    }

    #[test]
    fn test_failure_kind_mapping() {
        assert_eq!(failure_kind_for_phase(StepPhase::Provision), FailureKind::Provisioning);
        assert_eq!(failure_kind_for_phase(StepPhase::Build), FailureKind::Build);
        assert_eq!(failure_kind_for_phase(StepPhase::Install), FailureKind::Installation);
        assert_eq!(failure_kind_for_phase(StepPhase::Test), FailureKind::Test);
        assert_eq!(failure_kind_for_phase(StepPhase::Archive), FailureKind::ArtifactContract);
    }

    #[test]
    fn test_search_path_dedupes() {
        let path = build_search_path(&["/usr/bin".into(), "/opt/gmtsar/bin".into(), "/usr/bin".into()], "/usr/bin:/bin");
        assert_eq!(path, "/usr/bin:/opt/gmtsar/bin:/bin");
    }

    #[test]
    fn test_search_path_empty_base() {
        assert_eq!(build_search_path(&["/opt/x".into()], ""), "/opt/x");
        assert_eq!(build_search_path(&[], "/bin"), "/bin");
    }
}
