//! Precondition evaluation.
//!
//! Every capability declares zero or more checks that must hold before it is
//! dispatched. Checks are pure predicates over live system state — they never
//! mutate anything. The engine reports every failing check in one pass so
//! the UI can show a complete remediation list instead of drip-feeding
//! failures one re-run at a time.

pub mod engine;

use serde::{Deserialize, Serialize};

use crate::catalog::PreflightCheck;

pub use engine::{evaluate, RealSystemProbe, SystemProbe};

/// One failing check with its human-readable explanation. `name` is a
/// stable slug — either a declared check type or a backend readiness
/// condition such as `helper_installed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedCheck {
    pub name: String,
    pub message: String,
}

pub(crate) fn check_name(check: &PreflightCheck) -> &'static str {
    match check {
        PreflightCheck::PathExists { .. } => "path_exists",
        PreflightCheck::PathWritable { .. } => "path_writable",
        PreflightCheck::AppRunning { .. } => "app_running",
        PreflightCheck::AppNotRunning { .. } => "app_not_running",
        PreflightCheck::MinFreeDisk { .. } => "min_free_disk",
        PreflightCheck::AutomationPermission { .. } => "automation_permission",
    }
}

/// Outcome of evaluating all of a capability's checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreflightResult {
    pub can_execute: bool,
    /// Every failing check, never truncated to the first.
    pub failed: Vec<FailedCheck>,
    pub remediation: Vec<String>,
}

impl PreflightResult {
    pub fn pass() -> Self {
        Self {
            can_execute: true,
            failed: Vec::new(),
            remediation: Vec::new(),
        }
    }

    pub fn from_failures(failed: Vec<FailedCheck>, remediation: Vec<String>) -> Self {
        Self {
            can_execute: failed.is_empty(),
            failed,
            remediation,
        }
    }
}

/// Returned by the broker when preflight blocks a request. The capability
/// was never dispatched.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Preflight failed for {capability_id}: {} check(s) failed", .result.failed.len())]
pub struct PreflightFailed {
    pub capability_id: String,
    pub result: PreflightResult,
}

/// Explanation and remediation text per check type.
pub(crate) fn failure_message(check: &PreflightCheck) -> String {
    match check {
        PreflightCheck::PathExists { path } => {
            format!("{} does not exist", path.display())
        }
        PreflightCheck::PathWritable { path } => {
            format!("{} is not writable", path.display())
        }
        PreflightCheck::AppRunning { bundle_id } => {
            format!("{} is not running", bundle_id)
        }
        PreflightCheck::AppNotRunning { bundle_id } => {
            format!("{} is still running", bundle_id)
        }
        PreflightCheck::MinFreeDisk { path, bytes } => {
            format!(
                "less than {} MB free on the volume containing {}",
                bytes / (1024 * 1024),
                path.display()
            )
        }
        PreflightCheck::AutomationPermission { bundle_id } => {
            format!("automation access to {} has not been granted", bundle_id)
        }
    }
}

pub(crate) fn remediation_hint(check: &PreflightCheck) -> String {
    match check {
        PreflightCheck::PathExists { path } | PreflightCheck::PathWritable { path } => {
            format!("Check that {} exists and is accessible", path.display())
        }
        PreflightCheck::AppRunning { bundle_id } => {
            format!("Launch {} and try again", bundle_id)
        }
        PreflightCheck::AppNotRunning { bundle_id } => {
            format!("Quit {} and try again", bundle_id)
        }
        PreflightCheck::MinFreeDisk { .. } => {
            "Free up disk space and try again".to_string()
        }
        PreflightCheck::AutomationPermission { bundle_id } => {
            format!(
                "Allow Tuneup to control {} under System Settings > Privacy & Security > Automation",
                bundle_id
            )
        }
    }
}
