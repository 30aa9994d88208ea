use std::path::Path;

use futures_util::future::join_all;

use super::{check_name, failure_message, remediation_hint, FailedCheck, PreflightResult};
use crate::catalog::{Capability, PreflightCheck};
use crate::permissions::{PermissionGate, PermissionState, Resource};

/// Read-only view of host state consumed by the checks. The real
/// implementation reads the filesystem and process table; tests substitute
/// a scripted one.
pub trait SystemProbe: Send + Sync {
    fn path_exists(&self, path: &Path) -> bool;
    fn path_writable(&self, path: &Path) -> bool;
    fn app_running(&self, bundle_id: &str) -> bool;
    fn free_disk_bytes(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the filesystem and `sysinfo`.
pub struct RealSystemProbe;

impl SystemProbe for RealSystemProbe {
    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn path_writable(&self, path: &Path) -> bool {
        match std::fs::metadata(path) {
            Ok(meta) => !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    fn app_running(&self, bundle_id: &str) -> bool {
        // Match on the executable name, the last segment of the bundle id
        // (com.apple.Safari -> Safari).
        let Some(name) = bundle_id.rsplit('.').next() else {
            return false;
        };
        let mut sys = sysinfo::System::new_all();
        sys.refresh_all();
        sys.processes()
            .values()
            .any(|p| p.name().to_string_lossy() == name)
    }

    fn free_disk_bytes(&self, path: &Path) -> Option<u64> {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        // Longest mount-point prefix wins (e.g. /System/Volumes/Data over /).
        disks
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space())
    }
}

/// Evaluate all of a capability's checks concurrently and report every
/// failure. `can_execute` is false as soon as any check fails, but the
/// result still lists the complete set.
pub async fn evaluate(
    capability: &Capability,
    probe: &dyn SystemProbe,
    gate: &PermissionGate,
) -> PreflightResult {
    if capability.preflight.is_empty() {
        return PreflightResult::pass();
    }

    let evaluations = capability
        .preflight
        .iter()
        .map(|check| run_check(check, probe, gate));
    let outcomes = join_all(evaluations).await;

    let mut failed = Vec::new();
    let mut remediation = Vec::new();
    for (check, ok) in capability.preflight.iter().zip(outcomes) {
        if !ok {
            failed.push(FailedCheck {
                name: check_name(check).to_string(),
                message: failure_message(check),
            });
            remediation.push(remediation_hint(check));
        }
    }

    if !failed.is_empty() {
        log::debug!(
            "Preflight for {}: {}/{} checks failed",
            capability.id,
            failed.len(),
            capability.preflight.len()
        );
    }

    PreflightResult::from_failures(failed, remediation)
}

async fn run_check(check: &PreflightCheck, probe: &dyn SystemProbe, gate: &PermissionGate) -> bool {
    match check {
        PreflightCheck::PathExists { path } => probe.path_exists(path),
        PreflightCheck::PathWritable { path } => probe.path_writable(path),
        PreflightCheck::AppRunning { bundle_id } => probe.app_running(bundle_id),
        PreflightCheck::AppNotRunning { bundle_id } => !probe.app_running(bundle_id),
        PreflightCheck::MinFreeDisk { path, bytes } => probe
            .free_disk_bytes(path)
            .is_some_and(|free| free >= *bytes),
        PreflightCheck::AutomationPermission { bundle_id } => {
            gate.status(&Resource::Automation(bundle_id.clone())).await
                == PermissionState::Granted
        }
    }
}

// ---------------------------------------------------------------------------
// MockSystemProbe — for testing
// ---------------------------------------------------------------------------
