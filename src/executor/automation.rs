use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{
    AutomationError, BoundArgs, CapabilityExecutor, ExecContext, ExecutionOutcome, ExecutorError,
};
use crate::catalog::Capability;
use crate::preflight::{FailedCheck, PreflightResult};

/// Abstraction over the platform scripting layer.
///
/// `probe` is the consent no-op: it must not change anything observable in
/// the target application. Failures surface as the typed error set — raw
/// scripting-layer codes stop here.
#[async_trait]
pub trait AutomationBridge: Send + Sync {
    async fn probe(&self, bundle_id: &str) -> Result<(), AutomationError>;

    async fn run(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, AutomationError>;
}

/// Bridge backed by the system script runner. Capability templates for this
/// tier invoke the runner with fixed, bundled script files; caller input
/// only ever reaches a script through validated slot bindings.
pub struct OsaScriptBridge;

const SCRIPT_RUNNER: &str = "/usr/bin/osascript";

/// Known scripting-layer error codes worth mapping individually.
/// -600: application isn't running; -1743: user declined automation access.
fn classify_osascript_failure(bundle_id: &str, stderr: &str) -> AutomationError {
    if stderr.contains("-1743") {
        AutomationError::PermissionDenied(bundle_id.to_string())
    } else if stderr.contains("-600") {
        AutomationError::AppNotRunning(bundle_id.to_string())
    } else if stderr.contains("-1708") {
        AutomationError::UnsupportedOperation(bundle_id.to_string())
    } else if stderr.contains("Application can't be found")
        || stderr.contains("-10814")
    {
        AutomationError::AppNotInstalled(bundle_id.to_string())
    } else {
        AutomationError::ScriptFailed(stderr.trim().to_string())
    }
}

#[async_trait]
impl AutomationBridge for OsaScriptBridge {
    async fn probe(&self, bundle_id: &str) -> Result<(), AutomationError> {
        // Asking for the name is the cheapest Apple event that still
        // exercises the consent machinery.
        let script = format!("tell application id \"{}\" to get name", bundle_id);
        let output = Command::new(SCRIPT_RUNNER)
            .arg("-e")
            .arg(script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| AutomationError::ScriptFailed(e.to_string()))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_osascript_failure(
                bundle_id,
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn run(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, AutomationError> {
        let bundle_id = capability.automation_target.as_deref().unwrap_or_default();
        let argv = args.materialize(&capability.command);

        let mut child = Command::new(&capability.command.program)
            .args(&argv)
            .env_clear()
            .env("PATH", "/usr/bin:/bin")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AutomationError::ScriptFailed(e.to_string()))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| AutomationError::ScriptFailed(e.to_string()))?
            }
            _ = ctx.cancel.cancelled() => {
                return Err(AutomationError::ScriptFailed("cancelled".into()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(ExecutionOutcome {
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        } else {
            Err(classify_osascript_failure(bundle_id, &stderr))
        }
    }
}

/// Drives third-party applications through the bridge, one capability at a
/// time. Consent is checked by dispatch against the permission gate at the
/// moment of dispatch; this executor trusts that check but still maps any
/// late revocation surfacing from the bridge into `PermissionDenied`.
pub struct AutomationExecutor {
    bridge: std::sync::Arc<dyn AutomationBridge>,
}

impl AutomationExecutor {
    pub fn new(bridge: std::sync::Arc<dyn AutomationBridge>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl CapabilityExecutor for AutomationExecutor {
    async fn execute(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if ctx.cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }
        self.bridge
            .run(capability, args, ctx)
            .await
            .map_err(ExecutorError::Automation)
    }

    async fn can_execute(&self, capability: &Capability) -> PreflightResult {
        let Some(bundle_id) = capability.automation_target.as_deref() else {
            return PreflightResult::from_failures(
                vec![FailedCheck {
                    name: "automation_target".into(),
                    message: "capability declares no automation target".into(),
                }],
                vec![],
            );
        };

        match self.bridge.probe(bundle_id).await {
            Ok(()) => PreflightResult::pass(),
            Err(err) => PreflightResult::from_failures(
                vec![FailedCheck {
                    name: "automation_bridge".into(),
                    message: err.to_string(),
                }],
                vec![match err {
                    AutomationError::AppNotInstalled(app) => {
                        format!("Install {} to use this operation", app)
                    }
                    AutomationError::AppNotRunning(app) => format!("Launch {} and try again", app),
                    AutomationError::PermissionDenied(app) => format!(
                        "Allow Tuneup to control {} under System Settings > Privacy & Security > Automation",
                        app
                    ),
                    _ => "Try again once the application is responsive".to_string(),
                }],
            ),
        }
    }
}

/// Heuristic classifier for automation captures (e.g. which browser tabs
/// count as heavyweight when previewing a close-tabs run). Pattern matching
/// by name and domain is inherently approximate, so it stays pluggable and
/// advisory — nothing enforces an invariant on top of it.
pub trait CaptureHeuristic: Send + Sync {
    fn is_heavy(&self, label: &str) -> bool;
}

/// Default patterns: media and conferencing sites that typically hold
/// significant memory or active sessions.
pub struct DefaultCaptureHeuristic;

const HEAVY_PATTERNS: &[&str] = &[
    "youtube.",
    "netflix.",
    "twitch.",
    "meet.google.",
    "zoom.us",
    "teams.microsoft.",
    "figma.com",
    "docs.google.",
];

impl CaptureHeuristic for DefaultCaptureHeuristic {
    fn is_heavy(&self, label: &str) -> bool {
        let lower = label.to_lowercase();
        HEAVY_PATTERNS.iter().any(|p| lower.contains(p))
    }
}
