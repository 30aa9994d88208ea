use async_trait::async_trait;

use super::{BoundArgs, CapabilityExecutor, ExecContext, ExecutionOutcome, ExecutorError};
use crate::catalog::Capability;
use crate::helper::protocol::AuthToken;
use crate::helper::{HelperClient, HelperStatus};
use crate::preflight::{FailedCheck, PreflightResult};

/// Routes elevated capabilities to the privileged helper daemon.
///
/// Each execution verifies the helper's install state, mints a fresh
/// single-operation token, and sends the capability id plus bound slot
/// values over the socket. The helper re-validates both the token and the
/// capability against its own compiled-in allowlist before spawning
/// anything; this executor deliberately has no way to name a program path.
/// Installation is never triggered from here — an absent or stale helper is
/// reported to the caller, who must run the interactive install flow.
pub struct ElevatedExecutor {
    client: HelperClient,
}

impl ElevatedExecutor {
    pub fn new(client: HelperClient) -> Self {
        Self { client }
    }

    pub fn with_default_socket() -> Self {
        Self::new(HelperClient::with_default_socket())
    }

    fn status_error(status: HelperStatus) -> Option<ExecutorError> {
        match status {
            HelperStatus::UpToDate { .. } => None,
            HelperStatus::NotInstalled => Some(ExecutorError::HelperNotInstalled),
            HelperStatus::Outdated {
                installed,
                required,
            } => Some(ExecutorError::HelperOutdated {
                installed,
                required,
            }),
            HelperStatus::Unreachable { reason } => {
                Some(ExecutorError::HelperUnreachable(reason))
            }
        }
    }
}

#[async_trait]
impl CapabilityExecutor for ElevatedExecutor {
    async fn execute(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if let Some(err) = Self::status_error(self.client.status().await) {
            return Err(err);
        }

        // One token per operation, minted at the last possible moment.
        let token = AuthToken::mint(&capability.id);
        let slot_values = args.slot_values(&capability.command);

        self.client
            .execute(
                ctx.correlation_id,
                &capability.id,
                slot_values,
                token,
                capability.timeout_secs,
                &ctx.progress,
                &ctx.cancel,
            )
            .await
    }

    async fn can_execute(&self, _capability: &Capability) -> PreflightResult {
        let status = self.client.status().await;
        match Self::status_error(status) {
            None => PreflightResult::pass(),
            Some(err) => PreflightResult::from_failures(
                vec![FailedCheck {
                    name: "helper_ready".into(),
                    message: err.to_string(),
                }],
                vec![
                    "Install or update the Tuneup privileged helper from Settings > Maintenance"
                        .to_string(),
                ],
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CommandTemplate, OutputParser, PrivilegeTier, RiskClass, UiHints};
    use uuid::Uuid;

    fn elevated_capability() -> Capability {
        Capability {
            id: "deep.system.temp".into(),
            title: "Clear System Temp".into(),
            description: "Removes temporary files".into(),
            group: "deep".into(),
            tier: PrivilegeTier::Elevated,
            requires_full_disk: false,
            risk: RiskClass::Destructive,
            command: CommandTemplate {
                program: "/bin/rm".into(),
                args: vec![],
            },
            preview: None,
            output: OutputParser::None,
            preflight: vec![],
            timeout_secs: 30,
            ui: UiHints::default(),
            automation_target: None,
        }
    }

    #[tokio::test]
    async fn absent_helper_blocks_before_any_spawn() {
        let executor = ElevatedExecutor::new(HelperClient::new("/nonexistent/helper.sock"));
        let err = executor
            .execute(
                &elevated_capability(),
                &BoundArgs::default(),
                &crate::executor::ExecContext::detached(Uuid::new_v4()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::HelperNotInstalled));
    }

    #[tokio::test]
    async fn can_execute_reports_helper_state_with_remediation() {
        let executor = ElevatedExecutor::new(HelperClient::new("/nonexistent/helper.sock"));
        let result = executor.can_execute(&elevated_capability()).await;
        assert!(!result.can_execute);
        assert_eq!(result.failed[0].name, "helper_ready");
        assert!(!result.remediation.is_empty());
    }
}
