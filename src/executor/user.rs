use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use super::{
    BoundArgs, CapabilityExecutor, ExecContext, ExecutionOutcome, ExecutorError, ProgressEvent,
    ProgressSink,
};
use crate::catalog::Capability;
use crate::preflight::{FailedCheck, PreflightResult};

/// Runs allowlisted commands directly as the invoking user.
///
/// The child is spawned from the template's program path — no shell is ever
/// involved — with a cleared environment, an explicit working directory, and
/// piped output streamed line by line to the progress sink. The capability
/// timeout is enforced here by forceful termination; dispatch holds its own
/// independent timer above this one.
pub struct UserExecutor;

impl UserExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UserExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapabilityExecutor for UserExecutor {
    async fn execute(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let argv = args.materialize(&capability.command);
        log::debug!(
            "Spawning {} {:?} for {}",
            capability.command.program.display(),
            argv,
            capability.id
        );

        let mut child = Command::new(&capability.command.program)
            .args(&argv)
            .env_clear()
            .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
            .env("HOME", std::env::var("HOME").unwrap_or_else(|_| "/".into()))
            .env("LANG", "en_US.UTF-8")
            .current_dir("/")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?;

        let stdout_task = stream_lines(child.stdout.take(), ctx.progress.clone(), false);
        let stderr_task = stream_lines(child.stderr.take(), ctx.progress.clone(), true);

        let status = tokio::select! {
            status = child.wait() => {
                status.map_err(|e| ExecutorError::SpawnFailed(e.to_string()))?
            }
            _ = ctx.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutorError::Cancelled);
            }
            _ = tokio::time::sleep(capability.timeout()) => {
                log::warn!("{} exceeded its {}s timeout, killing", capability.id, capability.timeout_secs);
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(ExecutorError::Timeout);
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        // A signal-terminated child has no exit code; report it as failure.
        let exit_code = status.code().unwrap_or(-1);

        if status.success() {
            Ok(ExecutionOutcome {
                exit_code,
                stdout,
                stderr,
            })
        } else {
            Err(ExecutorError::CommandFailed {
                exit_code,
                stdout,
                stderr,
            })
        }
    }

    async fn can_execute(&self, capability: &Capability) -> PreflightResult {
        if capability.command.program.exists() {
            PreflightResult::pass()
        } else {
            PreflightResult::from_failures(
                vec![FailedCheck {
                    name: "program_present".into(),
                    message: format!(
                        "{} is not present on this system",
                        capability.command.program.display()
                    ),
                }],
                vec!["This operation is unavailable on this system".to_string()],
            )
        }
    }
}

/// Forward lines to the sink while accumulating the full capture.
fn stream_lines<R>(
    source: Option<R>,
    progress: ProgressSink,
    is_stderr: bool,
) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut capture = String::new();
        let Some(source) = source else {
            return capture;
        };
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            capture.push_str(&line);
            capture.push('\n');
            progress.emit(if is_stderr {
                ProgressEvent::Stderr { line }
            } else {
                ProgressEvent::Stdout { line }
            });
        }
        capture
    })
}
