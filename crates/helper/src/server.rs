//! Connection handling.
//!
//! One task per connection, one task per execution. The daemon trusts
//! nothing from the socket: tokens are re-verified, nonces are single-use,
//! capability ids must resolve in the compiled-in table, and argument
//! values are validated before the fixed argv is assembled. Every decision
//! is appended to the invocation log, refusals included.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tuneup_broker::helper::protocol::{
    read_frame, write_frame, HelperErrorKind, HelperRequest, HelperResponse, StreamKind,
    PROTOCOL_VERSION,
};

use crate::allowlist::{self, HelperCommand};
use crate::invocation_log::InvocationLog;

pub struct ServerState {
    /// Spent token nonces with their expiry, pruned opportunistically.
    replay: Mutex<HashMap<String, i64>>,
    running: Mutex<HashMap<Uuid, CancellationToken>>,
    log: InvocationLog,
}

impl ServerState {
    pub fn new(log: InvocationLog) -> Self {
        Self {
            replay: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            log,
        }
    }

    /// Record a nonce as spent. Returns false when it was already seen.
    fn claim_nonce(&self, nonce: &str, expires_at: i64) -> bool {
        let mut replay = self.replay.lock().expect("replay set lock poisoned");
        let now = chrono::Utc::now().timestamp();
        replay.retain(|_, expiry| *expiry > now);
        replay.insert(nonce.to_string(), expires_at).is_none()
    }

    fn cancel(&self, correlation_id: &Uuid) {
        if let Some(token) = self
            .running
            .lock()
            .expect("running map lock poisoned")
            .get(correlation_id)
        {
            token.cancel();
        }
    }

    fn log_refusal(&self, capability_id: &str, reason: &str) {
        if let Err(e) = self
            .log
            .append(capability_id, &[], &format!("refused:{}", reason))
        {
            warn!("invocation log append failed: {}", e);
        }
    }
}

pub async fn handle_connection(stream: UnixStream, state: Arc<ServerState>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let (tx, mut rx) = mpsc::channel::<HelperResponse>(64);
    let writer = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            if write_frame(&mut write_half, &response).await.is_err() {
                break;
            }
        }
    });

    // Executions started by this connection, cancelled if the peer goes away.
    let mut own_runs: Vec<Uuid> = Vec::new();

    loop {
        let request = match read_frame::<_, HelperRequest>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) => {
                warn!("dropping connection on bad frame: {}", e);
                break;
            }
        };

        match request {
            HelperRequest::Ping => {
                let _ = tx
                    .send(HelperResponse::Pong {
                        version: env!("CARGO_PKG_VERSION").to_string(),
                        protocol: PROTOCOL_VERSION,
                    })
                    .await;
            }
            HelperRequest::Cancel { correlation_id } => {
                info!("cancel requested for {}", correlation_id);
                state.cancel(&correlation_id);
            }
            HelperRequest::Execute {
                correlation_id,
                capability_id,
                args,
                token,
                timeout_secs,
            } => {
                let refusal = validate_execute(&state, &capability_id, &args, &token);
                match refusal {
                    Err((kind, message)) => {
                        state.log_refusal(&capability_id, &message);
                        let _ = tx
                            .send(HelperResponse::Error {
                                correlation_id: Some(correlation_id),
                                kind,
                                message,
                            })
                            .await;
                    }
                    Ok((command, argv)) => {
                        let cancel = CancellationToken::new();
                        state
                            .running
                            .lock()
                            .expect("running map lock poisoned")
                            .insert(correlation_id, cancel.clone());
                        own_runs.push(correlation_id);

                        let timeout =
                            Duration::from_secs(timeout_secs.min(command.max_timeout_secs));
                        let state = state.clone();
                        let tx = tx.clone();
                        tokio::spawn(async move {
                            run_command(
                                correlation_id,
                                command,
                                argv,
                                timeout,
                                cancel,
                                tx,
                                &state,
                            )
                            .await;
                            state
                                .running
                                .lock()
                                .expect("running map lock poisoned")
                                .remove(&correlation_id);
                        });
                    }
                }
            }
        }
    }

    for id in own_runs {
        state.cancel(&id);
    }
    drop(tx);
    let _ = writer.await;
}

type Refusal = (HelperErrorKind, String);

fn validate_execute(
    state: &ServerState,
    capability_id: &str,
    args: &[String],
    token: &tuneup_broker::helper::protocol::AuthToken,
) -> Result<(&'static HelperCommand, Vec<String>), Refusal> {
    let now = chrono::Utc::now().timestamp();
    if let Err(e) = token.verify(capability_id, now) {
        return Err((HelperErrorKind::Unauthorized, e.to_string()));
    }
    if !state.claim_nonce(&token.nonce, token.expires_at) {
        return Err((HelperErrorKind::Unauthorized, "token already used".into()));
    }

    let command = allowlist::lookup(capability_id).ok_or_else(|| {
        (
            HelperErrorKind::UnknownCapability,
            format!("'{}' is not in the helper allowlist", capability_id),
        )
    })?;

    let argv = allowlist::build_argv(command, args)
        .map_err(|e| (HelperErrorKind::BadRequest, e))?;

    Ok((command, argv))
}

async fn run_command(
    correlation_id: Uuid,
    command: &'static HelperCommand,
    argv: Vec<String>,
    timeout: Duration,
    cancel: CancellationToken,
    tx: mpsc::Sender<HelperResponse>,
    state: &ServerState,
) {
    info!(
        "executing {} ({} {:?})",
        command.capability_id, command.program, argv
    );

    let spawned = Command::new(command.program)
        .args(&argv)
        .env_clear()
        .env("PATH", "/usr/bin:/bin:/usr/sbin:/sbin")
        .current_dir("/")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            append_log(state, command, &argv, &format!("spawn-failed:{}", e));
            let _ = tx
                .send(HelperResponse::Error {
                    correlation_id: Some(correlation_id),
                    kind: HelperErrorKind::SpawnFailed,
                    message: e.to_string(),
                })
                .await;
            return;
        }
    };

    let stdout_task = stream_lines(
        child.stdout.take(),
        tx.clone(),
        correlation_id,
        StreamKind::Stdout,
    );
    let stderr_task = stream_lines(
        child.stderr.take(),
        tx.clone(),
        correlation_id,
        StreamKind::Stderr,
    );

    let finished = tokio::select! {
        status = child.wait() => status.ok(),
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            append_log(state, command, &argv, "cancelled");
            let _ = tx.send(HelperResponse::Error {
                correlation_id: Some(correlation_id),
                kind: HelperErrorKind::Cancelled,
                message: "cancelled by client".into(),
            }).await;
            return;
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            append_log(state, command, &argv, "timeout");
            let _ = tx.send(HelperResponse::Error {
                correlation_id: Some(correlation_id),
                kind: HelperErrorKind::Timeout,
                message: format!("exceeded {}s", timeout.as_secs()),
            }).await;
            return;
        }
    };

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    match finished {
        Some(status) => {
            let exit_code = status.code().unwrap_or(-1);
            append_log(state, command, &argv, &format!("exit:{}", exit_code));
            let _ = tx
                .send(HelperResponse::Done {
                    correlation_id,
                    exit_code,
                    stdout,
                    stderr,
                })
                .await;
        }
        None => {
            append_log(state, command, &argv, "wait-failed");
            let _ = tx
                .send(HelperResponse::Error {
                    correlation_id: Some(correlation_id),
                    kind: HelperErrorKind::Internal,
                    message: "failed to reap child process".into(),
                })
                .await;
        }
    }
}

fn append_log(state: &ServerState, command: &HelperCommand, argv: &[String], outcome: &str) {
    if let Err(e) = state.log.append(command.capability_id, argv, outcome) {
        warn!("invocation log append failed: {}", e);
    }
}

fn stream_lines<R>(
    source: Option<R>,
    tx: mpsc::Sender<HelperResponse>,
    correlation_id: Uuid,
    stream: StreamKind,
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
            let _ = tx
                .send(HelperResponse::Output {
                    correlation_id,
                    stream,
                    line,
                })
                .await;
        }
        capture
    })
}
