use std::path::{Path, PathBuf};

use tokio::io::BufReader;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{
    read_frame, write_frame, AuthToken, HelperErrorKind, HelperRequest, HelperResponse, StreamKind,
};
use super::{HelperStatus, REQUIRED_HELPER_VERSION};
use crate::executor::{ExecutionOutcome, ExecutorError, ProgressEvent, ProgressSink};

/// Default socket location for the installed daemon.
pub fn default_socket_path() -> PathBuf {
    PathBuf::from("/var/run/tuneup-helperd.sock")
}

/// Connects to the helper daemon for pings and single executions. One
/// connection per operation; nothing about a connection or a token outlives
/// the request it was made for.
pub struct HelperClient {
    socket_path: PathBuf,
}

impl HelperClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn with_default_socket() -> Self {
        Self::new(default_socket_path())
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Probe install state: absent socket means not installed, a connect or
    /// ping failure means unreachable, and a version older than this build
    /// requires means outdated.
    pub async fn status(&self) -> HelperStatus {
        if !self.socket_path.exists() {
            return HelperStatus::NotInstalled;
        }

        let mut stream = match UnixStream::connect(&self.socket_path).await {
            Ok(s) => s,
            Err(e) => {
                return HelperStatus::Unreachable {
                    reason: e.to_string(),
                }
            }
        };

        if let Err(e) = write_frame(&mut stream, &HelperRequest::Ping).await {
            return HelperStatus::Unreachable {
                reason: e.to_string(),
            };
        }

        let (read_half, _write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        match read_frame::<_, HelperResponse>(&mut reader).await {
            Ok(Some(HelperResponse::Pong { version, .. })) => compare_versions(&version),
            Ok(Some(other)) => HelperStatus::Unreachable {
                reason: format!("unexpected ping reply: {:?}", other),
            },
            Ok(None) => HelperStatus::Unreachable {
                reason: "helper closed the connection".into(),
            },
            Err(e) => HelperStatus::Unreachable {
                reason: e.to_string(),
            },
        }
    }

    /// Run one elevated operation. Streams output lines into `progress`;
    /// reacts to `cancel` by sending a cancel frame and waiting for the
    /// helper's terminal reply.
    pub async fn execute(
        &self,
        correlation_id: Uuid,
        capability_id: &str,
        args: Vec<String>,
        token: AuthToken,
        timeout_secs: u64,
        progress: &ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| ExecutorError::HelperUnreachable(e.to_string()))?;
        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        let request = HelperRequest::Execute {
            correlation_id,
            capability_id: capability_id.to_string(),
            args,
            token,
            timeout_secs,
        };
        write_frame(&mut write_half, &request)
            .await
            .map_err(|e| ExecutorError::Ipc(e.to_string()))?;

        let mut cancel_sent = false;
        loop {
            let frame = tokio::select! {
                frame = read_frame::<_, HelperResponse>(&mut reader) => {
                    frame.map_err(|e| ExecutorError::Ipc(e.to_string()))?
                }
                _ = cancel.cancelled(), if !cancel_sent => {
                    cancel_sent = true;
                    write_frame(&mut write_half, &HelperRequest::Cancel { correlation_id })
                        .await
                        .map_err(|e| ExecutorError::Ipc(e.to_string()))?;
                    continue;
                }
            };

            let Some(response) = frame else {
                return Err(ExecutorError::Ipc(
                    "helper closed the connection mid-operation".into(),
                ));
            };

            match response {
                HelperResponse::Output { stream, line, .. } => {
                    progress.emit(match stream {
                        StreamKind::Stdout => ProgressEvent::Stdout { line },
                        StreamKind::Stderr => ProgressEvent::Stderr { line },
                    });
                }
                HelperResponse::Done {
                    exit_code,
                    stdout,
                    stderr,
                    ..
                } => {
                    if exit_code == 0 {
                        return Ok(ExecutionOutcome {
                            exit_code,
                            stdout,
                            stderr,
                        });
                    }
                    return Err(ExecutorError::CommandFailed {
                        exit_code,
                        stdout,
                        stderr,
                    });
                }
                HelperResponse::Error { kind, message, .. } => {
                    return Err(map_helper_error(kind, message));
                }
                HelperResponse::Pong { .. } => {
                    return Err(ExecutorError::Ipc("unexpected pong during execute".into()));
                }
            }
        }
    }
}

fn compare_versions(installed: &str) -> HelperStatus {
    let required = semver::Version::parse(REQUIRED_HELPER_VERSION);
    let current = semver::Version::parse(installed);
    match (required, current) {
        (Ok(required), Ok(current)) if current < required => HelperStatus::Outdated {
            installed: installed.to_string(),
            required: REQUIRED_HELPER_VERSION.to_string(),
        },
        (Ok(_), Ok(_)) => HelperStatus::UpToDate {
            version: installed.to_string(),
        },
        _ => HelperStatus::Unreachable {
            reason: format!("helper reported unparseable version '{}'", installed),
        },
    }
}

fn map_helper_error(kind: HelperErrorKind, message: String) -> ExecutorError {
    match kind {
        HelperErrorKind::Unauthorized => ExecutorError::Unauthorized(message),
        HelperErrorKind::UnknownCapability => ExecutorError::Unauthorized(message),
        HelperErrorKind::BadRequest => ExecutorError::Ipc(message),
        HelperErrorKind::SpawnFailed => ExecutorError::SpawnFailed(message),
        HelperErrorKind::Timeout => ExecutorError::Timeout,
        HelperErrorKind::Cancelled => ExecutorError::Cancelled,
        HelperErrorKind::Internal => ExecutorError::Ipc(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helper::protocol::PROTOCOL_VERSION;
    use tokio::net::UnixListener;

    async fn serve_once(
        listener: UnixListener,
        mut handler: impl FnMut(HelperRequest) -> Vec<HelperResponse> + Send + 'static,
    ) {
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            while let Ok(Some(request)) = read_frame::<_, HelperRequest>(&mut reader).await {
                for response in handler(request) {
                    write_frame(&mut write_half, &response).await.unwrap();
                }
            }
        });
    }

    #[tokio::test]
    async fn status_not_installed_when_socket_missing() {
        let client = HelperClient::new("/nonexistent/helper.sock");
        assert_eq!(client.status().await, HelperStatus::NotInstalled);
    }

    #[tokio::test]
    async fn status_up_to_date() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        serve_once(listener, |_| {
            vec![HelperResponse::Pong {
                version: REQUIRED_HELPER_VERSION.to_string(),
                protocol: PROTOCOL_VERSION,
            }]
        })
        .await;

        let client = HelperClient::new(&socket);
        assert!(client.status().await.is_usable());
    }

    #[tokio::test]
    async fn status_outdated() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        serve_once(listener, |_| {
            vec![HelperResponse::Pong {
                version: "0.0.1".to_string(),
                protocol: PROTOCOL_VERSION,
            }]
        })
        .await;

        let client = HelperClient::new(&socket);
        assert!(matches!(
            client.status().await,
            HelperStatus::Outdated { .. }
        ));
    }

    #[tokio::test]
    async fn execute_streams_output_and_returns_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        serve_once(listener, |request| match request {
            HelperRequest::Execute { correlation_id, .. } => vec![
                HelperResponse::Output {
                    correlation_id,
                    stream: StreamKind::Stdout,
                    line: "purging".into(),
                },
                HelperResponse::Done {
                    correlation_id,
                    exit_code: 0,
                    stdout: "purging\n".into(),
                    stderr: String::new(),
                },
            ],
            _ => vec![],
        })
        .await;

        let client = HelperClient::new(&socket);
        let (sink, mut rx) = ProgressSink::channel();
        let outcome = client
            .execute(
                Uuid::new_v4(),
                "quick.memory.purge",
                vec![],
                AuthToken::mint("quick.memory.purge"),
                30,
                &sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.exit_code, 0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            ProgressEvent::Stdout { line } if line == "purging"
        ));
    }

    #[tokio::test]
    async fn helper_error_maps_to_typed_error() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("helper.sock");
        let listener = UnixListener::bind(&socket).unwrap();

        serve_once(listener, |request| match request {
            HelperRequest::Execute { correlation_id, .. } => vec![HelperResponse::Error {
                correlation_id: Some(correlation_id),
                kind: HelperErrorKind::Unauthorized,
                message: "token replayed".into(),
            }],
            _ => vec![],
        })
        .await;

        let client = HelperClient::new(&socket);
        let err = client
            .execute(
                Uuid::new_v4(),
                "deep.system.temp",
                vec![],
                AuthToken::mint("deep.system.temp"),
                30,
                &ProgressSink::discard(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::Unauthorized(_)));
    }
}
