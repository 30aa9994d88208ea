//! Wire protocol between the app and the privileged helper daemon.
//!
//! The channel is a local Unix socket carrying line-delimited JSON frames.
//! Requests carry a capability id and bound argument values — never a
//! program path or a shell string; the helper maps the id onto its own
//! compiled-in command table. Every execute request carries a fresh
//! single-use token bound to that capability id; the helper re-checks the
//! token and its own allowlist independently of anything the client
//! validated.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use uuid::Uuid;

pub const PROTOCOL_VERSION: u32 = 1;

/// Lifetime of a freshly minted token. Generous enough for the connect and
/// authorization round-trip, far shorter than any execution timeout.
pub const TOKEN_TTL_SECS: i64 = 60;

/// A single-operation authorization token.
///
/// The binding digest ties the nonce to one capability id, so a token minted
/// for `quick.dns.flush` cannot authorize `deep.system.temp`. Tokens are
/// minted immediately before each dispatch and never cached or reused; the
/// helper additionally keeps a replay set of seen nonces.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    /// Base64 of 32 random bytes.
    pub nonce: String,
    /// Hex sha256(nonce bytes || capability id).
    pub binding: String,
    pub issued_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token has expired")]
    Expired,
    #[error("token does not authorize this capability")]
    Mismatch,
}

impl AuthToken {
    pub fn mint(capability_id: &str) -> Self {
        use rand::RngCore;
        let mut nonce = [0u8; 32];
        rand::rng().fill_bytes(&mut nonce);
        let now = chrono::Utc::now().timestamp();
        Self {
            nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
            binding: binding_digest(&nonce, capability_id),
            issued_at: now,
            expires_at: now + TOKEN_TTL_SECS,
        }
    }

    /// Re-derive and compare the binding for a claimed capability id.
    /// Comparison is constant-time; expiry is checked against `now`.
    pub fn verify(&self, capability_id: &str, now: i64) -> Result<(), TokenError> {
        if now >= self.expires_at || self.issued_at > now + 5 {
            return Err(TokenError::Expired);
        }
        let nonce = base64::engine::general_purpose::STANDARD
            .decode(&self.nonce)
            .map_err(|_| TokenError::Malformed)?;
        if nonce.len() != 32 {
            return Err(TokenError::Malformed);
        }
        let expected = binding_digest(&nonce, capability_id);
        let ok: bool = expected.as_bytes().ct_eq(self.binding.as_bytes()).into();
        if ok {
            Ok(())
        } else {
            Err(TokenError::Mismatch)
        }
    }
}

fn binding_digest(nonce: &[u8], capability_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(capability_id.as_bytes());
    hex(&hasher.finalize())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperRequest {
    Ping,
    Execute {
        correlation_id: Uuid,
        capability_id: String,
        args: Vec<String>,
        token: AuthToken,
        timeout_secs: u64,
    },
    Cancel {
        correlation_id: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperErrorKind {
    Unauthorized,
    UnknownCapability,
    BadRequest,
    SpawnFailed,
    Timeout,
    Cancelled,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelperResponse {
    Pong {
        version: String,
        protocol: u32,
    },
    Output {
        correlation_id: Uuid,
        stream: StreamKind,
        line: String,
    },
    Done {
        correlation_id: Uuid,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Error {
        correlation_id: Option<Uuid>,
        kind: HelperErrorKind,
        message: String,
    },
}

/// Write one frame as a single JSON line.
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> std::io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let mut json = serde_json::to_vec(frame)?;
    json.push(b'\n');
    writer.write_all(&json).await?;
    writer.flush().await
}

/// Read one frame; `Ok(None)` means the peer closed the stream.
pub async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufReadExt + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Ok(None);
    }
    serde_json::from_str(&line)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
