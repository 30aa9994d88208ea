//! Execution audit trail.
//!
//! Every execution attempt — successful, failed, cancelled, or blocked at
//! the permission gate — produces exactly one run record, keyed by the
//! caller's correlation id. Records are append-only: a record is created in
//! the `pending` state the moment execution begins and makes a single
//! transition to a terminal state. Nothing ever edits a terminal record, and
//! nothing deletes records except the explicit retention-cleanup operation,
//! which is itself audited.
//!
//! The write path never blocks the caller: entries go into a bounded channel
//! drained by a background task that batch-applies them to SQLite. When
//! persistence fails the batch is parked in a bounded in-memory ring and
//! retried on the next flush — an audit failure is surfaced to diagnostics
//! but never aborts or reverses the operation it was recording.

pub mod store;
pub mod writer;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::PrivilegeTier;

pub use store::{AuditStore, RunQuery};
pub use writer::AuditWriter;

/// Terminal disposition of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Execution has begun and no terminal state has been recorded yet.
    Pending,
    Success,
    /// The command completed but the output parser extracted only part of
    /// the expected structure.
    PartialSuccess,
    Failed,
    Cancelled,
    PermissionDenied,
    Timeout,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::PermissionDenied => "permission_denied",
            RunStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "success" => Some(RunStatus::Success),
            "partial_success" => Some(RunStatus::PartialSuccess),
            "failed" => Some(RunStatus::Failed),
            "cancelled" => Some(RunStatus::Cancelled),
            "permission_denied" => Some(RunStatus::PermissionDenied),
            "timeout" => Some(RunStatus::Timeout),
        _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending)
    }
}

/// The audit record for one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub correlation_id: Uuid,
    pub capability_id: String,
    pub tier: PrivilegeTier,
    pub status: RunStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_code: Option<i32>,
    /// Captured output, truncated at the store's cap. The byte counters
    /// always reflect the full untruncated size.
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub stdout_bytes: u64,
    pub stderr_bytes: u64,
    /// Structured output when the capability's parser succeeded.
    pub parsed: Option<serde_json::Value>,
    /// Classified failure description for non-success terminals.
    pub failure: Option<String>,
}

impl RunRecord {
    /// A fresh pending record, created the moment execution begins.
    pub fn begin(correlation_id: Uuid, capability_id: &str, tier: PrivilegeTier) -> Self {
        Self {
            correlation_id,
            capability_id: capability_id.to_string(),
            tier,
            status: RunStatus::Pending,
            started_at: chrono::Utc::now(),
            finished_at: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            stdout_bytes: 0,
            stderr_bytes: 0,
            parsed: None,
            failure: None,
        }
    }
}

/// The terminal half of a record, applied as the single pending→terminal
/// transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub parsed: Option<serde_json::Value>,
    pub failure: Option<String>,
}

impl RunOutcome {
    pub fn terminal(status: RunStatus) -> Self {
        debug_assert!(status.is_terminal());
        Self {
            status,
            finished_at: chrono::Utc::now(),
            exit_code: None,
            stdout: None,
            stderr: None,
            parsed: None,
            failure: None,
        }
    }
}

/// Messages accepted by the background writer.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Begin(RunRecord),
    Finish {
        correlation_id: Uuid,
        outcome: RunOutcome,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum AuditPersistenceError {
    #[error("Audit store error: {0}")]
    Store(String),

    #[error("Audit export error: {0}")]
    Export(String),
}
