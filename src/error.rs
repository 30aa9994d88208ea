use serde::Serialize;

use crate::audit::AuditPersistenceError;
use crate::catalog::CatalogLoadError;
use crate::confirm::ConfirmError;
use crate::executor::ExecutorError;
use crate::permissions::PermissionDenied;
use crate::preflight::PreflightFailed;

/// Top-level error for everything the broker surface can return.
///
/// The first three variants are resolved entirely client-side: no process is
/// spawned and no IPC call is made when validation, preflight, or permission
/// checking fails. Executor failures always leave a terminal run record
/// behind. Audit failures never abort the operation they were recording.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Preflight(#[from] PreflightFailed),

    #[error(transparent)]
    Permission(#[from] PermissionDenied),

    #[error(transparent)]
    Confirm(#[from] ConfirmError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Catalog(#[from] CatalogLoadError),

    #[error(transparent)]
    Audit(#[from] AuditPersistenceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Serialize for BrokerError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Request-shape failures. Nothing has run when one of these is returned.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ValidationError {
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    #[error("Missing argument '{slot}' for capability {capability}")]
    MissingArgument { capability: String, slot: String },

    #[error("Unexpected argument '{0}'")]
    UnexpectedArgument(String),

    #[error("Invalid value for '{slot}': {reason}")]
    InvalidArgument { slot: String, reason: String },
}

pub type BrokerResult<T> = Result<T, BrokerError>;
