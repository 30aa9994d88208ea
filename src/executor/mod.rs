//! Executor backends and dispatch.
//!
//! Three backends, one contract. A capability's declared privilege tier
//! selects exactly one backend; tiers are never mixed for a single
//! capability. All caller-facing calls are async and report progress through
//! an explicit sink rather than shared callbacks.

pub mod allowlist;
pub mod automation;
pub mod dispatch;
pub mod elevated;
pub mod user;

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::{Capability, CommandTemplate, OutputParser, SlotKind, TemplateArg};
use crate::error::ValidationError;
use crate::preflight::PreflightResult;

pub use dispatch::Dispatcher;

/// A UI submission: which capability, with which typed argument values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub capability_id: String,
    #[serde(default)]
    pub arguments: HashMap<String, serde_json::Value>,
    pub correlation_id: Uuid,
    /// Required for destructive capabilities: the token of the preview the
    /// user confirmed.
    #[serde(default)]
    pub confirm_token: Option<Uuid>,
}

impl ExecutionRequest {
    pub fn new(capability_id: &str) -> Self {
        Self {
            capability_id: capability_id.to_string(),
            arguments: HashMap::new(),
            correlation_id: Uuid::new_v4(),
            confirm_token: None,
        }
    }

    pub fn with_argument(mut self, name: &str, value: serde_json::Value) -> Self {
        self.arguments.insert(name.to_string(), value);
        self
    }

    pub fn with_confirm_token(mut self, token: Uuid) -> Self {
        self.confirm_token = Some(token);
        self
    }
}

/// A validated, typed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Path(PathBuf),
}

impl ArgValue {
    fn render(&self) -> String {
        match self {
            ArgValue::Str(s) => s.clone(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Path(p) => p.to_string_lossy().into_owned(),
        }
    }
}

/// Argument bindings checked against a capability's template. Construction
/// is the only validation point; raw request values never reach a command
/// line without passing through `bind`.
#[derive(Debug, Clone, Default)]
pub struct BoundArgs {
    values: HashMap<String, ArgValue>,
}

impl BoundArgs {
    pub fn bind(
        capability: &Capability,
        provided: &HashMap<String, serde_json::Value>,
    ) -> Result<Self, ValidationError> {
        let template = &capability.command;
        let slot_names: Vec<&str> = template.slot_names();

        for name in provided.keys() {
            if !slot_names.contains(&name.as_str()) {
                return Err(ValidationError::UnexpectedArgument(name.clone()));
            }
        }

        let mut values = HashMap::new();
        for arg in &template.args {
            let TemplateArg::Slot(slot) = arg else {
                continue;
            };
            let raw = provided
                .get(&slot.name)
                .ok_or_else(|| ValidationError::MissingArgument {
                    capability: capability.id.clone(),
                    slot: slot.name.clone(),
                })?;
            let value = check_slot(&slot.name, &slot.kind, raw)?;
            values.insert(slot.name.clone(), value);
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    /// Paths bound to this request, used by the built-in preview itemizer.
    pub fn paths(&self) -> Vec<&Path> {
        self.values
            .values()
            .filter_map(|v| match v {
                ArgValue::Path(p) => Some(p.as_path()),
                _ => None,
            })
            .collect()
    }

    /// Bound slot values in template order, without literals. This is what
    /// crosses the IPC boundary to the helper, which rebuilds the full
    /// argument vector from its own compiled-in template.
    pub fn slot_values(&self, template: &CommandTemplate) -> Vec<String> {
        template
            .args
            .iter()
            .filter_map(|arg| match arg {
                TemplateArg::Slot(slot) => {
                    Some(self.values.get(&slot.name).map(ArgValue::render).unwrap_or_default())
                }
                TemplateArg::Literal(_) => None,
            })
            .collect()
    }

    /// Resolve a template into its final argument vector. Literal arguments
    /// pass through; slots are replaced by their bound values.
    pub fn materialize(&self, template: &CommandTemplate) -> Vec<String> {
        template
            .args
            .iter()
            .map(|arg| match arg {
                TemplateArg::Literal(lit) => lit.clone(),
                TemplateArg::Slot(slot) => self
                    .values
                    .get(&slot.name)
                    .map(ArgValue::render)
                    .unwrap_or_default(),
            })
            .collect()
    }
}

fn check_slot(
    name: &str,
    kind: &SlotKind,
    raw: &serde_json::Value,
) -> Result<ArgValue, ValidationError> {
    let invalid = |reason: String| ValidationError::InvalidArgument {
        slot: name.to_string(),
        reason,
    };

    match kind {
        SlotKind::String { pattern, max_len } => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid("expected a string".into()))?;
            if s.len() > *max_len {
                return Err(invalid(format!("longer than {} bytes", max_len)));
            }
            if s.chars().any(|c| c.is_control()) {
                return Err(invalid("control characters are not allowed".into()));
            }
            if let Some(p) = pattern {
                let re = regex::Regex::new(p)
                    .map_err(|e| invalid(format!("unusable pattern: {}", e)))?;
                if !re.is_match(s) {
                    return Err(invalid(format!("does not match pattern {}", p)));
                }
            }
            Ok(ArgValue::Str(s.to_string()))
        }
        SlotKind::Int { min, max } => {
            let i = raw
                .as_i64()
                .ok_or_else(|| invalid("expected an integer".into()))?;
            if i < *min || i > *max {
                return Err(invalid(format!("outside range {}..={}", min, max)));
            }
            Ok(ArgValue::Int(i))
        }
        SlotKind::Path { must_exist, within } => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid("expected a path string".into()))?;
            let path = PathBuf::from(s);
            if !path.is_absolute() {
                return Err(invalid("path must be absolute".into()));
            }
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(invalid("path must not contain '..'".into()));
            }
            if let Some(root) = within {
                if !path.starts_with(root) {
                    return Err(invalid(format!("path must be inside {}", root.display())));
                }
            }
            if *must_exist && !path.exists() {
                return Err(invalid("path does not exist".into()));
            }
            Ok(ArgValue::Path(path))
        }
        SlotKind::Choice { options } => {
            let s = raw
                .as_str()
                .ok_or_else(|| invalid("expected a string".into()))?;
            if !options.iter().any(|o| o == s) {
                return Err(invalid(format!("must be one of {:?}", options)));
            }
            Ok(ArgValue::Str(s.to_string()))
        }
    }
}

/// Incremental execution feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Stdout { line: String },
    Stderr { line: String },
}

/// Send half of a per-execution progress stream. Emission never fails — a
/// departed listener is not an execution error.
#[derive(Clone)]
pub struct ProgressSink {
    tx: Option<tokio::sync::mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Sink that drops everything, for previews and tests.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Per-request execution context handed to a backend.
pub struct ExecContext {
    pub correlation_id: Uuid,
    pub progress: ProgressSink,
    pub cancel: CancellationToken,
}

impl ExecContext {
    pub fn detached(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            progress: ProgressSink::discard(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Raw result of a completed backend execution (exit code zero).
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Typed automation-bridge failures. Raw platform error codes never leave
/// the automation executor.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AutomationError {
    #[error("{0} is not installed")]
    AppNotInstalled(String),

    #[error("{0} is not running")]
    AppNotRunning(String),

    #[error("automation access to {0} is denied")]
    PermissionDenied(String),

    #[error("{0} does not support this operation")]
    UnsupportedOperation(String),

    #[error("script failed: {0}")]
    ScriptFailed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Command failed (exit code {exit_code})")]
    CommandFailed { exit_code: i32, stdout: String, stderr: String },

    #[error("Execution timed out")]
    Timeout,

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Capability {0} is already running")]
    AlreadyRunning(String),

    #[error("The privileged helper is not installed")]
    HelperNotInstalled,

    #[error("The privileged helper is outdated (installed {installed}, required {required})")]
    HelperOutdated { installed: String, required: String },

    #[error("The privileged helper is unreachable: {0}")]
    HelperUnreachable(String),

    #[error("Helper IPC failure: {0}")]
    Ipc(String),

    #[error("The helper refused the request: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Automation(#[from] AutomationError),
}

/// The uniform backend contract. Cancellation arrives through the context's
/// token; each backend translates it into its own termination mechanism (a
/// kill signal, an IPC cancel message, a script abort).
#[async_trait]
pub trait CapabilityExecutor: Send + Sync {
    async fn execute(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, ExecutorError>;

    /// Backend-specific readiness (helper installed, bridge reachable).
    /// Catalog-declared preflight checks are evaluated separately.
    async fn can_execute(&self, capability: &Capability) -> PreflightResult;
}

/// Apply a capability's declared output parser to a captured stdout.
/// Returns the structured value plus whether parsing fully succeeded —
/// a parse failure on a zero exit is a partial success, not a failure.
pub fn parse_output(parser: OutputParser, stdout: &str) -> (Option<serde_json::Value>, bool) {
    match parser {
        OutputParser::None => (None, true),
        OutputParser::Lines => {
            let lines: Vec<&str> = stdout.lines().filter(|l| !l.trim().is_empty()).collect();
            (Some(serde_json::json!(lines)), true)
        }
        OutputParser::Json => match serde_json::from_str::<serde_json::Value>(stdout) {
            Ok(v) => (Some(v), true),
            Err(_) => (None, false),
        },
        OutputParser::ByteCount => {
            let first = stdout.split_whitespace().next().unwrap_or("");
            match first.parse::<u64>() {
                Ok(n) => (Some(serde_json::json!({ "bytes": n })), true),
                Err(_) => (None, false),
            }
        }
    }
}
