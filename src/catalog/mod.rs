//! Capability catalog.
//!
//! The catalog is the single source of truth for what this application is
//! allowed to do on the host. It is loaded once at startup from a signed,
//! bundled manifest and is immutable for the lifetime of the process — there
//! is no way to register a capability at runtime, and the UI never submits
//! anything other than a capability id plus typed argument bindings.
//!
//! Loading is deliberately unforgiving: a malformed document, a schema
//! violation, a bad signature, a duplicate id, a shell metacharacter anywhere
//! in a command template, or a program path that is missing from the
//! executor layer's own static allowlist all abort the load. The catalog and
//! the executor allowlist are two separately maintained lists that must
//! agree, so a corrupted manifest alone cannot introduce a new executable.

pub mod manifest;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use manifest::{CatalogLoadError, ManifestSignature};

/// Which executor backend runs a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrivilegeTier {
    /// Spawned directly as the invoking user.
    User,
    /// Routed to the privileged helper daemon over local IPC.
    Elevated,
    /// Driven through the scripting bridge of a third-party application.
    Automation,
}

impl PrivilegeTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivilegeTier::User => "user",
            PrivilegeTier::Elevated => "elevated",
            PrivilegeTier::Automation => "automation",
        }
    }
}

/// How dangerous a capability is, which determines the confirmation flow.
///
/// `Destructive` capabilities never run without a fresh, matching preview
/// token — see the confirm module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskClass {
    Safe,
    Moderate,
    Destructive,
}

impl RiskClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskClass::Safe => "safe",
            RiskClass::Moderate => "moderate",
            RiskClass::Destructive => "destructive",
        }
    }
}

/// Strategy for turning captured stdout into structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputParser {
    /// Keep the raw capture only.
    #[default]
    None,
    /// One JSON string per non-empty line.
    Lines,
    /// stdout is a single JSON document.
    Json,
    /// stdout is a decimal byte count (e.g. `du -sk` style output).
    ByteCount,
}

/// A typed argument slot in a command template.
///
/// Slots are the only way caller-supplied data reaches a command line. Each
/// binding is validated against the slot's constraints; raw text is never
/// concatenated into a command string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlotKind {
    String {
        #[serde(default)]
        pattern: Option<String>,
        #[serde(default = "default_max_len")]
        max_len: usize,
    },
    Int {
        min: i64,
        max: i64,
    },
    Path {
        #[serde(default)]
        must_exist: bool,
        /// When set, the bound path must resolve inside this directory.
        #[serde(default)]
        within: Option<PathBuf>,
    },
    Choice {
        options: Vec<String>,
    },
}

fn default_max_len() -> usize {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgSlot {
    pub name: String,
    #[serde(flatten)]
    pub kind: SlotKind,
}

/// One element of a template's argument vector: either a fixed literal
/// reviewed at catalog-authoring time, or a named slot bound per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateArg {
    Literal(String),
    Slot(ArgSlot),
}

/// A fixed executable plus an ordered argument vector. Never a shell string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<TemplateArg>,
}

impl CommandTemplate {
    /// Names of the slots this template declares, in order.
    pub fn slot_names(&self) -> Vec<&str> {
        self.args
            .iter()
            .filter_map(|a| match a {
                TemplateArg::Slot(s) => Some(s.name.as_str()),
                TemplateArg::Literal(_) => None,
            })
            .collect()
    }

    pub fn slot(&self, name: &str) -> Option<&ArgSlot> {
        self.args.iter().find_map(|a| match a {
            TemplateArg::Slot(s) if s.name == name => Some(s),
            _ => None,
        })
    }
}

/// Rendering hints for the frontend. The broker itself never reads these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UiHints {
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub sort_key: Option<i64>,
}

/// Declarative precondition evaluated before a capability may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreflightCheck {
    PathExists { path: PathBuf },
    PathWritable { path: PathBuf },
    AppRunning { bundle_id: String },
    AppNotRunning { bundle_id: String },
    MinFreeDisk { path: PathBuf, bytes: u64 },
    AutomationPermission { bundle_id: String },
}

/// An immutable operation definition. Metadata only — behavior lives in the
/// executor backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub title: String,
    pub description: String,
    pub group: String,
    pub tier: PrivilegeTier,
    #[serde(default)]
    pub requires_full_disk: bool,
    pub risk: RiskClass,
    pub command: CommandTemplate,
    /// Side-effect-free variant of `command` used for dry-run previews.
    #[serde(default)]
    pub preview: Option<CommandTemplate>,
    #[serde(default)]
    pub output: OutputParser,
    #[serde(default)]
    pub preflight: Vec<PreflightCheck>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub ui: UiHints,
    /// Automation capabilities name the application they drive.
    #[serde(default)]
    pub automation_target: Option<String>,
}

impl Capability {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// The loaded, validated capability registry.
///
/// Construction goes through [`manifest::load`]; there is no way to build a
/// non-empty catalog from unvalidated parts outside this module's tests.
#[derive(Debug)]
pub struct Catalog {
    by_id: HashMap<String, Capability>,
    ordered: Vec<String>,
    version: u32,
}

impl Catalog {
    pub(crate) fn from_validated(version: u32, caps: Vec<Capability>) -> Self {
        let ordered = caps.iter().map(|c| c.id.clone()).collect();
        let by_id = caps.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            by_id,
            ordered,
            version,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn lookup(&self, id: &str) -> Option<&Capability> {
        self.by_id.get(id)
    }

    /// All capabilities in manifest order.
    pub fn all(&self) -> impl Iterator<Item = &Capability> {
        self.ordered.iter().filter_map(|id| self.by_id.get(id))
    }

    pub fn by_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a Capability> {
        self.all().filter(move |c| c.group == group)
    }

    /// Case-insensitive substring search over id, title, and description.
    pub fn search<'a>(&'a self, text: &str) -> Vec<&'a Capability> {
        let needle = text.to_lowercase();
        self.all()
            .filter(|c| {
                c.id.to_lowercase().contains(&needle)
                    || c.title.to_lowercase().contains(&needle)
                    || c.description.to_lowercase().contains(&needle)
            })
            .collect()
    }
}
