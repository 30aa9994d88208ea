//! External consent tracking.
//!
//! The operating system owns the real authorization state for automation
//! targets, full-disk access, and the privileged helper; it can revoke any
//! of them while we are running. This module holds the broker's view of that
//! state: a persisted tri-state per resource, refreshed by active probing
//! and trusted only within a short TTL. Dispatch re-consults the gate at the
//! moment of every elevated or automation execution — a grant observed
//! earlier in the session is never assumed to still hold.

pub mod gate;
pub mod store;

use serde::{Deserialize, Serialize};

pub use gate::{ConsentProber, PermissionChange, PermissionGate};
pub use store::PermissionStore;

/// Tri-state consent as last observed from the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PermissionState {
    #[default]
    NotDetermined,
    Granted,
    Denied,
}

impl PermissionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionState::NotDetermined => "not_determined",
            PermissionState::Granted => "granted",
            PermissionState::Denied => "denied",
        }
    }
}

/// An external resource whose consent the OS controls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    /// The privileged helper daemon (installed and authorized).
    ElevatedHelper,
    /// Full Disk Access for the main application.
    FullDiskAccess,
    /// Apple-events automation consent for one application bundle id.
    Automation(String),
}

impl Resource {
    pub fn as_str(&self) -> String {
        match self {
            Resource::ElevatedHelper => "elevated-helper".to_string(),
            Resource::FullDiskAccess => "full-disk-access".to_string(),
            Resource::Automation(bundle) => format!("automation:{}", bundle),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "elevated-helper" => Some(Resource::ElevatedHelper),
            "full-disk-access" => Some(Resource::FullDiskAccess),
            _ => s
                .strip_prefix("automation:")
                .filter(|b| !b.is_empty())
                .map(|b| Resource::Automation(b.to_string())),
        }
    }
}

impl Serialize for Resource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_str())
    }
}

impl<'de> Deserialize<'de> for Resource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Resource::parse(&s).ok_or_else(|| {
            serde::de::Error::unknown_variant(&s, &["elevated-helper", "full-disk-access", "automation:<bundle>"])
        })
    }
}

impl std::fmt::Display for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// One persisted consent observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRecord {
    pub resource: Resource,
    pub state: PermissionState,
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

/// Returned when dispatch finds a required resource not granted. Carries the
/// exact remediation steps so the UI can render them without guessing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Permission for {resource} is {}", .state.as_str())]
pub struct PermissionDenied {
    pub resource: Resource,
    pub state: PermissionState,
    pub remediation: Vec<String>,
}
