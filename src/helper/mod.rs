//! Client-side view of the privileged helper daemon.
//!
//! The helper is a separately installed, separately versioned unit
//! (`tuneup-helperd`) with its own lifecycle. The engine only ever observes
//! it through the socket: present and current, present but stale, or absent.
//! Installation itself is an interactive, user-consented flow owned by the
//! UI — the engine reports the need and never escalates on its own.

pub mod client;
pub mod protocol;

pub use client::HelperClient;

/// Minimum helper version this build of the engine will talk to.
pub const REQUIRED_HELPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install/reachability state of the helper daemon.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HelperStatus {
    NotInstalled,
    Outdated { installed: String, required: String },
    UpToDate { version: String },
    /// Socket exists but the daemon is not answering (crashed, mid-upgrade).
    Unreachable { reason: String },
}

impl HelperStatus {
    pub fn is_usable(&self) -> bool {
        matches!(self, HelperStatus::UpToDate { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_up_to_date_is_usable() {
        assert!(HelperStatus::UpToDate {
            version: "1.0.0".into()
        }
        .is_usable());
        assert!(!HelperStatus::NotInstalled.is_usable());
        assert!(!HelperStatus::Outdated {
            installed: "0.1.0".into(),
            required: "0.3.0".into()
        }
        .is_usable());
        assert!(!HelperStatus::Unreachable {
            reason: "connection refused".into()
        }
        .is_usable());
    }
}
