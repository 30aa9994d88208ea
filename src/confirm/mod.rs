//! Preview-then-confirm flow for destructive capabilities.
//!
//! A destructive capability never runs directly. The caller first requests a
//! preview — a side-effect-free itemization of what would change and how
//! much — and receives a single-use token tied to that exact preview. The
//! execute request must carry the token; a missing token, an expired token,
//! or a token superseded by a newer preview is rejected and the caller must
//! preview again. This is mandatory for every destructive capability, with
//! no per-capability exemptions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// How long a preview stays confirmable. Long enough to read the list,
/// short enough that the system state it describes is still plausible.
pub const DEFAULT_PREVIEW_TTL: Duration = Duration::from_secs(180);

/// Itemization caps: previews are for human review, not bulk listings.
const MAX_PREVIEW_ITEMS: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewItem {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    /// Advisory flag from the capture heuristic (e.g. a media-heavy tab).
    #[serde(default)]
    pub heavy: bool,
}

/// What a destructive run would do, plus the token that authorizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub token: Uuid,
    pub capability_id: String,
    /// Itemized changes, truncated at the listing cap. `item_count` is the
    /// true total.
    pub items: Vec<PreviewItem>,
    pub item_count: usize,
    pub estimated_bytes: u64,
    /// sha256 over the itemization, so the UI can detect that what it
    /// rendered is what the token refers to.
    pub digest: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl Preview {
    pub fn new(capability_id: &str, mut items: Vec<PreviewItem>, ttl: Duration) -> Self {
        let item_count = items.len();
        items.truncate(MAX_PREVIEW_ITEMS);
        let estimated_bytes = items.iter().filter_map(|i| i.bytes).sum();
        let digest = digest_items(&items);
        let created_at = chrono::Utc::now();
        Self {
            token: Uuid::new_v4(),
            capability_id: capability_id.to_string(),
            items,
            item_count,
            estimated_bytes,
            digest,
            created_at,
            expires_at: created_at
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        }
    }
}

fn digest_items(items: &[PreviewItem]) -> String {
    let mut hasher = Sha256::new();
    for item in items {
        hasher.update(item.label.as_bytes());
        hasher.update(item.bytes.unwrap_or(0).to_le_bytes());
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfirmError {
    #[error("{0} is destructive and requires a preview confirmation")]
    ConfirmationRequired(String),

    #[error("The preview for {0} has been superseded; request a new preview")]
    PreviewStale(String),

    #[error("The preview for {0} has expired; request a new preview")]
    PreviewExpired(String),
}

struct StoredPreview {
    token: Uuid,
    expires_at: chrono::DateTime<chrono::Utc>,
}

/// Tracks the latest preview per capability and validates confirm tokens.
/// Tokens are single-use: a successful validation consumes the preview.
pub struct ConfirmController {
    previews: Mutex<HashMap<String, StoredPreview>>,
    ttl: Duration,
}

impl ConfirmController {
    pub fn new(ttl: Duration) -> Self {
        Self {
            previews: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Record a freshly built preview, superseding any earlier one for the
    /// same capability.
    pub fn register(&self, preview: &Preview) {
        let mut previews = self.previews.lock().expect("preview map lock poisoned");
        previews.insert(
            preview.capability_id.clone(),
            StoredPreview {
                token: preview.token,
                expires_at: preview.expires_at,
            },
        );
    }

    /// Validate a confirm token for a capability and consume it on success.
    pub fn validate_and_consume(
        &self,
        capability_id: &str,
        token: Option<Uuid>,
    ) -> Result<(), ConfirmError> {
        let Some(token) = token else {
            return Err(ConfirmError::ConfirmationRequired(capability_id.to_string()));
        };

        let mut previews = self.previews.lock().expect("preview map lock poisoned");
        let Some(stored) = previews.get(capability_id) else {
            // Either never previewed or already consumed.
            return Err(ConfirmError::ConfirmationRequired(capability_id.to_string()));
        };

        if stored.token != token {
            return Err(ConfirmError::PreviewStale(capability_id.to_string()));
        }
        if chrono::Utc::now() >= stored.expires_at {
            previews.remove(capability_id);
            return Err(ConfirmError::PreviewExpired(capability_id.to_string()));
        }

        previews.remove(capability_id);
        Ok(())
    }
}

impl Default for ConfirmController {
    fn default() -> Self {
        Self::new(DEFAULT_PREVIEW_TTL)
    }
}

/// Built-in itemizer for path-targeted destructive capabilities without a
/// preview template: walk the targets and report entries with sizes.
pub fn itemize_paths(paths: &[&Path]) -> Vec<PreviewItem> {
    let mut items = Vec::new();
    for root in paths {
        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .max_depth(2)
            .into_iter()
            .filter_map(Result::ok)
        {
            let bytes = entry.metadata().ok().filter(|m| m.is_file()).map(|m| m.len());
            items.push(PreviewItem {
                label: entry.path().display().to_string(),
                bytes,
                heavy: false,
            });
            if items.len() >= MAX_PREVIEW_ITEMS * 2 {
                return items;
            }
        }
    }
    items
}
