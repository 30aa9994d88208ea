use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{PermissionDenied, PermissionState, PermissionStore, Resource};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Default window within which a cached observation is trusted. Staleness is
/// bounded, not correctness — dispatch re-consults the gate before every
/// elevated or automation execution regardless.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Drives the platform consent machinery.
///
/// `probe` must be side-effect free from the user's point of view (a no-op
/// automation call, a helper ping, a test read of a protected path).
/// `request` may trigger an interactive OS consent dialog and block until
/// the user answers.
#[async_trait]
pub trait ConsentProber: Send + Sync {
    async fn probe(&self, resource: &Resource) -> PermissionState;
    async fn request(&self, resource: &Resource) -> PermissionState;
}

/// Emitted on every observed state transition, replacing ad-hoc callbacks.
#[derive(Debug, Clone)]
pub struct PermissionChange {
    pub resource: Resource,
    pub state: PermissionState,
}

/// Tracks and re-validates per-resource consent.
///
/// All methods take `&self`; the store is behind an internal lock (never held
/// across an await). Consumers that need change notifications call
/// `subscribe` rather than polling.
pub struct PermissionGate {
    store: Mutex<PermissionStore>,
    prober: std::sync::Arc<dyn ConsentProber>,
    ttl: Duration,
    events: broadcast::Sender<PermissionChange>,
}

impl PermissionGate {
    pub fn new(store: PermissionStore, prober: std::sync::Arc<dyn ConsentProber>, ttl: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: Mutex::new(store),
            prober,
            ttl,
            events,
        }
    }

    /// Current state for a resource. Served from the store when checked
    /// within the TTL window, otherwise re-probed and persisted.
    pub async fn status(&self, resource: &Resource) -> PermissionState {
        let cached = {
            let store = self.store.lock().expect("permission store lock poisoned");
            store.get(resource).and_then(|r| {
                let age = chrono::Utc::now() - r.last_checked;
                let fresh = age
                    .to_std()
                    .map(|age| age <= self.ttl)
                    .unwrap_or(false);
                fresh.then_some(r.state)
            })
        };

        if let Some(state) = cached {
            return state;
        }

        let state = self.prober.probe(resource).await;
        self.record(resource, state);
        state
    }

    /// Actively trigger the OS consent flow. May block on user interaction.
    pub async fn request(&self, resource: &Resource) -> PermissionState {
        let state = self.prober.request(resource).await;
        self.record(resource, state);
        state
    }

    /// Drop any cached observation so the next `status` call re-probes.
    pub fn invalidate(&self, resource: &Resource) {
        let mut store = self.store.lock().expect("permission store lock poisoned");
        if let Err(e) = store.forget(resource) {
            log::warn!("Failed to persist permission invalidation: {}", e);
        }
    }

    /// Human remediation steps for an ungranted resource.
    pub fn remediation(&self, resource: &Resource) -> Vec<String> {
        match resource {
            Resource::ElevatedHelper => vec![
                "Install the Tuneup privileged helper from Settings > Maintenance".to_string(),
                "Approve the administrator prompt when asked".to_string(),
            ],
            Resource::FullDiskAccess => vec![
                "Open System Settings > Privacy & Security > Full Disk Access".to_string(),
                "Enable Tuneup in the application list".to_string(),
            ],
            Resource::Automation(bundle) => vec![
                "Open System Settings > Privacy & Security > Automation".to_string(),
                format!("Allow Tuneup to control {}", bundle),
            ],
        }
    }

    /// Build the error dispatch returns when a required grant is missing.
    pub fn denied(&self, resource: &Resource, state: PermissionState) -> PermissionDenied {
        PermissionDenied {
            resource: resource.clone(),
            state,
            remediation: self.remediation(resource),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionChange> {
        self.events.subscribe()
    }

    fn record(&self, resource: &Resource, state: PermissionState) {
        let changed = {
            let mut store = self.store.lock().expect("permission store lock poisoned");
            let previous = store.get(resource).map(|r| r.state);
            if let Err(e) = store.set(resource, state) {
                log::warn!("Failed to persist permission state for {}: {}", resource, e);
            }
            previous != Some(state)
        };

        if changed {
            log::info!("Permission {} -> {}", resource, state.as_str());
            // No receivers is fine; send only fails when nobody subscribed.
            let _ = self.events.send(PermissionChange {
                resource: resource.clone(),
                state,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// MockConsentProber — for testing
// ---------------------------------------------------------------------------
