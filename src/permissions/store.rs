use std::collections::HashMap;
use std::path::PathBuf;

use super::{PermissionRecord, PermissionState, Resource};
use crate::error::BrokerResult;

/// Persisted consent observations, one record per resource.
///
/// This is the only mutable trust state in the engine. It is a cache of what
/// the OS last told us, not an authority — the gate re-probes anything older
/// than its TTL before believing it.
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
pub struct PermissionStore {
    records: HashMap<String, PermissionRecord>,
    #[serde(skip)]
    path: PathBuf,
}

impl PermissionStore {
    pub fn load(data_dir: &std::path::Path) -> BrokerResult<Self> {
        let path = data_dir.join("permissions.json");
        if path.exists() {
            let data = std::fs::read_to_string(&path)?;
            let mut store: PermissionStore = serde_json::from_str(&data)?;
            store.path = path;
            Ok(store)
        } else {
            Ok(PermissionStore {
                records: HashMap::new(),
                path,
            })
        }
    }

    /// In-memory store for tests and ephemeral sessions; `save` is a no-op
    /// target into a scratch path that is never created.
    pub fn ephemeral() -> Self {
        PermissionStore::default()
    }

    pub fn save(&self) -> BrokerResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, data)?;
        Ok(())
    }

    pub fn get(&self, resource: &Resource) -> Option<&PermissionRecord> {
        self.records.get(&resource.as_str())
    }

    pub fn set(&mut self, resource: &Resource, state: PermissionState) -> BrokerResult<PermissionState> {
        self.records.insert(
            resource.as_str(),
            PermissionRecord {
                resource: resource.clone(),
                state,
                last_checked: chrono::Utc::now(),
            },
        );
        self.save()?;
        Ok(state)
    }

    pub fn forget(&mut self, resource: &Resource) -> BrokerResult<()> {
        self.records.remove(&resource.as_str());
        self.save()
    }

    pub fn all(&self) -> Vec<PermissionRecord> {
        self.records.values().cloned().collect()
    }
}
