//! Tamper-evident invocation log.
//!
//! Every request the daemon acts on — including the ones it refuses — is
//! appended here as a JSON line carrying the sha256 of the previous line's
//! hash plus its own content. Truncating, editing, or reordering the file
//! breaks the chain, so accountability survives a compromised client: the
//! app's own audit log can lie, this one cannot be rewritten quietly.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const GENESIS: &str = "genesis";

#[derive(Debug, Serialize, Deserialize)]
pub struct InvocationEntry {
    pub timestamp: String,
    pub capability_id: String,
    pub argv: Vec<String>,
    /// Exit code for completed runs, refusal reason otherwise.
    pub outcome: String,
    pub prev_hash: String,
    pub hash: String,
}

pub struct InvocationLog {
    path: PathBuf,
    last_hash: Mutex<String>,
}

impl InvocationLog {
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let last_hash = match std::fs::read_to_string(&path) {
            Ok(content) => content
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .and_then(|l| serde_json::from_str::<InvocationEntry>(l).ok())
                .map(|e| e.hash)
                .unwrap_or_else(|| GENESIS.to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => GENESIS.to_string(),
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            last_hash: Mutex::new(last_hash),
        })
    }

    pub fn append(
        &self,
        capability_id: &str,
        argv: &[String],
        outcome: &str,
    ) -> std::io::Result<()> {
        let mut last = self.last_hash.lock().expect("invocation log lock poisoned");

        let mut entry = InvocationEntry {
            timestamp: chrono::Utc::now().to_rfc3339(),
            capability_id: capability_id.to_string(),
            argv: argv.to_vec(),
            outcome: outcome.to_string(),
            prev_hash: last.clone(),
            hash: String::new(),
        };
        entry.hash = entry_hash(&entry);

        let line = serde_json::to_string(&entry)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        *last = entry.hash;
        Ok(())
    }
}

fn entry_hash(entry: &InvocationEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.prev_hash.as_bytes());
    hasher.update(entry.timestamp.as_bytes());
    hasher.update(entry.capability_id.as_bytes());
    for arg in &entry.argv {
        hasher.update(arg.as_bytes());
    }
    hasher.update(entry.outcome.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Walk the chain and report whether every link holds.
pub fn verify_chain(path: &Path) -> std::io::Result<bool> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e),
    };

    let mut expected_prev = GENESIS.to_string();
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(entry) = serde_json::from_str::<InvocationEntry>(line) else {
            return Ok(false);
        };
        if entry.prev_hash != expected_prev || entry.hash != entry_hash(&entry) {
            return Ok(false);
        }
        expected_prev = entry.hash;
    }
    Ok(true)
}
