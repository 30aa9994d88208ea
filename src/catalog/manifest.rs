//! Manifest loading and validation.
//!
//! The manifest is validated in four passes, all of which must succeed before
//! any capability becomes visible to the rest of the engine:
//!
//! 1. detached Ed25519 signature over the sha256 of the raw bytes,
//! 2. JSON Schema validation of the document shape,
//! 3. serde deserialization into typed definitions,
//! 4. semantic checks — duplicate ids, shell metacharacters, slot pattern
//!    compilation, and agreement with the executor layer's static allowlist.
//!
//! A failure in any pass is fatal to startup; the engine never serves a
//! partially loaded catalog.

use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

use super::{Capability, Catalog, CommandTemplate, PrivilegeTier, SlotKind, TemplateArg};
use crate::executor::allowlist;

const MANIFEST_SCHEMA: &str = include_str!("manifest.schema.json");

/// Characters that must never appear in a program path or a literal argument.
/// Templates are executed directly, never through a shell, so none of these
/// have a legitimate use in catalog data.
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '>', '<', '(', ')', '{', '}', '*', '?', '~', '\n', '\r', '"', '\'',
    '\\',
];

#[derive(Debug, thiserror::Error)]
pub enum CatalogLoadError {
    #[error("Manifest signature invalid: {0}")]
    BadSignature(String),

    #[error("Manifest is not valid JSON: {0}")]
    Malformed(String),

    #[error("Manifest schema violation: {0}")]
    Schema(String),

    #[error("Duplicate capability id: {0}")]
    DuplicateId(String),

    #[error("Capability {id}: program '{program}' is not in the {tier} executor allowlist")]
    ProgramNotAllowlisted {
        id: String,
        program: String,
        tier: &'static str,
    },

    #[error("Capability {id}: shell metacharacter in template: {offending}")]
    ShellMetacharacter { id: String, offending: String },

    #[error("Capability {id}: {reason}")]
    Invalid { id: String, reason: String },
}

/// A detached signature over the manifest bytes, produced by the release
/// pipeline with the publisher's signing key.
#[derive(Debug, Clone)]
pub struct ManifestSignature {
    /// Base64-encoded Ed25519 signature of sha256(manifest bytes).
    pub signature: String,
    /// Base64-encoded Ed25519 public key of the publisher.
    pub public_key: String,
}

#[derive(serde::Deserialize)]
struct ManifestDoc {
    manifest_version: u32,
    capabilities: Vec<Capability>,
}

/// Load and fully validate a manifest. `signature` is required for bundled
/// manifests; passing `None` is reserved for development builds and tests.
pub fn load(bytes: &[u8], signature: Option<&ManifestSignature>) -> Result<Catalog, CatalogLoadError> {
    if let Some(sig) = signature {
        verify_signature(bytes, sig)?;
    }

    let doc: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| CatalogLoadError::Malformed(e.to_string()))?;

    validate_schema(&doc)?;

    let manifest: ManifestDoc = serde_json::from_value(doc)
        .map_err(|e| CatalogLoadError::Malformed(e.to_string()))?;

    let mut seen = std::collections::HashSet::new();
    for cap in &manifest.capabilities {
        if !seen.insert(cap.id.clone()) {
            return Err(CatalogLoadError::DuplicateId(cap.id.clone()));
        }
        validate_capability(cap)?;
    }

    log::info!(
        "Capability catalog loaded: {} capabilities, manifest version {}",
        manifest.capabilities.len(),
        manifest.manifest_version
    );

    Ok(Catalog::from_validated(
        manifest.manifest_version,
        manifest.capabilities,
    ))
}

fn verify_signature(bytes: &[u8], sig: &ManifestSignature) -> Result<(), CatalogLoadError> {
    let b64 = base64::engine::general_purpose::STANDARD;

    let key_bytes = b64
        .decode(&sig.public_key)
        .map_err(|e| CatalogLoadError::BadSignature(format!("public key not base64: {}", e)))?;
    let key_arr: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CatalogLoadError::BadSignature("public key must be 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key_arr)
        .map_err(|e| CatalogLoadError::BadSignature(format!("invalid public key: {}", e)))?;

    let sig_bytes = b64
        .decode(&sig.signature)
        .map_err(|e| CatalogLoadError::BadSignature(format!("signature not base64: {}", e)))?;
    let signature = Signature::from_slice(&sig_bytes)
        .map_err(|e| CatalogLoadError::BadSignature(format!("invalid signature: {}", e)))?;

    let digest = Sha256::digest(bytes);
    key.verify(&digest, &signature)
        .map_err(|e| CatalogLoadError::BadSignature(format!("verification failed: {}", e)))
}

fn validate_schema(doc: &serde_json::Value) -> Result<(), CatalogLoadError> {
    let schema: serde_json::Value = serde_json::from_str(MANIFEST_SCHEMA)
        .expect("embedded manifest schema is valid JSON");
    let validator = jsonschema::validator_for(&schema)
        .expect("embedded manifest schema compiles");

    let errors: Vec<String> = validator
        .iter_errors(doc)
        .map(|e| format!("{}: {}", e.instance_path(), e))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(CatalogLoadError::Schema(errors.join("; ")))
    }
}

fn validate_capability(cap: &Capability) -> Result<(), CatalogLoadError> {
    validate_template(&cap.id, &cap.command)?;
    if let Some(preview) = &cap.preview {
        validate_template(&cap.id, preview)?;
    }

    // The catalog and the executor allowlist are two independent lists.
    // Agreement is checked here, at load time — never deferred to execution.
    if !allowlist::is_allowed(cap.tier, &cap.command.program) {
        return Err(CatalogLoadError::ProgramNotAllowlisted {
            id: cap.id.clone(),
            program: cap.command.program.display().to_string(),
            tier: cap.tier.as_str(),
        });
    }
    // Previews are side-effect-free; they run as the invoking user except
    // for automation capabilities, whose previews go through the same
    // consent-gated bridge. Validate against the matching list.
    if let Some(preview) = &cap.preview {
        let preview_tier = match cap.tier {
            PrivilegeTier::Automation => PrivilegeTier::Automation,
            _ => PrivilegeTier::User,
        };
        if !allowlist::is_allowed(preview_tier, &preview.program) {
            return Err(CatalogLoadError::ProgramNotAllowlisted {
                id: cap.id.clone(),
                program: preview.program.display().to_string(),
                tier: preview_tier.as_str(),
            });
        }
    }

    match cap.tier {
        PrivilegeTier::Automation => {
            if cap.automation_target.is_none() {
                return Err(CatalogLoadError::Invalid {
                    id: cap.id.clone(),
                    reason: "automation capabilities must declare automation_target".into(),
                });
            }
        }
        _ => {
            if cap.automation_target.is_some() {
                return Err(CatalogLoadError::Invalid {
                    id: cap.id.clone(),
                    reason: "automation_target is only valid for automation tier".into(),
                });
            }
        }
    }

    Ok(())
}

fn validate_template(id: &str, template: &CommandTemplate) -> Result<(), CatalogLoadError> {
    let program = template.program.to_string_lossy();
    if !template.program.is_absolute() {
        return Err(CatalogLoadError::Invalid {
            id: id.to_string(),
            reason: format!("program '{}' must be an absolute path", program),
        });
    }
    check_metacharacters(id, &program)?;

    let mut slot_names = std::collections::HashSet::new();
    for arg in &template.args {
        match arg {
            TemplateArg::Literal(lit) => check_metacharacters(id, lit)?,
            TemplateArg::Slot(slot) => {
                if !slot_names.insert(slot.name.clone()) {
                    return Err(CatalogLoadError::Invalid {
                        id: id.to_string(),
                        reason: format!("duplicate slot name '{}'", slot.name),
                    });
                }
                validate_slot(id, &slot.name, &slot.kind)?;
            }
        }
    }
    Ok(())
}

fn validate_slot(id: &str, name: &str, kind: &SlotKind) -> Result<(), CatalogLoadError> {
    match kind {
        SlotKind::String { pattern, max_len } => {
            if *max_len == 0 {
                return Err(CatalogLoadError::Invalid {
                    id: id.to_string(),
                    reason: format!("slot '{}': max_len must be positive", name),
                });
            }
            if let Some(p) = pattern {
                regex::Regex::new(p).map_err(|e| CatalogLoadError::Invalid {
                    id: id.to_string(),
                    reason: format!("slot '{}': invalid pattern: {}", name, e),
                })?;
            }
        }
        SlotKind::Int { min, max } => {
            if min > max {
                return Err(CatalogLoadError::Invalid {
                    id: id.to_string(),
                    reason: format!("slot '{}': min > max", name),
                });
            }
        }
        SlotKind::Path { within, .. } => {
            if let Some(root) = within {
                if !root.is_absolute() {
                    return Err(CatalogLoadError::Invalid {
                        id: id.to_string(),
                        reason: format!("slot '{}': 'within' must be absolute", name),
                    });
                }
            }
        }
        SlotKind::Choice { options } => {
            for opt in options {
                check_metacharacters(id, opt)?;
            }
        }
    }
    Ok(())
}

fn check_metacharacters(id: &str, value: &str) -> Result<(), CatalogLoadError> {
    if value.chars().any(|c| SHELL_METACHARACTERS.contains(&c)) {
        return Err(CatalogLoadError::ShellMetacharacter {
            id: id.to_string(),
            offending: value.to_string(),
        });
    }
    Ok(())
}
