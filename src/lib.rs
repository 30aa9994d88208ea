//! Tuneup's capability execution engine.
//!
//! The UI layer never runs anything itself: it submits requests naming a
//! capability from the signed catalog, and this crate routes each one
//! through preflight checks, the permission gate, the destructive-operation
//! confirm flow, and one of three privilege-tier executors, writing every
//! attempt to an append-only run log.

pub mod audit;
pub mod broker;
pub mod catalog;
pub mod confirm;
pub mod error;
pub mod executor;
pub mod helper;
pub mod permissions;
pub mod preflight;

pub use broker::{bundled_manifest, Broker, BrokerConfig, RunHandle};
pub use catalog::{Capability, Catalog, ManifestSignature, PrivilegeTier, RiskClass};
pub use error::{BrokerError, BrokerResult, ValidationError};
pub use executor::{ExecutionRequest, ProgressEvent};
pub use permissions::{PermissionState, Resource};
