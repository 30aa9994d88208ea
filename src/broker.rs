//! Top-level engine surface.
//!
//! The UI talks to [`Broker`] and nothing else: it submits execution
//! requests, asks for previews, queries the run log, and subscribes to
//! permission changes. The broker owns the control flow — validate, then
//! preflight, then (for destructive capabilities) confirm, then dispatch —
//! and guarantees that nothing is spawned and no IPC happens before the
//! client-side checks pass.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::audit::{
    writer, AuditEvent, AuditStore, AuditWriter, RunOutcome, RunQuery, RunRecord, RunStatus,
};
use crate::catalog::{Capability, Catalog, ManifestSignature, PrivilegeTier, RiskClass};
use crate::confirm::{itemize_paths, ConfirmController, Preview, PreviewItem};
use crate::error::{BrokerError, BrokerResult, ValidationError};
use crate::executor::automation::{
    AutomationBridge, AutomationExecutor, CaptureHeuristic, DefaultCaptureHeuristic,
    OsaScriptBridge,
};
use crate::executor::elevated::ElevatedExecutor;
use crate::executor::user::UserExecutor;
use crate::executor::{
    BoundArgs, CapabilityExecutor, Dispatcher, ExecContext, ExecutionRequest, ProgressEvent,
    ProgressSink,
};
use crate::helper::{client::default_socket_path, HelperClient, HelperStatus};
use crate::permissions::{
    ConsentProber, PermissionChange, PermissionGate, PermissionState, PermissionStore, Resource,
};
use crate::preflight::{self, PreflightFailed, PreflightResult, SystemProbe};

/// Synthetic capability id under which retention cleanups are audited.
const RETENTION_CAPABILITY: &str = "audit.retention";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub data_dir: PathBuf,
    pub helper_socket: PathBuf,
    pub permission_ttl: Duration,
    pub preview_ttl: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("Tuneup"),
            helper_socket: default_socket_path(),
            permission_ttl: crate::permissions::gate::DEFAULT_TTL,
            preview_ttl: crate::confirm::DEFAULT_PREVIEW_TTL,
        }
    }
}

/// A running (or just-finished) execution: the progress stream plus the
/// final record.
#[derive(Debug)]
pub struct RunHandle {
    pub correlation_id: Uuid,
    pub progress: UnboundedReceiver<ProgressEvent>,
    task: tokio::task::JoinHandle<Result<RunRecord, BrokerError>>,
}

impl RunHandle {
    pub async fn wait(self) -> Result<RunRecord, BrokerError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(BrokerError::Io(std::io::Error::other(format!(
                "execution task failed: {}",
                e
            )))),
        }
    }
}

pub struct Broker {
    catalog: Arc<Catalog>,
    gate: Arc<PermissionGate>,
    probe: Arc<dyn SystemProbe>,
    confirm: ConfirmController,
    dispatcher: Arc<Dispatcher>,
    preview_user: Arc<dyn CapabilityExecutor>,
    preview_automation: Arc<dyn CapabilityExecutor>,
    heuristic: Arc<dyn CaptureHeuristic>,
    audit_store: Arc<AuditStore>,
    audit: AuditWriter,
    helper: HelperClient,
    _audit_task: tokio::task::JoinHandle<()>,
}

impl Broker {
    /// Production wiring: real executors, the system script bridge, the
    /// helper socket from config, SQLite audit store under the data dir.
    /// Fails fast when the manifest does not validate.
    pub fn open(
        config: &BrokerConfig,
        manifest_bytes: &[u8],
        signature: Option<&ManifestSignature>,
    ) -> BrokerResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let catalog = crate::catalog::manifest::load(manifest_bytes, signature)?;

        let bridge: Arc<dyn AutomationBridge> = Arc::new(OsaScriptBridge);
        let prober = Arc::new(SystemConsentProber {
            helper: HelperClient::new(&config.helper_socket),
            bridge: bridge.clone(),
        });
        let gate = Arc::new(PermissionGate::new(
            PermissionStore::load(&config.data_dir)?,
            prober,
            config.permission_ttl,
        ));

        let audit_store = Arc::new(AuditStore::open(&config.data_dir)?);

        Ok(Self::assemble(
            catalog,
            gate,
            Arc::new(preflight::RealSystemProbe),
            Arc::new(UserExecutor::new()),
            Arc::new(ElevatedExecutor::new(HelperClient::new(
                &config.helper_socket,
            ))),
            Arc::new(AutomationExecutor::new(bridge)),
            Arc::new(DefaultCaptureHeuristic),
            audit_store,
            HelperClient::new(&config.helper_socket),
            config.preview_ttl,
        ))
    }

    /// Explicit wiring for tests and embedders.
    #[allow(clippy::too_many_arguments)]
    pub fn with_components(
        catalog: Catalog,
        gate: Arc<PermissionGate>,
        probe: Arc<dyn SystemProbe>,
        user: Arc<dyn CapabilityExecutor>,
        elevated: Arc<dyn CapabilityExecutor>,
        automation: Arc<dyn CapabilityExecutor>,
        heuristic: Arc<dyn CaptureHeuristic>,
        audit_store: Arc<AuditStore>,
        helper: HelperClient,
    ) -> Self {
        Self::assemble(
            catalog,
            gate,
            probe,
            user,
            elevated,
            automation,
            heuristic,
            audit_store,
            helper,
            crate::confirm::DEFAULT_PREVIEW_TTL,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        catalog: Catalog,
        gate: Arc<PermissionGate>,
        probe: Arc<dyn SystemProbe>,
        user: Arc<dyn CapabilityExecutor>,
        elevated: Arc<dyn CapabilityExecutor>,
        automation: Arc<dyn CapabilityExecutor>,
        heuristic: Arc<dyn CaptureHeuristic>,
        audit_store: Arc<AuditStore>,
        helper: HelperClient,
        preview_ttl: Duration,
    ) -> Self {
        let (audit, audit_future) = writer::create(audit_store.clone());
        let audit_task = tokio::spawn(audit_future);
        let dispatcher = Arc::new(Dispatcher::new(
            user.clone(),
            elevated,
            automation.clone(),
            gate.clone(),
            audit.clone(),
        ));

        Self {
            catalog: Arc::new(catalog),
            gate,
            probe,
            confirm: ConfirmController::new(preview_ttl),
            dispatcher,
            preview_user: user,
            preview_automation: automation,
            heuristic,
            audit_store,
            audit,
            helper,
            _audit_task: audit_task,
        }
    }

    // -- catalog ------------------------------------------------------------

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    // -- permissions --------------------------------------------------------

    pub async fn permission_status(&self, resource: &Resource) -> PermissionState {
        self.gate.status(resource).await
    }

    pub async fn request_permission(&self, resource: &Resource) -> PermissionState {
        self.gate.request(resource).await
    }

    pub fn permission_remediation(&self, resource: &Resource) -> Vec<String> {
        self.gate.remediation(resource)
    }

    pub fn subscribe_permissions(&self) -> tokio::sync::broadcast::Receiver<PermissionChange> {
        self.gate.subscribe()
    }

    pub async fn helper_status(&self) -> HelperStatus {
        self.helper.status().await
    }

    // -- preflight ----------------------------------------------------------

    /// Full readiness picture for the UI: catalog-declared checks plus the
    /// backend's own (helper installed, bridge reachable).
    pub async fn preflight(&self, capability_id: &str) -> BrokerResult<PreflightResult> {
        let capability = self.lookup(capability_id)?;
        let declared =
            preflight::evaluate(capability, self.probe.as_ref(), &self.gate).await;
        let backend = self.dispatcher.can_execute(capability).await;
        Ok(merge_results(declared, backend))
    }

    // -- preview / confirm --------------------------------------------------

    /// Build and register a dry-run preview for a destructive capability.
    pub async fn preview(&self, request: &ExecutionRequest) -> BrokerResult<Preview> {
        let capability = self.lookup(&request.capability_id)?;
        let args = BoundArgs::bind(capability, &request.arguments)?;

        let items = self.build_preview_items(capability, &args).await?;
        let preview = Preview::new(&capability.id, items, self.confirm.ttl());
        self.confirm.register(&preview);
        log::info!(
            "Preview {} for {}: {} item(s), ~{} bytes",
            preview.token,
            capability.id,
            preview.item_count,
            preview.estimated_bytes
        );
        Ok(preview)
    }

    async fn build_preview_items(
        &self,
        capability: &Capability,
        args: &BoundArgs,
    ) -> BrokerResult<Vec<PreviewItem>> {
        let mark_heavy = capability.tier == PrivilegeTier::Automation;

        if let Some(template) = &capability.preview {
            // Run the declared side-effect-free preview command and turn its
            // output into items.
            let mut preview_cap = capability.clone();
            preview_cap.command = template.clone();
            let runner = match capability.tier {
                PrivilegeTier::Automation => &self.preview_automation,
                _ => &self.preview_user,
            };
            let outcome = runner
                .execute(
                    &preview_cap,
                    args,
                    &ExecContext::detached(Uuid::new_v4()),
                )
                .await
                .map_err(BrokerError::Executor)?;

            let items = match capability.output {
                crate::catalog::OutputParser::ByteCount => {
                    let (parsed, _) =
                        crate::executor::parse_output(capability.output, &outcome.stdout);
                    let bytes = parsed
                        .as_ref()
                        .and_then(|v| v.get("bytes"))
                        .and_then(|v| v.as_u64())
                        // du -sk reports kibibytes.
                        .map(|kb| kb * 1024);
                    vec![PreviewItem {
                        label: "estimated space to reclaim".to_string(),
                        bytes,
                        heavy: false,
                    }]
                }
                _ => outcome
                    .stdout
                    .lines()
                    .filter(|l| !l.trim().is_empty())
                    .map(|line| PreviewItem {
                        label: line.to_string(),
                        bytes: None,
                        heavy: mark_heavy && self.heuristic.is_heavy(line),
                    })
                    .collect(),
            };
            return Ok(items);
        }

        // No preview template: itemize the filesystem targets directly.
        Ok(itemize_paths(&args.paths()))
    }

    // -- execution ----------------------------------------------------------

    /// Validate, preflight, confirm-check, and dispatch a request. The
    /// returned handle exposes the progress stream and resolves to the
    /// terminal run record. Validation, preflight, and confirmation errors
    /// return immediately — nothing has been spawned and nothing audited.
    pub async fn submit(&self, request: ExecutionRequest) -> BrokerResult<RunHandle> {
        let capability = self.lookup(&request.capability_id)?.clone();
        let args = BoundArgs::bind(&capability, &request.arguments)?;

        let preflight_result =
            preflight::evaluate(&capability, self.probe.as_ref(), &self.gate).await;
        if !preflight_result.can_execute {
            return Err(BrokerError::Preflight(PreflightFailed {
                capability_id: capability.id.clone(),
                result: preflight_result,
            }));
        }

        if capability.risk == RiskClass::Destructive {
            self.confirm
                .validate_and_consume(&capability.id, request.confirm_token)?;
        }

        let (progress, progress_rx) = ProgressSink::channel();
        let dispatcher = self.dispatcher.clone();
        let correlation_id = request.correlation_id;
        let task = tokio::spawn(async move {
            dispatcher
                .dispatch(&capability, &args, correlation_id, progress)
                .await
        });

        Ok(RunHandle {
            correlation_id,
            progress: progress_rx,
            task,
        })
    }

    /// Signal cancellation of an in-flight execution.
    pub fn cancel(&self, correlation_id: &Uuid) -> bool {
        self.dispatcher.cancel(correlation_id)
    }

    // -- audit --------------------------------------------------------------

    pub fn run(&self, correlation_id: &Uuid) -> BrokerResult<Option<RunRecord>> {
        Ok(self.audit_store.get(correlation_id)?)
    }

    pub fn runs(&self, query: &RunQuery) -> BrokerResult<Vec<RunRecord>> {
        Ok(self.audit_store.query(query)?)
    }

    pub fn export_runs(&self, query: &RunQuery) -> BrokerResult<String> {
        Ok(self.audit_store.export_json(query)?)
    }

    /// Delete terminal run records older than `retain`. The cleanup itself
    /// is recorded in the log it just pruned.
    pub fn cleanup_runs(&self, retain: Duration) -> BrokerResult<usize> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(retain).unwrap_or_else(|_| chrono::Duration::zero());
        let deleted = self.audit_store.purge_older_than(cutoff)?;

        let correlation_id = Uuid::new_v4();
        self.audit.record(AuditEvent::Begin(RunRecord::begin(
            correlation_id,
            RETENTION_CAPABILITY,
            PrivilegeTier::User,
        )));
        self.audit.record(AuditEvent::Finish {
            correlation_id,
            outcome: RunOutcome {
                parsed: Some(serde_json::json!({
                    "deleted": deleted,
                    "cutoff": cutoff.to_rfc3339(),
                })),
                ..RunOutcome::terminal(RunStatus::Success)
            },
        });
        log::info!("Retention cleanup removed {} run record(s)", deleted);
        Ok(deleted)
    }

    fn lookup(&self, capability_id: &str) -> Result<&Capability, ValidationError> {
        self.catalog
            .lookup(capability_id)
            .ok_or_else(|| ValidationError::UnknownCapability(capability_id.to_string()))
    }
}

fn merge_results(mut a: PreflightResult, b: PreflightResult) -> PreflightResult {
    a.can_execute = a.can_execute && b.can_execute;
    a.failed.extend(b.failed);
    a.remediation.extend(b.remediation);
    a
}

/// The embedded release manifest. Shipping builds verify its detached
/// signature from the application bundle before trusting it.
pub fn bundled_manifest() -> &'static [u8] {
    include_bytes!("../manifest/capabilities.json")
}

// ---------------------------------------------------------------------------
// SystemConsentProber — composes the real consent probes
// ---------------------------------------------------------------------------

/// Probes the OS for the actual consent state of each resource: a ping for
/// the helper, a no-op Apple event for automation targets, a test read of a
/// consent-protected location for Full Disk Access.
struct SystemConsentProber {
    helper: HelperClient,
    bridge: Arc<dyn AutomationBridge>,
}

#[async_trait]
impl ConsentProber for SystemConsentProber {
    async fn probe(&self, resource: &Resource) -> PermissionState {
        match resource {
            Resource::ElevatedHelper => match self.helper.status().await {
                HelperStatus::UpToDate { .. } => PermissionState::Granted,
                HelperStatus::NotInstalled | HelperStatus::Outdated { .. } => {
                    PermissionState::NotDetermined
                }
                HelperStatus::Unreachable { .. } => PermissionState::Denied,
            },
            Resource::Automation(bundle_id) => match self.bridge.probe(bundle_id).await {
                Ok(()) => PermissionState::Granted,
                Err(crate::executor::AutomationError::PermissionDenied(_)) => {
                    PermissionState::Denied
                }
                Err(_) => PermissionState::NotDetermined,
            },
            Resource::FullDiskAccess => {
                // Readable only with the Full Disk Access grant.
                let probe_path = dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("/"))
                    .join("Library/Safari");
                match tokio::fs::read_dir(&probe_path).await {
                    Ok(_) => PermissionState::Granted,
                    Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                        PermissionState::Denied
                    }
                    Err(_) => PermissionState::NotDetermined,
                }
            }
        }
    }

    async fn request(&self, resource: &Resource) -> PermissionState {
        // For automation targets the probe itself raises the system consent
        // dialog on first use. Helper installation and Full Disk Access are
        // interactive flows owned by the UI; re-probing reports whatever the
        // user decided there.
        self.probe(resource).await
    }
}
