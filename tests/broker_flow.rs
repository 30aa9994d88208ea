//! End-to-end broker scenarios against mock and real executors.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use tuneup_broker::audit::{AuditStore, RunQuery, RunStatus};
use tuneup_broker::broker::Broker;
use tuneup_broker::catalog::manifest;
use tuneup_broker::confirm::ConfirmError;
use tuneup_broker::error::{BrokerError, ValidationError};
use tuneup_broker::executor::automation::DefaultCaptureHeuristic;
use tuneup_broker::executor::elevated::ElevatedExecutor;
use tuneup_broker::executor::user::UserExecutor;
use tuneup_broker::executor::{
    BoundArgs, CapabilityExecutor, ExecContext, ExecutionOutcome, ExecutionRequest, ExecutorError,
};
use tuneup_broker::helper::HelperClient;
use tuneup_broker::permissions::{
    ConsentProber, PermissionGate, PermissionState, PermissionStore, Resource,
};
use tuneup_broker::preflight::{PreflightResult, SystemProbe};
use tuneup_broker::Capability;

// ---------------------------------------------------------------------------
// Test doubles
// ---------------------------------------------------------------------------

/// Executor spy: counts calls, optionally stalls.
struct SpyExecutor {
    calls: AtomicUsize,
    stall: Option<Duration>,
}

impl SpyExecutor {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            stall: None,
        })
    }

    fn stalled(duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            stall: Some(duration),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityExecutor for SpyExecutor {
    async fn execute(
        &self,
        _capability: &Capability,
        _args: &BoundArgs,
        ctx: &ExecContext,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(stall) = self.stall {
            tokio::select! {
                _ = tokio::time::sleep(stall) => {}
                _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
            }
        }
        Ok(ExecutionOutcome {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn can_execute(&self, _capability: &Capability) -> PreflightResult {
        PreflightResult::pass()
    }
}

/// Scripted consent prober.
struct ScriptedProber {
    states: Mutex<HashMap<String, PermissionState>>,
}

impl ScriptedProber {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            states: Mutex::new(HashMap::new()),
        })
    }

    fn set(&self, resource: &Resource, state: PermissionState) {
        self.states.lock().unwrap().insert(resource.as_str(), state);
    }
}

#[async_trait]
impl ConsentProber for ScriptedProber {
    async fn probe(&self, resource: &Resource) -> PermissionState {
        self.states
            .lock()
            .unwrap()
            .get(&resource.as_str())
            .copied()
            .unwrap_or_default()
    }

    async fn request(&self, resource: &Resource) -> PermissionState {
        self.probe(resource).await
    }
}

/// Probe where every filesystem/process condition holds.
struct AllGoodProbe;

impl SystemProbe for AllGoodProbe {
    fn path_exists(&self, _path: &Path) -> bool {
        true
    }
    fn path_writable(&self, _path: &Path) -> bool {
        true
    }
    fn app_running(&self, _bundle_id: &str) -> bool {
        true
    }
    fn free_disk_bytes(&self, _path: &Path) -> Option<u64> {
        Some(u64::MAX)
    }
}

/// Probe where nothing holds.
struct AllBadProbe;

impl SystemProbe for AllBadProbe {
    fn path_exists(&self, _path: &Path) -> bool {
        false
    }
    fn path_writable(&self, _path: &Path) -> bool {
        false
    }
    fn app_running(&self, _bundle_id: &str) -> bool {
        false
    }
    fn free_disk_bytes(&self, _path: &Path) -> Option<u64> {
        None
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn manifest_bytes(capabilities: serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "manifest_version": 1,
        "capabilities": capabilities,
    }))
    .unwrap()
}

/// A user-tier capability that really runs (`du` exists on every platform
/// the suite runs on and is in the user allowlist). `dir` keeps the run on
/// a directory the test owns.
fn du_capability_at(id: &str, dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": "Disk usage",
        "description": "Reports disk usage of a directory",
        "group": "quick",
        "tier": "user",
        "risk": "safe",
        "command": { "program": "/usr/bin/du", "args": ["-sk", dir.to_string_lossy()] },
        "output": "byte_count",
        "timeout_secs": 30
    })
}

fn du_capability(id: &str) -> serde_json::Value {
    du_capability_at(id, Path::new("/tmp"))
}

fn elevated_capability(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": "Elevated op",
        "description": "Administrator-only operation",
        "group": "deep",
        "tier": "elevated",
        "risk": "moderate",
        "command": { "program": "/usr/sbin/purge", "args": [] },
        "timeout_secs": 30
    })
}

fn automation_capability(id: &str, bundle: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": "Automation op",
        "description": "Drives an external application",
        "group": "browser",
        "tier": "automation",
        "automation_target": bundle,
        "risk": "safe",
        "command": { "program": "/usr/bin/osascript", "args": [] },
        "timeout_secs": 30
    })
}

struct Harness {
    broker: Broker,
    user: Arc<SpyExecutor>,
    elevated: Arc<SpyExecutor>,
    automation: Arc<SpyExecutor>,
    prober: Arc<ScriptedProber>,
}

fn harness(capabilities: serde_json::Value) -> Harness {
    harness_with(capabilities, Arc::new(AllGoodProbe), None, None)
}

fn harness_with(
    capabilities: serde_json::Value,
    probe: Arc<dyn SystemProbe>,
    user_override: Option<Arc<dyn CapabilityExecutor>>,
    elevated_override: Option<Arc<dyn CapabilityExecutor>>,
) -> Harness {
    let catalog = manifest::load(&manifest_bytes(capabilities), None).unwrap();
    let prober = ScriptedProber::new();
    let gate = Arc::new(PermissionGate::new(
        PermissionStore::ephemeral(),
        prober.clone(),
        Duration::ZERO,
    ));

    let user = SpyExecutor::ok();
    let elevated = SpyExecutor::ok();
    let automation = SpyExecutor::ok();

    let user_exec: Arc<dyn CapabilityExecutor> = match user_override {
        Some(executor) => executor,
        None => user.clone(),
    };
    let elevated_exec: Arc<dyn CapabilityExecutor> = match elevated_override {
        Some(executor) => executor,
        None => elevated.clone(),
    };

    let broker = Broker::with_components(
        catalog,
        gate,
        probe,
        user_exec,
        elevated_exec,
        automation.clone(),
        Arc::new(DefaultCaptureHeuristic),
        Arc::new(AuditStore::open_in_memory().unwrap()),
        HelperClient::new("/nonexistent/helper.sock"),
    );

    Harness {
        broker,
        user,
        elevated,
        automation,
        prober,
    }
}

async fn wait_for_terminal(broker: &Broker, id: &Uuid) -> tuneup_broker::audit::RunRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(record) = broker.run(id).unwrap() {
            if record.status.is_terminal() {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no terminal record for {}",
            id
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_capability_never_reaches_an_executor() {
    let fx = harness(serde_json::json!([du_capability("quick.dns.flush")]));

    let err = fx
        .broker
        .submit(ExecutionRequest::new("no.such.capability"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Validation(ValidationError::UnknownCapability(_))
    ));

    assert_eq!(fx.user.call_count(), 0);
    assert_eq!(fx.elevated.call_count(), 0);
    assert_eq!(fx.automation.call_count(), 0);
    // Nothing was audited either: the request never began executing.
    assert_eq!(fx.broker.runs(&RunQuery::default()).unwrap().len(), 0);
}

#[tokio::test]
async fn malformed_arguments_never_reach_an_executor() {
    let fx = harness(serde_json::json!([du_capability("quick.dns.flush")]));

    let err = fx
        .broker
        .submit(
            ExecutionRequest::new("quick.dns.flush")
                .with_argument("surprise", serde_json::json!("x")),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Validation(ValidationError::UnexpectedArgument(_))
    ));
    assert_eq!(fx.user.call_count(), 0);
}

#[tokio::test]
async fn preflight_failure_reports_every_failed_check() {
    let mut cap = du_capability("quick.dns.flush");
    cap["preflight"] = serde_json::json!([
        { "type": "path_exists", "path": "/gone" },
        { "type": "app_running", "bundle_id": "com.apple.Safari" },
        { "type": "min_free_disk", "path": "/", "bytes": 1 }
    ]);
    let fx = harness_with(
        serde_json::json!([cap]),
        Arc::new(AllBadProbe),
        None,
        None,
    );

    let err = fx
        .broker
        .submit(ExecutionRequest::new("quick.dns.flush"))
        .await
        .unwrap_err();
    match err {
        BrokerError::Preflight(failed) => {
            assert_eq!(failed.result.failed.len(), 3);
            assert_eq!(failed.result.remediation.len(), 3);
        }
        other => panic!("expected preflight failure, got {:?}", other),
    }
    assert_eq!(fx.user.call_count(), 0);
}

#[tokio::test]
async fn elevated_grant_is_rechecked_on_every_dispatch() {
    let fx = harness(serde_json::json!([elevated_capability("deep.system.temp")]));
    fx.prober
        .set(&Resource::ElevatedHelper, PermissionState::Granted);

    let handle = fx
        .broker
        .submit(ExecutionRequest::new("deep.system.temp"))
        .await
        .unwrap();
    let record = handle.wait().await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(fx.elevated.call_count(), 1);

    // Consent revoked from System Settings between the two requests. The
    // next dispatch re-probes (zero TTL here) and must block.
    fx.prober
        .set(&Resource::ElevatedHelper, PermissionState::Denied);
    let handle = fx
        .broker
        .submit(ExecutionRequest::new("deep.system.temp"))
        .await
        .unwrap();
    let err = handle.wait().await.unwrap_err();
    match err {
        BrokerError::Permission(denied) => {
            assert_eq!(denied.resource, Resource::ElevatedHelper);
            assert!(!denied.remediation.is_empty());
        }
        other => panic!("expected permission denial, got {:?}", other),
    }
    assert_eq!(fx.elevated.call_count(), 1);
}

#[tokio::test]
async fn concurrent_requests_for_one_capability_run_once() {
    let stalled: Arc<dyn CapabilityExecutor> = SpyExecutor::stalled(Duration::from_millis(400));
    let fx = harness_with(
        serde_json::json!([du_capability("quick.dns.flush")]),
        Arc::new(AllGoodProbe),
        Some(stalled),
        None,
    );

    let first = fx
        .broker
        .submit(ExecutionRequest::new("quick.dns.flush"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = fx
        .broker
        .submit(ExecutionRequest::new("quick.dns.flush"))
        .await
        .unwrap();
    let err = second.wait().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Executor(ExecutorError::AlreadyRunning(_))
    ));

    let record = first.wait().await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
}

#[tokio::test]
async fn destructive_round_trip_requires_a_fresh_matching_token() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("cache");
    std::fs::create_dir(&victim).unwrap();
    std::fs::write(victim.join("junk.dat"), b"0123456789").unwrap();

    let cap = serde_json::json!({
        "id": "user.caches.clean",
        "title": "Clean Application Caches",
        "description": "Removes a cache directory",
        "group": "deep",
        "tier": "user",
        "risk": "destructive",
        "command": {
            "program": "/bin/rm",
            "args": ["-rf", { "name": "cache_dir", "type": "path", "must_exist": true }]
        },
        "timeout_secs": 30
    });
    let real_user: Arc<dyn CapabilityExecutor> = Arc::new(UserExecutor::new());
    let fx = harness_with(
        serde_json::json!([cap]),
        Arc::new(AllGoodProbe),
        Some(real_user),
        None,
    );

    let request = || {
        ExecutionRequest::new("user.caches.clean").with_argument(
            "cache_dir",
            serde_json::json!(victim.to_string_lossy()),
        )
    };

    // 1. No token: rejected before anything runs.
    let err = fx.broker.submit(request()).await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Confirm(ConfirmError::ConfirmationRequired(_))
    ));
    assert!(victim.exists());

    // 2. A superseded preview token: rejected.
    let stale = fx.broker.preview(&request()).await.unwrap();
    assert!(stale.item_count >= 1);
    assert!(stale.estimated_bytes >= 10);
    let fresh = fx.broker.preview(&request()).await.unwrap();

    let err = fx
        .broker
        .submit(request().with_confirm_token(stale.token))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Confirm(ConfirmError::PreviewStale(_))
    ));
    assert!(victim.exists());

    // 3. The fresh token: proceeds and actually deletes.
    let handle = fx
        .broker
        .submit(request().with_confirm_token(fresh.token))
        .await
        .unwrap();
    let record = handle.wait().await.unwrap();
    assert_eq!(record.status, RunStatus::Success);
    assert!(!victim.exists());
}

#[tokio::test]
async fn user_tier_end_to_end_success() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"payload").unwrap();
    let real_user: Arc<dyn CapabilityExecutor> = Arc::new(UserExecutor::new());
    let fx = harness_with(
        serde_json::json!([du_capability_at("quick.dns.flush", dir.path())]),
        Arc::new(AllGoodProbe),
        Some(real_user),
        None,
    );

    let request = ExecutionRequest::new("quick.dns.flush");
    let id = request.correlation_id;
    let handle = fx.broker.submit(request).await.unwrap();
    let record = handle.wait().await.unwrap();

    assert_eq!(record.status, RunStatus::Success);
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.correlation_id, id);
    // du -sk output parses into a byte count.
    assert!(record.parsed.unwrap().get("bytes").is_some());

    // The same terminal record lands in the durable log.
    let stored = wait_for_terminal(&fx.broker, &id).await;
    assert_eq!(stored.status, RunStatus::Success);
    assert_eq!(stored.exit_code, Some(0));
}

#[tokio::test]
async fn elevated_without_helper_fails_before_any_spawn() {
    let real_elevated: Arc<dyn CapabilityExecutor> = Arc::new(ElevatedExecutor::new(
        HelperClient::new("/nonexistent/helper.sock"),
    ));
    let fx = harness_with(
        serde_json::json!([elevated_capability("deep.system.temp")]),
        Arc::new(AllGoodProbe),
        None,
        Some(real_elevated),
    );
    fx.prober
        .set(&Resource::ElevatedHelper, PermissionState::Granted);

    let request = ExecutionRequest::new("deep.system.temp");
    let id = request.correlation_id;
    let handle = fx.broker.submit(request).await.unwrap();
    let err = handle.wait().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Executor(ExecutorError::HelperNotInstalled)
    ));

    let record = wait_for_terminal(&fx.broker, &id).await;
    assert_eq!(record.status, RunStatus::Failed);
    assert!(record.exit_code.is_none());
}

#[tokio::test]
async fn automation_denied_short_circuits_with_remediation() {
    let fx = harness(serde_json::json!([automation_capability(
        "browser.tabs.list",
        "com.apple.Safari"
    )]));
    fx.prober.set(
        &Resource::Automation("com.apple.Safari".into()),
        PermissionState::Denied,
    );

    let request = ExecutionRequest::new("browser.tabs.list");
    let id = request.correlation_id;
    let handle = fx.broker.submit(request).await.unwrap();
    let err = handle.wait().await.unwrap_err();

    match err {
        BrokerError::Permission(denied) => {
            assert_eq!(denied.state, PermissionState::Denied);
            assert!(denied
                .remediation
                .iter()
                .any(|s| s.contains("com.apple.Safari")));
        }
        other => panic!("expected permission denial, got {:?}", other),
    }
    // Zero scripting calls.
    assert_eq!(fx.automation.call_count(), 0);

    let record = wait_for_terminal(&fx.broker, &id).await;
    assert_eq!(record.status, RunStatus::PermissionDenied);
}

#[tokio::test]
async fn cancellation_produces_a_cancelled_record() {
    let stalled: Arc<dyn CapabilityExecutor> = SpyExecutor::stalled(Duration::from_secs(30));
    let fx = harness_with(
        serde_json::json!([du_capability("quick.dns.flush")]),
        Arc::new(AllGoodProbe),
        Some(stalled),
        None,
    );

    let request = ExecutionRequest::new("quick.dns.flush");
    let id = request.correlation_id;
    let handle = fx.broker.submit(request).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(fx.broker.cancel(&id));

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(
        err,
        BrokerError::Executor(ExecutorError::Cancelled)
    ));
    let record = wait_for_terminal(&fx.broker, &id).await;
    assert_eq!(record.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn retention_cleanup_is_itself_audited() {
    let dir = tempfile::tempdir().unwrap();
    let real_user: Arc<dyn CapabilityExecutor> = Arc::new(UserExecutor::new());
    let fx = harness_with(
        serde_json::json!([du_capability_at("quick.dns.flush", dir.path())]),
        Arc::new(AllGoodProbe),
        Some(real_user),
        None,
    );

    let request = ExecutionRequest::new("quick.dns.flush");
    let id = request.correlation_id;
    fx.broker.submit(request).await.unwrap().wait().await.unwrap();
    wait_for_terminal(&fx.broker, &id).await;

    // Everything so far is younger than the cutoff: nothing deleted, but
    // the cleanup run still lands in the log.
    let deleted = fx.broker.cleanup_runs(Duration::from_secs(3600)).unwrap();
    assert_eq!(deleted, 0);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let cleanup_runs = fx
            .broker
            .runs(&RunQuery {
                capability_id: Some("audit.retention".into()),
                ..Default::default()
            })
            .unwrap();
        if cleanup_runs
            .iter()
            .any(|r| r.status == RunStatus::Success)
        {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "cleanup not audited");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn progress_streams_reach_the_caller() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("data.txt"), b"payload").unwrap();
    let cap = serde_json::json!({
        "id": "quick.find.tmp",
        "title": "Measure a directory",
        "description": "Reports directory size line by line",
        "group": "quick",
        "tier": "user",
        "risk": "safe",
        "command": { "program": "/usr/bin/du", "args": ["-sk", dir.path().to_string_lossy()] },
        "output": "lines",
        "timeout_secs": 30
    });
    let real_user: Arc<dyn CapabilityExecutor> = Arc::new(UserExecutor::new());
    let fx = harness_with(
        serde_json::json!([cap]),
        Arc::new(AllGoodProbe),
        Some(real_user),
        None,
    );

    let mut handle = fx
        .broker
        .submit(ExecutionRequest::new("quick.find.tmp"))
        .await
        .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(5), handle.progress.recv())
        .await
        .expect("no progress before deadline");
    assert!(matches!(
        event,
        Some(tuneup_broker::ProgressEvent::Stdout { .. })
    ));
    handle.wait().await.unwrap();
}
