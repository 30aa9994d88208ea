use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    parse_output, BoundArgs, CapabilityExecutor, ExecContext, ExecutorError, ProgressSink,
};
use crate::audit::{AuditEvent, AuditWriter, RunOutcome, RunRecord, RunStatus};
use crate::catalog::{Capability, PrivilegeTier};
use crate::error::BrokerError;
use crate::permissions::{PermissionGate, PermissionState, Resource};

/// Slack added on top of a capability's own timeout for the dispatch-level
/// timer, so a backend that enforces its own limit gets to report first and
/// a hung backend still cannot wedge the queue.
const DISPATCH_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// Routes validated requests to exactly one backend and owns the execution
/// lifecycle: the permission re-check at the moment of dispatch, the
/// one-run-per-capability guarantee, the independent timeout, cancellation,
/// and the begin/finish audit writes. Every dispatched request produces a
/// terminal run record, whatever the backend does.
pub struct Dispatcher {
    user: Arc<dyn CapabilityExecutor>,
    elevated: Arc<dyn CapabilityExecutor>,
    automation: Arc<dyn CapabilityExecutor>,
    gate: Arc<PermissionGate>,
    audit: AuditWriter,
    in_flight: Arc<Mutex<HashSet<String>>>,
    active: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Dispatcher {
    pub fn new(
        user: Arc<dyn CapabilityExecutor>,
        elevated: Arc<dyn CapabilityExecutor>,
        automation: Arc<dyn CapabilityExecutor>,
        gate: Arc<PermissionGate>,
        audit: AuditWriter,
    ) -> Self {
        Self {
            user,
            elevated,
            automation,
            gate,
            audit,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn backend(&self, tier: PrivilegeTier) -> &Arc<dyn CapabilityExecutor> {
        match tier {
            PrivilegeTier::User => &self.user,
            PrivilegeTier::Elevated => &self.elevated,
            PrivilegeTier::Automation => &self.automation,
        }
    }

    /// Backend readiness for a capability (helper installed, bridge
    /// reachable), distinct from catalog-declared preflight checks.
    pub async fn can_execute(&self, capability: &Capability) -> crate::preflight::PreflightResult {
        self.backend(capability.tier).can_execute(capability).await
    }

    /// Resources whose grant must hold at the moment of dispatch.
    fn required_resources(capability: &Capability) -> Vec<Resource> {
        let mut resources = Vec::new();
        match capability.tier {
            PrivilegeTier::Elevated => resources.push(Resource::ElevatedHelper),
            PrivilegeTier::Automation => {
                if let Some(target) = &capability.automation_target {
                    resources.push(Resource::Automation(target.clone()));
                }
            }
            PrivilegeTier::User => {}
        }
        if capability.requires_full_disk {
            resources.push(Resource::FullDiskAccess);
        }
        resources
    }

    /// Cancel an in-flight execution by correlation id. Returns whether an
    /// execution was actually signalled.
    pub fn cancel(&self, correlation_id: &Uuid) -> bool {
        let active = self.active.lock().expect("active map lock poisoned");
        match active.get(correlation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a validated, preflighted, (where required) confirmed request.
    ///
    /// On success the terminal run record is returned; on failure the error
    /// is returned and the same terminal record has been written to the
    /// audit log.
    pub async fn dispatch(
        &self,
        capability: &Capability,
        args: &BoundArgs,
        correlation_id: Uuid,
        progress: ProgressSink,
    ) -> Result<RunRecord, BrokerError> {
        // Grants are re-checked now, not when the session last looked. A
        // revocation from System Settings between two requests must block
        // the second one here.
        for resource in Self::required_resources(capability) {
            let state = self.gate.status(&resource).await;
            if state != PermissionState::Granted {
                let record = RunRecord::begin(correlation_id, &capability.id, capability.tier);
                self.audit.record(AuditEvent::Begin(record));
                self.audit.record(AuditEvent::Finish {
                    correlation_id,
                    outcome: RunOutcome {
                        failure: Some(format!(
                            "permission for {} is {}",
                            resource,
                            state.as_str()
                        )),
                        ..RunOutcome::terminal(RunStatus::PermissionDenied)
                    },
                });
                return Err(BrokerError::Permission(self.gate.denied(&resource, state)));
            }
        }

        // At most one in-flight execution per capability id.
        let _guard = match InFlightGuard::try_acquire(&self.in_flight, &capability.id) {
            Some(guard) => guard,
            None => {
                return Err(BrokerError::Executor(ExecutorError::AlreadyRunning(
                    capability.id.clone(),
                )))
            }
        };

        let cancel = CancellationToken::new();
        self.active
            .lock()
            .expect("active map lock poisoned")
            .insert(correlation_id, cancel.clone());
        let _active_guard = ActiveGuard {
            map: self.active.clone(),
            id: correlation_id,
        };

        let mut record = RunRecord::begin(correlation_id, &capability.id, capability.tier);
        self.audit.record(AuditEvent::Begin(record.clone()));
        log::info!(
            "Dispatching {} ({} tier) as {}",
            capability.id,
            capability.tier.as_str(),
            correlation_id
        );

        let ctx = ExecContext {
            correlation_id,
            progress,
            cancel: cancel.clone(),
        };
        let backend = self.backend(capability.tier);

        // The dispatch timer is independent of the backend's own timeout
        // enforcement: a wedged backend is cancelled and reported as a
        // timeout rather than holding the per-capability slot forever.
        let deadline = capability.timeout() + DISPATCH_TIMEOUT_GRACE;
        let result = match tokio::time::timeout(deadline, backend.execute(capability, args, &ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(ExecutorError::Timeout)
            }
        };

        let (outcome, error) = match result {
            Ok(raw) => {
                let (parsed, complete) = parse_output(capability.output, &raw.stdout);
                let status = if complete {
                    RunStatus::Success
                } else {
                    RunStatus::PartialSuccess
                };
                (
                    RunOutcome {
                        status,
                        finished_at: chrono::Utc::now(),
                        exit_code: Some(raw.exit_code),
                        stdout: Some(raw.stdout),
                        stderr: Some(raw.stderr),
                        parsed,
                        failure: None,
                    },
                    None,
                )
            }
            Err(err) => {
                let status = match &err {
                    ExecutorError::Timeout => RunStatus::Timeout,
                    ExecutorError::Cancelled => RunStatus::Cancelled,
                    _ => RunStatus::Failed,
                };
                let (exit_code, stdout, stderr) = match &err {
                    ExecutorError::CommandFailed {
                        exit_code,
                        stdout,
                        stderr,
                    } => (Some(*exit_code), Some(stdout.clone()), Some(stderr.clone())),
                    _ => (None, None, None),
                };
                (
                    RunOutcome {
                        status,
                        finished_at: chrono::Utc::now(),
                        exit_code,
                        stdout,
                        stderr,
                        parsed: None,
                        failure: Some(err.to_string()),
                    },
                    Some(err),
                )
            }
        };

        self.audit.record(AuditEvent::Finish {
            correlation_id,
            outcome: outcome.clone(),
        });
        apply_outcome(&mut record, outcome);
        log::info!(
            "{} finished as {} ({})",
            capability.id,
            record.status.as_str(),
            correlation_id
        );

        match error {
            None => Ok(record),
            Some(err) => Err(BrokerError::Executor(err)),
        }
    }
}

fn apply_outcome(record: &mut RunRecord, outcome: RunOutcome) {
    record.status = outcome.status;
    record.finished_at = Some(outcome.finished_at);
    record.exit_code = outcome.exit_code;
    record.stdout_bytes = outcome.stdout.as_ref().map(|s| s.len() as u64).unwrap_or(0);
    record.stderr_bytes = outcome.stderr.as_ref().map(|s| s.len() as u64).unwrap_or(0);
    record.stdout = outcome.stdout;
    record.stderr = outcome.stderr;
    record.parsed = outcome.parsed;
    record.failure = outcome.failure;
}

/// Releases the per-capability slot on drop, whatever path the dispatch
/// takes out of scope.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    id: String,
}

impl InFlightGuard {
    fn try_acquire(set: &Arc<Mutex<HashSet<String>>>, id: &str) -> Option<Self> {
        let mut in_flight = set.lock().expect("in-flight set lock poisoned");
        if in_flight.insert(id.to_string()) {
            Some(Self {
                set: set.clone(),
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(&self.id);
    }
}

struct ActiveGuard {
    map: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    id: Uuid,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.map
            .lock()
            .expect("active map lock poisoned")
            .remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::catalog::{CommandTemplate, OutputParser, RiskClass, UiHints};
    use crate::executor::ExecutionOutcome;
    use crate::permissions::gate::mock::MockConsentProber;
    use crate::permissions::PermissionStore;
    use crate::preflight::PreflightResult;

    /// Executor spy: counts invocations, optionally stalls or fails.
    struct SpyExecutor {
        calls: AtomicUsize,
        stall: Option<Duration>,
        fail_with: Mutex<Option<ExecutorError>>,
        stdout: String,
    }

    impl SpyExecutor {
        fn ok(stdout: &str) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                stall: None,
                fail_with: Mutex::new(None),
                stdout: stdout.to_string(),
            }
        }

        fn stalled(duration: Duration) -> Self {
            Self {
                stall: Some(duration),
                ..Self::ok("")
            }
        }

        fn failing(err: ExecutorError) -> Self {
            Self {
                fail_with: Mutex::new(Some(err)),
                ..Self::ok("")
            }
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
            if let Some(err) = self.fail_with.lock().unwrap().take() {
                return Err(err);
            }
            if let Some(stall) = self.stall {
                tokio::select! {
                    _ = tokio::time::sleep(stall) => {}
                    _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
                }
            }
            Ok(ExecutionOutcome {
                exit_code: 0,
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }

        async fn can_execute(&self, _capability: &Capability) -> PreflightResult {
            PreflightResult::pass()
        }
    }

    fn capability(id: &str, tier: PrivilegeTier) -> Capability {
        Capability {
            id: id.into(),
            title: "Test".into(),
            description: "Test".into(),
            group: "test".into(),
            tier,
            requires_full_disk: false,
            risk: RiskClass::Safe,
            command: CommandTemplate {
                program: "/usr/bin/true".into(),
                args: vec![],
            },
            preview: None,
            output: OutputParser::None,
            preflight: vec![],
            timeout_secs: 1,
            ui: UiHints::default(),
            automation_target: if tier == PrivilegeTier::Automation {
                Some("com.apple.Safari".into())
            } else {
                None
            },
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        user: Arc<SpyExecutor>,
        elevated: Arc<SpyExecutor>,
        prober: Arc<MockConsentProber>,
        _audit_task: tokio::task::JoinHandle<()>,
    }

    fn fixture_with(user: SpyExecutor, elevated: SpyExecutor) -> Fixture {
        let user = Arc::new(user);
        let elevated = Arc::new(elevated);
        let automation = Arc::new(SpyExecutor::ok(""));
        let prober = Arc::new(MockConsentProber::new());
        let gate = Arc::new(PermissionGate::new(
            PermissionStore::ephemeral(),
            prober.clone(),
            Duration::ZERO,
        ));
        let store = Arc::new(crate::audit::AuditStore::open_in_memory().unwrap());
        let (audit, future) = crate::audit::writer::create(store);
        let audit_task = tokio::spawn(future);

        Fixture {
            dispatcher: Dispatcher::new(
                user.clone(),
                elevated.clone(),
                automation,
                gate,
                audit,
            ),
            user,
            elevated,
            prober,
            _audit_task: audit_task,
        }
    }

    #[tokio::test]
    async fn user_tier_needs_no_grant() {
        let fx = fixture_with(SpyExecutor::ok("done\n"), SpyExecutor::ok(""));
        let record = fx
            .dispatcher
            .dispatch(
                &capability("quick.dns.flush", PrivilegeTier::User),
                &BoundArgs::default(),
                Uuid::new_v4(),
                ProgressSink::discard(),
            )
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Success);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(fx.user.call_count(), 1);
    }

    #[tokio::test]
    async fn elevated_blocked_without_grant_and_no_backend_call() {
        let fx = fixture_with(SpyExecutor::ok(""), SpyExecutor::ok(""));
        let err = fx
            .dispatcher
            .dispatch(
                &capability("deep.system.temp", PrivilegeTier::Elevated),
                &BoundArgs::default(),
                Uuid::new_v4(),
                ProgressSink::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Permission(_)));
        assert_eq!(fx.elevated.call_count(), 0);
    }

    #[tokio::test]
    async fn revocation_between_calls_blocks_the_second() {
        let fx = fixture_with(SpyExecutor::ok(""), SpyExecutor::ok(""));
        let cap = capability("deep.system.temp", PrivilegeTier::Elevated);

        fx.prober
            .set_state(&Resource::ElevatedHelper, PermissionState::Granted);
        fx.dispatcher
            .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(fx.elevated.call_count(), 1);

        // Revoked in System Settings between the two calls. The gate TTL is
        // zero here, so the next dispatch re-probes and must block.
        fx.prober
            .set_state(&Resource::ElevatedHelper, PermissionState::Denied);
        let err = fx
            .dispatcher
            .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Permission(_)));
        assert_eq!(fx.elevated.call_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_same_capability_runs_exactly_once() {
        let fx = fixture_with(
            SpyExecutor::stalled(Duration::from_millis(300)),
            SpyExecutor::ok(""),
        );
        let dispatcher = Arc::new(fx.dispatcher);
        let cap = capability("quick.dns.flush", PrivilegeTier::User);

        let first = {
            let dispatcher = dispatcher.clone();
            let cap = cap.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = dispatcher
            .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
            .await;
        assert!(matches!(
            second.unwrap_err(),
            BrokerError::Executor(ExecutorError::AlreadyRunning(_))
        ));

        first.await.unwrap().unwrap();
        assert_eq!(fx.user.call_count(), 1);

        // Slot is released after completion.
        dispatcher
            .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(fx.user.call_count(), 2);
    }

    #[tokio::test]
    async fn unrelated_capabilities_run_in_parallel() {
        let fx = fixture_with(
            SpyExecutor::stalled(Duration::from_millis(200)),
            SpyExecutor::ok(""),
        );
        let dispatcher = Arc::new(fx.dispatcher);

        let a = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        &capability("quick.one", PrivilegeTier::User),
                        &BoundArgs::default(),
                        Uuid::new_v4(),
                        ProgressSink::discard(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = dispatcher
            .dispatch(
                &capability("quick.two", PrivilegeTier::User),
                &BoundArgs::default(),
                Uuid::new_v4(),
                ProgressSink::discard(),
            )
            .await;
        assert!(b.is_ok());
        a.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn stalled_backend_times_out() {
        let fx = fixture_with(
            SpyExecutor::stalled(Duration::from_secs(120)),
            SpyExecutor::ok(""),
        );
        // timeout_secs = 1, grace = 5s: the backend honors the cancel token
        // raised by the dispatch timer.
        let err = fx
            .dispatcher
            .dispatch(
                &capability("quick.dns.flush", PrivilegeTier::User),
                &BoundArgs::default(),
                Uuid::new_v4(),
                ProgressSink::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Executor(ExecutorError::Timeout | ExecutorError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn cancel_by_correlation_id() {
        let fx = fixture_with(
            SpyExecutor::stalled(Duration::from_secs(60)),
            SpyExecutor::ok(""),
        );
        let dispatcher = Arc::new(fx.dispatcher);
        let id = Uuid::new_v4();

        let task = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(
                        &capability("quick.dns.flush", PrivilegeTier::User),
                        &BoundArgs::default(),
                        id,
                        ProgressSink::discard(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(dispatcher.cancel(&id));

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Executor(ExecutorError::Cancelled)
        ));
        // Token map is cleaned up.
        assert!(!dispatcher.cancel(&id));
    }

    #[tokio::test]
    async fn failure_surfaces_as_error() {
        let fx = fixture_with(
            SpyExecutor::failing(ExecutorError::CommandFailed {
                exit_code: 2,
                stdout: String::new(),
                stderr: "bad flag".into(),
            }),
            SpyExecutor::ok(""),
        );
        let err = fx
            .dispatcher
            .dispatch(
                &capability("quick.dns.flush", PrivilegeTier::User),
                &BoundArgs::default(),
                Uuid::new_v4(),
                ProgressSink::discard(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Executor(ExecutorError::CommandFailed { exit_code: 2, .. })
        ));
    }

    #[tokio::test]
    async fn parse_failure_on_success_is_partial() {
        let fx = fixture_with(SpyExecutor::ok("not json"), SpyExecutor::ok(""));
        let mut cap = capability("quick.dns.flush", PrivilegeTier::User);
        cap.output = OutputParser::Json;
        let record = fx
            .dispatcher
            .dispatch(&cap, &BoundArgs::default(), Uuid::new_v4(), ProgressSink::discard())
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::PartialSuccess);
    }
}
