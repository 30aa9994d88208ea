use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use super::store::AuditStore;
use super::{AuditEvent, AuditPersistenceError};

const CHANNEL_CAPACITY: usize = 1024;
const BATCH_SIZE: usize = 50;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// Upper bound on events parked after persistence failures. Past this, the
/// oldest parked events are dropped (and the drop itself is logged).
const FALLBACK_RING_CAPACITY: usize = 4096;

/// Persistence target for the background writer. The production impl is the
/// SQLite store; tests substitute a failing one to exercise the fallback
/// ring.
pub trait RunSink: Send + Sync {
    fn apply(&self, events: &[AuditEvent]) -> Result<(), AuditPersistenceError>;
}

impl RunSink for AuditStore {
    fn apply(&self, events: &[AuditEvent]) -> Result<(), AuditPersistenceError> {
        AuditStore::apply(self, events)
    }
}

/// Cheaply cloneable handle for recording audit events.
///
/// `record()` never blocks and never fails the caller: a full channel is a
/// diagnostics event, not an execution error.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<AuditEvent>,
}

impl AuditWriter {
    pub fn record(&self, event: AuditEvent) {
        if self.tx.try_send(event).is_err() {
            log::warn!("Audit channel full, event dropped");
        }
    }
}

/// Create the writer handle and the background future that drains it. The
/// caller spawns the future on its runtime.
pub fn create(store: Arc<dyn RunSink>) -> (AuditWriter, impl std::future::Future<Output = ()>) {
    create_with(store, FLUSH_INTERVAL)
}

pub(crate) fn create_with(
    store: Arc<dyn RunSink>,
    flush_interval: Duration,
) -> (AuditWriter, impl std::future::Future<Output = ()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let writer = AuditWriter { tx };
    let future = run(rx, store, flush_interval);
    (writer, future)
}

async fn run(mut rx: mpsc::Receiver<AuditEvent>, store: Arc<dyn RunSink>, flush_interval: Duration) {
    let mut buffer: Vec<AuditEvent> = Vec::with_capacity(BATCH_SIZE);
    // Events that failed to persist, retried ahead of new ones on each flush
    // so per-capability ordering survives a store outage.
    let mut parked: VecDeque<AuditEvent> = VecDeque::new();
    let mut flush_tick = interval(flush_interval);
    flush_tick.tick().await;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(e) => {
                        buffer.push(e);
                        if buffer.len() >= BATCH_SIZE {
                            flush(store.as_ref(), &mut buffer, &mut parked);
                        }
                    }
                    None => {
                        flush(store.as_ref(), &mut buffer, &mut parked);
                        if !parked.is_empty() {
                            log::error!(
                                "Audit writer shutting down with {} unpersisted event(s)",
                                parked.len()
                            );
                        }
                        break;
                    }
                }
            }
            _ = flush_tick.tick() => {
                if !buffer.is_empty() || !parked.is_empty() {
                    flush(store.as_ref(), &mut buffer, &mut parked);
                }
            }
        }
    }
}

fn flush(store: &dyn RunSink, buffer: &mut Vec<AuditEvent>, parked: &mut VecDeque<AuditEvent>) {
    let mut batch: Vec<AuditEvent> = parked.drain(..).collect();
    batch.append(buffer);
    if batch.is_empty() {
        return;
    }

    if let Err(e) = store.apply(&batch) {
        log::error!(
            "Audit batch persist failed ({} event(s) parked for retry): {}",
            batch.len(),
            e
        );
        parked.extend(batch);
        let overflow = parked.len().saturating_sub(FALLBACK_RING_CAPACITY);
        if overflow > 0 {
            parked.drain(..overflow);
            log::error!("Audit fallback ring overflow, {} oldest event(s) dropped", overflow);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use uuid::Uuid;

    use super::*;
    use crate::audit::{RunOutcome, RunRecord, RunStatus};
    use crate::catalog::PrivilegeTier;

    /// Sink that fails while `broken` is set, then accepts everything.
    struct FlakySink {
        broken: AtomicBool,
        applied: Mutex<Vec<AuditEvent>>,
    }

    impl FlakySink {
        fn new(broken: bool) -> Self {
            Self {
                broken: AtomicBool::new(broken),
                applied: Mutex::new(Vec::new()),
            }
        }
    }

    impl RunSink for FlakySink {
        fn apply(&self, events: &[AuditEvent]) -> Result<(), AuditPersistenceError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(AuditPersistenceError::Store("disk full".into()));
            }
            self.applied.lock().unwrap().extend(events.iter().cloned());
            Ok(())
        }
    }

    fn begin_event() -> AuditEvent {
        AuditEvent::Begin(RunRecord::begin(
            Uuid::new_v4(),
            "quick.dns.flush",
            PrivilegeTier::User,
        ))
    }

    #[tokio::test]
    async fn events_reach_the_store() {
        let sink = Arc::new(FlakySink::new(false));
        let (writer, future) = create_with(sink.clone(), Duration::from_millis(10));
        let task = tokio::spawn(future);

        writer.record(begin_event());
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.applied.lock().unwrap().len(), 1);
        drop(writer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failed_flush_is_retried_from_the_ring() {
        let sink = Arc::new(FlakySink::new(true));
        let (writer, future) = create_with(sink.clone(), Duration::from_millis(10));
        let task = tokio::spawn(future);

        writer.record(begin_event());
        writer.record(AuditEvent::Finish {
            correlation_id: Uuid::new_v4(),
            outcome: RunOutcome::terminal(RunStatus::Failed),
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        // Still broken: nothing persisted, nothing lost.
        assert_eq!(sink.applied.lock().unwrap().len(), 0);

        sink.broken.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.applied.lock().unwrap().len(), 2);

        drop(writer);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_events() {
        let sink = Arc::new(FlakySink::new(false));
        let (writer, future) = create_with(sink.clone(), Duration::from_secs(3600));
        let task = tokio::spawn(future);

        writer.record(begin_event());
        drop(writer);
        task.await.unwrap();

        assert_eq!(sink.applied.lock().unwrap().len(), 1);
    }
}
