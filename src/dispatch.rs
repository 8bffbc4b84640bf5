//! Asynchronous event dispatch
//!
//! Events are routed by name to a fixed pool of worker actors over bounded
//! channels, so events with the same name are processed in submission order
//! while distinct names proceed in parallel. A separate sweeper evicts
//! expired keys on an interval.

use crate::error::{FluxError, Result};
use crate::executor::EventExecutor;
use crate::resolver::Attributes;
use crate::schema::SchemaRegistry;
use crate::store::SharedStore;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

/// One unit of deferred work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedEvent {
    pub schema_id: String,
    pub event_name: String,
    pub attrs: Attributes,
}

#[derive(Debug)]
enum WorkerMessage {
    Event(QueuedEvent),
    /// Reply once every earlier message has been handled
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Default)]
struct DispatchCounters {
    accepted: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time dispatch counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub accepted: u64,
    pub processed: u64,
    pub failed: u64,
}

struct EventWorker {
    rx: mpsc::Receiver<WorkerMessage>,
    registry: Arc<SchemaRegistry>,
    executor: Arc<EventExecutor>,
    counters: Arc<DispatchCounters>,
    worker_id: usize,
}

impl EventWorker {
    async fn run(mut self) {
        debug!("Event worker {} started", self.worker_id);
        while let Some(msg) = self.rx.recv().await {
            match msg {
                WorkerMessage::Event(event) => self.handle(event),
                WorkerMessage::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Event worker {} stopped", self.worker_id);
    }

    fn handle(&self, event: QueuedEvent) {
        let outcome = self
            .registry
            .get_schema(&event.schema_id)
            .and_then(|schema| {
                self.executor
                    .process_event(&schema, &event.event_name, &event.attrs)
            });
        match outcome {
            Ok(report) => {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Processed {} on worker {}: {} handlers, {} writes, {} skipped",
                    event.event_name,
                    self.worker_id,
                    report.handlers_run,
                    report.writes,
                    report.skipped
                );
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!("Event {} failed: {}", event.event_name, e);
            }
        }
    }
}

/// Handle to the worker pool. Cheap to clone.
#[derive(Clone)]
pub struct EventDispatcher {
    workers: Arc<[mpsc::Sender<WorkerMessage>]>,
    counters: Arc<DispatchCounters>,
}

impl EventDispatcher {
    /// Spawn `worker_count` workers sharing `queue_capacity` slots.
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        registry: Arc<SchemaRegistry>,
        executor: Arc<EventExecutor>,
        worker_count: usize,
        queue_capacity: usize,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let per_worker = (queue_capacity / worker_count).max(1);
        let counters = Arc::new(DispatchCounters::default());

        let workers: Vec<mpsc::Sender<WorkerMessage>> = (0..worker_count)
            .map(|worker_id| {
                let (tx, rx) = mpsc::channel(per_worker);
                let worker = EventWorker {
                    rx,
                    registry: registry.clone(),
                    executor: executor.clone(),
                    counters: counters.clone(),
                    worker_id,
                };
                tokio::spawn(worker.run());
                tx
            })
            .collect();

        info!(
            "Started {} event workers ({} queued events each)",
            worker_count, per_worker
        );
        EventDispatcher {
            workers: workers.into(),
            counters,
        }
    }

    fn route(&self, event_name: &str) -> &mpsc::Sender<WorkerMessage> {
        let mut hasher = DefaultHasher::new();
        event_name.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.workers.len();
        &self.workers[idx]
    }

    /// Enqueue an event, waiting for queue space
    pub async fn submit(&self, event: QueuedEvent) -> Result<()> {
        self.route(&event.event_name)
            .send(WorkerMessage::Event(event))
            .await
            .map_err(|_| FluxError::Dispatch("event workers stopped".to_string()))?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Enqueue an event without waiting; fails when the queue is full
    pub fn try_submit(&self, event: QueuedEvent) -> Result<()> {
        self.route(&event.event_name)
            .try_send(WorkerMessage::Event(event))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    FluxError::Dispatch("event queue is full".to_string())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    FluxError::Dispatch("event workers stopped".to_string())
                }
            })?;
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until every event submitted before this call has been handled
    pub async fn flush(&self) {
        let mut pending = Vec::with_capacity(self.workers.len());
        for worker in self.workers.iter() {
            let (tx, rx) = oneshot::channel();
            if worker.send(WorkerMessage::Flush(tx)).await.is_ok() {
                pending.push(rx);
            }
        }
        for rx in pending {
            let _ = rx.await;
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Periodically evicts expired keys (stored query results)
pub struct ExpirySweeper {
    store: SharedStore,
    period: Duration,
}

impl ExpirySweeper {
    pub fn new(store: SharedStore, period: Duration) -> Self {
        ExpirySweeper { store, period }
    }

    pub async fn run(self) {
        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            let evicted = self.store.evict_expired();
            if evicted > 0 {
                debug!("Expiry sweeper evicted {} keys", evicted);
            }
        }
    }
}
