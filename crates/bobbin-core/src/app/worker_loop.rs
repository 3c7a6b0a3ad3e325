//! WorkerLoop - claim, execute, renew, finalize.
//!
//! # Flow
//! 1. `Store::dequeue()` while there is a free handler slot
//! 2. Handler runs on its own task; the id goes into the in-flight set
//! 3. Every `heartbeat_interval`, `Store::heartbeat()` with the in-flight set;
//!    ids the store no longer attributes to us are aborted and dropped
//! 4. On handler completion, `Store::mark_complete()` / `Store::mark_failed()`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{self, AbortHandle, JoinError, JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::app::handler::{Handler, HandlerError};
use crate::domain::{JobRecord, Record, RecordId};
use crate::observability::{WorkerMetrics, incr};
use crate::ports::Store;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Identity sent to the store as the lease owner. Must be unique per worker.
    pub name: String,

    /// Maximum number of records handled concurrently.
    pub num_handlers: usize,

    /// Delay between dequeue attempts.
    pub poll_interval: Duration,

    /// Delay between heartbeats. Keep well under the store's
    /// `unreported_max_age` and `stalled_max_age`.
    pub heartbeat_interval: Duration,

    /// Jobs running longer than this are aborted and marked failed.
    pub maximum_runtime_per_job: Option<Duration>,

    /// Stop dequeuing after this many jobs, and exit once they finish.
    pub num_total_jobs: Option<usize>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            name: default_worker_name(),
            num_handlers: 1,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            maximum_runtime_per_job: None,
            num_total_jobs: None,
        }
    }
}

pub(crate) fn default_worker_name() -> String {
    format!("worker-{:08x}", rand::random::<u32>())
}

struct ActiveJob {
    abort: AbortHandle,
    started_at: Instant,
}

/// Per-run bookkeeping. The store's view always wins over this.
struct LoopState {
    active: HashMap<RecordId, ActiveJob>,
    tasks: HashMap<task::Id, RecordId>,
    handlers: JoinSet<Result<(), HandlerError>>,
    claimed: usize,
}

impl LoopState {
    fn new() -> Self {
        Self {
            active: HashMap::new(),
            tasks: HashMap::new(),
            handlers: JoinSet::new(),
            claimed: 0,
        }
    }
}

/// One worker: a single control flow issuing store calls in sequence, with
/// handler executions running beside it.
pub struct Worker<S: Store + ?Sized, H> {
    store: Arc<S>,
    handler: Arc<H>,
    options: WorkerOptions,
    metrics: Arc<WorkerMetrics>,
}

impl<S, H> Worker<S, H>
where
    S: Store + ?Sized + 'static,
    H: Handler<JobRecord<S::Payload>>,
{
    pub fn new(store: Arc<S>, handler: Arc<H>, options: WorkerOptions) -> Self {
        Self {
            store,
            handler,
            options,
            metrics: Arc::new(WorkerMetrics::default()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<WorkerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    /// Run until `shutdown` flips to true, its sender is dropped, or the
    /// `num_total_jobs` budget is spent and drained.
    ///
    /// In-flight handlers are aborted on shutdown. Their records stay
    /// `processing` until the resetter reclaims them.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state = LoopState::new();

        let mut poll = tokio::time::interval(self.options.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first heartbeat one interval after start, not immediately
        heartbeat.reset();

        info!(worker = %self.options.name, num_handlers = self.options.num_handlers, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.exhausted(&state) && state.active.is_empty() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(joined) = state.handlers.join_next_with_id() => {
                    self.finalize(&mut state, joined).await;
                }
                _ = heartbeat.tick() => {
                    self.heartbeat(&mut state).await;
                }
                _ = poll.tick() => {
                    self.fill(&mut state).await;
                }
            }
        }

        let abandoned = state.active.len();
        state.handlers.shutdown().await;
        info!(worker = %self.options.name, abandoned, claimed = state.claimed, "worker stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    fn exhausted(&self, state: &LoopState) -> bool {
        self.options
            .num_total_jobs
            .is_some_and(|limit| state.claimed >= limit)
    }

    /// Dequeue until every handler slot is busy or the queue is empty.
    async fn fill(&self, state: &mut LoopState) {
        while state.active.len() < self.options.num_handlers && !self.exhausted(state) {
            match self.store.dequeue(&self.options.name).await {
                Ok(Some(record)) => self.start(state, record),
                Ok(None) => break,
                Err(err) => {
                    incr(&self.metrics.store_errors);
                    warn!(worker = %self.options.name, error = %err, "failed to dequeue");
                    break;
                }
            }
        }
    }

    fn start(&self, state: &mut LoopState, record: JobRecord<S::Payload>) {
        let id = record.record_id();
        let handler = Arc::clone(&self.handler);
        let abort = state
            .handlers
            .spawn(async move { handler.handle(record).await });

        state.tasks.insert(abort.id(), id);
        state.active.insert(
            id,
            ActiveJob {
                abort,
                started_at: Instant::now(),
            },
        );
        state.claimed += 1;
        incr(&self.metrics.dequeued);
        debug!(worker = %self.options.name, record_id = %id, "handling record");
    }

    async fn heartbeat(&self, state: &mut LoopState) {
        self.cancel_overdue(state).await;

        let mut ids: Vec<RecordId> = state.active.keys().copied().collect();
        ids.sort();

        let unknown = match self.store.heartbeat(&self.options.name, &ids).await {
            Ok(unknown) => unknown,
            Err(err) => {
                incr(&self.metrics.store_errors);
                warn!(worker = %self.options.name, error = %err, "failed to heartbeat");
                return;
            }
        };

        for id in unknown {
            // The store is authoritative: whatever the handler writes later
            // would be rejected anyway.
            if let Some(job) = state.active.remove(&id) {
                job.abort.abort();
                incr(&self.metrics.cancelled);
                info!(worker = %self.options.name, record_id = %id, "record no longer owned by this worker, cancelling");
            }
        }
    }

    async fn cancel_overdue(&self, state: &mut LoopState) {
        let Some(max_runtime) = self.options.maximum_runtime_per_job else {
            return;
        };

        let overdue: Vec<RecordId> = state
            .active
            .iter()
            .filter(|(_, job)| job.started_at.elapsed() > max_runtime)
            .map(|(id, _)| *id)
            .collect();

        for id in overdue {
            if let Some(job) = state.active.remove(&id) {
                job.abort.abort();
                incr(&self.metrics.timed_out);
                warn!(worker = %self.options.name, record_id = %id, ?max_runtime, "job exceeded maximum runtime");
                let message = format!("job exceeded maximum runtime of {max_runtime:?}");
                self.mark_failed(id, &message).await;
            }
        }
    }

    async fn finalize(
        &self,
        state: &mut LoopState,
        joined: Result<(task::Id, Result<(), HandlerError>), JoinError>,
    ) {
        let (task_id, outcome) = match joined {
            Ok((task_id, outcome)) => (task_id, outcome.map_err(|err| err.to_string())),
            Err(err) if err.is_cancelled() => {
                state.tasks.remove(&err.id());
                return;
            }
            Err(err) => (err.id(), Err(format!("handler panicked: {err}"))),
        };

        let Some(id) = state.tasks.remove(&task_id) else {
            return;
        };
        // Cancelled or timed out while finishing: nothing left to report.
        if state.active.remove(&id).is_none() {
            return;
        }

        match outcome {
            Ok(()) => self.mark_complete(id).await,
            Err(message) => self.mark_failed(id, &message).await,
        }
    }

    async fn mark_complete(&self, id: RecordId) {
        match self.store.mark_complete(id, &self.options.name).await {
            Ok(true) => {
                incr(&self.metrics.completed);
                debug!(worker = %self.options.name, record_id = %id, "record completed");
            }
            Ok(false) => {
                incr(&self.metrics.stale_writes);
                warn!(worker = %self.options.name, record_id = %id, "lease lost before completion was recorded");
            }
            Err(err) => {
                incr(&self.metrics.store_errors);
                warn!(worker = %self.options.name, record_id = %id, error = %err, "failed to mark record complete");
            }
        }
    }

    async fn mark_failed(&self, id: RecordId, message: &str) {
        match self.store.mark_failed(id, &self.options.name, message).await {
            Ok(true) => {
                incr(&self.metrics.failed);
                info!(worker = %self.options.name, record_id = %id, failure = %message, "record failed");
            }
            Ok(false) => {
                incr(&self.metrics.stale_writes);
                warn!(worker = %self.options.name, record_id = %id, "lease lost before failure was recorded");
            }
            Err(err) => {
                incr(&self.metrics.store_errors);
                warn!(worker = %self.options.name, record_id = %id, error = %err, "failed to mark record failed");
            }
        }
    }
}

/// Worker group handle.
/// - Every worker gets `"{name}-{index}"` as its lease identity
/// - Dropping the group (or `request_shutdown`) stops all workers
/// - `join()` waits for all workers to finish
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
    metrics: Arc<WorkerMetrics>,
}

impl WorkerGroup {
    /// Spawn `n` workers sharing one store, one handler and one set of counters.
    pub fn spawn<S, H>(n: usize, store: Arc<S>, handler: Arc<H>, options: WorkerOptions) -> Self
    where
        S: Store + ?Sized + 'static,
        H: Handler<JobRecord<S::Payload>>,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(WorkerMetrics::default());

        let joins = (0..n)
            .map(|index| {
                let options = WorkerOptions {
                    name: format!("{}-{index}", options.name),
                    ..options.clone()
                };
                Worker::new(Arc::clone(&store), Arc::clone(&handler), options)
                    .with_metrics(Arc::clone(&metrics))
                    .spawn(shutdown_rx.clone())
            })
            .collect();

        Self {
            shutdown_tx,
            joins,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Stop taking new records and abort in-flight handlers.
    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for every worker to exit on its own (see `num_total_jobs`).
    pub async fn join(self) {
        for join in self.joins {
            if let Err(err) = join.await {
                warn!(error = %err, "worker task ended abnormally");
            }
        }
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        self.join().await;
    }
}
