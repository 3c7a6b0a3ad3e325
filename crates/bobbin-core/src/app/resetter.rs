//! Resetter - reclaims records abandoned by dead or stuck workers.
//!
//! # Flow (one tick)
//! 1. `ResetStore::stalled_ids()` lists processing records with an old lease
//! 2. `ResetStore::reset_stalled()` re-checks each one and requeues or errors it
//! 3. Failures on one record are counted and logged, the rest of the scan goes on

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::observability::{ResetterMetrics, incr};
use crate::ports::{ResetOutcome, ResetStore};

#[derive(Debug, Clone)]
pub struct ResetterOptions {
    /// Used in logs.
    pub name: String,

    /// Time between scans.
    pub interval: Duration,
}

impl Default for ResetterOptions {
    fn default() -> Self {
        Self {
            name: "bobbin_resetter".to_string(),
            interval: Duration::from_secs(60),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub requeued: usize,
    pub errored: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Background loop that resets stalled records.
///
/// It needs nothing from the workers: a record whose lease is older than
/// `stalled_max_age` is treated as abandoned no matter who holds it.
pub struct Resetter<S: ?Sized> {
    store: Arc<S>,
    options: ResetterOptions,
    metrics: Arc<ResetterMetrics>,
}

impl<S: ResetStore + ?Sized + 'static> Resetter<S> {
    pub fn new(store: Arc<S>, options: ResetterOptions) -> Self {
        Self {
            store,
            options,
            metrics: Arc::new(ResetterMetrics::default()),
        }
    }

    /// Share counters with an exporter.
    pub fn with_metrics(mut self, metrics: Arc<ResetterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ResetterMetrics> {
        &self.metrics
    }

    /// Run a single scan.
    pub async fn reset_once(&self) -> ResetSummary {
        let mut summary = ResetSummary::default();
        let store_name = &self.store.options().name;

        let ids = match self.store.stalled_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                incr(&self.metrics.errors);
                warn!(resetter = %self.options.name, store = %store_name, error = %err, "failed to scan for stalled records");
                summary.errors += 1;
                return summary;
            }
        };

        for id in ids {
            match self.store.reset_stalled(id).await {
                Ok(ResetOutcome::Requeued { num_resets }) => {
                    incr(&self.metrics.record_resets);
                    summary.requeued += 1;
                    info!(resetter = %self.options.name, store = %store_name, record_id = %id, num_resets, "reset stalled record");
                }
                Ok(ResetOutcome::Errored { num_resets }) => {
                    incr(&self.metrics.record_reset_failures);
                    summary.errored += 1;
                    warn!(resetter = %self.options.name, store = %store_name, record_id = %id, num_resets, "stalled record exceeded maximum number of resets");
                }
                Ok(ResetOutcome::Skipped) => {
                    summary.skipped += 1;
                    debug!(resetter = %self.options.name, record_id = %id, "record recovered before reset");
                }
                Err(err) => {
                    incr(&self.metrics.errors);
                    summary.errors += 1;
                    warn!(resetter = %self.options.name, store = %store_name, record_id = %id, error = %err, "failed to reset record");
                }
            }
        }

        summary
    }

    /// Scan every `interval` until `shutdown` flips to true (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.options.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(resetter = %self.options.name, interval = ?self.options.interval, "resetter started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.reset_once().await;
                }
            }
        }

        info!(resetter = %self.options.name, "resetter stopped");
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
