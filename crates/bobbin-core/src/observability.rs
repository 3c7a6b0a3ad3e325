//! Counters and state counts exposed to an external metrics exporter.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::domain::RecordState;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub processing: usize,
    pub completed: usize,
    pub errored: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub(crate) fn add(&mut self, state: RecordState) {
        match state {
            RecordState::Queued => self.queued += 1,
            RecordState::Processing => self.processing += 1,
            RecordState::Completed => self.completed += 1,
            RecordState::Errored => self.errored += 1,
            RecordState::Failed => self.failed += 1,
        }
    }

    /// Records that can still change state.
    pub fn pending(&self) -> usize {
        self.queued + self.processing
    }
}

/// Resetter counters.
#[derive(Debug, Default)]
pub struct ResetterMetrics {
    /// Records moved back to `queued`.
    pub record_resets: AtomicU64,
    /// Records moved to `errored` after exhausting their reset budget.
    pub record_reset_failures: AtomicU64,
    /// Scan or per-record store errors.
    pub errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResetterMetricsSnapshot {
    pub record_resets: u64,
    pub record_reset_failures: u64,
    pub errors: u64,
}

impl ResetterMetrics {
    pub fn snapshot(&self) -> ResetterMetricsSnapshot {
        ResetterMetricsSnapshot {
            record_resets: self.record_resets.load(Ordering::Relaxed),
            record_reset_failures: self.record_reset_failures.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Worker counters.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    pub dequeued: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    /// Jobs aborted because the store reported them unknown.
    pub cancelled: AtomicU64,
    /// Jobs aborted for running past `maximum_runtime_per_job`.
    pub timed_out: AtomicU64,
    /// Terminal writes the store rejected because the lease was gone.
    pub stale_writes: AtomicU64,
    pub store_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetricsSnapshot {
    pub dequeued: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timed_out: u64,
    pub stale_writes: u64,
    pub store_errors: u64,
}

impl WorkerMetrics {
    pub fn snapshot(&self) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            dequeued: self.dequeued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            stale_writes: self.stale_writes.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_track_each_state() {
        let mut counts = QueueCounts::default();
        counts.add(RecordState::Queued);
        counts.add(RecordState::Processing);
        counts.add(RecordState::Errored);

        assert_eq!(counts.pending(), 2);
        assert_eq!(counts.errored, 1);
    }

    #[test]
    fn snapshot_reads_counters() {
        let metrics = ResetterMetrics::default();
        incr(&metrics.record_resets);
        incr(&metrics.record_resets);
        incr(&metrics.errors);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.record_resets, 2);
        assert_eq!(snapshot.record_reset_failures, 0);
        assert_eq!(snapshot.errors, 1);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["record_resets"], 2);
    }
}
