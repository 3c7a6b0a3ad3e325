//! Store port: the single source of truth for record state.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{JobRecord, RecordId};
use crate::error::StoreError;
use crate::observability::QueueCounts;

/// Staleness and reset settings shared by every caller of one store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Used in logs to tell several queues apart.
    pub name: String,

    /// A processing record whose lease has not been renewed for this long is
    /// considered abandoned by the resetter.
    pub stalled_max_age: Duration,

    /// Resets allowed before a record is moved to `errored` instead of `queued`.
    pub max_num_resets: u32,

    /// How long an owned record may be left out of a worker's heartbeat before
    /// the store takes it back from that worker.
    pub unreported_max_age: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            name: "bobbin".to_string(),
            stalled_max_age: Duration::from_secs(25),
            max_num_resets: 3,
            unreported_max_age: Duration::from_secs(30),
        }
    }
}

/// Result of one conditional reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// Moved back to `queued`; `num_resets` is the new count.
    Requeued { num_resets: u32 },

    /// Reset budget exhausted; moved to `errored`.
    Errored { num_resets: u32 },

    /// The record was no longer stalled when the update ran (a heartbeat
    /// landed, or it finished). Left untouched.
    Skipped,
}

/// Worker- and producer-facing store operations.
///
/// Design intent:
/// - The store decides every transition; workers only hold an advisory list of
///   ids they believe they own.
/// - Terminal writes are conditional on `(id, owner, processing)`. A worker that
///   lost its lease gets `Ok(false)` back and nothing changes.
/// - An empty queue is `Ok(None)`, never an error.
#[async_trait]
pub trait Store: Send + Sync {
    type Payload: Clone + Send + Sync + 'static;

    /// Insert a new `queued` record.
    async fn insert(&self, payload: Self::Payload) -> Result<RecordId, StoreError>;

    /// Insert a new `queued` record that cannot be dequeued before `process_after`.
    async fn insert_after(
        &self,
        payload: Self::Payload,
        process_after: DateTime<Utc>,
    ) -> Result<RecordId, StoreError>;

    /// Atomically claim the oldest eligible record for `worker_id`.
    async fn dequeue(
        &self,
        worker_id: &str,
    ) -> Result<Option<JobRecord<Self::Payload>>, StoreError>;

    /// Renew leases for `known_ids` and return the ids this worker no longer owns
    /// (sorted ascending).
    ///
    /// Owned records missing from `known_ids` for longer than
    /// `unreported_max_age` are also returned, and taken back from the worker.
    async fn heartbeat(
        &self,
        worker_id: &str,
        known_ids: &[RecordId],
    ) -> Result<Vec<RecordId>, StoreError>;

    /// Returns `false` if `worker_id` does not hold the lease.
    async fn mark_complete(&self, id: RecordId, worker_id: &str) -> Result<bool, StoreError>;

    /// Returns `false` if `worker_id` does not hold the lease.
    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        message: &str,
    ) -> Result<bool, StoreError>;

    /// Number of queued records, delayed ones included.
    async fn queued_count(&self) -> Result<usize, StoreError>;

    /// Age of the oldest record that is eligible for dequeue right now.
    async fn max_duration_in_queue(&self) -> Result<Option<Duration>, StoreError>;

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError>;

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<Self::Payload>>, StoreError>;
}

/// Operations used to recover abandoned work.
///
/// Kept apart from `Store` so workers never see them.
/// - `stalled_ids` / `reset_stalled` drive the `Resetter`.
/// - `requeue` / `mark_errored` are administrative: an operator tool moves a
///   processing record by hand, without the staleness check or a reset count.
#[async_trait]
pub trait ResetStore: Send + Sync {
    fn options(&self) -> &StoreOptions;

    /// Ids of processing records whose lease is older than `stalled_max_age`.
    async fn stalled_ids(&self) -> Result<Vec<RecordId>, StoreError>;

    /// Re-check that `id` is still stalled and, in the same atomic step, requeue
    /// or error it.
    async fn reset_stalled(&self, id: RecordId) -> Result<ResetOutcome, StoreError>;

    /// Put a processing record back in the queue, claimable after `after`.
    async fn requeue(&self, id: RecordId, after: Option<DateTime<Utc>>) -> Result<(), StoreError>;

    /// Move a processing record to `errored`.
    async fn mark_errored(&self, id: RecordId, message: &str) -> Result<(), StoreError>;
}
