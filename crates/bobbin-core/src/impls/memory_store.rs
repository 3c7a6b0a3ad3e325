//! In-memory store implementation.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::domain::{JobRecord, RecordId, RecordState};
use crate::error::StoreError;
use crate::observability::{QueueCounts, ResetterMetrics, incr};
use crate::ports::clock::cutoff;
use crate::ports::{Clock, ResetOutcome, ResetStore, Store, StoreOptions, SystemClock};

/// `failure_message` of a record errored for running out of resets.
pub const MAX_RESETS_MESSAGE: &str = "exceeded maximum number of resets";

/// In-memory store state.
///
/// `records` is the single source of truth; `ready` and `leased` are indexes
/// over it and are updated in the same critical section as the record.
struct MemoryStoreState<P> {
    records: HashMap<RecordId, JobRecord<P>>,

    /// Queued records in FIFO order: (queued_at, id).
    ready: BTreeSet<(DateTime<Utc>, RecordId)>,

    /// Processing records by owning worker.
    leased: HashMap<String, BTreeSet<RecordId>>,

    /// Next id to assign; `None` once the id space is used up.
    next_id: Option<RecordId>,
}

impl<P: Clone> MemoryStoreState<P> {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            ready: BTreeSet::new(),
            leased: HashMap::new(),
            next_id: Some(RecordId::new(1)),
        }
    }

    fn allocate_id(&mut self) -> Result<RecordId, StoreError> {
        let id = self
            .next_id
            .ok_or_else(|| StoreError::Unavailable("record ids exhausted".to_string()))?;
        self.next_id = id.next();
        Ok(id)
    }

    fn insert(
        &mut self,
        payload: P,
        now: DateTime<Utc>,
        process_after: Option<DateTime<Utc>>,
    ) -> Result<RecordId, StoreError> {
        let id = self.allocate_id()?;
        self.records
            .insert(id, JobRecord::new(id, payload, now, process_after));
        self.ready.insert((now, id));
        Ok(id)
    }

    fn dequeue(&mut self, worker_id: &str, now: DateTime<Utc>) -> Option<JobRecord<P>> {
        let key = self
            .ready
            .iter()
            .find(|(_, id)| self.records.get(id).is_some_and(|r| r.is_eligible(now)))
            .copied()?;
        self.ready.remove(&key);

        let record = self.records.get_mut(&key.1)?;
        record.claim(worker_id, now);
        self.leased
            .entry(worker_id.to_string())
            .or_default()
            .insert(key.1);
        Some(record.clone())
    }

    /// Remove `id` from the lease index of whichever worker owns it.
    fn unlease(&mut self, id: RecordId) {
        let Some(owner) = self.records.get(&id).and_then(|r| r.worker_owner.clone()) else {
            return;
        };
        if let Some(ids) = self.leased.get_mut(&owner) {
            ids.remove(&id);
            if ids.is_empty() {
                self.leased.remove(&owner);
            }
        }
    }

    fn heartbeat(
        &mut self,
        worker_id: &str,
        known_ids: &[RecordId],
        now: DateTime<Utc>,
        options: &StoreOptions,
        metrics: &ResetterMetrics,
    ) -> Vec<RecordId> {
        let known: BTreeSet<RecordId> = known_ids.iter().copied().collect();
        let mut unknown = BTreeSet::new();

        for id in &known {
            match self.records.get_mut(id) {
                Some(record) if record.is_owned_by(worker_id) => record.renew(now),
                _ => {
                    unknown.insert(*id);
                }
            }
        }

        // Owned but not reported: tolerated until the grace period runs out.
        let unreported_cutoff = cutoff(now, options.unreported_max_age);
        let dropped: Vec<RecordId> = self
            .leased
            .get(worker_id)
            .into_iter()
            .flatten()
            .filter(|id| !known.contains(*id))
            .filter(|id| {
                self.records
                    .get(*id)
                    .is_some_and(|r| r.is_stalled(unreported_cutoff))
            })
            .copied()
            .collect();

        for id in dropped {
            let outcome = self.reclaim(id, now, options.max_num_resets);
            match outcome {
                ResetOutcome::Requeued { .. } => incr(&metrics.record_resets),
                ResetOutcome::Errored { .. } => incr(&metrics.record_reset_failures),
                ResetOutcome::Skipped => {}
            }
            info!(
                store = %options.name,
                worker = %worker_id,
                record_id = %id,
                ?outcome,
                "record missing from heartbeat, taking it back"
            );
            unknown.insert(id);
        }

        unknown.into_iter().collect()
    }

    /// Apply a terminal transition if `worker_id` still holds the lease.
    fn finish(
        &mut self,
        id: RecordId,
        worker_id: &str,
        apply: impl FnOnce(&mut JobRecord<P>),
    ) -> bool {
        if !self
            .records
            .get(&id)
            .is_some_and(|r| r.is_owned_by(worker_id))
        {
            return false;
        }
        self.unlease(id);
        if let Some(record) = self.records.get_mut(&id) {
            apply(record);
        }
        true
    }

    /// Take a processing record away from its owner: requeue it while reset
    /// budget is left (spending one), error it once the budget is spent.
    fn reclaim(&mut self, id: RecordId, now: DateTime<Utc>, max_num_resets: u32) -> ResetOutcome {
        self.unlease(id);
        let Some(record) = self.records.get_mut(&id) else {
            return ResetOutcome::Skipped;
        };

        if record.num_resets < max_num_resets {
            record.num_resets += 1;
            record.requeue(None);
            self.ready.insert((record.queued_at, id));
            ResetOutcome::Requeued {
                num_resets: record.num_resets,
            }
        } else {
            record.error(now, MAX_RESETS_MESSAGE.to_string());
            ResetOutcome::Errored {
                num_resets: record.num_resets,
            }
        }
    }

    fn ensure_processing(&self, id: RecordId, to: RecordState) -> Result<(), StoreError> {
        let record = self.records.get(&id).ok_or(StoreError::NotFound(id))?;
        if record.state != RecordState::Processing {
            return Err(StoreError::InvalidTransition {
                id,
                from: record.state,
                to,
            });
        }
        Ok(())
    }

    fn counts_by_state(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.records.values() {
            counts.add(record.state);
        }
        counts
    }
}

/// In-memory store.
///
/// Every operation holds the state lock for its whole select-and-update, which
/// is what makes claims, heartbeats and terminal writes atomic. Cloning the
/// `Arc` around it shares one store between many workers.
pub struct MemoryStore<P> {
    state: Mutex<MemoryStoreState<P>>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
    metrics: Arc<ResetterMetrics>,
}

impl<P: Clone + Send + Sync + 'static> MemoryStore<P> {
    pub fn new(options: StoreOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryStoreState::new()),
            clock,
            options,
            metrics: Arc::new(ResetterMetrics::default()),
        }
    }

    /// Count reclaims made by `heartbeat` into `metrics`. Pass the resetter's
    /// counters to see every reset in one place.
    pub fn with_metrics(mut self, metrics: Arc<ResetterMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &Arc<ResetterMetrics> {
        &self.metrics
    }

    /// Start id assignment at `first_id` instead of 1.
    pub fn with_next_id(mut self, first_id: i64) -> Self {
        self.state.get_mut().next_id = Some(RecordId::new(first_id));
        self
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> Store for MemoryStore<P> {
    type Payload = P;

    async fn insert(&self, payload: P) -> Result<RecordId, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.insert(payload, now, None)
    }

    async fn insert_after(
        &self,
        payload: P,
        process_after: DateTime<Utc>,
    ) -> Result<RecordId, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.insert(payload, now, Some(process_after))
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<JobRecord<P>>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.dequeue(worker_id, now);
        if let Some(record) = &record {
            debug!(store = %self.options.name, worker = %worker_id, record_id = %record.id, "dequeued record");
        }
        Ok(record)
    }

    async fn heartbeat(
        &self,
        worker_id: &str,
        known_ids: &[RecordId],
    ) -> Result<Vec<RecordId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.heartbeat(
            worker_id,
            known_ids,
            now,
            &self.options,
            &self.metrics,
        ))
    }

    async fn mark_complete(&self, id: RecordId, worker_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.finish(id, worker_id, |record| record.complete(now)))
    }

    async fn mark_failed(
        &self,
        id: RecordId,
        worker_id: &str,
        message: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.finish(id, worker_id, |record| {
            record.fail(now, message.to_string())
        }))
    }

    async fn queued_count(&self) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ready.len())
    }

    async fn max_duration_in_queue(&self) -> Result<Option<Duration>, StoreError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let oldest = state
            .ready
            .iter()
            .find(|(_, id)| state.records.get(id).is_some_and(|r| r.is_eligible(now)))
            .map(|(queued_at, _)| *queued_at);
        Ok(oldest.map(|queued_at| (now - queued_at).to_std().unwrap_or(Duration::ZERO)))
    }

    async fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        let state = self.state.lock().await;
        Ok(state.counts_by_state())
    }

    async fn get(&self, id: RecordId) -> Result<Option<JobRecord<P>>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.records.get(&id).cloned())
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> ResetStore for MemoryStore<P> {
    fn options(&self) -> &StoreOptions {
        &self.options
    }

    async fn stalled_ids(&self) -> Result<Vec<RecordId>, StoreError> {
        let stalled_cutoff = cutoff(self.clock.now(), self.options.stalled_max_age);
        let state = self.state.lock().await;
        let mut ids: Vec<RecordId> = state
            .leased
            .values()
            .flatten()
            .filter(|id| {
                state
                    .records
                    .get(*id)
                    .is_some_and(|r| r.is_stalled(stalled_cutoff))
            })
            .copied()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn reset_stalled(&self, id: RecordId) -> Result<ResetOutcome, StoreError> {
        let now = self.clock.now();
        let stalled_cutoff = cutoff(now, self.options.stalled_max_age);
        let mut state = self.state.lock().await;
        let record = state.records.get(&id).ok_or(StoreError::NotFound(id))?;
        // Re-validate: a heartbeat may have landed since the scan.
        if !record.is_stalled(stalled_cutoff) {
            return Ok(ResetOutcome::Skipped);
        }
        Ok(state.reclaim(id, now, self.options.max_num_resets))
    }

    async fn requeue(&self, id: RecordId, after: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.ensure_processing(id, RecordState::Queued)?;
        state.unlease(id);
        if let Some(record) = state.records.get_mut(&id) {
            record.requeue(after);
            let key = (record.queued_at, id);
            state.ready.insert(key);
        }
        Ok(())
    }

    async fn mark_errored(&self, id: RecordId, message: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.ensure_processing(id, RecordState::Errored)?;
        state.unlease(id);
        if let Some(record) = state.records.get_mut(&id) {
            record.error(now, message.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MockClock;
    use chrono::TimeZone;
    use rstest::rstest;

    fn clock() -> MockClock {
        MockClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
    }

    fn store(clock: &MockClock) -> MemoryStore<&'static str> {
        let options = StoreOptions {
            name: "test".to_string(),
            stalled_max_age: Duration::from_secs(5),
            max_num_resets: 3,
            unreported_max_age: Duration::from_secs(1),
        };
        MemoryStore::with_clock(options, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn dequeue_is_fifo_by_enqueue_time() {
        let clock = clock();
        let store = store(&clock);
        let a = store.insert("a").await.unwrap();
        clock.advance(Duration::from_secs(1));
        let b = store.insert("b").await.unwrap();

        let first = store.dequeue("w1").await.unwrap().unwrap();
        let second = store.dequeue("w1").await.unwrap().unwrap();

        assert_eq!((first.id, second.id), (a, b));
        assert_eq!(first.payload, "a");
        assert_eq!(first.state, RecordState::Processing);
        assert_eq!(first.worker_owner.as_deref(), Some("w1"));
        assert_eq!(first.started_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn empty_queue_is_not_an_error() {
        let clock = clock();
        let store = store(&clock);
        assert!(store.dequeue("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delayed_records_wait_for_process_after() {
        let clock = clock();
        let store = store(&clock);
        let later = clock.now() + chrono::TimeDelta::seconds(10);
        let delayed = store.insert_after("later", later).await.unwrap();
        let now = store.insert("now").await.unwrap();

        assert_eq!(store.dequeue("w1").await.unwrap().unwrap().id, now);
        assert!(store.dequeue("w1").await.unwrap().is_none());
        assert_eq!(store.queued_count().await.unwrap(), 1);

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.dequeue("w1").await.unwrap().unwrap().id, delayed);
    }

    #[tokio::test]
    async fn terminal_writes_require_ownership() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        assert!(!store.mark_complete(id, "w2").await.unwrap());
        assert!(store.mark_complete(id, "w1").await.unwrap());
        // Already terminal: a second write is a no-op.
        assert!(!store.mark_failed(id, "w1", "late").await.unwrap());

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Completed);
        assert!(record.finished_at.is_some());
        assert!(record.failure_message.is_none());
    }

    #[tokio::test]
    async fn mark_failed_records_message() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        assert!(store.mark_failed(id, "w1", "boom").await.unwrap());

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Failed);
        assert_eq!(record.num_failures, 1);
        assert_eq!(record.failure_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn heartbeat_renews_owned_records() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        clock.advance(Duration::from_secs(30));
        let unknown = store.heartbeat("w1", &[id]).await.unwrap();

        assert!(unknown.is_empty());
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.last_heartbeat_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn heartbeat_reports_records_owned_by_someone_else() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        let unknown = store.heartbeat("w2", &[id, RecordId::new(99)]).await.unwrap();

        assert_eq!(unknown, vec![id, RecordId::new(99)]);
        // w1 keeps its lease.
        assert!(store.get(id).await.unwrap().unwrap().is_owned_by("w1"));
    }

    #[rstest]
    #[case::within_grace(Duration::from_millis(500), false)]
    #[case::past_grace(Duration::from_secs(2), true)]
    #[tokio::test]
    async fn unreported_records_have_a_grace_period(
        #[case] elapsed: Duration,
        #[case] reported_unknown: bool,
    ) {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        clock.advance(elapsed);
        let unknown = store.heartbeat("w1", &[]).await.unwrap();

        assert_eq!(unknown.contains(&id), reported_unknown);
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.is_owned_by("w1"), !reported_unknown);
    }

    #[tokio::test]
    async fn unreported_record_is_requeued_with_a_reset() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.heartbeat("w1", &[]).await.unwrap(), vec![id]);

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Queued);
        assert_eq!(record.num_resets, 1);
        assert!(record.worker_owner.is_none());
        assert_eq!(store.dequeue("w2").await.unwrap().unwrap().id, id);
    }

    #[tokio::test]
    async fn stalled_records_are_requeued_then_errored() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();

        for expected in 1..=3 {
            store.dequeue("w1").await.unwrap().unwrap();
            clock.advance(Duration::from_secs(6));
            assert_eq!(store.stalled_ids().await.unwrap(), vec![id]);
            assert_eq!(
                store.reset_stalled(id).await.unwrap(),
                ResetOutcome::Requeued { num_resets: expected }
            );
        }

        store.dequeue("w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(6));
        assert_eq!(
            store.reset_stalled(id).await.unwrap(),
            ResetOutcome::Errored { num_resets: 3 }
        );

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Errored);
        assert_eq!(record.num_resets, 3);
        assert_eq!(record.failure_message.as_deref(), Some(MAX_RESETS_MESSAGE));
        assert_eq!(store.reset_stalled(id).await.unwrap(), ResetOutcome::Skipped);
        assert!(store.stalled_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reset_is_skipped_when_heartbeat_lands_after_scan() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();

        clock.advance(Duration::from_secs(6));
        assert_eq!(store.stalled_ids().await.unwrap(), vec![id]);

        store.heartbeat("w1", &[id]).await.unwrap();
        assert_eq!(store.reset_stalled(id).await.unwrap(), ResetOutcome::Skipped);
        assert!(store.get(id).await.unwrap().unwrap().is_owned_by("w1"));
    }

    #[tokio::test]
    async fn stale_worker_cannot_complete_reset_record() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();
        store.dequeue("w1").await.unwrap();
        clock.advance(Duration::from_secs(6));
        store.reset_stalled(id).await.unwrap();
        store.dequeue("w2").await.unwrap().unwrap();

        assert!(!store.mark_complete(id, "w1").await.unwrap());
        assert!(store.mark_complete(id, "w2").await.unwrap());
    }

    #[tokio::test]
    async fn requeue_and_mark_errored_only_apply_to_processing() {
        let clock = clock();
        let store = store(&clock);
        let id = store.insert("a").await.unwrap();

        assert!(matches!(
            store.requeue(id, None).await,
            Err(StoreError::InvalidTransition { from: RecordState::Queued, .. })
        ));
        assert!(matches!(
            store.mark_errored(RecordId::new(404), "x").await,
            Err(StoreError::NotFound(_))
        ));

        store.dequeue("w1").await.unwrap();
        let after = clock.now() + chrono::TimeDelta::seconds(30);
        store.requeue(id, Some(after)).await.unwrap();
        assert!(store.dequeue("w1").await.unwrap().is_none());

        clock.advance(Duration::from_secs(30));
        store.dequeue("w1").await.unwrap().unwrap();
        store.mark_errored(id, "operator gave up").await.unwrap();
        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Errored);
        assert_eq!(record.failure_message.as_deref(), Some("operator gave up"));
    }

    #[tokio::test]
    async fn queue_statistics() {
        let clock = clock();
        let store = store(&clock);
        assert_eq!(store.max_duration_in_queue().await.unwrap(), None);

        store.insert("a").await.unwrap();
        clock.advance(Duration::from_secs(3));
        store.insert("b").await.unwrap();
        clock.advance(Duration::from_secs(4));

        assert_eq!(store.queued_count().await.unwrap(), 2);
        assert_eq!(
            store.max_duration_in_queue().await.unwrap(),
            Some(Duration::from_secs(7))
        );

        store.dequeue("w1").await.unwrap();
        let counts = store.counts_by_state().await.unwrap();
        assert_eq!(counts.queued, 1);
        assert_eq!(counts.processing, 1);
    }

    #[tokio::test]
    async fn ids_start_where_configured() {
        let clock = clock();
        let store = store(&clock).with_next_id(41);
        assert_eq!(store.insert("a").await.unwrap(), RecordId::new(41));
        assert_eq!(store.insert("b").await.unwrap(), RecordId::new(42));
    }

    #[tokio::test]
    async fn exhausted_id_space_is_an_error() {
        let clock = clock();
        let store = store(&clock).with_next_id(i64::MAX);
        assert_eq!(store.insert("a").await.unwrap(), RecordId::new(i64::MAX));
        assert!(matches!(
            store.insert("b").await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.queued_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn heartbeat_reclaims_are_counted() {
        let clock = clock();
        let metrics = Arc::new(ResetterMetrics::default());
        let options = StoreOptions {
            name: "test".to_string(),
            stalled_max_age: Duration::from_secs(5),
            max_num_resets: 1,
            unreported_max_age: Duration::from_secs(1),
        };
        let store = MemoryStore::with_clock(options, Arc::new(clock.clone()))
            .with_metrics(Arc::clone(&metrics));
        let id = store.insert("a").await.unwrap();

        store.dequeue("w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.heartbeat("w1", &[]).await.unwrap(), vec![id]);
        assert_eq!(metrics.snapshot().record_resets, 1);

        store.dequeue("w1").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(2));
        assert_eq!(store.heartbeat("w1", &[]).await.unwrap(), vec![id]);

        let snapshot = store.metrics().snapshot();
        assert_eq!(snapshot.record_resets, 1);
        assert_eq!(snapshot.record_reset_failures, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().state, RecordState::Errored);
    }
}
