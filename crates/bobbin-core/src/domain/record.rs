//! Job record: lifecycle metadata + opaque payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RecordId, RecordState};

/// Anything the worker loop can schedule: it only needs an identity.
///
/// Handlers are generic over this trait rather than over a concrete record
/// type, so a store may hand out its own record shape.
pub trait Record: Send + Sync + 'static {
    fn record_id(&self) -> RecordId;
}

/// A unit of schedulable work as the store sees it.
///
/// Design:
/// - The store owns the authoritative copy; callers only ever get clones.
/// - All state transitions happen through the methods below, the store decides
///   *whether* a transition is allowed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord<P> {
    pub id: RecordId,
    pub state: RecordState,
    pub payload: P,

    /// Worker holding the lease. Only set while `Processing`.
    pub worker_owner: Option<String>,

    /// Last lease renewal. Only meaningful while `Processing`.
    pub last_heartbeat_at: Option<DateTime<Utc>>,

    /// FIFO ordering key.
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Not eligible for dequeue before this instant.
    pub process_after: Option<DateTime<Utc>>,

    pub num_resets: u32,
    pub num_failures: u32,
    pub failure_message: Option<String>,
}

impl<P: Send + Sync + 'static> Record for JobRecord<P> {
    fn record_id(&self) -> RecordId {
        self.id
    }
}

impl<P> JobRecord<P> {
    pub fn new(
        id: RecordId,
        payload: P,
        queued_at: DateTime<Utc>,
        process_after: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            state: RecordState::Queued,
            payload,
            worker_owner: None,
            last_heartbeat_at: None,
            queued_at,
            started_at: None,
            finished_at: None,
            process_after,
            num_resets: 0,
            num_failures: 0,
            failure_message: None,
        }
    }

    /// Is this record currently leased to `worker_id`?
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.state == RecordState::Processing && self.worker_owner.as_deref() == Some(worker_id)
    }

    /// Can this record be dequeued at `now`?
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == RecordState::Queued && self.process_after.is_none_or(|after| after <= now)
    }

    /// Is this record processing with a lease last renewed before `cutoff`?
    pub fn is_stalled(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == RecordState::Processing
            && self.last_heartbeat_at.is_some_and(|at| at < cutoff)
    }

    /// Lease the record to `worker_id`.
    pub fn claim(&mut self, worker_id: &str, now: DateTime<Utc>) {
        self.state = RecordState::Processing;
        self.worker_owner = Some(worker_id.to_string());
        self.started_at = Some(now);
        self.last_heartbeat_at = Some(now);
        self.finished_at = None;
    }

    /// Renew the lease. The heartbeat timestamp never moves backwards.
    pub fn renew(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(match self.last_heartbeat_at {
            Some(last) if last > now => last,
            _ => now,
        });
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = RecordState::Completed;
        self.worker_owner = None;
        self.finished_at = Some(now);
    }

    pub fn fail(&mut self, now: DateTime<Utc>, message: String) {
        self.state = RecordState::Failed;
        self.worker_owner = None;
        self.finished_at = Some(now);
        self.num_failures += 1;
        self.failure_message = Some(message);
    }

    /// Drop the lease and make the record claimable again (after `after`, if set).
    pub fn requeue(&mut self, after: Option<DateTime<Utc>>) {
        self.state = RecordState::Queued;
        self.worker_owner = None;
        self.started_at = None;
        self.last_heartbeat_at = None;
        self.process_after = after;
    }

    /// Terminal failure decided by the store rather than the handler.
    pub fn error(&mut self, now: DateTime<Utc>, message: String) {
        self.state = RecordState::Errored;
        self.worker_owner = None;
        self.finished_at = Some(now);
        self.failure_message = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn queued() -> JobRecord<()> {
        JobRecord::new(RecordId::new(1), (), t0(), None)
    }

    #[test]
    fn new_record_starts_queued() {
        let record = queued();
        assert_eq!(record.state, RecordState::Queued);
        assert_eq!(record.num_resets, 0);
        assert_eq!(record.num_failures, 0);
        assert!(record.worker_owner.is_none());
        assert_eq!(record.record_id(), RecordId::new(1));
    }

    #[test]
    fn claim_sets_lease_fields() {
        let mut record = queued();
        record.claim("w1", t0());

        assert!(record.is_owned_by("w1"));
        assert!(!record.is_owned_by("w2"));
        assert_eq!(record.started_at, Some(t0()));
        assert_eq!(record.last_heartbeat_at, Some(t0()));
    }

    #[test]
    fn renew_never_moves_backwards() {
        let mut record = queued();
        record.claim("w1", t0() + Duration::seconds(10));

        record.renew(t0());
        assert_eq!(record.last_heartbeat_at, Some(t0() + Duration::seconds(10)));

        record.renew(t0() + Duration::seconds(20));
        assert_eq!(record.last_heartbeat_at, Some(t0() + Duration::seconds(20)));
    }

    #[test]
    fn process_after_delays_eligibility() {
        let record = JobRecord::new(RecordId::new(1), (), t0(), Some(t0() + Duration::seconds(5)));
        assert!(!record.is_eligible(t0()));
        assert!(record.is_eligible(t0() + Duration::seconds(5)));
    }

    #[test]
    fn requeue_clears_lease() {
        let mut record = queued();
        record.claim("w1", t0());
        record.requeue(None);

        assert_eq!(record.state, RecordState::Queued);
        assert!(record.worker_owner.is_none());
        assert!(record.started_at.is_none());
        assert!(record.last_heartbeat_at.is_none());
        assert!(record.is_eligible(t0()));
    }

    #[test]
    fn stalled_only_when_processing_and_old() {
        let mut record = queued();
        assert!(!record.is_stalled(t0() + Duration::seconds(60)));

        record.claim("w1", t0());
        assert!(!record.is_stalled(t0()));
        assert!(record.is_stalled(t0() + Duration::seconds(1)));
    }

    #[test]
    fn fail_counts_failures() {
        let mut record = queued();
        record.claim("w1", t0());
        record.fail(t0(), "boom".to_string());

        assert_eq!(record.state, RecordState::Failed);
        assert_eq!(record.num_failures, 1);
        assert_eq!(record.failure_message.as_deref(), Some("boom"));
        assert!(!record.is_owned_by("w1"));
    }
}
