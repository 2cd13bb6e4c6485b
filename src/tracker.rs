use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};

use crate::model::{PayloadFingerprint, TransactionId, UnixTimeMs};
use crate::transport::{FailureKind, TransportError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Pending,
    Acknowledged,
    TransientFailure,
    PermanentFailure,
}

impl AttemptOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, AttemptOutcome::Acknowledged | AttemptOutcome::PermanentFailure)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId {
    pub tid: TransactionId,
    pub sequence_number: u64,
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.tid, self.sequence_number)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub tid: TransactionId,
    pub sequence_number: u64,
    pub payload_fingerprint: PayloadFingerprint,
    pub outcome: AttemptOutcome,
    /// Transmissions made so far, the first one included.
    pub attempt_count: u32,
    pub errors: Vec<String>,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

impl DeliveryAttempt {
    const MAX_ERRORS: usize = 10;

    pub fn id(&self) -> AttemptId {
        AttemptId {
            tid: self.tid.clone(),
            sequence_number: self.sequence_number,
        }
    }

    fn record_error(&mut self, error: String) {
        if self.errors.len() >= Self::MAX_ERRORS {
            self.errors.remove(0);
        }
        self.errors.push(error);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RollbackReason {
    PermanentFailure,
    RetriesExhausted,
    SequenceConflict,
    Cancelled,
}

/// What the orchestrator should do after an outcome was recorded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    Acknowledged,
    Retry { attempt_count: u32 },
    Rollback(RollbackReason),
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("no attempts recorded for tid {0}")]
    UnknownTransaction(TransactionId),

    #[error("unknown attempt {0}")]
    UnknownAttempt(AttemptId),

    #[error("attempt {0} is still unresolved")]
    AttemptOutstanding(AttemptId),

    #[error("tid {tid} is marked for rollback ({reason:?})")]
    RollbackPending {
        tid: TransactionId,
        reason: RollbackReason,
    },

    #[error("attempt {id} cannot move from {from:?} to {to:?}")]
    InvalidOutcome {
        id: AttemptId,
        from: AttemptOutcome,
        to: AttemptOutcome,
    },

    #[error("attempt {id} is not eligible for retry ({outcome:?}, {attempt_count} transmissions)")]
    NotRetryable {
        id: AttemptId,
        outcome: AttemptOutcome,
        attempt_count: u32,
    },

    #[error("tracker lock poisoned")]
    LockPoisoned,
}

#[derive(Default)]
struct Ledger {
    next_sequence: u64,
    attempts: Vec<DeliveryAttempt>,
    rollback: Option<RollbackReason>,
}

impl Ledger {
    fn attempt_mut(&mut self, id: &AttemptId) -> Result<&mut DeliveryAttempt, TrackerError> {
        self.attempts
            .iter_mut()
            .find(|a| a.sequence_number == id.sequence_number)
            .ok_or_else(|| TrackerError::UnknownAttempt(id.clone()))
    }

    fn mark_rollback(&mut self, reason: RollbackReason) -> RollbackReason {
        *self.rollback.get_or_insert(reason)
    }
}

/// Per-TID ordered record of delivery attempts.
///
/// Sequence numbers start at 1 and follow the order in which attempts are
/// recorded. A new attempt is only accepted once the previous one is
/// resolved, so retries can never interleave with later sends.
pub struct DeliveryTracker {
    max_attempts: u32,
    ledgers: Mutex<HashMap<TransactionId, Ledger>>,
}

impl DeliveryTracker {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ledgers: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TransactionId, Ledger>>, TrackerError> {
        self.ledgers.lock().map_err(|_| TrackerError::LockPoisoned)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Creates a pending attempt with the next sequence number for `tid`.
    pub fn record(
        &self,
        tid: &TransactionId,
        payload_fingerprint: PayloadFingerprint,
        now: UnixTimeMs,
    ) -> Result<DeliveryAttempt, TrackerError> {
        let mut ledgers = self.lock()?;
        let ledger = ledgers.entry(tid.clone()).or_default();

        if let Some(reason) = ledger.rollback {
            return Err(TrackerError::RollbackPending {
                tid: tid.clone(),
                reason,
            });
        }
        if let Some(open) = ledger.attempts.iter().find(|a| !a.outcome.is_resolved()) {
            return Err(TrackerError::AttemptOutstanding(open.id()));
        }

        ledger.next_sequence += 1;
        let attempt = DeliveryAttempt {
            tid: tid.clone(),
            sequence_number: ledger.next_sequence,
            payload_fingerprint,
            outcome: AttemptOutcome::Pending,
            attempt_count: 1,
            errors: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        ledger.attempts.push(attempt.clone());
        debug!(
            attempt = %attempt.id(),
            fingerprint = %payload_fingerprint,
            "delivery attempt recorded"
        );
        Ok(attempt)
    }

    pub fn mark_outcome(
        &self,
        id: &AttemptId,
        outcome: AttemptOutcome,
        now: UnixTimeMs,
    ) -> Result<Disposition, TrackerError> {
        let mut ledgers = self.lock()?;
        let ledger = ledgers
            .get_mut(&id.tid)
            .ok_or_else(|| TrackerError::UnknownTransaction(id.tid.clone()))?;
        let max_attempts = self.max_attempts;

        let attempt = ledger.attempt_mut(id)?;
        let attempt_count = attempt.attempt_count;
        let rollback = match (attempt.outcome, outcome) {
            (AttemptOutcome::Pending, AttemptOutcome::Acknowledged) => None,
            (AttemptOutcome::Pending, AttemptOutcome::TransientFailure)
                if attempt_count < max_attempts =>
            {
                None
            }
            (AttemptOutcome::Pending, AttemptOutcome::TransientFailure) => {
                warn!(attempt = %id, attempt_count, "retry limit reached");
                Some(RollbackReason::RetriesExhausted)
            }
            (AttemptOutcome::Pending, AttemptOutcome::PermanentFailure) => {
                Some(RollbackReason::PermanentFailure)
            }
            (from, to) => {
                return Err(TrackerError::InvalidOutcome {
                    id: id.clone(),
                    from,
                    to,
                })
            }
        };
        attempt.outcome = outcome;
        attempt.updated_at = now;

        let disposition = match rollback {
            Some(reason) => Disposition::Rollback(ledger.mark_rollback(reason)),
            None if outcome == AttemptOutcome::Acknowledged => Disposition::Acknowledged,
            None => Disposition::Retry { attempt_count },
        };
        debug!(attempt = %id, ?outcome, ?disposition, "delivery outcome recorded");
        Ok(disposition)
    }

    /// Records a transport failure for a pending attempt.
    pub fn mark_failed(
        &self,
        id: &AttemptId,
        error: &TransportError,
        now: UnixTimeMs,
    ) -> Result<Disposition, TrackerError> {
        let outcome = match error.kind() {
            FailureKind::Transient => AttemptOutcome::TransientFailure,
            FailureKind::Permanent => AttemptOutcome::PermanentFailure,
        };
        self.with_attempt(id, |attempt| attempt.record_error(error.to_string()))?;

        if let TransportError::SequenceConflict { .. } = error {
            self.force_rollback(&id.tid, RollbackReason::SequenceConflict)?;
        }
        self.mark_outcome(id, outcome, now)
    }

    /// Resolves a pending attempt whose acknowledgement will never be
    /// awaited.
    pub fn mark_cancelled(
        &self,
        id: &AttemptId,
        now: UnixTimeMs,
    ) -> Result<Disposition, TrackerError> {
        self.with_attempt(id, |attempt| {
            attempt.record_error("acknowledgement wait cancelled".into());
        })?;
        let disposition = self.force_rollback(&id.tid, RollbackReason::Cancelled)?;
        let pending = self.attempt(id).map_or(false, |a| a.outcome == AttemptOutcome::Pending);
        if pending {
            return self.mark_outcome(id, AttemptOutcome::PermanentFailure, now);
        }
        Ok(disposition)
    }

    /// Reopens a transiently failed attempt for an idempotent resend under
    /// the same tid and sequence number.
    pub fn retry(&self, id: &AttemptId, now: UnixTimeMs) -> Result<DeliveryAttempt, TrackerError> {
        let mut ledgers = self.lock()?;
        let ledger = ledgers
            .get_mut(&id.tid)
            .ok_or_else(|| TrackerError::UnknownTransaction(id.tid.clone()))?;

        if let Some(reason) = ledger.rollback {
            return Err(TrackerError::RollbackPending {
                tid: id.tid.clone(),
                reason,
            });
        }

        let max_attempts = self.max_attempts;
        let attempt = ledger.attempt_mut(id)?;
        if attempt.outcome != AttemptOutcome::TransientFailure
            || attempt.attempt_count >= max_attempts
        {
            return Err(TrackerError::NotRetryable {
                id: id.clone(),
                outcome: attempt.outcome,
                attempt_count: attempt.attempt_count,
            });
        }

        attempt.outcome = AttemptOutcome::Pending;
        attempt.attempt_count += 1;
        attempt.updated_at = now;
        debug!(
            attempt = %id,
            attempt_count = attempt.attempt_count,
            "delivery attempt reopened for resend"
        );
        Ok(attempt.clone())
    }

    /// Marks `tid` for rollback; the first reason recorded wins.
    pub fn force_rollback(
        &self,
        tid: &TransactionId,
        reason: RollbackReason,
    ) -> Result<Disposition, TrackerError> {
        let mut ledgers = self.lock()?;
        let ledger = ledgers.entry(tid.clone()).or_default();
        Ok(Disposition::Rollback(ledger.mark_rollback(reason)))
    }

    pub fn rollback_reason(&self, tid: &TransactionId) -> Option<RollbackReason> {
        self.lock().ok()?.get(tid).and_then(|l| l.rollback)
    }

    pub fn requires_rollback(&self, tid: &TransactionId) -> bool {
        self.rollback_reason(tid).is_some()
    }

    pub fn attempt(&self, id: &AttemptId) -> Option<DeliveryAttempt> {
        self.lock()
            .ok()?
            .get(&id.tid)?
            .attempts
            .iter()
            .find(|a| a.sequence_number == id.sequence_number)
            .cloned()
    }

    pub fn attempts(&self, tid: &TransactionId) -> Vec<DeliveryAttempt> {
        self.lock()
            .ok()
            .and_then(|ledgers| ledgers.get(tid).map(|l| l.attempts.clone()))
            .unwrap_or_default()
    }

    /// Drops the ledger of a finished transaction, returning its attempts.
    pub fn forget(&self, tid: &TransactionId) -> Vec<DeliveryAttempt> {
        self.lock()
            .ok()
            .and_then(|mut ledgers| ledgers.remove(tid))
            .map(|l| l.attempts)
            .unwrap_or_default()
    }

    pub fn tracked_count(&self) -> usize {
        self.lock().map_or(0, |ledgers| ledgers.len())
    }

    fn with_attempt(
        &self,
        id: &AttemptId,
        f: impl FnOnce(&mut DeliveryAttempt),
    ) -> Result<(), TrackerError> {
        let mut ledgers = self.lock()?;
        let ledger = ledgers
            .get_mut(&id.tid)
            .ok_or_else(|| TrackerError::UnknownTransaction(id.tid.clone()))?;
        f(ledger.attempt_mut(id)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tid(s: &str) -> TransactionId {
        TransactionId::new(s).unwrap()
    }

    fn fp(byte: u8) -> PayloadFingerprint {
        PayloadFingerprint::from_bytes([byte; 32])
    }

    fn make_now() -> UnixTimeMs {
        UnixTimeMs(1_700_000_000_000)
    }

    #[test]
    fn test_sequence_numbers_start_at_one_and_increase() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");

        let first = tracker.record(&t, fp(1), make_now()).unwrap();
        tracker.mark_outcome(&first.id(), AttemptOutcome::Acknowledged, make_now()).unwrap();
        let second = tracker.record(&t, fp(2), make_now()).unwrap();

        assert_eq!(first.sequence_number, 1);
        assert_eq!(second.sequence_number, 2);
    }

    #[test]
    fn test_sequences_are_independent_per_tid() {
        let tracker = DeliveryTracker::new(3);
        let a = tracker.record(&tid("T1"), fp(1), make_now()).unwrap();
        let b = tracker.record(&tid("T2"), fp(1), make_now()).unwrap();
        assert_eq!(a.sequence_number, 1);
        assert_eq!(b.sequence_number, 1);
    }

    #[test]
    fn test_unresolved_attempt_blocks_next_record() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");
        let first = tracker.record(&t, fp(1), make_now()).unwrap();

        assert!(matches!(
            tracker.record(&t, fp(2), make_now()),
            Err(TrackerError::AttemptOutstanding(id)) if id == first.id()
        ));

        tracker.mark_outcome(&first.id(), AttemptOutcome::TransientFailure, make_now()).unwrap();
        assert!(matches!(
            tracker.record(&t, fp(2), make_now()),
            Err(TrackerError::AttemptOutstanding(_))
        ));
    }

    #[test]
    fn test_retry_keeps_sequence_number() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        let disposition = tracker
            .mark_outcome(&attempt.id(), AttemptOutcome::TransientFailure, make_now())
            .unwrap();
        assert_eq!(disposition, Disposition::Retry { attempt_count: 1 });

        let resent = tracker.retry(&attempt.id(), make_now()).unwrap();
        assert_eq!(resent.sequence_number, attempt.sequence_number);
        assert_eq!(resent.attempt_count, 2);
        assert_eq!(resent.outcome, AttemptOutcome::Pending);
        assert_eq!(tracker.attempts(&t).len(), 1);
    }

    #[test]
    fn test_retry_limit_forces_rollback() {
        let tracker = DeliveryTracker::new(2);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        tracker.mark_outcome(&attempt.id(), AttemptOutcome::TransientFailure, make_now()).unwrap();
        tracker.retry(&attempt.id(), make_now()).unwrap();
        let disposition = tracker
            .mark_outcome(&attempt.id(), AttemptOutcome::TransientFailure, make_now())
            .unwrap();

        assert_eq!(disposition, Disposition::Rollback(RollbackReason::RetriesExhausted));
        assert!(tracker.requires_rollback(&t));
        assert!(matches!(
            tracker.retry(&attempt.id(), make_now()),
            Err(TrackerError::RollbackPending { .. })
        ));
        assert!(matches!(
            tracker.record(&t, fp(2), make_now()),
            Err(TrackerError::RollbackPending { .. })
        ));
    }

    #[test]
    fn test_permanent_failure_forces_rollback() {
        let tracker = DeliveryTracker::new(5);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        let disposition = tracker
            .mark_failed(&attempt.id(), &TransportError::permanent("AUTH", "denied"), make_now())
            .unwrap();
        assert_eq!(disposition, Disposition::Rollback(RollbackReason::PermanentFailure));
        assert_eq!(tracker.attempt(&attempt.id()).unwrap().errors.len(), 1);
    }

    #[test]
    fn test_sequence_conflict_is_its_own_rollback_reason() {
        let tracker = DeliveryTracker::new(5);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        let conflict = TransportError::SequenceConflict {
            tid: t.clone(),
            expected: 2,
            received: 1,
        };
        let disposition = tracker.mark_failed(&attempt.id(), &conflict, make_now()).unwrap();
        assert_eq!(disposition, Disposition::Rollback(RollbackReason::SequenceConflict));
    }

    #[test]
    fn test_acknowledged_attempt_cannot_change() {
        let tracker = DeliveryTracker::new(3);
        let attempt = tracker.record(&tid("T1"), fp(1), make_now()).unwrap();
        tracker.mark_outcome(&attempt.id(), AttemptOutcome::Acknowledged, make_now()).unwrap();

        assert!(matches!(
            tracker.mark_outcome(&attempt.id(), AttemptOutcome::TransientFailure, make_now()),
            Err(TrackerError::InvalidOutcome { .. })
        ));
        assert!(matches!(
            tracker.retry(&attempt.id(), make_now()),
            Err(TrackerError::NotRetryable { .. })
        ));
    }

    #[test]
    fn test_pending_is_not_a_resolution() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        assert!(matches!(
            tracker.mark_outcome(&attempt.id(), AttemptOutcome::Pending, make_now()),
            Err(TrackerError::InvalidOutcome {
                from: AttemptOutcome::Pending,
                to: AttemptOutcome::Pending,
                ..
            })
        ));
        assert_eq!(tracker.attempt(&attempt.id()).unwrap().outcome, AttemptOutcome::Pending);
        assert!(!tracker.requires_rollback(&t));
    }

    #[test]
    fn test_cancelled_attempt_is_resolved_and_rolls_back() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");
        let attempt = tracker.record(&t, fp(1), make_now()).unwrap();

        let disposition = tracker.mark_cancelled(&attempt.id(), make_now()).unwrap();
        assert_eq!(disposition, Disposition::Rollback(RollbackReason::Cancelled));
        assert_eq!(
            tracker.attempt(&attempt.id()).unwrap().outcome,
            AttemptOutcome::PermanentFailure
        );
    }

    #[test]
    fn test_forget_drops_ledger() {
        let tracker = DeliveryTracker::new(3);
        let t = tid("T1");
        tracker.record(&t, fp(1), make_now()).unwrap();

        assert_eq!(tracker.forget(&t).len(), 1);
        assert_eq!(tracker.tracked_count(), 0);
        assert!(tracker.attempts(&t).is_empty());
    }

    proptest! {
        #[test]
        fn sequence_numbers_strictly_increase_under_any_retry_pattern(
            failures in proptest::collection::vec(0u32..4, 1..20),
        ) {
            let tracker = DeliveryTracker::new(5);
            let t = tid("T1");
            let mut observed = Vec::new();

            for (i, transient_failures) in failures.iter().enumerate() {
                let attempt = tracker.record(&t, fp(i as u8), make_now()).unwrap();
                observed.push(attempt.sequence_number);
                let id = attempt.id();

                for _ in 0..*transient_failures {
                    tracker
                        .mark_outcome(&id, AttemptOutcome::TransientFailure, make_now())
                        .unwrap();
                    let resent = tracker.retry(&id, make_now()).unwrap();
                    observed.push(resent.sequence_number);
                }
                tracker.mark_outcome(&id, AttemptOutcome::Acknowledged, make_now()).unwrap();
            }

            let mut distinct = observed.clone();
            distinct.dedup();
            prop_assert!(distinct.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(distinct.len(), failures.len());
            prop_assert_eq!(tracker.attempts(&t).len(), failures.len());
        }
    }
}
