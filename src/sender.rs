use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn, Level};

use crate::allocator::{AllocationError, TransactionIdAllocator};
use crate::config::{ConfigError, DeliveryConfig};
use crate::lock::{KeyGuard, KeyLocks};
use crate::model::{
    Destination, DocumentList, PayloadFingerprint, SendRequest, TransactionId, TransactionKey,
    UnixTimeMs, ValidationError,
};
use crate::store::{StoreError, TransactionIdStore, TransactionRecord, TransactionState};
use crate::tracker::{
    AttemptId, AttemptOutcome, DeliveryAttempt, DeliveryTracker, Disposition, RollbackReason,
    TrackerError,
};
use crate::transport::{RemoteTransport, TransportError};

// ============================================================================
// State Machine
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SenderState {
    Idle,
    AcquiringTid,
    Sending,
    AwaitingAck,
    Committing,
    RollingBack,
    Done,
}

impl SenderState {
    pub fn can_transition_to(&self, next: SenderState) -> bool {
        use SenderState::*;
        matches!(
            (self, next),
            (Idle, AcquiringTid)
                | (Idle, Done)
                | (AcquiringTid, Sending)
                | (AcquiringTid, RollingBack)
                | (AcquiringTid, Done)
                | (Sending, AwaitingAck)
                | (Sending, RollingBack)
                | (AwaitingAck, Sending)
                | (AwaitingAck, Committing)
                | (AwaitingAck, RollingBack)
                | (Committing, Done)
                | (Committing, RollingBack)
                | (RollingBack, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SenderState::Done)
    }
}

/// Current state plus every state visited, starting at `Idle`.
#[derive(Clone, Debug)]
struct StatePath {
    key: TransactionKey,
    history: Vec<SenderState>,
}

impl StatePath {
    fn new(key: TransactionKey) -> Self {
        Self {
            key,
            history: vec![SenderState::Idle],
        }
    }

    fn current(&self) -> SenderState {
        self.history.last().copied().unwrap_or(SenderState::Idle)
    }

    fn advance(&mut self, next: SenderState) {
        let from = self.current();
        if from == next {
            return;
        }
        if !from.can_transition_to(next) {
            error!(key = %self.key, ?from, to = ?next, "invalid sender state transition");
        }
        debug!(key = %self.key, ?from, to = ?next, "sender state changed");
        self.history.push(next);
    }
}

// ============================================================================
// Outcomes and Errors
// ============================================================================

/// Acknowledged delivery of one payload inside a transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tid: TransactionId,
    pub sequence_number: u64,
    pub attempt_count: u32,
    pub duplicate: bool,
    pub fingerprint: PayloadFingerprint,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub key: TransactionKey,
    pub tid: TransactionId,
    pub final_state: TransactionState,
    pub attempts: Vec<DeliveryAttempt>,
    pub path: Vec<SenderState>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered(DeliveryReport),
    /// Nothing to deliver; no TID was allocated and the target was not called.
    NoPayload,
}

impl SendOutcome {
    pub fn report(&self) -> Option<&DeliveryReport> {
        match self {
            SendOutcome::Delivered(report) => Some(report),
            SendOutcome::NoPayload => None,
        }
    }
}

/// A recently finished transaction, kept in a bounded ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub key: TransactionKey,
    pub tid: TransactionId,
    pub final_state: TransactionState,
    pub path: Vec<SenderState>,
    pub attempts: Vec<DeliveryAttempt>,
    pub finished_at: UnixTimeMs,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("tid allocation failed for {key}: {source}")]
    Allocation {
        key: TransactionKey,
        source: AllocationError,
    },

    #[error("delivery to {key} on tid {tid} failed: {source}")]
    Transport {
        key: TransactionKey,
        tid: TransactionId,
        source: TransportError,
    },

    #[error("delivery to {key} on tid {tid} gave up after {attempts} transmissions: {last_error}")]
    RetriesExhausted {
        key: TransactionKey,
        tid: TransactionId,
        attempts: u32,
        last_error: TransportError,
    },

    #[error("sequence conflict for {key} on tid {tid}: expected {expected}, target saw {received}")]
    SequenceConflict {
        key: TransactionKey,
        tid: TransactionId,
        expected: u64,
        received: u64,
    },

    #[error("no acknowledgement for {key} on tid {tid} within {after:?}")]
    Timeout {
        key: TransactionKey,
        tid: TransactionId,
        after: Duration,
    },

    #[error("send for {key} on tid {tid} was interrupted before its acknowledgement")]
    Interrupted {
        key: TransactionKey,
        tid: TransactionId,
    },

    #[error("commit of tid {tid} for {key} failed: {source}")]
    Commit {
        key: TransactionKey,
        tid: TransactionId,
        source: TransportError,
    },

    #[error("rollback of tid {tid} for {key} failed: {source}")]
    Rollback {
        key: TransactionKey,
        tid: TransactionId,
        source: TransportError,
    },

    #[error("delivery bookkeeping for {key} on tid {tid} failed: {source}")]
    Tracking {
        key: TransactionKey,
        tid: TransactionId,
        source: TrackerError,
    },

    #[error("transaction store error for {key}: {source}")]
    Store {
        key: TransactionKey,
        tid: Option<TransactionId>,
        source: StoreError,
    },

    #[error("document list for {key} is not encodable: {source}")]
    Payload {
        key: TransactionKey,
        source: ValidationError,
    },

    #[error("document list for {key} is empty")]
    EmptyPayload { key: TransactionKey },

    #[error("transaction scope for {key} is already finished")]
    ScopeClosed { key: TransactionKey },
}

impl SendError {
    pub fn key(&self) -> &TransactionKey {
        match self {
            SendError::Allocation { key, .. }
            | SendError::Transport { key, .. }
            | SendError::RetriesExhausted { key, .. }
            | SendError::SequenceConflict { key, .. }
            | SendError::Timeout { key, .. }
            | SendError::Interrupted { key, .. }
            | SendError::Commit { key, .. }
            | SendError::Rollback { key, .. }
            | SendError::Tracking { key, .. }
            | SendError::Store { key, .. }
            | SendError::Payload { key, .. }
            | SendError::EmptyPayload { key }
            | SendError::ScopeClosed { key } => key,
        }
    }

    pub fn tid(&self) -> Option<&TransactionId> {
        match self {
            SendError::Transport { tid, .. }
            | SendError::RetriesExhausted { tid, .. }
            | SendError::SequenceConflict { tid, .. }
            | SendError::Timeout { tid, .. }
            | SendError::Interrupted { tid, .. }
            | SendError::Commit { tid, .. }
            | SendError::Rollback { tid, .. }
            | SendError::Tracking { tid, .. } => Some(tid),
            SendError::Store { tid, .. } => tid.as_ref(),
            SendError::Allocation { .. }
            | SendError::Payload { .. }
            | SendError::EmptyPayload { .. }
            | SendError::ScopeClosed { .. } => None,
        }
    }

    /// Whether submitting the whole send again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SendError::Allocation { source, .. } => {
                !matches!(source, AllocationError::Permanent { .. })
            }
            SendError::RetriesExhausted { .. }
            | SendError::Timeout { .. }
            | SendError::Interrupted { .. } => true,
            SendError::Commit { source, .. } => source.is_retryable(),
            SendError::Transport { .. }
            | SendError::SequenceConflict { .. }
            | SendError::Rollback { .. }
            | SendError::Tracking { .. }
            | SendError::Store { .. }
            | SendError::Payload { .. }
            | SendError::EmptyPayload { .. }
            | SendError::ScopeClosed { .. } => false,
        }
    }

    fn emit(&self) {
        let tid = self.tid().map(TransactionId::as_str).unwrap_or("-");
        match self {
            SendError::SequenceConflict { .. } => {
                error!(
                    key = %self.key(),
                    tid,
                    error = %self,
                    "sequence conflict, delivery tracking is out of step with the target"
                );
            }
            SendError::Rollback { .. } | SendError::Tracking { .. } | SendError::Store { .. } => {
                error!(key = %self.key(), tid, error = %self, "send failed");
            }
            _ => warn!(key = %self.key(), tid, error = %self, "send failed"),
        }
    }
}

// ============================================================================
// Metrics and Observability
// ============================================================================

#[derive(Debug, Default)]
pub struct SenderMetrics {
    pub sends_started: AtomicU64,
    pub sends_delivered: AtomicU64,
    pub transactions_committed: AtomicU64,
    pub transactions_rolled_back: AtomicU64,
    pub transactions_expired: AtomicU64,
    pub retries: AtomicU64,
    pub no_payload: AtomicU64,
    pub allocation_failures: AtomicU64,
    pub sequence_conflicts: AtomicU64,
    pub timeouts: AtomicU64,
}

impl SenderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_started: self.sends_started.load(Ordering::Relaxed),
            sends_delivered: self.sends_delivered.load(Ordering::Relaxed),
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            transactions_expired: self.transactions_expired.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            no_payload: self.no_payload.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            sequence_conflicts: self.sequence_conflicts.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub sends_started: u64,
    pub sends_delivered: u64,
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub transactions_expired: u64,
    pub retries: u64,
    pub no_payload: u64,
    pub allocation_failures: u64,
    pub sequence_conflicts: u64,
    pub timeouts: u64,
}

// ============================================================================
// Sender
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum TargetCall {
    Commit,
    Rollback,
}

struct Inner<T: RemoteTransport> {
    transport: Arc<T>,
    allocator: TransactionIdAllocator<T>,
    store: Arc<TransactionIdStore>,
    tracker: DeliveryTracker,
    locks: KeyLocks,
    config: DeliveryConfig,
    metrics: SenderMetrics,
    recent: Mutex<lru::LruCache<TransactionId, TransactionOutcome>>,
}

impl<T: RemoteTransport> Inner<T> {
    /// Commit or rollback on the target, retrying transient failures under
    /// the commit policy.
    async fn call_target(
        &self,
        call: TargetCall,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError> {
        let policy = &self.config.commit;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let result = match call {
                TargetCall::Commit => self.transport.commit(destination, tid).await,
                TargetCall::Rollback => self.transport.rollback(destination, tid).await,
            };

            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && policy.allows_another(attempt) => {
                    let delay = policy.backoff(attempt);
                    warn!(
                        %tid,
                        ?call,
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "target call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Releases every resource bound to `tid` and records the outcome.
    fn finalize(
        &self,
        key: &TransactionKey,
        tid: &TransactionId,
        final_state: TransactionState,
        path: &StatePath,
    ) -> Vec<DeliveryAttempt> {
        match self.store.release(key, final_state) {
            Ok(_) => {}
            Err(StoreError::NotFound(_)) => {
                warn!(key = %key, %tid, "active record already gone at release, likely expired");
            }
            Err(error) => error!(key = %key, %tid, %error, "failed to release transaction record"),
        }
        self.allocator.retire(tid);
        let attempts = self.tracker.forget(tid);

        match final_state {
            TransactionState::Committed => {
                self.metrics.transactions_committed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::RolledBack => {
                self.metrics.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }

        let outcome = TransactionOutcome {
            key: key.clone(),
            tid: tid.clone(),
            final_state,
            path: path.history.clone(),
            attempts: attempts.clone(),
            finished_at: UnixTimeMs::now(),
        };
        self.recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(tid.clone(), outcome);
        attempts
    }

    /// Cleans up after a record the store expired.
    async fn discard_expired(&self, record: &TransactionRecord) {
        self.metrics.transactions_expired.fetch_add(1, Ordering::Relaxed);
        if let Err(error) = self
            .call_target(TargetCall::Rollback, record.key.destination(), &record.tid)
            .await
        {
            warn!(key = %record.key, tid = %record.tid, %error, "rollback of expired tid failed");
        }
        self.allocator.retire(&record.tid);
        self.tracker.forget(&record.tid);
        info!(key = %record.key, tid = %record.tid, "expired transaction discarded");
    }

    /// Finishes a scope that was dropped while still open. A scope dropped
    /// mid-commit has its commit re-issued; anything earlier is rolled back.
    async fn abandon(
        &self,
        tid: TransactionId,
        in_flight: Option<AttemptId>,
        mut path: StatePath,
        guard: Option<KeyGuard>,
    ) {
        let key = path.key.clone();
        if let Some(id) = in_flight {
            let _ = self.tracker.mark_cancelled(&id, UnixTimeMs::now());
        }
        let state = path.current();
        warn!(key = %key, %tid, ?state, "transaction scope dropped while open");

        if state == SenderState::Committing {
            match self.call_target(TargetCall::Commit, key.destination(), &tid).await {
                Ok(()) => {
                    path.advance(SenderState::Done);
                    info!(key = %key, %tid, "commit of abandoned tid completed");
                    self.finalize(&key, &tid, TransactionState::Committed, &path);
                    drop(guard);
                    return;
                }
                Err(error) => {
                    warn!(key = %key, %tid, %error, "commit of abandoned tid failed, rolling back");
                }
            }
        }

        path.advance(SenderState::RollingBack);
        if let Err(error) = self.call_target(TargetCall::Rollback, key.destination(), &tid).await {
            error!(key = %key, %tid, %error, "rollback of abandoned tid failed");
        }
        path.advance(SenderState::Done);
        self.finalize(&key, &tid, TransactionState::RolledBack, &path);
        drop(guard);
    }

    fn note_no_payload(&self, key: &TransactionKey) -> SendOutcome {
        self.metrics.no_payload.fetch_add(1, Ordering::Relaxed);
        warn!(key = %key, "no document list to send, skipping");
        SendOutcome::NoPayload
    }
}

/// Orchestrates tRFC delivery: TID acquisition, ordered idempotent sends and
/// the final commit or rollback. Cheap to clone.
pub struct TransactionalSender<T: RemoteTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: RemoteTransport> Clone for TransactionalSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: RemoteTransport + 'static> TransactionalSender<T> {
    pub fn new(transport: Arc<T>, config: DeliveryConfig) -> Result<Self, ConfigError> {
        let store = Arc::new(TransactionIdStore::new(
            config.idle_timeout_ms,
            config.recent_outcomes,
        ));
        Self::with_store(transport, store, config)
    }

    /// Builds a sender around an externally owned store.
    pub fn with_store(
        transport: Arc<T>,
        store: Arc<TransactionIdStore>,
        config: DeliveryConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let capacity = NonZeroUsize::new(config.recent_outcomes).unwrap_or(NonZeroUsize::MIN);
        let allocator = TransactionIdAllocator::with_retired_capacity(
            Arc::clone(&transport),
            config.allocation.clone(),
            config.recent_outcomes,
        );

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                allocator,
                store,
                tracker: DeliveryTracker::new(config.delivery.max_attempts),
                locks: KeyLocks::new(),
                config,
                metrics: SenderMetrics::new(),
                recent: Mutex::new(lru::LruCache::new(capacity)),
            }),
        })
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &TransactionIdStore {
        &self.inner.store
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.inner.tracker
    }

    pub fn allocator(&self) -> &TransactionIdAllocator<T> {
        &self.inner.allocator
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn recent_outcome(&self, tid: &TransactionId) -> Option<TransactionOutcome> {
        self.inner
            .recent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .peek(tid)
            .cloned()
    }

    /// Handles an inbound request. An absent or empty document list is a
    /// no-op reported as [`SendOutcome::NoPayload`].
    #[instrument(skip_all, fields(destination = %request.destination))]
    pub async fn process(&self, request: SendRequest) -> Result<SendOutcome, SendError> {
        let key = request.key();
        let payload = match request.payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Ok(self.inner.note_no_payload(&key)),
        };

        if tracing::enabled!(Level::DEBUG) {
            match payload.to_debug_json() {
                Ok(json) => debug!(
                    key = %key,
                    documents = payload.len(),
                    payload = %json,
                    "outbound document list"
                ),
                Err(error) => {
                    warn!(key = %key, %error, "failed to serialize document list for diagnostics");
                }
            }
        }

        let timeout = request.timeout.or_else(|| self.inner.config.ack_timeout());
        self.run_window(&key, std::slice::from_ref(&payload), timeout).await
    }

    /// Delivers one document list under its own TID and commits it.
    pub async fn send(
        &self,
        key: &TransactionKey,
        payload: &DocumentList,
    ) -> Result<SendOutcome, SendError> {
        self.run_window(key, std::slice::from_ref(payload), self.inner.config.ack_timeout())
            .await
    }

    pub async fn send_with_timeout(
        &self,
        key: &TransactionKey,
        payload: &DocumentList,
        timeout: Duration,
    ) -> Result<SendOutcome, SendError> {
        self.run_window(key, std::slice::from_ref(payload), Some(timeout))
            .await
    }

    /// Delivers several document lists under one TID, committing once all
    /// were acknowledged. Empty lists are skipped.
    pub async fn send_batch(
        &self,
        key: &TransactionKey,
        payloads: &[DocumentList],
    ) -> Result<SendOutcome, SendError> {
        self.run_window(key, payloads, self.inner.config.ack_timeout())
            .await
    }

    #[instrument(skip(self, payloads), fields(key = %key, payloads = payloads.len()))]
    async fn run_window(
        &self,
        key: &TransactionKey,
        payloads: &[DocumentList],
        timeout: Option<Duration>,
    ) -> Result<SendOutcome, SendError> {
        let documents: Vec<&DocumentList> = payloads.iter().filter(|p| !p.is_empty()).collect();
        if documents.is_empty() {
            return Ok(self.inner.note_no_payload(key));
        }

        let mut scope = self.begin(key).await;
        scope.set_timeout(timeout);

        for payload in documents {
            if let Err(error) = scope.send(payload).await {
                if !scope.is_finished() {
                    let _ = scope.rollback().await;
                }
                return Err(error);
            }
        }
        scope.commit().await
    }

    /// Opens a transaction window for `key`, waiting for any other window
    /// on the same key to finish first.
    pub async fn begin(&self, key: &TransactionKey) -> TransactionScope<T> {
        let guard = self.inner.locks.lock(key).await;
        debug!(key = %key, "transaction scope opened");
        TransactionScope {
            inner: Arc::clone(&self.inner),
            path: StatePath::new(key.clone()),
            key: key.clone(),
            guard: Some(guard),
            tid: None,
            in_flight: None,
            timeout: self.inner.config.ack_timeout(),
            finished: false,
        }
    }

    /// Expires idle records and rolls their TIDs back on the target.
    pub async fn reap_expired(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        self.reap_expired_at(UnixTimeMs::now()).await
    }

    pub async fn reap_expired_at(
        &self,
        now: UnixTimeMs,
    ) -> Result<Vec<TransactionRecord>, StoreError> {
        let expired = self.inner.store.expire_idle(now)?;
        for record in &expired {
            self.inner.discard_expired(record).await;
        }
        Ok(expired)
    }

    /// Drains the store, rolling back every transaction still active.
    pub async fn shutdown(&self) -> Result<usize, StoreError> {
        let drained = self.inner.store.clear()?;
        for record in &drained {
            self.inner.discard_expired(record).await;
        }
        info!(drained = drained.len(), "sender shut down");
        Ok(drained.len())
    }
}

// ============================================================================
// Transaction Scope
// ============================================================================

/// One open transaction window for a key. Holds the key exclusively until
/// it is committed, rolled back or dropped. A scope dropped while its TID
/// is open is rolled back in the background.
pub struct TransactionScope<T: RemoteTransport + 'static> {
    inner: Arc<Inner<T>>,
    key: TransactionKey,
    guard: Option<KeyGuard>,
    tid: Option<TransactionId>,
    path: StatePath,
    in_flight: Option<AttemptId>,
    timeout: Option<Duration>,
    finished: bool,
}

impl<T: RemoteTransport + 'static> TransactionScope<T> {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn tid(&self) -> Option<&TransactionId> {
        self.tid.as_ref()
    }

    pub fn state(&self) -> SenderState {
        self.path.current()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bounds each acknowledgement wait; `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Sends one document list as the next sequence number of this
    /// transaction and waits for its acknowledgement.
    #[instrument(skip_all, fields(key = %self.key, documents = payload.len()))]
    pub async fn send(&mut self, payload: &DocumentList) -> Result<Receipt, SendError> {
        self.ensure_open()?;
        if payload.is_empty() {
            return Err(SendError::EmptyPayload {
                key: self.key.clone(),
            });
        }
        self.check_interrupted().await?;

        let fingerprint = payload.fingerprint().map_err(|source| SendError::Payload {
            key: self.key.clone(),
            source,
        })?;
        self.inner.metrics.sends_started.fetch_add(1, Ordering::Relaxed);

        let tid = match self.tid.clone() {
            Some(tid) => {
                self.path.advance(SenderState::Sending);
                tid
            }
            None => self.acquire().await?,
        };

        let now = UnixTimeMs::now();
        if let Err(source) = self.inner.store.mark_in_use(&self.key, now) {
            let error = SendError::Store {
                key: self.key.clone(),
                tid: Some(tid),
                source,
            };
            return Err(self.abort(error).await);
        }

        let attempt = match self.inner.tracker.record(&tid, fingerprint, now) {
            Ok(attempt) => attempt,
            Err(source) => {
                let error = SendError::Tracking {
                    key: self.key.clone(),
                    tid,
                    source,
                };
                return Err(self.abort(error).await);
            }
        };
        self.in_flight = Some(attempt.id());

        self.deliver(payload, &tid, attempt).await
    }

    async fn acquire(&mut self) -> Result<TransactionId, SendError> {
        self.path.advance(SenderState::AcquiringTid);
        let inner = Arc::clone(&self.inner);

        match inner
            .store
            .lookup_or_create(&self.key, &inner.allocator, UnixTimeMs::now())
            .await
        {
            Ok(lookup) => {
                self.tid = Some(lookup.tid.clone());
                info!(key = %self.key, tid = %lookup.tid, reused = lookup.reused, "tid acquired");
                if let Some(expired) = lookup.expired {
                    let inner = Arc::clone(&inner);
                    tokio::spawn(async move {
                        inner.discard_expired(&expired).await;
                    });
                }
                self.path.advance(SenderState::Sending);
                Ok(lookup.tid)
            }
            Err(source) => {
                let error = match source {
                    StoreError::Allocation(source) => {
                        inner.metrics.allocation_failures.fetch_add(1, Ordering::Relaxed);
                        SendError::Allocation {
                            key: self.key.clone(),
                            source,
                        }
                    }
                    source => SendError::Store {
                        key: self.key.clone(),
                        tid: None,
                        source,
                    },
                };
                self.path.advance(SenderState::Done);
                self.close();
                error.emit();
                Err(error)
            }
        }
    }

    async fn deliver(
        &mut self,
        payload: &DocumentList,
        tid: &TransactionId,
        attempt: DeliveryAttempt,
    ) -> Result<Receipt, SendError> {
        let id = attempt.id();
        let sequence_number = attempt.sequence_number;
        let deadline = self.timeout.map(|t| (Instant::now() + t, t));

        loop {
            self.path.advance(SenderState::AwaitingAck);
            let call = self.inner.transport.send_with_tid(
                self.key.destination(),
                payload,
                tid,
                sequence_number,
            );
            let waited = match deadline {
                Some((at, after)) => tokio::time::timeout_at(at, call).await.map_err(|_| after),
                None => Ok(call.await),
            };
            let result = match waited {
                Ok(result) => result,
                Err(after) => return Err(self.time_out(&id, tid, after).await),
            };

            let result = result.and_then(|ack| {
                if ack.tid == *tid && ack.sequence_number == sequence_number {
                    Ok(ack)
                } else {
                    Err(TransportError::SequenceConflict {
                        tid: tid.clone(),
                        expected: sequence_number,
                        received: ack.sequence_number,
                    })
                }
            });

            let now = UnixTimeMs::now();
            let error = match result {
                Ok(ack) => {
                    let recorded = self
                        .inner
                        .tracker
                        .mark_outcome(&id, AttemptOutcome::Acknowledged, now);
                    if let Err(source) = recorded {
                        let error = SendError::Tracking {
                            key: self.key.clone(),
                            tid: tid.clone(),
                            source,
                        };
                        return Err(self.abort(error).await);
                    }
                    self.in_flight = None;
                    let _ = self.inner.store.touch(&self.key, now);
                    self.inner.metrics.sends_delivered.fetch_add(1, Ordering::Relaxed);

                    let attempt_count =
                        self.inner.tracker.attempt(&id).map_or(1, |a| a.attempt_count);
                    debug!(
                        attempt = %id,
                        duplicate = ack.duplicate,
                        attempt_count,
                        "delivery acknowledged"
                    );
                    return Ok(Receipt {
                        tid: tid.clone(),
                        sequence_number,
                        attempt_count,
                        duplicate: ack.duplicate,
                        fingerprint: attempt.payload_fingerprint,
                    });
                }
                Err(error) => error,
            };

            match self.inner.tracker.mark_failed(&id, &error, now) {
                Ok(Disposition::Retry { attempt_count }) => {
                    let delay = self.inner.config.delivery.backoff(attempt_count);
                    warn!(
                        attempt = %id,
                        attempt_count,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "transient delivery failure, resending"
                    );
                    let wake = Instant::now() + delay;
                    match deadline {
                        Some((at, after)) => {
                            tokio::time::sleep_until(wake.min(at)).await;
                            if Instant::now() >= at {
                                return Err(self.time_out(&id, tid, after).await);
                            }
                        }
                        None => tokio::time::sleep_until(wake).await,
                    }
                    if let Err(source) = self.inner.tracker.retry(&id, UnixTimeMs::now()) {
                        let error = SendError::Tracking {
                            key: self.key.clone(),
                            tid: tid.clone(),
                            source,
                        };
                        return Err(self.abort(error).await);
                    }
                    self.inner.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    self.path.advance(SenderState::Sending);
                }
                Ok(Disposition::Rollback(reason)) => {
                    self.in_flight = None;
                    let failure = self.failure_for(reason, tid, &id, error);
                    return Err(self.abort(failure).await);
                }
                Ok(Disposition::Acknowledged) => {
                    let source = TrackerError::InvalidOutcome {
                        id: id.clone(),
                        from: AttemptOutcome::Pending,
                        to: AttemptOutcome::Acknowledged,
                    };
                    let error = SendError::Tracking {
                        key: self.key.clone(),
                        tid: tid.clone(),
                        source,
                    };
                    return Err(self.abort(error).await);
                }
                Err(source) => {
                    let error = SendError::Tracking {
                        key: self.key.clone(),
                        tid: tid.clone(),
                        source,
                    };
                    return Err(self.abort(error).await);
                }
            }
        }
    }

    fn failure_for(
        &self,
        reason: RollbackReason,
        tid: &TransactionId,
        id: &AttemptId,
        error: TransportError,
    ) -> SendError {
        let key = self.key.clone();
        let tid = tid.clone();
        match (reason, error) {
            (_, TransportError::SequenceConflict { expected, received, .. }) => {
                self.inner.metrics.sequence_conflicts.fetch_add(1, Ordering::Relaxed);
                SendError::SequenceConflict {
                    key,
                    tid,
                    expected,
                    received,
                }
            }
            (RollbackReason::RetriesExhausted, last_error) => SendError::RetriesExhausted {
                key,
                tid,
                attempts: self.inner.tracker.attempt(id).map_or(0, |a| a.attempt_count),
                last_error,
            },
            (_, source) => SendError::Transport { key, tid, source },
        }
    }

    async fn time_out(
        &mut self,
        id: &AttemptId,
        tid: &TransactionId,
        after: Duration,
    ) -> SendError {
        self.inner.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
        let _ = self.inner.tracker.mark_cancelled(id, UnixTimeMs::now());
        self.in_flight = None;
        let error = SendError::Timeout {
            key: self.key.clone(),
            tid: tid.clone(),
            after,
        };
        self.abort(error).await
    }

    /// A previous send future was dropped mid-flight; its outcome is unknown
    /// so the transaction cannot continue.
    async fn check_interrupted(&mut self) -> Result<(), SendError> {
        let Some(id) = self.in_flight.take() else {
            return Ok(());
        };
        let _ = self.inner.tracker.mark_cancelled(&id, UnixTimeMs::now());
        let error = SendError::Interrupted {
            key: self.key.clone(),
            tid: id.tid,
        };
        Err(self.abort(error).await)
    }

    /// Rolls the transaction back, releases it and hands `error` back.
    async fn abort(&mut self, error: SendError) -> SendError {
        self.path.advance(SenderState::RollingBack);
        if let Some(tid) = self.tid.clone() {
            let rolled_back = self
                .inner
                .call_target(TargetCall::Rollback, self.key.destination(), &tid)
                .await;
            if let Err(rollback_error) = rolled_back {
                error!(key = %self.key, %tid, error = %rollback_error, "rollback on target failed");
            } else {
                info!(key = %self.key, %tid, "transaction rolled back");
            }
            self.path.advance(SenderState::Done);
            self.inner
                .finalize(&self.key, &tid, TransactionState::RolledBack, &self.path);
        } else {
            self.path.advance(SenderState::Done);
        }
        self.close();
        error.emit();
        error
    }

    /// Commits every acknowledged send. A scope with no sends finishes as
    /// [`SendOutcome::NoPayload`].
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn commit(mut self) -> Result<SendOutcome, SendError> {
        self.ensure_open()?;
        self.check_interrupted().await?;

        let Some(tid) = self.tid.clone() else {
            self.path.advance(SenderState::Done);
            self.close();
            return Ok(SendOutcome::NoPayload);
        };

        self.path.advance(SenderState::Committing);
        if let Err(source) = self
            .inner
            .store
            .transition(&self.key, TransactionState::Committing, UnixTimeMs::now())
        {
            let error = SendError::Store {
                key: self.key.clone(),
                tid: Some(tid),
                source,
            };
            return Err(self.abort(error).await);
        }

        let committed = self
            .inner
            .call_target(TargetCall::Commit, self.key.destination(), &tid)
            .await;
        if let Err(source) = committed {
            let error = SendError::Commit {
                key: self.key.clone(),
                tid,
                source,
            };
            return Err(self.abort(error).await);
        }

        self.path.advance(SenderState::Done);
        let attempts = self
            .inner
            .finalize(&self.key, &tid, TransactionState::Committed, &self.path);
        info!(key = %self.key, %tid, sends = attempts.len(), "transaction committed");
        self.close();

        Ok(SendOutcome::Delivered(DeliveryReport {
            key: self.key.clone(),
            tid,
            final_state: TransactionState::Committed,
            attempts,
            path: self.path.history.clone(),
        }))
    }

    /// Rolls back whatever was sent so far. The record is released even
    /// when the target rejects the rollback.
    #[instrument(skip_all, fields(key = %self.key))]
    pub async fn rollback(mut self) -> Result<(), SendError> {
        self.ensure_open()?;
        if let Some(id) = self.in_flight.take() {
            let _ = self.inner.tracker.mark_cancelled(&id, UnixTimeMs::now());
        }

        let Some(tid) = self.tid.clone() else {
            self.path.advance(SenderState::Done);
            self.close();
            return Ok(());
        };

        self.path.advance(SenderState::RollingBack);
        let result = self
            .inner
            .call_target(TargetCall::Rollback, self.key.destination(), &tid)
            .await;
        self.path.advance(SenderState::Done);
        self.inner
            .finalize(&self.key, &tid, TransactionState::RolledBack, &self.path);
        self.close();

        match result {
            Ok(()) => {
                info!(key = %self.key, %tid, "transaction rolled back");
                Ok(())
            }
            Err(source) => {
                let error = SendError::Rollback {
                    key: self.key.clone(),
                    tid,
                    source,
                };
                error.emit();
                Err(error)
            }
        }
    }

    fn ensure_open(&self) -> Result<(), SendError> {
        if self.finished {
            return Err(SendError::ScopeClosed {
                key: self.key.clone(),
            });
        }
        Ok(())
    }

    fn close(&mut self) {
        self.finished = true;
        self.guard = None;
    }
}

impl<T: RemoteTransport + 'static> Drop for TransactionScope<T> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let Some(tid) = self.tid.take() else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let in_flight = self.in_flight.take();
        let path = self.path.clone();
        let guard = self.guard.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    inner.abandon(tid, in_flight, path, guard).await;
                });
            }
            Err(_) => {
                warn!(
                    key = %self.key,
                    %tid,
                    "no runtime to roll back abandoned tid, releasing locally"
                );
                let mut path = path;
                path.advance(SenderState::RollingBack);
                path.advance(SenderState::Done);
                inner.finalize(&self.key, &tid, TransactionState::RolledBack, &path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::transport::{LoopbackTarget, Operation};

    fn key(dest: &str) -> TransactionKey {
        TransactionKey::parse(dest, "default").unwrap()
    }

    fn fast_config() -> DeliveryConfig {
        DeliveryConfig {
            allocation: RetryPolicy::immediate(3),
            delivery: RetryPolicy::immediate(5),
            commit: RetryPolicy::immediate(3),
            ..DeliveryConfig::default()
        }
    }

    fn sender(target: &Arc<LoopbackTarget>) -> TransactionalSender<LoopbackTarget> {
        TransactionalSender::new(Arc::clone(target), fast_config()).unwrap()
    }

    fn payload(numbers: &[&str]) -> DocumentList {
        DocumentList::from_numbers("ORDERS05", numbers.iter().copied())
    }

    #[test]
    fn test_state_machine_transitions() {
        use SenderState::*;
        assert!(Idle.can_transition_to(AcquiringTid));
        assert!(AcquiringTid.can_transition_to(Sending));
        assert!(Sending.can_transition_to(AwaitingAck));
        assert!(AwaitingAck.can_transition_to(Sending));
        assert!(AwaitingAck.can_transition_to(Committing));
        assert!(AwaitingAck.can_transition_to(RollingBack));
        assert!(Committing.can_transition_to(Done));
        assert!(RollingBack.can_transition_to(Done));

        assert!(!Idle.can_transition_to(Sending));
        assert!(!Sending.can_transition_to(Committing));
        assert!(!Done.can_transition_to(Idle));
        assert!(Done.is_terminal());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let target = Arc::new(LoopbackTarget::new());
        let config = DeliveryConfig {
            recent_outcomes: 0,
            ..DeliveryConfig::default()
        };
        assert!(TransactionalSender::new(target, config).is_err());
    }

    #[tokio::test]
    async fn test_successful_send_follows_commit_path() {
        let target = Arc::new(LoopbackTarget::new());
        let sender = sender(&target);

        let outcome = sender.send(&key("DEST1"), &payload(&["IDOC-1"])).await.unwrap();
        let report = outcome.report().unwrap();

        use SenderState::*;
        assert_eq!(
            report.path,
            vec![Idle, AcquiringTid, Sending, AwaitingAck, Committing, Done]
        );
        assert_eq!(report.final_state, TransactionState::Committed);
        assert_eq!(sender.recent_outcome(&report.tid).unwrap().path, report.path);
        assert!(target.is_committed(&report.tid).await);
    }

    #[tokio::test]
    async fn test_error_carries_key_and_tid() {
        let target = Arc::new(LoopbackTarget::new());
        target.fail_next(Operation::Send, TransportError::permanent("IDOC", "bad segment")).await;
        let sender = sender(&target);

        let error = sender.send(&key("DEST1"), &payload(&["IDOC-1"])).await.unwrap_err();
        assert_eq!(error.key(), &key("DEST1"));
        assert!(error.tid().is_some());
        assert!(!error.is_retryable());
    }

    #[tokio::test]
    async fn test_scope_without_sends_allocates_nothing() {
        let target = Arc::new(LoopbackTarget::new());
        let sender = sender(&target);

        let scope = sender.begin(&key("DEST1")).await;
        assert_eq!(scope.state(), SenderState::Idle);
        assert_eq!(scope.commit().await.unwrap(), SendOutcome::NoPayload);
        assert!(target.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_list_in_scope_is_rejected_without_side_effects() {
        let target = Arc::new(LoopbackTarget::new());
        let sender = sender(&target);

        let mut scope = sender.begin(&key("DEST1")).await;
        let result = scope.send(&DocumentList::new("ORDERS05")).await;
        assert!(matches!(result, Err(SendError::EmptyPayload { .. })));
        assert!(!scope.is_finished());
        scope.rollback().await.unwrap();
        assert!(target.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_scope_rejects_sends() {
        let target = Arc::new(LoopbackTarget::new());
        target.fail_next(Operation::Send, TransportError::permanent("IDOC", "rejected")).await;
        let sender = sender(&target);

        let mut scope = sender.begin(&key("DEST1")).await;
        assert!(scope.send(&payload(&["IDOC-1"])).await.is_err());
        assert!(scope.is_finished());
        assert!(matches!(
            scope.send(&payload(&["IDOC-2"])).await,
            Err(SendError::ScopeClosed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropped_scope_rolls_back_in_background() {
        let target = Arc::new(LoopbackTarget::new());
        let sender = sender(&target);

        let tid = {
            let mut scope = sender.begin(&key("DEST1")).await;
            scope.send(&payload(&["IDOC-1"])).await.unwrap();
            scope.tid().cloned().unwrap()
        };

        // The next scope for the key waits for the cleanup to release it.
        let scope = sender.begin(&key("DEST1")).await;
        assert!(target.is_rolled_back(&tid).await);
        assert!(!sender.store().contains(&key("DEST1")));
        assert_eq!(sender.store().final_state(&tid), Some(TransactionState::RolledBack));
        scope.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_count_delivery_and_commit() {
        let target = Arc::new(LoopbackTarget::new());
        let sender = sender(&target);

        sender.send(&key("DEST1"), &payload(&["IDOC-1"])).await.unwrap();
        sender.process(SendRequest::new(Destination::new("DEST1").unwrap(), None)).await.unwrap();

        let snapshot = sender.metrics();
        assert_eq!(snapshot.sends_started, 1);
        assert_eq!(snapshot.sends_delivered, 1);
        assert_eq!(snapshot.transactions_committed, 1);
        assert_eq!(snapshot.no_payload, 1);
        assert_eq!(snapshot.transactions_rolled_back, 0);
    }
}
