//! In-memory target system with tRFC semantics.
//!
//! Applies each `(tid, sequence_number)` at most once, enforces gap-free
//! sequence numbers per TID and only posts documents of committed TIDs.
//! Scripted faults, a send gate and a per-destination concurrency probe make
//! it usable as a test double for the delivery core.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::debug;
use uuid::Uuid;

use super::{Ack, RemoteTransport, TransportError};
use crate::model::{Destination, DocumentList, PayloadFingerprint, TransactionId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateTid,
    Send,
    Commit,
    Rollback,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallRecord {
    pub operation: Operation,
    pub destination: Destination,
    pub tid: Option<TransactionId>,
    pub sequence_number: Option<u64>,
    pub outcome: CallOutcome,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    Applied,
    Duplicate,
    Failed(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TargetStatus {
    Open,
    Committed,
    RolledBack,
}

struct TargetTransaction {
    destination: Destination,
    status: TargetStatus,
    last_sequence: u64,
    applied: BTreeMap<u64, (PayloadFingerprint, Vec<String>)>,
}

struct Fault {
    error: TransportError,
    after_apply: bool,
}

#[derive(Default)]
struct TargetState {
    transactions: HashMap<TransactionId, TargetTransaction>,
    faults: HashMap<Operation, VecDeque<Fault>>,
    forced_tids: VecDeque<TransactionId>,
    posted: HashMap<Destination, Vec<String>>,
    log: Vec<CallRecord>,
    applications: HashMap<(TransactionId, u64), usize>,
    duplicate_resends: u64,
}

impl TargetState {
    fn next_fault(&mut self, operation: Operation) -> Option<Fault> {
        self.faults.get_mut(&operation).and_then(VecDeque::pop_front)
    }

    fn record(
        &mut self,
        operation: Operation,
        destination: &Destination,
        tid: Option<&TransactionId>,
        sequence_number: Option<u64>,
        outcome: CallOutcome,
    ) {
        self.log.push(CallRecord {
            operation,
            destination: destination.clone(),
            tid: tid.cloned(),
            sequence_number,
            outcome,
        });
    }
}

#[derive(Default)]
struct ConcurrencyProbe {
    in_flight: HashMap<Destination, usize>,
    peak: HashMap<Destination, usize>,
}

struct InFlightGuard<'a> {
    probe: &'a StdMutex<ConcurrencyProbe>,
    destination: Destination,
}

impl<'a> InFlightGuard<'a> {
    fn enter(probe: &'a StdMutex<ConcurrencyProbe>, destination: &Destination) -> Self {
        let mut p = probe.lock().unwrap_or_else(|e| e.into_inner());
        let current = p.in_flight.entry(destination.clone()).or_insert(0);
        *current += 1;
        let now = *current;
        let peak = p.peak.entry(destination.clone()).or_insert(0);
        *peak = (*peak).max(now);
        Self {
            probe,
            destination: destination.clone(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut p = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(current) = p.in_flight.get_mut(&self.destination) {
            *current = current.saturating_sub(1);
        }
    }
}

pub struct LoopbackTarget {
    state: Mutex<TargetState>,
    probe: StdMutex<ConcurrencyProbe>,
    gate: watch::Sender<bool>,
    sends_started: watch::Sender<u64>,
    send_delay: StdMutex<Option<Duration>>,
    reply_delays: StdMutex<HashMap<Operation, Duration>>,
    strict_duplicates: bool,
}

impl Default for LoopbackTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTarget {
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        let (sends_started, _) = watch::channel(0);
        Self {
            state: Mutex::new(TargetState::default()),
            probe: StdMutex::new(ConcurrencyProbe::default()),
            gate,
            sends_started,
            send_delay: StdMutex::new(None),
            reply_delays: StdMutex::new(HashMap::new()),
            strict_duplicates: false,
        }
    }

    /// A target that answers a resend of an applied pair with a permanent
    /// `DUPLICATE` error instead of a duplicate acknowledgement.
    pub fn strict() -> Self {
        Self {
            strict_duplicates: true,
            ..Self::new()
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// The next call of `operation` fails with `error` before touching state.
    pub async fn fail_next(&self, operation: Operation, error: TransportError) {
        self.push_fault(operation, error, false).await;
    }

    /// The next send is applied, then reported to the caller as `error`
    /// (the acknowledgement is lost).
    pub async fn lose_next_ack(&self, error: TransportError) {
        self.push_fault(Operation::Send, error, true).await;
    }

    async fn push_fault(&self, operation: Operation, error: TransportError, after_apply: bool) {
        let mut state = self.state.lock().await;
        state
            .faults
            .entry(operation)
            .or_default()
            .push_back(Fault { error, after_apply });
    }

    /// The next `create_tid` returns `tid` instead of a fresh identifier.
    pub async fn force_next_tid(&self, tid: TransactionId) {
        self.state.lock().await.forced_tids.push_back(tid);
    }

    pub fn set_send_delay(&self, delay: Option<Duration>) {
        *self.send_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Calls of `operation` take effect right away but answer only after
    /// `delay`, like a target whose reply is slow.
    pub fn set_reply_delay(&self, operation: Operation, delay: Option<Duration>) {
        let mut delays = self.reply_delays.lock().unwrap_or_else(|e| e.into_inner());
        match delay {
            Some(delay) => delays.insert(operation, delay),
            None => delays.remove(&operation),
        };
    }

    async fn delay_reply(&self, operation: Operation) {
        let delay = self
            .reply_delays
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&operation)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Sends wait before being applied until [`LoopbackTarget::open_sends`].
    pub fn hold_sends(&self) {
        self.gate.send_replace(false);
    }

    pub fn open_sends(&self) {
        self.gate.send_replace(true);
    }

    /// Resolves once at least `count` sends have reached the target.
    pub async fn wait_for_sends(&self, count: u64) {
        let mut rx = self.sends_started.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub async fn calls(&self) -> Vec<CallRecord> {
        self.state.lock().await.log.clone()
    }

    pub async fn calls_of(&self, operation: Operation) -> Vec<CallRecord> {
        self.state
            .lock()
            .await
            .log
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Document numbers posted by committed TIDs, in commit order.
    pub async fn posted_documents(&self, destination: &Destination) -> Vec<String> {
        self.state
            .lock()
            .await
            .posted
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// How many times `(tid, sequence_number)` was applied, duplicates aside.
    pub async fn applications(&self, tid: &TransactionId, sequence_number: u64) -> usize {
        self.state
            .lock()
            .await
            .applications
            .get(&(tid.clone(), sequence_number))
            .copied()
            .unwrap_or(0)
    }

    pub async fn duplicate_resends(&self) -> u64 {
        self.state.lock().await.duplicate_resends
    }

    pub async fn is_committed(&self, tid: &TransactionId) -> bool {
        self.status_of(tid).await == Some(TargetStatus::Committed)
    }

    pub async fn is_rolled_back(&self, tid: &TransactionId) -> bool {
        self.status_of(tid).await == Some(TargetStatus::RolledBack)
    }

    async fn status_of(&self, tid: &TransactionId) -> Option<TargetStatus> {
        self.state.lock().await.transactions.get(tid).map(|t| t.status)
    }

    /// Highest number of sends simultaneously inside the target for one
    /// destination.
    pub fn peak_concurrency(&self, destination: &Destination) -> usize {
        let p = self.probe.lock().unwrap_or_else(|e| e.into_inner());
        p.peak.get(destination).copied().unwrap_or(0)
    }

    fn generate_tid() -> Result<TransactionId, TransportError> {
        let raw = Uuid::new_v4().simple().to_string().to_uppercase();
        TransactionId::new(&raw[..24])
            .map_err(|e| TransportError::permanent("TID_FORMAT", e.to_string()))
    }
}

#[async_trait::async_trait]
impl RemoteTransport for LoopbackTarget {
    async fn create_tid(&self, destination: &Destination) -> Result<TransactionId, TransportError> {
        let mut state = self.state.lock().await;

        if let Some(fault) = state.next_fault(Operation::CreateTid) {
            let reason = fault.error.to_string();
            let outcome = CallOutcome::Failed(reason);
            state.record(Operation::CreateTid, destination, None, None, outcome);
            return Err(fault.error);
        }

        let tid = match state.forced_tids.pop_front() {
            Some(tid) => tid,
            None => Self::generate_tid()?,
        };

        state.transactions.entry(tid.clone()).or_insert_with(|| TargetTransaction {
            destination: destination.clone(),
            status: TargetStatus::Open,
            last_sequence: 0,
            applied: BTreeMap::new(),
        });
        state.record(Operation::CreateTid, destination, Some(&tid), None, CallOutcome::Applied);
        debug!(%destination, %tid, "target issued tid");
        Ok(tid)
    }

    async fn send_with_tid(
        &self,
        destination: &Destination,
        payload: &DocumentList,
        tid: &TransactionId,
        sequence_number: u64,
    ) -> Result<Ack, TransportError> {
        let _in_flight = InFlightGuard::enter(&self.probe, destination);
        self.sends_started.send_modify(|started| *started += 1);

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let delay = *self.send_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fingerprint = payload
            .fingerprint()
            .map_err(|e| TransportError::permanent("PAYLOAD", e.to_string()))?;

        let mut state = self.state.lock().await;
        let seq = Some(sequence_number);
        let fault = state.next_fault(Operation::Send);
        if let Some(Fault { error, after_apply: false }) = &fault {
            let reason = error.to_string();
            let error = error.clone();
            state.record(Operation::Send, destination, Some(tid), seq, CallOutcome::Failed(reason));
            return Err(error);
        }

        let strict = self.strict_duplicates;
        let result = match state.transactions.get_mut(tid) {
            None => Err(TransportError::permanent(
                "TID_UNKNOWN",
                format!("tid {} was not issued", tid),
            )),
            Some(txn) if &txn.destination != destination => Err(TransportError::permanent(
                "TID_DESTINATION",
                format!("tid {} belongs to {}", tid, txn.destination),
            )),
            Some(txn) if txn.status != TargetStatus::Open => Err(TransportError::permanent(
                "TID_CLOSED",
                format!("tid {} is no longer open", tid),
            )),
            Some(txn) => match txn.applied.get(&sequence_number).map(|(fp, _)| *fp) {
                Some(applied_fingerprint) if applied_fingerprint != fingerprint => {
                    Err(TransportError::SequenceConflict {
                        tid: tid.clone(),
                        expected: txn.last_sequence + 1,
                        received: sequence_number,
                    })
                }
                Some(_) if strict => Err(TransportError::permanent(
                    "DUPLICATE",
                    format!("{}#{} already applied", tid, sequence_number),
                )),
                Some(_) => Ok(true),
                None if sequence_number != txn.last_sequence + 1 => {
                    Err(TransportError::SequenceConflict {
                        tid: tid.clone(),
                        expected: txn.last_sequence + 1,
                        received: sequence_number,
                    })
                }
                None => {
                    let numbers = payload.documents.iter().map(|d| d.number.clone()).collect();
                    txn.applied.insert(sequence_number, (fingerprint, numbers));
                    txn.last_sequence = sequence_number;
                    Ok(false)
                }
            },
        };

        match result {
            Ok(duplicate) => {
                if duplicate {
                    state.duplicate_resends += 1;
                } else {
                    *state
                        .applications
                        .entry((tid.clone(), sequence_number))
                        .or_insert(0) += 1;
                }
                if let Some(Fault { error, after_apply: true }) = fault {
                    let outcome = CallOutcome::Failed(error.to_string());
                    state.record(Operation::Send, destination, Some(tid), seq, outcome);
                    return Err(error);
                }
                let outcome = if duplicate {
                    CallOutcome::Duplicate
                } else {
                    CallOutcome::Applied
                };
                state.record(Operation::Send, destination, Some(tid), seq, outcome);
                Ok(Ack {
                    tid: tid.clone(),
                    sequence_number,
                    duplicate,
                })
            }
            Err(error) => {
                let outcome = CallOutcome::Failed(error.to_string());
                state.record(Operation::Send, destination, Some(tid), seq, outcome);
                Err(error)
            }
        }
    }

    async fn commit(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError> {
        let result = self.apply_commit(destination, tid).await;
        self.delay_reply(Operation::Commit).await;
        result
    }

    async fn rollback(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError> {
        let result = self.apply_rollback(destination, tid).await;
        self.delay_reply(Operation::Rollback).await;
        result
    }
}

impl LoopbackTarget {
    async fn apply_commit(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        if let Some(fault) = state.next_fault(Operation::Commit) {
            let reason = fault.error.to_string();
            let outcome = CallOutcome::Failed(reason);
            state.record(Operation::Commit, destination, Some(tid), None, outcome);
            return Err(fault.error);
        }

        let posted = match state.transactions.get_mut(tid) {
            None => Err(TransportError::permanent(
                "TID_UNKNOWN",
                format!("tid {} was not issued", tid),
            )),
            Some(txn) => match txn.status {
                TargetStatus::Committed => Ok(Vec::new()),
                TargetStatus::RolledBack => Err(TransportError::permanent(
                    "TID_ROLLED_BACK",
                    format!("tid {} was rolled back", tid),
                )),
                TargetStatus::Open => {
                    txn.status = TargetStatus::Committed;
                    Ok(txn.applied.values().flat_map(|(_, numbers)| numbers.clone()).collect())
                }
            },
        };

        match posted {
            Ok(numbers) => {
                state.posted.entry(destination.clone()).or_default().extend(numbers);
                state.record(Operation::Commit, destination, Some(tid), None, CallOutcome::Applied);
                Ok(())
            }
            Err(error) => {
                let reason = error.to_string();
                let outcome = CallOutcome::Failed(reason);
                state.record(Operation::Commit, destination, Some(tid), None, outcome);
                Err(error)
            }
        }
    }

    async fn apply_rollback(
        &self,
        destination: &Destination,
        tid: &TransactionId,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;

        if let Some(fault) = state.next_fault(Operation::Rollback) {
            let reason = fault.error.to_string();
            let outcome = CallOutcome::Failed(reason);
            state.record(Operation::Rollback, destination, Some(tid), None, outcome);
            return Err(fault.error);
        }

        let result = match state.transactions.get_mut(tid) {
            None => Ok(()),
            Some(txn) => match txn.status {
                TargetStatus::Committed => Err(TransportError::permanent(
                    "TID_COMMITTED",
                    format!("tid {} is already committed", tid),
                )),
                TargetStatus::Open | TargetStatus::RolledBack => {
                    txn.status = TargetStatus::RolledBack;
                    txn.applied.clear();
                    Ok(())
                }
            },
        };

        let outcome = match &result {
            Ok(()) => CallOutcome::Applied,
            Err(error) => CallOutcome::Failed(error.to_string()),
        };
        state.record(Operation::Rollback, destination, Some(tid), None, outcome);
        result
    }
}
