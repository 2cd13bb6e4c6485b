//! Active-transaction bookkeeping: one live [`TransactionRecord`] per
//! [`TransactionKey`].
//!
//! The map sits behind a short-held synchronous lock that is never held
//! across an `.await`. Allocation for a key is coordinated through a
//! per-key marker so concurrent callers for the same key wait for the
//! in-progress allocation instead of creating a second TID.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

use crate::allocator::{AllocationError, TransactionIdAllocator};
use crate::model::{TransactionId, TransactionKey, UnixTimeMs};
use crate::transport::RemoteTransport;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Created,
    InUse,
    Committing,
    Committed,
    RolledBack,
    Expired,
}

impl TransactionState {
    pub fn state_name(&self) -> &'static str {
        match self {
            TransactionState::Created => "created",
            TransactionState::InUse => "in_use",
            TransactionState::Committing => "committing",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::RolledBack | TransactionState::Expired
        )
    }

    pub fn can_transition_to(&self, next: TransactionState) -> bool {
        use TransactionState::*;
        match (self, next) {
            (Created, InUse) | (InUse, Committing) => true,
            (Committing, Committed) | (Committing, RolledBack) => true,
            // Failures before any commit attempt roll back directly.
            (Created, RolledBack) | (InUse, RolledBack) => true,
            (from, Expired) => !from.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub key: TransactionKey,
    pub tid: TransactionId,
    pub state: TransactionState,
    pub created_at: UnixTimeMs,
    pub last_activity_at: UnixTimeMs,
}

impl TransactionRecord {
    pub fn is_idle(&self, now: UnixTimeMs, idle_timeout_ms: u64) -> bool {
        now.elapsed_since(self.last_activity_at) > idle_timeout_ms
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no active transaction for {0}")]
    NotFound(TransactionKey),

    #[error("invalid transition for {key} from {from:?} to {to:?}")]
    InvalidTransition {
        key: TransactionKey,
        from: TransactionState,
        to: TransactionState,
    },

    #[error("tid {tid} is already bound to {owner}")]
    TidInUse { tid: TransactionId, owner: TransactionKey },

    #[error("tid {tid} was already finalized as {final_state:?}")]
    TidFinalized {
        tid: TransactionId,
        final_state: TransactionState,
    },

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Result of [`TransactionIdStore::lookup_or_create`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub tid: TransactionId,
    pub reused: bool,
    /// A record found idle past the timeout and expired instead of reused.
    pub expired: Option<TransactionRecord>,
}

struct StoreState {
    records: HashMap<TransactionKey, TransactionRecord>,
    owners: HashMap<TransactionId, TransactionKey>,
    allocating: HashMap<TransactionKey, Arc<Semaphore>>,
    finalized: lru::LruCache<TransactionId, TransactionState>,
}

impl StoreState {
    fn new(finalized_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(finalized_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            records: HashMap::new(),
            owners: HashMap::new(),
            allocating: HashMap::new(),
            finalized: lru::LruCache::new(capacity),
        }
    }

    fn finalize(
        &mut self,
        key: &TransactionKey,
        state: TransactionState,
    ) -> Option<TransactionRecord> {
        let mut record = self.records.remove(key)?;
        self.owners.remove(&record.tid);
        record.state = state;
        self.finalized.put(record.tid.clone(), state);
        Some(record)
    }
}

/// Marker for an allocation in progress. Dropping it, on any path, clears
/// the marker and wakes every waiter.
struct AllocationSlot<'a> {
    store: &'a TransactionIdStore,
    key: TransactionKey,
    marker: Arc<Semaphore>,
}

impl Drop for AllocationSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.store.state.lock() {
            let ours = state
                .allocating
                .get(&self.key)
                .map_or(false, |m| Arc::ptr_eq(m, &self.marker));
            if ours {
                state.allocating.remove(&self.key);
            }
        }
        self.marker.close();
    }
}

pub struct TransactionIdStore {
    state: Mutex<StoreState>,
    idle_timeout_ms: u64,
}

impl TransactionIdStore {
    pub fn new(idle_timeout_ms: u64, finalized_capacity: usize) -> Self {
        Self {
            state: Mutex::new(StoreState::new(finalized_capacity)),
            idle_timeout_ms,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>, StoreError> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Returns the active TID for `key`, allocating one through `allocator`
    /// when there is none. Concurrent callers for one key share a single
    /// allocation.
    #[instrument(skip(self, allocator), fields(key = %key))]
    pub async fn lookup_or_create<T: RemoteTransport>(
        &self,
        key: &TransactionKey,
        allocator: &TransactionIdAllocator<T>,
        now: UnixTimeMs,
    ) -> Result<Lookup, StoreError> {
        let mut expired = None;

        let slot = loop {
            let pending = {
                let mut state = self.lock()?;

                if let Some(record) = state.records.get_mut(key) {
                    if !record.is_idle(now, self.idle_timeout_ms) {
                        record.last_activity_at = now;
                        debug!(tid = %record.tid, "reusing active tid");
                        return Ok(Lookup {
                            tid: record.tid.clone(),
                            reused: true,
                            expired,
                        });
                    }
                    if let Some(stale) = state.finalize(key, TransactionState::Expired) {
                        warn!(tid = %stale.tid, "active tid idle past timeout, expiring");
                        expired = Some(stale);
                    }
                }

                match state.allocating.get(key) {
                    Some(marker) => Arc::clone(marker),
                    None => {
                        let marker = Arc::new(Semaphore::new(0));
                        state.allocating.insert(key.clone(), Arc::clone(&marker));
                        break AllocationSlot {
                            store: self,
                            key: key.clone(),
                            marker,
                        };
                    }
                }
            };

            // Resolves (with an error) once the marker is closed.
            let _ = pending.acquire().await;
        };

        let tid = allocator.allocate(key.destination()).await?;

        {
            let mut state = self.lock()?;
            if let Some(final_state) = state.finalized.peek(&tid).copied() {
                allocator.retire(&tid);
                return Err(StoreError::TidFinalized { tid, final_state });
            }
            if let Some(owner) = state.owners.get(&tid) {
                return Err(StoreError::TidInUse {
                    tid,
                    owner: owner.clone(),
                });
            }
            state.owners.insert(tid.clone(), key.clone());
            state.records.insert(
                key.clone(),
                TransactionRecord {
                    key: key.clone(),
                    tid: tid.clone(),
                    state: TransactionState::Created,
                    created_at: now,
                    last_activity_at: now,
                },
            );
        }
        drop(slot);

        info!(%tid, "transaction record created");
        Ok(Lookup {
            tid,
            reused: false,
            expired,
        })
    }

    /// Moves the record for `key` to a non-terminal `next` state.
    pub fn transition(
        &self,
        key: &TransactionKey,
        next: TransactionState,
        now: UnixTimeMs,
    ) -> Result<TransactionRecord, StoreError> {
        let mut state = self.lock()?;
        let record = state
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if next.is_terminal() || !record.state.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: record.state,
                to: next,
            });
        }

        record.state = next;
        record.last_activity_at = now;
        debug!(
            key = %key,
            tid = %record.tid,
            state = next.state_name(),
            "transaction state changed"
        );
        Ok(record.clone())
    }

    /// Marks the record in use. A record already in use (a second send in the
    /// same window) only has its activity refreshed.
    pub fn mark_in_use(
        &self,
        key: &TransactionKey,
        now: UnixTimeMs,
    ) -> Result<TransactionRecord, StoreError> {
        if let Some(record) = self.touch(key, now)? {
            if record.state == TransactionState::InUse {
                return Ok(record);
            }
        }
        self.transition(key, TransactionState::InUse, now)
    }

    /// Refreshes the activity timestamp, returning the record if present.
    pub fn touch(
        &self,
        key: &TransactionKey,
        now: UnixTimeMs,
    ) -> Result<Option<TransactionRecord>, StoreError> {
        let mut state = self.lock()?;
        Ok(state.records.get_mut(key).map(|record| {
            record.last_activity_at = now;
            record.clone()
        }))
    }

    /// Finalizes the record for `key` and removes it from the active map.
    #[instrument(skip(self), fields(key = %key))]
    pub fn release(
        &self,
        key: &TransactionKey,
        final_state: TransactionState,
    ) -> Result<TransactionRecord, StoreError> {
        let mut state = self.lock()?;
        let current = state
            .records
            .get(key)
            .map(|r| r.state)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if !final_state.is_terminal() || !current.can_transition_to(final_state) {
            return Err(StoreError::InvalidTransition {
                key: key.clone(),
                from: current,
                to: final_state,
            });
        }

        let record = state
            .finalize(key, final_state)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        info!(tid = %record.tid, state = final_state.state_name(), "transaction released");
        Ok(record)
    }

    /// Expires every non-terminal record idle longer than the timeout.
    pub fn expire_idle(&self, now: UnixTimeMs) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut state = self.lock()?;
        let stale: Vec<_> = state
            .records
            .values()
            .filter(|r| r.is_idle(now, self.idle_timeout_ms))
            .map(|r| r.key.clone())
            .collect();

        let expired: Vec<_> = stale
            .iter()
            .filter_map(|key| state.finalize(key, TransactionState::Expired))
            .collect();

        if !expired.is_empty() {
            warn!(count = expired.len(), "expired idle transactions");
        }
        Ok(expired)
    }

    /// Drains every active record as expired. Used at shutdown.
    pub fn clear(&self) -> Result<Vec<TransactionRecord>, StoreError> {
        let mut state = self.lock()?;
        let keys: Vec<_> = state.records.keys().cloned().collect();
        Ok(keys
            .iter()
            .filter_map(|key| state.finalize(key, TransactionState::Expired))
            .collect())
    }

    pub fn get(&self, key: &TransactionKey) -> Option<TransactionRecord> {
        self.lock().ok()?.records.get(key).cloned()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.get(key).is_some()
    }

    pub fn active_count(&self) -> usize {
        self.lock().map_or(0, |state| state.records.len())
    }

    pub fn owner_of(&self, tid: &TransactionId) -> Option<TransactionKey> {
        self.lock().ok()?.owners.get(tid).cloned()
    }

    /// Final state of a recently released TID.
    pub fn final_state(&self, tid: &TransactionId) -> Option<TransactionState> {
        self.lock().ok()?.finalized.peek(tid).copied()
    }

    pub fn idle_timeout_ms(&self) -> u64 {
        self.idle_timeout_ms
    }
}
