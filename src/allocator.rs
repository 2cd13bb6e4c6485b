use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::model::{Destination, TransactionId};
use crate::retry::RetryPolicy;
use crate::transport::{RemoteTransport, TransportError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocationError {
    #[error("target refused tid allocation for {destination}: {error}")]
    Permanent {
        destination: Destination,
        error: TransportError,
    },

    #[error("tid allocation for {destination} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        destination: Destination,
        attempts: u32,
        last_error: TransportError,
    },

    #[error("target kept reissuing tid {tid} for {destination}, which is not free")]
    DuplicateTid {
        destination: Destination,
        tid: TransactionId,
    },
}

#[derive(Default)]
struct IssuedTids {
    outstanding: HashSet<TransactionId>,
    retired: Option<lru::LruCache<TransactionId, ()>>,
}

/// Obtains fresh TIDs from the target, retrying transient failures with
/// bounded backoff. A TID stays claimed until [`TransactionIdAllocator::retire`].
pub struct TransactionIdAllocator<T: RemoteTransport> {
    transport: Arc<T>,
    policy: RetryPolicy,
    issued: Mutex<IssuedTids>,
}

impl<T: RemoteTransport> TransactionIdAllocator<T> {
    const DEFAULT_RETIRED_CAPACITY: usize = 1_024;

    pub fn new(transport: Arc<T>, policy: RetryPolicy) -> Self {
        Self::with_retired_capacity(transport, policy, Self::DEFAULT_RETIRED_CAPACITY)
    }

    pub fn with_retired_capacity(transport: Arc<T>, policy: RetryPolicy, capacity: usize) -> Self {
        Self {
            transport,
            policy,
            issued: Mutex::new(IssuedTids {
                outstanding: HashSet::new(),
                retired: NonZeroUsize::new(capacity).map(lru::LruCache::new),
            }),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    #[instrument(skip_all, fields(destination = %destination))]
    pub async fn allocate(
        &self,
        destination: &Destination,
    ) -> Result<TransactionId, AllocationError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.transport.create_tid(destination).await {
                Ok(tid) => {
                    if self.claim(&tid) {
                        info!(%tid, attempt, "tid allocated");
                        return Ok(tid);
                    }
                    warn!(%tid, attempt, "target reissued a tid that is not free");
                    if !self.policy.allows_another(attempt) {
                        return Err(AllocationError::DuplicateTid {
                            destination: destination.clone(),
                            tid,
                        });
                    }
                }
                Err(error) if error.is_retryable() => {
                    if !self.policy.allows_another(attempt) {
                        warn!(attempt, %error, "tid allocation retries exhausted");
                        return Err(AllocationError::Exhausted {
                            destination: destination.clone(),
                            attempts: attempt,
                            last_error: error,
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        attempt,
                        %error,
                        delay_ms = delay.as_millis() as u64,
                        "tid allocation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    warn!(attempt, %error, "tid allocation refused");
                    return Err(AllocationError::Permanent {
                        destination: destination.clone(),
                        error,
                    });
                }
            }
        }
    }

    /// Releases a finished TID. It is remembered so a recycled identifier
    /// from the target is not handed out again right away.
    pub fn retire(&self, tid: &TransactionId) {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        issued.outstanding.remove(tid);
        if let Some(retired) = issued.retired.as_mut() {
            retired.put(tid.clone(), ());
        }
    }

    pub fn is_outstanding(&self, tid: &TransactionId) -> bool {
        let issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        issued.outstanding.contains(tid)
    }

    pub fn outstanding_count(&self) -> usize {
        let issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        issued.outstanding.len()
    }

    fn claim(&self, tid: &TransactionId) -> bool {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        let recently_retired = issued
            .retired
            .as_ref()
            .map_or(false, |retired| retired.contains(tid));
        if recently_retired {
            return false;
        }
        issued.outstanding.insert(tid.clone())
    }
}
