use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::model::TransactionKey;

/// Exclusive hold on one transaction key. Dropping it lets the next
/// waiter for the same key proceed.
pub struct KeyGuard {
    key: TransactionKey,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &TransactionKey {
        &self.key
    }
}

impl std::fmt::Debug for KeyGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}

/// Lazily created async mutex per [`TransactionKey`].
///
/// Waiters are served in FIFO order. Entries nobody holds or waits on are
/// pruned whenever a new key is locked.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<TransactionKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &TransactionKey) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if !locks.contains_key(key) {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    pub async fn lock(&self, key: &TransactionKey) -> KeyGuard {
        let guard = self.handle(key).lock_owned().await;
        KeyGuard {
            key: key.clone(),
            _guard: guard,
        }
    }

    pub fn try_lock(&self, key: &TransactionKey) -> Option<KeyGuard> {
        let guard = self.handle(key).try_lock_owned().ok()?;
        Some(KeyGuard {
            key: key.clone(),
            _guard: guard,
        })
    }

    pub fn is_locked(&self, key: &TransactionKey) -> bool {
        let locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.get(key).map_or(false, |lock| lock.try_lock().is_err())
    }

    pub fn tracked_keys(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
