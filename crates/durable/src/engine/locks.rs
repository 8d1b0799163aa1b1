//! Per-transaction mutual exclusion within a process

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serialises `run`, callbacks and `cancel` for the same transaction
///
/// Entries are created on demand and removed once the last holder or waiter
/// lets go, so the map only holds transactions that are currently active.
#[derive(Debug, Default)]
pub(crate) struct TransactionLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl TransactionLocks {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub(crate) async fn acquire(&self, key: &str) -> TransactionLockGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let guard = lock.lock_owned().await;
        TransactionLockGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Held while a transaction is being driven
pub(crate) struct TransactionLockGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl Drop for TransactionLockGuard {
    fn drop(&mut self) {
        // Release first so the map entry is the only remaining reference
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
