//! Per-period advisory locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::*;

type LockTable = Arc<Mutex<HashMap<Period, Arc<AsyncMutex<()>>>>>;

/// Serializes read-modify-write work on the links of one period
///
/// Requests for different periods never wait on each other. A period's entry
/// lives only while someone holds or waits for its lock.
#[derive(Debug, Clone, Default)]
pub struct PeriodLocks {
    locks: LockTable,
}

/// Holds the lock of one period until dropped
#[derive(Debug)]
pub struct PeriodGuard {
    period: Period,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl PeriodLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the lock of `period`
    pub async fn acquire(&self, period: Period) -> ReconResult<PeriodGuard> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| ReconError::Storage("period lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(period).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;
        Ok(PeriodGuard {
            period,
            lock,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        })
    }

    /// Number of periods currently tracked
    pub fn tracked_periods(&self) -> usize {
        self.locks.lock().map_or(0, |locks| locks.len())
    }
}

impl Drop for PeriodGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Ok(mut locks) = self.locks.lock() {
            // Table entry and this guard are the only owners left
            if Arc::strong_count(&self.lock) == 2 {
                locks.remove(&self.period);
            }
        }
    }
}
