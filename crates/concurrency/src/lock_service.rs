//! Process-local lock service
//!
//! `LocalLockService` implements the cluster lock interface for a single
//! process: a lock table guarded by a `parking_lot::Mutex`, with a
//! `Condvar` that wakes waiters whenever locks are released.
//!
//! A batch is taken all at once or not at all. A waiter never holds part
//! of its batch while it waits, so two transactions locking overlapping
//! key sets cannot deadlock each other; the worst case is a timeout.

use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use gridtx_core::{Key, LockService, RegionError, RegionId, TxId};
use tracing::{debug, trace};

type LockKey = (RegionId, Key);

/// In-process exclusive lock table
pub struct LocalLockService {
    table: Mutex<HashMap<LockKey, TxId>>,
    released: Condvar,
    timeout: Duration,
}

impl LocalLockService {
    /// Create a lock service that waits up to `timeout` per batch
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Wait limit per batch
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Current holder of a lock
    pub fn holder(&self, region: &RegionId, key: &Key) -> Option<TxId> {
        self.table
            .lock()
            .get(&(region.clone(), key.clone()))
            .cloned()
    }

    /// Number of locks currently held
    pub fn held_count(&self) -> usize {
        self.table.lock().len()
    }

    fn batch_free(
        table: &HashMap<LockKey, TxId>,
        owner: &TxId,
        region: &RegionId,
        keys: &[Key],
    ) -> bool {
        keys.iter().all(|key| {
            match table.get(&(region.clone(), key.clone())) {
                Some(holder) => holder == owner,
                None => true,
            }
        })
    }
}

impl LockService for LocalLockService {
    fn obtain(&self, owner: &TxId, region: &RegionId, keys: &[Key]) -> Result<bool, RegionError> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();

        loop {
            if Self::batch_free(&table, owner, region, keys) {
                for key in keys {
                    table.insert((region.clone(), key.clone()), owner.clone());
                }
                trace!(target: "gridtx::lock", tx_id = %owner, region = %region, keys = keys.len(), "Locks obtained");
                return Ok(true);
            }

            if self.released.wait_until(&mut table, deadline).timed_out() {
                // One last look: a release may have raced the timeout
                if Self::batch_free(&table, owner, region, keys) {
                    continue;
                }
                debug!(target: "gridtx::lock", tx_id = %owner, region = %region, "Lock wait timed out");
                return Ok(false);
            }
        }
    }

    fn release(&self, owner: &TxId, region: &RegionId, keys: &[Key]) {
        let mut table = self.table.lock();
        let mut released = 0usize;
        for key in keys {
            let lock_key = (region.clone(), key.clone());
            if table.get(&lock_key) == Some(owner) {
                table.remove(&lock_key);
                released += 1;
            }
        }
        drop(table);
        if released > 0 {
            trace!(target: "gridtx::lock", tx_id = %owner, region = %region, released, "Locks released");
            self.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtx_core::MemberId;
    use std::sync::Arc;
    use std::thread;

    fn tx(seq: u64) -> TxId {
        TxId::new(MemberId::new("local"), seq)
    }

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|n| Key::from(*n)).collect()
    }

    #[test]
    fn test_obtain_and_release() {
        let svc = LocalLockService::new(Duration::from_millis(10));
        let region = RegionId::from("r");
        assert!(svc.obtain(&tx(1), &region, &keys(&["a", "b"])).unwrap());
        assert_eq!(svc.held_count(), 2);
        assert_eq!(svc.holder(&region, &Key::from("a")), Some(tx(1)));

        svc.release(&tx(1), &region, &keys(&["a", "b"]));
        assert_eq!(svc.held_count(), 0);
    }

    #[test]
    fn test_reentrant_for_same_owner() {
        let svc = LocalLockService::new(Duration::from_millis(10));
        let region = RegionId::from("r");
        assert!(svc.obtain(&tx(1), &region, &keys(&["a"])).unwrap());
        assert!(svc.obtain(&tx(1), &region, &keys(&["a", "b"])).unwrap());
        assert_eq!(svc.held_count(), 2);
    }

    #[test]
    fn test_conflicting_batch_times_out_holding_nothing() {
        let svc = LocalLockService::new(Duration::from_millis(20));
        let region = RegionId::from("r");
        assert!(svc.obtain(&tx(1), &region, &keys(&["b"])).unwrap());

        assert!(!svc.obtain(&tx(2), &region, &keys(&["a", "b"])).unwrap());
        assert_eq!(svc.holder(&region, &Key::from("a")), None);
        assert_eq!(svc.held_count(), 1);
    }

    #[test]
    fn test_release_by_non_owner_is_ignored() {
        let svc = LocalLockService::new(Duration::from_millis(10));
        let region = RegionId::from("r");
        assert!(svc.obtain(&tx(1), &region, &keys(&["a"])).unwrap());
        svc.release(&tx(2), &region, &keys(&["a"]));
        assert_eq!(svc.holder(&region, &Key::from("a")), Some(tx(1)));
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let svc = Arc::new(LocalLockService::new(Duration::from_secs(5)));
        let region = RegionId::from("r");
        assert!(svc.obtain(&tx(1), &region, &keys(&["a"])).unwrap());

        let waiter = {
            let svc = Arc::clone(&svc);
            let region = region.clone();
            thread::spawn(move || svc.obtain(&tx(2), &region, &keys(&["a"])).unwrap())
        };

        thread::sleep(Duration::from_millis(20));
        svc.release(&tx(1), &region, &keys(&["a"]));
        assert!(waiter.join().unwrap());
        assert_eq!(svc.holder(&region, &Key::from("a")), Some(tx(2)));
    }
}
