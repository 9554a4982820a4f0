//! Shared test doubles for gridtx-concurrency integration tests
//!
//! - `RecordingRegion`: an `InMemoryRegion` that counts every collaborator
//!   call and can be told to fail its next apply
//! - `CountingLockService`: a `LocalLockService` that counts obtain/release
//!   calls and can be told to refuse

#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridtx_concurrency::{LocalLockService, TxConfig, TxManager, TxState};
use gridtx_core::{
    Key, LockService, MemberId, Region, RegionError, RegionId, TxId, TxOperation, Value,
    VersionedValue,
};
use gridtx_storage::InMemoryRegion;

// ============================================================================
// Recording region
// ============================================================================

pub struct RecordingRegion {
    pub inner: InMemoryRegion,
    pub reads: AtomicUsize,
    pub applies: AtomicUsize,
    pub retains: AtomicUsize,
    pub releases: AtomicUsize,
    fail_next_apply: Mutex<Option<RegionError>>,
}

impl RecordingRegion {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryRegion::replicated(name, MemberId::new("local")),
            reads: AtomicUsize::new(0),
            applies: AtomicUsize::new(0),
            retains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            fail_next_apply: Mutex::new(None),
        })
    }

    pub fn fail_next_apply(&self, err: RegionError) {
        *self.fail_next_apply.lock() = Some(err);
    }

    pub fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner.get(&Key::from(key)).and_then(|v| v.value)
    }
}

impl Region for RecordingRegion {
    fn id(&self) -> &RegionId {
        self.inner.id()
    }

    fn read(&self, key: &Key) -> Result<Option<VersionedValue>, RegionError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read(key)
    }

    fn apply_write(
        &self,
        key: &Key,
        op: &TxOperation,
        expected_version: u64,
    ) -> Result<u64, RegionError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_next_apply.lock().take() {
            return Err(err);
        }
        self.inner.apply_write(key, op, expected_version)
    }

    fn ensure_hosted(&self, keys: &[Key]) -> Result<(), RegionError> {
        self.inner.ensure_hosted(keys)
    }

    fn retain_tx_refs(&self, tx_id: &TxId, keys: &[Key]) -> Result<(), RegionError> {
        self.retains.fetch_add(1, Ordering::SeqCst);
        self.inner.retain_tx_refs(tx_id, keys)
    }

    fn release_tx_refs(&self, tx_id: &TxId, keys: &[Key]) -> Result<(), RegionError> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release_tx_refs(tx_id, keys)
    }
}

// ============================================================================
// Counting lock service
// ============================================================================

pub struct CountingLockService {
    pub inner: LocalLockService,
    pub obtains: AtomicUsize,
    pub releases: AtomicUsize,
    refuse: AtomicBool,
}

impl CountingLockService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: LocalLockService::new(Duration::from_millis(20)),
            obtains: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn obtains(&self) -> usize {
        self.obtains.load(Ordering::SeqCst)
    }

    pub fn held(&self) -> usize {
        self.inner.held_count()
    }
}

impl LockService for CountingLockService {
    fn obtain(&self, owner: &TxId, region: &RegionId, keys: &[Key]) -> Result<bool, RegionError> {
        self.obtains.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.inner.obtain(owner, region, keys)
    }

    fn release(&self, owner: &TxId, region: &RegionId, keys: &[Key]) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.inner.release(owner, region, keys)
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn test_config() -> TxConfig {
    TxConfig {
        lock_timeout_ms: 20,
        member_name: Some("local".to_string()),
        ..TxConfig::default()
    }
}

pub fn manager_with(locks: Arc<CountingLockService>) -> Arc<TxManager> {
    TxManager::new(test_config(), locks).unwrap()
}

pub fn local_state(manager: &Arc<TxManager>) -> TxState {
    TxState::new(manager.next_tx_id(), Arc::clone(manager), None, false)
}

pub fn as_region(region: &Arc<RecordingRegion>) -> Arc<dyn Region> {
    region.clone()
}
