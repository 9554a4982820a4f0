//! Per-region transactional bookkeeping
//!
//! A `RegionTxState` holds everything one transaction did to one region:
//! buffered writes (with the entry version each write is based on) and the
//! read-set consulted during conflict validation. Nothing here touches the
//! region until the owning `TxState` applies the writes at commit.
//!
//! # Teardown
//!
//! A region state is torn down exactly once, by one of two paths:
//! - `cleanup(region)` when the transaction held locks (releases entry pins)
//! - `close()` when no locks were ever obtained (drops buffers only)
//!
//! Whichever runs first wins; the other becomes a no-op.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gridtx_core::{Key, Region, RegionError, RegionId, TxId, TxOperation};

/// A write buffered until commit
#[derive(Debug, Clone, PartialEq)]
pub struct PendingWrite {
    /// Operation to apply
    pub op: TxOperation,
    /// Entry version observed when the transaction first touched the key
    /// (0 = absent)
    pub base_version: u64,
}

/// How a region state was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    /// Lock-tied resources were released against the region
    CleanedUp,
    /// Buffers were dropped without touching the region
    Closed,
}

/// Transactional state of one region within one transaction
pub struct RegionTxState {
    region: Arc<dyn Region>,
    writes: BTreeMap<Key, PendingWrite>,
    /// Keys read from the region and the version seen (0 = absent)
    reads: BTreeMap<Key, u64>,
    teardown: Option<Teardown>,
}

impl fmt::Debug for RegionTxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegionTxState")
            .field("region", self.region.id())
            .field("writes", &self.writes)
            .field("reads", &self.reads)
            .field("teardown", &self.teardown)
            .finish()
    }
}

impl RegionTxState {
    /// Create an empty state for `region`
    pub fn new(region: Arc<dyn Region>) -> Self {
        Self {
            region,
            writes: BTreeMap::new(),
            reads: BTreeMap::new(),
            teardown: None,
        }
    }

    /// Owning region
    pub fn region(&self) -> &Arc<dyn Region> {
        &self.region
    }

    /// Owning region id
    pub fn region_id(&self) -> &RegionId {
        self.region.id()
    }

    /// Buffer a write
    ///
    /// A later write to the same key replaces the operation but keeps the
    /// original base version: conflicts are judged against what the
    /// transaction saw first.
    pub fn record_write(&mut self, key: Key, op: TxOperation, base_version: u64) {
        self.writes
            .entry(key)
            .and_modify(|w| w.op = op.clone())
            .or_insert(PendingWrite { op, base_version });
    }

    /// Add a read to the read-set; the first version seen is kept
    pub fn record_read(&mut self, key: Key, version: u64) {
        self.reads.entry(key).or_insert(version);
    }

    /// Buffered write for `key`, if any
    pub fn pending_write(&self, key: &Key) -> Option<&PendingWrite> {
        self.writes.get(key)
    }

    /// Version this transaction already observed for `key`, if any
    pub fn known_version(&self, key: &Key) -> Option<u64> {
        self.writes
            .get(key)
            .map(|w| w.base_version)
            .or_else(|| self.reads.get(key).copied())
    }

    /// Buffered writes in key order
    pub fn writes(&self) -> impl Iterator<Item = (&Key, &PendingWrite)> {
        self.writes.iter()
    }

    /// Read-set in key order
    pub fn reads(&self) -> impl Iterator<Item = (&Key, u64)> {
        self.reads.iter().map(|(k, v)| (k, *v))
    }

    /// Keys with buffered writes, sorted
    pub fn write_keys(&self) -> Vec<Key> {
        self.writes.keys().cloned().collect()
    }

    /// Whether any write is buffered
    pub fn has_writes(&self) -> bool {
        !self.writes.is_empty()
    }

    /// Number of buffered writes
    pub fn write_count(&self) -> usize {
        self.writes.len()
    }

    /// Number of keys in the read-set
    pub fn read_count(&self) -> usize {
        self.reads.len()
    }

    /// Teardown path taken, once torn down
    pub fn teardown(&self) -> Option<Teardown> {
        self.teardown
    }

    /// Release lock-tied resources against `region` and drop the buffers
    ///
    /// Idempotent, and a no-op after `close()`. The state counts as torn down
    /// even when the region reports an error, so a failed release is never
    /// retried through this path.
    pub fn cleanup(&mut self, region: &dyn Region, tx_id: &TxId) -> Result<(), RegionError> {
        if self.teardown.is_some() {
            return Ok(());
        }
        self.teardown = Some(Teardown::CleanedUp);
        let keys = self.write_keys();
        self.clear();
        if keys.is_empty() {
            return Ok(());
        }
        region.release_tx_refs(tx_id, &keys)
    }

    /// Drop the buffers without touching the region
    ///
    /// Used when the transaction never obtained locks. Idempotent, and a
    /// no-op after `cleanup()`.
    pub fn close(&mut self) {
        if self.teardown.is_some() {
            return;
        }
        self.teardown = Some(Teardown::Closed);
        self.clear();
    }

    fn clear(&mut self) {
        self.writes.clear();
        self.reads.clear();
    }
}
