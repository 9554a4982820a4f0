//! Lock requests for transactional write-sets
//!
//! A `LockRequest` covers every key a transaction writes, grouped into one
//! batch per region. Batches are requested in region order (and keys are
//! sorted within a batch) so every transaction walks the lock space in the
//! same direction.
//!
//! Acquisition is all-or-nothing across batches: if a later batch cannot
//! be obtained, the earlier ones are released before `obtain` returns.

use std::fmt;
use std::sync::Arc;

use gridtx_core::{Key, LockService, RegionError, RegionId, TxId};
use thiserror::Error;
use tracing::debug;

/// The lock service failed outright while obtaining a batch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("lock service failed for region {region}: {source}")]
pub struct LockError {
    /// Region whose batch was being obtained
    pub region: RegionId,
    /// Failure reported by the service
    #[source]
    pub source: RegionError,
}

/// Keys of one region to be locked together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionLockBatch {
    /// Region the keys belong to
    pub region: RegionId,
    /// Sorted, deduplicated keys
    pub keys: Vec<Key>,
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// Every lock in the request is held
    Obtained,
    /// The batch for this region could not be obtained; nothing is held
    Unavailable(RegionId),
}

impl LockOutcome {
    /// Whether all locks are held
    pub fn is_obtained(&self) -> bool {
        matches!(self, LockOutcome::Obtained)
    }
}

/// The set of cluster-wide locks a transaction needs to commit
pub struct LockRequest {
    owner: TxId,
    batches: Vec<RegionLockBatch>,
    service: Arc<dyn LockService>,
    held: bool,
}

impl fmt::Debug for LockRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRequest")
            .field("owner", &self.owner)
            .field("batches", &self.batches)
            .field("held", &self.held)
            .finish()
    }
}

impl LockRequest {
    /// Create an empty request owned by `owner`
    pub fn new(owner: TxId, service: Arc<dyn LockService>) -> Self {
        Self {
            owner,
            batches: Vec::new(),
            service,
            held: false,
        }
    }

    /// Add the keys of one region
    ///
    /// Keys of a region already present are merged into its batch.
    /// Empty key lists are ignored.
    pub fn add_region(&mut self, region: RegionId, mut keys: Vec<Key>) {
        if keys.is_empty() {
            return;
        }
        match self.batches.iter_mut().find(|b| b.region == region) {
            Some(batch) => batch.keys.append(&mut keys),
            None => self.batches.push(RegionLockBatch { region, keys }),
        }
        self.batches.sort_by(|a, b| a.region.cmp(&b.region));
        for batch in &mut self.batches {
            batch.keys.sort();
            batch.keys.dedup();
        }
    }

    /// Owning transaction
    pub fn owner(&self) -> &TxId {
        &self.owner
    }

    /// Batches in acquisition order
    pub fn batches(&self) -> &[RegionLockBatch] {
        &self.batches
    }

    /// Whether the request covers no keys
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Whether the locks are currently held
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Obtain every lock in the request, all or nothing
    ///
    /// Calling this while the locks are held does not contact the lock
    /// service again.
    ///
    /// # Errors
    ///
    /// Returns the lock service failure (e.g. `NodeDeparted`) after
    /// releasing any batch already obtained.
    pub fn obtain(&mut self) -> Result<LockOutcome, LockError> {
        if self.held {
            return Ok(LockOutcome::Obtained);
        }

        for (idx, batch) in self.batches.iter().enumerate() {
            let result = self.service.obtain(&self.owner, &batch.region, &batch.keys);
            match result {
                Ok(true) => continue,
                Ok(false) => {
                    self.release_first(idx);
                    debug!(target: "gridtx::lock", tx_id = %self.owner, region = %batch.region, "Lock batch unavailable");
                    return Ok(LockOutcome::Unavailable(batch.region.clone()));
                }
                Err(source) => {
                    self.release_first(idx);
                    return Err(LockError {
                        region: batch.region.clone(),
                        source,
                    });
                }
            }
        }

        self.held = true;
        Ok(LockOutcome::Obtained)
    }

    /// Release every lock held by this request; idempotent
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.release_first(self.batches.len());
        self.held = false;
    }

    /// Release the first `count` batches, newest first
    fn release_first(&self, count: usize) {
        for batch in self.batches[..count].iter().rev() {
            self.service.release(&self.owner, &batch.region, &batch.keys);
        }
    }
}

impl Drop for LockRequest {
    fn drop(&mut self) {
        self.release();
    }
}
