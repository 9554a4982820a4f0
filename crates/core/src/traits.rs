//! Collaborator traits consumed by the transactional core
//!
//! The core never owns region storage or the distributed lock transport.
//! It reaches both through these traits so that partitioned, replicated or
//! in-memory implementations can be swapped in without touching the
//! transaction state machine.
//!
//! Thread safety: implementations are shared across transactions and must
//! be safe to call concurrently (requires Send + Sync).

use std::result::Result as StdResult;

use crate::error::RegionError;
use crate::types::{Key, RegionId, TxId, TxOperation};
use crate::value::VersionedValue;

/// Region storage as seen by the transactional core
///
/// The core calls `read` only while buffering (to capture versions) and
/// during conflict validation, and `apply_write` only at commit time.
pub trait Region: Send + Sync {
    /// Region identity
    fn id(&self) -> &RegionId;

    /// Current entry for `key`
    ///
    /// Returns `Ok(None)` when the key does not exist. An invalidated entry
    /// is returned as `Some` with `value: None`.
    ///
    /// # Errors
    ///
    /// Returns `RegionError::NodeDeparted` when the member hosting the key
    /// has left the cluster.
    fn read(&self, key: &Key) -> StdResult<Option<VersionedValue>, RegionError>;

    /// Apply one committed write
    ///
    /// `expected_version` is the entry version the transaction based its
    /// write on (0 = absent). Implementations that can check it atomically
    /// should reject a mismatch with `RegionError::VersionConflict`.
    ///
    /// Returns the new entry version (0 when the entry was removed).
    ///
    /// # Errors
    ///
    /// - `NodeDeparted` if the hosting member left mid-commit
    /// - `EntryNotFound` for a destroy of an entry that is already gone
    /// - `VersionConflict` for a late-detected conflict
    fn apply_write(
        &self,
        key: &Key,
        op: &TxOperation,
        expected_version: u64,
    ) -> StdResult<u64, RegionError>;

    /// Check that every member hosting `keys` is still present
    ///
    /// Called under the write-set locks immediately before the first
    /// `apply_write` of a commit, so a departed host fails the commit before
    /// any region has changed. The default reports every host present.
    ///
    /// # Errors
    ///
    /// Returns `RegionError::NodeDeparted` naming the first departed host.
    fn ensure_hosted(&self, _keys: &[Key]) -> StdResult<(), RegionError> {
        Ok(())
    }

    /// Pin entries a transaction is about to commit, once its locks are held
    ///
    /// The default does nothing.
    ///
    /// # Errors
    ///
    /// Returns `RegionError::NodeDeparted` when a hosting member is gone.
    fn retain_tx_refs(&self, _tx_id: &TxId, _keys: &[Key]) -> StdResult<(), RegionError> {
        Ok(())
    }

    /// Release region-side resources a transaction tied to `keys` while it
    /// held locks (entry pins, reference counts)
    ///
    /// Must tolerate keys that were never pinned. The default does nothing.
    fn release_tx_refs(&self, _tx_id: &TxId, _keys: &[Key]) -> StdResult<(), RegionError> {
        Ok(())
    }
}

/// Cluster-wide exclusive lock service
///
/// Lock acquisition is the sole cross-transaction synchronization point.
/// `obtain` blocks up to a timeout owned by the implementation; timing out
/// is reported as `Ok(false)`.
pub trait LockService: Send + Sync {
    /// Obtain exclusive locks on every key of one region, all or nothing
    ///
    /// Returns `Ok(true)` when every lock is now held by `owner`, and
    /// `Ok(false)` (holding none of them) otherwise. Locks already held by
    /// the same owner count as obtained.
    fn obtain(&self, owner: &TxId, region: &RegionId, keys: &[Key])
        -> StdResult<bool, RegionError>;

    /// Release locks held by `owner`; keys it does not hold are ignored
    fn release(&self, owner: &TxId, region: &RegionId, keys: &[Key]);
}
