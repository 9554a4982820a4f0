//! Transaction state for optimistic multi-region transactions
//!
//! `TxState` is the per-transaction aggregate: the regions touched (each with
//! its own `RegionTxState`), the cluster-wide locks covering the write-set,
//! and the lifecycle below.
//!
//! ```text
//! Active ──reserve_and_check──▶ Reserved ──commit──▶ Committed
//!    │                             │
//!    └──────────rollback───────────┴──────────────▶ RolledBack
//! ```
//!
//! Conflicts are detected at reservation time, not at write time: writes
//! are buffered, and `reserve_and_check` obtains the write-set locks and
//! then validates every recorded version against the regions. Reaching a
//! terminal status closes the transaction; once closed every operation
//! fails with `TxError::IllegalState`.
//!
//! An external two-phase coordinator drives the same state machine through
//! the `Synchronization` callbacks instead of `commit`/`rollback`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use gridtx_core::{
    ConflictType, Key, MemberId, Region, RegionError, RegionId, Result, TxError, TxErrorKind,
    TxId, TxOperation, Value,
};
use tracing::{debug, error, warn};

use crate::failover::{OutcomeSummary, TxOutcome};
use crate::lock_request::{LockOutcome, LockRequest};
use crate::manager::TxManager;
use crate::region_state::RegionTxState;
use crate::validation::{validate_region, ValidationResult};

/// Status of a transaction in its lifecycle
///
/// Terminal states (no transitions allowed):
/// - `Committed`
/// - `RolledBack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Reading and buffering writes
    Active,
    /// Locks held and conflict check passed; the write-set is frozen
    Reserved,
    /// Writes applied
    Committed,
    /// Writes discarded
    RolledBack,
}

impl TxStatus {
    /// Whether no further transition is possible
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::RolledBack)
    }
}

/// Outcome code passed to `Synchronization::after_completion`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The coordinator decided to commit
    Committed,
    /// The coordinator decided to roll back
    RolledBack,
}

/// Callbacks of an external two-phase coordinator
///
/// The coordinator calls `before_completion` to prepare, decides an
/// outcome, then reports it through `after_completion`. Reporting
/// `Committed` is only legal after a successful `before_completion`.
pub trait Synchronization {
    /// Prepare: reserve locks and check for conflicts
    ///
    /// A conflict is reported as `TxError::SynchronizationCommitConflict`.
    fn before_completion(&mut self) -> Result<()>;

    /// Apply the coordinator's decision
    fn after_completion(&mut self, status: CompletionStatus) -> Result<()>;
}

/// Summary of buffered work that a rollback would discard
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingOperations {
    /// Buffered puts
    pub puts: usize,
    /// Buffered invalidates
    pub invalidates: usize,
    /// Buffered destroys
    pub destroys: usize,
    /// Keys in the read-set
    pub reads: usize,
}

impl PendingOperations {
    /// Number of buffered writes
    pub fn writes(&self) -> usize {
        self.puts + self.invalidates + self.destroys
    }

    /// Check if nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.writes() == 0 && self.reads == 0
    }
}

/// Per-transaction aggregate and state machine
pub struct TxState {
    tx_id: TxId,
    manager: Arc<TxManager>,
    /// Remote member the transaction runs on behalf of (none = local)
    originating_member: Option<MemberId>,
    is_jta: bool,
    status: TxStatus,
    closed: bool,
    regions: BTreeMap<RegionId, RegionTxState>,
    /// Set by a successful reservation over a non-empty write-set
    locks: Option<LockRequest>,
    before_completion_called: bool,
    failover_saved: bool,
    /// Writes buffered when the transaction closed
    final_writes: usize,
    /// Writes a failed commit left applied in storage
    partially_applied: usize,
    failure: Option<String>,
}

impl fmt::Debug for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxState")
            .field("tx_id", &self.tx_id)
            .field("status", &self.status)
            .field("closed", &self.closed)
            .field("originating_member", &self.originating_member)
            .field("is_jta", &self.is_jta)
            .field("regions", &self.regions)
            .field("locks", &self.locks)
            .finish()
    }
}

impl TxState {
    /// Create an active transaction
    pub fn new(
        tx_id: TxId,
        manager: Arc<TxManager>,
        originating_member: Option<MemberId>,
        is_jta: bool,
    ) -> Self {
        Self {
            tx_id,
            manager,
            originating_member,
            is_jta,
            status: TxStatus::Active,
            closed: false,
            regions: BTreeMap::new(),
            locks: None,
            before_completion_called: false,
            failover_saved: false,
            final_writes: 0,
            partially_applied: 0,
            failure: None,
        }
    }

    /// Transaction id
    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    /// Current status
    pub fn status(&self) -> TxStatus {
        self.status
    }

    /// Whether the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether an external coordinator drives the transaction
    pub fn is_jta(&self) -> bool {
        self.is_jta
    }

    /// Remote member that opened the transaction, if any
    pub fn originating_member(&self) -> Option<&MemberId> {
        self.originating_member.as_ref()
    }

    /// Manager the transaction reports to
    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.manager
    }

    /// State of one touched region
    pub fn region_state(&self, region: &RegionId) -> Option<&RegionTxState> {
        self.regions.get(region)
    }

    /// Ids of every touched region, in lock order
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.regions.keys().cloned().collect()
    }

    /// Whether `before_completion` has succeeded
    pub fn was_before_completion_called(&self) -> bool {
        self.before_completion_called
    }

    /// Whether a lock request exists (reservation obtained locks)
    pub fn has_lock_request(&self) -> bool {
        self.locks.is_some()
    }

    /// Whether write-set locks are currently held
    pub fn locks_held(&self) -> bool {
        self.locks.as_ref().map_or(false, |l| l.is_held())
    }

    /// Why the last commit attempt failed, if it did
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Writes that reached storage before a failed commit stopped
    ///
    /// Non-zero only for a commit that failed midway; such a transaction
    /// is reported as `TxOutcome::PartiallyApplied`, not rolled back.
    pub fn partially_applied(&self) -> usize {
        self.partially_applied
    }

    /// How the transaction ended, once terminal
    pub fn outcome(&self) -> Option<TxOutcome> {
        match self.status {
            TxStatus::Committed => Some(TxOutcome::Committed),
            TxStatus::RolledBack if self.partially_applied > 0 => {
                Some(TxOutcome::PartiallyApplied)
            }
            TxStatus::RolledBack => Some(TxOutcome::RolledBack),
            TxStatus::Active | TxStatus::Reserved => None,
        }
    }

    /// Buffered operations across all regions
    pub fn pending_operations(&self) -> PendingOperations {
        let mut ops = PendingOperations::default();
        for state in self.regions.values() {
            for (_, write) in state.writes() {
                match write.op {
                    TxOperation::Put(_) => ops.puts += 1,
                    TxOperation::Invalidate => ops.invalidates += 1,
                    TxOperation::Destroy => ops.destroys += 1,
                }
            }
            ops.reads += state.read_count();
        }
        ops
    }

    // ========================================================================
    // Cache-level operations
    // ========================================================================

    /// Read `key`, seeing this transaction's own buffered writes
    ///
    /// A read that reaches the region adds the key to the read-set.
    pub fn get(&mut self, region: &Arc<dyn Region>, key: &Key) -> Result<Option<Value>> {
        self.ensure_active("get")?;
        if let Some(write) = self
            .regions
            .get(region.id())
            .and_then(|s| s.pending_write(key))
        {
            return Ok(write.op.visible_value().cloned());
        }

        let current = region
            .read(key)
            .map_err(|e| e.into_tx_error(&self.tx_id, region.id()))?;
        let version = current.as_ref().map_or(0, |v| v.version);
        self.region_state_mut(region)
            .record_read(key.clone(), version);
        Ok(current.and_then(|v| v.value))
    }

    /// Whether `key` exists (an invalidated entry still exists)
    pub fn contains_key(&mut self, region: &Arc<dyn Region>, key: &Key) -> Result<bool> {
        self.ensure_active("contains_key")?;
        if let Some(write) = self
            .regions
            .get(region.id())
            .and_then(|s| s.pending_write(key))
        {
            return Ok(write.op.keeps_entry());
        }

        let current = region
            .read(key)
            .map_err(|e| e.into_tx_error(&self.tx_id, region.id()))?;
        let version = current.as_ref().map_or(0, |v| v.version);
        self.region_state_mut(region)
            .record_read(key.clone(), version);
        Ok(current.is_some())
    }

    /// Buffer a put
    pub fn put(&mut self, region: &Arc<dyn Region>, key: Key, value: Value) -> Result<()> {
        self.buffer_write(region, key, TxOperation::Put(value))
    }

    /// Buffer an invalidate
    pub fn invalidate(&mut self, region: &Arc<dyn Region>, key: Key) -> Result<()> {
        self.buffer_write(region, key, TxOperation::Invalidate)
    }

    /// Buffer a destroy
    pub fn destroy(&mut self, region: &Arc<dyn Region>, key: Key) -> Result<()> {
        self.buffer_write(region, key, TxOperation::Destroy)
    }

    fn buffer_write(&mut self, region: &Arc<dyn Region>, key: Key, op: TxOperation) -> Result<()> {
        self.ensure_active(op.name())?;
        let known = self
            .regions
            .get(region.id())
            .and_then(|s| s.known_version(&key));
        let base_version = match known {
            Some(version) => version,
            None => region
                .read(&key)
                .map_err(|e| e.into_tx_error(&self.tx_id, region.id()))?
                .map_or(0, |v| v.version),
        };
        self.region_state_mut(region)
            .record_write(key, op, base_version);
        Ok(())
    }

    /// State for `region`, created on first touch
    fn region_state_mut(&mut self, region: &Arc<dyn Region>) -> &mut RegionTxState {
        self.regions
            .entry(region.id().clone())
            .or_insert_with(|| RegionTxState::new(Arc::clone(region)))
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed {
            return Err(TxError::illegal_state(format!(
                "{} on closed transaction {}",
                operation, self.tx_id
            )));
        }
        Ok(())
    }

    fn ensure_active(&self, operation: &str) -> Result<()> {
        self.ensure_open(operation)?;
        if self.status != TxStatus::Active {
            return Err(TxError::illegal_state(format!(
                "{} on transaction {} in state {:?}",
                operation, self.tx_id, self.status
            )));
        }
        Ok(())
    }

    // ========================================================================
    // Reservation
    // ========================================================================

    /// Obtain the write-set locks and validate the read and write sets
    ///
    /// No-op when already reserved. On failure every lock and entry pin
    /// taken by this call is released and the transaction stays `Active`.
    ///
    /// # Errors
    ///
    /// - `CommitConflict` if locks are unavailable or a recorded version
    ///   is stale
    /// - `DataNodeDeparted` if a region's hosting member has left
    /// - `IllegalState` if the transaction is closed or terminal
    pub fn reserve_and_check(&mut self) -> Result<()> {
        self.ensure_open("reserve_and_check")?;
        match self.status {
            TxStatus::Reserved => return Ok(()),
            TxStatus::Active => {}
            other => {
                return Err(TxError::illegal_state(format!(
                    "reserve_and_check on transaction {} in state {:?}",
                    self.tx_id, other
                )))
            }
        }

        let mut request = LockRequest::new(self.tx_id.clone(), self.manager.lock_service());
        for (id, state) in &self.regions {
            request.add_region(id.clone(), state.write_keys());
        }

        if !request.is_empty() {
            match request.obtain() {
                Ok(LockOutcome::Obtained) => {}
                Ok(LockOutcome::Unavailable(region)) => {
                    let err = self.conflict(ValidationResult::conflict(
                        ConflictType::LockUnavailable { region },
                    ));
                    return Err(err);
                }
                Err(e) => return Err(e.source.into_tx_error(&self.tx_id, &e.region)),
            }
        }

        let mut validation = ValidationResult::ok();
        for (id, state) in &self.regions {
            match validate_region(state) {
                Ok(result) => validation.merge(result),
                Err(e) => {
                    request.release();
                    return Err(e.into_tx_error(&self.tx_id, id));
                }
            }
        }
        if !validation.is_valid() {
            request.release();
            return Err(self.conflict(validation));
        }

        if let Err((region, e)) = self.pin_writes() {
            request.release();
            return Err(e.into_tx_error(&self.tx_id, &region));
        }

        if !request.is_empty() {
            self.locks = Some(request);
        }
        self.status = TxStatus::Reserved;
        debug!(target: "gridtx::txn", tx_id = %self.tx_id, regions = self.regions.len(), "Transaction reserved");
        Ok(())
    }

    /// Pin written entries in their regions; undone on failure
    fn pin_writes(&self) -> std::result::Result<(), (RegionId, RegionError)> {
        let mut pinned: Vec<&RegionTxState> = Vec::new();
        for (id, state) in &self.regions {
            if !state.has_writes() {
                continue;
            }
            if let Err(e) = state.region().retain_tx_refs(&self.tx_id, &state.write_keys()) {
                for done in pinned {
                    if let Err(release_err) =
                        done.region().release_tx_refs(&self.tx_id, &done.write_keys())
                    {
                        warn!(target: "gridtx::txn", tx_id = %self.tx_id, region = %done.region_id(), error = %release_err, "Failed to unpin entries");
                    }
                }
                return Err((id.clone(), e));
            }
            pinned.push(state);
        }
        Ok(())
    }

    fn conflict(&self, validation: ValidationResult) -> TxError {
        warn!(
            target: "gridtx::txn",
            tx_id = %self.tx_id,
            conflicts = validation.conflict_count(),
            "Commit conflict"
        );
        TxError::CommitConflict {
            tx_id: self.tx_id.clone(),
            conflicts: validation.conflicts,
        }
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Apply every buffered write and close
    ///
    /// Reserves first when not yet reserved. Every hosting member of the
    /// write-set is checked before the first write lands, so a departed host
    /// fails the commit with nothing applied. Any failure discards the
    /// transaction: it ends `RolledBack` and closed, with locks released.
    /// A failure after some writes already landed is recorded as
    /// `TxOutcome::PartiallyApplied`.
    ///
    /// # Errors
    ///
    /// - `CommitConflict` from reservation, or when a region reports a
    ///   version mismatch at apply time
    /// - `DataNodeDeparted` if a region's hosting member has left
    /// - `IllegalState` if already closed
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_open("commit")?;
        if self.status == TxStatus::Active {
            if let Err(e) = self.reserve_and_check() {
                self.discard(&e);
                return Err(e);
            }
        }

        match self.apply_writes() {
            Ok(applied) => {
                self.status = TxStatus::Committed;
                debug!(target: "gridtx::txn", tx_id = %self.tx_id, applied, "Transaction committed");
                self.close();
                Ok(())
            }
            Err((applied, e)) => {
                if applied > 0 {
                    error!(target: "gridtx::txn", tx_id = %self.tx_id, applied, error = %e, "Commit failed after writes were applied");
                }
                self.partially_applied = applied;
                self.discard(&e);
                Err(e)
            }
        }
    }

    /// Fail with the first departed host among the written regions
    fn ensure_writes_hosted(&self) -> Result<()> {
        for (id, state) in &self.regions {
            if !state.has_writes() {
                continue;
            }
            if let Err(e) = state.region().ensure_hosted(&state.write_keys()) {
                if let RegionError::NodeDeparted { member } = &e {
                    warn!(target: "gridtx::txn", tx_id = %self.tx_id, region = %id, member = %member, "Data node departed before apply");
                }
                return Err(e.into_tx_error(&self.tx_id, id));
            }
        }
        Ok(())
    }

    /// Apply buffered writes region by region, in lock order
    ///
    /// On failure, returns how many writes had already been applied.
    fn apply_writes(&self) -> std::result::Result<usize, (usize, TxError)> {
        self.ensure_writes_hosted().map_err(|e| (0, e))?;
        let mut applied = 0usize;
        for (id, state) in &self.regions {
            let region = state.region();
            for (key, write) in state.writes() {
                match region.apply_write(key, &write.op, write.base_version) {
                    Ok(_) => applied += 1,
                    Err(RegionError::EntryNotFound { .. })
                        if !matches!(write.op, TxOperation::Put(_)) =>
                    {
                        debug!(target: "gridtx::txn", tx_id = %self.tx_id, region = %id, key = %key, op = write.op.name(), "Entry already gone");
                    }
                    Err(e) => {
                        if let RegionError::NodeDeparted { member } = &e {
                            warn!(target: "gridtx::txn", tx_id = %self.tx_id, region = %id, member = %member, "Data node departed during commit");
                        }
                        return Err((applied, e.into_tx_error(&self.tx_id, id)));
                    }
                }
            }
        }
        Ok(applied)
    }

    /// Discard all buffered writes and close
    ///
    /// # Errors
    ///
    /// `IllegalState` if already closed.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open("rollback")?;
        self.status = TxStatus::RolledBack;
        debug!(target: "gridtx::txn", tx_id = %self.tx_id, "Transaction rolled back");
        self.close();
        Ok(())
    }

    fn discard(&mut self, err: &TxError) {
        if self.closed {
            return;
        }
        debug!(target: "gridtx::txn", tx_id = %self.tx_id, error = %err, "Discarding failed transaction");
        self.failure = Some(err.to_string());
        self.status = TxStatus::RolledBack;
        self.close();
    }

    /// Tear the transaction down; idempotent
    ///
    /// A transaction that held locks cleans up every region state (region
    /// failures are logged and the rest still run) and then releases its
    /// locks. One that never held locks only closes its region states.
    /// A transaction closed before reaching a terminal status ends
    /// `RolledBack`. The outcome is recorded for client failover.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if !self.status.is_terminal() {
            self.status = TxStatus::RolledBack;
        }
        self.final_writes = self.pending_operations().writes();

        if self.locks.is_some() {
            for (id, state) in self.regions.iter_mut() {
                let region = Arc::clone(state.region());
                if let Err(e) = state.cleanup(region.as_ref(), &self.tx_id) {
                    warn!(target: "gridtx::txn", tx_id = %self.tx_id, region = %id, error = %e, "Region cleanup failed");
                }
            }
            self.cleanup();
        } else {
            for state in self.regions.values_mut() {
                state.close();
            }
        }

        self.closed = true;
        if let Some(outcome) = self.outcome() {
            self.manager.note_terminal(outcome);
        }
        self.save_outcome_for_failover();
        debug!(target: "gridtx::txn", tx_id = %self.tx_id, status = ?self.status, "Transaction closed");
    }

    /// Release the write-set locks
    fn cleanup(&mut self) {
        if let Some(locks) = self.locks.as_mut() {
            locks.release();
        }
    }

    /// Record the outcome with the manager, once per transaction
    ///
    /// Does nothing before the transaction reaches a terminal status.
    pub fn save_outcome_for_failover(&mut self) {
        if self.failover_saved || !self.status.is_terminal() {
            return;
        }
        self.failover_saved = true;

        let Some(outcome) = self.outcome() else {
            return;
        };
        let operations = if self.closed {
            self.final_writes
        } else {
            self.pending_operations().writes()
        };
        let summary = OutcomeSummary {
            tx_id: self.tx_id.clone(),
            outcome,
            originating_member: self.originating_member.clone(),
            regions: self.region_ids(),
            operations,
            failure: self.failure.clone(),
            completed_at: Utc::now(),
        };
        self.manager
            .record_failover_message(self.tx_id.clone(), summary);
    }
}

impl Synchronization for TxState {
    fn before_completion(&mut self) -> Result<()> {
        self.ensure_open("before_completion")?;
        if self.before_completion_called {
            return Ok(());
        }
        match self.reserve_and_check() {
            Ok(()) => {
                self.before_completion_called = true;
                Ok(())
            }
            Err(e) if e.kind() == TxErrorKind::CommitConflict => {
                Err(TxError::SynchronizationCommitConflict {
                    tx_id: self.tx_id.clone(),
                    source: Box::new(e),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn after_completion(&mut self, status: CompletionStatus) -> Result<()> {
        let result = match status {
            CompletionStatus::Committed => {
                if !self.before_completion_called {
                    error!(target: "gridtx::txn", tx_id = %self.tx_id, "after_completion(Committed) without a successful before_completion");
                    return Err(TxError::illegal_state(format!(
                        "after_completion(Committed) on transaction {} before a successful before_completion",
                        self.tx_id
                    )));
                }
                self.commit().map_err(|e| match e.kind() {
                    TxErrorKind::CommitConflict => TxError::Transaction {
                        tx_id: self.tx_id.clone(),
                        reason: "conflict detected after the coordinator decided to commit"
                            .to_string(),
                        source: Some(Box::new(e)),
                    },
                    _ => e,
                })
            }
            CompletionStatus::RolledBack => self.rollback(),
        };
        self.save_outcome_for_failover();
        result
    }
}

impl Drop for TxState {
    fn drop(&mut self) {
        if !self.closed {
            debug!(target: "gridtx::txn", tx_id = %self.tx_id, "Dropping open transaction");
            self.close();
        }
    }
}
