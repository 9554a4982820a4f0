//! Front controller binding cache operations to a transaction
//!
//! A `TxStateProxy` is what callers hold: it carries the transaction's
//! identity and origin, creates the `TxState` on first use, and forwards
//! operations and coordinator callbacks to it. When the transaction
//! closes, the proxy removes itself from the manager's registry.

use std::sync::Arc;

use gridtx_core::{Key, MemberId, Region, Result, TxError, TxId, Value};
use parking_lot::Mutex;
use tracing::warn;

use crate::manager::TxManager;
use crate::transaction::{CompletionStatus, PendingOperations, Synchronization, TxState, TxStatus};

/// Shared handle to a proxy, as returned by `TxManager::begin*`
pub type TxHandle = Arc<Mutex<TxStateProxy>>;

/// Per-transaction front controller
pub struct TxStateProxy {
    tx_id: TxId,
    manager: Arc<TxManager>,
    originating_member: Option<MemberId>,
    is_jta: bool,
    state: Option<TxState>,
    unregistered: bool,
}

impl std::fmt::Debug for TxStateProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxStateProxy")
            .field("tx_id", &self.tx_id)
            .field("originating_member", &self.originating_member)
            .field("is_jta", &self.is_jta)
            .field("state", &self.state)
            .finish()
    }
}

impl TxStateProxy {
    pub(crate) fn new(
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
            state: None,
            unregistered: false,
        }
    }

    /// Transaction id
    pub fn tx_id(&self) -> &TxId {
        &self.tx_id
    }

    /// Remote member that opened the transaction; `None` when local
    pub fn originating_member(&self) -> Option<&MemberId> {
        self.originating_member.as_ref()
    }

    /// Whether an external coordinator drives the transaction
    pub fn is_jta(&self) -> bool {
        self.is_jta
    }

    /// Manager the transaction is registered with
    pub fn tx_manager(&self) -> &Arc<TxManager> {
        &self.manager
    }

    /// The transaction state, if any operation has created it yet
    pub fn state(&self) -> Option<&TxState> {
        self.state.as_ref()
    }

    /// Current status (`Active` until the state exists)
    pub fn status(&self) -> TxStatus {
        self.state.as_ref().map_or(TxStatus::Active, TxState::status)
    }

    /// Whether the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.state.as_ref().map_or(false, TxState::is_closed)
    }

    /// Buffered work so far
    pub fn pending_operations(&self) -> PendingOperations {
        self.state
            .as_ref()
            .map(TxState::pending_operations)
            .unwrap_or_default()
    }

    fn state_mut(&mut self) -> &mut TxState {
        let (tx_id, manager, origin, is_jta) = (
            &self.tx_id,
            &self.manager,
            &self.originating_member,
            self.is_jta,
        );
        self.state.get_or_insert_with(|| {
            TxState::new(tx_id.clone(), Arc::clone(manager), origin.clone(), is_jta)
        })
    }

    /// Unregister once the transaction has closed
    fn finish(&mut self) {
        if self.unregistered || !self.is_closed() {
            return;
        }
        self.unregistered = true;
        self.manager.unregister(&self.tx_id);
    }

    fn ensure_not_jta(&self, operation: &str) -> Result<()> {
        if self.is_jta {
            return Err(TxError::illegal_state(format!(
                "{} on transaction {} which is driven by an external coordinator",
                operation, self.tx_id
            )));
        }
        Ok(())
    }

    /// Transactional read
    pub fn get(&mut self, region: &Arc<dyn Region>, key: &Key) -> Result<Option<Value>> {
        self.state_mut().get(region, key)
    }

    /// Transactional existence check
    pub fn contains_key(&mut self, region: &Arc<dyn Region>, key: &Key) -> Result<bool> {
        self.state_mut().contains_key(region, key)
    }

    /// Buffer a put
    pub fn put(
        &mut self,
        region: &Arc<dyn Region>,
        key: impl Into<Key>,
        value: impl Into<Value>,
    ) -> Result<()> {
        self.state_mut().put(region, key.into(), value.into())
    }

    /// Buffer an invalidate
    pub fn invalidate(&mut self, region: &Arc<dyn Region>, key: impl Into<Key>) -> Result<()> {
        self.state_mut().invalidate(region, key.into())
    }

    /// Buffer a destroy
    pub fn destroy(&mut self, region: &Arc<dyn Region>, key: impl Into<Key>) -> Result<()> {
        self.state_mut().destroy(region, key.into())
    }

    /// Reserve locks and check for conflicts ahead of commit
    pub fn reserve_and_check(&mut self) -> Result<()> {
        self.state_mut().reserve_and_check()
    }

    /// Commit directly
    ///
    /// # Errors
    ///
    /// `IllegalState` for externally coordinated transactions, otherwise
    /// whatever `TxState::commit` reports.
    pub fn commit(&mut self) -> Result<()> {
        self.ensure_not_jta("commit")?;
        let result = self.state_mut().commit();
        self.finish();
        result
    }

    /// Roll back directly
    ///
    /// # Errors
    ///
    /// `IllegalState` for externally coordinated transactions or when
    /// already closed.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_not_jta("rollback")?;
        let result = self.state_mut().rollback();
        self.finish();
        result
    }

    /// Close without committing; idempotent
    pub fn close(&mut self) {
        self.state_mut().close();
        self.finish();
    }
}

impl Synchronization for TxStateProxy {
    fn before_completion(&mut self) -> Result<()> {
        self.state_mut().before_completion()
    }

    fn after_completion(&mut self, status: CompletionStatus) -> Result<()> {
        let result = self.state_mut().after_completion(status);
        self.finish();
        result
    }
}

impl Drop for TxStateProxy {
    fn drop(&mut self) {
        if let Some(state) = self.state.as_mut() {
            if !state.is_closed() {
                warn!(target: "gridtx::txn", tx_id = %self.tx_id, "Open transaction dropped; rolling back");
                state.close();
            }
        }
        if !self.unregistered {
            self.unregistered = true;
            self.manager.unregister(&self.tx_id);
        }
    }
}
