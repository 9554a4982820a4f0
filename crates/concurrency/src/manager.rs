//! Process-wide transaction registry
//!
//! `TxManager` allocates transaction ids, hands out proxies, keeps a
//! non-owning registry of the active ones, and remembers recent outcomes
//! so a client that reconnects after a failover can learn whether its
//! transaction completed.
//!
//! The registry holds `Weak` references: a transaction lives exactly as
//! long as its callers hold the handle. Dropping the last handle of an
//! open transaction rolls it back and removes it from the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use gridtx_core::{LockService, MemberId, TxId};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::{ConfigError, TxConfig};
use crate::failover::{OutcomeCache, OutcomeSummary, TxOutcome};
use crate::lock_service::LocalLockService;
use crate::proxy::{TxHandle, TxStateProxy};

/// Snapshot of the manager's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxManagerStats {
    /// Transactions begun through this manager
    pub begun: u64,
    /// Transactions that committed
    pub committed: u64,
    /// Transactions that rolled back (including failed commits)
    pub rolled_back: u64,
    /// Failed commits that left some writes applied
    pub partially_applied: u64,
    /// Outcome summaries recorded for failover
    pub failover_messages: u64,
    /// Transactions currently registered and alive
    pub active: usize,
}

/// Registry of active transactions and recent outcomes
pub struct TxManager {
    config: TxConfig,
    member: MemberId,
    lock_service: Arc<dyn LockService>,
    next_seq: AtomicU64,
    active: DashMap<TxId, Weak<Mutex<TxStateProxy>>>,
    outcomes: OutcomeCache,

    begun: AtomicU64,
    committed: AtomicU64,
    rolled_back: AtomicU64,
    partially_applied: AtomicU64,
    failover_messages: AtomicU64,
}

impl TxManager {
    /// Create a manager using `lock_service` for write-set locks
    ///
    /// # Errors
    ///
    /// `ConfigError::Invalid` if the configuration fails validation.
    pub fn new(config: TxConfig, lock_service: Arc<dyn LockService>) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let member = config.local_member();
        let outcomes = OutcomeCache::new(config.failover_cache_capacity, config.failover_ttl());
        debug!(target: "gridtx::txn", member = %member, "Transaction manager started");
        Ok(Arc::new(Self {
            config,
            member,
            lock_service,
            next_seq: AtomicU64::new(1),
            active: DashMap::new(),
            outcomes,
            begun: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            rolled_back: AtomicU64::new(0),
            partially_applied: AtomicU64::new(0),
            failover_messages: AtomicU64::new(0),
        }))
    }

    /// Create a manager backed by a process-local lock service
    pub fn with_local_locks(config: TxConfig) -> Result<Arc<Self>, ConfigError> {
        let locks = Arc::new(LocalLockService::new(config.lock_timeout()));
        Self::new(config, locks)
    }

    /// Active configuration
    pub fn config(&self) -> &TxConfig {
        &self.config
    }

    /// Identity of the local member
    pub fn local_member(&self) -> &MemberId {
        &self.member
    }

    /// Lock service shared by every transaction
    pub fn lock_service(&self) -> Arc<dyn LockService> {
        Arc::clone(&self.lock_service)
    }

    /// Allocate the next transaction id
    pub fn next_tx_id(&self) -> TxId {
        TxId::new(self.member.clone(), self.next_seq.fetch_add(1, Ordering::Relaxed))
    }

    // ========================================================================
    // Transaction lifecycle
    // ========================================================================

    /// Begin a locally originated transaction
    pub fn begin(self: &Arc<Self>) -> TxHandle {
        self.begin_with(None, false)
    }

    /// Begin a transaction on behalf of a remote client member
    pub fn begin_for_client(self: &Arc<Self>, client: MemberId) -> TxHandle {
        self.begin_with(Some(client), false)
    }

    /// Begin a transaction driven by an external two-phase coordinator
    pub fn begin_jta(self: &Arc<Self>, originating_member: Option<MemberId>) -> TxHandle {
        self.begin_with(originating_member, true)
    }

    fn begin_with(self: &Arc<Self>, origin: Option<MemberId>, is_jta: bool) -> TxHandle {
        let tx_id = self.next_tx_id();
        let handle = Arc::new(Mutex::new(TxStateProxy::new(
            tx_id.clone(),
            Arc::clone(self),
            origin,
            is_jta,
        )));
        self.register(tx_id.clone(), &handle);
        self.begun.fetch_add(1, Ordering::Relaxed);
        debug!(target: "gridtx::txn", tx_id = %tx_id, is_jta, "Transaction begun");
        handle
    }

    // ========================================================================
    // Registry
    // ========================================================================

    /// Register an active transaction (non-owning)
    pub fn register(&self, tx_id: TxId, handle: &TxHandle) {
        self.active.insert(tx_id, Arc::downgrade(handle));
    }

    /// Remove a transaction from the registry; returns whether it was present
    pub fn unregister(&self, tx_id: &TxId) -> bool {
        let removed = self.active.remove(tx_id).is_some();
        if removed {
            trace!(target: "gridtx::txn", tx_id = %tx_id, "Transaction unregistered");
        }
        removed
    }

    /// Handle of an active transaction
    ///
    /// Entries whose proxy has been dropped are pruned.
    pub fn lookup(&self, tx_id: &TxId) -> Option<TxHandle> {
        // Clone the weak ref so no map guard is held while upgrading
        let weak = self.active.get(tx_id).map(|entry| entry.value().clone())?;
        match weak.upgrade() {
            Some(handle) => Some(handle),
            None => {
                self.active.remove_if(tx_id, |_, w| w.strong_count() == 0);
                None
            }
        }
    }

    /// Number of registered transactions still alive
    pub fn active_count(&self) -> usize {
        self.active
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    // ========================================================================
    // Failover
    // ========================================================================

    /// Store the outcome of `tx_id`, replacing any earlier summary
    pub fn record_failover_message(&self, tx_id: TxId, summary: OutcomeSummary) {
        debug!(target: "gridtx::txn", tx_id = %tx_id, outcome = ?summary.outcome, "Outcome recorded for failover");
        self.outcomes.insert(tx_id, summary);
        self.failover_messages.fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome of a finished transaction, if still cached
    pub fn lookup_outcome(&self, tx_id: &TxId) -> Option<OutcomeSummary> {
        self.outcomes.get(tx_id)
    }

    /// Whether `tx_id` finished recently enough to still have an outcome
    pub fn is_recently_completed(&self, tx_id: &TxId) -> bool {
        self.outcomes.contains(tx_id)
    }

    // ========================================================================
    // Counters
    // ========================================================================

    pub(crate) fn note_terminal(&self, outcome: TxOutcome) {
        let counter = match outcome {
            TxOutcome::Committed => &self.committed,
            TxOutcome::RolledBack => &self.rolled_back,
            TxOutcome::PartiallyApplied => &self.partially_applied,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counters
    pub fn stats(&self) -> TxManagerStats {
        TxManagerStats {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            partially_applied: self.partially_applied.load(Ordering::Relaxed),
            failover_messages: self.failover_messages.load(Ordering::Relaxed),
            active: self.active_count(),
        }
    }
}
