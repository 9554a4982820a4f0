//! gridtx - transactional core for a distributed in-memory data grid
//!
//! gridtx gives multi-key, multi-region operations atomicity and isolation.
//! Writes are buffered per transaction; at commit the write-set is locked,
//! every recorded version is validated, and the buffered writes are applied
//! to their regions. An external two-phase coordinator can drive the same
//! protocol through the [`Synchronization`] callbacks.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use gridtx::{InMemoryRegion, MemberId, Region, TxConfig, TxManager, Value, Key};
//!
//! let manager = TxManager::with_local_locks(TxConfig::default())?;
//! let orders: Arc<dyn Region> =
//!     Arc::new(InMemoryRegion::replicated("orders", MemberId::new("local")));
//!
//! let handle = manager.begin();
//! let mut tx = handle.lock();
//! tx.put(&orders, "o-1", 42i64)?;
//! assert_eq!(tx.get(&orders, &Key::from("o-1"))?, Some(Value::Int(42)));
//! tx.commit()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! - `gridtx-core`: identifiers, values, the error taxonomy, collaborator traits
//! - `gridtx-storage`: an in-memory reference `Region`
//! - `gridtx-concurrency`: the transaction state machine, locking, the manager

pub use gridtx_concurrency::{
    validate_region, CompletionStatus, ConfigError, FailoverError, LocalLockService, LockError,
    LockOutcome, LockRequest, OutcomeCache, OutcomeSummary, PendingOperations, PendingWrite,
    RegionLockBatch, RegionTxState, Synchronization, Teardown, TxConfig, TxHandle, TxManager,
    TxManagerStats, TxOutcome, TxState, TxStateProxy, TxStatus, ValidationResult,
    CONFIG_FILE_NAME,
};
pub use gridtx_core::{
    ConflictType, Key, LockService, MemberId, Region, RegionError, RegionId, Result, TxError,
    TxErrorKind, TxId, TxOperation, Value, VersionedValue,
};
pub use gridtx_storage::InMemoryRegion;
