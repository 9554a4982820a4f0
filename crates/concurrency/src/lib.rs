//! Transactional layer for gridtx
//!
//! This crate implements optimistic multi-region transactions with:
//! - RegionTxState: per-region write-set and read-set tracking
//! - LockRequest: all-or-nothing write-set locking through a `LockService`
//! - TxState: the transaction state machine (reserve, validate, commit, rollback)
//! - TxStateProxy: the caller-facing handle, including two-phase coordinator callbacks
//! - TxManager: registry of active transactions and the failover outcome cache

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod failover;
pub mod lock_request;
pub mod lock_service;
pub mod manager;
pub mod proxy;
pub mod region_state;
pub mod transaction;
pub mod validation;

pub use config::{ConfigError, TxConfig, CONFIG_FILE_NAME};
pub use failover::{FailoverError, OutcomeCache, OutcomeSummary, TxOutcome};
pub use lock_request::{LockError, LockOutcome, LockRequest, RegionLockBatch};
pub use lock_service::LocalLockService;
pub use manager::{TxManager, TxManagerStats};
pub use proxy::{TxHandle, TxStateProxy};
pub use region_state::{PendingWrite, RegionTxState, Teardown};
pub use transaction::{CompletionStatus, PendingOperations, Synchronization, TxState, TxStatus};
pub use validation::{validate_region, ValidationResult};
