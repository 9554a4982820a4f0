//! Error types for gridtx
//!
//! Transaction failures are a tagged enum rather than a hierarchy so callers
//! can match exhaustively. The important split is between failures that are
//! logical (a conflict, the whole transaction may be retried) and failures
//! where the node hosting transactional data left the cluster (the caller
//! must pick a new target or give up).
//!
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.

use std::fmt;
use thiserror::Error;

use crate::types::{Key, MemberId, RegionId, TxId};

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, TxError>;

/// A single conflict found while reserving or applying a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictType {
    /// A key read by the transaction was changed by another writer
    ReadWrite {
        /// Region holding the key
        region: RegionId,
        /// The key that changed
        key: Key,
        /// Version recorded when read
        read_version: u64,
        /// Version found at validation time
        current_version: u64,
    },

    /// A key written by the transaction was changed by another writer
    /// after this transaction first touched it
    WriteWrite {
        /// Region holding the key
        region: RegionId,
        /// The key that changed
        key: Key,
        /// Version observed when the write was buffered
        base_version: u64,
        /// Version found at validation time
        current_version: u64,
    },

    /// The cluster-wide locks for a region could not be obtained
    /// (held by another transaction past the lock timeout)
    LockUnavailable {
        /// Region whose lock batch failed
        region: RegionId,
    },

    /// The region rejected a write at apply time because the entry moved
    /// on since reservation
    ApplyConflict {
        /// Region holding the key
        region: RegionId,
        /// The key that changed
        key: Key,
        /// Version the transaction expected
        expected_version: u64,
        /// Version the region reported
        current_version: u64,
    },
}

impl ConflictType {
    /// Region the conflict occurred in
    pub fn region(&self) -> &RegionId {
        match self {
            ConflictType::ReadWrite { region, .. }
            | ConflictType::WriteWrite { region, .. }
            | ConflictType::LockUnavailable { region }
            | ConflictType::ApplyConflict { region, .. } => region,
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ReadWrite {
                region,
                key,
                read_version,
                current_version,
            } => write!(
                f,
                "read of {}[{}] at version {} is stale (now {})",
                region, key, read_version, current_version
            ),
            ConflictType::WriteWrite {
                region,
                key,
                base_version,
                current_version,
            } => write!(
                f,
                "write to {}[{}] based on version {} is stale (now {})",
                region, key, base_version, current_version
            ),
            ConflictType::LockUnavailable { region } => {
                write!(f, "locks for {} unavailable", region)
            }
            ConflictType::ApplyConflict {
                region,
                key,
                expected_version,
                current_version,
            } => write!(
                f,
                "apply of {}[{}] expected version {} but found {}",
                region, key, expected_version, current_version
            ),
        }
    }
}

/// Discriminant of [`TxError`], for callers that only need the category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxErrorKind {
    /// Optimistic conflict detected at reservation
    CommitConflict,
    /// Conflict reported through the external coordinator's prepare phase
    SynchronizationCommitConflict,
    /// Node owning transactional data left the cluster
    DataNodeDeparted,
    /// Broad commit-time failure
    Transaction,
    /// Contract violation (closed transaction, callback ordering)
    IllegalState,
}

/// Error types for the transactional core
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TxError {
    /// Optimistic-concurrency conflict; retrying the whole transaction may succeed
    #[error("commit conflict in transaction {tx_id}: {} conflict(s)", .conflicts.len())]
    CommitConflict {
        /// Transaction that failed
        tx_id: TxId,
        /// Every conflict found
        conflicts: Vec<ConflictType>,
    },

    /// A commit conflict raised from the coordinator's pre-commit callback
    ///
    /// Tells the coordinator to drive a rollback rather than retry prepare.
    #[error("synchronization commit conflict in transaction {tx_id}: {source}")]
    SynchronizationCommitConflict {
        /// Transaction that failed
        tx_id: TxId,
        /// The underlying commit conflict
        source: Box<TxError>,
    },

    /// The member hosting transactional data left the cluster mid-commit
    #[error("member {member} hosting data for transaction {tx_id} has departed")]
    DataNodeDeparted {
        /// Transaction that failed
        tx_id: TxId,
        /// Departed member
        member: MemberId,
    },

    /// Commit-time failure after the coordinator already decided to commit
    #[error("transaction {tx_id} failed: {reason}")]
    Transaction {
        /// Transaction that failed
        tx_id: TxId,
        /// Human-readable reason
        reason: String,
        /// Underlying failure, when there is one
        #[source]
        source: Option<Box<TxError>>,
    },

    /// Operation on a closed transaction, or a callback ordering violation
    #[error("illegal transaction state: {0}")]
    IllegalState(String),
}

impl TxError {
    /// Create an illegal state error
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        TxError::IllegalState(msg.into())
    }

    /// Category of this error
    pub fn kind(&self) -> TxErrorKind {
        match self {
            TxError::CommitConflict { .. } => TxErrorKind::CommitConflict,
            TxError::SynchronizationCommitConflict { .. } => {
                TxErrorKind::SynchronizationCommitConflict
            }
            TxError::DataNodeDeparted { .. } => TxErrorKind::DataNodeDeparted,
            TxError::Transaction { .. } => TxErrorKind::Transaction,
            TxError::IllegalState(_) => TxErrorKind::IllegalState,
        }
    }

    /// Whether retrying the whole transaction is a sensible response
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            TxErrorKind::CommitConflict | TxErrorKind::SynchronizationCommitConflict
        )
    }

    /// Conflicts carried by this error (empty for non-conflict errors)
    pub fn conflicts(&self) -> &[ConflictType] {
        match self {
            TxError::CommitConflict { conflicts, .. } => conflicts,
            TxError::SynchronizationCommitConflict { source, .. } => source.conflicts(),
            _ => &[],
        }
    }
}

/// Errors reported by region storage and lock collaborators
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The member hosting the region's data has left the cluster
    #[error("member {member} hosting region data has departed")]
    NodeDeparted {
        /// Departed member
        member: MemberId,
    },

    /// The entry does not exist
    #[error("entry {key} not found")]
    EntryNotFound {
        /// Missing key
        key: Key,
    },

    /// The entry version differs from the one the writer expected
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    VersionConflict {
        /// Conflicting key
        key: Key,
        /// Expected version
        expected: u64,
        /// Actual version
        found: u64,
    },

    /// Any other storage failure
    #[error("storage error: {0}")]
    Storage(String),
}

impl RegionError {
    /// Translate into the transaction error taxonomy
    ///
    /// `EntryNotFound` has no transactional meaning of its own and becomes a
    /// broad transaction failure; callers that treat it as an idempotent
    /// success must match it before converting.
    pub fn into_tx_error(self, tx_id: &TxId, region: &RegionId) -> TxError {
        match self {
            RegionError::NodeDeparted { member } => TxError::DataNodeDeparted {
                tx_id: tx_id.clone(),
                member,
            },
            RegionError::VersionConflict {
                key,
                expected,
                found,
            } => TxError::CommitConflict {
                tx_id: tx_id.clone(),
                conflicts: vec![ConflictType::ApplyConflict {
                    region: region.clone(),
                    key,
                    expected_version: expected,
                    current_version: found,
                }],
            },
            other @ (RegionError::EntryNotFound { .. } | RegionError::Storage(_)) => {
                TxError::Transaction {
                    tx_id: tx_id.clone(),
                    reason: format!("{} in region {}", other, region),
                    source: None,
                }
            }
        }
    }
}
