//! Conflict validation for optimistic transactions
//!
//! Conflicts are detected at reservation time, after the write-set locks
//! are held, by comparing the versions the transaction recorded against
//! what each region reports now:
//! - every key in the read-set must still be at the version read
//! - every key in the write-set must still be at its base version
//!
//! A key that was both read and written is judged once, as a write.

use gridtx_core::{ConflictType, RegionError};

use crate::region_state::RegionTxState;

/// Result of transaction validation
///
/// Accumulates all conflicts found during validation.
/// A transaction may proceed only if is_valid() returns true.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationResult {
    /// All conflicts detected during validation
    pub conflicts: Vec<ConflictType>,
}

impl ValidationResult {
    /// Create a successful validation result (no conflicts)
    pub fn ok() -> Self {
        Self::default()
    }

    /// Create a validation result with a single conflict
    pub fn conflict(conflict: ConflictType) -> Self {
        ValidationResult {
            conflicts: vec![conflict],
        }
    }

    /// Check if validation passed (no conflicts)
    pub fn is_valid(&self) -> bool {
        self.conflicts.is_empty()
    }

    /// Merge another validation result into this one
    pub fn merge(&mut self, other: ValidationResult) {
        self.conflicts.extend(other.conflicts);
    }

    /// Get the number of conflicts
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }
}

/// Validate one region's read-set and write-set against current storage
///
/// # Errors
///
/// Propagates region read failures (e.g. the hosting member departed).
pub fn validate_region(state: &RegionTxState) -> Result<ValidationResult, RegionError> {
    let region = state.region();
    let mut result = ValidationResult::ok();

    for (key, write) in state.writes() {
        let current = region.read(key)?.map(|v| v.version).unwrap_or(0);
        if current != write.base_version {
            result.conflicts.push(ConflictType::WriteWrite {
                region: state.region_id().clone(),
                key: key.clone(),
                base_version: write.base_version,
                current_version: current,
            });
        }
    }

    for (key, read_version) in state.reads() {
        if state.pending_write(key).is_some() {
            continue;
        }
        let current = region.read(key)?.map(|v| v.version).unwrap_or(0);
        if current != read_version {
            result.conflicts.push(ConflictType::ReadWrite {
                region: state.region_id().clone(),
                key: key.clone(),
                read_version,
                current_version: current,
            });
        }
    }

    Ok(result)
}
