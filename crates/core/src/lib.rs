//! Core types and traits for gridtx
//!
//! This crate defines the foundational types used throughout the system:
//! - MemberId / TxId: Cluster member and transaction identity
//! - RegionId / Key: Region name and entry key
//! - TxOperation: A buffered write
//! - Value / VersionedValue: Entry payloads
//! - TxError / RegionError: Error taxonomy
//! - Traits: Collaborator interfaces (Region, LockService)

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod traits;
pub mod types;
pub mod value;

pub use error::{ConflictType, RegionError, Result, TxError, TxErrorKind};
pub use traits::{LockService, Region};
pub use types::{Key, MemberId, RegionId, TxId, TxOperation};
pub use value::{Value, VersionedValue};
