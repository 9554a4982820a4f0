//! Core identifier types
//!
//! This module defines the foundational types:
//! - MemberId: Identity of a cluster member
//! - TxId: Cluster-wide transaction identifier
//! - RegionId: Name of a region (unit of transactional scope)
//! - Key: Opaque entry key within a region
//! - TxOperation: A buffered write against one entry

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::value::Value;

/// Identity of a cluster member
///
/// Members are identified by name. The local node gets a random name
/// (UUID v4) unless one is configured.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Create a member id with a random UUID v4 name
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Member name
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cluster-wide transaction identifier
///
/// A TxId is the hosting member plus a sequence number unique within that
/// member's transaction manager. It is immutable and created once per
/// transaction start.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId {
    member: MemberId,
    seq: u64,
}

impl TxId {
    /// Create a transaction id
    pub fn new(member: MemberId, seq: u64) -> Self {
        Self { member, seq }
    }

    /// Member hosting the transaction
    pub fn member(&self) -> &MemberId {
        &self.member
    }

    /// Sequence number within the hosting member
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.member, self.seq)
    }
}

/// Name of a region
///
/// Ordered so that lock acquisition over several regions follows a single
/// global order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionId(String);

impl RegionId {
    /// Create a region id from a name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Region name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RegionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0)
    }
}

/// Opaque entry key within a region
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(b: Vec<u8>) -> Self {
        Self(b)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A buffered write against one entry
///
/// Writes are held by the transaction until commit and only then applied
/// to the owning region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TxOperation {
    /// Set the entry value
    Put(Value),
    /// Keep the entry but drop its value
    Invalidate,
    /// Remove the entry
    Destroy,
}

impl TxOperation {
    /// Value a reader inside the transaction observes after this write
    ///
    /// `None` means the entry reads as absent (destroyed or invalidated).
    pub fn visible_value(&self) -> Option<&Value> {
        match self {
            TxOperation::Put(v) => Some(v),
            TxOperation::Invalidate | TxOperation::Destroy => None,
        }
    }

    /// Whether the entry still exists after this write
    pub fn keeps_entry(&self) -> bool {
        !matches!(self, TxOperation::Destroy)
    }

    /// Short operation name for logs
    pub fn name(&self) -> &'static str {
        match self {
            TxOperation::Put(_) => "put",
            TxOperation::Invalidate => "invalidate",
            TxOperation::Destroy => "destroy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tx_id_display() {
        let id = TxId::new(MemberId::new("server-1"), 42);
        assert_eq!(id.to_string(), "server-1:42");
        assert_eq!(id.seq(), 42);
        assert_eq!(id.member().name(), "server-1");
    }

    #[test]
    fn test_random_members_differ() {
        assert_ne!(MemberId::random(), MemberId::random());
    }

    #[test]
    fn test_region_ordering() {
        let mut regions = vec![RegionId::from("orders"), RegionId::from("customers")];
        regions.sort();
        assert_eq!(regions[0].as_str(), "customers");
    }

    #[test]
    fn test_key_from_str() {
        let key = Key::from("k1");
        assert_eq!(key.as_bytes(), b"k1");
        assert_eq!(key.to_string(), "k1");
    }

    #[test]
    fn test_operation_visibility() {
        assert_eq!(
            TxOperation::Put(Value::Int(1)).visible_value(),
            Some(&Value::Int(1))
        );
        assert!(TxOperation::Invalidate.visible_value().is_none());
        assert!(TxOperation::Invalidate.keeps_entry());
        assert!(!TxOperation::Destroy.keeps_entry());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Lock order over keys is byte order
            #[test]
            fn key_order_is_byte_order(a in prop::collection::vec(any::<u8>(), 0..16),
                                       b in prop::collection::vec(any::<u8>(), 0..16)) {
                prop_assert_eq!(Key::new(a.clone()).cmp(&Key::new(b.clone())), a.cmp(&b));
            }

            /// Within one member, transaction ids order by sequence number
            #[test]
            fn tx_id_order_follows_seq(x in any::<u64>(), y in any::<u64>()) {
                let member = MemberId::new("m");
                let a = TxId::new(member.clone(), x);
                let b = TxId::new(member, y);
                prop_assert_eq!(a.cmp(&b), x.cmp(&y));
            }
        }
    }
}
