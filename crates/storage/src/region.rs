//! In-memory region storage
//!
//! Reference implementation of the `Region` trait used by tests and by
//! embedders that host all data on one process.
//!
//! # Design
//!
//! - Buckets: keys hash (FxHash) into a fixed number of buckets
//! - DashMap: one shard per bucket, sharded writes, lock-free reads
//! - FxHashMap: O(1) lookups within a bucket
//! - Hosts: every bucket is hosted by a member; when that member departs,
//!   reads and writes against its buckets fail with `NodeDeparted`
//!
//! A replicated region is modeled as one bucket hosted by the local member.
//!
//! Non-transactional writes (`put`, `destroy`) bypass the transaction lock
//! service entirely; a transaction that raced one of them sees a
//! `VersionConflict` when it applies.

use dashmap::{DashMap, DashSet};
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use gridtx_core::{
    Key, MemberId, Region, RegionError, RegionId, TxId, TxOperation, Value, VersionedValue,
};
use tracing::{debug, warn};

/// One entry as stored in a bucket
#[derive(Debug, Clone, PartialEq)]
struct StoredEntry {
    value: Option<Value>,
    version: u64,
}

impl StoredEntry {
    fn versioned(&self) -> VersionedValue {
        VersionedValue::new(self.value.clone(), self.version)
    }
}

/// Per-bucket data
#[derive(Debug, Default)]
pub(crate) struct Shard {
    data: FxHashMap<Key, StoredEntry>,
}

impl Shard {
    fn len(&self) -> usize {
        self.data.len()
    }
}

/// In-memory partitioned or replicated region
pub struct InMemoryRegion {
    id: RegionId,
    /// Bucket index -> data
    shards: DashMap<usize, Shard>,
    /// Bucket index -> hosting member
    hosts: Vec<MemberId>,
    /// Members that have left the cluster
    departed: DashSet<MemberId>,
    /// Entry pins held by transactions that reserved locks
    pins: DashMap<Key, usize>,
    /// Region-wide version counter
    version: AtomicU64,
}

impl InMemoryRegion {
    /// Create a replicated region hosted by `local`
    pub fn replicated(name: impl Into<String>, local: MemberId) -> Self {
        Self::partitioned(name, vec![local])
    }

    /// Create a partitioned region with one bucket per host
    ///
    /// Keys are spread over the hosts by hash. An empty host list yields a
    /// single bucket hosted by a random member.
    pub fn partitioned(name: impl Into<String>, hosts: Vec<MemberId>) -> Self {
        let hosts = if hosts.is_empty() {
            vec![MemberId::random()]
        } else {
            hosts
        };
        Self {
            id: RegionId::new(name),
            shards: DashMap::with_capacity(hosts.len()),
            hosts,
            departed: DashSet::new(),
            pins: DashMap::new(),
            version: AtomicU64::new(0),
        }
    }

    #[inline]
    fn bucket_of(&self, key: &Key) -> usize {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.hosts.len() as u64) as usize
    }

    #[inline]
    fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Member hosting `key`
    pub fn host_of(&self, key: &Key) -> &MemberId {
        &self.hosts[self.bucket_of(key)]
    }

    fn check_host(&self, bucket: usize) -> Result<(), RegionError> {
        let host = &self.hosts[bucket];
        if self.departed.contains(host) {
            return Err(RegionError::NodeDeparted {
                member: host.clone(),
            });
        }
        Ok(())
    }

    /// Mark a hosting member as departed
    pub fn depart_member(&self, member: &MemberId) {
        warn!(target: "gridtx::region", region = %self.id, member = %member, "Member departed");
        self.departed.insert(member.clone());
    }

    /// Bring a departed member back
    pub fn rejoin_member(&self, member: &MemberId) {
        debug!(target: "gridtx::region", region = %self.id, member = %member, "Member rejoined");
        self.departed.remove(member);
    }

    /// Current region version
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Non-transactional read
    pub fn get(&self, key: &Key) -> Option<VersionedValue> {
        let bucket = self.bucket_of(key);
        self.shards
            .get(&bucket)
            .and_then(|shard| shard.data.get(key).map(StoredEntry::versioned))
    }

    /// Non-transactional write; returns the new entry version
    pub fn put(&self, key: impl Into<Key>, value: impl Into<Value>) -> u64 {
        let key = key.into();
        let bucket = self.bucket_of(&key);
        let mut shard = self.shards.entry(bucket).or_default();
        let version = self.next_version();
        shard.data.insert(
            key,
            StoredEntry {
                value: Some(value.into()),
                version,
            },
        );
        version
    }

    /// Non-transactional removal; returns whether the key existed
    pub fn destroy(&self, key: &Key) -> bool {
        let bucket = self.bucket_of(key);
        self.shards
            .get_mut(&bucket)
            .map(|mut shard| shard.data.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Number of transaction pins on `key`
    pub fn pinned(&self, key: &Key) -> usize {
        self.pins.get(key).map(|p| *p).unwrap_or(0)
    }

    /// Number of entries across all buckets
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.value().len()).sum()
    }

    /// Check if the region holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Region for InMemoryRegion {
    fn id(&self) -> &RegionId {
        &self.id
    }

    fn read(&self, key: &Key) -> Result<Option<VersionedValue>, RegionError> {
        self.check_host(self.bucket_of(key))?;
        Ok(self.get(key))
    }

    fn apply_write(
        &self,
        key: &Key,
        op: &TxOperation,
        expected_version: u64,
    ) -> Result<u64, RegionError> {
        let bucket = self.bucket_of(key);
        self.check_host(bucket)?;

        // The shard guard makes check-then-write atomic per bucket
        let mut shard = self.shards.entry(bucket).or_default();
        let current = shard.data.get(key).map(|e| e.version).unwrap_or(0);

        if current != expected_version {
            return Err(RegionError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                found: current,
            });
        }

        match op {
            TxOperation::Put(value) => {
                let version = self.next_version();
                shard.data.insert(
                    key.clone(),
                    StoredEntry {
                        value: Some(value.clone()),
                        version,
                    },
                );
                Ok(version)
            }
            TxOperation::Invalidate => match shard.data.get_mut(key) {
                Some(entry) => {
                    entry.value = None;
                    entry.version = self.next_version();
                    Ok(entry.version)
                }
                None => Err(RegionError::EntryNotFound { key: key.clone() }),
            },
            TxOperation::Destroy => match shard.data.remove(key) {
                Some(_) => Ok(0),
                None => Err(RegionError::EntryNotFound { key: key.clone() }),
            },
        }
    }

    fn release_tx_refs(&self, tx_id: &TxId, keys: &[Key]) -> Result<(), RegionError> {
        for key in keys {
            let emptied = match self.pins.get_mut(key) {
                Some(mut pins) => {
                    *pins = pins.saturating_sub(1);
                    *pins == 0
                }
                None => false,
            };
            if emptied {
                self.pins.remove_if(key, |_, pins| *pins == 0);
            }
        }
        debug!(target: "gridtx::region", region = %self.id, tx_id = %tx_id, keys = keys.len(), "Released transaction pins");
        Ok(())
    }

    fn ensure_hosted(&self, keys: &[Key]) -> Result<(), RegionError> {
        for key in keys {
            self.check_host(self.bucket_of(key))?;
        }
        Ok(())
    }

    fn retain_tx_refs(&self, _tx_id: &TxId, keys: &[Key]) -> Result<(), RegionError> {
        for key in keys {
            self.check_host(self.bucket_of(key))?;
        }
        for key in keys {
            *self.pins.entry(key.clone()).or_insert(0) += 1;
        }
        Ok(())
    }
}
