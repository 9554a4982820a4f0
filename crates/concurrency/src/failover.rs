//! Transaction outcomes kept for client failover
//!
//! A client whose connection drops while a commit is in flight cannot tell
//! whether the transaction completed. Every terminal transaction leaves an
//! `OutcomeSummary` behind; a reconnecting client asks the manager for it by
//! transaction id.
//!
//! The cache is bounded: when full, the oldest summary is evicted. An
//! optional time-to-live drops summaries nobody asked for in time.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gridtx_core::{MemberId, RegionId, TxId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Final outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOutcome {
    /// Writes were applied
    Committed,
    /// Writes were discarded
    RolledBack,
    /// Commit failed after some writes were applied; the client must not
    /// assume either all or none of them are visible
    PartiallyApplied,
}

/// Errors encoding or decoding a summary for the wire
#[derive(Debug, Error)]
pub enum FailoverError {
    /// MessagePack encoding failed
    #[error("failed to encode outcome summary: {0}")]
    Encode(String),
    /// MessagePack decoding failed
    #[error("failed to decode outcome summary: {0}")]
    Decode(String),
}

/// What a reconnecting client learns about a finished transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    /// Transaction the summary describes
    pub tx_id: TxId,
    /// How it ended
    pub outcome: TxOutcome,
    /// Remote member that opened it (none = local)
    pub originating_member: Option<MemberId>,
    /// Regions the transaction touched
    pub regions: Vec<RegionId>,
    /// Buffered operations at the time it ended
    pub operations: usize,
    /// Why a commit failed, when it did
    pub failure: Option<String>,
    /// Wall-clock completion time
    pub completed_at: DateTime<Utc>,
}

impl OutcomeSummary {
    /// Whether the transaction committed
    pub fn is_committed(&self) -> bool {
        self.outcome == TxOutcome::Committed
    }

    /// MessagePack form shipped to the client
    pub fn to_bytes(&self) -> Result<Vec<u8>, FailoverError> {
        rmp_serde::to_vec_named(self).map_err(|e| FailoverError::Encode(e.to_string()))
    }

    /// Decode the MessagePack form
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FailoverError> {
        rmp_serde::from_slice(bytes).map_err(|e| FailoverError::Decode(e.to_string()))
    }
}

struct CacheInner {
    /// Insertion order, oldest first
    order: VecDeque<(TxId, Instant)>,
    entries: HashMap<TxId, (OutcomeSummary, Instant)>,
}

/// Bounded, optionally expiring map of `TxId -> OutcomeSummary`
pub struct OutcomeCache {
    capacity: usize,
    ttl: Option<Duration>,
    inner: Mutex<CacheInner>,
}

impl OutcomeCache {
    /// Create a cache holding at most `capacity` summaries (minimum 1)
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: Mutex::new(CacheInner {
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    /// Maximum number of summaries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Store the summary for `tx_id`, replacing any earlier one
    pub fn insert(&self, tx_id: TxId, summary: OutcomeSummary) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        self.purge_expired(&mut inner, now);

        if inner.entries.remove(&tx_id).is_some() {
            inner.order.retain(|(id, _)| id != &tx_id);
        }
        while inner.entries.len() >= self.capacity {
            match inner.order.pop_front() {
                Some((oldest, _)) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }

        inner.order.push_back((tx_id.clone(), now));
        inner.entries.insert(tx_id, (summary, now));
    }

    /// Summary for `tx_id` unless evicted or expired
    pub fn get(&self, tx_id: &TxId) -> Option<OutcomeSummary> {
        let inner = self.inner.lock();
        let (summary, stored_at) = inner.entries.get(tx_id)?;
        if self.is_expired(*stored_at, Instant::now()) {
            return None;
        }
        Some(summary.clone())
    }

    /// Whether a live summary exists for `tx_id`
    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.get(tx_id).is_some()
    }

    /// Number of stored summaries (expired ones linger until the next insert)
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_expired(&self, stored_at: Instant, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.duration_since(stored_at) >= ttl,
            None => false,
        }
    }

    fn purge_expired(&self, inner: &mut CacheInner, now: Instant) {
        while let Some((_, stored_at)) = inner.order.front() {
            if !self.is_expired(*stored_at, now) {
                break;
            }
            if let Some((id, _)) = inner.order.pop_front() {
                inner.entries.remove(&id);
            }
        }
    }
}
