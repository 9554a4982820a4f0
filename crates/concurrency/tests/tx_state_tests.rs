//! Lifecycle tests for TxState
//!
//! Covers the state machine end to end against recording test doubles:
//! closed-state rejection, reservation idempotence, the two teardown paths
//! of `close()`, and failover bookkeeping on every terminal path.

mod common;

use common::*;
use gridtx_concurrency::{Teardown, TxOutcome, TxStatus};
use gridtx_core::{
    ConflictType, Key, MemberId, Region, RegionError, RegionId, TxError, TxErrorKind, TxId,
    TxOperation, Value, VersionedValue,
};
use gridtx_storage::InMemoryRegion;
use std::sync::atomic::Ordering;
use std::sync::Arc;

// ============================================================================
// Closed transactions
// ============================================================================

#[test]
fn test_every_operation_rejected_after_close() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks);
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.rollback().unwrap();
    assert!(state.is_closed());

    let kinds = [
        state.get(&r, &Key::from("a")).unwrap_err().kind(),
        state.contains_key(&r, &Key::from("a")).unwrap_err().kind(),
        state.put(&r, Key::from("a"), Value::Int(2)).unwrap_err().kind(),
        state.invalidate(&r, Key::from("a")).unwrap_err().kind(),
        state.destroy(&r, Key::from("a")).unwrap_err().kind(),
        state.reserve_and_check().unwrap_err().kind(),
        state.commit().unwrap_err().kind(),
        state.rollback().unwrap_err().kind(),
    ];
    assert!(kinds.iter().all(|k| *k == TxErrorKind::IllegalState));
    assert_eq!(region.applies(), 0);
}

#[test]
fn test_close_is_idempotent() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.reserve_and_check().unwrap();
    state.close();
    state.close();

    assert_eq!(region.releases(), 1);
    assert_eq!(locks.releases.load(Ordering::SeqCst), 1);
    assert_eq!(mgr.stats().rolled_back, 1);
}

// ============================================================================
// Reservation
// ============================================================================

#[test]
fn test_reserve_is_idempotent() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.reserve_and_check().unwrap();
    state.reserve_and_check().unwrap();

    assert_eq!(locks.obtains(), 1);
    assert_eq!(region.retains.load(Ordering::SeqCst), 1);
    assert_eq!(state.status(), TxStatus::Reserved);
}

#[test]
fn test_commit_after_reserve_does_not_reacquire() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.reserve_and_check().unwrap();
    state.commit().unwrap();

    assert_eq!(locks.obtains(), 1);
    assert_eq!(locks.held(), 0);
    assert_eq!(region.value("a"), Some(Value::Int(1)));
}

#[test]
fn test_unavailable_locks_are_a_commit_conflict() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    locks.refuse(true);

    let err = state.reserve_and_check().unwrap_err();
    assert_eq!(err.kind(), TxErrorKind::CommitConflict);
    assert!(err.is_retryable());
    assert_eq!(
        err.conflicts(),
        &[ConflictType::LockUnavailable {
            region: "orders".into()
        }]
    );
    assert!(!state.has_lock_request());
    assert_eq!(state.status(), TxStatus::Active);

    // A later attempt may succeed
    locks.refuse(false);
    state.reserve_and_check().unwrap();
    assert!(state.locks_held());
}

#[test]
fn test_validation_failure_releases_locks() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);
    region.inner.put("a", 1i64);

    let mut state = local_state(&mgr);
    state.get(&r, &Key::from("a")).unwrap();
    state.put(&r, Key::from("b"), Value::Int(1)).unwrap();
    region.inner.put("a", 2i64);

    let err = state.reserve_and_check().unwrap_err();
    assert!(matches!(err.conflicts()[0], ConflictType::ReadWrite { .. }));
    assert_eq!(locks.held(), 0);
    assert_eq!(region.retains.load(Ordering::SeqCst), 0);
}

// ============================================================================
// Teardown paths
// ============================================================================

#[test]
fn test_close_without_locks_closes_region_states() {
    let mgr = manager_with(CountingLockService::new());
    let orders = RecordingRegion::new("orders");
    let items = RecordingRegion::new("items");

    let mut state = local_state(&mgr);
    state.put(&as_region(&orders), Key::from("o1"), Value::Int(1)).unwrap();
    state.get(&as_region(&items), &Key::from("i1")).unwrap();
    state.close();

    for id in state.region_ids() {
        assert_eq!(state.region_state(&id).unwrap().teardown(), Some(Teardown::Closed));
    }
    assert_eq!(orders.releases(), 0);
    assert_eq!(items.releases(), 0);
    assert_eq!(state.status(), TxStatus::RolledBack);
}

#[test]
fn test_close_with_locks_cleans_up_region_states() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let orders = RecordingRegion::new("orders");
    let items = RecordingRegion::new("items");

    let mut state = local_state(&mgr);
    state.put(&as_region(&orders), Key::from("o1"), Value::Int(1)).unwrap();
    state.put(&as_region(&items), Key::from("i1"), Value::Int(2)).unwrap();
    state.reserve_and_check().unwrap();
    assert_eq!(locks.held(), 2);

    state.close();

    for id in state.region_ids() {
        assert_eq!(
            state.region_state(&id).unwrap().teardown(),
            Some(Teardown::CleanedUp)
        );
    }
    assert_eq!(orders.releases(), 1);
    assert_eq!(items.releases(), 1);
    assert_eq!(orders.inner.pinned(&Key::from("o1")), 0);
    assert_eq!(locks.held(), 0);
}

#[test]
fn test_region_cleanup_failure_does_not_stop_others() {
    struct FailingRelease(Arc<RecordingRegion>);

    impl Region for FailingRelease {
        fn id(&self) -> &RegionId {
            self.0.id()
        }
        fn read(&self, key: &Key) -> Result<Option<VersionedValue>, RegionError> {
            self.0.read(key)
        }
        fn apply_write(
            &self,
            key: &Key,
            op: &TxOperation,
            expected_version: u64,
        ) -> Result<u64, RegionError> {
            self.0.apply_write(key, op, expected_version)
        }
        fn release_tx_refs(&self, _tx_id: &TxId, _keys: &[Key]) -> Result<(), RegionError> {
            Err(RegionError::Storage("release failed".to_string()))
        }
    }

    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let broken: Arc<dyn Region> = Arc::new(FailingRelease(RecordingRegion::new("a-broken")));
    let healthy = RecordingRegion::new("b-healthy");

    let mut state = local_state(&mgr);
    state.put(&broken, Key::from("k"), Value::Int(1)).unwrap();
    state.put(&as_region(&healthy), Key::from("k"), Value::Int(1)).unwrap();
    state.reserve_and_check().unwrap();
    state.close();

    assert_eq!(healthy.releases(), 1);
    assert_eq!(locks.held(), 0);
    assert!(state.is_closed());
}

// ============================================================================
// Commit failures
// ============================================================================

#[test]
fn test_node_departure_during_commit_is_distinct() {
    let mgr = manager_with(CountingLockService::new());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.reserve_and_check().unwrap();
    let departed = MemberId::new("host-2");
    region.fail_next_apply(RegionError::NodeDeparted {
        member: departed.clone(),
    });

    let err = state.commit().unwrap_err();
    assert_eq!(
        err,
        TxError::DataNodeDeparted {
            tx_id: state.tx_id().clone(),
            member: departed,
        }
    );
    assert!(!err.is_retryable());
    assert_eq!(state.status(), TxStatus::RolledBack);
    assert!(state.is_closed());
}

#[test]
fn test_departed_host_fails_commit_before_any_write_lands() {
    let locks = CountingLockService::new();
    let mgr = manager_with(locks.clone());
    let host_a = MemberId::new("host-a");
    let host_b = MemberId::new("host-b");
    let a = Arc::new(InMemoryRegion::replicated("a", host_a));
    let b = Arc::new(InMemoryRegion::replicated("b", host_b.clone()));
    let ra: Arc<dyn Region> = a.clone();
    let rb: Arc<dyn Region> = b.clone();

    let mut state = local_state(&mgr);
    state.put(&ra, Key::from("k"), Value::Int(1)).unwrap();
    state.put(&rb, Key::from("k"), Value::Int(2)).unwrap();
    state.reserve_and_check().unwrap();
    b.depart_member(&host_b);

    let err = state.commit().unwrap_err();
    assert_eq!(
        err,
        TxError::DataNodeDeparted {
            tx_id: state.tx_id().clone(),
            member: host_b,
        }
    );
    assert_eq!(a.get(&Key::from("k")), None);
    assert_eq!(b.get(&Key::from("k")), None);
    assert_eq!(a.pinned(&Key::from("k")), 0);
    assert_eq!(locks.held(), 0);
    assert_eq!(state.partially_applied(), 0);

    let summary = mgr.lookup_outcome(state.tx_id()).unwrap();
    assert_eq!(summary.outcome, TxOutcome::RolledBack);
    assert!(summary.failure.is_some());
    assert_eq!(mgr.stats().rolled_back, 1);
}

#[test]
fn test_failure_after_partial_apply_is_not_reported_as_rollback() {
    let mgr = manager_with(CountingLockService::new());
    let a = RecordingRegion::new("a");
    let b = RecordingRegion::new("b");

    let mut state = local_state(&mgr);
    state.put(&as_region(&a), Key::from("k"), Value::Int(1)).unwrap();
    state.put(&as_region(&b), Key::from("k"), Value::Int(2)).unwrap();
    state.reserve_and_check().unwrap();
    // Hosts pass the pre-apply check, then "b" loses its host mid-apply
    b.fail_next_apply(RegionError::NodeDeparted {
        member: MemberId::new("host-b"),
    });

    let err = state.commit().unwrap_err();
    assert_eq!(err.kind(), TxErrorKind::DataNodeDeparted);
    assert_eq!(a.value("k"), Some(Value::Int(1)));
    assert_eq!(b.value("k"), None);
    assert!(state.is_closed());
    assert_eq!(state.partially_applied(), 1);
    assert_eq!(state.outcome(), Some(TxOutcome::PartiallyApplied));

    let summary = mgr.lookup_outcome(state.tx_id()).unwrap();
    assert_eq!(summary.outcome, TxOutcome::PartiallyApplied);
    assert!(!summary.is_committed());
    assert!(summary.failure.is_some());
    let stats = mgr.stats();
    assert_eq!(stats.partially_applied, 1);
    assert_eq!(stats.rolled_back, 0);
    assert_eq!(stats.committed, 0);
}

#[test]
fn test_storage_error_during_commit_is_transaction_error() {
    let mgr = manager_with(CountingLockService::new());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    region.fail_next_apply(RegionError::Storage("disk full".to_string()));

    assert_eq!(state.commit().unwrap_err().kind(), TxErrorKind::Transaction);
}

// ============================================================================
// Failover bookkeeping
// ============================================================================

#[test]
fn test_commit_records_one_summary() {
    let mgr = manager_with(CountingLockService::new());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    state.put(&r, Key::from("b"), Value::Int(2)).unwrap();
    state.commit().unwrap();
    state.save_outcome_for_failover();
    state.close();

    assert_eq!(mgr.stats().failover_messages, 1);
    let summary = mgr.lookup_outcome(state.tx_id()).unwrap();
    assert_eq!(summary.outcome, TxOutcome::Committed);
    assert_eq!(summary.operations, 2);
    assert_eq!(summary.regions, vec![RegionId::from("orders")]);
    assert_eq!(summary.originating_member, None);
}

#[test]
fn test_failed_commit_records_one_summary() {
    let mgr = manager_with(CountingLockService::new());
    let region = RecordingRegion::new("orders");
    let r = as_region(&region);

    let mut state = local_state(&mgr);
    state.put(&r, Key::from("a"), Value::Int(1)).unwrap();
    region.inner.put("a", 5i64);
    assert!(state.commit().is_err());

    assert_eq!(mgr.stats().failover_messages, 1);
    let summary = mgr.lookup_outcome(state.tx_id()).unwrap();
    assert_eq!(summary.outcome, TxOutcome::RolledBack);
    assert!(summary.failure.unwrap().contains("commit conflict"));
}

#[test]
fn test_no_summary_before_terminal() {
    let mgr = manager_with(CountingLockService::new());
    let region = RecordingRegion::new("orders");

    let mut state = local_state(&mgr);
    state.put(&as_region(&region), Key::from("a"), Value::Int(1)).unwrap();
    state.save_outcome_for_failover();

    assert!(!mgr.is_recently_completed(state.tx_id()));
    assert_eq!(mgr.stats().failover_messages, 0);
}

#[test]
fn test_client_transaction_summary_names_client() {
    let mgr = manager_with(CountingLockService::new());
    let client = MemberId::new("client-9");
    let handle = mgr.begin_for_client(client.clone());
    let tx_id = {
        let mut proxy = handle.lock();
        proxy.rollback().unwrap();
        proxy.tx_id().clone()
    };

    let summary = mgr.lookup_outcome(&tx_id).unwrap();
    assert_eq!(summary.originating_member, Some(client));
    let decoded =
        gridtx_concurrency::OutcomeSummary::from_bytes(&summary.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, summary);
}
