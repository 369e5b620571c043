use async_trait::async_trait;
use idemstore::storage::BackendResult;
use idemstore::{
    BackendError, CasOutcome, Coordinator, Decision, ErrorInfo, ExpiryPolicy, IdempotencyError,
    IdempotencyRecord, InMemoryKvBackend, KvBackend, ManualClock, PutOutcome, RecordStatus, Revision,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};

const IN_FLIGHT: Duration = Duration::from_secs(60);
const TERMINAL: Duration = Duration::from_secs(3600);

fn setup() -> (Arc<ManualClock>, Coordinator) {
    let clock = Arc::new(ManualClock::starting_now());
    let backend = Arc::new(InMemoryKvBackend::with_clock(clock.clone()));
    let policy = ExpiryPolicy::new(IN_FLIGHT, TERMINAL).retry_after_hint(Duration::from_secs(2));
    (clock.clone(), Coordinator::new(backend, policy, clock))
}

fn expect_proceed(decision: Decision) -> idemstore::Claim {
    match decision {
        Decision::Proceed(claim) => claim,
        other => panic!("expected proceed, got {other:?}"),
    }
}

#[tokio::test]
async fn first_request_proceeds_and_duplicate_replays() {
    let (_, coordinator) = setup();

    let claim = expect_proceed(coordinator.admit("req-1", "fp-a").await.unwrap());
    assert_eq!(claim.version(), 0);

    assert_ok!(coordinator.complete(&claim, json!({"id": 1})).await);

    assert_eq!(
        coordinator.admit("req-1", "fp-a").await.unwrap(),
        Decision::Replay(json!({"id": 1}))
    );

    let stored = coordinator.lookup("req-1").await.unwrap().unwrap();
    assert_eq!(stored.status, RecordStatus::Completed);
    assert_eq!(stored.version, 1);
    assert_eq!(stored.in_progress_until, None);
}

#[tokio::test]
async fn reused_key_with_different_payload_conflicts() {
    let (_, coordinator) = setup();

    let claim = expect_proceed(coordinator.admit("abc", "fp-a").await.unwrap());
    assert_eq!(
        coordinator.admit("abc", "fp-b").await.unwrap(),
        Decision::Conflict
    );

    coordinator.complete(&claim, json!({"ok": true})).await.unwrap();
    assert_eq!(
        coordinator.admit("abc", "fp-b").await.unwrap(),
        Decision::Conflict
    );
}

#[tokio::test]
async fn recorded_failure_is_replayed() {
    let (_, coordinator) = setup();
    let info = ErrorInfo::new(424, "upstream_rejected", "downstream said no");

    let claim = expect_proceed(coordinator.admit("xyz", "fp").await.unwrap());
    coordinator.fail(&claim, info.clone()).await.unwrap();

    assert_eq!(
        coordinator.admit("xyz", "fp").await.unwrap(),
        Decision::ReplayError(info)
    );
}

#[tokio::test]
async fn live_claim_reports_in_flight_with_bounded_retry_hint() {
    let (clock, coordinator) = setup();
    expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    clock.advance(Duration::from_secs(30));
    match coordinator.admit("k", "fp").await.unwrap() {
        Decision::InFlight { retry_after } => {
            assert!(retry_after >= Duration::from_secs(1));
            assert!(retry_after <= Duration::from_secs(2));
        }
        other => panic!("expected in-flight, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_duplicates_admit_exactly_one_executor() {
    let (_, coordinator) = setup();
    let barrier = Arc::new(Barrier::new(10));

    let tasks: Vec<_> = (0..10)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                coordinator.admit("req-1", "fp").await
            })
        })
        .collect();

    let mut proceeds = 0;
    let mut in_flight = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Decision::Proceed(_) => proceeds += 1,
            Decision::InFlight { .. } => in_flight += 1,
            other => panic!("unexpected decision {other:?}"),
        }
    }

    assert_eq!(proceeds, 1);
    assert_eq!(in_flight, 9);
}

#[tokio::test]
async fn stale_claim_is_reclaimed_and_slow_holder_gets_stale_write() {
    let (clock, coordinator) = setup();
    let slow = expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    clock.advance(IN_FLIGHT + Duration::from_secs(1));
    let fresh = expect_proceed(coordinator.admit("k", "fp").await.unwrap());
    assert_eq!(fresh.version(), 1);

    let err = assert_err!(coordinator.complete(&slow, json!({"by": "slow"})).await);
    assert_eq!(
        err,
        IdempotencyError::StaleWrite {
            key: "k".to_string(),
            expected_version: 0,
        }
    );
    assert!(err.is_retryable());

    coordinator.complete(&fresh, json!({"by": "fresh"})).await.unwrap();
    assert_eq!(
        coordinator.admit("k", "fp").await.unwrap(),
        Decision::Replay(json!({"by": "fresh"}))
    );
}

#[tokio::test]
async fn recorded_failure_status_is_kept_in_client_range() {
    let (_, coordinator) = setup();
    let claim = expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    let recorded = coordinator
        .fail(&claim, ErrorInfo::new(502, "upstream_unreachable", "connection refused"))
        .await
        .unwrap();
    assert_eq!(recorded.status, 424);
    assert_eq!(recorded.code, "upstream_unreachable");

    assert_eq!(
        coordinator.admit("k", "fp").await.unwrap(),
        Decision::ReplayError(recorded)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reclaims_admit_exactly_one_executor() {
    let (clock, coordinator) = setup();
    expect_proceed(coordinator.admit("k", "fp").await.unwrap());
    clock.advance(IN_FLIGHT + Duration::from_secs(1));

    let barrier = Arc::new(Barrier::new(8));
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = coordinator.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                coordinator.admit("k", "fp").await
            })
        })
        .collect();

    let mut winners = Vec::new();
    let mut in_flight = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Decision::Proceed(claim) => winners.push(claim),
            Decision::InFlight { .. } => in_flight += 1,
            other => panic!("unexpected decision {other:?}"),
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(in_flight, 7);
    assert_eq!(winners[0].version(), 1);
}

#[tokio::test]
async fn holder_of_expired_claim_cannot_overwrite_its_successor() {
    let (clock, coordinator) = setup();
    let slow = expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    clock.advance(IN_FLIGHT * 2 + Duration::from_secs(1));
    let fresh = expect_proceed(coordinator.admit("k", "fp").await.unwrap());
    assert_eq!(fresh.version(), slow.version());
    assert_ne!(fresh.claim_id(), slow.claim_id());

    let err = assert_err!(coordinator.complete(&slow, json!("slow")).await);
    assert!(matches!(err, IdempotencyError::StaleWrite { .. }));
    assert!(!coordinator.release(&slow).await.unwrap());

    assert_ok!(coordinator.complete(&fresh, json!("fresh")).await);
    assert_eq!(
        coordinator.admit("k", "fp").await.unwrap(),
        Decision::Replay(json!("fresh"))
    );
}

#[tokio::test]
async fn abandoned_claim_past_expiry_is_recreated() {
    let (clock, coordinator) = setup();
    expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    clock.advance(IN_FLIGHT * 2 + Duration::from_secs(1));
    let claim = expect_proceed(coordinator.admit("k", "fp").await.unwrap());
    assert_eq!(claim.version(), 0);
}

#[tokio::test]
async fn terminal_records_expire_after_retention() {
    let (clock, coordinator) = setup();
    let claim = expect_proceed(coordinator.admit("k", "fp").await.unwrap());
    coordinator.complete(&claim, json!(1)).await.unwrap();

    clock.advance(TERMINAL - Duration::from_secs(1));
    assert_eq!(
        coordinator.admit("k", "fp").await.unwrap(),
        Decision::Replay(json!(1))
    );

    clock.advance(Duration::from_secs(2));
    expect_proceed(coordinator.admit("k", "fp").await.unwrap());
}

#[tokio::test]
async fn released_claim_lets_the_next_request_execute() {
    let (_, coordinator) = setup();
    let claim = expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    assert!(coordinator.release(&claim).await.unwrap());
    assert!(!coordinator.release(&claim).await.unwrap());
    expect_proceed(coordinator.admit("k", "fp").await.unwrap());
}

#[tokio::test]
async fn purge_only_removes_stale_claims() {
    let (clock, coordinator) = setup();
    let claim = expect_proceed(coordinator.admit("k", "fp").await.unwrap());

    assert!(!coordinator.purge_abandoned("k").await.unwrap());
    assert!(!coordinator.purge_abandoned("missing").await.unwrap());

    clock.advance(IN_FLIGHT + Duration::from_secs(1));
    assert!(coordinator.purge_abandoned("k").await.unwrap());
    assert!(coordinator.lookup("k").await.unwrap().is_none());

    let err = assert_err!(coordinator.complete(&claim, json!(null)).await);
    assert!(matches!(err, IdempotencyError::StaleWrite { .. }));
}

struct UnreachableBackend;

#[async_trait]
impl KvBackend for UnreachableBackend {
    async fn get_item(&self, _key: &str) -> BackendResult<Option<IdempotencyRecord>> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }

    async fn put_item_if_absent(&self, _record: &IdempotencyRecord) -> BackendResult<PutOutcome> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }

    async fn update_item_if_version(
        &self,
        _key: &str,
        _expected: Revision<'_>,
        _record: &IdempotencyRecord,
    ) -> BackendResult<CasOutcome> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }

    async fn delete_item(
        &self,
        _key: &str,
        _expected: Option<Revision<'_>>,
    ) -> BackendResult<CasOutcome> {
        Err(BackendError::Unavailable("connection refused".to_string()))
    }
}

#[tokio::test]
async fn backend_outage_surfaces_as_unavailable() {
    let clock = Arc::new(ManualClock::starting_now());
    let coordinator = Coordinator::new(Arc::new(UnreachableBackend), ExpiryPolicy::default(), clock);

    let err = assert_err!(coordinator.admit("k", "fp").await);
    assert_eq!(
        err,
        IdempotencyError::BackendUnavailable("connection refused".to_string())
    );
    assert!(err.is_retryable());
}
