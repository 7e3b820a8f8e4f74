//! Coordinator state machine on the in-process lock service

mod common;

use common::{distributed_node, url, wait_until, LocalPeers};
use minilease::common::Error;
use minilease::coordinator::{HandoffRequest, LeaseState};
use minilease::lease::{DistributedLeaser, Leaser, MemoryLockService};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_secs(3);
const LOCK_DELAY: Duration = Duration::from_secs(1);
const WAIT: Duration = Duration::from_secs(30);

fn handoff_from(id: &str) -> HandoffRequest {
    HandoffRequest {
        requester_id: id.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_candidate_acquires_and_replica_follows() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);

    a.open().unwrap();
    a.ready().wait().await;
    assert!(a.is_primary());
    assert_eq!(a.epoch(), Some(1));

    b.open().unwrap();
    b.ready().wait().await;
    let snap = wait_until(&b, WAIT, |s| s.synced).await;
    assert_eq!(snap.state, LeaseState::Replica);
    assert_eq!(b.primary_info(), (false, Some(a.primary_info().1.unwrap())));

    let replicas = a.replicas();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0].id, "b");
    assert!(replicas[0].candidate);

    // Renewals keep A primary well past its TTL.
    tokio::time::sleep(TTL * 5).await;
    assert!(a.is_primary());
    assert_eq!(a.epoch(), Some(1));

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_candidate_never_primary() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let n = distributed_node(&service, &peers, "n", false, TTL, LOCK_DELAY);
    n.open().unwrap();

    // Nobody holds the lease, and the non-candidate does not take it.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(!n.is_primary());
    assert_eq!(n.state(), LeaseState::Initializing);
    assert!(n.is_transitioning());
    assert!(!n.ready().is_ready());

    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    n.ready().wait().await;
    assert_eq!(n.primary_info().1.unwrap().advertise_url, url("a"));

    // Once the primary leaves, the non-candidate stays a replica without one.
    a.close().await;
    wait_until(&n, WAIT, |s| s.primary.is_none()).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(!n.is_primary());
    assert_eq!(n.state(), LeaseState::Replica);
    assert!(n.is_transitioning());

    n.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_renewal_failure_demotes() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    assert!(a.is_primary());

    service.set_available(false);
    let snap = wait_until(&a, TTL, |s| !s.is_primary()).await;
    assert_eq!(snap.state, LeaseState::Replica);
    assert!(!a.is_primary());
    assert!(matches!(a.begin_write().await, Err(Error::NotPrimary(_))));

    // Readiness never resets.
    assert!(a.ready().is_ready());
    assert!(!a.ready().fire());

    // Once the service is back and the old session has expired, A competes again.
    service.set_available(true);
    let snap = wait_until(&a, WAIT, |s| s.is_primary()).await;
    assert_eq!(snap.epoch, Some(2));

    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_renewal_demotes_at_expiry() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;

    // Renewals are sent but never answered; the lease must not outlive its TTL.
    let stalled_at = tokio::time::Instant::now();
    service.set_stalled(true);
    let snap = wait_until(&a, WAIT, |s| !s.is_primary()).await;
    assert_eq!(snap.state, LeaseState::Replica);
    assert!(stalled_at.elapsed() <= TTL);
    assert!(matches!(a.begin_write().await, Err(Error::NotPrimary(_))));

    service.set_stalled(false);
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_write_fencing() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    b.open().unwrap();
    b.ready().wait().await;

    let guard = a.begin_write().await.unwrap();
    assert_eq!(Some(guard.epoch()), a.epoch());
    a.check_epoch(guard.epoch()).unwrap();
    match a.check_epoch(guard.epoch() + 1) {
        Err(Error::StaleEpoch { presented, current }) => {
            assert_eq!(presented, guard.epoch() + 1);
            assert_eq!(current, Some(guard.epoch()));
        }
        other => panic!("expected stale epoch, got {:?}", other),
    }
    drop(guard);

    match b.begin_write().await {
        Err(Error::NotPrimary(primary)) => assert_eq!(primary, Some(url("a"))),
        Err(e) => panic!("expected NotPrimary, got {:?}", e),
        Ok(_) => panic!("replica admitted a write"),
    }
    assert!(matches!(b.check_epoch(1), Err(Error::StaleEpoch { current: None, .. })));

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_demotion_waits_for_inflight_writes() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    b.open().unwrap();
    wait_until(&b, WAIT, |s| s.synced).await;

    let observer = DistributedLeaser::new(service.clone(), "minilease/primary", "o", url("o"));
    let guard = a.begin_write().await.unwrap();

    a.handle_handoff(&handoff_from("b")).unwrap();
    wait_until(&a, WAIT, |s| !s.is_primary()).await;
    assert!(!a.is_primary());

    // A stopped admitting writes but still holds the lease for the one in flight.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let holder = observer.primary_info().await.unwrap().unwrap();
    assert_eq!(holder.advertise_url, url("a"));

    // A repeated request from the same node is accepted without a second release.
    a.handle_handoff(&handoff_from("b")).unwrap();

    drop(guard);
    let snap = wait_until(&b, WAIT, |s| s.is_primary()).await;
    assert_eq!(snap.epoch, Some(2));
    let holder = observer.primary_info().await.unwrap().unwrap();
    assert_eq!(holder.advertise_url, url("b"));

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_handoff_rejections() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let n = distributed_node(&service, &peers, "n", false, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    n.open().unwrap();
    wait_until(&n, WAIT, |s| s.synced).await;

    assert!(matches!(
        a.handle_handoff(&handoff_from("ghost")),
        Err(Error::HandoffRejected(_))
    ));
    assert!(matches!(
        a.handle_handoff(&handoff_from("n")),
        Err(Error::HandoffRejected(_))
    ));
    match n.handle_handoff(&handoff_from("a")) {
        Err(Error::NotPrimary(primary)) => assert_eq!(primary, Some(url("a"))),
        other => panic!("expected NotPrimary, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(a.is_primary());
    assert_eq!(a.epoch(), Some(1));

    n.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_promote_on_primary_is_noop() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;

    a.promote(&CancellationToken::new()).await.unwrap();
    assert!(a.is_primary());
    assert_eq!(a.epoch(), Some(1));
    assert_eq!(peers.handoffs.load(Ordering::SeqCst), 0);

    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_promote_moves_primary() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    b.open().unwrap();
    wait_until(&b, WAIT, |s| s.synced).await;

    b.promote(&CancellationToken::new()).await.unwrap();
    assert!(b.is_primary());
    assert!(!a.is_primary());
    assert_eq!(peers.handoffs.load(Ordering::SeqCst), 1);

    // A sits out the demote window and follows B.
    let snap = wait_until(&a, WAIT, |s| {
        s.synced && s.primary.as_ref().map(|p| p.advertise_url.as_str()) == Some("http://b:20202")
    })
    .await;
    assert_eq!(snap.state, LeaseState::Replica);

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_promote_times_out() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    b.open().unwrap();
    wait_until(&b, WAIT, |s| s.synced).await;

    // The handoff goes through but B can never reach the lock service.
    service.set_available(false);
    match b.promote(&CancellationToken::new()).await {
        Err(Error::PromotionTimeout(after)) => assert_eq!(after, common::options().promotion_timeout),
        other => panic!("expected promotion timeout, got {:?}", other),
    }
    assert!(!b.is_primary());
    assert!(!b.is_transitioning());

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_promote_cancelled() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();
    let a = distributed_node(&service, &peers, "a", true, TTL, LOCK_DELAY);
    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    a.open().unwrap();
    a.ready().wait().await;
    b.open().unwrap();
    wait_until(&b, WAIT, |s| s.synced).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    for _ in 0..20 {
        assert!(matches!(b.promote(&cancel).await, Err(Error::Cancelled)));
    }

    // The primary was never asked to let go.
    assert_eq!(peers.handoffs.load(Ordering::SeqCst), 0);
    assert!(a.is_primary());
    assert!(!b.is_transitioning());

    b.close().await;
    a.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_handoff_to_unreachable_primary() {
    let service = Arc::new(MemoryLockService::new());
    let peers = LocalPeers::new();

    // Lease held by a node with no reachable API.
    let mut ghost = DistributedLeaser::new(service.clone(), "minilease/primary", "ghost", url("ghost"));
    ghost.ttl = Duration::from_secs(3600);
    ghost.acquire().await.unwrap();

    let b = distributed_node(&service, &peers, "b", true, TTL, LOCK_DELAY);
    b.open().unwrap();
    wait_until(&b, WAIT, |s| s.primary.is_some()).await;
    assert!(!b.ready().is_ready());

    let err = b.promote(&CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, Error::HandoffUnreachable(_)));
    assert!(err.is_handoff());
    assert!(!b.is_primary());

    b.close().await;
}
