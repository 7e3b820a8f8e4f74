//! Distributed-lock lease: TTL and lock-delay windows

use minilease::common::Error;
use minilease::lease::{DistributedLeaser, Leaser, MemoryLockService};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(10);
const LOCK_DELAY: Duration = Duration::from_secs(5);

fn leaser(service: &Arc<MemoryLockService>, name: &str) -> DistributedLeaser {
    let mut leaser = DistributedLeaser::new(
        service.clone(),
        "minilease/primary",
        name,
        format!("http://{}:20202", name),
    );
    leaser.ttl = TTL;
    leaser.lock_delay = LOCK_DELAY;
    leaser
}

async fn assert_conflict(leaser: &DistributedLeaser) {
    match leaser.acquire().await {
        Err(Error::AcquisitionConflict(_)) => {}
        other => panic!("expected acquisition conflict, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_halted_holder_blocks_until_ttl_and_lock_delay() {
    let service = Arc::new(MemoryLockService::new());
    let a = leaser(&service, "a");
    let b = leaser(&service, "b");

    let lease = a.acquire().await.unwrap();
    assert_eq!(lease.renew_interval(), Some(TTL / 3));
    assert_conflict(&b).await;

    // A stops renewing. Its lease still holds until the TTL runs out...
    tokio::time::advance(TTL - Duration::from_secs(1)).await;
    assert_conflict(&b).await;
    assert_eq!(
        b.primary_info().await.unwrap().unwrap().advertise_url,
        "http://a:20202"
    );

    // ...and the key stays locked for the lock delay after that.
    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(b.primary_info().await.unwrap().is_none());
    assert_conflict(&b).await;

    tokio::time::advance(LOCK_DELAY).await;
    let taken = b.acquire().await.unwrap();
    assert!(taken.epoch > lease.epoch);

    // A's session is gone; renewal reports expiry.
    assert!(matches!(a.renew(&lease).await, Err(Error::LeaseExpired(_))));
}

#[tokio::test(start_paused = true)]
async fn test_renewal_keeps_lease_past_ttl() {
    let service = Arc::new(MemoryLockService::new());
    let a = leaser(&service, "a");
    let b = leaser(&service, "b");

    let mut lease = a.acquire().await.unwrap();
    for _ in 0..6 {
        tokio::time::advance(lease.renew_interval().unwrap()).await;
        lease = a.renew(&lease).await.unwrap();
    }
    assert!(!lease.is_expired());
    assert_conflict(&b).await;
}

#[tokio::test(start_paused = true)]
async fn test_released_lease_not_reacquirable_within_lock_delay() {
    let service = Arc::new(MemoryLockService::new());
    let a = leaser(&service, "a");
    let b = leaser(&service, "b");

    let lease = a.acquire().await.unwrap();
    a.release(&lease).await.unwrap();
    assert!(a.primary_info().await.unwrap().is_none());

    assert_conflict(&b).await;
    tokio::time::advance(LOCK_DELAY - Duration::from_millis(100)).await;
    assert_conflict(&b).await;
    // The releasing node is held off too.
    assert_conflict(&a).await;

    tokio::time::advance(Duration::from_millis(200)).await;
    let lease = b.acquire().await.unwrap();
    assert_eq!(lease.epoch, 2);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_acquisition_per_window() {
    let service = Arc::new(MemoryLockService::new());
    let nodes: Vec<_> = ["a", "b", "c"].iter().map(|n| leaser(&service, n)).collect();

    let mut acquisitions = 0;
    let mut held = None;
    // Every node retries every second, for longer than the lock delay.
    let first = nodes[0].acquire().await.unwrap();
    nodes[0].release(&first).await.unwrap();
    for _ in 0..8 {
        for node in &nodes {
            if let Ok(lease) = node.acquire().await {
                acquisitions += 1;
                held = Some(lease);
            }
        }
        tokio::time::advance(Duration::from_secs(1)).await;
    }
    assert_eq!(acquisitions, 1);
    assert_eq!(held.unwrap().epoch, 2);
    // Conflicting sessions were cleaned up; only the holder's remains.
    assert_eq!(service.session_count(), 1);
}
