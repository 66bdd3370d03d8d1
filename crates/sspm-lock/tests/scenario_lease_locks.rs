//! Lease lock properties over the in-memory store: per-scope mutual
//! exclusion, blocking-acquire serialization, expiry takeover, release
//! idempotence, heartbeat liveness and loss detection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sspm_lock::{
    run_locked, LeaseLockConfig, LeaseLockManager, Lock, LockManager, SyncLockLost,
    SCOPE_KIND_CONNECTOR,
};
use sspm_testkit::MemStore;

fn manager(store: &Arc<MemStore>, ttl: Duration, heartbeat: Duration) -> LeaseLockManager {
    LeaseLockManager::new(
        store.clone(),
        LeaseLockConfig {
            ttl,
            heartbeat_interval: heartbeat,
        },
    )
}

#[tokio::test]
async fn try_acquire_is_exclusive_per_scope() {
    let store = Arc::new(MemStore::new());
    let a = manager(&store, Duration::from_secs(60), Duration::from_secs(15));
    let b = manager(&store, Duration::from_secs(60), Duration::from_secs(15));

    let first = a
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap();
    assert!(first.is_some());

    // Same scope, different manager: blocked.
    assert!(b
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .is_none());

    // Different scope: free.
    assert!(b
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/other")
        .await
        .unwrap()
        .is_some());

    first.unwrap().release().await.unwrap();
    assert!(b
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn blocking_acquire_waits_for_release() {
    let store = Arc::new(MemStore::new());
    let mgr = Arc::new(manager(
        &store,
        Duration::from_secs(60),
        Duration::from_secs(15),
    ));

    let held = mgr
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .unwrap();

    let waiter = tokio::spawn({
        let mgr = mgr.clone();
        async move {
            mgr.acquire(
                SCOPE_KIND_CONNECTOR,
                "okta/acme",
                &CancellationToken::new(),
            )
            .await
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!waiter.is_finished(), "acquire must block while held");

    held.release().await.unwrap();
    let lock = tokio::time::timeout(Duration::from_secs(10), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    lock.release().await.unwrap();
}

#[tokio::test]
async fn blocking_acquire_honors_cancellation() {
    let store = Arc::new(MemStore::new());
    let mgr = Arc::new(manager(
        &store,
        Duration::from_secs(60),
        Duration::from_secs(15),
    ));
    let _held = mgr
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .unwrap();

    let cancel = CancellationToken::new();
    let waiter = tokio::spawn({
        let mgr = mgr.clone();
        let cancel = cancel.clone();
        async move {
            mgr.acquire(SCOPE_KIND_CONNECTOR, "okta/acme", &cancel)
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();
    assert!(waiter.await.unwrap().is_err());
}

#[tokio::test]
async fn expired_lease_is_acquirable_by_new_holder() {
    let store = Arc::new(MemStore::new());
    // 1s TTL, heartbeat far beyond it: the lease dies quickly.
    let a = manager(&store, Duration::from_secs(1), Duration::from_secs(3600));
    let b = manager(&store, Duration::from_secs(60), Duration::from_secs(15));

    let stale = a
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let fresh = b
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap();
    assert!(fresh.is_some(), "expired lease must be acquirable");

    // The stale holder's release must not clobber the new holder.
    stale.release().await.unwrap();
    assert!(store
        .lease_holder(SCOPE_KIND_CONNECTOR, "okta/acme")
        .is_some());

    // Double release of the fresh lock is a no-op the second time.
    let fresh = fresh.unwrap();
    fresh.release().await.unwrap();
    fresh.release().await.unwrap();
    assert!(store
        .lease_holder(SCOPE_KIND_CONNECTOR, "okta/acme")
        .is_none());
}

#[tokio::test]
async fn heartbeat_keeps_short_ttl_lease_alive() {
    let store = Arc::new(MemStore::new());
    let a = manager(&store, Duration::from_secs(1), Duration::from_millis(150));
    let b = manager(&store, Duration::from_secs(60), Duration::from_secs(15));

    let lock = a
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .unwrap();
    let lost = Arc::new(AtomicBool::new(false));
    let heartbeat = lock.start_heartbeat({
        let lost = lost.clone();
        Box::new(move || lost.store(true, Ordering::SeqCst))
    });

    // Well past the bare TTL; the renewer must have kept the lease.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!lost.load(Ordering::SeqCst));
    assert!(b
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .is_none());

    drop(heartbeat);
    lock.release().await.unwrap();
}

#[tokio::test]
async fn stolen_lease_fires_on_lost_exactly_once_via_managed_helper() {
    let store = Arc::new(MemStore::new());
    let mgr = manager(&store, Duration::from_secs(5), Duration::from_millis(100));

    let lock = mgr
        .try_acquire(SCOPE_KIND_CONNECTOR, "okta/acme")
        .await
        .unwrap()
        .unwrap();

    let thief = {
        let store = store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            store.steal_lease(SCOPE_KIND_CONNECTOR, "okta/acme");
        })
    };

    let parent = CancellationToken::new();
    let result: anyhow::Result<()> = run_locked(lock, &parent, |child| async move {
        // Wait for the loss-driven cancellation, bounded.
        tokio::select! {
            _ = child.cancelled() => Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(10)) => {
                anyhow::bail!("child token never canceled")
            }
        }
    })
    .await;
    thief.await.unwrap();

    let err = result.unwrap_err();
    assert!(
        err.chain()
            .any(|c| c.downcast_ref::<SyncLockLost>().is_some()),
        "expected lock-lost sentinel, got {err:#}"
    );
    // The caller's own token is untouched.
    assert!(!parent.is_cancelled());
}
