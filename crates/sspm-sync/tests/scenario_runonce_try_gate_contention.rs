//! Two workers invoke the try-variant run-once gate concurrently: exactly
//! one runs the wrapped planner, the other surfaces the busy sentinel
//! without executing anything.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sspm_lock::{LeaseLockConfig, LeaseLockManager, LockManager};
use sspm_sync::{is_sync_already_running, RunMode, RunOnceGate, RunRequest, Runner};
use sspm_testkit::MemStore;

struct CountingRunner {
    runs: AtomicUsize,
}

#[async_trait]
impl Runner for CountingRunner {
    async fn run_once(&self, _req: &RunRequest) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        // Hold the gate long enough that the second caller collides.
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(())
    }
}

#[tokio::test]
async fn try_gate_admits_exactly_one_of_two_contenders() {
    let store = Arc::new(MemStore::new());
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store.clone(),
        LeaseLockConfig::default(),
    ));
    let inner = Arc::new(CountingRunner {
        runs: AtomicUsize::new(0),
    });

    let gate = Arc::new(RunOnceGate::try_lock(
        inner.clone(),
        locks,
        RunMode::Full,
    ));

    let a = tokio::spawn({
        let gate = gate.clone();
        async move {
            gate.run_once(&RunRequest::scheduled(CancellationToken::new()))
                .await
        }
    });
    let b = tokio::spawn({
        let gate = gate.clone();
        async move {
            // Give task a a head start so the contention is deterministic.
            tokio::time::sleep(Duration::from_millis(50)).await;
            gate.run_once(&RunRequest::scheduled(CancellationToken::new()))
                .await
        }
    });

    let res_a = a.await.unwrap();
    let res_b = b.await.unwrap();

    let (winner, loser) = if res_a.is_ok() {
        (res_a, res_b)
    } else {
        (res_b, res_a)
    };
    assert!(winner.is_ok());
    let err = loser.unwrap_err();
    assert!(
        is_sync_already_running(&err),
        "loser must surface the busy sentinel, got: {err:#}"
    );

    assert_eq!(inner.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gate_releases_for_subsequent_passes() {
    let store = Arc::new(MemStore::new());
    let locks: Arc<dyn LockManager> = Arc::new(LeaseLockManager::new(
        store.clone(),
        LeaseLockConfig::default(),
    ));
    let inner = Arc::new(CountingRunner {
        runs: AtomicUsize::new(0),
    });
    let gate = RunOnceGate::try_lock(inner.clone(), locks, RunMode::Full);

    for _ in 0..2 {
        gate.run_once(&RunRequest::scheduled(CancellationToken::new()))
            .await
            .unwrap();
    }
    assert_eq!(inner.runs.load(Ordering::SeqCst), 2);
}
