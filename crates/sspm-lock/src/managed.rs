//! The managed-lock pattern: acquire + heartbeat + cancel-on-loss +
//! always-release. Every "hold a lock around work" site in the core goes
//! through here.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::traits::Lock;
use crate::SyncLockLost;

/// Run `work` while holding `lock`.
///
/// A child token is derived from the caller's; the heartbeat's loss callback
/// cancels the child (not the caller) and the loss is recorded. On every
/// exit path the lock is released (release is internally time-bounded, so a
/// canceled caller still releases). If the lease was lost, the return is a
/// [`SyncLockLost`] wrapping whatever the work produced, so callers can tell
/// a stolen lease from an ordinary failure.
pub async fn run_locked<T, F, Fut>(
    lock: Box<dyn Lock>,
    parent: &CancellationToken,
    work: F,
) -> Result<T>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let child = parent.child_token();
    let lost = Arc::new(AtomicBool::new(false));

    let heartbeat = {
        let lost = lost.clone();
        let child = child.clone();
        lock.start_heartbeat(Box::new(move || {
            lost.store(true, Ordering::SeqCst);
            child.cancel();
        }))
    };

    let result = work(child.clone()).await;

    // Stop renewing before releasing so the renewer can't revive a row the
    // release just deleted.
    drop(heartbeat);

    if let Err(err) = lock.release().await {
        warn!(
            scope_kind = %lock.scope_kind(),
            scope_name = %lock.scope_name(),
            error = %err,
            "lock release failed"
        );
    }

    if lost.load(Ordering::SeqCst) {
        return Err(match result {
            Ok(_) => anyhow::Error::new(SyncLockLost::new()),
            Err(err) => anyhow::Error::new(SyncLockLost::wrapping(err)),
        });
    }

    result
}
