//! Global run-once gate: at most one sync pass per mode at a time, across
//! every worker process.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use sspm_lock::{run_locked, LockManager, SCOPE_KIND_SYNC};

use crate::error::SyncAlreadyRunning;
use crate::mode::RunMode;
use crate::runner::{RunRequest, Runner};

/// Wraps any [`Runner`] with the mode's global lock.
///
/// The blocking variant waits for the lock (scheduler ticks); the try
/// variant surfaces [`SyncAlreadyRunning`] immediately (operator-triggered
/// paths that must respond quickly).
pub struct RunOnceGate {
    inner: Arc<dyn Runner>,
    locks: Arc<dyn LockManager>,
    mode: RunMode,
    blocking: bool,
}

impl RunOnceGate {
    pub fn blocking(inner: Arc<dyn Runner>, locks: Arc<dyn LockManager>, mode: RunMode) -> Self {
        Self {
            inner,
            locks,
            mode,
            blocking: true,
        }
    }

    pub fn try_lock(inner: Arc<dyn Runner>, locks: Arc<dyn LockManager>, mode: RunMode) -> Self {
        Self {
            inner,
            locks,
            mode,
            blocking: false,
        }
    }
}

#[async_trait]
impl Runner for RunOnceGate {
    async fn run_once(&self, req: &RunRequest) -> Result<()> {
        let scope = self.mode.runonce_scope();

        let lock = if self.blocking {
            self.locks
                .acquire(SCOPE_KIND_SYNC, scope, &req.cancel)
                .await?
        } else {
            match self.locks.try_acquire(SCOPE_KIND_SYNC, scope).await? {
                Some(lock) => lock,
                None => return Err(SyncAlreadyRunning.into()),
            }
        };

        let inner = self.inner.clone();
        let outer = req.clone();
        run_locked(lock, &req.cancel, |child| {
            let mut inner_req = outer;
            inner_req.cancel = child;
            async move { inner.run_once(&inner_req).await }
        })
        .await
    }
}
