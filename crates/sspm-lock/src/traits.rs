//! The lock capability surface shared by both schemes.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Fired at most once when a heartbeat discovers the lease is gone.
pub type OnLost = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a running heartbeat renewer. Dropping it stops the renewer;
/// schemes without heartbeats hand out a no-op handle.
pub struct HeartbeatHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl HeartbeatHandle {
    pub fn noop() -> Self {
        Self { task: None }
    }

    pub(crate) fn from_task(task: tokio::task::JoinHandle<()>) -> Self {
        Self { task: Some(task) }
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// An exclusively held scope. Owned by the acquirer from acquisition until
/// release; the heartbeat renewer only extends, never releases.
#[async_trait]
pub trait Lock: Send + Sync {
    fn scope_kind(&self) -> &str;

    fn scope_name(&self) -> &str;

    /// Start the background renewer. Default: nothing to renew.
    fn start_heartbeat(&self, on_lost: OnLost) -> HeartbeatHandle {
        let _ = on_lost;
        HeartbeatHandle::noop()
    }

    /// Release the scope. Bounded internally (5s) so a canceled caller
    /// still releases cleanly; stale releases are no-ops.
    async fn release(&self) -> Result<()>;

    /// Issue a NOTIFY on the connection this lock pins, when it pins one.
    /// Returns `false` when this lock holds no connection and the caller
    /// should notify through the shared pool instead. Session-pinning
    /// schemes must handle this themselves: against a 1-connection pool a
    /// pool-routed NOTIFY would deadlock behind the held connection.
    async fn notify_on_held_conn(&self, channel: &str, payload: Option<&str>) -> Result<bool> {
        let _ = (channel, payload);
        Ok(false)
    }
}

/// Factory for [`Lock`]s over named scopes.
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Non-blocking attempt; `None` means the scope is held elsewhere.
    async fn try_acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
    ) -> Result<Option<Box<dyn Lock>>>;

    /// Block (with backoff where applicable) until the scope is granted or
    /// the token cancels.
    async fn acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Lock>>;
}
