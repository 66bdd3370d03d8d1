//! Row-lease locks: insert-or-replace with TTL, heartbeat renewal, token-
//! predicated release.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use sspm_store::Store;

use crate::traits::{HeartbeatHandle, Lock, LockManager, OnLost};

const ACQUIRE_BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const ACQUIRE_BACKOFF_MAX: Duration = Duration::from_secs(5);
const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LeaseLockConfig {
    /// Lease TTL. Granularity is seconds: the value is ceilinged, so
    /// sub-second TTLs round up to one second.
    pub ttl: Duration,
    /// Heartbeat renew cadence. Keep at or below `ttl / 3`.
    pub heartbeat_interval: Duration,
}

impl Default for LeaseLockConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
        }
    }
}

impl LeaseLockConfig {
    fn ttl_secs(&self) -> i64 {
        (self.ttl.as_secs_f64().ceil() as i64).max(1)
    }
}

pub struct LeaseLockManager {
    store: Arc<dyn Store>,
    cfg: LeaseLockConfig,
    instance_id: String,
}

impl LeaseLockManager {
    pub fn new(store: Arc<dyn Store>, cfg: LeaseLockConfig) -> Self {
        let instance_id = crate::instance_id();
        Self {
            store,
            cfg,
            instance_id,
        }
    }
}

#[async_trait]
impl LockManager for LeaseLockManager {
    async fn try_acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
    ) -> Result<Option<Box<dyn Lock>>> {
        let token = Uuid::new_v4();
        let acquired = self
            .store
            .try_acquire_sync_lock_lease(
                scope_kind,
                scope_name,
                &self.instance_id,
                token,
                self.cfg.ttl_secs(),
            )
            .await?;

        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(LeaseLock {
            store: self.store.clone(),
            cfg: self.cfg.clone(),
            scope_kind: scope_kind.to_string(),
            scope_name: scope_name.to_string(),
            token,
        })))
    }

    async fn acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Lock>> {
        let mut delay = ACQUIRE_BACKOFF_INITIAL;
        loop {
            if let Some(lock) = self.try_acquire(scope_kind, scope_name).await? {
                return Ok(lock);
            }

            let jitter = rand::thread_rng().gen_range(Duration::ZERO..=delay / 2);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(anyhow!(
                        "lock acquire canceled for {}/{}", scope_kind, scope_name
                    ));
                }
                _ = tokio::time::sleep(delay + jitter) => {}
            }

            delay = (delay * 2).min(ACQUIRE_BACKOFF_MAX);
        }
    }
}

struct LeaseLock {
    store: Arc<dyn Store>,
    cfg: LeaseLockConfig,
    scope_kind: String,
    scope_name: String,
    token: Uuid,
}

#[async_trait]
impl Lock for LeaseLock {
    fn scope_kind(&self) -> &str {
        &self.scope_kind
    }

    fn scope_name(&self) -> &str {
        &self.scope_name
    }

    fn start_heartbeat(&self, on_lost: OnLost) -> HeartbeatHandle {
        let store = self.store.clone();
        let scope_kind = self.scope_kind.clone();
        let scope_name = self.scope_name.clone();
        let token = self.token;
        let ttl_secs = self.cfg.ttl_secs();
        let interval = self.cfg.heartbeat_interval;

        let task = tokio::spawn(async move {
            // Spread renewers out so co-started passes don't renew in step.
            let initial = rand::thread_rng().gen_range(Duration::ZERO..=interval / 3);
            tokio::time::sleep(initial).await;

            let mut on_lost = Some(on_lost);
            loop {
                tokio::time::sleep(interval).await;

                match store
                    .renew_sync_lock_lease(&scope_kind, &scope_name, token, ttl_secs)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(
                            scope_kind = %scope_kind,
                            scope_name = %scope_name,
                            "lease renew rejected; holder token superseded"
                        );
                        if let Some(f) = on_lost.take() {
                            f();
                        }
                        return;
                    }
                    Err(err) => {
                        warn!(
                            scope_kind = %scope_kind,
                            scope_name = %scope_name,
                            error = %err,
                            "lease renew failed; treating lease as lost"
                        );
                        if let Some(f) = on_lost.take() {
                            f();
                        }
                        return;
                    }
                }
            }
        });

        HeartbeatHandle::from_task(task)
    }

    async fn release(&self) -> Result<()> {
        let fut = self
            .store
            .release_sync_lock_lease(&self.scope_kind, &self.scope_name, self.token);

        tokio::time::timeout(RELEASE_TIMEOUT, fut)
            .await
            .with_context(|| {
                format!(
                    "lease release timed out for {}/{}",
                    self.scope_kind, self.scope_name
                )
            })?
    }
}
