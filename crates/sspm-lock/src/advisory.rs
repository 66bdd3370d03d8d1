//! Session advisory locks. Each held lock pins a pooled connection for its
//! lifetime; release returns it to the pool. No heartbeat: session locks
//! don't expire. Preferred when the pool is large and connectors are short.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::traits::{Lock, LockManager};

const RELEASE_TIMEOUT: Duration = Duration::from_secs(5);

/// Advisory key layout: FNV-1a over `lowercase(kind) | 0x00 | lowercase(name)`,
/// taken as a signed 64-bit integer.
pub fn advisory_lock_key(scope_kind: &str, scope_name: &str) -> i64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    let bytes = scope_kind
        .to_lowercase()
        .into_bytes()
        .into_iter()
        .chain(std::iter::once(0u8))
        .chain(scope_name.to_lowercase().into_bytes());
    for b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash as i64
}

pub struct AdvisoryLockManager {
    pool: PgPool,
}

impl AdvisoryLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LockManager for AdvisoryLockManager {
    async fn try_acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
    ) -> Result<Option<Box<dyn Lock>>> {
        let key = advisory_lock_key(scope_kind, scope_name);
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("advisory lock: pool acquire failed")?;

        let (locked,): (bool,) = sqlx::query_as("select pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await
            .context("pg_try_advisory_lock failed")?;

        if !locked {
            // Connection goes straight back to the pool.
            return Ok(None);
        }

        Ok(Some(Box::new(AdvisoryLock {
            conn: Mutex::new(Some(conn)),
            key,
            scope_kind: scope_kind.to_string(),
            scope_name: scope_name.to_string(),
        })))
    }

    async fn acquire(
        &self,
        scope_kind: &str,
        scope_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn Lock>> {
        let key = advisory_lock_key(scope_kind, scope_name);
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("advisory lock: pool acquire failed")?;

        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(anyhow!(
                    "lock acquire canceled for {}/{}", scope_kind, scope_name
                ));
            }
            res = sqlx::query("select pg_advisory_lock($1)").bind(key).execute(&mut *conn) => {
                res.context("pg_advisory_lock failed")?;
            }
        }

        Ok(Box::new(AdvisoryLock {
            conn: Mutex::new(Some(conn)),
            key,
            scope_kind: scope_kind.to_string(),
            scope_name: scope_name.to_string(),
        }))
    }
}

struct AdvisoryLock {
    /// The pinned session. `None` after release.
    conn: Mutex<Option<PoolConnection<Postgres>>>,
    key: i64,
    scope_kind: String,
    scope_name: String,
}

#[async_trait]
impl Lock for AdvisoryLock {
    fn scope_kind(&self) -> &str {
        &self.scope_kind
    }

    fn scope_name(&self) -> &str {
        &self.scope_name
    }

    async fn release(&self) -> Result<()> {
        let Some(mut conn) = self.conn.lock().await.take() else {
            // Already released.
            return Ok(());
        };

        let fut = sqlx::query("select pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *conn);

        tokio::time::timeout(RELEASE_TIMEOUT, fut)
            .await
            .with_context(|| {
                format!(
                    "advisory unlock timed out for {}/{}",
                    self.scope_kind, self.scope_name
                )
            })?
            .context("pg_advisory_unlock failed")?;

        // Dropping the connection returns it to the pool.
        drop(conn);
        Ok(())
    }

    async fn notify_on_held_conn(&self, channel: &str, payload: Option<&str>) -> Result<bool> {
        let mut guard = self.conn.lock().await;
        let Some(conn) = guard.as_mut() else {
            return Ok(false);
        };

        sqlx::query("select pg_notify($1, $2)")
            .bind(channel)
            .bind(payload.unwrap_or(""))
            .execute(&mut **conn)
            .await
            .with_context(|| format!("pg_notify on {channel} via held connection failed"))?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Reference values computed from the FNV-1a definition.
    fn reference_fnv1a(bytes: &[u8]) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for &b in bytes {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        h
    }

    #[test]
    fn key_matches_reference_layout() {
        let got = advisory_lock_key("Connector", "Okta/Acme.okta.com");
        let expect = reference_fnv1a(b"connector\x00okta/acme.okta.com") as i64;
        assert_eq!(got, expect);
    }

    #[test]
    fn key_is_case_insensitive() {
        assert_eq!(
            advisory_lock_key("sync", "runonce_full"),
            advisory_lock_key("SYNC", "RUNONCE_FULL"),
        );
    }

    #[test]
    fn distinct_scopes_get_distinct_keys() {
        assert_ne!(
            advisory_lock_key("sync", "runonce_full"),
            advisory_lock_key("sync", "runonce_discovery"),
        );
        // The separator byte matters: ("ab","c") must differ from ("a","bc").
        assert_ne!(advisory_lock_key("ab", "c"), advisory_lock_key("a", "bc"));
    }
}
