//! Lease-row lock primitives. Predicate logic is server-side: acquisition
//! is an atomic insert-or-replace gated on expiry, renew/release are gated
//! on the holder token so a stale holder can neither extend nor clobber.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

pub(crate) async fn try_acquire_sync_lock_lease(
    pool: &PgPool,
    scope_kind: &str,
    scope_name: &str,
    holder_instance_id: &str,
    holder_token: Uuid,
    ttl_secs: i64,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        insert into sync_lock_leases
            (scope_kind, scope_name, holder_instance_id, holder_token, expires_at)
        values ($1, $2, $3, $4, now() + make_interval(secs => $5::double precision))
        on conflict (scope_kind, scope_name) do update
           set holder_instance_id = excluded.holder_instance_id,
               holder_token = excluded.holder_token,
               expires_at = excluded.expires_at
         where sync_lock_leases.expires_at < now()
            or sync_lock_leases.holder_token = excluded.holder_token
        returning holder_token
        "#,
    )
    .bind(scope_kind)
    .bind(scope_name)
    .bind(holder_instance_id)
    .bind(holder_token)
    .bind(ttl_secs as f64)
    .fetch_optional(pool)
    .await
    .context("try_acquire_sync_lock_lease failed")?;

    Ok(row.is_some())
}

pub(crate) async fn renew_sync_lock_lease(
    pool: &PgPool,
    scope_kind: &str,
    scope_name: &str,
    holder_token: Uuid,
    ttl_secs: i64,
) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update sync_lock_leases
           set expires_at = now() + make_interval(secs => $4::double precision)
         where scope_kind = $1
           and scope_name = $2
           and holder_token = $3
        returning holder_token
        "#,
    )
    .bind(scope_kind)
    .bind(scope_name)
    .bind(holder_token)
    .bind(ttl_secs as f64)
    .fetch_optional(pool)
    .await
    .context("renew_sync_lock_lease failed")?;

    Ok(row.is_some())
}

pub(crate) async fn release_sync_lock_lease(
    pool: &PgPool,
    scope_kind: &str,
    scope_name: &str,
    holder_token: Uuid,
) -> Result<()> {
    sqlx::query(
        r#"
        delete from sync_lock_leases
        where scope_kind = $1
          and scope_name = $2
          and holder_token = $3
        "#,
    )
    .bind(scope_kind)
    .bind(scope_name)
    .bind(holder_token)
    .execute(pool)
    .await
    .context("release_sync_lock_lease failed")?;

    Ok(())
}

pub(crate) async fn notify(pool: &PgPool, channel: &str, payload: Option<&str>) -> Result<()> {
    sqlx::query("select pg_notify($1, $2)")
        .bind(channel)
        .bind(payload.unwrap_or(""))
        .execute(pool)
        .await
        .with_context(|| format!("pg_notify on {channel} failed"))?;

    Ok(())
}
