//! Bulk upserts, promote/expire, and the run finalization transaction.
//!
//! Upserts are parallel-array shaped: record-of-struct inputs are serialized
//! to one array bind per column here, at the SQL boundary, and joined with
//! `unnest`. Each upsert call is one implicit transaction; a whole run is
//! not. Every upsert stamps `seen_in_run_id`; promotion copies that marker
//! into `last_observed_run_id` and expiration flags everything older.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::types::{
    AppAssetRecord, AppUserRecord, AssetOwnerRecord, CredentialArtifactRecord,
    DiscoveryEventRecord, DiscoverySourceRecord, EntitlementRecord, EntityClass, IdpAppRecord,
    IdpAssignmentRecord, IdpGroupRecord, IdpUserRecord, PhaseCounts, SyncStats,
};

// ---------------------------------------------------------------------------
// Bulk upserts
// ---------------------------------------------------------------------------

pub(crate) async fn upsert_app_users(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[AppUserRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let emails: Vec<Option<&str>> = rows.iter().map(|r| r.email.as_deref()).collect();
    let display_names: Vec<Option<&str>> = rows.iter().map(|r| r.display_name.as_deref()).collect();
    let statuses: Vec<Option<&str>> = rows.iter().map(|r| r.status.as_deref()).collect();
    let is_admins: Vec<bool> = rows.iter().map(|r| r.is_admin).collect();

    let res = sqlx::query(
        r#"
        insert into app_users
            (source_kind, source_name, external_id, email, display_name, status,
             is_admin, seen_in_run_id)
        select $1, $2, u.external_id, u.email, u.display_name, u.status, u.is_admin, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[], $8::boolean[])
          as u(external_id, email, display_name, status, is_admin)
        on conflict (source_kind, source_name, external_id) do update
           set email = excluded.email,
               display_name = excluded.display_name,
               status = excluded.status,
               is_admin = excluded.is_admin,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&emails)
    .bind(&display_names)
    .bind(&statuses)
    .bind(&is_admins)
    .execute(pool)
    .await
    .context("upsert_app_users_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_entitlements(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[EntitlementRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let accounts: Vec<&str> = rows.iter().map(|r| r.account_external_id.as_str()).collect();
    let resources: Vec<&str> = rows.iter().map(|r| r.resource.as_str()).collect();
    let permissions: Vec<&str> = rows.iter().map(|r| r.permission.as_str()).collect();
    let sources: Vec<&str> = rows.iter().map(|r| r.assignment_source.as_str()).collect();
    let via_groups: Vec<Option<&str>> = rows.iter().map(|r| r.via_group.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into entitlements
            (source_kind, source_name, external_id, account_external_id, resource,
             permission, assignment_source, via_group, seen_in_run_id)
        select $1, $2, e.external_id, e.account_external_id, e.resource,
               e.permission, e.assignment_source, e.via_group, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[], $8::text[], $9::text[])
          as e(external_id, account_external_id, resource, permission, assignment_source, via_group)
        on conflict (source_kind, source_name, external_id) do update
           set account_external_id = excluded.account_external_id,
               resource = excluded.resource,
               permission = excluded.permission,
               assignment_source = excluded.assignment_source,
               via_group = excluded.via_group,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&accounts)
    .bind(&resources)
    .bind(&permissions)
    .bind(&sources)
    .bind(&via_groups)
    .execute(pool)
    .await
    .context("upsert_entitlements_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_app_assets(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[AppAssetRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    let kinds: Vec<&str> = rows.iter().map(|r| r.asset_kind.as_str()).collect();
    let urls: Vec<Option<&str>> = rows.iter().map(|r| r.url.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into app_assets
            (source_kind, source_name, external_id, name, asset_kind, url, seen_in_run_id)
        select $1, $2, a.external_id, a.name, a.asset_kind, a.url, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[])
          as a(external_id, name, asset_kind, url)
        on conflict (source_kind, source_name, external_id) do update
           set name = excluded.name,
               asset_kind = excluded.asset_kind,
               url = excluded.url,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&names)
    .bind(&kinds)
    .bind(&urls)
    .execute(pool)
    .await
    .context("upsert_app_assets_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_asset_owners(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[AssetOwnerRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let assets: Vec<&str> = rows.iter().map(|r| r.asset_external_id.as_str()).collect();
    let owner_emails: Vec<&str> = rows.iter().map(|r| r.owner_email.as_str()).collect();
    let owner_roles: Vec<Option<&str>> = rows.iter().map(|r| r.owner_role.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into asset_owners
            (source_kind, source_name, external_id, asset_external_id, owner_email,
             owner_role, seen_in_run_id)
        select $1, $2, o.external_id, o.asset_external_id, o.owner_email, o.owner_role, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[])
          as o(external_id, asset_external_id, owner_email, owner_role)
        on conflict (source_kind, source_name, external_id) do update
           set asset_external_id = excluded.asset_external_id,
               owner_email = excluded.owner_email,
               owner_role = excluded.owner_role,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&assets)
    .bind(&owner_emails)
    .bind(&owner_roles)
    .execute(pool)
    .await
    .context("upsert_asset_owners_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_credential_artifacts(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[CredentialArtifactRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    let kinds: Vec<&str> = rows.iter().map(|r| r.artifact_kind.as_str()).collect();
    let paths: Vec<Option<&str>> = rows.iter().map(|r| r.path.as_deref()).collect();
    let created: Vec<Option<DateTime<Utc>>> = rows.iter().map(|r| r.created_upstream_at).collect();
    let rotated: Vec<Option<DateTime<Utc>>> = rows.iter().map(|r| r.last_rotated_at).collect();

    let res = sqlx::query(
        r#"
        insert into credential_artifacts
            (source_kind, source_name, external_id, name, artifact_kind, path,
             created_upstream_at, last_rotated_at, seen_in_run_id)
        select $1, $2, c.external_id, c.name, c.artifact_kind, c.path,
               c.created_upstream_at, c.last_rotated_at, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[],
                    $8::timestamptz[], $9::timestamptz[])
          as c(external_id, name, artifact_kind, path, created_upstream_at, last_rotated_at)
        on conflict (source_kind, source_name, external_id) do update
           set name = excluded.name,
               artifact_kind = excluded.artifact_kind,
               path = excluded.path,
               created_upstream_at = excluded.created_upstream_at,
               last_rotated_at = excluded.last_rotated_at,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&names)
    .bind(&kinds)
    .bind(&paths)
    .bind(&created)
    .bind(&rotated)
    .execute(pool)
    .await
    .context("upsert_credential_artifacts_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_discovery_sources(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[DiscoverySourceRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let display_names: Vec<&str> = rows.iter().map(|r| r.display_name.as_str()).collect();
    let vendors: Vec<Option<&str>> = rows.iter().map(|r| r.vendor.as_deref()).collect();
    let categories: Vec<Option<&str>> = rows.iter().map(|r| r.category.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into discovery_sources
            (source_kind, source_name, external_id, display_name, vendor, category,
             seen_in_run_id)
        select $1, $2, d.external_id, d.display_name, d.vendor, d.category, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[])
          as d(external_id, display_name, vendor, category)
        on conflict (source_kind, source_name, external_id) do update
           set display_name = excluded.display_name,
               vendor = excluded.vendor,
               category = excluded.category,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&display_names)
    .bind(&vendors)
    .bind(&categories)
    .execute(pool)
    .await
    .context("upsert_discovery_sources_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_discovery_events(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[DiscoveryEventRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let sources: Vec<&str> = rows.iter().map(|r| r.source_external_id.as_str()).collect();
    let actors: Vec<Option<&str>> = rows.iter().map(|r| r.actor_email.as_deref()).collect();
    let kinds: Vec<&str> = rows.iter().map(|r| r.event_kind.as_str()).collect();
    let observed: Vec<Option<DateTime<Utc>>> = rows.iter().map(|r| r.observed_at).collect();

    let res = sqlx::query(
        r#"
        insert into discovery_events
            (source_kind, source_name, external_id, source_external_id, actor_email,
             event_kind, observed_at, seen_in_run_id)
        select $1, $2, e.external_id, e.source_external_id, e.actor_email,
               e.event_kind, e.observed_at, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[], $8::timestamptz[])
          as e(external_id, source_external_id, actor_email, event_kind, observed_at)
        on conflict (source_kind, source_name, external_id) do update
           set source_external_id = excluded.source_external_id,
               actor_email = excluded.actor_email,
               event_kind = excluded.event_kind,
               observed_at = excluded.observed_at,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&sources)
    .bind(&actors)
    .bind(&kinds)
    .bind(&observed)
    .execute(pool)
    .await
    .context("upsert_discovery_events_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_idp_users(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[IdpUserRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let emails: Vec<Option<&str>> = rows.iter().map(|r| r.email.as_deref()).collect();
    let display_names: Vec<Option<&str>> = rows.iter().map(|r| r.display_name.as_deref()).collect();
    let statuses: Vec<Option<&str>> = rows.iter().map(|r| r.status.as_deref()).collect();
    let mfa: Vec<bool> = rows.iter().map(|r| r.mfa_enrolled).collect();

    let res = sqlx::query(
        r#"
        insert into idp_users
            (source_kind, source_name, external_id, email, display_name, status,
             mfa_enrolled, seen_in_run_id)
        select $1, $2, u.external_id, u.email, u.display_name, u.status, u.mfa_enrolled, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[], $8::boolean[])
          as u(external_id, email, display_name, status, mfa_enrolled)
        on conflict (source_kind, source_name, external_id) do update
           set email = excluded.email,
               display_name = excluded.display_name,
               status = excluded.status,
               mfa_enrolled = excluded.mfa_enrolled,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&emails)
    .bind(&display_names)
    .bind(&statuses)
    .bind(&mfa)
    .execute(pool)
    .await
    .context("upsert_idp_users_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_idp_groups(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[IdpGroupRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let display_names: Vec<&str> = rows.iter().map(|r| r.display_name.as_str()).collect();
    let descriptions: Vec<Option<&str>> = rows.iter().map(|r| r.description.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into idp_groups
            (source_kind, source_name, external_id, display_name, description, seen_in_run_id)
        select $1, $2, g.external_id, g.display_name, g.description, $3
        from unnest($4::text[], $5::text[], $6::text[])
          as g(external_id, display_name, description)
        on conflict (source_kind, source_name, external_id) do update
           set display_name = excluded.display_name,
               description = excluded.description,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&display_names)
    .bind(&descriptions)
    .execute(pool)
    .await
    .context("upsert_idp_groups_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_idp_apps(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[IdpAppRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let display_names: Vec<&str> = rows.iter().map(|r| r.display_name.as_str()).collect();
    let vendors: Vec<Option<&str>> = rows.iter().map(|r| r.vendor.as_deref()).collect();
    let sign_on: Vec<Option<&str>> = rows.iter().map(|r| r.sign_on_mode.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into idp_apps
            (source_kind, source_name, external_id, display_name, vendor, sign_on_mode,
             seen_in_run_id)
        select $1, $2, a.external_id, a.display_name, a.vendor, a.sign_on_mode, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[])
          as a(external_id, display_name, vendor, sign_on_mode)
        on conflict (source_kind, source_name, external_id) do update
           set display_name = excluded.display_name,
               vendor = excluded.vendor,
               sign_on_mode = excluded.sign_on_mode,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&display_names)
    .bind(&vendors)
    .bind(&sign_on)
    .execute(pool)
    .await
    .context("upsert_idp_apps_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

pub(crate) async fn upsert_idp_assignments(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    run_id: i64,
    rows: &[IdpAssignmentRecord],
) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }

    let external_ids: Vec<&str> = rows.iter().map(|r| r.external_id.as_str()).collect();
    let users: Vec<&str> = rows.iter().map(|r| r.user_external_id.as_str()).collect();
    let apps: Vec<&str> = rows.iter().map(|r| r.app_external_id.as_str()).collect();
    let via: Vec<&str> = rows.iter().map(|r| r.assigned_via.as_str()).collect();
    let groups: Vec<Option<&str>> = rows.iter().map(|r| r.group_external_id.as_deref()).collect();

    let res = sqlx::query(
        r#"
        insert into idp_assignments
            (source_kind, source_name, external_id, user_external_id, app_external_id,
             assigned_via, group_external_id, seen_in_run_id)
        select $1, $2, s.external_id, s.user_external_id, s.app_external_id,
               s.assigned_via, s.group_external_id, $3
        from unnest($4::text[], $5::text[], $6::text[], $7::text[], $8::text[])
          as s(external_id, user_external_id, app_external_id, assigned_via, group_external_id)
        on conflict (source_kind, source_name, external_id) do update
           set user_external_id = excluded.user_external_id,
               app_external_id = excluded.app_external_id,
               assigned_via = excluded.assigned_via,
               group_external_id = excluded.group_external_id,
               seen_in_run_id = excluded.seen_in_run_id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(run_id)
    .bind(&external_ids)
    .bind(&users)
    .bind(&apps)
    .bind(&via)
    .bind(&groups)
    .execute(pool)
    .await
    .context("upsert_idp_assignments_bulk_by_source failed")?;

    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Promote / expire
// ---------------------------------------------------------------------------

/// Table names come from [`EntityClass::table`] (static strings), never from
/// caller input.
pub(crate) async fn promote_seen_in_run<'e, E>(
    exec: E,
    class: EntityClass,
    run_id: i64,
    source_kind: &str,
    source_name: &str,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        update {table}
           set last_observed_run_id = $1,
               expired_at = null
         where source_kind = $2
           and source_name = $3
           and seen_in_run_id = $1
        "#,
        table = class.table()
    );

    let res = sqlx::query(&sql)
        .bind(run_id)
        .bind(source_kind)
        .bind(source_name)
        .execute(exec)
        .await
        .with_context(|| format!("promote_seen_in_run failed for {}", class.as_str()))?;

    Ok(res.rows_affected())
}

pub(crate) async fn expire_not_seen_in_run<'e, E>(
    exec: E,
    class: EntityClass,
    run_id: i64,
    source_kind: &str,
    source_name: &str,
) -> Result<u64>
where
    E: PgExecutor<'e>,
{
    let sql = format!(
        r#"
        update {table}
           set expired_at = now()
         where source_kind = $2
           and source_name = $3
           and expired_at is null
           and (last_observed_run_id is null or last_observed_run_id < $1)
        "#,
        table = class.table()
    );

    let res = sqlx::query(&sql)
        .bind(run_id)
        .bind(source_kind)
        .bind(source_name)
        .execute(exec)
        .await
        .with_context(|| format!("expire_not_seen_in_run failed for {}", class.as_str()))?;

    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Finalize
// ---------------------------------------------------------------------------

/// One transaction: promote then expire each touched class, mark the run
/// successful with the assembled stats, commit. Any failure rolls the whole
/// finalization back so the caller can record the run as failed instead.
pub(crate) async fn finalize_sync_run(
    pool: &PgPool,
    run_id: i64,
    source_kind: &str,
    source_name: &str,
    classes: &[EntityClass],
    duration_ms: u64,
) -> Result<SyncStats> {
    let mut tx = pool.begin().await.context("finalize begin failed")?;

    let mut stats = SyncStats::new(duration_ms);
    for class in classes {
        let observed =
            promote_seen_in_run(&mut *tx, *class, run_id, source_kind, source_name).await?;
        let expired =
            expire_not_seen_in_run(&mut *tx, *class, run_id, source_kind, source_name).await?;
        stats
            .counts
            .insert(class.as_str().to_string(), PhaseCounts { observed, expired });
    }

    sqlx::query(
        r#"
        update sync_runs
           set status = 'success',
               finished_at = now(),
               stats = $2
         where id = $1
           and status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(stats.to_json())
    .execute(&mut *tx)
    .await
    .context("finalize mark success failed")?;

    tx.commit().await.context("finalize commit failed")?;

    Ok(stats)
}

pub(crate) async fn latest_discovery_event_observed_at(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
) -> Result<Option<chrono::DateTime<Utc>>> {
    let (max,): (Option<chrono::DateTime<Utc>>,) = sqlx::query_as(
        r#"
        select max(observed_at)
        from discovery_events
        where source_kind = $1
          and source_name = $2
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .fetch_one(pool)
    .await
    .context("latest_discovery_event_observed_at failed")?;

    Ok(max)
}
