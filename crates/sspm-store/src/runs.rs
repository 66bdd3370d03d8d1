//! sync_runs lifecycle, history projections and connector config reads.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::time::Duration;

use crate::types::{ConnectorConfigRow, FinishedRun, RunStatus, SourceRef, SyncRunRow, SyncStats};

pub(crate) async fn create_sync_run(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        insert into sync_runs (source_kind, source_name, status, started_at)
        values ($1, $2, 'running', now())
        returning id
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .fetch_one(pool)
    .await
    .context("create_sync_run failed")?;

    Ok(id)
}

pub(crate) async fn mark_sync_run_success(
    pool: &PgPool,
    run_id: i64,
    stats: &SyncStats,
) -> Result<()> {
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
    .execute(pool)
    .await
    .context("mark_sync_run_success failed")?;

    Ok(())
}

/// Terminal failure write. Bounded by a 5s timeout instead of the caller's
/// cancellation so a torn-down pass still records its outcome.
pub(crate) async fn fail_sync_run(
    pool: &PgPool,
    run_id: i64,
    status: RunStatus,
    message: &str,
    error_kind: &str,
) -> Result<()> {
    let fut = sqlx::query(
        r#"
        update sync_runs
           set status = $2,
               finished_at = now(),
               message = $3,
               error_kind = $4
         where id = $1
           and status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(message)
    .bind(error_kind)
    .execute(pool);

    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .context("fail_sync_run timed out")?
        .context("fail_sync_run failed")?;

    Ok(())
}

fn row_to_sync_run(row: &sqlx::postgres::PgRow) -> Result<SyncRunRow> {
    Ok(SyncRunRow {
        id: row.try_get("id")?,
        source_kind: row.try_get("source_kind")?,
        source_name: row.try_get("source_name")?,
        status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        message: row.try_get("message")?,
        error_kind: row.try_get("error_kind")?,
        stats: row.try_get("stats")?,
    })
}

pub(crate) async fn get_sync_run(pool: &PgPool, run_id: i64) -> Result<Option<SyncRunRow>> {
    let row = sqlx::query(
        r#"
        select id, source_kind, source_name, status, started_at, finished_at,
               message, error_kind, stats
        from sync_runs
        where id = $1
        "#,
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await
    .context("get_sync_run failed")?;

    row.as_ref().map(row_to_sync_run).transpose()
}

pub(crate) async fn list_recent_sync_runs(pool: &PgPool, limit: i64) -> Result<Vec<SyncRunRow>> {
    let rows = sqlx::query(
        r#"
        select id, source_kind, source_name, status, started_at, finished_at,
               message, error_kind, stats
        from sync_runs
        order by started_at desc
        limit $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_recent_sync_runs failed")?;

    rows.iter().map(row_to_sync_run).collect()
}

pub(crate) async fn list_recent_finished_sync_runs_by_source(
    pool: &PgPool,
    source_kind: &str,
    source_name: &str,
    limit: i64,
) -> Result<Vec<FinishedRun>> {
    let rows = sqlx::query(
        r#"
        select status, finished_at
        from sync_runs
        where source_kind = $1
          and source_name = $2
          and status <> 'running'
        order by finished_at desc nulls last
        limit $3
        "#,
    )
    .bind(source_kind)
    .bind(source_name)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_recent_finished_sync_runs_by_source failed")?;

    rows.iter()
        .map(|row| {
            Ok(FinishedRun {
                status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
                finished_at: row.try_get("finished_at")?,
            })
        })
        .collect()
}

/// Batched history: a capped recent window per requested source in one
/// round trip. Sources with no finished runs are absent from the map.
pub(crate) async fn list_recent_finished_sync_runs_for_sources(
    pool: &PgPool,
    sources: &[SourceRef],
    limit: i64,
) -> Result<HashMap<SourceRef, Vec<FinishedRun>>> {
    if sources.is_empty() {
        return Ok(HashMap::new());
    }

    let kinds: Vec<String> = sources.iter().map(|s| s.kind.clone()).collect();
    let names: Vec<String> = sources.iter().map(|s| s.name.clone()).collect();

    let rows = sqlx::query(
        r#"
        select source_kind, source_name, status, finished_at
        from (
            select r.source_kind, r.source_name, r.status, r.finished_at,
                   row_number() over (
                       partition by r.source_kind, r.source_name
                       order by r.finished_at desc nulls last
                   ) as rn
            from sync_runs r
            join unnest($1::text[], $2::text[]) as s(kind, name)
              on r.source_kind = s.kind and r.source_name = s.name
            where r.status <> 'running'
        ) t
        where rn <= $3
        order by source_kind, source_name, finished_at desc nulls last
        "#,
    )
    .bind(&kinds)
    .bind(&names)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_recent_finished_sync_runs_for_sources failed")?;

    let mut out: HashMap<SourceRef, Vec<FinishedRun>> = HashMap::new();
    for row in rows {
        let source = SourceRef::new(
            row.try_get::<String, _>("source_kind")?,
            row.try_get::<String, _>("source_name")?,
        );
        out.entry(source).or_default().push(FinishedRun {
            status: RunStatus::parse(&row.try_get::<String, _>("status")?)?,
            finished_at: row.try_get("finished_at")?,
        });
    }
    Ok(out)
}

pub(crate) async fn list_connector_configs(pool: &PgPool) -> Result<Vec<ConnectorConfigRow>> {
    let rows = sqlx::query(
        r#"
        select kind, enabled, config
        from connector_configs
        order by kind
        "#,
    )
    .fetch_all(pool)
    .await
    .context("list_connector_configs failed")?;

    rows.iter()
        .map(|row| {
            Ok(ConnectorConfigRow {
                kind: row.try_get("kind")?,
                enabled: row.try_get("enabled")?,
                config: row.try_get("config")?,
            })
        })
        .collect()
}
