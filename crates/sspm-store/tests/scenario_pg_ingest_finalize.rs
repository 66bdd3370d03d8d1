//! Bulk upsert + finalize against a real Postgres: promote stamps
//! `last_observed_run_id`, expire soft-deletes the rest, stats carry the
//! counts, and other sources stay untouched. Skips without a database.

use uuid::Uuid;

use sspm_store::{AppUserRecord, EntityClass, PgStore, RunStatus, Store};

fn user(external_id: &str, email: &str) -> AppUserRecord {
    AppUserRecord {
        external_id: external_id.to_string(),
        email: Some(email.to_string()),
        display_name: Some(external_id.to_string()),
        status: Some("active".to_string()),
        is_admin: false,
    }
}

#[tokio::test]
async fn upsert_promote_expire_round_trip() -> anyhow::Result<()> {
    if std::env::var(sspm_store::ENV_DB_URL).is_err() {
        eprintln!("SKIP: SSPM_DATABASE_URL not set");
        return Ok(());
    }

    let pool = sspm_store::testkit_db_pool().await?;
    let store = PgStore::new(pool);

    // Unique source per test run so reruns never collide.
    let source_name = format!("tenant-{}", Uuid::new_v4());
    let other_name = format!("tenant-{}", Uuid::new_v4());

    // Another tenant's row, live before our runs.
    let other_run = store.create_sync_run("github", &other_name).await?;
    store
        .upsert_app_users_bulk_by_source("github", &other_name, other_run, &[user("o1", "o1@x.co")])
        .await?;
    store
        .finalize_sync_run(other_run, "github", &other_name, &[EntityClass::AppUsers], 5)
        .await?;

    // Run 1 observes u1 + u2.
    let run1 = store.create_sync_run("github", &source_name).await?;
    store
        .upsert_app_users_bulk_by_source(
            "github",
            &source_name,
            run1,
            &[user("u1", "u1@x.co"), user("u2", "u2@x.co")],
        )
        .await?;
    let stats1 = store
        .finalize_sync_run(run1, "github", &source_name, &[EntityClass::AppUsers], 7)
        .await?;
    assert_eq!(stats1.counts["app_users"].observed, 2);
    assert_eq!(stats1.counts["app_users"].expired, 0);

    let row1 = store.get_sync_run(run1).await?.expect("run row");
    assert_eq!(row1.status, RunStatus::Success);
    assert_eq!(row1.stats["counts"]["app_users"]["observed"], 2);
    assert_eq!(row1.stats["duration_ms"], 7);

    // Run 2 observes only u1: u2 expires.
    let run2 = store.create_sync_run("github", &source_name).await?;
    store
        .upsert_app_users_bulk_by_source("github", &source_name, run2, &[user("u1", "u1@x.co")])
        .await?;
    let stats2 = store
        .finalize_sync_run(run2, "github", &source_name, &[EntityClass::AppUsers], 3)
        .await?;
    assert_eq!(stats2.counts["app_users"].observed, 1);
    assert_eq!(stats2.counts["app_users"].expired, 1);

    // Run 3 re-observes u2: re-observation revives the row.
    let run3 = store.create_sync_run("github", &source_name).await?;
    store
        .upsert_app_users_bulk_by_source(
            "github",
            &source_name,
            run3,
            &[user("u1", "u1@x.co"), user("u2", "u2@x.co")],
        )
        .await?;
    let stats3 = store
        .finalize_sync_run(run3, "github", &source_name, &[EntityClass::AppUsers], 4)
        .await?;
    assert_eq!(stats3.counts["app_users"].observed, 2);
    assert_eq!(stats3.counts["app_users"].expired, 0);

    // The other tenant was never touched by these finalizes.
    let other_history = store
        .list_recent_finished_sync_runs_by_source("github", &other_name, 10)
        .await?;
    assert_eq!(other_history.len(), 1);
    assert_eq!(other_history[0].status, RunStatus::Success);

    Ok(())
}

#[tokio::test]
async fn failed_run_records_error_kind() -> anyhow::Result<()> {
    if std::env::var(sspm_store::ENV_DB_URL).is_err() {
        eprintln!("SKIP: SSPM_DATABASE_URL not set");
        return Ok(());
    }

    let pool = sspm_store::testkit_db_pool().await?;
    let store = PgStore::new(pool);

    let source_name = format!("tenant-{}", Uuid::new_v4());
    let run_id = store.create_sync_run("okta", &source_name).await?;
    store
        .fail_sync_run(run_id, RunStatus::Error, "vendor exploded", "api")
        .await?;

    let row = store.get_sync_run(run_id).await?.expect("run row");
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.error_kind.as_deref(), Some("api"));
    assert!(row.finished_at.is_some());

    // Terminal transitions happen once: a second fail is a no-op.
    store
        .fail_sync_run(run_id, RunStatus::Canceled, "late writer", "db")
        .await?;
    let row = store.get_sync_run(run_id).await?.expect("run row");
    assert_eq!(row.status, RunStatus::Error);
    assert_eq!(row.message.as_deref(), Some("vendor exploded"));

    Ok(())
}

#[tokio::test]
async fn notify_round_trip_via_listener() -> anyhow::Result<()> {
    if std::env::var(sspm_store::ENV_DB_URL).is_err() {
        eprintln!("SKIP: SSPM_DATABASE_URL not set");
        return Ok(());
    }

    let pool = sspm_store::testkit_db_pool().await?;
    let store = PgStore::new(pool.clone());

    let mut listener = sqlx::postgres::PgListener::connect_with(&pool).await?;
    listener.listen(sspm_store::CHANNEL_RESYNC_REQUESTED).await?;

    store
        .notify(
            sspm_store::CHANNEL_RESYNC_REQUESTED,
            Some(r#"{"connector_kind":"okta","source_name":"acme"}"#),
        )
        .await?;

    let notification =
        tokio::time::timeout(std::time::Duration::from_secs(5), listener.recv()).await??;
    assert_eq!(notification.channel(), sspm_store::CHANNEL_RESYNC_REQUESTED);
    assert!(notification.payload().contains("okta"));

    Ok(())
}
