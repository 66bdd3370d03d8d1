//! Repository layer for the sync core: the [`Store`] contract, its Postgres
//! implementation, and the embedded schema migrations.

use anyhow::{Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod contract;
mod identity;
mod ingest;
mod lease;
mod pg;
mod runs;
mod types;

pub use contract::{Store, CHANNEL_RESYNC_DISCOVERY_REQUESTED, CHANNEL_RESYNC_REQUESTED};
pub use pg::PgStore;
pub use types::*;

pub const ENV_DB_URL: &str = "SSPM_DATABASE_URL";

/// Connect to Postgres using SSPM_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .context("failed to connect to Postgres")?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

/// Test helper used by integration tests: connect and ensure migrations.
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}
