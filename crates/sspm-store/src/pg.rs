//! Postgres-backed [`Store`]. A thin delegating impl; the SQL lives in the
//! per-concern modules (`runs`, `ingest`, `identity`, `lease`).

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::contract::Store;
use crate::types::*;
use crate::{identity, ingest, lease, runs};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool. Consumed by the advisory lock manager (session
    /// pinning) and the notification listener (dedicated connection).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PgStore {
    async fn create_sync_run(&self, source_kind: &str, source_name: &str) -> Result<i64> {
        runs::create_sync_run(&self.pool, source_kind, source_name).await
    }

    async fn mark_sync_run_success(&self, run_id: i64, stats: &SyncStats) -> Result<()> {
        runs::mark_sync_run_success(&self.pool, run_id, stats).await
    }

    async fn fail_sync_run(
        &self,
        run_id: i64,
        status: RunStatus,
        message: &str,
        error_kind: &str,
    ) -> Result<()> {
        runs::fail_sync_run(&self.pool, run_id, status, message, error_kind).await
    }

    async fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRunRow>> {
        runs::get_sync_run(&self.pool, run_id).await
    }

    async fn list_recent_sync_runs(&self, limit: i64) -> Result<Vec<SyncRunRow>> {
        runs::list_recent_sync_runs(&self.pool, limit).await
    }

    async fn list_recent_finished_sync_runs_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        limit: i64,
    ) -> Result<Vec<FinishedRun>> {
        runs::list_recent_finished_sync_runs_by_source(&self.pool, source_kind, source_name, limit)
            .await
    }

    async fn list_recent_finished_sync_runs_for_sources(
        &self,
        sources: &[SourceRef],
        limit: i64,
    ) -> Result<HashMap<SourceRef, Vec<FinishedRun>>> {
        runs::list_recent_finished_sync_runs_for_sources(&self.pool, sources, limit).await
    }

    async fn list_connector_configs(&self) -> Result<Vec<ConnectorConfigRow>> {
        runs::list_connector_configs(&self.pool).await
    }

    async fn upsert_app_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppUserRecord],
    ) -> Result<u64> {
        ingest::upsert_app_users(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_entitlements_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[EntitlementRecord],
    ) -> Result<u64> {
        ingest::upsert_entitlements(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_app_assets_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppAssetRecord],
    ) -> Result<u64> {
        ingest::upsert_app_assets(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_asset_owners_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AssetOwnerRecord],
    ) -> Result<u64> {
        ingest::upsert_asset_owners(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_credential_artifacts_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[CredentialArtifactRecord],
    ) -> Result<u64> {
        ingest::upsert_credential_artifacts(&self.pool, source_kind, source_name, run_id, rows)
            .await
    }

    async fn upsert_discovery_sources_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoverySourceRecord],
    ) -> Result<u64> {
        ingest::upsert_discovery_sources(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_discovery_events_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoveryEventRecord],
    ) -> Result<u64> {
        ingest::upsert_discovery_events(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_idp_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpUserRecord],
    ) -> Result<u64> {
        ingest::upsert_idp_users(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_idp_groups_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpGroupRecord],
    ) -> Result<u64> {
        ingest::upsert_idp_groups(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_idp_apps_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAppRecord],
    ) -> Result<u64> {
        ingest::upsert_idp_apps(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn upsert_idp_assignments_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAssignmentRecord],
    ) -> Result<u64> {
        ingest::upsert_idp_assignments(&self.pool, source_kind, source_name, run_id, rows).await
    }

    async fn promote_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64> {
        ingest::promote_seen_in_run(&self.pool, class, run_id, source_kind, source_name).await
    }

    async fn expire_not_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64> {
        ingest::expire_not_seen_in_run(&self.pool, class, run_id, source_kind, source_name).await
    }

    async fn finalize_sync_run(
        &self,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
        classes: &[EntityClass],
        duration_ms: u64,
    ) -> Result<SyncStats> {
        ingest::finalize_sync_run(&self.pool, run_id, source_kind, source_name, classes, duration_ms)
            .await
    }

    async fn latest_discovery_event_observed_at(
        &self,
        source_kind: &str,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        ingest::latest_discovery_event_observed_at(&self.pool, source_kind, source_name).await
    }

    async fn try_acquire_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_instance_id: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool> {
        lease::try_acquire_sync_lock_lease(
            &self.pool,
            scope_kind,
            scope_name,
            holder_instance_id,
            holder_token,
            ttl_secs,
        )
        .await
    }

    async fn renew_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool> {
        lease::renew_sync_lock_lease(&self.pool, scope_kind, scope_name, holder_token, ttl_secs)
            .await
    }

    async fn release_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
    ) -> Result<()> {
        lease::release_sync_lock_lease(&self.pool, scope_kind, scope_name, holder_token).await
    }

    async fn notify(&self, channel: &str, payload: Option<&str>) -> Result<()> {
        lease::notify(&self.pool, channel, payload).await
    }

    async fn count_unlinked_accounts(&self) -> Result<i64> {
        identity::count_unlinked_accounts(&self.pool).await
    }

    async fn list_unlinked_accounts_page(&self, limit: i64) -> Result<Vec<UnlinkedAccount>> {
        identity::list_unlinked_accounts_page(&self.pool, limit).await
    }

    async fn get_preferred_identity_by_primary_email(
        &self,
        email: &str,
    ) -> Result<Option<IdentityRow>> {
        identity::get_preferred_identity_by_primary_email(&self.pool, email).await
    }

    async fn create_identity(
        &self,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<i64> {
        identity::create_identity(&self.pool, primary_email, display_name).await
    }

    async fn upsert_identity_account_link(
        &self,
        identity_id: i64,
        account: AccountRef,
        reason: &str,
    ) -> Result<bool> {
        identity::upsert_identity_account_link(&self.pool, identity_id, account, reason).await
    }

    async fn get_identity_account_link_by_account_id(
        &self,
        account: AccountRef,
    ) -> Result<Option<AccountLink>> {
        identity::get_identity_account_link_by_account_id(&self.pool, account).await
    }

    async fn list_authoritative_sources(&self) -> Result<Vec<SourceRef>> {
        identity::list_authoritative_sources(&self.pool).await
    }

    async fn list_identity_account_attributes(
        &self,
        identity_id: i64,
    ) -> Result<Vec<IdentityAccountAttributes>> {
        identity::list_identity_account_attributes(&self.pool, identity_id).await
    }

    async fn update_identity_attributes(
        &self,
        identity_id: i64,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()> {
        identity::update_identity_attributes(&self.pool, identity_id, primary_email, display_name)
            .await
    }

    async fn bulk_auto_link_by_email(&self, source_kind: &str, source_name: &str) -> Result<u64> {
        identity::bulk_auto_link_by_email(&self.pool, source_kind, source_name).await
    }
}
