//! The repository contract.
//!
//! `Store` is the only mutation path the sync core takes. The Postgres
//! implementation lives in this crate (`PgStore`); the in-memory test double
//! lives in `sspm-testkit`. Keyed lookups that can miss return `Option<_>`;
//! a missing row is a domain condition, not an error.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::types::*;

/// Full-mode resync trigger channel.
pub const CHANNEL_RESYNC_REQUESTED: &str = "open_sspm_resync_requested";
/// Discovery-mode resync trigger channel.
pub const CHANNEL_RESYNC_DISCOVERY_REQUESTED: &str = "open_sspm_resync_discovery_requested";

#[async_trait]
pub trait Store: Send + Sync {
    // -- sync runs ----------------------------------------------------------

    /// Insert a sync_run row in `running` state; returns its id.
    async fn create_sync_run(&self, source_kind: &str, source_name: &str) -> Result<i64>;

    /// Terminal transition `running -> success`, persisting stats.
    async fn mark_sync_run_success(&self, run_id: i64, stats: &SyncStats) -> Result<()>;

    /// Terminal transition `running -> error|canceled`.
    ///
    /// Must still succeed when the pass is being torn down: implementations
    /// bound the write internally (5s) instead of inheriting the caller's
    /// cancellation.
    async fn fail_sync_run(
        &self,
        run_id: i64,
        status: RunStatus,
        message: &str,
        error_kind: &str,
    ) -> Result<()>;

    async fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRunRow>>;

    /// Most recent runs across all sources, newest first.
    async fn list_recent_sync_runs(&self, limit: i64) -> Result<Vec<SyncRunRow>>;

    /// Finished-run history for one source, newest first, capped at `limit`.
    async fn list_recent_finished_sync_runs_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        limit: i64,
    ) -> Result<Vec<FinishedRun>>;

    /// Batched history fetch: one round trip, a capped recent window per
    /// source. Sources absent from the result have no finished runs.
    async fn list_recent_finished_sync_runs_for_sources(
        &self,
        sources: &[SourceRef],
        limit: i64,
    ) -> Result<HashMap<SourceRef, Vec<FinishedRun>>>;

    // -- connector configs --------------------------------------------------

    async fn list_connector_configs(&self) -> Result<Vec<ConnectorConfigRow>>;

    // -- bulk upserts (one transaction per call) ----------------------------

    async fn upsert_app_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppUserRecord],
    ) -> Result<u64>;

    async fn upsert_entitlements_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[EntitlementRecord],
    ) -> Result<u64>;

    async fn upsert_app_assets_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppAssetRecord],
    ) -> Result<u64>;

    async fn upsert_asset_owners_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AssetOwnerRecord],
    ) -> Result<u64>;

    async fn upsert_credential_artifacts_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[CredentialArtifactRecord],
    ) -> Result<u64>;

    async fn upsert_discovery_sources_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoverySourceRecord],
    ) -> Result<u64>;

    async fn upsert_discovery_events_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoveryEventRecord],
    ) -> Result<u64>;

    async fn upsert_idp_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpUserRecord],
    ) -> Result<u64>;

    async fn upsert_idp_groups_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpGroupRecord],
    ) -> Result<u64>;

    async fn upsert_idp_apps_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAppRecord],
    ) -> Result<u64>;

    async fn upsert_idp_assignments_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAssignmentRecord],
    ) -> Result<u64>;

    // -- promote / expire / finalize ---------------------------------------

    /// Stamp `last_observed_run_id = run_id` on rows seen in this run;
    /// returns the observed count.
    async fn promote_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64>;

    /// Soft-delete rows not observed by this run; returns the expired count.
    async fn expire_not_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64>;

    /// One transaction: promote + expire each touched class, then mark the
    /// run successful with the assembled stats. Rolls back on any failure.
    async fn finalize_sync_run(
        &self,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
        classes: &[EntityClass],
        duration_ms: u64,
    ) -> Result<SyncStats>;

    /// Latest `observed_at` across discovery events for one source.
    async fn latest_discovery_event_observed_at(
        &self,
        source_kind: &str,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>>;

    // -- lock leases --------------------------------------------------------

    /// Insert-or-replace a lease row. Acquirable iff absent, expired, or
    /// already held by `holder_token`. Returns whether the lease was taken.
    async fn try_acquire_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_instance_id: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool>;

    /// Extend a held lease. Predicated on `holder_token`; a stale holder
    /// gets `false` and must treat the lease as lost.
    async fn renew_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool>;

    /// Delete a held lease. Stale releases are no-ops.
    async fn release_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
    ) -> Result<()>;

    // -- notify -------------------------------------------------------------

    /// `pg_notify(channel, payload)`; empty payload means unscoped.
    async fn notify(&self, channel: &str, payload: Option<&str>) -> Result<()>;

    // -- identity -----------------------------------------------------------

    async fn count_unlinked_accounts(&self) -> Result<i64>;

    /// First page of live accounts with no identity link. The resolver links
    /// every returned account, so repeated first-page fetches drain the set.
    async fn list_unlinked_accounts_page(&self, limit: i64) -> Result<Vec<UnlinkedAccount>>;

    async fn get_preferred_identity_by_primary_email(
        &self,
        email: &str,
    ) -> Result<Option<IdentityRow>>;

    async fn create_identity(
        &self,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<i64>;

    /// Write or move a link. Links with `reason='manual'` are preserved
    /// verbatim; returns whether the link was written.
    async fn upsert_identity_account_link(
        &self,
        identity_id: i64,
        account: AccountRef,
        reason: &str,
    ) -> Result<bool>;

    async fn get_identity_account_link_by_account_id(
        &self,
        account: AccountRef,
    ) -> Result<Option<AccountLink>>;

    async fn list_authoritative_sources(&self) -> Result<Vec<SourceRef>>;

    async fn list_identity_account_attributes(
        &self,
        identity_id: i64,
    ) -> Result<Vec<IdentityAccountAttributes>>;

    async fn update_identity_attributes(
        &self,
        identity_id: i64,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()>;

    /// Single-statement auto-link: live app accounts of this source joined
    /// to identities on normalized email, reason `auto_email`, existing
    /// links untouched. Returns the number of new links.
    async fn bulk_auto_link_by_email(&self, source_kind: &str, source_name: &str) -> Result<u64>;
}
