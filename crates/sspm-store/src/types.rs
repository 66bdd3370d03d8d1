//! Row and record types shared by the repository contract.
//!
//! Ingest record types are the connector-facing shape of a bulk upsert: one
//! struct per row, serialized to parallel arrays at the SQL boundary (not at
//! call sites).

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Sync runs
// ---------------------------------------------------------------------------

/// Terminal and in-flight states of a sync_run row.
///
/// Lifecycle: created as `Running`, exactly one transition to `Success` or
/// `Error` / `Canceled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Success,
    Error,
    Canceled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Error => "error",
            RunStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "error" => Ok(RunStatus::Error),
            "canceled" => Ok(RunStatus::Canceled),
            other => Err(anyhow!("invalid sync run status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncRunRow {
    pub id: i64,
    pub source_kind: String,
    pub source_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub error_kind: Option<String>,
    pub stats: Value,
}

/// History projection consumed by the run policy: newest first, capped.
#[derive(Debug, Clone)]
pub struct FinishedRun {
    pub status: RunStatus,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A `(source_kind, source_name)` pair identifying one concrete tenant/org.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
}

impl SourceRef {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Run stats
// ---------------------------------------------------------------------------

/// Observed/expired row counts for one entity class within a run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseCounts {
    pub observed: u64,
    pub expired: u64,
}

/// `stats_json` payload persisted on a successful sync_run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStats {
    pub counts: BTreeMap<String, PhaseCounts>,
    pub duration_ms: u64,
}

impl SyncStats {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            counts: BTreeMap::new(),
            duration_ms,
        }
    }

    /// Serialize for persistence. Never emits `null`; an empty stats object
    /// round-trips as `{}` plus the duration.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }
}

// ---------------------------------------------------------------------------
// Entity classes
// ---------------------------------------------------------------------------

/// One soft-delete ingest table. Promote/expire and run stats are keyed by
/// this enum; bulk upserts are per-class typed calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityClass {
    AppUsers,
    Entitlements,
    AppAssets,
    AssetOwners,
    CredentialArtifacts,
    DiscoverySources,
    DiscoveryEvents,
    IdpUsers,
    IdpGroups,
    IdpApps,
    IdpAssignments,
}

impl EntityClass {
    pub const ALL: [EntityClass; 11] = [
        EntityClass::AppUsers,
        EntityClass::Entitlements,
        EntityClass::AppAssets,
        EntityClass::AssetOwners,
        EntityClass::CredentialArtifacts,
        EntityClass::DiscoverySources,
        EntityClass::DiscoveryEvents,
        EntityClass::IdpUsers,
        EntityClass::IdpGroups,
        EntityClass::IdpApps,
        EntityClass::IdpAssignments,
    ];

    /// Stable key used in `stats_json.counts` and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityClass::AppUsers => "app_users",
            EntityClass::Entitlements => "entitlements",
            EntityClass::AppAssets => "app_assets",
            EntityClass::AssetOwners => "asset_owners",
            EntityClass::CredentialArtifacts => "credential_artifacts",
            EntityClass::DiscoverySources => "discovery_sources",
            EntityClass::DiscoveryEvents => "discovery_events",
            EntityClass::IdpUsers => "idp_users",
            EntityClass::IdpGroups => "idp_groups",
            EntityClass::IdpApps => "idp_apps",
            EntityClass::IdpAssignments => "idp_assignments",
        }
    }

    /// Physical table name. Identical to `as_str` today; kept separate so a
    /// schema rename never leaks into stats keys.
    pub(crate) fn table(&self) -> &'static str {
        self.as_str()
    }
}

// ---------------------------------------------------------------------------
// Connector configs
// ---------------------------------------------------------------------------

/// One configured connector. `config` is opaque to the core; only the
/// connector definition decodes it.
#[derive(Debug, Clone)]
pub struct ConnectorConfigRow {
    pub kind: String,
    pub enabled: bool,
    pub config: Value,
}

// ---------------------------------------------------------------------------
// Ingest records (bulk upsert inputs)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppUserRecord {
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub is_admin: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntitlementRecord {
    /// Composite key computed by the driver; unique per source.
    pub external_id: String,
    pub account_external_id: String,
    pub resource: String,
    pub permission: String,
    /// `direct` or `group`.
    pub assignment_source: String,
    pub via_group: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppAssetRecord {
    pub external_id: String,
    pub name: String,
    pub asset_kind: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetOwnerRecord {
    pub external_id: String,
    pub asset_external_id: String,
    pub owner_email: String,
    pub owner_role: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CredentialArtifactRecord {
    pub external_id: String,
    pub name: String,
    pub artifact_kind: String,
    pub path: Option<String>,
    pub created_upstream_at: Option<DateTime<Utc>>,
    pub last_rotated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoverySourceRecord {
    /// Canonical key derived from app id + vendor/domain hints.
    pub external_id: String,
    pub display_name: String,
    pub vendor: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryEventRecord {
    pub external_id: String,
    pub source_external_id: String,
    pub actor_email: Option<String>,
    /// `signin` or `grant`.
    pub event_kind: String,
    pub observed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdpUserRecord {
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
    pub mfa_enrolled: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdpGroupRecord {
    pub external_id: String,
    pub display_name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdpAppRecord {
    pub external_id: String,
    pub display_name: String,
    pub vendor: Option<String>,
    pub sign_on_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdpAssignmentRecord {
    pub external_id: String,
    pub user_external_id: String,
    pub app_external_id: String,
    /// `direct` or `group`.
    pub assigned_via: String,
    pub group_external_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Which ingest table an account row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountClass {
    AppUser,
    IdpUser,
}

impl AccountClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountClass::AppUser => "app_user",
            AccountClass::IdpUser => "idp_user",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "app_user" => Ok(AccountClass::AppUser),
            "idp_user" => Ok(AccountClass::IdpUser),
            other => Err(anyhow!("invalid account class: {}", other)),
        }
    }
}

/// Stable reference to one account row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccountRef {
    pub class: AccountClass,
    pub id: i64,
}

/// A live account with no identity link yet.
#[derive(Debug, Clone)]
pub struct UnlinkedAccount {
    pub account: AccountRef,
    pub source_kind: String,
    pub source_name: String,
    pub external_id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IdentityRow {
    pub id: i64,
    pub primary_email: Option<String>,
    pub display_name: Option<String>,
}

/// Link reasons: `manual` links are operator-made and never overwritten.
pub const LINK_REASON_MANUAL: &str = "manual";
pub const LINK_REASON_AUTO_EMAIL: &str = "auto_email";
pub const LINK_REASON_AUTO_CREATE: &str = "auto_create";

#[derive(Debug, Clone)]
pub struct AccountLink {
    pub identity_id: i64,
    pub account: AccountRef,
    pub reason: String,
}

/// Attribute candidates for one linked account, used by the identity
/// resolver to pick canonical identity attributes.
#[derive(Debug, Clone)]
pub struct IdentityAccountAttributes {
    pub account: AccountRef,
    pub source_kind: String,
    pub source_name: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub is_authoritative: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trip() {
        for st in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::Error,
            RunStatus::Canceled,
        ] {
            assert_eq!(RunStatus::parse(st.as_str()).unwrap(), st);
        }
        assert!(RunStatus::parse("SUCCESS").is_err());
    }

    #[test]
    fn stats_serialize_shape() {
        let mut stats = SyncStats::new(1234);
        stats.counts.insert(
            "app_users".to_string(),
            PhaseCounts {
                observed: 10,
                expired: 2,
            },
        );
        let v = stats.to_json();
        assert_eq!(v["duration_ms"], 1234);
        assert_eq!(v["counts"]["app_users"]["observed"], 10);
        assert_eq!(v["counts"]["app_users"]["expired"], 2);
    }

    #[test]
    fn empty_stats_has_no_null() {
        let v = SyncStats::new(0).to_json();
        assert_eq!(v["counts"], serde_json::json!({}));
    }

    #[test]
    fn entity_class_keys_are_distinct() {
        let mut seen = std::collections::HashSet::new();
        for c in EntityClass::ALL {
            assert!(seen.insert(c.as_str()));
        }
        assert_eq!(seen.len(), 11);
    }

    #[test]
    fn account_class_round_trip() {
        assert_eq!(
            AccountClass::parse("app_user").unwrap(),
            AccountClass::AppUser
        );
        assert_eq!(
            AccountClass::parse("idp_user").unwrap(),
            AccountClass::IdpUser
        );
        assert!(AccountClass::parse("user").is_err());
    }
}
