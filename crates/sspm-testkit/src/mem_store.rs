//! In-memory [`Store`] with the same observable semantics as the Postgres
//! implementation: seen/promote/expire lifecycle, token-predicated leases,
//! manual-link preservation. Backs the scenario tests that need no database.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use sspm_store::*;

type Key = (String, String, String);

#[derive(Debug, Clone)]
pub struct MemEntity<T> {
    pub id: i64,
    pub record: T,
    pub seen_in_run_id: Option<i64>,
    pub last_observed_run_id: Option<i64>,
    pub expired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct MemLease {
    holder_instance_id: String,
    holder_token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    sync_runs: BTreeMap<i64, SyncRunRow>,
    connector_configs: Vec<ConnectorConfigRow>,

    app_users: HashMap<Key, MemEntity<AppUserRecord>>,
    entitlements: HashMap<Key, MemEntity<EntitlementRecord>>,
    app_assets: HashMap<Key, MemEntity<AppAssetRecord>>,
    asset_owners: HashMap<Key, MemEntity<AssetOwnerRecord>>,
    credential_artifacts: HashMap<Key, MemEntity<CredentialArtifactRecord>>,
    discovery_sources: HashMap<Key, MemEntity<DiscoverySourceRecord>>,
    discovery_events: HashMap<Key, MemEntity<DiscoveryEventRecord>>,
    idp_users: HashMap<Key, MemEntity<IdpUserRecord>>,
    idp_groups: HashMap<Key, MemEntity<IdpGroupRecord>>,
    idp_apps: HashMap<Key, MemEntity<IdpAppRecord>>,
    idp_assignments: HashMap<Key, MemEntity<IdpAssignmentRecord>>,

    leases: HashMap<(String, String), MemLease>,
    notifications: Vec<(String, String)>,

    identities: BTreeMap<i64, IdentityRow>,
    links: HashMap<(&'static str, i64), AccountLink>,
    authoritative: Vec<SourceRef>,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Thread-safe in-memory store. Clone-free: share via `Arc`.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

fn key(kind: &str, name: &str, external_id: &str) -> Key {
    (kind.to_string(), name.to_string(), external_id.to_string())
}

fn upsert_into<T: Clone>(
    inner_next_id: &mut dyn FnMut() -> i64,
    map: &mut HashMap<Key, MemEntity<T>>,
    kind: &str,
    name: &str,
    run_id: i64,
    rows: Vec<(String, T)>,
) -> u64 {
    let mut affected = 0;
    for (external_id, record) in rows {
        let k = key(kind, name, &external_id);
        match map.get_mut(&k) {
            Some(existing) => {
                existing.record = record;
                existing.seen_in_run_id = Some(run_id);
            }
            None => {
                let id = inner_next_id();
                map.insert(
                    k,
                    MemEntity {
                        id,
                        record,
                        seen_in_run_id: Some(run_id),
                        last_observed_run_id: None,
                        expired_at: None,
                    },
                );
            }
        }
        affected += 1;
    }
    affected
}

fn promote_in<T>(
    map: &mut HashMap<Key, MemEntity<T>>,
    run_id: i64,
    kind: &str,
    name: &str,
) -> u64 {
    let mut n = 0;
    for (k, row) in map.iter_mut() {
        if k.0 == kind && k.1 == name && row.seen_in_run_id == Some(run_id) {
            row.last_observed_run_id = Some(run_id);
            row.expired_at = None;
            n += 1;
        }
    }
    n
}

fn expire_in<T>(
    map: &mut HashMap<Key, MemEntity<T>>,
    run_id: i64,
    kind: &str,
    name: &str,
) -> u64 {
    let mut n = 0;
    let now = Utc::now();
    for (k, row) in map.iter_mut() {
        if k.0 == kind
            && k.1 == name
            && row.expired_at.is_none()
            && row.last_observed_run_id.map_or(true, |lo| lo < run_id)
        {
            row.expired_at = Some(now);
            n += 1;
        }
    }
    n
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- seeding / inspection helpers (test-facing) -------------------------

    pub fn set_connector_config(&self, kind: &str, enabled: bool, config: serde_json::Value) {
        let mut inner = self.inner.lock().unwrap();
        inner.connector_configs.retain(|c| c.kind != kind);
        inner.connector_configs.push(ConnectorConfigRow {
            kind: kind.to_string(),
            enabled,
            config,
        });
    }

    pub fn add_authoritative_source(&self, kind: &str, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .authoritative
            .push(SourceRef::new(kind, name));
    }

    pub fn sync_runs(&self) -> Vec<SyncRunRow> {
        self.inner.lock().unwrap().sync_runs.values().cloned().collect()
    }

    pub fn notifications(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().notifications.clone()
    }

    pub fn app_users_snapshot(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<MemEntity<AppUserRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .app_users
            .iter()
            .filter(|(k, _)| k.0 == kind && k.1 == name)
            .map(|(_, v)| v.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn idp_users_snapshot(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<MemEntity<IdpUserRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .idp_users
            .iter()
            .filter(|(k, _)| k.0 == kind && k.1 == name)
            .map(|(_, v)| v.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn entitlements_snapshot(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<MemEntity<EntitlementRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .entitlements
            .iter()
            .filter(|(k, _)| k.0 == kind && k.1 == name)
            .map(|(_, v)| v.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn credential_artifacts_snapshot(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<MemEntity<CredentialArtifactRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .credential_artifacts
            .iter()
            .filter(|(k, _)| k.0 == kind && k.1 == name)
            .map(|(_, v)| v.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn discovery_events_snapshot(
        &self,
        kind: &str,
        name: &str,
    ) -> Vec<MemEntity<DiscoveryEventRecord>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .discovery_events
            .iter()
            .filter(|(k, _)| k.0 == kind && k.1 == name)
            .map(|(_, v)| v.clone())
            .collect();
        rows.sort_by_key(|r| r.id);
        rows
    }

    pub fn identities_snapshot(&self) -> Vec<IdentityRow> {
        self.inner.lock().unwrap().identities.values().cloned().collect()
    }

    pub fn links_snapshot(&self) -> Vec<AccountLink> {
        let mut links: Vec<_> = self.inner.lock().unwrap().links.values().cloned().collect();
        links.sort_by_key(|l| (l.account.class.as_str(), l.account.id));
        links
    }

    /// Hand a lease to a different holder, as if another worker stole it
    /// after expiry. Subsequent renews by the old holder fail.
    pub fn steal_lease(&self, scope_kind: &str, scope_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(lease) = inner
            .leases
            .get_mut(&(scope_kind.to_string(), scope_name.to_string()))
        {
            lease.holder_token = Uuid::new_v4();
            lease.holder_instance_id = "thief".to_string();
            lease.expires_at = Utc::now() + chrono::Duration::seconds(3600);
        }
    }

    pub fn lease_holder(&self, scope_kind: &str, scope_name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .leases
            .get(&(scope_kind.to_string(), scope_name.to_string()))
            .map(|l| l.holder_instance_id.clone())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_sync_run(&self, source_kind: &str, source_name: &str) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.sync_runs.insert(
            id,
            SyncRunRow {
                id,
                source_kind: source_kind.to_string(),
                source_name: source_name.to_string(),
                status: RunStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
                message: None,
                error_kind: None,
                stats: serde_json::json!({}),
            },
        );
        Ok(id)
    }

    async fn mark_sync_run_success(&self, run_id: i64, stats: &SyncStats) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.sync_runs.get_mut(&run_id) {
            if run.status == RunStatus::Running {
                run.status = RunStatus::Success;
                run.finished_at = Some(Utc::now());
                run.stats = stats.to_json();
            }
        }
        Ok(())
    }

    async fn fail_sync_run(
        &self,
        run_id: i64,
        status: RunStatus,
        message: &str,
        error_kind: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(run) = inner.sync_runs.get_mut(&run_id) {
            if run.status == RunStatus::Running {
                run.status = status;
                run.finished_at = Some(Utc::now());
                run.message = Some(message.to_string());
                run.error_kind = Some(error_kind.to_string());
            }
        }
        Ok(())
    }

    async fn get_sync_run(&self, run_id: i64) -> Result<Option<SyncRunRow>> {
        Ok(self.inner.lock().unwrap().sync_runs.get(&run_id).cloned())
    }

    async fn list_recent_sync_runs(&self, limit: i64) -> Result<Vec<SyncRunRow>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<_> = inner.sync_runs.values().cloned().collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.started_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn list_recent_finished_sync_runs_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        limit: i64,
    ) -> Result<Vec<FinishedRun>> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<_> = inner
            .sync_runs
            .values()
            .filter(|r| {
                r.source_kind == source_kind
                    && r.source_name == source_name
                    && r.status != RunStatus::Running
            })
            .map(|r| FinishedRun {
                status: r.status,
                finished_at: r.finished_at,
            })
            .collect();
        runs.sort_by_key(|r| std::cmp::Reverse(r.finished_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn list_recent_finished_sync_runs_for_sources(
        &self,
        sources: &[SourceRef],
        limit: i64,
    ) -> Result<HashMap<SourceRef, Vec<FinishedRun>>> {
        let mut out = HashMap::new();
        for source in sources {
            let history = self
                .list_recent_finished_sync_runs_by_source(&source.kind, &source.name, limit)
                .await?;
            if !history.is_empty() {
                out.insert(source.clone(), history);
            }
        }
        Ok(out)
    }

    async fn list_connector_configs(&self) -> Result<Vec<ConnectorConfigRow>> {
        let mut configs = self.inner.lock().unwrap().connector_configs.clone();
        configs.sort_by(|a, b| a.kind.cmp(&b.kind));
        Ok(configs)
    }

    async fn upsert_app_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppUserRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut app_users,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            app_users,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_entitlements_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[EntitlementRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut entitlements,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            entitlements,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_app_assets_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AppAssetRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut app_assets,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            app_assets,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_asset_owners_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[AssetOwnerRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut asset_owners,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            asset_owners,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_credential_artifacts_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[CredentialArtifactRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut credential_artifacts,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            credential_artifacts,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_discovery_sources_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoverySourceRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut discovery_sources,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            discovery_sources,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_discovery_events_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[DiscoveryEventRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut discovery_events,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            discovery_events,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_idp_users_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpUserRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut idp_users,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            idp_users,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_idp_groups_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpGroupRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut idp_groups,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            idp_groups,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_idp_apps_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAppRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut idp_apps,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            idp_apps,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn upsert_idp_assignments_bulk_by_source(
        &self,
        source_kind: &str,
        source_name: &str,
        run_id: i64,
        rows: &[IdpAssignmentRecord],
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref mut next_id,
            ref mut idp_assignments,
            ..
        } = *inner;
        let mut fresh = || {
            *next_id += 1;
            *next_id
        };
        Ok(upsert_into(
            &mut fresh,
            idp_assignments,
            source_kind,
            source_name,
            run_id,
            rows.iter()
                .map(|r| (r.external_id.clone(), r.clone()))
                .collect(),
        ))
    }

    async fn promote_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(match class {
            EntityClass::AppUsers => promote_in(&mut inner.app_users, run_id, source_kind, source_name),
            EntityClass::Entitlements => promote_in(&mut inner.entitlements, run_id, source_kind, source_name),
            EntityClass::AppAssets => promote_in(&mut inner.app_assets, run_id, source_kind, source_name),
            EntityClass::AssetOwners => promote_in(&mut inner.asset_owners, run_id, source_kind, source_name),
            EntityClass::CredentialArtifacts => promote_in(&mut inner.credential_artifacts, run_id, source_kind, source_name),
            EntityClass::DiscoverySources => promote_in(&mut inner.discovery_sources, run_id, source_kind, source_name),
            EntityClass::DiscoveryEvents => promote_in(&mut inner.discovery_events, run_id, source_kind, source_name),
            EntityClass::IdpUsers => promote_in(&mut inner.idp_users, run_id, source_kind, source_name),
            EntityClass::IdpGroups => promote_in(&mut inner.idp_groups, run_id, source_kind, source_name),
            EntityClass::IdpApps => promote_in(&mut inner.idp_apps, run_id, source_kind, source_name),
            EntityClass::IdpAssignments => promote_in(&mut inner.idp_assignments, run_id, source_kind, source_name),
        })
    }

    async fn expire_not_seen_in_run(
        &self,
        class: EntityClass,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        Ok(match class {
            EntityClass::AppUsers => expire_in(&mut inner.app_users, run_id, source_kind, source_name),
            EntityClass::Entitlements => expire_in(&mut inner.entitlements, run_id, source_kind, source_name),
            EntityClass::AppAssets => expire_in(&mut inner.app_assets, run_id, source_kind, source_name),
            EntityClass::AssetOwners => expire_in(&mut inner.asset_owners, run_id, source_kind, source_name),
            EntityClass::CredentialArtifacts => expire_in(&mut inner.credential_artifacts, run_id, source_kind, source_name),
            EntityClass::DiscoverySources => expire_in(&mut inner.discovery_sources, run_id, source_kind, source_name),
            EntityClass::DiscoveryEvents => expire_in(&mut inner.discovery_events, run_id, source_kind, source_name),
            EntityClass::IdpUsers => expire_in(&mut inner.idp_users, run_id, source_kind, source_name),
            EntityClass::IdpGroups => expire_in(&mut inner.idp_groups, run_id, source_kind, source_name),
            EntityClass::IdpApps => expire_in(&mut inner.idp_apps, run_id, source_kind, source_name),
            EntityClass::IdpAssignments => expire_in(&mut inner.idp_assignments, run_id, source_kind, source_name),
        })
    }

    async fn finalize_sync_run(
        &self,
        run_id: i64,
        source_kind: &str,
        source_name: &str,
        classes: &[EntityClass],
        duration_ms: u64,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::new(duration_ms);
        for class in classes {
            let observed = self
                .promote_seen_in_run(*class, run_id, source_kind, source_name)
                .await?;
            let expired = self
                .expire_not_seen_in_run(*class, run_id, source_kind, source_name)
                .await?;
            stats
                .counts
                .insert(class.as_str().to_string(), PhaseCounts { observed, expired });
        }
        self.mark_sync_run_success(run_id, &stats).await?;
        Ok(stats)
    }

    async fn latest_discovery_event_observed_at(
        &self,
        source_kind: &str,
        source_name: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .discovery_events
            .iter()
            .filter(|(k, _)| k.0 == source_kind && k.1 == source_name)
            .filter_map(|(_, v)| v.record.observed_at)
            .max())
    }

    async fn try_acquire_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_instance_id: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let k = (scope_kind.to_string(), scope_name.to_string());
        let acquirable = match inner.leases.get(&k) {
            None => true,
            Some(lease) => lease.expires_at < now || lease.holder_token == holder_token,
        };
        if !acquirable {
            return Ok(false);
        }
        inner.leases.insert(
            k,
            MemLease {
                holder_instance_id: holder_instance_id.to_string(),
                holder_token,
                expires_at: now + chrono::Duration::seconds(ttl_secs),
            },
        );
        Ok(true)
    }

    async fn renew_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
        ttl_secs: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let k = (scope_kind.to_string(), scope_name.to_string());
        match inner.leases.get_mut(&k) {
            Some(lease) if lease.holder_token == holder_token => {
                lease.expires_at = Utc::now() + chrono::Duration::seconds(ttl_secs);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_sync_lock_lease(
        &self,
        scope_kind: &str,
        scope_name: &str,
        holder_token: Uuid,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let k = (scope_kind.to_string(), scope_name.to_string());
        if inner
            .leases
            .get(&k)
            .is_some_and(|l| l.holder_token == holder_token)
        {
            inner.leases.remove(&k);
        }
        Ok(())
    }

    async fn notify(&self, channel: &str, payload: Option<&str>) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .notifications
            .push((channel.to_string(), payload.unwrap_or("").to_string()));
        Ok(())
    }

    async fn count_unlinked_accounts(&self) -> Result<i64> {
        Ok(self.unlinked_accounts(i64::MAX).len() as i64)
    }

    async fn list_unlinked_accounts_page(&self, limit: i64) -> Result<Vec<UnlinkedAccount>> {
        Ok(self.unlinked_accounts(limit))
    }

    async fn get_preferred_identity_by_primary_email(
        &self,
        email: &str,
    ) -> Result<Option<IdentityRow>> {
        let needle = email.trim().to_lowercase();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .identities
            .values()
            .find(|i| i.primary_email.as_deref() == Some(needle.as_str()))
            .cloned())
    }

    async fn create_identity(
        &self,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id();
        inner.identities.insert(
            id,
            IdentityRow {
                id,
                primary_email: primary_email.map(|e| e.trim().to_lowercase()),
                display_name: display_name.map(str::to_string),
            },
        );
        Ok(id)
    }

    async fn upsert_identity_account_link(
        &self,
        identity_id: i64,
        account: AccountRef,
        reason: &str,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let k = (account.class.as_str(), account.id);
        if let Some(existing) = inner.links.get(&k) {
            if existing.reason == LINK_REASON_MANUAL {
                return Ok(false);
            }
        }
        inner.links.insert(
            k,
            AccountLink {
                identity_id,
                account,
                reason: reason.to_string(),
            },
        );
        Ok(true)
    }

    async fn get_identity_account_link_by_account_id(
        &self,
        account: AccountRef,
    ) -> Result<Option<AccountLink>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.links.get(&(account.class.as_str(), account.id)).cloned())
    }

    async fn list_authoritative_sources(&self) -> Result<Vec<SourceRef>> {
        Ok(self.inner.lock().unwrap().authoritative.clone())
    }

    async fn list_identity_account_attributes(
        &self,
        identity_id: i64,
    ) -> Result<Vec<IdentityAccountAttributes>> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();
        for link in inner.links.values().filter(|l| l.identity_id == identity_id) {
            let attrs = match link.account.class {
                AccountClass::AppUser => inner
                    .app_users
                    .iter()
                    .find(|(_, v)| v.id == link.account.id)
                    .map(|(k, v)| (k.clone(), v.record.email.clone(), v.record.display_name.clone())),
                AccountClass::IdpUser => inner
                    .idp_users
                    .iter()
                    .find(|(_, v)| v.id == link.account.id)
                    .map(|(k, v)| (k.clone(), v.record.email.clone(), v.record.display_name.clone())),
            };
            let Some(((kind, name, _), email, display_name)) = attrs else {
                continue;
            };
            let is_authoritative = inner
                .authoritative
                .iter()
                .any(|s| s.kind == kind && s.name == name);
            out.push(IdentityAccountAttributes {
                account: link.account,
                source_kind: kind,
                source_name: name,
                email,
                display_name,
                is_authoritative,
            });
        }
        out.sort_by_key(|a| (a.account.class.as_str(), a.account.id));
        Ok(out)
    }

    async fn update_identity_attributes(
        &self,
        identity_id: i64,
        primary_email: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let identity = inner
            .identities
            .get_mut(&identity_id)
            .ok_or_else(|| anyhow!("identity {identity_id} not found"))?;
        identity.primary_email = primary_email.map(|e| e.trim().to_lowercase());
        identity.display_name = display_name.map(str::to_string);
        Ok(())
    }

    async fn bulk_auto_link_by_email(&self, source_kind: &str, source_name: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let Inner {
            ref app_users,
            ref identities,
            ref mut links,
            ..
        } = *inner;

        let mut linked = 0;
        for (k, user) in app_users.iter() {
            if k.0 != source_kind || k.1 != source_name || user.expired_at.is_some() {
                continue;
            }
            let Some(email) = user.record.email.as_deref() else {
                continue;
            };
            let email = email.trim().to_lowercase();
            if email.is_empty() {
                continue;
            }
            let Some(identity) = identities
                .values()
                .find(|i| i.primary_email.as_deref() == Some(email.as_str()))
            else {
                continue;
            };
            let link_key = (AccountClass::AppUser.as_str(), user.id);
            if links.contains_key(&link_key) {
                continue;
            }
            links.insert(
                link_key,
                AccountLink {
                    identity_id: identity.id,
                    account: AccountRef {
                        class: AccountClass::AppUser,
                        id: user.id,
                    },
                    reason: LINK_REASON_AUTO_EMAIL.to_string(),
                },
            );
            linked += 1;
        }
        Ok(linked)
    }
}

impl MemStore {
    fn unlinked_accounts(&self, limit: i64) -> Vec<UnlinkedAccount> {
        let inner = self.inner.lock().unwrap();
        let mut out = Vec::new();

        for (k, user) in inner.app_users.iter() {
            if user.expired_at.is_some()
                || inner
                    .links
                    .contains_key(&(AccountClass::AppUser.as_str(), user.id))
            {
                continue;
            }
            out.push(UnlinkedAccount {
                account: AccountRef {
                    class: AccountClass::AppUser,
                    id: user.id,
                },
                source_kind: k.0.clone(),
                source_name: k.1.clone(),
                external_id: k.2.clone(),
                email: user.record.email.clone(),
                display_name: user.record.display_name.clone(),
            });
        }
        for (k, user) in inner.idp_users.iter() {
            if user.expired_at.is_some()
                || inner
                    .links
                    .contains_key(&(AccountClass::IdpUser.as_str(), user.id))
            {
                continue;
            }
            out.push(UnlinkedAccount {
                account: AccountRef {
                    class: AccountClass::IdpUser,
                    id: user.id,
                },
                source_kind: k.0.clone(),
                source_name: k.1.clone(),
                external_id: k.2.clone(),
                email: user.record.email.clone(),
                display_name: user.record.display_name.clone(),
            });
        }

        out.sort_by_key(|a| (a.account.class.as_str(), a.account.id));
        out.truncate(limit.max(0) as usize);
        out
    }
}
