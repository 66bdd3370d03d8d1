//! Okta connector: directory sync (users, groups, apps, assignments) in
//! full mode, system-log sources/events in discovery mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;

use sspm_store::{
    DiscoveryEventRecord, DiscoverySourceRecord, EntityClass, IdpAppRecord, IdpAssignmentRecord,
    IdpGroupRecord, IdpUserRecord, Store,
};
use sspm_sync::{
    normalize_email, ConnectorDefinition, Event, Integration, IntegrationDeps, Role, RunMode,
    UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{check_cancel, RunLifecycle, TagErr, EVENT_BATCH, USER_BATCH};
use crate::Page;

const PAGE_LIMIT_USERS: usize = 200;
const PAGE_LIMIT_LOGS: usize = 1000;
/// Safety margin subtracted from the discovery watermark so late-arriving
/// log entries are not skipped.
const WATERMARK_MARGIN_MINUTES: i64 = 15;
/// First discovery run looks back this far.
const DISCOVERY_INITIAL_LOOKBACK_DAYS: i64 = 7;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OktaConfig {
    pub domain: String,
    pub api_token: String,
}

impl OktaConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: OktaConfig =
            serde_json::from_value(raw.clone()).context("decoding okta config failed")?;
        cfg.domain = cfg
            .domain
            .trim()
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_lowercase();
        cfg.api_token = cfg.api_token.trim().to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(anyhow!("okta config: domain is required"));
        }
        if self.api_token.is_empty() {
            return Err(anyhow!("okta config: api_token is required"));
        }
        Ok(())
    }
}

pub struct OktaDefinition;

impl ConnectorDefinition for OktaDefinition {
    fn kind(&self) -> &'static str {
        "okta"
    }

    fn display_name(&self) -> &'static str {
        "Okta"
    }

    fn role(&self) -> Role {
        Role::Idp
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        OktaConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = OktaConfig::decode(config)?;
        let api = Arc::new(OktaHttp::new(&cfg)?);
        Ok(Box::new(OktaIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OktaUser {
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OktaGroup {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OktaApp {
    pub id: String,
    pub label: String,
    pub sign_on_mode: Option<String>,
}

/// One assigned principal on an app: scope `USER` (direct) or `GROUP`.
#[derive(Debug, Clone)]
pub struct OktaAppAssignment {
    pub user_id: String,
    pub scope: String,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OktaLogEvent {
    pub uuid: String,
    pub event_type: String,
    pub published: Option<DateTime<Utc>>,
    pub actor_email: Option<String>,
    pub app_id: Option<String>,
    pub app_label: Option<String>,
}

#[async_trait]
pub trait OktaApi: Send + Sync {
    async fn list_users(&self, after: Option<&str>) -> Result<Page<OktaUser>>;
    async fn list_groups(&self, after: Option<&str>) -> Result<Page<OktaGroup>>;
    async fn list_apps(&self, after: Option<&str>) -> Result<Page<OktaApp>>;
    async fn list_app_assignments(
        &self,
        app_id: &str,
        after: Option<&str>,
    ) -> Result<Page<OktaAppAssignment>>;
    async fn list_system_log(
        &self,
        since: DateTime<Utc>,
        after: Option<&str>,
    ) -> Result<Page<OktaLogEvent>>;
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct OktaIntegration {
    cfg: OktaConfig,
    api: Arc<dyn OktaApi>,
}

impl OktaIntegration {
    pub fn new(cfg: OktaConfig, api: Arc<dyn OktaApi>) -> Self {
        Self { cfg, api }
    }

    async fn sync_full(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        self.sync_users(deps, run).await?;
        self.sync_groups(deps, run).await?;
        let app_ids = self.sync_apps(deps, run).await?;
        self.sync_assignments(deps, run, &app_ids).await?;
        Ok(())
    }

    async fn sync_users(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut after: Option<String> = None;
        let mut batch: Vec<IdpUserRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_users(after.as_deref()).await.tag_api()?;

            for user in page.items {
                let external_id = user.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                seen += 1;
                batch.push(IdpUserRecord {
                    external_id,
                    email: user.email.as_deref().and_then(normalize_email),
                    display_name: user.display_name,
                    status: user.status,
                    mfa_enrolled: false,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_idp_users_bulk_by_source(
                            "okta",
                            self.name(),
                            run.run_id(),
                            &batch,
                        )
                        .await
                        .tag_db()?;
                    batch.clear();
                }
            }

            run.emit("list-users", seen, UNKNOWN_TOTAL);
            match page.next {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }

        if !batch.is_empty() {
            deps.store
                .upsert_idp_users_bulk_by_source("okta", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::IdpUsers);
        Ok(())
    }

    async fn sync_groups(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut after: Option<String> = None;
        let mut batch: Vec<IdpGroupRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_groups(after.as_deref()).await.tag_api()?;
            for group in page.items {
                let external_id = group.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                seen += 1;
                batch.push(IdpGroupRecord {
                    external_id,
                    display_name: group.name,
                    description: group.description,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_idp_groups_bulk_by_source(
                            "okta",
                            self.name(),
                            run.run_id(),
                            &batch,
                        )
                        .await
                        .tag_db()?;
                    batch.clear();
                }
            }
            run.emit("list-groups", seen, UNKNOWN_TOTAL);
            match page.next {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }

        if !batch.is_empty() {
            deps.store
                .upsert_idp_groups_bulk_by_source("okta", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::IdpGroups);
        Ok(())
    }

    async fn sync_apps(
        &self,
        deps: &IntegrationDeps,
        run: &mut RunLifecycle,
    ) -> Result<Vec<String>> {
        let mut after: Option<String> = None;
        let mut batch: Vec<IdpAppRecord> = Vec::new();
        let mut app_ids: Vec<String> = Vec::new();

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_apps(after.as_deref()).await.tag_api()?;
            for app in page.items {
                let external_id = app.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                app_ids.push(external_id.clone());
                batch.push(IdpAppRecord {
                    external_id,
                    display_name: app.label,
                    vendor: None,
                    sign_on_mode: app.sign_on_mode,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_idp_apps_bulk_by_source("okta", self.name(), run.run_id(), &batch)
                        .await
                        .tag_db()?;
                    batch.clear();
                }
            }
            run.emit("list-apps", app_ids.len() as i64, UNKNOWN_TOTAL);
            match page.next {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }

        if !batch.is_empty() {
            deps.store
                .upsert_idp_apps_bulk_by_source("okta", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::IdpApps);
        Ok(app_ids)
    }

    async fn sync_assignments(
        &self,
        deps: &IntegrationDeps,
        run: &mut RunLifecycle,
        app_ids: &[String],
    ) -> Result<()> {
        let total = app_ids.len() as i64;
        let mut batch: Vec<IdpAssignmentRecord> = Vec::new();

        for (idx, app_id) in app_ids.iter().enumerate() {
            check_cancel(&deps.cancel)?;
            let mut after: Option<String> = None;
            loop {
                let page = self
                    .api
                    .list_app_assignments(app_id, after.as_deref())
                    .await
                    .tag_api()?;
                for assignment in page.items {
                    let user_id = assignment.user_id.trim().to_string();
                    if user_id.is_empty() {
                        continue;
                    }
                    let assigned_via = if assignment.scope.eq_ignore_ascii_case("group") {
                        "group"
                    } else {
                        "direct"
                    };
                    batch.push(IdpAssignmentRecord {
                        external_id: format!("{app_id}/{user_id}"),
                        user_external_id: user_id,
                        app_external_id: app_id.clone(),
                        assigned_via: assigned_via.to_string(),
                        group_external_id: assignment.group_id,
                    });
                    if batch.len() >= USER_BATCH {
                        deps.store
                            .upsert_idp_assignments_bulk_by_source(
                                "okta",
                                self.name(),
                                run.run_id(),
                                &batch,
                            )
                            .await
                            .tag_db()?;
                        batch.clear();
                    }
                }
                match page.next {
                    Some(next) if !next.is_empty() => after = Some(next),
                    _ => break,
                }
            }
            run.emit("list-assignments", idx as i64 + 1, total);
        }

        if !batch.is_empty() {
            deps.store
                .upsert_idp_assignments_bulk_by_source("okta", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::IdpAssignments);
        Ok(())
    }

    async fn sync_discovery(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let watermark = deps
            .store
            .latest_discovery_event_observed_at(run.source_kind(), self.name())
            .await
            .tag_db()?;
        let since = discovery_since(watermark, Utc::now());

        let mut after: Option<String> = None;
        let mut sources: BTreeMap<String, DiscoverySourceRecord> = BTreeMap::new();
        let mut events: Vec<DiscoveryEventRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self
                .api
                .list_system_log(since, after.as_deref())
                .await
                .tag_api()?;

            for log in page.items {
                let Some(kind) = discovery_event_kind(&log.event_type) else {
                    continue;
                };
                let Some(app_id) = log.app_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
                else {
                    continue;
                };
                let source_key = canonical_source_key(app_id, log.app_label.as_deref());

                sources
                    .entry(source_key.clone())
                    .or_insert_with(|| DiscoverySourceRecord {
                        external_id: source_key.clone(),
                        display_name: log
                            .app_label
                            .clone()
                            .unwrap_or_else(|| app_id.to_string()),
                        vendor: None,
                        category: Some("sso_app".to_string()),
                    });

                if log.uuid.trim().is_empty() {
                    continue;
                }
                seen += 1;
                events.push(DiscoveryEventRecord {
                    external_id: log.uuid,
                    source_external_id: source_key,
                    actor_email: log.actor_email.as_deref().and_then(normalize_email),
                    event_kind: kind.to_string(),
                    observed_at: log.published,
                });
            }

            run.emit("list-discovery-events", seen, UNKNOWN_TOTAL);
            match page.next {
                Some(next) if !next.is_empty() => after = Some(next),
                _ => break,
            }
        }

        let source_rows: Vec<DiscoverySourceRecord> = sources.into_values().collect();
        for chunk in source_rows.chunks(EVENT_BATCH) {
            deps.store
                .upsert_discovery_sources_bulk_by_source(
                    run.source_kind(),
                    self.name(),
                    run.run_id(),
                    chunk,
                )
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::DiscoverySources);

        for chunk in events.chunks(EVENT_BATCH) {
            deps.store
                .upsert_discovery_events_bulk_by_source(
                    run.source_kind(),
                    self.name(),
                    run.run_id(),
                    chunk,
                )
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::DiscoveryEvents);
        Ok(())
    }
}

#[async_trait]
impl Integration for OktaIntegration {
    fn kind(&self) -> &str {
        "okta"
    }

    fn name(&self) -> &str {
        &self.cfg.domain
    }

    fn role(&self) -> Role {
        Role::Idp
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("okta/{}", self.cfg.domain);
        vec![
            Event::progress(source.clone(), "list-users", 0, UNKNOWN_TOTAL),
            Event::progress(source.clone(), "list-groups", 0, UNKNOWN_TOTAL),
            Event::progress(source.clone(), "list-apps", 0, UNKNOWN_TOTAL),
            Event::progress(source, "list-assignments", 0, UNKNOWN_TOTAL),
        ]
    }

    fn supports_run_mode(&self, _mode: RunMode) -> bool {
        true
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let res = match deps.mode {
            RunMode::Full => self.sync_full(deps, &mut run).await,
            RunMode::Discovery => self.sync_discovery(deps, &mut run).await,
        };
        match res {
            Ok(()) => {
                run.finalize().await?;
                Ok(())
            }
            Err(err) => {
                run.record_failure(&err).await;
                Err(err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Discovery normalization
// ---------------------------------------------------------------------------

pub(crate) fn discovery_since(
    watermark: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match watermark {
        Some(w) => w - ChronoDuration::minutes(WATERMARK_MARGIN_MINUTES),
        None => now - ChronoDuration::days(DISCOVERY_INITIAL_LOOKBACK_DAYS),
    }
}

fn discovery_event_kind(event_type: &str) -> Option<&'static str> {
    match event_type {
        "user.authentication.sso" => Some("signin"),
        "application.user_membership.add" | "app.oauth2.as.consent.grant" => Some("grant"),
        _ => None,
    }
}

/// Canonical discovery-source key: app id plus a lowercased label hint, so
/// the same app observed under cosmetic label changes keys identically.
pub(crate) fn canonical_source_key(app_id: &str, label: Option<&str>) -> String {
    match label.map(str::trim).filter(|l| !l.is_empty()) {
        Some(label) => format!("{}:{}", app_id, label.to_lowercase()),
        None => app_id.to_string(),
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct OktaHttp {
    base: String,
    token: String,
    client: reqwest::Client,
}

impl OktaHttp {
    pub fn new(cfg: &OktaConfig) -> Result<Self> {
        Ok(Self {
            base: format!("https://{}/api/v1", cfg.domain),
            token: cfg.api_token.clone(),
            client: http::client()?,
        })
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Page<T>> {
        let resp = self
            .client
            .get(format!("{}{}", self.base, path))
            .header("Authorization", format!("SSWS {}", self.token))
            .query(query)
            .send()
            .await
            .with_context(|| format!("okta GET {path} failed"))?;

        let next = http::next_cursor_from_link(resp.headers());
        let items: Vec<T> = http::read_json(resp).await?;
        Ok(Page { items, next })
    }
}

#[derive(Deserialize)]
struct WireUser {
    id: String,
    status: Option<String>,
    #[serde(default)]
    profile: WireProfile,
}

#[derive(Deserialize, Default)]
struct WireProfile {
    email: Option<String>,
    #[serde(rename = "firstName")]
    first_name: Option<String>,
    #[serde(rename = "lastName")]
    last_name: Option<String>,
}

#[derive(Deserialize)]
struct WireGroup {
    id: String,
    #[serde(default)]
    profile: WireGroupProfile,
}

#[derive(Deserialize, Default)]
struct WireGroupProfile {
    name: Option<String>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct WireApp {
    id: String,
    label: Option<String>,
    #[serde(rename = "signOnMode")]
    sign_on_mode: Option<String>,
}

#[derive(Deserialize)]
struct WireAppUser {
    id: String,
    scope: Option<String>,
    #[serde(rename = "groupId")]
    group_id: Option<String>,
}

#[derive(Deserialize)]
struct WireLogEvent {
    uuid: String,
    #[serde(rename = "eventType")]
    event_type: String,
    published: Option<DateTime<Utc>>,
    actor: Option<WireLogActor>,
    #[serde(default)]
    target: Vec<WireLogTarget>,
}

#[derive(Deserialize)]
struct WireLogActor {
    #[serde(rename = "alternateId")]
    alternate_id: Option<String>,
}

#[derive(Deserialize)]
struct WireLogTarget {
    #[serde(rename = "type")]
    target_type: Option<String>,
    id: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

fn display_name_from(profile: &WireProfile) -> Option<String> {
    let joined = format!(
        "{} {}",
        profile.first_name.as_deref().unwrap_or(""),
        profile.last_name.as_deref().unwrap_or("")
    );
    let joined = joined.trim().to_string();
    if joined.is_empty() {
        None
    } else {
        Some(joined)
    }
}

#[async_trait]
impl OktaApi for OktaHttp {
    async fn list_users(&self, after: Option<&str>) -> Result<Page<OktaUser>> {
        let mut query = vec![("limit", PAGE_LIMIT_USERS.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let page: Page<WireUser> = self.get_page("/users", &query).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|u| OktaUser {
                    display_name: display_name_from(&u.profile),
                    email: u.profile.email,
                    status: u.status,
                    id: u.id,
                })
                .collect(),
            next: page.next,
        })
    }

    async fn list_groups(&self, after: Option<&str>) -> Result<Page<OktaGroup>> {
        let mut query = vec![("limit", PAGE_LIMIT_USERS.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let page: Page<WireGroup> = self.get_page("/groups", &query).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|g| OktaGroup {
                    name: g.profile.name.unwrap_or_else(|| g.id.clone()),
                    description: g.profile.description,
                    id: g.id,
                })
                .collect(),
            next: page.next,
        })
    }

    async fn list_apps(&self, after: Option<&str>) -> Result<Page<OktaApp>> {
        let mut query = vec![("limit", PAGE_LIMIT_USERS.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let page: Page<WireApp> = self.get_page("/apps", &query).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|a| OktaApp {
                    label: a.label.unwrap_or_else(|| a.id.clone()),
                    sign_on_mode: a.sign_on_mode,
                    id: a.id,
                })
                .collect(),
            next: page.next,
        })
    }

    async fn list_app_assignments(
        &self,
        app_id: &str,
        after: Option<&str>,
    ) -> Result<Page<OktaAppAssignment>> {
        let mut query = vec![("limit", PAGE_LIMIT_USERS.to_string())];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let page: Page<WireAppUser> = self
            .get_page(&format!("/apps/{app_id}/users"), &query)
            .await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|u| OktaAppAssignment {
                    user_id: u.id,
                    scope: u.scope.unwrap_or_else(|| "USER".to_string()),
                    group_id: u.group_id,
                })
                .collect(),
            next: page.next,
        })
    }

    async fn list_system_log(
        &self,
        since: DateTime<Utc>,
        after: Option<&str>,
    ) -> Result<Page<OktaLogEvent>> {
        let mut query = vec![
            ("limit", PAGE_LIMIT_LOGS.to_string()),
            ("since", since.to_rfc3339()),
        ];
        if let Some(after) = after {
            query.push(("after", after.to_string()));
        }
        let page: Page<WireLogEvent> = self.get_page("/logs", &query).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|e| {
                    let app_target = e
                        .target
                        .iter()
                        .find(|t| t.target_type.as_deref() == Some("AppInstance"));
                    OktaLogEvent {
                        uuid: e.uuid,
                        event_type: e.event_type,
                        published: e.published,
                        actor_email: e.actor.and_then(|a| a.alternate_id),
                        app_id: app_target.and_then(|t| t.id.clone()),
                        app_label: app_target.and_then(|t| t.display_name.clone()),
                    }
                })
                .collect(),
            next: page.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_clamps_back_fifteen_minutes() {
        let now = Utc::now();
        let watermark = now - ChronoDuration::hours(1);
        assert_eq!(
            discovery_since(Some(watermark), now),
            watermark - ChronoDuration::minutes(15)
        );
    }

    #[test]
    fn missing_watermark_uses_initial_lookback() {
        let now = Utc::now();
        assert_eq!(discovery_since(None, now), now - ChronoDuration::days(7));
    }

    #[test]
    fn canonical_key_includes_label_hint() {
        assert_eq!(
            canonical_source_key("0oa1", Some(" Figma ")),
            "0oa1:figma"
        );
        assert_eq!(canonical_source_key("0oa1", Some("")), "0oa1");
        assert_eq!(canonical_source_key("0oa1", None), "0oa1");
    }

    #[test]
    fn event_kind_mapping() {
        assert_eq!(discovery_event_kind("user.authentication.sso"), Some("signin"));
        assert_eq!(
            discovery_event_kind("application.user_membership.add"),
            Some("grant")
        );
        assert_eq!(discovery_event_kind("user.session.start"), None);
    }

    #[test]
    fn config_normalizes_domain() {
        let cfg = OktaConfig::decode(&serde_json::json!({
            "domain": "https://Acme.okta.com/",
            "api_token": " tok "
        }))
        .unwrap();
        assert_eq!(cfg.domain, "acme.okta.com");
        assert_eq!(cfg.api_token, "tok");
    }

    #[test]
    fn config_requires_fields() {
        assert!(OktaConfig::decode(&serde_json::json!({"domain": "", "api_token": "t"})).is_err());
        assert!(OktaConfig::decode(&serde_json::json!({"domain": "a.okta.com"})).is_err());
    }
}
