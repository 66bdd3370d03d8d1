//! Entra ID (Microsoft Graph) connector: tenant users and directory-role
//! entitlements in full mode, service-principal sources and sign-in events
//! in discovery mode.
//!
//! Graph throttles aggressively; every request retries 429/503/504 up to
//! five times, honoring `Retry-After` (seconds) and falling back to
//! `2^attempt` seconds capped at 30, sleeping on a cancellable timer.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use sspm_store::{
    AppUserRecord, DiscoveryEventRecord, DiscoverySourceRecord, EntitlementRecord, EntityClass,
    Store,
};
use sspm_sync::{
    normalize_email, ConnectorDefinition, Event, Integration, IntegrationDeps, Role, RunMode,
    UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{check_cancel, RunLifecycle, TagErr, ENTITLEMENT_BATCH, EVENT_BATCH, USER_BATCH};
use crate::okta::{canonical_source_key, discovery_since};
use crate::Page;

const GRAPH_PAGE_SIZE: usize = 999;
const THROTTLE_MAX_ATTEMPTS: u32 = 5;
const THROTTLE_FALLBACK_CAP_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct EntraConfig {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
}

impl EntraConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: EntraConfig =
            serde_json::from_value(raw.clone()).context("decoding entra config failed")?;
        cfg.tenant_id = cfg.tenant_id.trim().to_lowercase();
        cfg.client_id = cfg.client_id.trim().to_string();
        cfg.client_secret = cfg.client_secret.trim().to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.tenant_id.is_empty() {
            return Err(anyhow!("entra config: tenant_id is required"));
        }
        if self.client_id.is_empty() || self.client_secret.is_empty() {
            return Err(anyhow!("entra config: client credentials are required"));
        }
        Ok(())
    }
}

pub struct EntraDefinition;

impl ConnectorDefinition for EntraDefinition {
    fn kind(&self) -> &'static str {
        "entra"
    }

    fn display_name(&self) -> &'static str {
        "Microsoft Entra ID"
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        EntraConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = EntraConfig::decode(config)?;
        let api = Arc::new(GraphHttp::new(&cfg)?);
        Ok(Box::new(EntraIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct GraphUser {
    pub id: String,
    pub display_name: Option<String>,
    pub mail: Option<String>,
    pub user_principal_name: Option<String>,
    pub other_mails: Vec<String>,
    pub proxy_addresses: Vec<String>,
    pub user_type: Option<String>,
    pub account_enabled: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct GraphDirectoryRole {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Default)]
pub struct GraphServicePrincipal {
    pub id: String,
    pub app_id: Option<String>,
    pub display_name: Option<String>,
    pub publisher_name: Option<String>,
    pub verified_publisher_name: Option<String>,
    pub publisher_domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GraphSignIn {
    pub id: String,
    pub created_at: Option<DateTime<Utc>>,
    pub user_principal_name: Option<String>,
    pub app_id: Option<String>,
    pub app_display_name: Option<String>,
}

/// Graph client. Methods take the run's token because the client sleeps
/// internally on throttle retries.
#[async_trait]
pub trait GraphApi: Send + Sync {
    async fn list_users(
        &self,
        cancel: &CancellationToken,
        next: Option<&str>,
    ) -> Result<Page<GraphUser>>;

    async fn list_directory_roles(&self, cancel: &CancellationToken)
        -> Result<Vec<GraphDirectoryRole>>;

    async fn list_role_member_ids(
        &self,
        cancel: &CancellationToken,
        role_id: &str,
        next: Option<&str>,
    ) -> Result<Page<String>>;

    async fn list_service_principals(
        &self,
        cancel: &CancellationToken,
        next: Option<&str>,
    ) -> Result<Page<GraphServicePrincipal>>;

    async fn list_sign_ins(
        &self,
        cancel: &CancellationToken,
        since: DateTime<Utc>,
        next: Option<&str>,
    ) -> Result<Page<GraphSignIn>>;
}

// ---------------------------------------------------------------------------
// Preferred email derivation
// ---------------------------------------------------------------------------

/// Minimal looks-like-email predicate: one `@` with non-empty local part
/// and a dot-bearing domain.
pub(crate) fn looks_like_email(s: &str) -> bool {
    let s = s.trim();
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn first_valid(candidates: impl IntoIterator<Item = String>) -> Option<String> {
    candidates
        .into_iter()
        .map(|c| c.trim().to_lowercase())
        .find(|c| looks_like_email(c))
}

/// Preferred email precedence: `mail`, then (guests) `otherMails`, then
/// `userPrincipalName`, then `otherMails`, then `proxyAddresses` smtp
/// entries. Candidates failing the email predicate are skipped.
pub fn preferred_email(user: &GraphUser) -> Option<String> {
    let is_guest = user
        .user_type
        .as_deref()
        .is_some_and(|t| t.eq_ignore_ascii_case("guest"));

    let mut candidates: Vec<String> = Vec::new();
    if let Some(mail) = &user.mail {
        candidates.push(mail.clone());
    }
    if is_guest {
        candidates.extend(user.other_mails.iter().cloned());
    }
    if let Some(upn) = &user.user_principal_name {
        candidates.push(upn.clone());
    }
    candidates.extend(user.other_mails.iter().cloned());
    candidates.extend(
        user.proxy_addresses
            .iter()
            .filter_map(|p| p.strip_prefix("smtp:").or_else(|| p.strip_prefix("SMTP:")))
            .map(str::to_string),
    );

    first_valid(candidates)
}

/// Vendor label precedence for a discovered service principal:
/// verified publisher, then a label derived from the publisher domain, then
/// the raw publisher name. First non-empty wins.
pub fn vendor_label(sp: &GraphServicePrincipal) -> Option<String> {
    if let Some(v) = sp.verified_publisher_name.as_deref().map(str::trim) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(domain) = sp.publisher_domain.as_deref().map(str::trim) {
        if let Some(label) = domain_label(domain) {
            return Some(label);
        }
    }
    if let Some(v) = sp.publisher_name.as_deref().map(str::trim) {
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }
    None
}

/// `example.com` -> `example`; `sub.vendor.co.uk` -> `sub`.
fn domain_label(domain: &str) -> Option<String> {
    let label = domain.split('.').next()?.trim().to_lowercase();
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct EntraIntegration {
    cfg: EntraConfig,
    api: Arc<dyn GraphApi>,
}

impl EntraIntegration {
    pub fn new(cfg: EntraConfig, api: Arc<dyn GraphApi>) -> Self {
        Self { cfg, api }
    }

    async fn sync_full(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        self.sync_users(deps, run).await?;
        self.sync_role_entitlements(deps, run).await?;
        Ok(())
    }

    async fn sync_users(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut next: Option<String> = None;
        let mut batch: Vec<AppUserRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self
                .api
                .list_users(&deps.cancel, next.as_deref())
                .await
                .tag_api()?;

            for user in page.items {
                let external_id = user.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                seen += 1;
                let status = match user.account_enabled {
                    Some(true) => Some("active".to_string()),
                    Some(false) => Some("disabled".to_string()),
                    None => None,
                };
                batch.push(AppUserRecord {
                    email: preferred_email(&user),
                    display_name: user.display_name,
                    status,
                    is_admin: false,
                    external_id,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_app_users_bulk_by_source("entra", self.name(), run.run_id(), &batch)
                        .await
                        .tag_db()?;
                    batch.clear();
                }
            }

            run.emit("list-users", seen, UNKNOWN_TOTAL);
            match page.next {
                Some(n) if !n.is_empty() => next = Some(n),
                _ => break,
            }
        }

        if !batch.is_empty() {
            deps.store
                .upsert_app_users_bulk_by_source("entra", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AppUsers);
        Ok(())
    }

    async fn sync_role_entitlements(
        &self,
        deps: &IntegrationDeps,
        run: &mut RunLifecycle,
    ) -> Result<()> {
        let roles = self
            .api
            .list_directory_roles(&deps.cancel)
            .await
            .tag_api()?;
        let total = roles.len() as i64;

        let mut records: Vec<EntitlementRecord> = Vec::new();
        for (idx, role) in roles.iter().enumerate() {
            check_cancel(&deps.cancel)?;
            let mut next: Option<String> = None;
            loop {
                let page = self
                    .api
                    .list_role_member_ids(&deps.cancel, &role.id, next.as_deref())
                    .await
                    .tag_api()?;
                for member_id in page.items {
                    let member_id = member_id.trim().to_string();
                    if member_id.is_empty() {
                        continue;
                    }
                    records.push(EntitlementRecord {
                        external_id: format!("{}|directory_role|{}", member_id, role.id),
                        account_external_id: member_id,
                        resource: "directory_role".to_string(),
                        permission: role.display_name.clone(),
                        assignment_source: "direct".to_string(),
                        via_group: None,
                    });
                }
                match page.next {
                    Some(n) if !n.is_empty() => next = Some(n),
                    _ => break,
                }
            }
            run.emit("list-role-members", idx as i64 + 1, total);
        }

        // Stable dedup on the composite key; repeated role listings must not
        // produce duplicate facts.
        records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        records.dedup_by(|a, b| a.external_id == b.external_id);

        for chunk in records.chunks(ENTITLEMENT_BATCH) {
            deps.store
                .upsert_entitlements_bulk_by_source("entra", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::Entitlements);
        Ok(())
    }

    async fn sync_discovery(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        // Service principals first: they name and label the sources.
        let mut next: Option<String> = None;
        let mut sources: BTreeMap<String, DiscoverySourceRecord> = BTreeMap::new();
        let mut sp_key_by_app_id: BTreeMap<String, String> = BTreeMap::new();

        loop {
            check_cancel(&deps.cancel)?;
            let page = self
                .api
                .list_service_principals(&deps.cancel, next.as_deref())
                .await
                .tag_api()?;

            for sp in page.items {
                let Some(app_id) = sp.app_id.as_deref().map(str::trim).filter(|s| !s.is_empty())
                else {
                    continue;
                };
                let key = canonical_source_key(app_id, sp.display_name.as_deref());
                sp_key_by_app_id.insert(app_id.to_string(), key.clone());
                sources.entry(key.clone()).or_insert_with(|| DiscoverySourceRecord {
                    external_id: key,
                    display_name: sp.display_name.clone().unwrap_or_else(|| app_id.to_string()),
                    vendor: vendor_label(&sp),
                    category: Some("service_principal".to_string()),
                });
            }

            run.emit("list-service-principals", sources.len() as i64, UNKNOWN_TOTAL);
            match page.next {
                Some(n) if !n.is_empty() => next = Some(n),
                _ => break,
            }
        }

        let watermark = deps
            .store
            .latest_discovery_event_observed_at(run.source_kind(), self.name())
            .await
            .tag_db()?;
        let since = discovery_since(watermark, Utc::now());

        let mut next: Option<String> = None;
        let mut events: Vec<DiscoveryEventRecord> = Vec::new();
        loop {
            check_cancel(&deps.cancel)?;
            let page = self
                .api
                .list_sign_ins(&deps.cancel, since, next.as_deref())
                .await
                .tag_api()?;

            for signin in page.items {
                let Some(app_id) = signin
                    .app_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                else {
                    continue;
                };
                if signin.id.trim().is_empty() {
                    continue;
                }
                let key = sp_key_by_app_id
                    .get(app_id)
                    .cloned()
                    .unwrap_or_else(|| {
                        canonical_source_key(app_id, signin.app_display_name.as_deref())
                    });
                // Sign-ins against apps with no service principal row still
                // need a source to hang off.
                sources.entry(key.clone()).or_insert_with(|| DiscoverySourceRecord {
                    external_id: key.clone(),
                    display_name: signin
                        .app_display_name
                        .clone()
                        .unwrap_or_else(|| app_id.to_string()),
                    vendor: None,
                    category: Some("signin_only".to_string()),
                });
                events.push(DiscoveryEventRecord {
                    external_id: signin.id.clone(),
                    source_external_id: key,
                    actor_email: signin.user_principal_name.as_deref().and_then(normalize_email),
                    event_kind: "signin".to_string(),
                    observed_at: signin.created_at,
                });
            }

            run.emit("list-sign-ins", events.len() as i64, UNKNOWN_TOTAL);
            match page.next {
                Some(n) if !n.is_empty() => next = Some(n),
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
impl Integration for EntraIntegration {
    fn kind(&self) -> &str {
        "entra"
    }

    fn name(&self) -> &str {
        &self.cfg.tenant_id
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("entra/{}", self.cfg.tenant_id);
        vec![
            Event::progress(source.clone(), "list-users", 0, UNKNOWN_TOTAL),
            Event::progress(source, "list-role-members", 0, UNKNOWN_TOTAL),
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
// HTTP client
// ---------------------------------------------------------------------------

pub struct GraphHttp {
    cfg: EntraConfig,
    client: reqwest::Client,
    /// Cached bearer token; refreshed on demand.
    token: Mutex<Option<String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GraphList<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

impl GraphHttp {
    pub fn new(cfg: &EntraConfig) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            client: http::client()?,
            token: Mutex::new(None),
        })
    }

    async fn bearer(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.cfg.tenant_id
        );
        let resp = self
            .client
            .post(url)
            .form(&[
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("scope", "https://graph.microsoft.com/.default"),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("entra token request failed")?;
        let token: TokenResponse = http::read_json(resp).await?;

        *guard = Some(token.access_token.clone());
        Ok(token.access_token)
    }

    /// GET with throttle retry. `url` is either a full `@odata.nextLink` or
    /// a v1.0-relative path.
    async fn get_list<T: serde::de::DeserializeOwned>(
        &self,
        cancel: &CancellationToken,
        url: &str,
    ) -> Result<GraphList<T>> {
        let url = if url.starts_with("https://") {
            url.to_string()
        } else {
            format!("https://graph.microsoft.com/v1.0{url}")
        };

        let mut attempt: u32 = 0;
        loop {
            let token = self.bearer().await?;
            let resp = self
                .client
                .get(&url)
                .bearer_auth(&token)
                .send()
                .await
                .with_context(|| format!("graph GET {url} failed"))?;

            if http::is_throttle_status(resp.status()) && attempt < THROTTLE_MAX_ATTEMPTS {
                attempt += 1;
                let delay = throttle_delay(http::retry_after_secs(resp.headers()), attempt);
                http::backoff_sleep(delay, cancel).await?;
                continue;
            }

            if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
                // Token expired mid-run; drop the cache and let the caller's
                // next attempt mint a fresh one.
                *self.token.lock().await = None;
            }

            return http::read_json(resp).await;
        }
    }
}

/// `Retry-After` seconds when the header is present, else `2^attempt`
/// seconds capped at 30.
pub(crate) fn throttle_delay(retry_after: Option<u64>, attempt: u32) -> std::time::Duration {
    let secs = match retry_after {
        Some(secs) => secs,
        None => 2u64
            .saturating_pow(attempt)
            .min(THROTTLE_FALLBACK_CAP_SECS),
    };
    std::time::Duration::from_secs(secs)
}

#[derive(Deserialize)]
struct WireGraphUser {
    id: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    mail: Option<String>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
    #[serde(rename = "otherMails", default)]
    other_mails: Vec<String>,
    #[serde(rename = "proxyAddresses", default)]
    proxy_addresses: Vec<String>,
    #[serde(rename = "userType")]
    user_type: Option<String>,
    #[serde(rename = "accountEnabled")]
    account_enabled: Option<bool>,
}

#[derive(Deserialize)]
struct WireDirectoryRole {
    id: String,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct WireDirObject {
    id: String,
}

#[derive(Deserialize)]
struct WireServicePrincipal {
    id: String,
    #[serde(rename = "appId")]
    app_id: Option<String>,
    #[serde(rename = "displayName")]
    display_name: Option<String>,
    #[serde(rename = "publisherName")]
    publisher_name: Option<String>,
    #[serde(rename = "verifiedPublisher")]
    verified_publisher: Option<WireVerifiedPublisher>,
    #[serde(rename = "publisherDomain")]
    publisher_domain: Option<String>,
}

#[derive(Deserialize)]
struct WireVerifiedPublisher {
    #[serde(rename = "displayName")]
    display_name: Option<String>,
}

#[derive(Deserialize)]
struct WireSignIn {
    id: String,
    #[serde(rename = "createdDateTime")]
    created_at: Option<DateTime<Utc>>,
    #[serde(rename = "userPrincipalName")]
    user_principal_name: Option<String>,
    #[serde(rename = "appId")]
    app_id: Option<String>,
    #[serde(rename = "appDisplayName")]
    app_display_name: Option<String>,
}

#[async_trait]
impl GraphApi for GraphHttp {
    async fn list_users(
        &self,
        cancel: &CancellationToken,
        next: Option<&str>,
    ) -> Result<Page<GraphUser>> {
        let url = match next {
            Some(link) => link.to_string(),
            None => format!(
                "/users?$top={GRAPH_PAGE_SIZE}&$select=id,displayName,mail,userPrincipalName,otherMails,proxyAddresses,userType,accountEnabled"
            ),
        };
        let list: GraphList<WireGraphUser> = self.get_list(cancel, &url).await?;
        Ok(Page {
            items: list
                .value
                .into_iter()
                .map(|u| GraphUser {
                    id: u.id,
                    display_name: u.display_name,
                    mail: u.mail,
                    user_principal_name: u.user_principal_name,
                    other_mails: u.other_mails,
                    proxy_addresses: u.proxy_addresses,
                    user_type: u.user_type,
                    account_enabled: u.account_enabled,
                })
                .collect(),
            next: list.next_link,
        })
    }

    async fn list_directory_roles(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<GraphDirectoryRole>> {
        let list: GraphList<WireDirectoryRole> =
            self.get_list(cancel, "/directoryRoles").await?;
        Ok(list
            .value
            .into_iter()
            .map(|r| GraphDirectoryRole {
                display_name: r.display_name.unwrap_or_else(|| r.id.clone()),
                id: r.id,
            })
            .collect())
    }

    async fn list_role_member_ids(
        &self,
        cancel: &CancellationToken,
        role_id: &str,
        next: Option<&str>,
    ) -> Result<Page<String>> {
        let url = match next {
            Some(link) => link.to_string(),
            None => format!("/directoryRoles/{role_id}/members?$top={GRAPH_PAGE_SIZE}&$select=id"),
        };
        let list: GraphList<WireDirObject> = self.get_list(cancel, &url).await?;
        Ok(Page {
            items: list.value.into_iter().map(|o| o.id).collect(),
            next: list.next_link,
        })
    }

    async fn list_service_principals(
        &self,
        cancel: &CancellationToken,
        next: Option<&str>,
    ) -> Result<Page<GraphServicePrincipal>> {
        let url = match next {
            Some(link) => link.to_string(),
            None => format!(
                "/servicePrincipals?$top={GRAPH_PAGE_SIZE}&$select=id,appId,displayName,publisherName,verifiedPublisher,publisherDomain"
            ),
        };
        let list: GraphList<WireServicePrincipal> = self.get_list(cancel, &url).await?;
        Ok(Page {
            items: list
                .value
                .into_iter()
                .map(|sp| GraphServicePrincipal {
                    id: sp.id,
                    app_id: sp.app_id,
                    display_name: sp.display_name,
                    publisher_name: sp.publisher_name,
                    verified_publisher_name: sp
                        .verified_publisher
                        .and_then(|v| v.display_name),
                    publisher_domain: sp.publisher_domain,
                })
                .collect(),
            next: list.next_link,
        })
    }

    async fn list_sign_ins(
        &self,
        cancel: &CancellationToken,
        since: DateTime<Utc>,
        next: Option<&str>,
    ) -> Result<Page<GraphSignIn>> {
        let url = match next {
            Some(link) => link.to_string(),
            None => format!(
                "/auditLogs/signIns?$top={GRAPH_PAGE_SIZE}&$filter=createdDateTime ge {}",
                since.to_rfc3339()
            ),
        };
        let list: GraphList<WireSignIn> = self.get_list(cancel, &url).await?;
        Ok(Page {
            items: list
                .value
                .into_iter()
                .map(|s| GraphSignIn {
                    id: s.id,
                    created_at: s.created_at,
                    user_principal_name: s.user_principal_name,
                    app_id: s.app_id,
                    app_display_name: s.app_display_name,
                })
                .collect(),
            next: list.next_link,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(
        mail: Option<&str>,
        user_type: Option<&str>,
        other_mails: &[&str],
        upn: Option<&str>,
        proxy: &[&str],
    ) -> GraphUser {
        GraphUser {
            id: "u1".to_string(),
            mail: mail.map(str::to_string),
            user_type: user_type.map(str::to_string),
            other_mails: other_mails.iter().map(|s| s.to_string()).collect(),
            user_principal_name: upn.map(str::to_string),
            proxy_addresses: proxy.iter().map(|s| s.to_string()).collect(),
            ..GraphUser::default()
        }
    }

    #[test]
    fn preferred_email_precedence_table() {
        // 1. mail wins outright.
        assert_eq!(
            preferred_email(&user(
                Some("Mail@Corp.com"),
                Some("Member"),
                &["other@corp.com"],
                Some("upn@corp.com"),
                &[],
            )),
            Some("mail@corp.com".to_string())
        );

        // 2. Guests fall to otherMails before UPN.
        assert_eq!(
            preferred_email(&user(
                None,
                Some("Guest"),
                &["guest@partner.io"],
                Some("guest_partner.io#EXT#@corp.onmicrosoft.com"),
                &[],
            )),
            Some("guest@partner.io".to_string())
        );

        // 3. Members skip otherMails at that tier and use UPN.
        assert_eq!(
            preferred_email(&user(
                None,
                Some("Member"),
                &["alt@corp.com"],
                Some("primary@corp.com"),
                &[],
            )),
            Some("primary@corp.com".to_string())
        );

        // 4. UPN that is not an email falls through to otherMails.
        assert_eq!(
            preferred_email(&user(
                None,
                Some("Member"),
                &["fallback@corp.com"],
                Some("not-an-email"),
                &[],
            )),
            Some("fallback@corp.com".to_string())
        );

        // 5. proxyAddresses smtp entries are the last resort.
        assert_eq!(
            preferred_email(&user(
                None,
                Some("Member"),
                &[],
                None,
                &["SMTP:proxy@corp.com", "sip:ignored@corp.com"],
            )),
            Some("proxy@corp.com".to_string())
        );

        // 6. Nothing valid anywhere.
        assert_eq!(
            preferred_email(&user(Some("bogus"), Some("Member"), &["also bogus"], None, &[])),
            None
        );
    }

    #[test]
    fn looks_like_email_predicate() {
        assert!(looks_like_email("a@b.co"));
        assert!(!looks_like_email("a@b"));
        assert!(!looks_like_email("@b.co"));
        assert!(!looks_like_email("a.b.co"));
        assert!(!looks_like_email("a@.co"));
    }

    #[test]
    fn vendor_label_precedence() {
        let sp = |verified: Option<&str>, domain: Option<&str>, publisher: Option<&str>| {
            GraphServicePrincipal {
                verified_publisher_name: verified.map(str::to_string),
                publisher_domain: domain.map(str::to_string),
                publisher_name: publisher.map(str::to_string),
                ..GraphServicePrincipal::default()
            }
        };

        assert_eq!(
            vendor_label(&sp(Some("Figma Inc"), Some("figma.com"), Some("figma"))),
            Some("Figma Inc".to_string())
        );
        assert_eq!(
            vendor_label(&sp(None, Some("figma.com"), Some("Figma Org"))),
            Some("figma".to_string())
        );
        assert_eq!(
            vendor_label(&sp(Some("  "), None, Some("Figma Org"))),
            Some("Figma Org".to_string())
        );
        assert_eq!(vendor_label(&sp(None, None, None)), None);
    }

    #[test]
    fn throttle_delay_honors_retry_after_then_backoff() {
        assert_eq!(throttle_delay(Some(7), 1), std::time::Duration::from_secs(7));
        assert_eq!(throttle_delay(None, 1), std::time::Duration::from_secs(2));
        assert_eq!(throttle_delay(None, 3), std::time::Duration::from_secs(8));
        assert_eq!(throttle_delay(None, 10), std::time::Duration::from_secs(30));
    }
}
