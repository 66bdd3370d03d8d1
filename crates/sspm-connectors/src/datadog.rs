//! Datadog connector: org users plus role entitlements. Role membership
//! listing fans out to a small worker pool; the first failure cancels the
//! pool and wins over any cancellation noise it causes.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use sspm_store::{AppUserRecord, EntitlementRecord, EntityClass, Store};
use sspm_sync::{
    is_canceled, normalize_email, ConnectorDefinition, Event, Integration, IntegrationDeps, Role,
    UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{check_cancel, RunLifecycle, TagErr, ENTITLEMENT_BATCH, USER_BATCH};
use crate::Page;

const DEFAULT_ROLE_WORKERS: usize = 3;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct DatadogConfig {
    pub site: String,
    pub api_key: String,
    pub app_key: String,
    #[serde(default)]
    pub workers: Option<usize>,
}

impl DatadogConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: DatadogConfig =
            serde_json::from_value(raw.clone()).context("decoding datadog config failed")?;
        cfg.site = cfg.site.trim().to_lowercase();
        cfg.api_key = cfg.api_key.trim().to_string();
        cfg.app_key = cfg.app_key.trim().to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.site.is_empty() {
            return Err(anyhow!("datadog config: site is required"));
        }
        if self.api_key.is_empty() || self.app_key.is_empty() {
            return Err(anyhow!("datadog config: api_key and app_key are required"));
        }
        Ok(())
    }
}

pub struct DatadogDefinition;

impl ConnectorDefinition for DatadogDefinition {
    fn kind(&self) -> &'static str {
        "datadog"
    }

    fn display_name(&self) -> &'static str {
        "Datadog"
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        DatadogConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = DatadogConfig::decode(config)?;
        let api = Arc::new(DatadogHttp::new(&cfg)?);
        Ok(Box::new(DatadogIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DatadogUser {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatadogRole {
    pub id: String,
    pub name: String,
}

#[async_trait]
pub trait DatadogApi: Send + Sync {
    async fn list_users(&self, cursor: Option<&str>) -> Result<Page<DatadogUser>>;
    async fn list_roles(&self) -> Result<Vec<DatadogRole>>;
    async fn list_role_user_ids(
        &self,
        role_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>>;
}

/// Clamp the configured pool size to the work at hand, minimum one.
pub(crate) fn worker_count(configured: Option<usize>, roles: usize) -> usize {
    configured
        .unwrap_or(DEFAULT_ROLE_WORKERS)
        .min(roles)
        .max(1)
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct DatadogIntegration {
    cfg: DatadogConfig,
    api: Arc<dyn DatadogApi>,
}

impl DatadogIntegration {
    pub fn new(cfg: DatadogConfig, api: Arc<dyn DatadogApi>) -> Self {
        Self { cfg, api }
    }

    async fn sync_users(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut cursor: Option<String> = None;
        let mut batch: Vec<AppUserRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_users(cursor.as_deref()).await.tag_api()?;
            for user in page.items {
                let external_id = user.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                seen += 1;
                batch.push(AppUserRecord {
                    external_id,
                    email: user.email.as_deref().and_then(normalize_email),
                    display_name: user.name,
                    status: user.status,
                    is_admin: false,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_app_users_bulk_by_source(
                            "datadog",
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
                Some(n) if !n.is_empty() => cursor = Some(n),
                _ => break,
            }
        }

        if !batch.is_empty() {
            deps.store
                .upsert_app_users_bulk_by_source("datadog", self.name(), run.run_id(), &batch)
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
        let roles = self.api.list_roles().await.tag_api()?;
        run.emit("list-roles", 0, roles.len() as i64);

        let records =
            collect_role_memberships(self.api.clone(), roles, self.cfg.workers, &deps.cancel)
                .await
                .tag_api()?;

        run.emit("list-roles", records.len() as i64, UNKNOWN_TOTAL);

        for chunk in records.chunks(ENTITLEMENT_BATCH) {
            deps.store
                .upsert_entitlements_bulk_by_source("datadog", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::Entitlements);
        Ok(())
    }
}

/// Fan the role list out to `workers` tasks sharing one queue. Workers share
/// a cancellable child token; the first error cancels it. Results are
/// drained only after every worker has finished, and a real error is
/// preferred over the cancellations it triggered so `canceled` never masks
/// the actual cause.
pub(crate) async fn collect_role_memberships(
    api: Arc<dyn DatadogApi>,
    roles: Vec<DatadogRole>,
    configured_workers: Option<usize>,
    cancel: &CancellationToken,
) -> Result<Vec<EntitlementRecord>> {
    if roles.is_empty() {
        return Ok(Vec::new());
    }

    let workers = worker_count(configured_workers, roles.len());
    let queue: Arc<Mutex<VecDeque<DatadogRole>>> = Arc::new(Mutex::new(roles.into()));
    let pool_cancel = cancel.child_token();

    let mut tasks: JoinSet<Result<Vec<EntitlementRecord>>> = JoinSet::new();
    for _ in 0..workers {
        let api = api.clone();
        let queue = queue.clone();
        let pool_cancel = pool_cancel.clone();
        tasks.spawn(async move {
            let mut records: Vec<EntitlementRecord> = Vec::new();
            loop {
                check_cancel(&pool_cancel)?;
                let role = { queue.lock().unwrap().pop_front() };
                let Some(role) = role else {
                    return Ok(records);
                };

                let mut cursor: Option<String> = None;
                loop {
                    check_cancel(&pool_cancel)?;
                    let page = match api.list_role_user_ids(&role.id, cursor.as_deref()).await {
                        Ok(page) => page,
                        Err(err) => {
                            pool_cancel.cancel();
                            return Err(err);
                        }
                    };
                    for user_id in page.items {
                        let user_id = user_id.trim().to_string();
                        if user_id.is_empty() {
                            continue;
                        }
                        records.push(EntitlementRecord {
                            external_id: format!("{}|role|{}", user_id, role.id),
                            account_external_id: user_id,
                            resource: "role".to_string(),
                            permission: role.name.clone(),
                            assignment_source: "direct".to_string(),
                            via_group: None,
                        });
                    }
                    match page.next {
                        Some(n) if !n.is_empty() => cursor = Some(n),
                        _ => break,
                    }
                }
            }
        });
    }

    // Drain after all workers are done; prefer the non-cancel error.
    let mut records: Vec<EntitlementRecord> = Vec::new();
    let mut real_error: Option<anyhow::Error> = None;
    let mut cancel_error: Option<anyhow::Error> = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(worker_records)) => records.extend(worker_records),
            Ok(Err(err)) => {
                if is_canceled(&err) {
                    cancel_error.get_or_insert(err);
                } else {
                    real_error.get_or_insert(err);
                }
            }
            Err(join_err) => {
                real_error.get_or_insert(anyhow!("role worker aborted: {join_err}"));
            }
        }
    }

    if let Some(err) = real_error.or(cancel_error) {
        return Err(err);
    }

    // Stable dedup; a user can reach the same role through multiple pages.
    records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    records.dedup_by(|a, b| a.external_id == b.external_id);
    Ok(records)
}

#[async_trait]
impl Integration for DatadogIntegration {
    fn kind(&self) -> &str {
        "datadog"
    }

    fn name(&self) -> &str {
        &self.cfg.site
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("datadog/{}", self.cfg.site);
        vec![
            Event::progress(source.clone(), "list-users", 0, UNKNOWN_TOTAL),
            Event::progress(source, "list-roles", 0, UNKNOWN_TOTAL),
        ]
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let res = async {
            self.sync_users(deps, &mut run).await?;
            self.sync_role_entitlements(deps, &mut run).await
        }
        .await;
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

pub struct DatadogHttp {
    base: String,
    api_key: String,
    app_key: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WireList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    meta: Option<WireMeta>,
}

#[derive(Deserialize)]
struct WireMeta {
    page: Option<WirePageMeta>,
}

#[derive(Deserialize)]
struct WirePageMeta {
    after: Option<String>,
}

#[derive(Deserialize)]
struct WireUser {
    id: String,
    #[serde(default)]
    attributes: WireUserAttributes,
}

#[derive(Deserialize, Default)]
struct WireUserAttributes {
    email: Option<String>,
    name: Option<String>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct WireRole {
    id: String,
    #[serde(default)]
    attributes: WireRoleAttributes,
}

#[derive(Deserialize, Default)]
struct WireRoleAttributes {
    name: Option<String>,
}

#[derive(Deserialize)]
struct WireRoleUser {
    id: String,
}

impl DatadogHttp {
    pub fn new(cfg: &DatadogConfig) -> Result<Self> {
        Ok(Self {
            base: format!("https://api.{}/api/v2", cfg.site),
            api_key: cfg.api_key.clone(),
            app_key: cfg.app_key.clone(),
            client: http::client()?,
        })
    }

    async fn get_list<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        cursor: Option<&str>,
    ) -> Result<WireList<T>> {
        let mut req = self
            .client
            .get(format!("{}{}", self.base, path))
            .header("DD-API-KEY", &self.api_key)
            .header("DD-APPLICATION-KEY", &self.app_key);
        if let Some(cursor) = cursor {
            req = req.query(&[("page[cursor]", cursor)]);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("datadog GET {path} failed"))?;
        http::read_json(resp).await
    }
}

fn next_cursor<T>(list: &WireList<T>) -> Option<String> {
    list.meta
        .as_ref()
        .and_then(|m| m.page.as_ref())
        .and_then(|p| p.after.clone())
}

#[async_trait]
impl DatadogApi for DatadogHttp {
    async fn list_users(&self, cursor: Option<&str>) -> Result<Page<DatadogUser>> {
        let list: WireList<WireUser> = self.get_list("/users", cursor).await?;
        let next = next_cursor(&list);
        Ok(Page {
            items: list
                .data
                .into_iter()
                .map(|u| DatadogUser {
                    id: u.id,
                    email: u.attributes.email,
                    name: u.attributes.name,
                    status: u.attributes.status,
                })
                .collect(),
            next,
        })
    }

    async fn list_roles(&self) -> Result<Vec<DatadogRole>> {
        let mut roles = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let list: WireList<WireRole> = self.get_list("/roles", cursor.as_deref()).await?;
            let next = next_cursor(&list);
            roles.extend(list.data.into_iter().map(|r| DatadogRole {
                name: r.attributes.name.unwrap_or_else(|| r.id.clone()),
                id: r.id,
            }));
            match next {
                Some(n) if !n.is_empty() => cursor = Some(n),
                _ => break,
            }
        }
        Ok(roles)
    }

    async fn list_role_user_ids(
        &self,
        role_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<String>> {
        let list: WireList<WireRoleUser> = self
            .get_list(&format!("/roles/{role_id}/users"), cursor)
            .await?;
        let next = next_cursor(&list);
        Ok(Page {
            items: list.data.into_iter().map(|u| u.id).collect(),
            next,
        })
    }
}
