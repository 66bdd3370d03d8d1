//! GitHub connector: org members, team-membership entitlements, repository
//! assets and their admin owners.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use sspm_store::{
    AppAssetRecord, AppUserRecord, AssetOwnerRecord, EntitlementRecord, EntityClass, Store,
};
use sspm_sync::{
    normalize_email, ConnectorDefinition, Event, Integration, IntegrationDeps, Role, UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{
    check_cancel, RunLifecycle, TagErr, ASSET_BATCH, ENTITLEMENT_BATCH, OWNER_BATCH, USER_BATCH,
};
use crate::Page;

const PAGE_SIZE: usize = 100;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    pub org: String,
    pub token: String,
}

impl GithubConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: GithubConfig =
            serde_json::from_value(raw.clone()).context("decoding github config failed")?;
        cfg.org = cfg.org.trim().to_lowercase();
        cfg.token = cfg.token.trim().to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.org.is_empty() {
            return Err(anyhow!("github config: org is required"));
        }
        if self.token.is_empty() {
            return Err(anyhow!("github config: token is required"));
        }
        Ok(())
    }
}

pub struct GithubDefinition;

impl ConnectorDefinition for GithubDefinition {
    fn kind(&self) -> &'static str {
        "github"
    }

    fn display_name(&self) -> &'static str {
        "GitHub"
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        GithubConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = GithubConfig::decode(config)?;
        let api = Arc::new(GithubHttp::new(&cfg)?);
        Ok(Box::new(GithubIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct GithubMember {
    pub id: i64,
    pub login: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GithubTeam {
    pub id: i64,
    pub slug: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct GithubRepo {
    pub id: i64,
    pub name: String,
    pub html_url: Option<String>,
    pub private: bool,
}

#[async_trait]
pub trait GithubApi: Send + Sync {
    async fn list_org_members(&self, page: u32) -> Result<Page<GithubMember>>;
    /// The plain member list carries no role; org admins are the
    /// `role=admin` filtered listing.
    async fn list_org_admin_logins(&self, page: u32) -> Result<Page<String>>;
    async fn list_teams(&self, page: u32) -> Result<Page<GithubTeam>>;
    async fn list_team_member_logins(&self, team_slug: &str, page: u32) -> Result<Page<String>>;
    async fn list_repos(&self, page: u32) -> Result<Page<GithubRepo>>;
    async fn list_repo_admin_logins(&self, repo: &str, page: u32) -> Result<Page<String>>;
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct GithubIntegration {
    cfg: GithubConfig,
    api: Arc<dyn GithubApi>,
}

impl GithubIntegration {
    pub fn new(cfg: GithubConfig, api: Arc<dyn GithubApi>) -> Self {
        Self { cfg, api }
    }

    /// Org admins first (the role-filtered listing), then every member with
    /// `is_admin` derived from that set.
    async fn sync_members(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut admins: HashSet<String> = HashSet::new();
        let mut page_no: u32 = 1;
        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_org_admin_logins(page_no).await.tag_api()?;
            let last = page.items.is_empty() || page.next.is_none();
            admins.extend(
                page.items
                    .into_iter()
                    .map(|login| login.trim().to_string())
                    .filter(|login| !login.is_empty()),
            );
            if last {
                break;
            }
            page_no += 1;
        }

        let mut page_no: u32 = 1;
        let mut batch: Vec<AppUserRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_org_members(page_no).await.tag_api()?;
            let last = page.items.is_empty() || page.next.is_none();

            for member in page.items {
                let login = member.login.trim().to_string();
                if login.is_empty() {
                    continue;
                }
                seen += 1;
                batch.push(AppUserRecord {
                    external_id: login.clone(),
                    email: member.email.as_deref().and_then(normalize_email),
                    is_admin: admins.contains(&login),
                    display_name: Some(login),
                    status: None,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_app_users_bulk_by_source(
                            "github",
                            self.name(),
                            run.run_id(),
                            &batch,
                        )
                        .await
                        .tag_db()?;
                    batch.clear();
                }
            }
            run.emit("list-members", seen, UNKNOWN_TOTAL);
            if last {
                break;
            }
            page_no += 1;
        }

        if !batch.is_empty() {
            deps.store
                .upsert_app_users_bulk_by_source("github", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AppUsers);
        Ok(())
    }

    async fn sync_team_entitlements(
        &self,
        deps: &IntegrationDeps,
        run: &mut RunLifecycle,
    ) -> Result<()> {
        let mut teams: Vec<GithubTeam> = Vec::new();
        let mut page_no: u32 = 1;
        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_teams(page_no).await.tag_api()?;
            let last = page.items.is_empty() || page.next.is_none();
            teams.extend(page.items);
            if last {
                break;
            }
            page_no += 1;
        }

        let total = teams.len() as i64;
        let mut records: Vec<EntitlementRecord> = Vec::new();
        for (idx, team) in teams.iter().enumerate() {
            check_cancel(&deps.cancel)?;
            let mut page_no: u32 = 1;
            loop {
                let page = self
                    .api
                    .list_team_member_logins(&team.slug, page_no)
                    .await
                    .tag_api()?;
                let last = page.items.is_empty() || page.next.is_none();
                for login in page.items {
                    let login = login.trim().to_string();
                    if login.is_empty() {
                        continue;
                    }
                    records.push(EntitlementRecord {
                        external_id: format!("{}|team|{}", login, team.slug),
                        account_external_id: login,
                        resource: "team".to_string(),
                        permission: team.slug.clone(),
                        assignment_source: "direct".to_string(),
                        via_group: None,
                    });
                }
                if last {
                    break;
                }
                page_no += 1;
            }
            run.emit("list-team-members", idx as i64 + 1, total);
        }

        records.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        records.dedup_by(|a, b| a.external_id == b.external_id);

        for chunk in records.chunks(ENTITLEMENT_BATCH) {
            deps.store
                .upsert_entitlements_bulk_by_source("github", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::Entitlements);
        Ok(())
    }

    async fn sync_repos(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut repos: Vec<GithubRepo> = Vec::new();
        let mut page_no: u32 = 1;
        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_repos(page_no).await.tag_api()?;
            let last = page.items.is_empty() || page.next.is_none();
            repos.extend(page.items);
            run.emit("list-repos", repos.len() as i64, UNKNOWN_TOTAL);
            if last {
                break;
            }
            page_no += 1;
        }

        let assets: Vec<AppAssetRecord> = repos
            .iter()
            .filter(|r| !r.name.trim().is_empty())
            .map(|r| AppAssetRecord {
                external_id: r.id.to_string(),
                name: r.name.clone(),
                asset_kind: if r.private {
                    "private_repo".to_string()
                } else {
                    "public_repo".to_string()
                },
                url: r.html_url.clone(),
            })
            .collect();
        for chunk in assets.chunks(ASSET_BATCH) {
            deps.store
                .upsert_app_assets_bulk_by_source("github", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AppAssets);

        let mut owners: Vec<AssetOwnerRecord> = Vec::new();
        let total = repos.len() as i64;
        for (idx, repo) in repos.iter().enumerate() {
            check_cancel(&deps.cancel)?;
            let mut page_no: u32 = 1;
            loop {
                let page = self
                    .api
                    .list_repo_admin_logins(&repo.name, page_no)
                    .await
                    .tag_api()?;
                let last = page.items.is_empty() || page.next.is_none();
                for login in page.items {
                    let login = login.trim().to_string();
                    if login.is_empty() {
                        continue;
                    }
                    owners.push(AssetOwnerRecord {
                        external_id: format!("{}/{}", repo.id, login),
                        asset_external_id: repo.id.to_string(),
                        owner_email: format!("{login}@users.noreply.github.com"),
                        owner_role: Some("admin".to_string()),
                    });
                }
                if last {
                    break;
                }
                page_no += 1;
            }
            run.emit("list-repo-owners", idx as i64 + 1, total);
        }

        for chunk in owners.chunks(OWNER_BATCH) {
            deps.store
                .upsert_asset_owners_bulk_by_source("github", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AssetOwners);
        Ok(())
    }
}

#[async_trait]
impl Integration for GithubIntegration {
    fn kind(&self) -> &str {
        "github"
    }

    fn name(&self) -> &str {
        &self.cfg.org
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("github/{}", self.cfg.org);
        vec![
            Event::progress(source.clone(), "list-members", 0, UNKNOWN_TOTAL),
            Event::progress(source.clone(), "list-team-members", 0, UNKNOWN_TOTAL),
            Event::progress(source, "list-repos", 0, UNKNOWN_TOTAL),
        ]
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let res = async {
            self.sync_members(deps, &mut run).await?;
            self.sync_team_entitlements(deps, &mut run).await?;
            self.sync_repos(deps, &mut run).await
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

pub struct GithubHttp {
    org: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WireMember {
    id: i64,
    login: String,
    email: Option<String>,
}

#[derive(Deserialize)]
struct WireTeam {
    id: i64,
    slug: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct WireRepo {
    id: i64,
    name: String,
    html_url: Option<String>,
    #[serde(default)]
    private: bool,
}

#[derive(Deserialize)]
struct WireLogin {
    login: String,
}

impl GithubHttp {
    pub fn new(cfg: &GithubConfig) -> Result<Self> {
        Ok(Self {
            org: cfg.org.clone(),
            token: cfg.token.clone(),
            client: http::client()?,
        })
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        page: u32,
    ) -> Result<Page<T>> {
        let resp = self
            .client
            .get(format!("https://api.github.com{path}"))
            .bearer_auth(&self.token)
            .header("User-Agent", "sspm-worker")
            .header("Accept", "application/vnd.github+json")
            .query(&[("per_page", PAGE_SIZE.to_string()), ("page", page.to_string())])
            .send()
            .await
            .with_context(|| format!("github GET {path} failed"))?;

        // GitHub's Link header says whether another page exists; the cursor
        // value itself is unused because paging is by page number.
        let has_next = resp
            .headers()
            .get(reqwest::header::LINK)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(r#"rel="next""#));
        let items: Vec<T> = http::read_json(resp).await?;
        Ok(Page {
            items,
            next: has_next.then(|| (page + 1).to_string()),
        })
    }
}

#[async_trait]
impl GithubApi for GithubHttp {
    async fn list_org_members(&self, page: u32) -> Result<Page<GithubMember>> {
        let wire: Page<WireMember> = self
            .get_page(&format!("/orgs/{}/members", self.org), page)
            .await?;
        Ok(Page {
            items: wire
                .items
                .into_iter()
                .map(|m| GithubMember {
                    id: m.id,
                    login: m.login,
                    email: m.email,
                })
                .collect(),
            next: wire.next,
        })
    }

    async fn list_org_admin_logins(&self, page: u32) -> Result<Page<String>> {
        let wire: Page<WireLogin> = self
            .get_page(&format!("/orgs/{}/members?role=admin", self.org), page)
            .await?;
        Ok(Page {
            items: wire.items.into_iter().map(|l| l.login).collect(),
            next: wire.next,
        })
    }

    async fn list_teams(&self, page: u32) -> Result<Page<GithubTeam>> {
        let wire: Page<WireTeam> = self
            .get_page(&format!("/orgs/{}/teams", self.org), page)
            .await?;
        Ok(Page {
            items: wire
                .items
                .into_iter()
                .map(|t| GithubTeam {
                    id: t.id,
                    name: t.name.unwrap_or_else(|| t.slug.clone()),
                    slug: t.slug,
                })
                .collect(),
            next: wire.next,
        })
    }

    async fn list_team_member_logins(&self, team_slug: &str, page: u32) -> Result<Page<String>> {
        let wire: Page<WireLogin> = self
            .get_page(
                &format!("/orgs/{}/teams/{}/members", self.org, team_slug),
                page,
            )
            .await?;
        Ok(Page {
            items: wire.items.into_iter().map(|l| l.login).collect(),
            next: wire.next,
        })
    }

    async fn list_repos(&self, page: u32) -> Result<Page<GithubRepo>> {
        let wire: Page<WireRepo> = self
            .get_page(&format!("/orgs/{}/repos", self.org), page)
            .await?;
        Ok(Page {
            items: wire
                .items
                .into_iter()
                .map(|r| GithubRepo {
                    id: r.id,
                    name: r.name,
                    html_url: r.html_url,
                    private: r.private,
                })
                .collect(),
            next: wire.next,
        })
    }

    async fn list_repo_admin_logins(&self, repo: &str, page: u32) -> Result<Page<String>> {
        let wire: Page<WireLogin> = self
            .get_page(
                &format!(
                    "/repos/{}/{}/collaborators?permission=admin&affiliation=direct",
                    self.org, repo
                ),
                page,
            )
            .await?;
        Ok(Page {
            items: wire.items.into_iter().map(|l| l.login).collect(),
            next: wire.next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_normalizes_org() {
        let cfg =
            GithubConfig::decode(&serde_json::json!({"org": " Acme-Corp ", "token": "ghp_x"}))
                .unwrap();
        assert_eq!(cfg.org, "acme-corp");
    }

    #[test]
    fn config_requires_token() {
        assert!(GithubConfig::decode(&serde_json::json!({"org": "acme"})).is_err());
    }
}
