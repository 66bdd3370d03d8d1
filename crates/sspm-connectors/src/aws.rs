//! AWS Identity Center connector: identity-store users plus per-account
//! permission-set entitlements, with in-process expansion of group-based
//! assignments to one fact per member and direct-over-group dedup.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use sspm_store::{AppUserRecord, EntitlementRecord, EntityClass, Store};
use sspm_sync::{
    normalize_email, ConnectorDefinition, Event, Integration, IntegrationDeps, Role, UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{check_cancel, RunLifecycle, TagErr, ENTITLEMENT_BATCH, USER_BATCH};
use crate::Page;

pub const ASSIGNMENT_SOURCE_DIRECT: &str = "direct";
pub const ASSIGNMENT_SOURCE_GROUP: &str = "group";

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// Identity Center gateway endpoint (org proxy or regional endpoint).
    pub endpoint: String,
    pub bearer_token: String,
    pub identity_store_id: String,
}

impl AwsConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: AwsConfig =
            serde_json::from_value(raw.clone()).context("decoding aws config failed")?;
        cfg.endpoint = cfg.endpoint.trim().trim_end_matches('/').to_string();
        cfg.bearer_token = cfg.bearer_token.trim().to_string();
        cfg.identity_store_id = cfg.identity_store_id.trim().to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(anyhow!("aws config: endpoint is required"));
        }
        if self.bearer_token.is_empty() {
            return Err(anyhow!("aws config: bearer_token is required"));
        }
        if self.identity_store_id.is_empty() {
            return Err(anyhow!("aws config: identity_store_id is required"));
        }
        Ok(())
    }
}

pub struct AwsDefinition;

impl ConnectorDefinition for AwsDefinition {
    fn kind(&self) -> &'static str {
        "aws"
    }

    fn display_name(&self) -> &'static str {
        "AWS Identity Center"
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        AwsConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = AwsConfig::decode(config)?;
        let api = Arc::new(AwsIdentityCenterHttp::new(&cfg)?);
        Ok(Box::new(AwsIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AwsPermissionSet {
    pub arn: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct AwsAssignment {
    /// `USER` or `GROUP`.
    pub principal_type: String,
    pub principal_id: String,
}

#[derive(Debug, Clone)]
pub struct AwsUser {
    pub id: String,
    pub user_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

#[async_trait]
pub trait AwsSsoApi: Send + Sync {
    async fn list_users(&self, next: Option<&str>) -> Result<Page<AwsUser>>;
    async fn list_permission_sets(&self, next: Option<&str>) -> Result<Page<AwsPermissionSet>>;
    async fn list_accounts_for_permission_set(
        &self,
        permission_set_arn: &str,
        next: Option<&str>,
    ) -> Result<Page<String>>;
    async fn list_assignments(
        &self,
        account_id: &str,
        permission_set_arn: &str,
        next: Option<&str>,
    ) -> Result<Page<AwsAssignment>>;
    async fn list_group_member_ids(
        &self,
        group_id: &str,
        next: Option<&str>,
    ) -> Result<Page<String>>;
}

// ---------------------------------------------------------------------------
// Expansion + dedup
// ---------------------------------------------------------------------------

/// One user's effective access to `(account, permission_set)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct AwsEntitlementFact {
    pub user_id: String,
    pub account_id: String,
    pub permission_set: String,
    /// `direct` or `group`.
    pub assignment_source: String,
    pub via_group: Option<String>,
}

/// Expand raw assignments into per-user facts: `USER` assignments map
/// one-to-one; `GROUP` assignments fan out to one fact per member with the
/// group recorded.
pub fn expand_entitlements(
    assignments: &[(String, String, Vec<AwsAssignment>)],
    permission_set_names: &HashMap<String, String>,
    group_members: &HashMap<String, Vec<String>>,
) -> Vec<AwsEntitlementFact> {
    let mut facts = Vec::new();

    for (account_id, ps_arn, entries) in assignments {
        let Some(permission_set) = permission_set_names.get(ps_arn) else {
            continue;
        };
        for entry in entries {
            if entry.principal_type.eq_ignore_ascii_case("USER") {
                facts.push(AwsEntitlementFact {
                    user_id: entry.principal_id.clone(),
                    account_id: account_id.clone(),
                    permission_set: permission_set.clone(),
                    assignment_source: ASSIGNMENT_SOURCE_DIRECT.to_string(),
                    via_group: None,
                });
            } else if entry.principal_type.eq_ignore_ascii_case("GROUP") {
                for member in group_members
                    .get(&entry.principal_id)
                    .map(Vec::as_slice)
                    .unwrap_or_default()
                {
                    facts.push(AwsEntitlementFact {
                        user_id: member.clone(),
                        account_id: account_id.clone(),
                        permission_set: permission_set.clone(),
                        assignment_source: ASSIGNMENT_SOURCE_GROUP.to_string(),
                        via_group: Some(entry.principal_id.clone()),
                    });
                }
            }
        }
    }

    facts
}

/// Collapse duplicate `(user, account, permission_set)` facts. When both a
/// direct and a group-based assignment exist for the same key, the direct
/// row wins; group-only duplicates keep their first occurrence. Stable
/// against repeated passes over the same upstream data.
pub fn dedupe_entitlements(facts: Vec<AwsEntitlementFact>) -> Vec<AwsEntitlementFact> {
    let mut has_direct: HashSet<(String, String, String)> = HashSet::new();
    for fact in &facts {
        if fact.assignment_source == ASSIGNMENT_SOURCE_DIRECT {
            has_direct.insert((
                fact.user_id.clone(),
                fact.account_id.clone(),
                fact.permission_set.clone(),
            ));
        }
    }

    let mut out: BTreeMap<(String, String, String), AwsEntitlementFact> = BTreeMap::new();
    for fact in facts {
        let key = (
            fact.user_id.clone(),
            fact.account_id.clone(),
            fact.permission_set.clone(),
        );
        if has_direct.contains(&key) && fact.assignment_source != ASSIGNMENT_SOURCE_DIRECT {
            continue;
        }
        out.entry(key).or_insert(fact);
    }

    out.into_values().collect()
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct AwsIntegration {
    cfg: AwsConfig,
    api: Arc<dyn AwsSsoApi>,
}

impl AwsIntegration {
    pub fn new(cfg: AwsConfig, api: Arc<dyn AwsSsoApi>) -> Self {
        Self { cfg, api }
    }

    async fn sync_users(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mut next: Option<String> = None;
        let mut batch: Vec<AppUserRecord> = Vec::new();
        let mut seen: i64 = 0;

        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_users(next.as_deref()).await.tag_api()?;
            for user in page.items {
                let external_id = user.id.trim().to_string();
                if external_id.is_empty() {
                    continue;
                }
                seen += 1;
                batch.push(AppUserRecord {
                    external_id,
                    email: user.email.as_deref().and_then(normalize_email),
                    display_name: user.display_name.or(user.user_name),
                    status: None,
                    is_admin: false,
                });
                if batch.len() >= USER_BATCH {
                    deps.store
                        .upsert_app_users_bulk_by_source("aws", self.name(), run.run_id(), &batch)
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
                .upsert_app_users_bulk_by_source("aws", self.name(), run.run_id(), &batch)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AppUsers);
        Ok(())
    }

    /// Permission sets → accounts → assignments, then in-process group
    /// expansion and direct-over-group dedup.
    async fn list_user_entitlements(
        &self,
        deps: &IntegrationDeps,
        run: &mut RunLifecycle,
    ) -> Result<Vec<AwsEntitlementFact>> {
        let mut permission_sets: Vec<AwsPermissionSet> = Vec::new();
        let mut next: Option<String> = None;
        loop {
            check_cancel(&deps.cancel)?;
            let page = self.api.list_permission_sets(next.as_deref()).await.tag_api()?;
            permission_sets.extend(page.items);
            match page.next {
                Some(n) if !n.is_empty() => next = Some(n),
                _ => break,
            }
        }

        let permission_set_names: HashMap<String, String> = permission_sets
            .iter()
            .map(|ps| (ps.arn.clone(), ps.name.clone()))
            .collect();

        let total = permission_sets.len() as i64;
        let mut raw_assignments: Vec<(String, String, Vec<AwsAssignment>)> = Vec::new();
        let mut group_ids: HashSet<String> = HashSet::new();

        for (idx, ps) in permission_sets.iter().enumerate() {
            check_cancel(&deps.cancel)?;

            let mut accounts: Vec<String> = Vec::new();
            let mut next: Option<String> = None;
            loop {
                let page = self
                    .api
                    .list_accounts_for_permission_set(&ps.arn, next.as_deref())
                    .await
                    .tag_api()?;
                accounts.extend(page.items);
                match page.next {
                    Some(n) if !n.is_empty() => next = Some(n),
                    _ => break,
                }
            }

            for account_id in accounts {
                let mut entries: Vec<AwsAssignment> = Vec::new();
                let mut next: Option<String> = None;
                loop {
                    let page = self
                        .api
                        .list_assignments(&account_id, &ps.arn, next.as_deref())
                        .await
                        .tag_api()?;
                    entries.extend(page.items);
                    match page.next {
                        Some(n) if !n.is_empty() => next = Some(n),
                        _ => break,
                    }
                }
                for entry in &entries {
                    if entry.principal_type.eq_ignore_ascii_case("GROUP") {
                        group_ids.insert(entry.principal_id.clone());
                    }
                }
                raw_assignments.push((account_id, ps.arn.clone(), entries));
            }

            run.emit("list-assignments", idx as i64 + 1, total);
        }

        let mut group_members: HashMap<String, Vec<String>> = HashMap::new();
        for group_id in group_ids {
            check_cancel(&deps.cancel)?;
            let mut members: Vec<String> = Vec::new();
            let mut next: Option<String> = None;
            loop {
                let page = self
                    .api
                    .list_group_member_ids(&group_id, next.as_deref())
                    .await
                    .tag_api()?;
                members.extend(page.items);
                match page.next {
                    Some(n) if !n.is_empty() => next = Some(n),
                    _ => break,
                }
            }
            group_members.insert(group_id, members);
        }

        let facts = expand_entitlements(&raw_assignments, &permission_set_names, &group_members);
        Ok(dedupe_entitlements(facts))
    }

    async fn sync_entitlements(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let facts = self.list_user_entitlements(deps, run).await?;

        let records: Vec<EntitlementRecord> = facts
            .into_iter()
            .filter(|f| !f.user_id.trim().is_empty())
            .map(|f| EntitlementRecord {
                external_id: format!("{}|{}|{}", f.user_id, f.account_id, f.permission_set),
                account_external_id: f.user_id,
                resource: f.account_id,
                permission: f.permission_set,
                assignment_source: f.assignment_source,
                via_group: f.via_group,
            })
            .collect();

        for chunk in records.chunks(ENTITLEMENT_BATCH) {
            deps.store
                .upsert_entitlements_bulk_by_source("aws", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::Entitlements);
        Ok(())
    }
}

#[async_trait]
impl Integration for AwsIntegration {
    fn kind(&self) -> &str {
        "aws"
    }

    fn name(&self) -> &str {
        &self.cfg.identity_store_id
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("aws/{}", self.cfg.identity_store_id);
        vec![
            Event::progress(source.clone(), "list-users", 0, UNKNOWN_TOTAL),
            Event::progress(source, "list-assignments", 0, UNKNOWN_TOTAL),
        ]
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        let res = async {
            self.sync_users(deps, &mut run).await?;
            self.sync_entitlements(deps, &mut run).await
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

/// Thin JSON client against an Identity Center gateway endpoint. Vendor
/// protocol fidelity is not the point here; the driver above is.
pub struct AwsIdentityCenterHttp {
    base: String,
    token: String,
    store_id: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WirePage<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
    next_token: Option<String>,
}

impl AwsIdentityCenterHttp {
    pub fn new(cfg: &AwsConfig) -> Result<Self> {
        Ok(Self {
            base: cfg.endpoint.clone(),
            token: cfg.bearer_token.clone(),
            store_id: cfg.identity_store_id.clone(),
            client: http::client()?,
        })
    }

    async fn get_page<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        next: Option<&str>,
    ) -> Result<WirePage<T>> {
        let mut req = self
            .client
            .get(format!("{}{}", self.base, path))
            .bearer_auth(&self.token)
            .query(&[("identity_store_id", self.store_id.as_str())]);
        if let Some(next) = next {
            req = req.query(&[("next_token", next)]);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("aws GET {path} failed"))?;
        http::read_json(resp).await
    }
}

#[derive(Deserialize)]
struct WireAwsUser {
    id: String,
    user_name: Option<String>,
    display_name: Option<String>,
    email: Option<String>,
}

#[derive(Deserialize)]
struct WirePermissionSet {
    arn: String,
    name: String,
}

#[derive(Deserialize)]
struct WireAssignment {
    principal_type: String,
    principal_id: String,
}

#[async_trait]
impl AwsSsoApi for AwsIdentityCenterHttp {
    async fn list_users(&self, next: Option<&str>) -> Result<Page<AwsUser>> {
        let page: WirePage<WireAwsUser> = self.get_page("/identitystore/users", next).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|u| AwsUser {
                    id: u.id,
                    user_name: u.user_name,
                    display_name: u.display_name,
                    email: u.email,
                })
                .collect(),
            next: page.next_token,
        })
    }

    async fn list_permission_sets(&self, next: Option<&str>) -> Result<Page<AwsPermissionSet>> {
        let page: WirePage<WirePermissionSet> =
            self.get_page("/sso/permission-sets", next).await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|ps| AwsPermissionSet {
                    arn: ps.arn,
                    name: ps.name,
                })
                .collect(),
            next: page.next_token,
        })
    }

    async fn list_accounts_for_permission_set(
        &self,
        permission_set_arn: &str,
        next: Option<&str>,
    ) -> Result<Page<String>> {
        let page: WirePage<String> = self
            .get_page(
                &format!("/sso/permission-sets/{permission_set_arn}/accounts"),
                next,
            )
            .await?;
        Ok(Page {
            items: page.items,
            next: page.next_token,
        })
    }

    async fn list_assignments(
        &self,
        account_id: &str,
        permission_set_arn: &str,
        next: Option<&str>,
    ) -> Result<Page<AwsAssignment>> {
        let page: WirePage<WireAssignment> = self
            .get_page(
                &format!("/sso/accounts/{account_id}/permission-sets/{permission_set_arn}/assignments"),
                next,
            )
            .await?;
        Ok(Page {
            items: page
                .items
                .into_iter()
                .map(|a| AwsAssignment {
                    principal_type: a.principal_type,
                    principal_id: a.principal_id,
                })
                .collect(),
            next: page.next_token,
        })
    }

    async fn list_group_member_ids(
        &self,
        group_id: &str,
        next: Option<&str>,
    ) -> Result<Page<String>> {
        let page: WirePage<String> = self
            .get_page(&format!("/identitystore/groups/{group_id}/members"), next)
            .await?;
        Ok(Page {
            items: page.items,
            next: page.next_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> AwsAssignment {
        AwsAssignment {
            principal_type: "USER".to_string(),
            principal_id: id.to_string(),
        }
    }

    fn group(id: &str) -> AwsAssignment {
        AwsAssignment {
            principal_type: "GROUP".to_string(),
            principal_id: id.to_string(),
        }
    }

    fn fixture() -> Vec<AwsEntitlementFact> {
        // ps-1=Admin on 111111111111 assigned to [u1, g1];
        // ps-2=ReadOnly on 222222222222 assigned to [g1]; g1 = [u1, u2].
        let assignments = vec![
            (
                "111111111111".to_string(),
                "ps-1".to_string(),
                vec![user("u1"), group("g1")],
            ),
            (
                "222222222222".to_string(),
                "ps-2".to_string(),
                vec![group("g1")],
            ),
        ];
        let names = HashMap::from([
            ("ps-1".to_string(), "Admin".to_string()),
            ("ps-2".to_string(), "ReadOnly".to_string()),
        ]);
        let members = HashMap::from([(
            "g1".to_string(),
            vec!["u1".to_string(), "u2".to_string()],
        )]);
        expand_entitlements(&assignments, &names, &members)
    }

    fn fact(
        user: &str,
        account: &str,
        permission: &str,
        source: &str,
        via: Option<&str>,
    ) -> AwsEntitlementFact {
        AwsEntitlementFact {
            user_id: user.to_string(),
            account_id: account.to_string(),
            permission_set: permission.to_string(),
            assignment_source: source.to_string(),
            via_group: via.map(str::to_string),
        }
    }

    #[test]
    fn group_assignments_expand_to_member_facts() {
        let mut facts = fixture();
        facts.sort();
        let mut expected = vec![
            fact("u1", "111111111111", "Admin", "direct", None),
            fact("u1", "111111111111", "Admin", "group", Some("g1")),
            fact("u1", "222222222222", "ReadOnly", "group", Some("g1")),
            fact("u2", "111111111111", "Admin", "group", Some("g1")),
            fact("u2", "222222222222", "ReadOnly", "group", Some("g1")),
        ];
        expected.sort();
        assert_eq!(facts, expected);
    }

    #[test]
    fn dedup_keeps_direct_over_group() {
        let deduped = dedupe_entitlements(fixture());

        let u1_admin: Vec<_> = deduped
            .iter()
            .filter(|f| {
                f.user_id == "u1" && f.account_id == "111111111111" && f.permission_set == "Admin"
            })
            .collect();
        assert_eq!(u1_admin.len(), 1);
        assert_eq!(u1_admin[0].assignment_source, "direct");
        assert_eq!(u1_admin[0].via_group, None);

        assert_eq!(deduped.len(), 4);
    }

    #[test]
    fn dedup_is_stable_across_repeated_passes() {
        let once = dedupe_entitlements(fixture());
        let mut doubled = fixture();
        doubled.extend(fixture());
        let twice = dedupe_entitlements(doubled);
        assert_eq!(once, twice);
    }

    #[test]
    fn unknown_permission_set_is_skipped() {
        let assignments = vec![(
            "111111111111".to_string(),
            "ps-unknown".to_string(),
            vec![user("u1")],
        )];
        let facts = expand_entitlements(&assignments, &HashMap::new(), &HashMap::new());
        assert!(facts.is_empty());
    }
}
