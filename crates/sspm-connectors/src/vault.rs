//! Vault connector: KV secret metadata as credential artifacts, mounts as
//! app assets. Also carries the compliance-evaluator hook: after a clean
//! pass it re-checks rotation age across the artifacts it can see.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;

use sspm_store::{AppAssetRecord, CredentialArtifactRecord, EntityClass, Store};
use sspm_sync::{
    ConnectorDefinition, Event, Integration, IntegrationDeps, Role, UNKNOWN_TOTAL,
};

use crate::http;
use crate::lifecycle::{check_cancel, RunLifecycle, TagErr, ASSET_BATCH, CREDENTIAL_BATCH};
use crate::Page;

/// Rotation age beyond which the compliance evaluator flags an artifact.
const STALE_ROTATION_DAYS: i64 = 90;
/// Folder recursion guard for pathological KV trees.
const MAX_LIST_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub addr: String,
    pub token: String,
    /// KV v2 mounts to walk; empty means every kv mount reported upstream.
    #[serde(default)]
    pub mounts: Vec<String>,
}

impl VaultConfig {
    fn decode(raw: &serde_json::Value) -> Result<Self> {
        let mut cfg: VaultConfig =
            serde_json::from_value(raw.clone()).context("decoding vault config failed")?;
        cfg.addr = cfg.addr.trim().trim_end_matches('/').to_string();
        cfg.token = cfg.token.trim().to_string();
        cfg.mounts = cfg
            .mounts
            .iter()
            .map(|m| m.trim().trim_matches('/').to_string())
            .filter(|m| !m.is_empty())
            .collect();
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.addr.is_empty() {
            return Err(anyhow!("vault config: addr is required"));
        }
        if self.token.is_empty() {
            return Err(anyhow!("vault config: token is required"));
        }
        Ok(())
    }

    fn source_name(&self) -> String {
        self.addr
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_string()
    }
}

pub struct VaultDefinition;

impl ConnectorDefinition for VaultDefinition {
    fn kind(&self) -> &'static str {
        "vault"
    }

    fn display_name(&self) -> &'static str {
        "HashiCorp Vault"
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn is_configured(&self, config: &serde_json::Value) -> bool {
        VaultConfig::decode(config).is_ok()
    }

    fn new_integration(&self, config: &serde_json::Value) -> Result<Box<dyn Integration>> {
        let cfg = VaultConfig::decode(config)?;
        let api = Arc::new(VaultHttp::new(&cfg)?);
        Ok(Box::new(VaultIntegration::new(cfg, api)))
    }
}

// ---------------------------------------------------------------------------
// API surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VaultMount {
    pub path: String,
    pub engine_type: String,
}

#[derive(Debug, Clone)]
pub struct VaultSecretMeta {
    pub created_time: Option<DateTime<Utc>>,
    pub updated_time: Option<DateTime<Utc>>,
    pub current_version: i64,
}

#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn list_mounts(&self) -> Result<Vec<VaultMount>>;
    /// Children of a folder: leaves are secret names, folders end with `/`.
    async fn list_keys(&self, mount: &str, folder: &str) -> Result<Vec<String>>;
    async fn read_secret_metadata(&self, mount: &str, path: &str) -> Result<VaultSecretMeta>;
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

pub struct VaultIntegration {
    cfg: VaultConfig,
    source_name: String,
    api: Arc<dyn VaultApi>,
}

impl VaultIntegration {
    pub fn new(cfg: VaultConfig, api: Arc<dyn VaultApi>) -> Self {
        let source_name = cfg.source_name();
        Self {
            cfg,
            source_name,
            api,
        }
    }

    async fn kv_mounts(&self) -> Result<Vec<String>> {
        if !self.cfg.mounts.is_empty() {
            return Ok(self.cfg.mounts.clone());
        }
        let mounts = self.api.list_mounts().await?;
        Ok(mounts
            .into_iter()
            .filter(|m| m.engine_type == "kv")
            .map(|m| m.path.trim_matches('/').to_string())
            .collect())
    }

    /// Walk one mount's folder tree, collecting secret paths.
    /// Composite keys `(mount, path)` are unique per source, so repeated
    /// listings of shared folders cannot produce duplicate artifacts.
    async fn walk_mount(
        &self,
        deps: &IntegrationDeps,
        mount: &str,
    ) -> Result<BTreeMap<String, VaultSecretMeta>> {
        let mut secrets: BTreeMap<String, VaultSecretMeta> = BTreeMap::new();
        let mut folders: Vec<(String, usize)> = vec![(String::new(), 0)];

        while let Some((folder, depth)) = folders.pop() {
            check_cancel(&deps.cancel)?;
            if depth > MAX_LIST_DEPTH {
                continue;
            }
            let keys = self.api.list_keys(mount, &folder).await?;
            for key in keys {
                if key.is_empty() {
                    continue;
                }
                if let Some(sub) = key.strip_suffix('/') {
                    folders.push((format!("{folder}{sub}/"), depth + 1));
                } else {
                    let path = format!("{folder}{key}");
                    if secrets.contains_key(&path) {
                        continue;
                    }
                    let meta = self.api.read_secret_metadata(mount, &path).await?;
                    secrets.insert(path, meta);
                }
            }
        }

        Ok(secrets)
    }

    async fn sync_full(&self, deps: &IntegrationDeps, run: &mut RunLifecycle) -> Result<()> {
        let mounts = self.kv_mounts().await.tag_api()?;

        let assets: Vec<AppAssetRecord> = mounts
            .iter()
            .map(|m| AppAssetRecord {
                external_id: m.clone(),
                name: m.clone(),
                asset_kind: "kv_mount".to_string(),
                url: None,
            })
            .collect();
        for chunk in assets.chunks(ASSET_BATCH) {
            deps.store
                .upsert_app_assets_bulk_by_source("vault", self.name(), run.run_id(), chunk)
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::AppAssets);

        let total = mounts.len() as i64;
        let mut artifacts: Vec<CredentialArtifactRecord> = Vec::new();
        for (idx, mount) in mounts.iter().enumerate() {
            let secrets = self.walk_mount(deps, mount).await.tag_api()?;
            for (path, meta) in secrets {
                let name = path.rsplit('/').next().unwrap_or(&path).to_string();
                artifacts.push(CredentialArtifactRecord {
                    external_id: format!("{mount}/{path}"),
                    name,
                    artifact_kind: "kv_secret".to_string(),
                    path: Some(format!("{mount}/{path}")),
                    created_upstream_at: meta.created_time,
                    last_rotated_at: meta.updated_time.or(meta.created_time),
                });
            }
            run.emit("list-secrets", idx as i64 + 1, total);
        }

        for chunk in artifacts.chunks(CREDENTIAL_BATCH) {
            deps.store
                .upsert_credential_artifacts_bulk_by_source(
                    "vault",
                    self.name(),
                    run.run_id(),
                    chunk,
                )
                .await
                .tag_db()?;
        }
        run.touch(EntityClass::CredentialArtifacts);
        Ok(())
    }
}

/// Artifacts whose last rotation is older than the threshold.
pub(crate) fn stale_artifacts(
    metas: &BTreeMap<String, VaultSecretMeta>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let cutoff = now - ChronoDuration::days(STALE_ROTATION_DAYS);
    metas
        .iter()
        .filter(|(_, meta)| {
            meta.updated_time
                .or(meta.created_time)
                .is_some_and(|t| t < cutoff)
        })
        .map(|(path, _)| path.clone())
        .collect()
}

#[async_trait]
impl Integration for VaultIntegration {
    fn kind(&self) -> &str {
        "vault"
    }

    fn name(&self) -> &str {
        &self.source_name
    }

    fn role(&self) -> Role {
        Role::App
    }

    fn init_events(&self) -> Vec<Event> {
        let source = format!("vault/{}", self.source_name);
        vec![Event::progress(source, "list-secrets", 0, UNKNOWN_TOTAL)]
    }

    async fn run(&self, deps: &IntegrationDeps) -> Result<()> {
        let mut run = RunLifecycle::begin(deps, self.kind(), self.name()).await?;
        match self.sync_full(deps, &mut run).await {
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

    fn has_compliance_evaluator(&self) -> bool {
        true
    }

    async fn evaluate_compliance(&self, deps: &IntegrationDeps) -> Result<()> {
        let source = format!("vault/{}", self.source_name);
        let mounts = self.kv_mounts().await?;

        let mut stale: Vec<String> = Vec::new();
        for mount in &mounts {
            check_cancel(&deps.cancel)?;
            let secrets = self.walk_mount(deps, mount).await?;
            stale.extend(
                stale_artifacts(&secrets, Utc::now())
                    .into_iter()
                    .map(|p| format!("{mount}/{p}")),
            );
        }

        deps.report(
            Event::message(
                source,
                "compliance",
                format!(
                    "{} credential artifact(s) not rotated in {} days",
                    stale.len(),
                    STALE_ROTATION_DAYS
                ),
            ),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct VaultHttp {
    base: String,
    token: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct WireWrapped<T> {
    data: T,
}

#[derive(Deserialize)]
struct WireKeys {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct WireSecretMeta {
    created_time: Option<DateTime<Utc>>,
    updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    current_version: i64,
}

impl VaultHttp {
    pub fn new(cfg: &VaultConfig) -> Result<Self> {
        Ok(Self {
            base: cfg.addr.clone(),
            token: cfg.token.clone(),
            client: http::client()?,
        })
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .get(format!("{}/v1{path}", self.base))
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("vault GET {path} failed"))?;
        http::read_json(resp).await
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let resp = self
            .client
            .request(
                reqwest::Method::from_bytes(b"LIST").expect("LIST is a valid method"),
                format!("{}/v1{path}", self.base),
            )
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("vault LIST {path} failed"))?;
        http::read_json(resp).await
    }
}

#[async_trait]
impl VaultApi for VaultHttp {
    async fn list_mounts(&self) -> Result<Vec<VaultMount>> {
        let wrapped: WireWrapped<BTreeMap<String, serde_json::Value>> =
            self.get("/sys/mounts").await?;
        Ok(wrapped
            .data
            .into_iter()
            .filter_map(|(path, info)| {
                let engine_type = info.get("type")?.as_str()?.to_string();
                Some(VaultMount {
                    path: path.trim_matches('/').to_string(),
                    engine_type,
                })
            })
            .collect())
    }

    async fn list_keys(&self, mount: &str, folder: &str) -> Result<Vec<String>> {
        let wrapped: WireWrapped<WireKeys> = self
            .list(&format!("/{mount}/metadata/{folder}"))
            .await?;
        Ok(wrapped.data.keys)
    }

    async fn read_secret_metadata(&self, mount: &str, path: &str) -> Result<VaultSecretMeta> {
        let wrapped: WireWrapped<WireSecretMeta> =
            self.get(&format!("/{mount}/metadata/{path}")).await?;
        Ok(VaultSecretMeta {
            created_time: wrapped.data.created_time,
            updated_time: wrapped.data.updated_time,
            current_version: wrapped.data.current_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(updated_days_ago: Option<i64>) -> VaultSecretMeta {
        VaultSecretMeta {
            created_time: Some(Utc::now() - ChronoDuration::days(400)),
            updated_time: updated_days_ago.map(|d| Utc::now() - ChronoDuration::days(d)),
            current_version: 1,
        }
    }

    #[test]
    fn stale_detection_uses_rotation_age() {
        let mut metas = BTreeMap::new();
        metas.insert("db/password".to_string(), meta(Some(120)));
        metas.insert("api/key".to_string(), meta(Some(10)));
        metas.insert("legacy/cert".to_string(), meta(None)); // falls back to created_time

        let stale = stale_artifacts(&metas, Utc::now());
        assert_eq!(stale, vec!["db/password".to_string(), "legacy/cert".to_string()]);
    }

    #[test]
    fn config_normalizes_addr_and_mounts() {
        let cfg = VaultConfig::decode(&serde_json::json!({
            "addr": "https://vault.acme.dev/",
            "token": "s.xyz",
            "mounts": [" secret/ ", "", "kv"]
        }))
        .unwrap();
        assert_eq!(cfg.addr, "https://vault.acme.dev");
        assert_eq!(cfg.mounts, vec!["secret".to_string(), "kv".to_string()]);
        assert_eq!(cfg.source_name(), "vault.acme.dev");
    }
}
