//! GitHub member ingestion: org admins come from the role-filtered listing
//! and land as `is_admin` on the ingested app users.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use sspm_connectors::github::{
    GithubApi, GithubConfig, GithubIntegration, GithubMember, GithubRepo, GithubTeam,
};
use sspm_connectors::Page;
use sspm_store::RunStatus;
use sspm_sync::{Integration, IntegrationDeps, NullReporter, RunMode};
use sspm_testkit::MemStore;

struct ScriptedGithub;

fn member(id: i64, login: &str) -> GithubMember {
    GithubMember {
        id,
        login: login.to_string(),
        email: Some(format!("{login}@acme.com")),
    }
}

#[async_trait]
impl GithubApi for ScriptedGithub {
    async fn list_org_members(&self, _page: u32) -> Result<Page<GithubMember>> {
        Ok(Page::last(vec![
            member(1, "octocat"),
            member(2, "hubot"),
            member(3, "mona"),
        ]))
    }

    async fn list_org_admin_logins(&self, _page: u32) -> Result<Page<String>> {
        Ok(Page::last(vec!["hubot".to_string()]))
    }

    async fn list_teams(&self, _page: u32) -> Result<Page<GithubTeam>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_team_member_logins(&self, _team_slug: &str, _page: u32) -> Result<Page<String>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_repos(&self, _page: u32) -> Result<Page<GithubRepo>> {
        Ok(Page::last(Vec::new()))
    }

    async fn list_repo_admin_logins(&self, _repo: &str, _page: u32) -> Result<Page<String>> {
        Ok(Page::last(Vec::new()))
    }
}

#[tokio::test]
async fn org_admins_map_to_is_admin() {
    let store = Arc::new(MemStore::new());
    let deps = IntegrationDeps {
        store: store.clone(),
        reporter: Arc::new(NullReporter),
        mode: RunMode::Full,
        cancel: CancellationToken::new(),
    };

    let it = GithubIntegration::new(
        GithubConfig {
            org: "acme".to_string(),
            token: "ghp_x".to_string(),
        },
        Arc::new(ScriptedGithub),
    );
    it.run(&deps).await.unwrap();

    let runs = store.sync_runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, RunStatus::Success);

    let users = store.app_users_snapshot("github", "acme");
    assert_eq!(users.len(), 3);
    for user in &users {
        let expect_admin = user.record.external_id == "hubot";
        assert_eq!(
            user.record.is_admin, expect_admin,
            "wrong admin flag for {}",
            user.record.external_id
        );
    }
}
