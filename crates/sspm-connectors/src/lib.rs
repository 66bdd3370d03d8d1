//! Connector drivers. Each vendor module carries its config decoding, an
//! object-safe API trait with the reqwest-backed production client, and the
//! `Integration` that drives the canonical run lifecycle against it.

pub mod aws;
pub mod datadog;
pub mod entra;
pub mod github;
mod http;
pub mod lifecycle;
pub mod okta;
pub mod vault;

use std::sync::Arc;

use sspm_sync::ConnectorDefinition;

/// One page of a paginated vendor listing. `next` is the opaque cursor for
/// the following page; absent or empty means the listing is exhausted.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// Every connector definition this build ships, keyed by its stable kind.
pub fn registry() -> Vec<Arc<dyn ConnectorDefinition>> {
    vec![
        Arc::new(okta::OktaDefinition),
        Arc::new(entra::EntraDefinition),
        Arc::new(aws::AwsDefinition),
        Arc::new(datadog::DatadogDefinition),
        Arc::new(github::GithubDefinition),
        Arc::new(vault::VaultDefinition),
    ]
}
