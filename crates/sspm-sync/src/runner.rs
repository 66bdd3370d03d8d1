//! The `Runner` seam: anything that can execute one sync pass.

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::trigger::TriggerRequest;

/// One pass request. Carries what Go would put on the context: the force
/// flag, an optional connector scope, and the cancellation token.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Forced passes bypass the run policy.
    pub forced: bool,
    /// Restrict the pass to one `(connector_kind, source_name)`.
    pub scope: Option<TriggerRequest>,
    pub cancel: CancellationToken,
}

impl RunRequest {
    pub fn scheduled(cancel: CancellationToken) -> Self {
        Self {
            forced: false,
            scope: None,
            cancel,
        }
    }

    pub fn forced(scope: Option<TriggerRequest>, cancel: CancellationToken) -> Self {
        Self {
            forced: true,
            scope,
            cancel,
        }
    }
}

#[async_trait]
pub trait Runner: Send + Sync {
    async fn run_once(&self, req: &RunRequest) -> Result<()>;
}
