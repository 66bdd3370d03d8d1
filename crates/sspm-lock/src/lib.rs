//! Distributed mutual exclusion for sync passes.
//!
//! Two interchangeable schemes behind one pair of traits:
//!
//! - **Lease** ([`LeaseLockManager`]): a row per scope with a holder token
//!   and TTL, kept alive by a heartbeat renewer. Survives crashed holders
//!   (the row expires) and works from any process that can reach the store.
//! - **Advisory** ([`AdvisoryLockManager`]): Postgres session advisory
//!   locks. No heartbeat needed, but each held lock pins a pooled
//!   connection for its lifetime.
//!
//! Scope shape: per-connector `("connector", "<kind>/<source>")`, global
//! `("sync", "runonce_full" | "runonce_discovery")`.

use std::fmt;

mod advisory;
mod lease;
mod managed;
mod traits;

pub use advisory::{advisory_lock_key, AdvisoryLockManager};
pub use lease::{LeaseLockConfig, LeaseLockManager};
pub use managed::run_locked;
pub use traits::{HeartbeatHandle, Lock, LockManager, OnLost};

pub const SCOPE_KIND_CONNECTOR: &str = "connector";
pub const SCOPE_KIND_SYNC: &str = "sync";
pub const SCOPE_RUNONCE_FULL: &str = "runonce_full";
pub const SCOPE_RUNONCE_DISCOVERY: &str = "runonce_discovery";

/// Scope name for a per-connector lock.
pub fn connector_scope_name(kind: &str, source_name: &str) -> String {
    format!("{}/{}", kind, source_name)
}

// ---------------------------------------------------------------------------
// SyncLockLost
// ---------------------------------------------------------------------------

/// A held lease was lost mid-run (renew failed because another holder took
/// the scope). Optionally wraps the work's own error so both survive in the
/// chain; the orchestrator treats any chain containing this as
/// non-retryable.
#[derive(Debug, Default)]
pub struct SyncLockLost {
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl SyncLockLost {
    pub fn new() -> Self {
        Self { source: None }
    }

    pub fn wrapping(err: anyhow::Error) -> Self {
        Self {
            source: Some(err.into()),
        }
    }
}

impl fmt::Display for SyncLockLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync lock lost")
    }
}

impl std::error::Error for SyncLockLost {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Whether any link of the chain is a lost-lease signal.
pub fn is_lock_lost(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<SyncLockLost>().is_some())
}

// ---------------------------------------------------------------------------
// Instance identity
// ---------------------------------------------------------------------------

/// Holder instance id recorded on lease rows: `HOSTNAME` env, OS hostname,
/// or the literal `"unknown"`. Resolved at lock-manager construction, not
/// cached at process scope.
pub fn instance_id() -> String {
    if let Ok(v) = std::env::var("HOSTNAME") {
        let v = v.trim();
        if !v.is_empty() {
            return v.to_string();
        }
    }
    if let Ok(v) = std::fs::read_to_string("/etc/hostname") {
        let v = v.trim();
        if !v.is_empty() {
            return v.to_string();
        }
    }
    "unknown".to_string()
}
