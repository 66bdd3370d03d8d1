//! Run modes and their source-kind / channel / scope derivations.

use sspm_lock::{SCOPE_RUNONCE_DISCOVERY, SCOPE_RUNONCE_FULL};
use sspm_store::{CHANNEL_RESYNC_DISCOVERY_REQUESTED, CHANNEL_RESYNC_REQUESTED};

/// Full syncs ingest everything a connector emits; discovery runs record
/// only SaaS-app sources and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Full,
    Discovery,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Full => "full",
            RunMode::Discovery => "discovery",
        }
    }

    /// Run-record kind for this mode: discovery runs of okta are recorded
    /// as `okta_discovery`; full runs keep the bare kind.
    pub fn source_kind_for(&self, kind: &str) -> String {
        match self {
            RunMode::Full => kind.to_string(),
            RunMode::Discovery => format!("{kind}_discovery"),
        }
    }

    /// Trigger NOTIFY channel for this mode.
    pub fn channel(&self) -> &'static str {
        match self {
            RunMode::Full => CHANNEL_RESYNC_REQUESTED,
            RunMode::Discovery => CHANNEL_RESYNC_DISCOVERY_REQUESTED,
        }
    }

    /// Global run-once lock scope name for this mode.
    pub fn runonce_scope(&self) -> &'static str {
        match self {
            RunMode::Full => SCOPE_RUNONCE_FULL,
            RunMode::Discovery => SCOPE_RUNONCE_DISCOVERY,
        }
    }
}

/// Kinds that implement a discovery pull. Scoped discovery triggers for any
/// other kind are rejected at enqueue; `supports_run_mode` on the
/// integration remains the per-connector authority at plan time.
pub const DISCOVERY_CAPABLE_KINDS: &[&str] = &["okta", "entra"];

pub fn is_discovery_capable(kind: &str) -> bool {
    DISCOVERY_CAPABLE_KINDS.contains(&kind)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_suffixes_source_kind() {
        assert_eq!(RunMode::Full.source_kind_for("okta"), "okta");
        assert_eq!(RunMode::Discovery.source_kind_for("okta"), "okta_discovery");
    }

    #[test]
    fn discovery_capability_set() {
        assert!(is_discovery_capable("okta"));
        assert!(is_discovery_capable("entra"));
        assert!(!is_discovery_capable("aws"));
        assert!(!is_discovery_capable("vault"));
    }

    #[test]
    fn channels_per_mode() {
        assert_eq!(RunMode::Full.channel(), "open_sspm_resync_requested");
        assert_eq!(
            RunMode::Discovery.channel(),
            "open_sspm_resync_discovery_requested"
        );
    }
}
