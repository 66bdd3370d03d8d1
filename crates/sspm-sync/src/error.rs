//! Error taxonomy: stable boundary sentinels, multi-error aggregation, and
//! the retryable-timeout classifier.
//!
//! Sentinels travel inside `anyhow` chains and inside [`AggregateError`]
//! members; all predicates here walk both.

use sspm_lock::SyncLockLost;
use std::fmt;

/// Persisted `error_kind` values on failed sync runs.
pub mod error_kind {
    pub const API: &str = "api";
    pub const DB: &str = "db";
    pub const CONTEXT_CANCELED: &str = "context_canceled";
    pub const UNKNOWN: &str = "unknown";
}

#[derive(Debug, thiserror::Error)]
#[error("no enabled connectors")]
pub struct NoEnabledConnectors;

#[derive(Debug, thiserror::Error)]
#[error("no connectors due")]
pub struct NoConnectorsDue;

#[derive(Debug, thiserror::Error)]
#[error("sync already running")]
pub struct SyncAlreadyRunning;

#[derive(Debug, thiserror::Error)]
#[error("sync queued")]
pub struct SyncQueued;

/// Cooperative-cancellation marker: a run observed its token fire and
/// stopped. Distinct from a timeout; never retried.
#[derive(Debug, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Several independent failures joined into one. Partial-failure passes
/// return this; sentinel predicates see through it.
#[derive(Debug)]
pub struct AggregateError(pub Vec<anyhow::Error>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

/// Join a list of failures: empty is success, a single error passes through
/// unwrapped, several become an [`AggregateError`].
pub fn join_errors(mut errs: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    match errs.len() {
        0 => None,
        1 => Some(errs.remove(0)),
        _ => Some(anyhow::Error::new(AggregateError(errs))),
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

fn matches_anywhere(err: &anyhow::Error, pred: &dyn Fn(&(dyn std::error::Error + 'static)) -> bool) -> bool {
    for cause in err.chain() {
        if pred(cause) {
            return true;
        }
        if let Some(agg) = cause.downcast_ref::<AggregateError>() {
            if agg.0.iter().any(|e| matches_anywhere(e, pred)) {
                return true;
            }
        }
    }
    false
}

pub fn is_no_enabled_connectors(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<NoEnabledConnectors>().is_some())
}

pub fn is_no_connectors_due(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<NoConnectorsDue>().is_some())
}

pub fn is_sync_already_running(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<SyncAlreadyRunning>().is_some())
}

pub fn is_sync_queued(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<SyncQueued>().is_some())
}

pub fn is_canceled(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<Canceled>().is_some())
}

pub fn is_lock_lost(err: &anyhow::Error) -> bool {
    matches_anywhere(err, &|c| c.downcast_ref::<SyncLockLost>().is_some())
}

/// Whether a failed connector run is worth one more attempt.
///
/// True only for genuine timeouts: a `tokio` deadline (`Elapsed`) or an I/O
/// timeout anywhere in the chain. A chain that also carries a lost lease or
/// a cooperative cancellation is *not* retryable: retrying a revoked lock
/// or a canceled pass only delays shutdown.
pub fn is_retryable_timeout_error(err: &anyhow::Error) -> bool {
    if is_lock_lost(err) || is_canceled(err) {
        return false;
    }

    matches_anywhere(err, &|c| {
        if c.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return true;
        }
        if let Some(io) = c.downcast_ref::<std::io::Error>() {
            return io.kind() == std::io::ErrorKind::TimedOut;
        }
        false
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn join_empty_is_none() {
        assert!(join_errors(Vec::new()).is_none());
    }

    #[test]
    fn join_single_passes_through() {
        let err = join_errors(vec![anyhow!("only")]).unwrap();
        assert_eq!(err.to_string(), "only");
    }

    #[test]
    fn join_many_aggregates_and_predicates_see_members() {
        let err = join_errors(vec![
            anyhow!("hard failure"),
            anyhow::Error::new(SyncQueued),
        ])
        .unwrap();
        assert!(is_sync_queued(&err));
        assert!(err.to_string().contains("hard failure"));
    }

    #[test]
    fn predicates_see_through_context() {
        let err = anyhow::Error::new(NoConnectorsDue).context("planner");
        assert!(is_no_connectors_due(&err));
        assert!(!is_no_enabled_connectors(&err));
    }

    #[tokio::test]
    async fn retryable_true_for_elapsed() {
        let elapsed = tokio::time::timeout(
            std::time::Duration::from_millis(1),
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        let err = anyhow::Error::new(elapsed).context("graph page");
        assert!(is_retryable_timeout_error(&err));
    }

    #[test]
    fn retryable_true_for_io_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let err = anyhow::Error::new(io);
        assert!(is_retryable_timeout_error(&err));
    }

    #[test]
    fn retryable_false_for_cancellation() {
        let err = anyhow::Error::new(Canceled);
        assert!(!is_retryable_timeout_error(&err));
    }

    #[test]
    fn retryable_false_when_joined_with_lock_lost() {
        let timeout = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "slow vendor",
        ));
        let err = anyhow::Error::new(sspm_lock::SyncLockLost::wrapping(timeout));
        assert!(!is_retryable_timeout_error(&err));
    }

    #[test]
    fn retryable_false_for_generic_error() {
        assert!(!is_retryable_timeout_error(&anyhow!("boom")));
    }

}
