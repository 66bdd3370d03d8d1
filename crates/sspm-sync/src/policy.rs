//! Pure run-due decision over finished-run history.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::time::Duration;

use sspm_store::{FinishedRun, RunStatus};

#[derive(Debug, Clone)]
pub struct RunPolicy {
    /// Per-kind schedule interval. Kinds absent here use `default_interval`.
    pub interval_by_kind: HashMap<String, Duration>,
    /// Interval for kinds without an explicit entry. Zero disables the
    /// interval gate for those kinds.
    pub default_interval: Duration,
    /// Base of the exponential failure backoff. Zero disables backoff.
    pub failure_backoff_base: Duration,
    /// Saturation ceiling for the failure backoff.
    pub failure_backoff_max: Duration,
    /// How much history the planner fetches per source.
    pub recent_finished_run_cap: i64,
}

impl Default for RunPolicy {
    fn default() -> Self {
        Self {
            interval_by_kind: HashMap::new(),
            default_interval: Duration::from_secs(3600),
            failure_backoff_base: Duration::from_secs(60),
            failure_backoff_max: Duration::from_secs(3600),
            recent_finished_run_cap: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub should_run: bool,
    pub reason: String,
}

impl Decision {
    fn run(reason: impl Into<String>) -> Self {
        Self {
            should_run: true,
            reason: reason.into(),
        }
    }

    fn defer(reason: impl Into<String>) -> Self {
        Self {
            should_run: false,
            reason: reason.into(),
        }
    }
}

impl RunPolicy {
    pub fn interval_for(&self, kind: &str) -> Duration {
        self.interval_by_kind
            .get(kind)
            .copied()
            .unwrap_or(self.default_interval)
    }

    /// Decide whether `(kind, …)` should run at `now`, given its history
    /// ordered most-recent-first. Forced runs bypass this entirely.
    pub fn decide(&self, now: DateTime<Utc>, kind: &str, history: &[FinishedRun]) -> Decision {
        if history.is_empty() {
            return Decision::run("no history");
        }

        let latest = &history[0];
        let Some(latest_finished) = latest.finished_at else {
            return Decision::run("no finished_at");
        };

        // Leading failures and the most recent success.
        let mut failures: u32 = 0;
        let mut last_success_at: Option<DateTime<Utc>> = None;
        for run in history {
            if run.status == RunStatus::Success {
                last_success_at = run.finished_at;
                break;
            }
            failures += 1;
        }

        let interval = self.interval_for(kind);

        // Interval gate.
        if failures == 0 && !interval.is_zero() {
            if let Some(success_at) = last_success_at {
                let next = success_at + chrono_dur(interval);
                if now < next {
                    return Decision::defer(format!("not due until {}", next.to_rfc3339()));
                }
            }
        }

        // Backoff gate.
        if failures > 0 && !self.failure_backoff_base.is_zero() {
            let delay = backoff_delay(self.failure_backoff_base, self.failure_backoff_max, failures);
            let next = latest_finished + chrono_dur(delay);
            if now < next {
                return Decision::defer(format!(
                    "backing off after {} failure(s); not due until {}",
                    failures,
                    next.to_rfc3339()
                ));
            }
            return Decision::run(format!("backoff elapsed after {} failure(s)", failures));
        }

        Decision::run("interval elapsed")
    }
}

/// `base * 2^(failures-1)`, saturated at `max`.
fn backoff_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(20);
    base.saturating_mul(1u32 << shift).min(max)
}

fn chrono_dur(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::max_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(minutes_ago: i64, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        Some(now - ChronoDuration::minutes(minutes_ago))
    }

    fn policy_with_interval(kind: &str, interval: Duration) -> RunPolicy {
        let mut p = RunPolicy {
            failure_backoff_base: Duration::from_secs(60),
            failure_backoff_max: Duration::from_secs(3600),
            ..RunPolicy::default()
        };
        p.interval_by_kind.insert(kind.to_string(), interval);
        p
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn empty_history_runs() {
        let p = RunPolicy::default();
        let d = p.decide(now(), "okta", &[]);
        assert!(d.should_run);
        assert_eq!(d.reason, "no history");
    }

    #[test]
    fn missing_finished_at_runs() {
        let p = RunPolicy::default();
        let history = [FinishedRun {
            status: RunStatus::Error,
            finished_at: None,
        }];
        let d = p.decide(now(), "okta", &history);
        assert!(d.should_run);
        assert_eq!(d.reason, "no finished_at");
    }

    #[test]
    fn interval_gate_defers_recent_success() {
        // interval=1h, success 30m ago: not due, reason carries now+30m.
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        let history = [FinishedRun {
            status: RunStatus::Success,
            finished_at: at(30, now),
        }];
        let d = p.decide(now, "okta", &history);
        assert!(!d.should_run);
        let expected_next = (now + ChronoDuration::minutes(30)).to_rfc3339();
        assert!(
            d.reason.contains(&expected_next),
            "reason should name the next due time: {}",
            d.reason
        );
    }

    #[test]
    fn interval_gate_allows_old_success() {
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        let history = [FinishedRun {
            status: RunStatus::Success,
            finished_at: at(61, now),
        }];
        assert!(p.decide(now, "okta", &history).should_run);
    }

    #[test]
    fn interval_boundary_is_inclusive() {
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        let history = [FinishedRun {
            status: RunStatus::Success,
            finished_at: at(60, now),
        }];
        assert!(p.decide(now, "okta", &history).should_run);
    }

    #[test]
    fn backoff_window_doubles_and_saturates() {
        assert_eq!(
            backoff_delay(Duration::from_secs(60), Duration::from_secs(3600), 1),
            Duration::from_secs(60)
        );
        assert_eq!(
            backoff_delay(Duration::from_secs(60), Duration::from_secs(3600), 3),
            Duration::from_secs(240)
        );
        assert_eq!(
            backoff_delay(Duration::from_secs(60), Duration::from_secs(3600), 12),
            Duration::from_secs(3600)
        );
    }

    #[test]
    fn failures_defer_within_backoff_window() {
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        // Two leading failures: delay = 60 * 2 = 120s; latest finished 1m ago.
        let history = [
            FinishedRun {
                status: RunStatus::Error,
                finished_at: at(1, now),
            },
            FinishedRun {
                status: RunStatus::Error,
                finished_at: at(10, now),
            },
            FinishedRun {
                status: RunStatus::Success,
                finished_at: at(20, now),
            },
        ];
        let d = p.decide(now, "okta", &history);
        assert!(!d.should_run);
        assert!(d.reason.contains("backing off"));
    }

    #[test]
    fn failures_run_after_backoff_elapsed() {
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        let history = [
            FinishedRun {
                status: RunStatus::Error,
                finished_at: at(5, now),
            },
            FinishedRun {
                status: RunStatus::Success,
                finished_at: at(90, now),
            },
        ];
        // One failure: delay 60s, finished 5m ago: due.
        assert!(p.decide(now, "okta", &history).should_run);
    }

    #[test]
    fn canceled_counts_as_failure() {
        let now = now();
        let p = policy_with_interval("okta", Duration::from_secs(3600));
        let history = [FinishedRun {
            status: RunStatus::Canceled,
            finished_at: at(0, now),
        }];
        assert!(!p.decide(now, "okta", &history).should_run);
    }
}
