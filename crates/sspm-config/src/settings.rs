//! Typed view over the merged config blob, with environment overrides.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    Lease,
    Advisory,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Lease => "lease",
            LockMode::Advisory => "advisory",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "lease" => Ok(LockMode::Lease),
            "advisory" => Ok(LockMode::Advisory),
            other => Err(anyhow!("invalid lock mode: {}", other)),
        }
    }
}

/// Worker settings. Precedence per field: env var, then config blob, then
/// the default listed here.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `json` | `text`.
    pub log_format: String,
    /// `debug` | `info` | `warn` | `error`.
    pub log_level: String,
    pub lock_mode: LockMode,
    /// Seconds granularity; sub-second values are ceilinged downstream.
    pub lock_ttl: Duration,
    pub heartbeat_interval: Duration,
    pub scheduler_interval: Duration,
    pub interval_by_kind: HashMap<String, Duration>,
    pub default_interval: Duration,
    pub failure_backoff_base: Duration,
    pub failure_backoff_max: Duration,
    pub recent_finished_run_cap: i64,
    /// `best_effort` | `strict`.
    pub global_eval_mode: String,
    pub worker_addr: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_format: "json".to_string(),
            log_level: "info".to_string(),
            lock_mode: LockMode::Lease,
            lock_ttl: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(15),
            scheduler_interval: Duration::from_secs(60),
            interval_by_kind: HashMap::new(),
            default_interval: Duration::from_secs(3600),
            failure_backoff_base: Duration::from_secs(60),
            failure_backoff_max: Duration::from_secs(3600),
            recent_finished_run_cap: 10,
            global_eval_mode: "best_effort".to_string(),
            worker_addr: "127.0.0.1:8870".to_string(),
        }
    }
}

fn cfg_str<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

fn cfg_u64(v: &Value, ptr: &str) -> Option<u64> {
    v.pointer(ptr).and_then(|x| x.as_u64())
}

fn env_or_cfg(env_key: &str, cfg: &Value, ptr: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_key) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Some(v);
        }
    }
    cfg_str(cfg, ptr).map(str::to_string)
}

fn secs(v: Option<u64>, fallback: Duration) -> Duration {
    v.map(Duration::from_secs).unwrap_or(fallback)
}

impl Settings {
    /// Resolve settings from the merged config blob plus the environment.
    pub fn resolve(config: &Value) -> Result<Self> {
        let defaults = Settings::default();

        let lock_mode = match env_or_cfg("SSPM_LOCK_MODE", config, "/lock/mode") {
            Some(raw) => LockMode::parse(&raw)?,
            None => defaults.lock_mode,
        };

        let global_eval_mode = env_or_cfg("SSPM_EVAL_MODE", config, "/sync/eval_mode")
            .unwrap_or(defaults.global_eval_mode);
        if !matches!(global_eval_mode.as_str(), "best_effort" | "strict") {
            return Err(anyhow!("invalid eval mode: {}", global_eval_mode));
        }

        let log_format =
            env_or_cfg("LOG_FORMAT", config, "/log/format").unwrap_or(defaults.log_format);
        if !matches!(log_format.as_str(), "json" | "text") {
            return Err(anyhow!("invalid log format: {}", log_format));
        }

        let log_level =
            env_or_cfg("LOG_LEVEL", config, "/log/level").unwrap_or(defaults.log_level);
        if !matches!(log_level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(anyhow!("invalid log level: {}", log_level));
        }

        let mut interval_by_kind = HashMap::new();
        if let Some(map) = config
            .pointer("/sync/interval_by_kind")
            .and_then(|v| v.as_object())
        {
            for (kind, secs_val) in map {
                let Some(s) = secs_val.as_u64() else {
                    return Err(anyhow!(
                        "sync.interval_by_kind.{kind} must be integer seconds"
                    ));
                };
                interval_by_kind.insert(kind.to_lowercase(), Duration::from_secs(s));
            }
        }

        Ok(Settings {
            log_format,
            log_level,
            lock_mode,
            lock_ttl: secs(cfg_u64(config, "/lock/ttl_secs"), defaults.lock_ttl),
            heartbeat_interval: secs(
                cfg_u64(config, "/lock/heartbeat_interval_secs"),
                defaults.heartbeat_interval,
            ),
            scheduler_interval: secs(
                std::env::var("SSPM_SCHEDULER_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .or_else(|| cfg_u64(config, "/sync/interval_secs")),
                defaults.scheduler_interval,
            ),
            interval_by_kind,
            default_interval: secs(
                cfg_u64(config, "/sync/default_interval_secs"),
                defaults.default_interval,
            ),
            failure_backoff_base: secs(
                cfg_u64(config, "/sync/failure_backoff_base_secs"),
                defaults.failure_backoff_base,
            ),
            failure_backoff_max: secs(
                cfg_u64(config, "/sync/failure_backoff_max_secs"),
                defaults.failure_backoff_max,
            ),
            recent_finished_run_cap: cfg_u64(config, "/sync/recent_finished_run_cap")
                .map(|v| v as i64)
                .unwrap_or(defaults.recent_finished_run_cap),
            global_eval_mode,
            worker_addr: env_or_cfg("SSPM_WORKER_ADDR", config, "/worker/addr")
                .unwrap_or(defaults.worker_addr),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_hold_for_empty_config() {
        let s = Settings::resolve(&json!({})).unwrap();
        assert_eq!(s.log_format, "json");
        assert_eq!(s.lock_mode, LockMode::Lease);
        assert_eq!(s.lock_ttl, Duration::from_secs(60));
        assert_eq!(s.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(s.recent_finished_run_cap, 10);
        assert_eq!(s.global_eval_mode, "best_effort");
    }

    #[test]
    fn config_blob_overrides_defaults() {
        let s = Settings::resolve(&json!({
            "lock": {"mode": "advisory", "ttl_secs": 30},
            "sync": {
                "eval_mode": "strict",
                "interval_by_kind": {"OKTA": 7200},
                "failure_backoff_base_secs": 120
            },
            "log": {"format": "text", "level": "debug"}
        }))
        .unwrap();
        assert_eq!(s.lock_mode, LockMode::Advisory);
        assert_eq!(s.lock_ttl, Duration::from_secs(30));
        assert_eq!(s.global_eval_mode, "strict");
        assert_eq!(
            s.interval_by_kind.get("okta"),
            Some(&Duration::from_secs(7200))
        );
        assert_eq!(s.failure_backoff_base, Duration::from_secs(120));
        assert_eq!(s.log_format, "text");
        assert_eq!(s.log_level, "debug");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(Settings::resolve(&json!({"lock": {"mode": "zookeeper"}})).is_err());
        assert!(Settings::resolve(&json!({"log": {"format": "xml"}})).is_err());
        assert!(Settings::resolve(&json!({"sync": {"eval_mode": "sometimes"}})).is_err());
        assert!(
            Settings::resolve(&json!({"sync": {"interval_by_kind": {"okta": "1h"}}})).is_err()
        );
    }

    #[test]
    fn lock_mode_round_trip() {
        assert_eq!(LockMode::parse("lease").unwrap(), LockMode::Lease);
        assert_eq!(LockMode::parse("advisory").unwrap(), LockMode::Advisory);
        assert_eq!(LockMode::Advisory.as_str(), "advisory");
    }
}
