//! Job manager configuration.
//!
//! Defaults can be overlaid from `JOBMESH_*` environment variables or loaded
//! from a JSON document with camelCase keys.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobmesh_core::RecordPath;

pub const ENV_REPOSITORY_PATH: &str = "JOBMESH_REPOSITORY_PATH";
pub const ENV_CLEANUP_PERIOD_MINUTES: &str = "JOBMESH_CLEANUP_PERIOD_MINUTES";
pub const ENV_RETENTION_MINUTES: &str = "JOBMESH_RETENTION_MINUTES";
pub const ENV_SLEEP_TIME_MS: &str = "JOBMESH_SLEEP_TIME_MS";
pub const ENV_MAX_JOB_RETRIES: &str = "JOBMESH_MAX_JOB_RETRIES";
pub const ENV_LOCK_TIMEOUT_MS: &str = "JOBMESH_LOCK_TIMEOUT_MS";

pub const DEFAULT_REPOSITORY_PATH: &str = "/var/jobmesh/jobs";
pub const DEFAULT_CLEANUP_PERIOD_MINUTES: i64 = 10;
pub const DEFAULT_RETENTION_MINUTES: i64 = 10;
pub const DEFAULT_SLEEP_TIME_MS: u64 = 20_000;
pub const DEFAULT_MAX_JOB_RETRIES: i64 = 10;
/// A hundred years; keeps `now - retention` inside the calendar range.
pub const MAX_RETENTION_MINUTES: i64 = 100 * 366 * 24 * 60;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },

    #[error("invalid configuration document: {0}")]
    Document(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobManagerConfig {
    /// Subtree root holding the job records.
    pub repository_path: String,
    /// Cleanup timer period; zero or negative disables cleanup.
    pub cleanup_period_minutes: i64,
    /// Finished records older than this are purged.
    pub retention_minutes: i64,
    /// Backoff before retrying the only outstanding serial job.
    pub sleep_time_ms: u64,
    /// Retry budget for jobs that do not carry their own; `-1` is unlimited.
    pub max_job_retries: i64,
    /// When set, claims take timed locks that a keeper renews.
    pub lock_timeout_ms: Option<u64>,
}

impl Default for JobManagerConfig {
    fn default() -> Self {
        Self {
            repository_path: DEFAULT_REPOSITORY_PATH.to_string(),
            cleanup_period_minutes: DEFAULT_CLEANUP_PERIOD_MINUTES,
            retention_minutes: DEFAULT_RETENTION_MINUTES,
            sleep_time_ms: DEFAULT_SLEEP_TIME_MS,
            max_job_retries: DEFAULT_MAX_JOB_RETRIES,
            lock_timeout_ms: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidVar {
        name,
        value: raw.to_string(),
    })
}

impl JobManagerConfig {
    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = lookup(ENV_REPOSITORY_PATH) {
            config.repository_path = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_CLEANUP_PERIOD_MINUTES) {
            config.cleanup_period_minutes = parse_var(ENV_CLEANUP_PERIOD_MINUTES, &v)?;
        }
        if let Some(v) = lookup(ENV_RETENTION_MINUTES) {
            config.retention_minutes = parse_var(ENV_RETENTION_MINUTES, &v)?;
        }
        if let Some(v) = lookup(ENV_SLEEP_TIME_MS) {
            config.sleep_time_ms = parse_var(ENV_SLEEP_TIME_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_JOB_RETRIES) {
            config.max_job_retries = parse_var(ENV_MAX_JOB_RETRIES, &v)?;
        }
        if let Some(v) = lookup(ENV_LOCK_TIMEOUT_MS) {
            config.lock_timeout_ms = Some(parse_var(ENV_LOCK_TIMEOUT_MS, &v)?);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(document).map_err(|e| ConfigError::Document(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.repository_root()?;
        if self.retention_minutes < 0 {
            return Err(ConfigError::Invalid("retentionMinutes must not be negative".into()));
        }
        if self.retention_minutes > MAX_RETENTION_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "retentionMinutes must not exceed {MAX_RETENTION_MINUTES}"
            )));
        }
        if self.cleanup_period_minutes > 0 && self.cleanup_period_secs().is_none() {
            return Err(ConfigError::Invalid("cleanupPeriodMinutes is out of range".into()));
        }
        if self.max_job_retries < -1 {
            return Err(ConfigError::Invalid("maxJobRetries must be -1 or greater".into()));
        }
        if self.lock_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid("lockTimeoutMs must be positive".into()));
        }
        Ok(())
    }

    pub fn repository_root(&self) -> Result<RecordPath, ConfigError> {
        RecordPath::new(&self.repository_path).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// `None` when cleanup is disabled or the period does not fit a
    /// `Duration`.
    pub fn cleanup_period(&self) -> Option<Duration> {
        self.cleanup_period_secs().map(Duration::from_secs)
    }

    fn cleanup_period_secs(&self) -> Option<u64> {
        u64::try_from(self.cleanup_period_minutes)
            .ok()
            .filter(|minutes| *minutes > 0)?
            .checked_mul(60)
    }

    /// Clamped to `[0, MAX_RETENTION_MINUTES]`; `validate` rejects values
    /// outside it.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::try_minutes(self.retention_minutes.clamp(0, MAX_RETENTION_MINUTES))
            .unwrap_or_else(chrono::Duration::zero)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    pub fn with_repository_path(mut self, path: impl Into<String>) -> Self {
        self.repository_path = path.into();
        self
    }

    pub fn with_sleep_time(mut self, sleep: Duration) -> Self {
        self.sleep_time_ms = sleep.as_millis() as u64;
        self
    }

    pub fn with_cleanup_period_minutes(mut self, minutes: i64) -> Self {
        self.cleanup_period_minutes = minutes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout_ms = timeout.map(|t| t.as_millis() as u64);
        self
    }

    pub fn with_max_job_retries(mut self, retries: i64) -> Self {
        self.max_job_retries = retries;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = JobManagerConfig::default();
        assert_eq!(config.repository_path, "/var/jobmesh/jobs");
        assert_eq!(config.cleanup_period(), Some(Duration::from_secs(600)));
        assert_eq!(config.sleep_time(), Duration::from_secs(20));
        assert_eq!(config.max_job_retries, 10);
        assert_eq!(config.lock_timeout(), None);
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = JobManagerConfig::from_lookup(lookup(&[
            (ENV_REPOSITORY_PATH, "/jobs"),
            (ENV_CLEANUP_PERIOD_MINUTES, "0"),
            (ENV_LOCK_TIMEOUT_MS, " 3000 "),
        ]))
        .unwrap();

        assert_eq!(config.repository_path, "/jobs");
        assert_eq!(config.cleanup_period(), None);
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(3)));
        assert_eq!(config.retention_minutes, DEFAULT_RETENTION_MINUTES);
    }

    #[test]
    fn invalid_variable_is_named() {
        let err = JobManagerConfig::from_lookup(lookup(&[(ENV_SLEEP_TIME_MS, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidVar {
                name: ENV_SLEEP_TIME_MS,
                value: "soon".into()
            }
        );
    }

    #[test]
    fn json_uses_camel_case_and_defaults() {
        let config =
            JobManagerConfig::from_json(r#"{"repositoryPath":"/a/b","sleepTimeMs":5}"#).unwrap();
        assert_eq!(config.repository_path, "/a/b");
        assert_eq!(config.sleep_time_ms, 5);
        assert_eq!(config.cleanup_period_minutes, DEFAULT_CLEANUP_PERIOD_MINUTES);
    }

    #[test]
    fn out_of_range_periods_are_rejected() {
        let mut config = JobManagerConfig::default();
        config.retention_minutes = 200_000_000_000_000;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.retention(), chrono::Duration::minutes(MAX_RETENTION_MINUTES));

        let mut config = JobManagerConfig::default();
        config.cleanup_period_minutes = i64::MAX;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.cleanup_period(), None);

        let err = JobManagerConfig::from_lookup(lookup(&[(ENV_RETENTION_MINUTES, "200000000000000")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn relative_repository_path_is_rejected() {
        let err = JobManagerConfig::from_json(r#"{"repositoryPath":"jobs"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
