//! Runtime configuration, read from TOML.
//!
//! Every section is optional; a missing file section falls back to defaults.
//!
//! ```toml
//! [retry]
//! base_delay_ms = 2000
//! multiplier = 2.0
//! max_delay_ms = 600000
//!
//! [dispatch]
//! poll_interval_ms = 500
//! workers = 4
//!
//! [reaper]
//! enabled = false
//! stale_after_secs = 1800
//! interval_secs = 60
//!
//! [store]
//! backend = "memory"          # or "postgres"
//! database_url = "postgres://..."
//! max_connections = 5
//!
//! [logging]
//! filter = "info"
//! json = false
//! ```
//!
//! `BACKLOG_DATABASE_URL` and `BACKLOG_LOG_FILTER` override the file.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::domain::RetryPolicy;

pub const ENV_DATABASE_URL: &str = "BACKLOG_DATABASE_URL";
pub const ENV_LOG_FILTER: &str = "BACKLOG_LOG_FILTER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BacklogConfig {
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub reaper: ReaperConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub poll_interval_ms: u64,
    pub workers: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReaperConfig {
    pub enabled: bool,
    pub stale_after_secs: u64,
    pub interval_secs: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            stale_after_secs: 1_800,
            interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` still wins when set.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl BacklogConfig {
    /// Read `path` (or start from defaults), apply environment overrides,
    /// then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => {
                let data = fs::read_to_string(p).map_err(|source| ConfigError::Io {
                    path: p.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&data)?
            }
            None => Self::default(),
        };

        cfg.apply_overrides(|key| std::env::var(key).ok());
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Apply overrides from `lookup` (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            self.store.database_url = Some(url);
        }
        if let Some(filter) = lookup(ENV_LOG_FILTER).filter(|v| !v.is_empty()) {
            self.logging.filter = filter;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        let r = &self.retry;
        if r.base_delay_ms == 0 {
            return invalid("retry.base_delay_ms must be positive");
        }
        if !r.multiplier.is_finite() || r.multiplier < 1.0 {
            return invalid("retry.multiplier must be a finite number >= 1.0");
        }
        if r.max_delay_ms < r.base_delay_ms {
            return invalid("retry.max_delay_ms must not be below retry.base_delay_ms");
        }

        if self.dispatch.workers == 0 {
            return invalid("dispatch.workers must be at least 1");
        }
        if self.dispatch.poll_interval_ms == 0 {
            return invalid("dispatch.poll_interval_ms must be positive");
        }

        if self.reaper.stale_after_secs == 0 || self.reaper.interval_secs == 0 {
            return invalid("reaper.stale_after_secs and reaper.interval_secs must be positive");
        }

        if self.store.max_connections == 0 {
            return invalid("store.max_connections must be at least 1");
        }
        if self.store.backend == StoreBackend::Postgres
            && self.store.database_url.as_deref().is_none_or(str::is_empty)
        {
            return invalid("store.database_url is required for the postgres backend");
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry.base_delay_ms),
            self.retry.multiplier,
            Duration::from_millis(self.retry.max_delay_ms),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.dispatch.poll_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.reaper.stale_after_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let cfg = BacklogConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.retry_policy(), RetryPolicy::default());
        assert_eq!(cfg.stale_after(), Duration::from_secs(1_800));
        assert!(!cfg.reaper.enabled);
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = BacklogConfig::from_toml(
            r#"
            [retry]
            base_delay_ms = 500

            [store]
            backend = "postgres"
            database_url = "postgres://localhost/backlog"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.retry.base_delay_ms, 500);
        assert_eq!(cfg.retry.multiplier, 2.0);
        assert_eq!(cfg.dispatch, DispatchConfig::default());
        assert_eq!(cfg.store.backend, StoreBackend::Postgres);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = BacklogConfig::from_toml("[retry]\nbase_delay = 5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn environment_overrides_file() {
        let mut cfg = BacklogConfig::default();
        cfg.apply_overrides(|key| match key {
            ENV_DATABASE_URL => Some("postgres://db/override".to_string()),
            ENV_LOG_FILTER => Some("backlog_core=debug".to_string()),
            _ => None,
        });
        assert_eq!(cfg.store.database_url.as_deref(), Some("postgres://db/override"));
        assert_eq!(cfg.logging.filter, "backlog_core=debug");
    }

    #[rstest]
    #[case("[retry]\nmultiplier = 0.5\n", "multiplier")]
    #[case("[retry]\nbase_delay_ms = 0\n", "base_delay_ms")]
    #[case("[retry]\nbase_delay_ms = 10000\nmax_delay_ms = 10\n", "max_delay_ms")]
    #[case("[dispatch]\nworkers = 0\n", "workers")]
    #[case("[store]\nbackend = \"postgres\"\n", "database_url")]
    fn invalid_values_are_rejected(#[case] toml: &str, #[case] field: &str) {
        let cfg = BacklogConfig::from_toml(toml).unwrap();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains(field), "{err}");
    }

    #[test]
    fn load_reads_file() {
        let path = std::env::temp_dir().join(format!("backlog-config-{}.toml", ulid::Ulid::new()));
        fs::write(&path, "[dispatch]\nworkers = 9\n").unwrap();

        let cfg = BacklogConfig::load(Some(&path)).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(cfg.dispatch.workers, 9);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = BacklogConfig::load(Some(Path::new("/nonexistent/backlog.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
