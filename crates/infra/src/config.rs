//! Configuration loading and validation.
//!
//! A TOML file (path from `FOLIO_CONFIG`, optional) is read first, then
//! `FOLIO_*` environment variables override individual values. Validation is
//! fatal: a process with a conflicting configuration must not start.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use folio_auth::TokenPolicy;
use folio_core::InstanceId;

use crate::jobs::{DispatcherConfig, JobSettings, Schedule, StandardJobSettings};

pub const ENV_CONFIG_PATH: &str = "FOLIO_CONFIG";
pub const ENV_DATABASE_URL: &str = "FOLIO_DATABASE_URL";
pub const ENV_REDIS_URL: &str = "FOLIO_REDIS_URL";
pub const ENV_CACHE_PATH: &str = "FOLIO_CACHE_PATH";
pub const ENV_INSTANCE_ID: &str = "FOLIO_INSTANCE_ID";
pub const ENV_DEPLOYMENT: &str = "FOLIO_DEPLOYMENT";
pub const ENV_JOB_INTERVAL_SECS: &str = "FOLIO_JOB_INTERVAL_SECS";
pub const ENV_LOG: &str = "FOLIO_LOG";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {reason}", path.display())]
    Read { path: PathBuf, reason: String },
    #[error("cannot parse config: {0}")]
    Parse(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("configuration conflict: {0}")]
    Conflict(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deployment {
    #[default]
    Single,
    Multi,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstanceConfig {
    /// Stable instance id. Generated at startup when absent.
    pub id: Option<String>,
    pub deployment: Deployment,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// Postgres URL. Without it, job and token records live in memory.
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

/// Enable flag and optional schedule override of one standard job.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobToggle {
    pub enabled: bool,
    pub interval_secs: Option<u64>,
    pub cron: Option<String>,
}

impl Default for JobToggle {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: None,
            cron: None,
        }
    }
}

impl JobToggle {
    fn settings(&self, job: &str, default_interval: Duration) -> Result<JobSettings, ConfigError> {
        let schedule = match (&self.interval_secs, &self.cron) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "jobs.{job}: set either interval_secs or cron, not both"
                )));
            }
            (None, Some(expr)) => Schedule::cron(expr),
            (Some(secs), None) => Schedule::every(Duration::from_secs(*secs)),
            (None, None) => Schedule::every(default_interval),
        }
        .map_err(|e| ConfigError::Invalid(format!("jobs.{job}: {e}")))?;

        Ok(JobSettings {
            enabled: self.enabled,
            schedule,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    pub search_interval_secs: u64,
    pub handler_timeout_secs: u64,
    pub staleness_secs: u64,
    pub clean_expired_previews: JobToggle,
    pub clean_expired_tokens: JobToggle,
    pub publish_pages: JobToggle,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            search_interval_secs: 60,
            handler_timeout_secs: 300,
            staleness_secs: 900,
            clean_expired_previews: JobToggle::default(),
            clean_expired_tokens: JobToggle::default(),
            publish_pages: JobToggle::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokensConfig {
    pub expiration_secs: u64,
    pub expiration_long_secs: u64,
    pub renewal_window_minutes: u64,
    /// Defaults to the renewal window.
    pub cleanup_grace_secs: Option<u64>,
    pub lookup_cache_secs: u64,
}

impl Default for TokensConfig {
    fn default() -> Self {
        Self {
            expiration_secs: 4 * 3600,
            expiration_long_secs: 7 * 24 * 3600,
            renewal_window_minutes: 30,
            cleanup_grace_secs: None,
            lookup_cache_secs: 60,
        }
    }
}

impl TokensConfig {
    fn renewal_window_secs(&self) -> u64 {
        self.renewal_window_minutes.saturating_mul(60)
    }

    fn cleanup_grace_secs(&self) -> u64 {
        self.cleanup_grace_secs.unwrap_or_else(|| self.renewal_window_secs())
    }
}

/// Cache backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum CacheConfig {
    /// Files under `path`; visible to this host only.
    Local {
        #[serde(default = "default_cache_path")]
        path: PathBuf,
    },
    /// Redis shared by every instance.
    Shared {
        url: String,
        #[serde(default = "default_namespace")]
        namespace: String,
    },
    /// Process memory (tests and development).
    Memory,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Local {
            path: default_cache_path(),
        }
    }
}

impl CacheConfig {
    pub fn is_shared(&self) -> bool {
        matches!(self, CacheConfig::Shared { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            CacheConfig::Local { .. } => "local",
            CacheConfig::Shared { .. } => "shared",
            CacheConfig::Memory => "memory",
        }
    }
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(".folio/cache")
}

fn default_namespace() -> String {
    "folio".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FolioConfig {
    pub instance: InstanceConfig,
    pub database: DatabaseConfig,
    pub jobs: JobsConfig,
    pub tokens: TokensConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl FolioConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load_with(|name| std::env::var(name).ok())
    }

    /// Load using `lookup` for environment variables, then validate.
    pub fn load_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(ENV_CONFIG_PATH) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. Does not validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse TOML text. Does not validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `FOLIO_*` overrides.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_DATABASE_URL) {
            self.database.url = Some(url);
        }
        if let Some(path) = lookup(ENV_CACHE_PATH) {
            self.cache = CacheConfig::Local {
                path: PathBuf::from(path),
            };
        }
        // A shared cache wins over a local path given in the same environment.
        if let Some(url) = lookup(ENV_REDIS_URL) {
            let namespace = match &self.cache {
                CacheConfig::Shared { namespace, .. } => namespace.clone(),
                _ => default_namespace(),
            };
            self.cache = CacheConfig::Shared { url, namespace };
        }
        if let Some(id) = lookup(ENV_INSTANCE_ID) {
            self.instance.id = Some(id);
        }
        if let Some(deployment) = lookup(ENV_DEPLOYMENT) {
            self.instance.deployment = match deployment.trim().to_ascii_lowercase().as_str() {
                "single" => Deployment::Single,
                "multi" => Deployment::Multi,
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "{ENV_DEPLOYMENT} must be 'single' or 'multi', got '{other}'"
                    )));
                }
            };
        }
        if let Some(secs) = lookup(ENV_JOB_INTERVAL_SECS) {
            self.jobs.search_interval_secs = secs.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_JOB_INTERVAL_SECS} is not a number: '{secs}'"))
            })?;
        }
        if let Some(filter) = lookup(ENV_LOG) {
            self.logging.filter = filter;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(id) = &self.instance.id {
            InstanceId::new(id.clone()).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        let jobs = &self.jobs;
        for (name, secs) in [
            ("jobs.search_interval_secs", jobs.search_interval_secs),
            ("jobs.handler_timeout_secs", jobs.handler_timeout_secs),
            ("jobs.staleness_secs", jobs.staleness_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if jobs.staleness_secs <= jobs.handler_timeout_secs {
            return Err(ConfigError::Conflict(format!(
                "jobs.staleness_secs ({}) must exceed jobs.handler_timeout_secs ({}); \
                 a live run would otherwise be reclaimed",
                jobs.staleness_secs, jobs.handler_timeout_secs
            )));
        }
        self.standard_job_settings()?;

        let tokens = &self.tokens;
        if tokens.cleanup_grace_secs() < tokens.renewal_window_secs() {
            return Err(ConfigError::Conflict(
                "tokens.cleanup_grace_secs must not be shorter than the renewal window".into(),
            ));
        }
        self.token_policy()?;

        match &self.cache {
            CacheConfig::Local { path } if path.as_os_str().is_empty() => {
                return Err(ConfigError::Invalid("cache.path must not be empty".into()));
            }
            CacheConfig::Shared { url, namespace } if url.is_empty() || namespace.is_empty() => {
                return Err(ConfigError::Invalid(
                    "cache.url and cache.namespace must not be empty".into(),
                ));
            }
            _ => {}
        }

        if self.instance.deployment == Deployment::Multi {
            if !self.cache.is_shared() {
                return Err(ConfigError::Conflict(format!(
                    "cache backend '{}' is private to one instance; a multi-instance \
                     deployment requires the shared cache",
                    self.cache.name()
                )));
            }
            if self.database.url.is_none() {
                return Err(ConfigError::Conflict(
                    "a multi-instance deployment requires database.url; in-memory job \
                     and token stores are private to one instance"
                        .into(),
                ));
            }
        }
        Ok(())
    }

    /// Configured instance id, or a freshly generated one.
    pub fn instance_id(&self) -> Result<InstanceId, ConfigError> {
        match &self.instance.id {
            Some(id) => InstanceId::new(id.clone()).map_err(|e| ConfigError::Invalid(e.to_string())),
            None => Ok(InstanceId::generate()),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            search_interval: Duration::from_secs(self.jobs.search_interval_secs),
            handler_timeout: Duration::from_secs(self.jobs.handler_timeout_secs),
            staleness_window: Duration::from_secs(self.jobs.staleness_secs),
        }
    }

    pub fn token_policy(&self) -> Result<TokenPolicy, ConfigError> {
        let tokens = &self.tokens;
        TokenPolicy::new(
            seconds("tokens.expiration_secs", tokens.expiration_secs)?,
            seconds("tokens.expiration_long_secs", tokens.expiration_long_secs)?,
            seconds("tokens.renewal_window_minutes", tokens.renewal_window_secs())?,
            seconds("tokens.cleanup_grace_secs", tokens.cleanup_grace_secs())?,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn token_lookup_ttl(&self) -> Duration {
        Duration::from_secs(self.tokens.lookup_cache_secs)
    }

    pub fn standard_job_settings(&self) -> Result<StandardJobSettings, ConfigError> {
        const HOURLY: Duration = Duration::from_secs(3600);
        let jobs = &self.jobs;
        Ok(StandardJobSettings {
            clean_expired_previews: jobs
                .clean_expired_previews
                .settings("clean_expired_previews", HOURLY)?,
            clean_expired_tokens: jobs
                .clean_expired_tokens
                .settings("clean_expired_tokens", HOURLY)?,
            publish_pages: jobs
                .publish_pages
                .settings("publish_pages", Duration::from_secs(jobs.search_interval_secs))?,
        })
    }
}

fn seconds(name: &str, secs: u64) -> Result<chrono::Duration, ConfigError> {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .ok_or_else(|| ConfigError::Invalid(format!("{name} is out of range")))
}
