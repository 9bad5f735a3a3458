//! Configuration loading for the CRM sync worker.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `CRM_SYNC_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::crm::HubSpotConfig;
use crate::crm::hubspot::{DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_HUBSPOT_API_BASE};

/// Prefix shared by every configuration key.
pub const ENV_PREFIX: &str = "CRM_SYNC_";

/// Largest offset the CRM search endpoint will page to.
const SEARCH_RESULT_LIMIT: u64 = 10_000;

const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `CRM_SYNC_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default)]
    pub hubspot_client_id: String,
    #[serde(default)]
    pub hubspot_client_secret: String,
    #[serde(default = "default_hubspot_api_base")]
    pub hubspot_api_base: String,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analytics_api_key: Option<String>,
    #[serde(default = "default_persist_accounts")]
    pub persist_accounts: bool,
    #[serde(default)]
    pub sync: SyncConfig,
}

/// Pagination, retry and batching knobs of the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct SyncConfig {
    /// Records requested per search page.
    ///
    /// Environment variable: `CRM_SYNC_SYNC_PAGE_SIZE`
    #[serde(default = "default_sync_page_size")]
    pub page_size: u32,

    /// Cursor offset at which the fetcher narrows its window instead of paging further.
    ///
    /// Environment variable: `CRM_SYNC_SYNC_OFFSET_CAP`
    #[serde(default = "default_sync_offset_cap")]
    pub offset_cap: u64,

    /// Attempts per page before the entity kind is abandoned.
    ///
    /// Environment variable: `CRM_SYNC_SYNC_MAX_ATTEMPTS`
    #[serde(default = "default_sync_max_attempts")]
    pub max_attempts: u32,

    /// Base of the exponential backoff between attempts: base_ms * 2^failed.
    ///
    /// Environment variable: `CRM_SYNC_SYNC_BACKOFF_BASE_MS`
    #[serde(default = "default_sync_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Buffered events that trigger an automatic hand-off to the analytics sink.
    ///
    /// Environment variable: `CRM_SYNC_SYNC_FLUSH_THRESHOLD`
    #[serde(default = "default_sync_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_sync_page_size(),
            offset_cap: default_sync_offset_cap(),
            max_attempts: default_sync_max_attempts(),
            backoff_base_ms: default_sync_backoff_base_ms(),
            flush_threshold: default_sync_flush_threshold(),
        }
    }
}

impl SyncConfig {
    /// Validate sync configuration bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.page_size == 0 || self.page_size > 200 {
            return Err(ConfigError::InvalidPageSize {
                value: self.page_size,
            });
        }

        if self.offset_cap == 0 || self.offset_cap + u64::from(self.page_size) > SEARCH_RESULT_LIMIT
        {
            return Err(ConfigError::InvalidOffsetCap {
                value: self.offset_cap,
                page_size: self.page_size,
            });
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidMaxAttempts {
                value: self.max_attempts,
            });
        }

        if self.flush_threshold == 0 {
            return Err(ConfigError::InvalidFlushThreshold {
                value: self.flush_threshold,
            });
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            hubspot_client_id: String::new(),
            hubspot_client_secret: String::new(),
            hubspot_api_base: default_hubspot_api_base(),
            http_timeout_secs: default_http_timeout_secs(),
            analytics_url: None,
            analytics_api_key: None,
            persist_accounts: default_persist_accounts(),
            sync: SyncConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.hubspot_client_secret.is_empty() {
            config.hubspot_client_secret = REDACTED.to_string();
        }
        if config.analytics_api_key.is_some() {
            config.analytics_api_key = Some(REDACTED.to_string());
        }
        config.database_url = redact_url_password(&config.database_url);
        serde_json::to_string_pretty(&config)
    }

    /// HTTP settings for the HubSpot client.
    pub fn hubspot(&self) -> HubSpotConfig {
        let mut hubspot =
            HubSpotConfig::new(&self.hubspot_client_id, &self.hubspot_client_secret)
                .with_api_base(self.hubspot_api_base.trim_end_matches('/'));
        hubspot.http_timeout = self.http_timeout();
        hubspot
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Parsed analytics endpoint, if one is configured.
    pub fn analytics_endpoint(&self) -> Result<Option<Url>, ConfigError> {
        self.analytics_url
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|source| ConfigError::InvalidAnalyticsUrl {
                    value: raw.to_string(),
                    source,
                })
            })
            .transpose()
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hubspot_client_id.trim().is_empty() {
            return Err(ConfigError::MissingHubSpotClientId);
        }
        if self.hubspot_client_secret.trim().is_empty() {
            return Err(ConfigError::MissingHubSpotClientSecret);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        if self.http_timeout_secs == 0 {
            return Err(ConfigError::InvalidHttpTimeout {
                value: self.http_timeout_secs,
            });
        }

        self.analytics_endpoint()?;
        self.sync.validate()?;

        Ok(())
    }
}

fn redact_url_password(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) if url.password().is_some() => {
            let _ = url.set_password(Some(REDACTED));
            url.to_string()
        }
        _ => raw.to_string(),
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://crm-sync.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_hubspot_api_base() -> String {
    DEFAULT_HUBSPOT_API_BASE.to_string()
}

fn default_http_timeout_secs() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_persist_accounts() -> bool {
    true
}

fn default_sync_page_size() -> u32 {
    100
}

fn default_sync_offset_cap() -> u64 {
    9_900
}

fn default_sync_max_attempts() -> u32 {
    5
}

fn default_sync_backoff_base_ms() -> u64 {
    5_000
}

fn default_sync_flush_threshold() -> usize {
    2_000
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },
    #[error("HubSpot client ID is missing; set CRM_SYNC_HUBSPOT_CLIENT_ID")]
    MissingHubSpotClientId,
    #[error("HubSpot client secret is missing; set CRM_SYNC_HUBSPOT_CLIENT_SECRET")]
    MissingHubSpotClientSecret,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("HTTP timeout must be positive, got {value}")]
    InvalidHttpTimeout { value: u64 },
    #[error("invalid analytics URL '{value}': {source}")]
    InvalidAnalyticsUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("sync page size must be between 1 and 200, got {value}")]
    InvalidPageSize { value: u32 },
    #[error(
        "sync offset cap must be positive and leave room for one page below 10000 (page size {page_size}), got {value}"
    )]
    InvalidOffsetCap { value: u64, page_size: u32 },
    #[error("sync max attempts must be at least 1, got {value}")]
    InvalidMaxAttempts { value: u32 },
    #[error("sync flush threshold must be at least 1, got {value}")]
    InvalidFlushThreshold { value: usize },
}

/// Loads configuration using layered `.env` files and `CRM_SYNC_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads `.env`, `.env.local`, `.env.{profile}`, `.env.{profile}.local`,
    /// then the process environment, and validates the result.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = take_string(&mut layered, "PROFILE").unwrap_or(profile_hint);
        let defaults = AppConfig::default();
        let sync_defaults = SyncConfig::default();

        let config = AppConfig {
            profile,
            log_level: take_string(&mut layered, "LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: take_string(&mut layered, "LOG_FORMAT")
                .map(|v| v.to_ascii_lowercase())
                .unwrap_or(defaults.log_format),
            database_url: take_string(&mut layered, "DATABASE_URL")
                .unwrap_or(defaults.database_url),
            db_max_connections: take_parsed(&mut layered, "DB_MAX_CONNECTIONS")?
                .unwrap_or(defaults.db_max_connections),
            db_acquire_timeout_ms: take_parsed(&mut layered, "DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or(defaults.db_acquire_timeout_ms),
            hubspot_client_id: take_string(&mut layered, "HUBSPOT_CLIENT_ID").unwrap_or_default(),
            hubspot_client_secret: take_string(&mut layered, "HUBSPOT_CLIENT_SECRET")
                .unwrap_or_default(),
            hubspot_api_base: take_string(&mut layered, "HUBSPOT_API_BASE")
                .unwrap_or(defaults.hubspot_api_base),
            http_timeout_secs: take_parsed(&mut layered, "HTTP_TIMEOUT_SECS")?
                .unwrap_or(defaults.http_timeout_secs),
            analytics_url: take_string(&mut layered, "ANALYTICS_URL"),
            analytics_api_key: take_string(&mut layered, "ANALYTICS_API_KEY"),
            persist_accounts: take_bool(&mut layered, "PERSIST_ACCOUNTS")?
                .unwrap_or(defaults.persist_accounts),
            sync: SyncConfig {
                page_size: take_parsed(&mut layered, "SYNC_PAGE_SIZE")?
                    .unwrap_or(sync_defaults.page_size),
                offset_cap: take_parsed(&mut layered, "SYNC_OFFSET_CAP")?
                    .unwrap_or(sync_defaults.offset_cap),
                max_attempts: take_parsed(&mut layered, "SYNC_MAX_ATTEMPTS")?
                    .unwrap_or(sync_defaults.max_attempts),
                backoff_base_ms: take_parsed(&mut layered, "SYNC_BACKOFF_BASE_MS")?
                    .unwrap_or(sync_defaults.backoff_base_ms),
                flush_threshold: take_parsed(&mut layered, "SYNC_FLUSH_THRESHOLD")?
                    .unwrap_or(sync_defaults.flush_threshold),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Non-empty trimmed value for `key`.
fn take_string(values: &mut BTreeMap<String, String>, key: &str) -> Option<String> {
    values
        .remove(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn take_parsed<T: std::str::FromStr>(
    values: &mut BTreeMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    take_string(values, key)
        .map(|raw| {
            raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            })
        })
        .transpose()
}

fn take_bool(values: &mut BTreeMap<String, String>, key: &str) -> Result<Option<bool>, ConfigError> {
    take_string(values, key)
        .map(|raw| match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                value: raw,
            }),
        })
        .transpose()
}
