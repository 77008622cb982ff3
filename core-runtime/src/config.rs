//! # Core Configuration Module
//!
//! Configuration management for the directory sync core.
//!
//! ## Overview
//!
//! A builder constructs a [`CoreConfig`] holding every setting and injected
//! bridge the engine needs. Validation is fail-fast: missing source credentials,
//! a missing field-mapping file or impossible retry settings are reported with
//! an actionable message before anything touches the network or the store.
//!
//! ## Bridges
//!
//! - `HttpClient` - optional; the service façade falls back to the reqwest
//!   client when its `desktop-shims` feature is enabled
//! - `DocumentStore` - optional when `database_path` is set; otherwise required
//!
//! ## Usage
//!
//! ```ignore
//! use core_runtime::config::CoreConfig;
//!
//! let config = CoreConfig::builder()
//!     .database_path("/var/lib/portal/directory.db")
//!     .field_mapping_path("/etc/portal/field_mapping.json")
//!     .source_base_id("appXXXXXXXXXXXXXX")
//!     .source_api_token(token)
//!     .rate_limit("airtable", 5)
//!     .build()?;
//! ```
//!
//! ## Environment
//!
//! [`CoreConfig::from_env`] reads:
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `SYNC_DATABASE_PATH` | SQLite file for the document store |
//! | `SYNC_FIELD_MAPPING_PATH` | Field mapping JSON (required) |
//! | `SYNC_SOURCE_BASE_URL` | Record API root (default `https://api.airtable.com/v0`) |
//! | `SYNC_SOURCE_BASE_ID` | Base identifier (required) |
//! | `SYNC_SOURCE_API_TOKEN` | Bearer token (required) |
//! | `SYNC_RATE_LIMIT_RPS` | Requests per second against the source |
//! | `SYNC_MAX_ATTEMPTS` | Attempts per request, including the first |
//! | `SYNC_LEASE_SECS` | Sync lock lease lifetime |

use crate::error::{Error, Result};
use bridge_traits::{DocumentStore, HttpClient, RetryPolicy};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Service name the record source is rate limited under
pub const SOURCE_SERVICE: &str = "airtable";

pub const DEFAULT_SOURCE_BASE_URL: &str = "https://api.airtable.com/v0";

/// Airtable's published ceiling is five requests per second per base
pub const DEFAULT_SOURCE_RATE_LIMIT: u32 = 5;

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10 * 60);

const MAX_RATE_LIMIT: u32 = 1_000;

/// Connection settings for the external record source
#[derive(Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub base_url: String,
    pub base_id: String,
    pub api_token: String,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("base_url", &self.base_url)
            .field("base_id", &self.base_id)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

/// Core configuration for the directory sync engine.
///
/// Use [`CoreConfigBuilder`] to construct instances.
#[derive(Clone)]
pub struct CoreConfig {
    /// SQLite database file backing the default document store
    pub database_path: Option<PathBuf>,

    /// Field mapping JSON file
    pub field_mapping_path: PathBuf,

    pub source: SourceConfig,

    /// Requests per second, keyed by service name
    pub rate_limits: HashMap<String, u32>,

    pub retry_policy: RetryPolicy,

    /// Lifetime of a sync lock lease
    pub lease_duration: Duration,

    /// HTTP client for the record source (optional with desktop default)
    pub http_client: Option<Arc<dyn HttpClient>>,

    /// Document store (optional when `database_path` is set)
    pub document_store: Option<Arc<dyn DocumentStore>>,
}

impl std::fmt::Debug for CoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreConfig")
            .field("database_path", &self.database_path)
            .field("field_mapping_path", &self.field_mapping_path)
            .field("source", &self.source)
            .field("rate_limits", &self.rate_limits)
            .field("retry_policy", &self.retry_policy)
            .field("lease_duration", &self.lease_duration)
            .field(
                "http_client",
                &self.http_client.as_ref().map(|_| "HttpClient { ... }"),
            )
            .field(
                "document_store",
                &self.document_store.as_ref().map(|_| "DocumentStore { ... }"),
            )
            .finish()
    }
}

impl CoreConfig {
    pub fn builder() -> CoreConfigBuilder {
        CoreConfigBuilder::default()
    }

    /// Build a configuration from `SYNC_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an injectable variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut builder = Self::builder();

        if let Some(path) = get("SYNC_DATABASE_PATH") {
            builder = builder.database_path(path);
        }
        if let Some(path) = get("SYNC_FIELD_MAPPING_PATH") {
            builder = builder.field_mapping_path(path);
        }
        if let Some(url) = get("SYNC_SOURCE_BASE_URL") {
            builder = builder.source_base_url(url);
        }
        if let Some(base_id) = get("SYNC_SOURCE_BASE_ID") {
            builder = builder.source_base_id(base_id);
        }
        if let Some(token) = get("SYNC_SOURCE_API_TOKEN") {
            builder = builder.source_api_token(token);
        }
        if let Some(rps) = get("SYNC_RATE_LIMIT_RPS") {
            builder = builder.rate_limit(SOURCE_SERVICE, parse_env("SYNC_RATE_LIMIT_RPS", &rps)?);
        }
        if let Some(attempts) = get("SYNC_MAX_ATTEMPTS") {
            let policy = RetryPolicy {
                max_attempts: parse_env("SYNC_MAX_ATTEMPTS", &attempts)?,
                ..RetryPolicy::default()
            };
            builder = builder.retry_policy(policy);
        }
        if let Some(secs) = get("SYNC_LEASE_SECS") {
            let secs: u64 = parse_env("SYNC_LEASE_SECS", &secs)?;
            builder = builder.lease_duration(Duration::from_secs(secs));
        }

        builder.build()
    }

    /// Requests per second allowed against `service`
    pub fn rate_limit_for(&self, service: &str) -> Option<u32> {
        self.rate_limits.get(service).copied()
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.database_path.is_none() && self.document_store.is_none() {
            return Err(Error::CapabilityMissing {
                capability: "DocumentStore".to_string(),
                message: "Either set database_path to use the SQLite store or inject a \
                          DocumentStore implementation."
                    .to_string(),
            });
        }

        if let Some(path) = &self.database_path {
            if path.as_os_str().is_empty() {
                return Err(Error::Config("Database path cannot be empty".to_string()));
            }
        }

        if self.field_mapping_path.as_os_str().is_empty() {
            return Err(Error::Config(
                "Field mapping path cannot be empty".to_string(),
            ));
        }

        let base_url = self.source.base_url.trim();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(Error::Config(format!(
                "Source base URL must be an http(s) URL, got '{}'",
                self.source.base_url
            )));
        }

        if self.source.base_id.trim().is_empty() {
            return Err(Error::Config(
                "Source base id is required (SYNC_SOURCE_BASE_ID)".to_string(),
            ));
        }

        if self.source.api_token.trim().is_empty() {
            return Err(Error::Config(
                "Source API token is required (SYNC_SOURCE_API_TOKEN)".to_string(),
            ));
        }

        for (service, rps) in &self.rate_limits {
            if *rps == 0 || *rps > MAX_RATE_LIMIT {
                return Err(Error::Config(format!(
                    "Rate limit for '{}' must be between 1 and {} requests per second",
                    service, MAX_RATE_LIMIT
                )));
            }
        }

        if self.rate_limit_for(SOURCE_SERVICE).is_none() {
            return Err(Error::Config(format!(
                "No rate limit configured for the record source service '{}'",
                SOURCE_SERVICE
            )));
        }

        let policy = &self.retry_policy;
        if policy.max_attempts == 0 {
            return Err(Error::Config(
                "Retry policy must allow at least one attempt".to_string(),
            ));
        }
        if policy.base_delay > policy.max_delay {
            return Err(Error::Config(
                "Retry base delay cannot exceed the maximum delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&policy.jitter_ratio) {
            return Err(Error::Config(
                "Retry jitter ratio must be within 0.0..=1.0".to_string(),
            ));
        }

        if self.lease_duration < Duration::from_secs(1) {
            return Err(Error::Config(
                "Lease duration must be at least one second".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(variable: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| Error::InvalidEnv {
        variable: variable.to_string(),
        message: e.to_string(),
    })
}

/// Builder for constructing [`CoreConfig`] instances.
#[derive(Default)]
pub struct CoreConfigBuilder {
    database_path: Option<PathBuf>,
    field_mapping_path: Option<PathBuf>,
    source_base_url: Option<String>,
    source_base_id: Option<String>,
    source_api_token: Option<String>,
    rate_limits: HashMap<String, u32>,
    retry_policy: Option<RetryPolicy>,
    lease_duration: Option<Duration>,
    http_client: Option<Arc<dyn HttpClient>>,
    document_store: Option<Arc<dyn DocumentStore>>,
}

impl CoreConfigBuilder {
    /// SQLite file backing the default document store
    pub fn database_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.database_path = Some(path.into());
        self
    }

    /// Field mapping JSON file (required)
    pub fn field_mapping_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.field_mapping_path = Some(path.into());
        self
    }

    /// Record API root. Default: `https://api.airtable.com/v0`
    pub fn source_base_url(mut self, url: impl Into<String>) -> Self {
        self.source_base_url = Some(url.into());
        self
    }

    pub fn source_base_id(mut self, base_id: impl Into<String>) -> Self {
        self.source_base_id = Some(base_id.into());
        self
    }

    pub fn source_api_token(mut self, token: impl Into<String>) -> Self {
        self.source_api_token = Some(token.into());
        self
    }

    /// Requests per second for `service`. The record source defaults to 5.
    pub fn rate_limit(mut self, service: impl Into<String>, requests_per_second: u32) -> Self {
        self.rate_limits.insert(service.into(), requests_per_second);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Sync lock lease lifetime. Default: 10 minutes
    pub fn lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = Some(duration);
        self
    }

    pub fn http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.document_store = Some(store);
        self
    }

    /// Builds and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first missing or invalid setting.
    pub fn build(self) -> Result<CoreConfig> {
        let field_mapping_path = self.field_mapping_path.ok_or_else(|| {
            Error::Config(
                "Field mapping path is required (SYNC_FIELD_MAPPING_PATH)".to_string(),
            )
        })?;

        let mut rate_limits = self.rate_limits;
        rate_limits
            .entry(SOURCE_SERVICE.to_string())
            .or_insert(DEFAULT_SOURCE_RATE_LIMIT);

        let config = CoreConfig {
            database_path: self.database_path,
            field_mapping_path,
            source: SourceConfig {
                base_url: self
                    .source_base_url
                    .unwrap_or_else(|| DEFAULT_SOURCE_BASE_URL.to_string()),
                base_id: self.source_base_id.unwrap_or_default(),
                api_token: self.source_api_token.unwrap_or_default(),
            },
            rate_limits,
            retry_policy: self.retry_policy.unwrap_or_default(),
            lease_duration: self.lease_duration.unwrap_or(DEFAULT_LEASE_DURATION),
            http_client: self.http_client,
            document_store: self.document_store,
        };

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete_builder() -> CoreConfigBuilder {
        CoreConfig::builder()
            .database_path("/tmp/directory.db")
            .field_mapping_path("/tmp/field_mapping.json")
            .source_base_id("appBase")
            .source_api_token("key-secret")
    }

    #[test]
    fn test_builder_applies_defaults() {
        let config = complete_builder().build().unwrap();

        assert_eq!(config.source.base_url, DEFAULT_SOURCE_BASE_URL);
        assert_eq!(config.rate_limit_for(SOURCE_SERVICE), Some(5));
        assert_eq!(config.lease_duration, Duration::from_secs(600));
        assert_eq!(config.retry_policy, RetryPolicy::default());
    }

    #[test]
    fn test_missing_token_is_actionable() {
        let err = CoreConfig::builder()
            .database_path("/tmp/directory.db")
            .field_mapping_path("/tmp/field_mapping.json")
            .source_base_id("appBase")
            .build()
            .unwrap_err();

        assert!(err.to_string().contains("SYNC_SOURCE_API_TOKEN"));
    }

    #[test]
    fn test_store_or_path_required() {
        let err = CoreConfig::builder()
            .field_mapping_path("/tmp/field_mapping.json")
            .source_base_id("appBase")
            .source_api_token("key")
            .build()
            .unwrap_err();

        assert!(matches!(err, Error::CapabilityMissing { .. }));
    }

    #[test]
    fn test_invalid_rate_limit_rejected() {
        let err = complete_builder()
            .rate_limit(SOURCE_SERVICE, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_retry_policy_rejected() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1),
            ..RetryPolicy::default()
        };
        assert!(complete_builder().retry_policy(policy).build().is_err());
    }

    #[test]
    fn test_debug_redacts_token() {
        let config = complete_builder().build().unwrap();
        let rendered = format!("{:?}", config);

        assert!(!rendered.contains("key-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("SYNC_DATABASE_PATH", "/data/directory.db"),
            ("SYNC_FIELD_MAPPING_PATH", "/etc/mapping.json"),
            ("SYNC_SOURCE_BASE_ID", "appBase"),
            ("SYNC_SOURCE_API_TOKEN", "key"),
            ("SYNC_RATE_LIMIT_RPS", "3"),
            ("SYNC_LEASE_SECS", "120"),
        ]
        .into_iter()
        .collect();

        let config = CoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.database_path, Some(PathBuf::from("/data/directory.db")));
        assert_eq!(config.rate_limit_for(SOURCE_SERVICE), Some(3));
        assert_eq!(config.lease_duration, Duration::from_secs(120));
    }

    #[test]
    fn test_from_lookup_rejects_garbage_numbers() {
        let vars: HashMap<&str, &str> = [
            ("SYNC_DATABASE_PATH", "/data/directory.db"),
            ("SYNC_FIELD_MAPPING_PATH", "/etc/mapping.json"),
            ("SYNC_SOURCE_BASE_ID", "appBase"),
            ("SYNC_SOURCE_API_TOKEN", "key"),
            ("SYNC_RATE_LIMIT_RPS", "fast"),
        ]
        .into_iter()
        .collect();

        let err = CoreConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(matches!(err, Error::InvalidEnv { ref variable, .. } if variable == "SYNC_RATE_LIMIT_RPS"));
    }
}
