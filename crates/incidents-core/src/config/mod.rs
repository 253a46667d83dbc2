//! Runtime configuration for the sync engine and the remote API.
//!
//! `ApiConfig` is read from the environment (`POCKETBASE_URL`,
//! `POCKETBASE_COLLECTION`); a base URL saved in local settings wins over the
//! environment so it can be changed without a rebuild.

use std::env;
use std::time::Duration;

use crate::models::Settings;
use crate::util::{is_http_url, normalize_text_option};
use crate::{Error, Result};

const ENV_BASE_URL: &str = "POCKETBASE_URL";
const ENV_COLLECTION: &str = "POCKETBASE_COLLECTION";

/// Collection holding incident reports when none is configured.
pub const DEFAULT_COLLECTION: &str = "incident_reports";
/// Auth collection used for responder logins.
pub const DEFAULT_AUTH_COLLECTION: &str = "admins";

/// Tuning knobs for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Attempts before an operation is abandoned and its report marked failed
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound of the random delay added to each backoff
    pub max_jitter: Duration,
    /// Operations claimed from the queue per batch
    pub batch_size: usize,
    /// Network calls in flight at once
    pub max_concurrency: usize,
    /// Deadline for a single network call
    pub request_timeout: Duration,
    /// Periodic drain interval for the background worker; `None` disables it
    pub sync_interval: Option<Duration>,
    /// Delete local attachment copies once a report is fully synced
    pub purge_uploaded: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            max_jitter: Duration::from_secs(1),
            batch_size: 32,
            max_concurrency: 4,
            request_timeout: Duration::from_secs(30),
            sync_interval: Some(Duration::from_secs(60)),
            purge_uploaded: true,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_backoff = base;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = Some(interval);
        self
    }

    /// Only drain on connectivity changes and explicit wakes.
    #[must_use]
    pub const fn without_auto_sync(mut self) -> Self {
        self.sync_interval = None;
        self
    }

    #[must_use]
    pub const fn with_purge_uploaded(mut self, purge: bool) -> Self {
        self.purge_uploaded = purge;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.batch_size == 0 || self.max_concurrency == 0 {
            return Err(Error::InvalidInput(
                "batch_size and max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.base_backoff > self.max_backoff {
            return Err(Error::InvalidInput(
                "base_backoff cannot exceed max_backoff".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "request_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Remote API location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL without trailing slash, e.g. `https://pb.example.com`
    pub base_url: String,
    pub collection: String,
    pub auth_collection: String,
}

impl ApiConfig {
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            base_url: normalize_base_url(base_url)?,
            collection: DEFAULT_COLLECTION.to_string(),
            auth_collection: DEFAULT_AUTH_COLLECTION.to_string(),
        })
    }

    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Load API configuration from environment variables.
    ///
    /// Returns `Ok(None)` when `POCKETBASE_URL` is unset.
    pub fn from_env() -> Result<Option<Self>> {
        parse_config(|key| env::var(key).ok())
    }

    /// Resolve the effective configuration: a saved base URL overrides the environment.
    pub fn resolve(settings: &Settings, from_env: Option<Self>) -> Result<Option<Self>> {
        let Some(override_url) = normalize_text_option(settings.api_base_url.clone()) else {
            return Ok(from_env);
        };
        let base_url = normalize_base_url(&override_url)?;
        Ok(Some(match from_env {
            Some(config) => Self { base_url, ..config },
            None => Self {
                base_url,
                collection: DEFAULT_COLLECTION.to_string(),
                auth_collection: DEFAULT_AUTH_COLLECTION.to_string(),
            },
        }))
    }

    /// `<base>/api/collections/<collection>/records`
    #[must_use]
    pub fn records_url(&self) -> String {
        format!(
            "{}/api/collections/{}/records",
            self.base_url,
            urlencoding::encode(&self.collection)
        )
    }

    #[must_use]
    pub fn record_url(&self, record_id: &str) -> String {
        format!("{}/{}", self.records_url(), urlencoding::encode(record_id))
    }

    #[must_use]
    pub fn auth_url(&self) -> String {
        format!(
            "{}/api/collections/{}/auth-with-password",
            self.base_url,
            urlencoding::encode(&self.auth_collection)
        )
    }

    /// Public URL of a file stored on a record.
    #[must_use]
    pub fn file_url(&self, collection_id: &str, record_id: &str, file_name: &str) -> String {
        format!(
            "{}/api/files/{}/{}/{}",
            self.base_url,
            urlencoding::encode(collection_id),
            urlencoding::encode(record_id),
            urlencoding::encode(file_name)
        )
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<ApiConfig>> {
    let Some(base_url) = normalize_text_option(lookup(ENV_BASE_URL)) else {
        return Ok(None);
    };
    let mut config = ApiConfig::new(&base_url)?;
    if let Some(collection) = normalize_text_option(lookup(ENV_COLLECTION)) {
        config.collection = collection;
    }
    Ok(Some(config))
}

/// Validate and strip trailing slashes from a base URL.
pub fn normalize_base_url(value: &str) -> Result<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidInput("API base URL cannot be empty".to_string()));
    }
    if !is_http_url(trimmed) {
        return Err(Error::InvalidInput(format!(
            "API base URL must start with http:// or https://: {trimmed}"
        )));
    }
    Ok(trimmed.to_string())
}
