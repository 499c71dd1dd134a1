//! Configuration management for the data client.
//!
//! Supports configuration via:
//! - Explicit values
//! - Environment variables (`TRACKER_*`)
//! - Builder pattern

use crate::cache::CacheConfig;
use crate::errors::ConfigurationError;
use crate::health::HealthConfig;
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryPolicy};
use secrecy::{ExposeSecret, SecretString};
use std::env::VarError;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Default per-attempt timeout
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default delay before re-flushing writes left queued while online
pub const DEFAULT_FLUSH_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default table read by the health probe
pub const DEFAULT_CORE_TABLE: &str = "tools";

/// Default view read by the health probe
pub const DEFAULT_DERIVED_VIEW: &str = "tool_stats";

/// Connection details for the hosted backend
#[derive(Clone)]
pub struct BackendConfig {
    base_url: Url,
    api_key: SecretString,
    /// Table read by the core-table probe
    pub core_table: String,
    /// View read by the derived-view probe
    pub derived_view: String,
}

impl BackendConfig {
    /// Parse `base_url` and wrap `api_key`
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ConfigurationError> {
        let base_url = Url::parse(base_url).map_err(|e| ConfigurationError::InvalidUrl {
            message: e.to_string(),
        })?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidUrl {
                message: format!("unsupported scheme '{}'", base_url.scheme()),
            });
        }

        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ConfigurationError::InvalidValue {
                name: "api_key",
                message: "must not be empty".to_string(),
            });
        }

        Ok(Self {
            base_url,
            api_key: SecretString::new(api_key),
            core_table: DEFAULT_CORE_TABLE.to_string(),
            derived_view: DEFAULT_DERIVED_VIEW.to_string(),
        })
    }

    /// Set the core table name
    pub fn with_core_table(mut self, table: impl Into<String>) -> Self {
        self.core_table = table.into();
        self
    }

    /// Set the derived view name
    pub fn with_derived_view(mut self, view: impl Into<String>) -> Self {
        self.derived_view = view.into();
        self
    }

    /// Backend base URL
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub(crate) fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    /// Build the full URL for an endpoint path
    pub fn build_url(&self, endpoint: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        format!("{}/{}", base, path)
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url.as_str())
            .field("api_key", &"[REDACTED]")
            .field("core_table", &self.core_table)
            .field("derived_view", &self.derived_view)
            .finish()
    }
}

/// Configuration for [`ResilientClient`](crate::ResilientClient)
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend used by the built-in HTTP health probe
    pub backend: Option<BackendConfig>,
    /// Timeout applied to each attempt of a remote call
    pub call_timeout: Duration,
    /// Default retry policy
    pub retry_policy: RetryPolicy,
    /// Default rate limit per resource key
    pub rate_limit: RateLimiterConfig,
    /// Default circuit breaker settings per resource key
    pub circuit_breaker: CircuitBreakerConfig,
    /// Cache settings
    pub cache: CacheConfig,
    /// Health monitor settings
    pub health: HealthConfig,
    /// Flush the offline queue when connectivity returns
    pub auto_flush: bool,
    /// First delay before flushing again when writes stay queued while
    /// online; doubles on each further failure
    pub flush_retry_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend: None,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            rate_limit: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            health: HealthConfig::default(),
            auto_flush: true,
            flush_retry_interval: DEFAULT_FLUSH_RETRY_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Create a new configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    /// Create configuration from `TRACKER_*` environment variables
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|name| std::env::var(name))
    }

    /// Create configuration from `TRACKER_*` variables supplied by `lookup`
    fn from_lookup<L>(lookup: L) -> Result<Self, ConfigurationError>
    where
        L: Fn(&str) -> Result<String, VarError>,
    {
        let mut builder = ClientConfigBuilder::new();

        let url = env_value::<String, _>(&lookup, "TRACKER_BACKEND_URL")?;
        match (&url, env_value::<String, _>(&lookup, "TRACKER_API_KEY")?) {
            (Some(url), Some(key)) => builder = builder.backend(url, key)?,
            (Some(_), None) => {
                return Err(ConfigurationError::EnvVar(
                    "TRACKER_API_KEY is required when TRACKER_BACKEND_URL is set".to_string(),
                ))
            }
            _ => {}
        }

        if let Some(table) = env_value::<String, _>(&lookup, "TRACKER_CORE_TABLE")? {
            if url.is_none() {
                return Err(ConfigurationError::EnvVar(
                    "TRACKER_CORE_TABLE requires TRACKER_BACKEND_URL".to_string(),
                ));
            }
            builder = builder.core_table(table);
        }
        if let Some(view) = env_value::<String, _>(&lookup, "TRACKER_DERIVED_VIEW")? {
            if url.is_none() {
                return Err(ConfigurationError::EnvVar(
                    "TRACKER_DERIVED_VIEW requires TRACKER_BACKEND_URL".to_string(),
                ));
            }
            builder = builder.derived_view(view);
        }
        if let Some(ms) = env_value::<u64, _>(&lookup, "TRACKER_CALL_TIMEOUT_MS")? {
            builder = builder.call_timeout(Duration::from_millis(ms));
        }
        if let Some(n) = env_value::<u32, _>(&lookup, "TRACKER_MAX_ATTEMPTS")? {
            builder = builder.max_attempts(n);
        }
        if let Some(n) = env_value::<u32, _>(&lookup, "TRACKER_RATE_LIMIT")? {
            builder.config.rate_limit = builder.config.rate_limit.max_per_window(n);
        }
        if let Some(ms) = env_value::<u64, _>(&lookup, "TRACKER_RATE_WINDOW_MS")? {
            builder.config.rate_limit = builder.config.rate_limit.window(Duration::from_millis(ms));
        }
        if let Some(n) = env_value::<u32, _>(&lookup, "TRACKER_FAILURE_THRESHOLD")? {
            builder.config.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = env_value::<u64, _>(&lookup, "TRACKER_RECOVERY_TIMEOUT_MS")? {
            builder.config.circuit_breaker.recovery_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = env_value::<u64, _>(&lookup, "TRACKER_HEALTH_INTERVAL_SECS")? {
            builder.config.health.interval = Duration::from_secs(secs);
        }
        if let Some(ms) = env_value::<u64, _>(&lookup, "TRACKER_LATENCY_THRESHOLD_MS")? {
            builder.config.health.latency_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value::<u64, _>(&lookup, "TRACKER_FLUSH_RETRY_MS")? {
            builder.config.flush_retry_interval = Duration::from_millis(ms);
        }

        builder.build()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigurationError> {
            if value.is_zero() {
                return Err(ConfigurationError::InvalidValue {
                    name,
                    message: "must be greater than zero".to_string(),
                });
            }
            Ok(())
        }

        non_zero("call_timeout", self.call_timeout)?;
        non_zero("rate_limit.window", self.rate_limit.window)?;
        non_zero("health.interval", self.health.interval)?;
        non_zero("health.probe_timeout", self.health.probe_timeout)?;
        non_zero("flush_retry_interval", self.flush_retry_interval)?;

        if self.retry_policy.max_attempts == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "retry_policy.max_attempts",
                message: "must be at least 1".to_string(),
            });
        }
        if self.rate_limit.max_per_window == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "rate_limit.max_per_window",
                message: "must be at least 1".to_string(),
            });
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "circuit_breaker.failure_threshold",
                message: "must be at least 1".to_string(),
            });
        }
        if self.retry_policy.base_delay > self.retry_policy.max_delay {
            return Err(ConfigurationError::InvalidValue {
                name: "retry_policy.base_delay",
                message: "must not exceed max_delay".to_string(),
            });
        }

        Ok(())
    }
}

fn env_value<T, L>(lookup: &L, name: &str) -> Result<Option<T>, ConfigurationError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Result<String, VarError>,
{
    match lookup(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigurationError::EnvVar(format!("{name}: {e}"))),
        Err(VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigurationError::EnvVar(format!("{name}: {e}"))),
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
    core_table: Option<String>,
    derived_view: Option<String>,
}

impl ClientConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend URL and API key
    pub fn backend(
        mut self,
        base_url: &str,
        api_key: impl Into<String>,
    ) -> Result<Self, ConfigurationError> {
        self.config.backend = Some(BackendConfig::new(base_url, api_key)?);
        Ok(self)
    }

    /// Set the table read by the core-table probe
    pub fn core_table(mut self, table: impl Into<String>) -> Self {
        self.core_table = Some(table.into());
        self
    }

    /// Set the view read by the derived-view probe
    pub fn derived_view(mut self, view: impl Into<String>) -> Self {
        self.derived_view = Some(view.into());
        self
    }

    /// Set the per-attempt timeout
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set the default number of attempts
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.retry_policy = self.config.retry_policy.max_attempts(attempts);
        self
    }

    /// Set the default retry policy
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = policy;
        self
    }

    /// Set the default rate limit
    pub fn rate_limit(mut self, config: RateLimiterConfig) -> Self {
        self.config.rate_limit = config;
        self
    }

    /// Set the default circuit breaker settings
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set cache settings
    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.config.cache = config;
        self
    }

    /// Set health monitor settings
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Enable or disable flushing on reconnect
    pub fn auto_flush(mut self, enabled: bool) -> Self {
        self.config.auto_flush = enabled;
        self
    }

    /// Set the first delay before re-flushing writes left queued while online
    pub fn flush_retry_interval(mut self, interval: Duration) -> Self {
        self.config.flush_retry_interval = interval;
        self
    }

    /// Build the configuration
    pub fn build(mut self) -> Result<ClientConfig, ConfigurationError> {
        match self.config.backend.as_mut() {
            Some(backend) => {
                if let Some(table) = self.core_table.take() {
                    backend.core_table = table;
                }
                if let Some(view) = self.derived_view.take() {
                    backend.derived_view = view;
                }
            }
            None if self.core_table.is_some() || self.derived_view.is_some() => {
                return Err(ConfigurationError::InvalidValue {
                    name: "backend",
                    message: "core_table and derived_view need a backend".to_string(),
                })
            }
            None => {}
        }
        self.config.validate()?;
        Ok(self.config)
    }
}
