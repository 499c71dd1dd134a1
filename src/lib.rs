//! Tracker data client
//!
//! Resilient data access for the content tracker's hosted Postgres backend:
//! - TTL cache with prefix invalidation
//! - Per-resource rate limiting and circuit breaking
//! - Retry with exponential backoff and jitter
//! - Offline write queue replayed on reconnect
//! - Periodic backend health checks
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tracker_data_client::RawError;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = tracker_data_client::create_client_from_env()?;
//!     client.start();
//!
//!     let tools: Vec<String> = client
//!         .execute_read("tools", "tools:all", Some(Duration::from_secs(60)), || async {
//!             Ok::<_, RawError>(vec!["hammer".to_string()])
//!         })
//!         .await?;
//!
//!     println!("{} tools", tools.len());
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod cache;
pub mod client;
pub mod config;
pub mod errors;

// Resilience
pub mod offline;
pub mod resilience;

// Health
pub mod health;

// Observability
pub mod observability;

// Re-exports for convenience
pub use cache::{CacheConfig, CacheLookup, CacheStore};
pub use client::{ReadOutcome, ResilientClient, ResilientClientBuilder, WriteOutcome};
pub use config::{BackendConfig, ClientConfig, ClientConfigBuilder};
pub use errors::{
    ClassifiedError, ConfigurationError, DataResult, ErrorCategory, ErrorClassifier,
    ErrorSeverity, RawError,
};
pub use health::{BackendProbe, HealthConfig, HealthSnapshot, HealthStatus, HttpBackendProbe};
pub use offline::{ConnectivitySignal, FlushReport, OperationKind, QueuedReceipt};
pub use resilience::{CircuitBreakerConfig, CircuitState, RateLimiterConfig, RetryPolicy};

/// Create a client from `config`, probing the configured backend
pub fn create_client(config: ClientConfig) -> Result<ResilientClient, ConfigurationError> {
    ResilientClient::builder(config).build()
}

/// Create a client from environment variables
///
/// Reads:
/// - `TRACKER_BACKEND_URL` - Backend base URL
/// - `TRACKER_API_KEY` - API key sent as `apikey` and bearer token
/// - `TRACKER_CALL_TIMEOUT_MS`, `TRACKER_MAX_ATTEMPTS` - Call settings
/// - `TRACKER_RATE_LIMIT`, `TRACKER_RATE_WINDOW_MS` - Rate limit per resource
/// - `TRACKER_FAILURE_THRESHOLD`, `TRACKER_RECOVERY_TIMEOUT_MS` - Circuit breaker
/// - `TRACKER_HEALTH_INTERVAL_SECS`, `TRACKER_LATENCY_THRESHOLD_MS` - Health checks
/// - `TRACKER_CORE_TABLE`, `TRACKER_DERIVED_VIEW` - Probed relations
pub fn create_client_from_env() -> Result<ResilientClient, ConfigurationError> {
    create_client(ClientConfig::from_env()?)
}
