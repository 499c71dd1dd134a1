//! Per-resource fixed-window rate limiter.
//!
//! Each resource key gets its own window that opens on the first call and
//! lasts `window`. Once `max_per_window` calls were admitted, further calls
//! are rejected immediately with a retryable `RATE_LIMITED` error until the
//! window ends. Callers are never queued.

use crate::errors::{codes, DataResult, ErrorClassifier, RawError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for a rate limit window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Calls admitted per window
    pub max_per_window: u32,
    /// Window length
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_per_window: 100,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set calls per window
    pub fn max_per_window(mut self, n: u32) -> Self {
        self.max_per_window = n;
        self
    }

    /// Set window length
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Config that effectively never rejects
    pub fn unlimited() -> Self {
        Self {
            max_per_window: u32::MAX,
            window: Duration::from_secs(1),
        }
    }
}

/// Counter state for one resource key
#[derive(Debug, Clone)]
struct RateBucket {
    window_start: Instant,
    count_in_window: u32,
    max_per_window: u32,
    window: Duration,
}

impl RateBucket {
    fn new(config: RateLimiterConfig, now: Instant) -> Self {
        Self {
            window_start: now,
            count_in_window: 0,
            max_per_window: config.max_per_window,
            window: config.window,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start) >= self.window {
            self.window_start = now;
            self.count_in_window = 0;
        }
    }

    /// Admit one call, or return the time until the window ends
    fn try_acquire(&mut self, now: Instant) -> Result<(), Duration> {
        self.roll(now);
        if self.count_in_window < self.max_per_window {
            self.count_in_window += 1;
            Ok(())
        } else {
            let elapsed = now.saturating_duration_since(self.window_start);
            Err(self.window.saturating_sub(elapsed))
        }
    }

    fn retry_after(&mut self, now: Instant) -> Option<Duration> {
        self.roll(now);
        (self.count_in_window >= self.max_per_window).then(|| {
            let elapsed = now.saturating_duration_since(self.window_start);
            self.window.saturating_sub(elapsed)
        })
    }

    fn remaining(&mut self, now: Instant) -> u32 {
        self.roll(now);
        self.max_per_window.saturating_sub(self.count_in_window)
    }
}

/// Rate limiter keyed by resource
pub struct RateLimiter {
    default_config: RateLimiterConfig,
    overrides: Mutex<HashMap<String, RateLimiterConfig>>,
    buckets: Mutex<HashMap<String, RateBucket>>,
    classifier: ErrorClassifier,
}

impl RateLimiter {
    /// Create a limiter with default configuration
    pub fn new() -> Self {
        Self::with_config(RateLimiterConfig::default())
    }

    /// Create a limiter whose keys default to `config`
    pub fn with_config(config: RateLimiterConfig) -> Self {
        Self {
            default_config: config,
            overrides: Mutex::new(HashMap::new()),
            buckets: Mutex::new(HashMap::new()),
            classifier: ErrorClassifier::new(),
        }
    }

    /// Use a specific limit for one resource key.
    ///
    /// Resets that key's current window.
    pub fn configure_resource(&self, resource_key: &str, config: RateLimiterConfig) {
        self.overrides.lock().insert(resource_key.to_string(), config);
        self.buckets
            .lock()
            .insert(resource_key.to_string(), RateBucket::new(config, Instant::now()));
    }

    fn config_for(&self, resource_key: &str) -> RateLimiterConfig {
        self.overrides
            .lock()
            .get(resource_key)
            .copied()
            .unwrap_or(self.default_config)
    }

    /// Admit one call for `resource_key` or reject it
    pub fn try_acquire(&self, resource_key: &str) -> DataResult<()> {
        let now = Instant::now();
        let outcome = {
            let mut buckets = self.buckets.lock();
            match buckets.get_mut(resource_key) {
                Some(bucket) => bucket.try_acquire(now),
                None => {
                    let mut bucket = RateBucket::new(self.config_for(resource_key), now);
                    let outcome = bucket.try_acquire(now);
                    buckets.insert(resource_key.to_string(), bucket);
                    outcome
                }
            }
        };

        outcome.map_err(|retry_in| {
            warn!(
                resource_key,
                retry_in_ms = retry_in.as_millis() as u64,
                "Rate limit exceeded"
            );
            self.classifier.classify(&RawError::new(
                codes::RATE_LIMITED,
                format!(
                    "rate limit exceeded for '{resource_key}', window resets in {}ms",
                    retry_in.as_millis()
                ),
            ))
        })
    }

    /// Run `operation` if the call is admitted.
    ///
    /// The counter is updated under the lock; the operation runs outside it.
    pub async fn execute<F, Fut, T>(&self, resource_key: &str, operation: F) -> DataResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = DataResult<T>>,
    {
        self.try_acquire(resource_key)?;
        operation().await
    }

    /// Give back a slot admitted in the current window.
    ///
    /// Used when a later gate rejects the call before it reaches the backend.
    pub fn release(&self, resource_key: &str) {
        if let Some(bucket) = self.buckets.lock().get_mut(resource_key) {
            bucket.count_in_window = bucket.count_in_window.saturating_sub(1);
        }
    }

    /// Time until `resource_key` admits another call, or `None` if it would now
    pub fn retry_after(&self, resource_key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.buckets
            .lock()
            .get_mut(resource_key)
            .and_then(|bucket| bucket.retry_after(now))
    }

    /// Calls still admissible in the current window
    pub fn remaining(&self, resource_key: &str) -> u32 {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        match buckets.get_mut(resource_key) {
            Some(bucket) => bucket.remaining(now),
            None => self.config_for(resource_key).max_per_window,
        }
    }

    /// Reset one key, or every key when `None`
    pub fn reset(&self, resource_key: Option<&str>) {
        let mut buckets = self.buckets.lock();
        match resource_key {
            Some(key) => {
                buckets.remove(key);
            }
            None => buckets.clear(),
        }
        debug!(?resource_key, "Rate limits reset");
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("default_config", &self.default_config)
            .field("tracked_keys", &self.buckets.lock().len())
            .finish()
    }
}
