//! Retry with exponential backoff for transient failures.

use crate::errors::{ClassifiedError, DataResult, ErrorClassifier, RawError};
use crate::observability::ClientMetrics;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Jitter spread applied around the computed delay (±25%)
pub const JITTER_RATIO: f64 = 0.25;

/// Retry behaviour for one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (at least 1)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Upper bound on the computed delay
    pub max_delay: Duration,
    /// Whether to randomize delays
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retries
    pub fn no_retry() -> Self {
        Self::default().max_attempts(1)
    }

    /// Set the total number of attempts (clamped to at least 1)
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Set the base delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter_enabled = jitter;
        self
    }

    /// Backoff delay after a failed `attempt` (1-based), before jitter
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.base_delay.as_millis() as f64 * 2f64.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay to wait after a failed `attempt` (1-based), jitter included
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.backoff_for_attempt(attempt);
        if !self.jitter_enabled || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        delay.mul_f64(factor)
    }
}

/// Runs remote operations under a retry policy.
///
/// Every attempt is bounded by the per-call timeout. Backoff uses
/// `tokio::time::sleep`, so only the calling task waits.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    classifier: ErrorClassifier,
    call_timeout: Option<Duration>,
    metrics: Option<Arc<ClientMetrics>>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    /// Create an executor without a per-call timeout
    pub fn new() -> Self {
        Self {
            classifier: ErrorClassifier::new(),
            call_timeout: None,
            metrics: None,
        }
    }

    /// Bound each attempt by `timeout`
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Record retries in the given metrics collector
    pub fn with_metrics(mut self, metrics: Arc<ClientMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The classifier used for retry decisions
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Classify a raw error
    pub fn classify(&self, raw: &RawError) -> ClassifiedError {
        self.classifier.classify(raw)
    }

    /// Execute `operation` under `policy`.
    ///
    /// Returns the first success, or the classified error of the last attempt.
    /// Non-retryable errors return after a single attempt.
    pub async fn execute<F, Fut, T>(&self, policy: &RetryPolicy, operation: F) -> DataResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match self.attempt(&operation).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(raw) => self.classifier.classify(&raw),
            };

            if !error.is_retryable() || attempt >= max_attempts {
                warn!(
                    attempt,
                    max_attempts,
                    retryable = error.is_retryable(),
                    code = error.code(),
                    category = %error.category(),
                    "Operation failed permanently"
                );
                return Err(error);
            }

            let delay = policy.delay_for_attempt(attempt);
            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                code = error.code(),
                "Retrying after transient error"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_retry();
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<F, Fut, T>(&self, operation: &F) -> Result<T, RawError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, RawError>>,
    {
        match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, operation()).await {
                Ok(result) => result,
                Err(_) => Err(RawError::timeout(limit)),
            },
            None => operation().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
            .with_jitter(false)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = fast_policy(10);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = fast_policy(3).with_jitter(true);
        for _ in 0..500 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(150), "{delay:?}");
            assert!(delay <= Duration::from_millis(250), "{delay:?}");
        }
    }

    #[test]
    fn test_max_attempts_clamped() {
        assert_eq!(RetryPolicy::new().max_attempts(0).max_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_success_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new();
        let started = Instant::now();

        let result = executor
            .execute(&fast_policy(3), || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(RawError::network("connection reset"))
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_returns_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new();

        let result: DataResult<()> = executor
            .execute(&fast_policy(4), || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(RawError::new("503", format!("attempt {n}")))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(err.raw_message(), "attempt 4");
        assert_eq!(err.category(), ErrorCategory::System);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_error_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new();
        let started = Instant::now();

        let result: DataResult<()> = executor
            .execute(&fast_policy(5), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(RawError::new("22P02", "invalid input syntax for type uuid"))
                }
            })
            .await;

        assert_eq!(result.unwrap_err().category(), ErrorCategory::Validation);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_passthrough() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new();

        let result: DataResult<()> = executor
            .execute(&RetryPolicy::no_retry(), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(RawError::network("down"))
                }
            })
            .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_retryable_network_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new().with_call_timeout(Duration::from_secs(1));

        let result: DataResult<()> = executor
            .execute(&fast_policy(2), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            })
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.code(), "TIMEOUT");
        assert_eq!(err.category(), ErrorCategory::Network);
        assert!(err.is_retryable());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_does_not_block_other_calls() {
        let executor = RetryExecutor::new();
        let slow_policy = fast_policy(2).base_delay(Duration::from_secs(5));
        let started = Instant::now();

        let slow = executor.execute(&slow_policy, || async {
            Err::<(), _>(RawError::network("down"))
        });
        let fast = async {
            let value = executor
                .execute(&fast_policy(1), || async { Ok::<_, RawError>(7) })
                .await;
            (value, started.elapsed())
        };

        let (slow_result, (fast_result, fast_elapsed)) = tokio::join!(slow, fast);
        assert!(slow_result.is_err());
        assert_eq!(fast_result.unwrap(), 7);
        assert_eq!(fast_elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_recorded_in_metrics() {
        let metrics = Arc::new(ClientMetrics::new());
        let executor = RetryExecutor::new().with_metrics(metrics.clone());

        let _: DataResult<()> = executor
            .execute(&fast_policy(3), || async { Err(RawError::network("down")) })
            .await;

        assert_eq!(metrics.snapshot().retries, 2);
    }
}
