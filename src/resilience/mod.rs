//! Resilience patterns for remote calls.
//!
//! - Rate limiting per resource key
//! - Circuit breaking per resource key
//! - Retry with exponential backoff and jitter

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitPermit,
    CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryExecutor, RetryPolicy, JITTER_RATIO};
