//! Observability infrastructure for the data client.
//!
//! Provides metrics, logging setup and tracing span helpers.

pub mod logging;
pub mod metrics;
pub mod tracing_utils;

pub use logging::{log_classified_error, LogFormat, LogLevel, LoggingConfig};
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use tracing_utils::{operation_span, record_error_code, record_outcome, Outcome};
