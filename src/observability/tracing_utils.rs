//! Span helpers for remote operations.

use tracing::{field, info_span, Span};

/// Outcome recorded on an operation span
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Served from cache
    CacheHit,
    /// Remote call succeeded
    Success,
    /// Stale value served after a failed refresh
    Stale,
    /// Write deferred to the offline queue
    Queued,
    /// Remote call failed
    Error,
}

impl Outcome {
    /// Name used in span fields
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CacheHit => "cache_hit",
            Self::Success => "success",
            Self::Stale => "stale",
            Self::Queued => "queued",
            Self::Error => "error",
        }
    }
}

/// Create a span for one data-access operation, tagged with a fresh request id
pub fn operation_span(operation: &'static str, resource_key: &str) -> Span {
    info_span!(
        "tracker_data",
        operation,
        resource_key = %resource_key,
        request_id = %uuid::Uuid::new_v4(),
        outcome = field::Empty,
        error.code = field::Empty,
    )
}

/// Record the outcome on a span
pub fn record_outcome(span: &Span, outcome: Outcome) {
    span.record("outcome", outcome.as_str());
}

/// Record a failure code on a span
pub fn record_error_code(span: &Span, code: &str) {
    span.record("outcome", Outcome::Error.as_str());
    span.record("error.code", code);
}
