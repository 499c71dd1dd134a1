//! Error types for the tracker data client.
//!
//! Remote operations fail with a [`RawError`], the shape the backend's REST
//! layer reports. The retry executor classifies it exactly once into a
//! [`ClassifiedError`]; every layer above it deals only in classified errors.

pub mod classifier;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub use classifier::{ErrorClassifier, ErrorRule};

/// Result type for data-access operations
pub type DataResult<T> = Result<T, ClassifiedError>;

/// Broad error category used for retry and circuit breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Bad input
    Validation,
    /// Access denied
    Permission,
    /// Connectivity or timeout
    Network,
    /// Backend overload or internal failure
    System,
    /// Referential or constraint conflict
    Data,
}

impl ErrorCategory {
    /// Whether errors of this category count against a circuit breaker
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Self::Network | Self::System)
    }

    /// Lowercase name of the category
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Permission => "permission",
            Self::Network => "network",
            Self::System => "system",
            Self::Data => "data",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How serious an error is for the end user
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Cosmetic or self-healing
    Low,
    /// Needs user attention
    Medium,
    /// Feature unavailable
    High,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
        }
    }
}

/// Error reported by a remote operation before classification.
///
/// The JSON shape matches the backend's REST error body
/// (`{"code", "message", "details", "hint"}`).
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RawError {
    /// Backend error code (Postgres SQLSTATE, REST layer code, or a local code)
    #[serde(default)]
    pub code: String,
    /// Backend-provided message
    #[serde(default)]
    pub message: String,
    /// Extra detail, if provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Hint, if provided
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    /// HTTP status of the failed response
    #[serde(skip)]
    pub http_status: Option<u16>,
}

impl RawError {
    /// Create a raw error from a code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            hint: None,
            http_status: None,
        }
    }

    /// Attach the HTTP status of the failed response
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    /// Attach details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Attach a hint
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Build a raw error from an HTTP status and response body.
    ///
    /// A well-formed error body supplies the code; otherwise the status code
    /// itself becomes the code.
    pub fn from_response(status: u16, body: &str) -> Self {
        match serde_json::from_str::<RawError>(body) {
            Ok(mut parsed) if !parsed.code.is_empty() => {
                parsed.http_status = Some(status);
                parsed
            }
            Ok(parsed) => Self {
                code: status.to_string(),
                message: if parsed.message.is_empty() {
                    default_status_message(status)
                } else {
                    parsed.message
                },
                details: parsed.details,
                hint: parsed.hint,
                http_status: Some(status),
            },
            Err(_) => Self::new(status.to_string(), default_status_message(status)).with_status(status),
        }
    }

    /// Connectivity failure before any response was received
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(codes::NETWORK_ERROR, message)
    }

    /// Per-call timeout elapsed
    pub fn timeout(after: Duration) -> Self {
        Self::new(
            codes::TIMEOUT,
            format!("operation timed out after {}ms", after.as_millis()),
        )
    }

    /// Invalid input detected locally, before reaching the backend
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_INPUT, message)
    }
}

fn default_status_message(status: u16) -> String {
    http::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown error")
        .to_string()
}

impl From<reqwest::Error> for RawError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::new(codes::TIMEOUT, err.to_string())
        } else if err.is_connect() || err.is_request() {
            Self::network(err.to_string())
        } else if let Some(status) = err.status() {
            Self::new(status.as_u16().to_string(), err.to_string()).with_status(status.as_u16())
        } else {
            Self::network(err.to_string())
        }
    }
}

/// Codes produced by this crate rather than by the backend
pub mod codes {
    /// Per-call timeout elapsed
    pub const TIMEOUT: &str = "TIMEOUT";
    /// Connectivity failure
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    /// Rate limiter rejected the call
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    /// Circuit breaker rejected the call
    pub const CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";
    /// Input rejected before the call was made
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
}

/// A normalized, immutable error carrying everything a caller needs to
/// decide what to do and what to show.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("[{category}/{code}] {raw_message}")]
pub struct ClassifiedError {
    code: String,
    raw_message: String,
    user_message: String,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    timestamp: DateTime<Utc>,
}

impl ClassifiedError {
    pub(crate) fn from_rule(raw: &RawError, rule: &ErrorRule) -> Self {
        Self {
            code: raw.code.clone(),
            raw_message: raw.message.clone(),
            user_message: rule.user_message.to_string(),
            category: rule.category,
            severity: rule.severity,
            retryable: rule.retryable,
            timestamp: Utc::now(),
        }
    }

    /// Backend or local error code
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Message as reported by the backend
    pub fn raw_message(&self) -> &str {
        &self.raw_message
    }

    /// Ready-to-display message
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Error category
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// Error severity
    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    /// Whether retrying may succeed
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// When the error occurred
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether this error should count against a circuit breaker
    pub fn is_backend_failure(&self) -> bool {
        self.category.is_backend_failure()
    }
}

/// Configuration errors raised while building a client
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// Backend URL could not be parsed
    #[error("Invalid backend URL: {message}")]
    InvalidUrl {
        /// Error message
        message: String,
    },

    /// A setting has an unusable value
    #[error("Invalid value for {name}: {message}")]
    InvalidValue {
        /// Setting name
        name: &'static str,
        /// Error message
        message: String,
    },

    /// Environment variable could not be parsed
    #[error("Environment variable error: {0}")]
    EnvVar(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    HttpClient(String),
}
