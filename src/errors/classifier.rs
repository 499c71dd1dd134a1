//! Declarative mapping from backend error codes to the error taxonomy.
//!
//! The table below is the single source of truth for retryability. It is
//! consulted by the retry executor and, through the category, by the
//! circuit breaker.

use super::{codes, ClassifiedError, ErrorCategory, ErrorSeverity, RawError};

/// One row of the classification table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRule {
    /// Error code this rule matches
    pub code: &'static str,
    /// Category assigned to the error
    pub category: ErrorCategory,
    /// Severity assigned to the error
    pub severity: ErrorSeverity,
    /// Whether a retry may succeed
    pub retryable: bool,
    /// Message shown to the user
    pub user_message: &'static str,
}

const fn rule(
    code: &'static str,
    category: ErrorCategory,
    severity: ErrorSeverity,
    retryable: bool,
    user_message: &'static str,
) -> ErrorRule {
    ErrorRule {
        code,
        category,
        severity,
        retryable,
        user_message,
    }
}

use ErrorCategory::{Data, Network, Permission, System, Validation};
use ErrorSeverity::{High, Low, Medium};

/// Rule applied to codes missing from the table
pub const DEFAULT_RULE: ErrorRule = rule(
    "",
    System,
    Medium,
    true,
    "Something went wrong. Please try again.",
);

/// Classification table.
pub const RULES: &[ErrorRule] = &[
    // Validation
    rule("22P02", Validation, Low, false, "Some of the information you entered isn't in the right format."),
    rule("22001", Validation, Low, false, "One of the values you entered is too long."),
    rule("23502", Validation, Low, false, "A required field is missing."),
    rule("23514", Validation, Low, false, "One of the values you entered isn't allowed."),
    rule("PGRST102", Validation, Low, false, "The request could not be understood. Please check your input."),
    rule(codes::INVALID_INPUT, Validation, Low, false, "Please check your input and try again."),
    rule("400", Validation, Low, false, "Please check your input and try again."),
    // Data
    rule("23505", Data, Medium, false, "This item already exists."),
    rule("23503", Data, Medium, false, "This item is linked to something that no longer exists."),
    rule("PGRST116", Data, Low, false, "The requested item could not be found."),
    rule("404", Data, Low, false, "The requested item could not be found."),
    rule("409", Data, Medium, false, "This change conflicts with existing data."),
    // Permission
    rule("42501", Permission, High, false, "You don't have permission to perform this action."),
    rule("PGRST301", Permission, High, false, "Your session has expired. Please sign in again."),
    rule("PGRST302", Permission, High, false, "Please sign in to continue."),
    rule("401", Permission, High, false, "Please sign in to continue."),
    rule("403", Permission, High, false, "You don't have permission to perform this action."),
    // Schema
    rule("42P01", System, High, false, "This feature is temporarily unavailable. Please contact support."),
    rule("42703", System, High, false, "This feature is temporarily unavailable. Please contact support."),
    rule("42883", System, High, false, "This feature is temporarily unavailable. Please contact support."),
    rule("PGRST200", System, High, false, "This feature is temporarily unavailable. Please contact support."),
    rule("PGRST204", System, High, false, "This feature is temporarily unavailable. Please contact support."),
    // Network
    rule(codes::TIMEOUT, Network, Medium, true, "The request timed out. Please try again."),
    rule(codes::NETWORK_ERROR, Network, Medium, true, "Unable to reach the server. Check your connection."),
    rule("PGRST000", Network, High, true, "Unable to reach the database. Please try again shortly."),
    rule("PGRST001", Network, High, true, "Unable to reach the database. Please try again shortly."),
    rule("408", Network, Medium, true, "The request timed out. Please try again."),
    rule("57014", Network, Medium, true, "The request took too long. Please try again."),
    // System
    rule(codes::RATE_LIMITED, System, Low, true, "Too many requests. Please wait a moment."),
    rule("429", System, Low, true, "Too many requests. Please wait a moment."),
    rule(codes::CIRCUIT_OPEN, System, High, false, "The service is temporarily unavailable. Please try again shortly."),
    rule("PGRST003", System, Medium, true, "The service is busy. Please try again."),
    rule("40001", System, Low, true, "The service is busy. Please try again."),
    rule("40P01", System, Low, true, "The service is busy. Please try again."),
    rule("53300", System, High, true, "The service is busy. Please try again."),
    rule("500", System, High, true, "The server encountered an error. Please try again."),
    rule("502", System, High, true, "The service is temporarily unavailable. Please try again shortly."),
    rule("503", System, High, true, "The service is temporarily unavailable. Please try again shortly."),
    rule("504", System, High, true, "The service is temporarily unavailable. Please try again shortly."),
];

/// Classifies raw backend errors using a fixed rule table
#[derive(Debug, Clone, Copy)]
pub struct ErrorClassifier {
    rules: &'static [ErrorRule],
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl ErrorClassifier {
    /// Create a classifier over the built-in table
    pub fn new() -> Self {
        Self { rules: RULES }
    }

    /// Look up the rule for a code, falling back to [`DEFAULT_RULE`]
    pub fn rule_for(&self, code: &str) -> &'static ErrorRule {
        self.find(code).unwrap_or(&DEFAULT_RULE)
    }

    fn find(&self, code: &str) -> Option<&'static ErrorRule> {
        self.rules.iter().find(|r| r.code == code)
    }

    /// Classify a raw error.
    ///
    /// The code is looked up first; an unknown or empty code falls back to the
    /// HTTP status, then to the default rule.
    pub fn classify(&self, raw: &RawError) -> ClassifiedError {
        let rule = self
            .find(&raw.code)
            .or_else(|| raw.http_status.and_then(|s| self.find(&s.to_string())))
            .unwrap_or(&DEFAULT_RULE);
        ClassifiedError::from_rule(raw, rule)
    }

    /// Whether errors with this code may be retried
    pub fn is_retryable(&self, code: &str) -> bool {
        self.rule_for(code).retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use test_case::test_case;

    #[test_case("22P02", Validation, false ; "invalid text representation")]
    #[test_case("INVALID_INPUT", Validation, false ; "local invalid input")]
    #[test_case("23505", Data, false ; "unique violation")]
    #[test_case("23503", Data, false ; "foreign key violation")]
    #[test_case("42501", Permission, false ; "insufficient privilege")]
    #[test_case("PGRST301", Permission, false ; "expired jwt")]
    #[test_case("42P01", System, false ; "undefined table")]
    #[test_case("TIMEOUT", Network, true ; "timeout")]
    #[test_case("NETWORK_ERROR", Network, true ; "network error")]
    #[test_case("RATE_LIMITED", System, true ; "rate limited")]
    #[test_case("CIRCUIT_OPEN", System, false ; "circuit open")]
    #[test_case("503", System, true ; "service unavailable")]
    fn test_classification_table(code: &str, category: ErrorCategory, retryable: bool) {
        let err = ErrorClassifier::new().classify(&RawError::new(code, "boom"));
        assert_eq!(err.category(), category);
        assert_eq!(err.is_retryable(), retryable);
        assert_eq!(err.code(), code);
        assert_eq!(err.raw_message(), "boom");
        assert!(!err.user_message().is_empty());
    }

    #[test]
    fn test_unknown_code_gets_conservative_default() {
        let err = ErrorClassifier::new().classify(&RawError::new("XX999", "weird"));
        assert_eq!(err.category(), System);
        assert_eq!(err.severity(), Medium);
        assert!(err.is_retryable());
        assert_eq!(err.user_message(), DEFAULT_RULE.user_message);
    }

    #[test]
    fn test_unknown_code_falls_back_to_status() {
        let raw = RawError::new("XX999", "forbidden").with_status(403);
        let err = ErrorClassifier::new().classify(&raw);
        assert_eq!(err.category(), Permission);
        assert!(!err.is_retryable());
        assert_eq!(err.code(), "XX999");
    }

    #[test]
    fn test_codes_are_unique() {
        let mut seen = HashSet::new();
        for rule in RULES {
            assert!(seen.insert(rule.code), "duplicate rule for {}", rule.code);
        }
    }

    #[test]
    fn test_only_network_and_system_are_retryable() {
        for rule in RULES {
            if rule.retryable {
                assert!(
                    rule.category.is_backend_failure(),
                    "{} is retryable but not a backend failure",
                    rule.code
                );
            }
        }
    }
}
