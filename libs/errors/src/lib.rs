//! Shared error plumbing for gateway services
//!
//! Services keep their own domain error enums (register store, point map,
//! codec, lifecycle). This crate gives them one outward-facing shape:
//! an [`ErrorCategory`] for classification, an HTTP status, a log level
//! and the [`ErrorInfo`] payload returned by the HTTP surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// ErrorInfo - API error response type
// ============================================================================

/// Standard error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (HTTP status or custom)
    pub code: u16,
    /// Machine readable error kind, e.g. `POINT_NOT_FOUND`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Error message
    pub message: String,
    /// Detailed error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Field-specific errors for validation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_errors: HashMap<String, Vec<String>>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            kind: None,
            message: message.into(),
            details: None,
            field_errors: HashMap::new(),
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    /// Set the machine readable kind
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Add a field error
    pub fn add_field_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.field_errors
            .entry(field.into())
            .or_default()
            .push(error.into());
        self
    }
}

// ============================================================================
// Service error trait
// ============================================================================

/// Error category enum - used for classification and HTTP mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Network,
    Timeout,

    // Business logic layer
    Validation,
    NotFound,
    Conflict,
    Permission,

    // Protocol/communication layer
    Protocol,
    Connection,

    // System level
    Internal,
    ResourceBusy,
}

/// Unified interface implemented by every service error type
///
/// Each service keeps its own domain-specific error enum and gains the
/// outward-facing behaviour (status code, log level, API payload) from the
/// defaults below.
pub trait ServiceError: std::error::Error + Send + Sync + 'static {
    /// Get error code (for API, logs)
    fn error_code(&self) -> &'static str;

    /// Get error category
    fn category(&self) -> ErrorCategory;

    /// HTTP status code as a plain number
    fn status_code(&self) -> u16 {
        match self.category() {
            ErrorCategory::Validation => 400,
            ErrorCategory::Permission => 403,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Timeout => 408,
            ErrorCategory::Conflict => 409,
            ErrorCategory::Network | ErrorCategory::ResourceBusy => 503,
            ErrorCategory::Connection | ErrorCategory::Protocol => 502,
            ErrorCategory::Configuration | ErrorCategory::Internal => 500,
        }
    }

    /// Convert to HTTP status code
    #[cfg(feature = "axum-support")]
    fn http_status(&self) -> axum::http::StatusCode {
        axum::http::StatusCode::from_u16(self.status_code())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Build the API payload
    fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.to_string())
            .with_code(self.status_code())
            .with_kind(self.error_code())
    }

    /// Get log level
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal | ErrorCategory::Configuration => Level::ERROR,
            ErrorCategory::Network
            | ErrorCategory::Timeout
            | ErrorCategory::Connection
            | ErrorCategory::Protocol => Level::WARN,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}
