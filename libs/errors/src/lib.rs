//! Shared error primitives for host services.
//!
//! This crate provides the pieces that are common to every service built on
//! top of the worker host: an HTTP-shaped `ErrorInfo` for surfacing failures
//! across a process boundary, and a general-purpose `HostError` enum that
//! service-specific error types can convert into or wrap via `#[from]`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// ErrorInfo - API error response type
// ============================================================================

/// Standard error information for API / diagnostic responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (HTTP status or custom)
    pub code: u16,
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

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
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
// HostError - shared error type
// ============================================================================

/// General-purpose error for host-level services.
///
/// Service crates (like `workerhost`) define their own richer error enums for
/// domain-specific failure modes and convert into this one at the boundary
/// where a uniform shape is needed (logs, diagnostic APIs).
#[derive(Debug, Error)]
pub enum HostError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("missing required configuration: {0}")]
    MissingConfig(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("timeout waiting for {0}")]
    Timeout(String),

    #[error("communication error: {0}")]
    Communication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type HostResult<T> = Result<T, HostError>;

impl HostError {
    /// HTTP-shaped status code for this error, for services that expose one.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Timeout(_) => 504,
            Self::ServiceUnavailable(_) => 503,
            Self::Communication(_) | Self::Protocol(_) => 502,
            _ => 500,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ServiceUnavailable(_) | Self::Communication(_)
        )
    }

    pub fn to_error_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.to_string()).with_code(self.status_code())
    }
}

impl From<serde_json::Error> for HostError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
