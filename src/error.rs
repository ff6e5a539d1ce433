//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout sqlask.
//! All errors are structured and map to stable error codes for JSON output.
//!
//! # Error Categories
//! - `ConnectionFailed`: Database unreachable, auth failure, connect timeout
//! - `IntrospectionFailed`: Schema metadata could not be read
//! - `GenerationFailed`: LLM unreachable, timed out, or returned an unparsable reply
//! - `ValidationFailed`: Generated SQL rejected by the static validator
//! - `ExecutionFailed`: Driver rejected the statement, timeout, or binding mismatch
//! - `InvalidInput`: Malformed input or missing required parameters
//! - `ConfigError`: Configuration file or environment errors

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Replacement text for any credential that would otherwise be displayed
pub const MASK: &str = "********";

/// Sub-classification of execution failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The driver or database rejected the statement
    Driver,
    /// The statement exceeded its timeout and was aborted
    Timeout,
    /// Placeholders and bound parameters do not line up
    Binding,
}

/// Main error type for sqlask operations
#[derive(Error, Debug)]
pub enum SqlaskError {
    /// Database connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Schema metadata could not be read
    #[error("Introspection failed ({engine}): {detail}")]
    IntrospectionFailed { engine: String, detail: String },

    /// SQL generation failed
    #[error("SQL generation failed: {0}")]
    GenerationFailed(String),

    /// Generated SQL rejected before execution
    #[error("Generated SQL rejected: {0}")]
    ValidationFailed(String),

    /// Query execution failed
    #[error("Query execution failed: {detail}")]
    ExecutionFailed { kind: ExecutionErrorKind, detail: String },

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error (file not found, invalid JSON, missing env var, etc.)
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl SqlaskError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed(_) => "CONNECTION_ERROR",
            Self::IntrospectionFailed { .. } => "INTROSPECTION_ERROR",
            Self::GenerationFailed(_) => "GENERATION_ERROR",
            Self::ValidationFailed(_) => "VALIDATION_ERROR",
            Self::ExecutionFailed { .. } => "EXECUTION_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ConfigError(_) => "CONFIG_ERROR",
        }
    }

    /// Get human-readable error message
    ///
    /// Callers that hold credentials must pass this through [`mask_secrets`]
    /// before displaying it.
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Execution sub-kind, if this is an execution failure
    #[must_use]
    pub const fn execution_kind(&self) -> Option<ExecutionErrorKind> {
        match self {
            Self::ExecutionFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(message: impl Into<String>) -> Self {
        Self::ConnectionFailed(message.into())
    }

    /// Create an introspection error for a specific engine
    pub fn introspection_failed(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::IntrospectionFailed { engine: engine.into(), detail: detail.into() }
    }

    /// Create a generation error
    pub fn generation_failed(message: impl Into<String>) -> Self {
        Self::GenerationFailed(message.into())
    }

    /// Create a validation error
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::ValidationFailed(message.into())
    }

    /// Create a driver-level execution error
    pub fn execution_failed(detail: impl Into<String>) -> Self {
        Self::ExecutionFailed { kind: ExecutionErrorKind::Driver, detail: detail.into() }
    }

    /// Create a statement timeout error
    pub fn execution_timeout(timeout_ms: u64) -> Self {
        Self::ExecutionFailed {
            kind: ExecutionErrorKind::Timeout,
            detail: format!("Query exceeded timeout of {timeout_ms}ms"),
        }
    }

    /// Create a parameter binding error
    pub fn binding_failed(detail: impl Into<String>) -> Self {
        Self::ExecutionFailed { kind: ExecutionErrorKind::Binding, detail: detail.into() }
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::ConfigError(message.into())
    }
}

/// Replace every occurrence of each non-empty secret with [`MASK`]
///
/// Secrets shorter than three characters are still masked; empty strings are skipped
/// so they cannot match everywhere.
#[must_use]
pub fn mask_secrets(message: &str, secrets: &[&str]) -> String {
    let mut masked = message.to_string();
    for secret in secrets.iter().filter(|s| !s.is_empty()) {
        masked = masked.replace(secret, MASK);
    }
    masked
}

/// Result type alias for sqlask operations
pub type Result<T> = std::result::Result<T, SqlaskError>;
