//! JSON Output Envelope Types
//!
//! Every `sqlask` command prints exactly one envelope to stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "engine": "...", "command": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "engine": "...", "command": "...", "error": {"code": "...", "message": "..."}}`
//!
//! Pipeline failures additionally report the `stage` that failed and, for execution
//! errors, the `execution_kind` (`driver`, `timeout`, `binding`).

use serde::{Deserialize, Serialize};

use crate::engine::ExecutionResult;
use crate::error::{ExecutionErrorKind, SqlaskError};
use crate::llm::TokenUsage;
use crate::pipeline::{PipelineFailure, Stage};

/// Success envelope for command results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Database engine used (postgres, mysql, sqlite)
    pub engine: String,

    /// Command that was executed (ask, schema, config)
    pub command: String,

    /// Command-specific data
    pub data: T,

    /// Execution metadata
    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    /// Create a new success envelope
    pub fn new(engine: impl Into<String>, command: impl Into<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, engine: engine.into(), command: command.into(), data, meta }
    }
}

/// Error envelope for command failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    /// Database engine (empty when the failure happened before one was known)
    pub engine: String,

    /// Command that was attempted
    pub command: String,

    /// Error information
    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    /// Create a new error envelope
    pub fn new(engine: impl Into<String>, command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, engine: engine.into(), command: command.into(), error }
    }

    /// Create error envelope from `SqlaskError`
    pub fn from_error(engine: impl Into<String>, command: impl Into<String>, err: &SqlaskError) -> Self {
        let mut info = ErrorInfo::new(err.error_code(), err.message());
        info.execution_kind = err.execution_kind();
        Self::new(engine, command, info)
    }

    /// Create error envelope from a failed pipeline run
    pub fn from_failure(
        engine: impl Into<String>,
        command: impl Into<String>,
        failure: &PipelineFailure,
    ) -> Self {
        let info = ErrorInfo {
            code: failure.kind.clone(),
            message: failure.message.clone(),
            stage: Some(failure.stage),
            execution_kind: failure.execution_kind,
        };
        Self::new(engine, command, info)
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g., "VALIDATION_ERROR", "CONNECTION_ERROR")
    pub code: String,

    /// Human-readable, credential-free message
    pub message: String,

    /// Pipeline stage that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,

    /// Execution error sub-kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_kind: Option<ExecutionErrorKind>,
}

impl ErrorInfo {
    /// Create a new error info
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), stage: None, execution_kind: None }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Number of rows returned (query results only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,

    /// Whether rows were dropped by the row cap
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,

    /// Tokens the language model reported for this command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

impl Metadata {
    /// Create new metadata with just execution time
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None, truncated: false, token_usage: None }
    }

    /// Create new metadata with execution time and row count
    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned), truncated: false, token_usage: None }
    }

    /// Metadata for a query result
    #[must_use]
    pub const fn for_result(result: &ExecutionResult) -> Self {
        Self {
            execution_ms: result.execution_ms,
            rows_returned: Some(result.row_count),
            truncated: result.truncated,
            token_usage: None,
        }
    }

    /// Attach token usage; an empty tally is left out
    #[must_use]
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = if usage.is_empty() { None } else { Some(usage) };
        self
    }
}
