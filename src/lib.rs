//! sqlask - Natural-Language Questions over SQL Databases
//!
//! sqlask answers a plain-language question against a live PostgreSQL, MySQL or SQLite
//! database. It introspects the schema, renders it for a language model, asks the model for
//! a single parameterized `SELECT`, validates that statement against the known schema and
//! executes it read-only with bound parameters.
//!
//! # Core Principles
//! - Read-only by construction (validator allow-list plus read-only sessions)
//! - Values always travel as bound parameters, never spliced into SQL
//! - Credentials never appear in errors, logs or output
//! - Stateless library: configuration is passed in, never read from the environment
//!
//! # Module Organization
//! - [`error`] - Error types and secret masking
//! - [`engine`] - Database engine trait, schema types and engine implementations
//! - [`render`] - Budgeted schema rendering for prompts
//! - [`llm`] - Language model client boundary
//! - [`generator`] - Prompt building and reply parsing
//! - [`query`] - Generated queries and placeholder binding
//! - [`validator`] - Read-only, schema-aware SQL validation
//! - [`pipeline`] - The question-to-result state machine
//! - [`output`] - JSON output envelope types
//! - [`config`] - Profile loading for the binary
//! - [`health`] - Configuration and connectivity checks

pub mod config;
pub mod engine;
pub mod error;
pub mod generator;
pub mod health;
pub mod llm;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod render;
pub mod validator;

pub use engine::{
    AnyEngine, ColumnInfo, ConnectionConfig, DatabaseEngine, DatabaseType, ExecutionLimits,
    ExecutionResult, ForeignKeyInfo, IndexInfo, IntrospectionOptions, SchemaDescriptor,
    TableDescriptor,
};
pub use error::{ExecutionErrorKind, Result, SqlaskError};
pub use generator::{GenerationRequest, SqlGenerator};
pub use health::{HealthReport, HealthStatus};
pub use llm::{HttpLlmClient, LlmClient, LlmConfig, LlmProvider, TokenUsage};
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use pipeline::{run_pipeline, Answer, Pipeline, PipelineFailure, PipelineOptions, Stage};
pub use query::GeneratedQuery;
pub use render::render;
pub use validator::{validate_question, SqlValidator};
