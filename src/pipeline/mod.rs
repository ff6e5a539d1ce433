//! Question-to-result pipeline
//!
//! Sequences introspection, rendering, generation, validation and execution as a small
//! state machine:
//!
//! ```text
//! Idle -> Introspecting -> Rendering -> Generating -> Validating -> Executing -> Done
//!                 \______________\_____________\______________\____________\-> Failed(stage)
//! ```
//!
//! Questions are screened by [`validate_question`] before anything is opened. A failure in
//! any stage stops the run and is returned as a [`PipelineFailure`] tagged
//! with that stage. Messages are passed through [`mask_secrets`] with every credential the
//! pipeline knows about.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::Semaphore;

use crate::engine::{
    AnyEngine, ConnectionConfig, DatabaseEngine, ExecutionLimits, ExecutionResult,
    IntrospectionOptions, SchemaDescriptor,
};
use crate::error::{mask_secrets, ExecutionErrorKind, SqlaskError};
use crate::generator::{GenerationRequest, SqlGenerator};
use crate::llm::{HttpLlmClient, LlmClient, LlmConfig};
use crate::query::GeneratedQuery;
use crate::render::{render, DEFAULT_SCHEMA_BUDGET};
use crate::validator::{validate_question, SqlValidator};

/// Hard cap on generation re-prompts
pub const MAX_GENERATION_RETRIES: usize = 2;

/// Default statement timeout applied by the pipeline
pub const DEFAULT_STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Working stage of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Introspecting,
    Rendering,
    Generating,
    Validating,
    Executing,
}

impl Stage {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Introspecting => "introspecting",
            Self::Rendering => "rendering",
            Self::Generating => "generating",
            Self::Validating => "validating",
            Self::Executing => "executing",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Running(Stage),
    Done,
    Failed(Stage),
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Running(stage) => write!(f, "{stage}"),
            Self::Done => f.write_str("done"),
            Self::Failed(stage) => write!(f, "failed({stage})"),
        }
    }
}

/// Why a run stopped
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{stage} failed ({kind}): {message}")]
pub struct PipelineFailure {
    /// Stage that failed
    pub stage: Stage,

    /// Stable error code (`CONNECTION_ERROR`, `VALIDATION_ERROR`, ...)
    pub kind: String,

    /// Sub-kind for `EXECUTION_ERROR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_kind: Option<ExecutionErrorKind>,

    /// Credential-free, human-readable explanation
    pub message: String,
}

/// Pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    /// Introspection scope
    pub introspection: IntrospectionOptions,

    /// Character budget for the rendered schema
    pub schema_budget: usize,

    /// Re-prompts after a generation error (capped at [`MAX_GENERATION_RETRIES`])
    pub max_generation_retries: usize,

    /// Row cap and statement timeout
    pub limits: ExecutionLimits,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            introspection: IntrospectionOptions::default(),
            schema_budget: DEFAULT_SCHEMA_BUDGET,
            max_generation_retries: 0,
            limits: ExecutionLimits { max_rows: None, timeout_ms: Some(DEFAULT_STATEMENT_TIMEOUT_MS) },
        }
    }
}

impl PipelineOptions {
    /// Retries actually allowed
    #[must_use]
    pub fn effective_retries(&self) -> usize {
        if self.max_generation_retries > MAX_GENERATION_RETRIES {
            tracing::warn!(
                requested = self.max_generation_retries,
                max = MAX_GENERATION_RETRIES,
                "max_generation_retries clamped"
            );
        }
        self.max_generation_retries.min(MAX_GENERATION_RETRIES)
    }
}

/// Successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    /// The validated query that was executed
    pub query: GeneratedQuery,

    /// Normalized rows
    pub result: ExecutionResult,

    /// Generation attempts used (1 + re-prompts)
    pub attempts: usize,
}

/// Introspected schema and its prompt rendering
#[derive(Debug, Clone)]
pub struct PreparedSchema {
    pub descriptor: SchemaDescriptor,
    pub rendered: String,
}

/// Tracks and logs state transitions for one run
struct Run<'a> {
    state: PipelineState,
    secrets: &'a [String],
}

impl<'a> Run<'a> {
    const fn new(secrets: &'a [String]) -> Self {
        Self { state: PipelineState::Idle, secrets }
    }

    fn enter(&mut self, stage: Stage) {
        self.transition(PipelineState::Running(stage));
    }

    fn finish(&mut self) {
        self.transition(PipelineState::Done);
    }

    fn transition(&mut self, next: PipelineState) {
        tracing::info!(from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    /// Move to `Failed` for the current stage
    fn fail(&mut self, err: &SqlaskError) -> PipelineFailure {
        let stage = match self.state {
            PipelineState::Running(stage) | PipelineState::Failed(stage) => stage,
            PipelineState::Idle | PipelineState::Done => Stage::Introspecting,
        };
        self.transition(PipelineState::Failed(stage));

        let secrets: Vec<&str> = self.secrets.iter().map(String::as_str).collect();
        let failure = PipelineFailure {
            stage,
            kind: err.error_code().to_string(),
            execution_kind: err.execution_kind(),
            message: mask_secrets(&err.message(), &secrets),
        };
        tracing::warn!(stage = %stage, kind = %failure.kind, "pipeline failed");
        failure
    }
}

/// Answers questions against one database
///
/// Holds only immutable configuration; every call opens its own scoped connections, so a
/// `Pipeline` can be shared between concurrent runs.
pub struct Pipeline<E, C> {
    engine: E,
    generator: SqlGenerator<C>,
    connection: ConnectionConfig,
    options: PipelineOptions,
    secrets: Vec<String>,
}

impl<E: DatabaseEngine, C: LlmClient> Pipeline<E, C> {
    /// Pipeline over an engine and an LLM client
    pub fn new(engine: E, client: C, connection: ConnectionConfig, options: PipelineOptions) -> Self {
        let secrets = connection.secrets().into_iter().map(str::to_string).collect();
        Self { engine, generator: SqlGenerator::new(client), connection, options, secrets }
    }

    /// Additional values to mask in failure messages (e.g. the LLM API key)
    #[must_use]
    pub fn with_secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.secrets.extend(secrets.into_iter().map(Into::into).filter(|s| !s.is_empty()));
        self
    }

    #[must_use]
    pub const fn options(&self) -> &PipelineOptions {
        &self.options
    }

    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }

    #[must_use]
    pub const fn client(&self) -> &C {
        self.generator.client()
    }

    /// Introspect and render the schema without asking anything
    pub async fn schema(&self) -> Result<PreparedSchema, PipelineFailure> {
        let mut run = Run::new(&self.secrets);
        let prepared = self.prepare(&mut run).await?;
        run.finish();
        Ok(prepared)
    }

    async fn prepare(&self, run: &mut Run<'_>) -> Result<PreparedSchema, PipelineFailure> {
        run.enter(Stage::Introspecting);
        let descriptor = self
            .engine
            .introspect(&self.connection, &self.options.introspection)
            .await
            .map_err(|e| run.fail(&e))?;
        tracing::debug!(
            tables = descriptor.tables.len(),
            omitted_tables = descriptor.omitted_tables,
            "schema introspected"
        );

        run.enter(Stage::Rendering);
        let rendered = render(&descriptor, self.options.schema_budget);
        tracing::debug!(chars = rendered.len(), budget = self.options.schema_budget, "schema rendered");

        Ok(PreparedSchema { descriptor, rendered })
    }

    /// Answer one question
    pub async fn ask(&self, question: &str) -> Result<Answer, PipelineFailure> {
        let mut run = Run::new(&self.secrets);

        let question = match validate_question(question) {
            Ok(question) => question,
            Err(err) => {
                run.enter(Stage::Generating);
                return Err(run.fail(&err));
            }
        };

        let prepared = self.prepare(&mut run).await?;

        run.enter(Stage::Generating);
        let retries = self.options.effective_retries();
        let mut previous_error: Option<String> = None;
        let mut attempts = 0;
        let query = loop {
            attempts += 1;
            let request = GenerationRequest {
                question,
                rendered_schema: &prepared.rendered,
                dialect: prepared.descriptor.dialect,
                previous_error: previous_error.as_deref(),
            };

            match self.generator.generate(&request).await {
                Ok(query) => break query,
                Err(err @ SqlaskError::GenerationFailed(_)) if attempts <= retries => {
                    tracing::warn!(attempt = attempts, retries, "generation failed, re-prompting");
                    previous_error = Some(err.message());
                }
                Err(err) => return Err(run.fail(&err)),
            }
        };

        run.enter(Stage::Validating);
        SqlValidator::new(&prepared.descriptor).validate(&query).map_err(|e| run.fail(&e))?;

        run.enter(Stage::Executing);
        let result = self
            .engine
            .execute(&self.connection, &query, &self.options.limits)
            .await
            .map_err(|e| run.fail(&e))?;
        tracing::debug!(
            rows = result.row_count,
            execution_ms = result.execution_ms,
            truncated = result.truncated,
            "query executed"
        );

        run.finish();
        Ok(Answer { query, result, attempts })
    }

    /// Answer independent questions, at most `concurrency` at a time
    ///
    /// Outcomes are returned in input order.
    pub async fn ask_many<Q: AsRef<str>>(
        &self,
        questions: &[Q],
        concurrency: usize,
    ) -> Vec<Result<Answer, PipelineFailure>> {
        let permits = Semaphore::new(concurrency.max(1));
        let permits = &permits;

        join_all(questions.iter().map(|question| async move {
            // Never closed, so acquire cannot fail
            let _permit = permits.acquire().await.ok();
            self.ask(question.as_ref()).await
        }))
        .await
    }
}

/// One-shot convenience: answer `question` with the engine picked from `connection`
pub async fn run_pipeline(
    question: &str,
    connection: &ConnectionConfig,
    llm: &LlmConfig,
    introspection: &IntrospectionOptions,
) -> Result<ExecutionResult, PipelineFailure> {
    let options = PipelineOptions { introspection: introspection.clone(), ..PipelineOptions::default() };
    let secrets: Vec<String> =
        connection.secrets().into_iter().chain(llm.secrets()).map(str::to_string).collect();

    let client = HttpLlmClient::new(llm.clone()).map_err(|e| {
        let mut run = Run::new(&secrets);
        run.enter(Stage::Generating);
        run.fail(&e)
    })?;

    let pipeline = Pipeline::new(AnyEngine, client, connection.clone(), options).with_secrets(secrets);
    pipeline.ask(question).await.map(|answer| answer.result)
}
