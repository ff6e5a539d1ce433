//! SQL generation from natural-language questions
//!
//! Builds the prompt from the rendered schema and the question, sends it through an
//! [`LlmClient`], and parses the reply strictly. A reply must contain exactly one
//! ```` ```sql ```` block and exactly one ```` ```json ```` block holding the parameter
//! object; anything else is a `GenerationFailed` error. There is no fallback parsing and
//! no retry here.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::engine::DatabaseType;
use crate::error::{Result, SqlaskError};
use crate::llm::LlmClient;
use crate::query::{is_scalar, GeneratedQuery};

/// Longest previous error message folded back into a retry prompt
const MAX_FEEDBACK_CHARS: usize = 500;

/// Inputs for one generation attempt
#[derive(Debug, Clone, Copy)]
pub struct GenerationRequest<'a> {
    /// The user's question
    pub question: &'a str,
    /// Schema text from the renderer
    pub rendered_schema: &'a str,
    /// Target SQL dialect
    pub dialect: DatabaseType,
    /// Error from the previous attempt, if re-prompting
    pub previous_error: Option<&'a str>,
}

/// Turns questions into [`GeneratedQuery`] values via an LLM
#[derive(Debug, Clone)]
pub struct SqlGenerator<C> {
    client: C,
}

impl<C: LlmClient> SqlGenerator<C> {
    /// Generator over an LLM client
    pub const fn new(client: C) -> Self {
        Self { client }
    }

    /// Underlying client
    pub const fn client(&self) -> &C {
        &self.client
    }

    /// Generate a parameterized query for a question
    pub async fn generate(&self, request: &GenerationRequest<'_>) -> Result<GeneratedQuery> {
        if request.question.trim().is_empty() {
            return Err(SqlaskError::invalid_input("Question cannot be empty"));
        }

        let prompt = build_prompt(request);
        tracing::debug!(
            prompt_chars = prompt.len(),
            retry = request.previous_error.is_some(),
            "requesting SQL from LLM"
        );

        let reply = self.client.complete(&prompt).await?;
        let query = parse_reply(&reply, request.dialect)?;

        tracing::debug!(
            sql_chars = query.sql.len(),
            parameters = query.parameters.len(),
            "parsed generated query"
        );
        Ok(query)
    }
}

/// Build the generation prompt
#[must_use]
pub fn build_prompt(request: &GenerationRequest<'_>) -> String {
    let dialect = request.dialect.dialect_name();
    let mut prompt = format!(
        "You are an expert {dialect} query writer. Write one read-only SQL query that answers the \
         question using the database schema below.\n\n\
         RULES:\n\
         1. Use only tables and columns that appear in the schema.\n\
         2. Never write user-supplied or filter values into the SQL. Use named placeholders of \
         the form :parameter_name for every such value.\n\
         3. Produce a single SELECT (or WITH ... SELECT) statement in {dialect} syntax. Never \
         modify data or schema.\n\
         4. Reply with exactly one ```sql fenced block containing the query, followed by exactly \
         one ```json fenced block containing a JSON object that maps each placeholder name \
         (without the colon) to its value. Use {{}} when there are no placeholders. Values must \
         be strings, numbers, booleans or null.\n\n\
         SCHEMA:\n{schema}\n\n\
         QUESTION: {question}\n",
        schema = request.rendered_schema.trim_end(),
        question = request.question.trim(),
    );

    if let Some(previous) = request.previous_error {
        let feedback: String = previous.chars().take(MAX_FEEDBACK_CHARS).collect();
        prompt.push_str(&format!(
            "\nYour previous reply was rejected: {feedback}\nFix the problem and reply again in \
             the required format.\n"
        ));
    }

    prompt
}

/// A fenced block in a reply
#[derive(Debug, PartialEq, Eq)]
struct FencedBlock {
    lang: String,
    body: String,
}

/// Split a reply into fenced blocks, failing on an unterminated fence
fn fenced_blocks(reply: &str) -> Result<Vec<FencedBlock>> {
    let mut blocks = Vec::new();
    let mut current: Option<FencedBlock> = None;

    for line in reply.lines() {
        let trimmed = line.trim();
        match current.as_mut() {
            Some(_) if trimmed == "```" => {
                if let Some(block) = current.take() {
                    blocks.push(block);
                }
            }
            Some(block) => {
                block.body.push_str(line);
                block.body.push('\n');
            }
            None => {
                if let Some(lang) = trimmed.strip_prefix("```") {
                    current = Some(FencedBlock {
                        lang: lang.trim().to_lowercase(),
                        body: String::new(),
                    });
                }
            }
        }
    }

    if current.is_some() {
        return Err(SqlaskError::generation_failed("LLM reply has an unterminated ``` block"));
    }
    Ok(blocks)
}

/// Parse an LLM reply into a [`GeneratedQuery`] for `dialect`
pub fn parse_reply(reply: &str, dialect: DatabaseType) -> Result<GeneratedQuery> {
    let blocks = fenced_blocks(reply)?;

    if let Some(other) = blocks.iter().find(|b| b.lang != "sql" && b.lang != "json") {
        let lang = if other.lang.is_empty() { "untagged" } else { other.lang.as_str() };
        return Err(SqlaskError::generation_failed(format!(
            "LLM reply contains an unexpected {lang} code block"
        )));
    }

    let sql_blocks: Vec<&FencedBlock> = blocks.iter().filter(|b| b.lang == "sql").collect();
    let json_blocks: Vec<&FencedBlock> = blocks.iter().filter(|b| b.lang == "json").collect();

    let sql = match sql_blocks.as_slice() {
        [only] => only.body.trim(),
        [] => return Err(SqlaskError::generation_failed("LLM reply has no ```sql block")),
        many => {
            return Err(SqlaskError::generation_failed(format!(
                "LLM reply has {} ```sql blocks, expected exactly one",
                many.len()
            )))
        }
    };

    let json_text = match json_blocks.as_slice() {
        [only] => only.body.trim(),
        [] => return Err(SqlaskError::generation_failed("LLM reply has no ```json block")),
        many => {
            return Err(SqlaskError::generation_failed(format!(
                "LLM reply has {} ```json blocks, expected exactly one",
                many.len()
            )))
        }
    };

    let parsed: Value = serde_json::from_str(json_text).map_err(|e| {
        SqlaskError::generation_failed(format!("Parameter block is not valid JSON: {e}"))
    })?;

    let Value::Object(object) = parsed else {
        return Err(SqlaskError::generation_failed("Parameter block must be a JSON object"));
    };

    if let Some((name, _)) = object.iter().find(|(_, v)| !is_scalar(v)) {
        return Err(SqlaskError::generation_failed(format!(
            "Parameter '{name}' must be a scalar value"
        )));
    }

    let parameters: BTreeMap<String, Value> = object.into_iter().collect();
    GeneratedQuery::for_dialect(sql, parameters, dialect)
}
