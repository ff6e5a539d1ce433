//! LLM provider boundary
//!
//! The generator only needs "prompt in, text out". [`LlmClient`] is that seam;
//! [`HttpLlmClient`] implements it over HTTP for OpenAI-compatible, Anthropic and Gemini
//! APIs. Replies are untrusted text and are parsed strictly by the generator.
//!
//! Connection failures, timeouts, `429` and `5xx` replies are retried with capped exponential
//! backoff. Token counts reported by the provider are accumulated per client.

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::hash_map::RandomState;
use std::fmt;
use std::future::Future;
use std::hash::BuildHasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{mask_secrets, Result, SqlaskError, MASK};

/// Longest provider error body echoed back in an error message
const MAX_ERROR_BODY_CHARS: usize = 300;

/// Supported LLM providers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    /// `OpenAI` chat completions (and compatible servers)
    OpenAi,
    /// Anthropic messages API
    Anthropic,
    /// Google Gemini `generateContent`
    Gemini,
}

impl LlmProvider {
    /// Provider name as used in config files
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
        }
    }

    /// Environment variable conventionally holding this provider's key
    #[must_use]
    pub const fn key_env_var(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Gemini => "GEMINI_API_KEY",
        }
    }

    const fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Gemini => "https://generativelanguage.googleapis.com",
        }
    }
}

impl fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// LLM call configuration
///
/// `Debug` masks the API key.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider API flavour
    pub provider: LlmProvider,

    /// Model name
    pub model: String,

    /// API key
    /// WARNING: Sensitive data, never log or include in error messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Override of the provider's base URL (e.g. a local OpenAI-compatible server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Sampling temperature
    #[serde(default)]
    pub temperature: f32,

    /// Request timeout in milliseconds
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum tokens in the reply
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Attempts per call including the first; only transient failures are retried
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry, doubled for each further one
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Ceiling on a single retry delay
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

const fn default_llm_timeout_ms() -> u64 {
    30_000
}

const fn default_max_tokens() -> u32 {
    1024
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_retry_base_delay_ms() -> u64 {
    1000
}

const fn default_retry_max_delay_ms() -> u64 {
    30_000
}

impl LlmConfig {
    /// Config with default temperature, timeout and token limit
    #[must_use]
    pub fn new(provider: LlmProvider, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            api_key,
            base_url: None,
            temperature: 0.0,
            timeout_ms: default_llm_timeout_ms(),
            max_tokens: default_max_tokens(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }

    /// Backoff before retry number `retry` (1-based), scaled by `jitter`
    fn retry_delay(&self, retry: u32, jitter: f64) -> Duration {
        let factor = 1_u64.checked_shl(retry.saturating_sub(1)).unwrap_or(u64::MAX);
        let delay = self.retry_base_delay_ms.saturating_mul(factor).min(self.retry_max_delay_ms);
        Duration::from_millis(delay).mul_f64(jitter.clamp(0.0, 1.0))
    }

    /// Copy with the API key replaced by a mask
    #[must_use]
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        if masked.api_key.is_some() {
            masked.api_key = Some(MASK.to_string());
        }
        masked
    }

    /// Secret values that must never appear in output
    #[must_use]
    pub fn secrets(&self) -> Vec<&str> {
        self.api_key.as_deref().into_iter().collect()
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| MASK))
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("retry_base_delay_ms", &self.retry_base_delay_ms)
            .field("retry_max_delay_ms", &self.retry_max_delay_ms)
            .finish()
    }
}

/// Text completion seam used by the SQL generator
pub trait LlmClient: Send + Sync {
    /// Send a prompt and return the raw reply text
    fn complete(&self, prompt: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Tokens reported by the provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Successful calls counted
    pub requests: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Usage of a single call; a missing total is the sum of its parts
    #[must_use]
    pub const fn single(prompt_tokens: u64, completion_tokens: u64, total_tokens: Option<u64>) -> Self {
        let total_tokens = match total_tokens {
            Some(total) => total,
            None => prompt_tokens.saturating_add(completion_tokens),
        };
        Self { requests: 1, prompt_tokens, completion_tokens, total_tokens }
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.requests == 0
    }
}

/// Running totals shared by concurrent calls
#[derive(Debug, Default)]
struct UsageCounter {
    requests: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
}

impl UsageCounter {
    fn record(&self, usage: &TokenUsage) {
        self.requests.fetch_add(usage.requests, Ordering::Relaxed);
        self.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        self.completion_tokens.fetch_add(usage.completion_tokens, Ordering::Relaxed);
        self.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TokenUsage {
        TokenUsage {
            requests: self.requests.load(Ordering::Relaxed),
            prompt_tokens: self.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: self.completion_tokens.load(Ordering::Relaxed),
            total_tokens: self.total_tokens.load(Ordering::Relaxed),
        }
    }
}

/// Reply text plus whatever usage the provider reported
#[derive(Debug)]
struct Reply {
    text: String,
    usage: Option<TokenUsage>,
}

/// Failure of one HTTP attempt
enum CallError {
    /// Worth retrying (connect failure, timeout, 429, 5xx)
    Transient(SqlaskError),
    Fatal(SqlaskError),
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Multiplier in `[0.5, 1.0]` spreading out simultaneous retries
fn jitter_factor(retry: u32) -> f64 {
    let spread = RandomState::new().hash_one(retry) % 501;
    0.5 + spread as f64 / 1000.0
}

/// OpenAI chat completion response
#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Anthropic messages response
#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    #[serde(default)]
    text: Option<String>,
}

/// Gemini `generateContent` response
#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiContent,
}

#[derive(Debug, Deserialize)]
struct GeminiContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
}

/// HTTP client for the supported providers
pub struct HttpLlmClient {
    config: LlmConfig,
    client: Client,
    usage: UsageCounter,
}

impl HttpLlmClient {
    /// Build a client; a key is required unless a custom base URL is configured
    pub fn new(config: LlmConfig) -> Result<Self> {
        if config.api_key.as_deref().map_or(true, str::is_empty) && config.base_url.is_none() {
            return Err(SqlaskError::config_error(format!(
                "No API key configured for provider '{}' (set {} or api_key_env)",
                config.provider,
                config.provider.key_env_var()
            )));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| SqlaskError::config_error(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self { config, client, usage: UsageCounter::default() })
    }

    /// Tokens used by every successful call so far
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        self.usage.snapshot()
    }

    /// Endpoint URL for the configured provider
    fn request_url(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or_else(|| self.config.provider.default_base_url())
            .trim_end_matches('/');

        match self.config.provider {
            LlmProvider::OpenAi => format!("{base}/v1/chat/completions"),
            LlmProvider::Anthropic => format!("{base}/v1/messages"),
            LlmProvider::Gemini => {
                format!("{base}/v1beta/models/{}:generateContent", self.config.model)
            }
        }
    }

    /// JSON request body for the configured provider
    fn request_body(&self, prompt: &str) -> serde_json::Value {
        let config = &self.config;
        match config.provider {
            LlmProvider::OpenAi => json!({
                "model": config.model,
                "messages": [{"role": "user", "content": prompt}],
                "temperature": config.temperature,
                "max_tokens": config.max_tokens,
            }),
            LlmProvider::Anthropic => json!({
                "model": config.model,
                "max_tokens": config.max_tokens,
                "temperature": config.temperature,
                "messages": [{"role": "user", "content": prompt}],
            }),
            LlmProvider::Gemini => json!({
                "contents": [{"parts": [{"text": prompt}]}],
                "generationConfig": {
                    "temperature": config.temperature,
                    "maxOutputTokens": config.max_tokens,
                },
            }),
        }
    }

    /// Mask credentials and clip provider text before it goes into an error
    fn sanitize(&self, text: &str) -> String {
        mask_secrets(text, &self.config.secrets()).chars().take(MAX_ERROR_BODY_CHARS).collect()
    }
}

impl HttpLlmClient {
    /// One HTTP round trip, classified for the retry loop
    async fn send(&self, prompt: &str) -> std::result::Result<Reply, CallError> {
        let provider = self.config.provider;
        let mut request = self.client.post(self.request_url()).json(&self.request_body(prompt));

        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            request = match provider {
                LlmProvider::OpenAi => request.bearer_auth(key),
                LlmProvider::Anthropic => {
                    request.header("x-api-key", key).header("anthropic-version", "2023-06-01")
                }
                LlmProvider::Gemini => request.header("x-goog-api-key", key),
            };
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CallError::Transient(SqlaskError::generation_failed(format!(
                    "LLM request timed out after {}ms",
                    self.config.timeout_ms
                )))
            } else {
                let err = SqlaskError::generation_failed(format!(
                    "{provider} API request failed: {}",
                    self.sanitize(&e.to_string())
                ));
                if e.is_connect() {
                    CallError::Transient(err)
                } else {
                    CallError::Fatal(err)
                }
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            CallError::Transient(SqlaskError::generation_failed(format!(
                "Failed to read {provider} response: {}",
                self.sanitize(&e.to_string())
            )))
        })?;

        if !status.is_success() {
            let err = SqlaskError::generation_failed(format!(
                "{provider} API error {status}: {}",
                self.sanitize(&body)
            ));
            return Err(if is_retryable_status(status) {
                CallError::Transient(err)
            } else {
                CallError::Fatal(err)
            });
        }

        extract_reply(provider, &body).map_err(CallError::Fatal)
    }
}

impl LlmClient for HttpLlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        let provider = self.config.provider;
        let max_attempts = self.config.max_attempts.max(1);
        tracing::debug!(%provider, model = %self.config.model, prompt_chars = prompt.len(), "sending LLM request");

        let mut attempt = 1;
        let reply = loop {
            match self.send(prompt).await {
                Ok(reply) => break reply,
                Err(CallError::Transient(err)) if attempt < max_attempts => {
                    let delay = self.config.retry_delay(attempt, jitter_factor(attempt));
                    tracing::warn!(
                        %provider,
                        attempt,
                        max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transient LLM failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(CallError::Transient(err) | CallError::Fatal(err)) => return Err(err),
            }
        };

        if let Some(usage) = &reply.usage {
            self.usage.record(usage);
            tracing::info!(
                %provider,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                "LLM token usage"
            );
        }
        tracing::debug!(%provider, attempts = attempt, reply_chars = reply.text.len(), "received LLM reply");
        Ok(reply.text)
    }
}

/// Pull the reply text and token usage out of a provider response body
fn extract_reply(provider: LlmProvider, body: &str) -> Result<Reply> {
    let parse_error =
        |e: serde_json::Error| SqlaskError::generation_failed(format!("Failed to parse {provider} response: {e}"));

    let (text, usage) = match provider {
        LlmProvider::OpenAi => {
            let parsed: OpenAiResponse = serde_json::from_str(body).map_err(parse_error)?;
            let usage = parsed
                .usage
                .map(|u| TokenUsage::single(u.prompt_tokens, u.completion_tokens, u.total_tokens));
            (parsed.choices.into_iter().next().and_then(|c| c.message.content), usage)
        }
        LlmProvider::Anthropic => {
            let parsed: AnthropicResponse = serde_json::from_str(body).map_err(parse_error)?;
            let usage = parsed.usage.map(|u| TokenUsage::single(u.input_tokens, u.output_tokens, None));
            let joined: String = parsed.content.into_iter().filter_map(|c| c.text).collect();
            (Some(joined), usage)
        }
        LlmProvider::Gemini => {
            let parsed: GeminiResponse = serde_json::from_str(body).map_err(parse_error)?;
            let usage = parsed.usage_metadata.map(|u| {
                TokenUsage::single(u.prompt_token_count, u.candidates_token_count, u.total_token_count)
            });
            let text = parsed
                .candidates
                .into_iter()
                .next()
                .map(|c| c.content.parts.into_iter().filter_map(|p| p.text).collect());
            (text, usage)
        }
    };

    let text = text
        .filter(|t: &String| !t.trim().is_empty())
        .ok_or_else(|| SqlaskError::generation_failed(format!("Empty reply from {provider}")))?;
    Ok(Reply { text, usage })
}
