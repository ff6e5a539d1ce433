//! sqlask CLI Entry Point
//!
//! Subcommands:
//! - `ask <question>` - answer a question with a validated, read-only query
//! - `schema` - introspect and render the schema the model would see
//! - `config` - print the resolved profile with secrets masked
//! - `health` - check configuration, database connectivity and the LLM client
//!
//! All output to stdout is JSON-only. Logs go to stderr.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use sqlask::config::{load_with_precedence, process_env, Profile};
use sqlask::error::mask_secrets;
use sqlask::health::run_checks;
use sqlask::{
    render, AnyEngine, DatabaseEngine, ErrorEnvelope, HealthStatus, HttpLlmClient, Metadata,
    Pipeline, PipelineOptions, SchemaDescriptor, SuccessEnvelope,
};

/// sqlask - ask a SQL database questions in plain language
#[derive(Parser)]
#[command(name = "sqlask")]
#[command(about = "Answer natural-language questions with validated, read-only SQL")]
#[command(version)]
struct Cli {
    /// Profile to use (defaults to the config's `default`)
    #[arg(long, global = true)]
    profile: Option<String>,

    /// Config file to use instead of the local/global files
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity on stderr (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question
    Ask {
        /// The question, in plain language
        question: String,

        /// Keep at most this many rows
        #[arg(long)]
        max_rows: Option<usize>,

        /// Statement timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Re-prompt the model this many times after an unusable reply
        #[arg(long)]
        retries: Option<usize>,
    },

    /// Introspect and render the schema
    Schema {
        /// Print only the rendered text in `data.rendered`
        #[arg(long)]
        rendered_only: bool,
    },

    /// Show the resolved configuration (secrets masked)
    Config,

    /// Check configuration, database connectivity and the LLM client
    Health,
}

impl Commands {
    const fn name(&self) -> &'static str {
        match self {
            Self::Ask { .. } => "ask",
            Self::Schema { .. } => "schema",
            Self::Config => "config",
            Self::Health => "health",
        }
    }
}

#[derive(Serialize)]
struct SchemaOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<SchemaDescriptor>,
    rendered: String,
}

#[derive(Serialize)]
struct ConfigOutput {
    profile: String,
    sources: Vec<PathBuf>,
    settings: Profile,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let command = cli.command.name();
    let (settings, sources) = match load_with_precedence(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(err) => return fail(&ErrorEnvelope::from_error("", command, &err)),
    };
    let (profile_name, profile) = match settings.profile(cli.profile.as_deref()) {
        Ok(selected) => selected,
        Err(err) => return fail(&ErrorEnvelope::from_error("", command, &err)),
    };
    tracing::info!(profile = %profile_name, sources = sources.len(), "profile selected");

    match cli.command {
        Commands::Ask { question, max_rows, timeout_ms, retries } => {
            let mut options = profile.pipeline_options();
            if max_rows.is_some() {
                options.limits.max_rows = max_rows;
            }
            if timeout_ms.is_some() {
                options.limits.timeout_ms = timeout_ms;
            }
            if let Some(retries) = retries {
                options.max_generation_retries = retries;
            }
            ask(&profile, &question, options).await
        }
        Commands::Schema { rendered_only } => schema(&profile, rendered_only).await,
        Commands::Config => {
            let output = ConfigOutput { profile: profile_name, sources, settings: profile.masked() };
            emit(&SuccessEnvelope::new("", command, output, Metadata::new(0)))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Health => health(&profile).await,
    }
}

async fn ask(profile: &Profile, question: &str, options: PipelineOptions) -> Result<ExitCode> {
    let connection = match profile.resolve_connection(&process_env) {
        Ok(connection) => connection,
        Err(err) => return fail(&ErrorEnvelope::from_error("", "ask", &err)),
    };
    let engine = connection.engine.as_str();

    let llm = match profile.resolve_llm(&process_env) {
        Ok(llm) => llm,
        Err(err) => return fail(&ErrorEnvelope::from_error(engine, "ask", &err)),
    };
    let llm_secrets: Vec<String> = llm.secrets().into_iter().map(str::to_string).collect();
    let client = match HttpLlmClient::new(llm) {
        Ok(client) => client,
        Err(err) => return fail(&ErrorEnvelope::from_error(engine, "ask", &err)),
    };

    let pipeline = Pipeline::new(AnyEngine, client, connection, options).with_secrets(llm_secrets);
    match pipeline.ask(question).await {
        Ok(answer) => {
            let meta = Metadata::for_result(&answer.result).with_token_usage(pipeline.client().usage());
            emit(&SuccessEnvelope::new(engine, "ask", answer, meta))?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => fail(&ErrorEnvelope::from_failure(engine, "ask", &failure)),
    }
}

async fn schema(profile: &Profile, rendered_only: bool) -> Result<ExitCode> {
    let connection = match profile.resolve_connection(&process_env) {
        Ok(connection) => connection,
        Err(err) => return fail(&ErrorEnvelope::from_error("", "schema", &err)),
    };
    let engine = connection.engine.as_str();
    let options = profile.pipeline_options();

    let start = Instant::now();
    let descriptor = match AnyEngine.introspect(&connection, &options.introspection).await {
        Ok(descriptor) => descriptor,
        Err(err) => {
            let mut envelope = ErrorEnvelope::from_error(engine, "schema", &err);
            envelope.error.message = mask_secrets(&envelope.error.message, &connection.secrets());
            return fail(&envelope);
        }
    };
    let rendered = render(&descriptor, options.schema_budget);
    let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let output = SchemaOutput { schema: (!rendered_only).then_some(descriptor), rendered };
    emit(&SuccessEnvelope::new(engine, "schema", output, Metadata::new(elapsed)))?;
    Ok(ExitCode::SUCCESS)
}

/// Exits non-zero only when a check is unhealthy
async fn health(profile: &Profile) -> Result<ExitCode> {
    let connection = profile.resolve_connection(&process_env);
    let engine = connection.as_ref().map_or("", |c| c.engine.as_str());
    let llm = profile.resolve_llm(&process_env);

    let report = run_checks(&AnyEngine, connection, llm).await;
    let meta = Metadata::new(report.duration_ms);
    let code = if report.status == HealthStatus::Unhealthy { ExitCode::FAILURE } else { ExitCode::SUCCESS };
    emit(&SuccessEnvelope::new(engine, "health", report, meta))?;
    Ok(code)
}

fn emit<T: Serialize>(envelope: &T) -> Result<()> {
    let json = serde_json::to_string(envelope).context("Failed to serialize output envelope")?;
    println!("{json}");
    Ok(())
}

fn fail(envelope: &ErrorEnvelope) -> Result<ExitCode> {
    emit(envelope)?;
    Ok(ExitCode::FAILURE)
}
