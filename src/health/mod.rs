//! Health Checks
//!
//! Backs `sqlask health`. Three checks run in order:
//! - `configuration`: the profile resolves to a connection and an `llm` section
//! - `database_connectivity`: a read-only `SELECT 1` succeeds within [`HEALTH_TIMEOUT_MS`]
//! - `llm_client`: an HTTP client can be built from the LLM settings (no request is sent)
//!
//! The report's status is the worst of its checks. A missing API key only degrades
//! health, since schema commands still work without one.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;

use crate::engine::{ConnectionConfig, DatabaseEngine, ExecutionLimits};
use crate::error::{mask_secrets, Result};
use crate::llm::{HttpLlmClient, LlmConfig};
use crate::query::GeneratedQuery;

/// Statement timeout for the connectivity query
pub const HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Outcome of a check, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One named check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub duration_ms: u64,
}

impl HealthCheck {
    fn new(name: &str, status: HealthStatus, message: impl Into<String>, started: Instant) -> Self {
        Self { name: name.to_string(), status, message: message.into(), duration_ms: elapsed_ms(started) }
    }
}

/// All checks plus the overall verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub duration_ms: u64,
    pub checks: Vec<HealthCheck>,
}

impl HealthReport {
    /// Report whose status is the worst of `checks` (healthy when empty)
    #[must_use]
    pub fn from_checks(checks: Vec<HealthCheck>, duration_ms: u64) -> Self {
        let status = checks.iter().map(|c| c.status).max().unwrap_or(HealthStatus::Healthy);
        Self { status, duration_ms, checks }
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Run every check against already-resolved settings
///
/// Resolution errors are reported as failed checks rather than returned.
pub async fn run_checks<E: DatabaseEngine>(
    engine: &E,
    connection: Result<ConnectionConfig>,
    llm: Result<LlmConfig>,
) -> HealthReport {
    let started = Instant::now();
    let mut secrets: Vec<String> = Vec::new();
    if let Ok(connection) = &connection {
        secrets.extend(connection.secrets().into_iter().map(str::to_string));
    }
    if let Ok(llm) = &llm {
        secrets.extend(llm.secrets().into_iter().map(str::to_string));
    }
    let secrets: Vec<&str> = secrets.iter().map(String::as_str).collect();

    let mut checks = vec![check_configuration(&connection, &llm, &secrets)];
    checks.push(match &connection {
        Ok(connection) => check_database(engine, connection, &secrets).await,
        Err(_) => HealthCheck::new(
            "database_connectivity",
            HealthStatus::Unhealthy,
            "Skipped: no usable connection settings",
            Instant::now(),
        ),
    });
    checks.push(check_llm(llm, &secrets));

    let report = HealthReport::from_checks(checks, elapsed_ms(started));
    tracing::info!(
        status = ?report.status,
        duration_ms = report.duration_ms,
        checks = report.checks.len(),
        "health checks completed"
    );
    report
}

fn check_configuration(
    connection: &Result<ConnectionConfig>,
    llm: &Result<LlmConfig>,
    secrets: &[&str],
) -> HealthCheck {
    let started = Instant::now();
    let issues: Vec<String> = [connection.as_ref().err(), llm.as_ref().err()]
        .into_iter()
        .flatten()
        .map(|err| mask_secrets(&err.message(), secrets))
        .collect();

    if issues.is_empty() {
        HealthCheck::new("configuration", HealthStatus::Healthy, "Configuration is complete", started)
    } else {
        HealthCheck::new("configuration", HealthStatus::Unhealthy, issues.join("; "), started)
    }
}

async fn check_database<E: DatabaseEngine>(
    engine: &E,
    connection: &ConnectionConfig,
    secrets: &[&str],
) -> HealthCheck {
    const NAME: &str = "database_connectivity";

    let started = Instant::now();
    let query = GeneratedQuery::unparameterized("SELECT 1");
    let limits = ExecutionLimits { max_rows: Some(1), timeout_ms: Some(HEALTH_TIMEOUT_MS) };

    match engine.execute(connection, &query, &limits).await {
        Ok(result) if result.rows.first().and_then(|row| row.first()) == Some(&json!(1)) => {
            HealthCheck::new(
                NAME,
                HealthStatus::Healthy,
                format!("{} database answered in {}ms", connection.engine, result.execution_ms),
                started,
            )
        }
        Ok(result) => {
            tracing::warn!(rows = result.row_count, "connectivity query returned an unexpected result");
            HealthCheck::new(NAME, HealthStatus::Unhealthy, "SELECT 1 returned an unexpected result", started)
        }
        Err(err) => {
            let message = mask_secrets(&err.message(), secrets);
            tracing::warn!(error = %message, "database connectivity check failed");
            HealthCheck::new(NAME, HealthStatus::Unhealthy, message, started)
        }
    }
}

fn check_llm(llm: Result<LlmConfig>, secrets: &[&str]) -> HealthCheck {
    const NAME: &str = "llm_client";

    let started = Instant::now();
    let Ok(config) = llm else {
        let message = "LLM not configured; questions cannot be answered";
        return HealthCheck::new(NAME, HealthStatus::Degraded, message, started);
    };

    let described = format!("{} model {}", config.provider, config.model);
    match HttpLlmClient::new(config) {
        Ok(_) => {
            HealthCheck::new(NAME, HealthStatus::Healthy, format!("{described} is configured"), started)
        }
        Err(err) => {
            HealthCheck::new(NAME, HealthStatus::Degraded, mask_secrets(&err.message(), secrets), started)
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionResult, IntrospectionOptions, SchemaDescriptor};
    use crate::error::SqlaskError;
    use crate::llm::LlmProvider;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    /// Engine whose `SELECT 1` yields a fixed outcome
    struct FixedEngine {
        outcome: fn() -> Result<ExecutionResult>,
    }

    impl DatabaseEngine for FixedEngine {
        async fn introspect(
            &self,
            _config: &ConnectionConfig,
            _options: &IntrospectionOptions,
        ) -> Result<SchemaDescriptor> {
            Err(SqlaskError::introspection_failed("sqlite", "not used"))
        }

        async fn execute(
            &self,
            _config: &ConnectionConfig,
            _query: &GeneratedQuery,
            _limits: &ExecutionLimits,
        ) -> Result<ExecutionResult> {
            (self.outcome)()
        }
    }

    fn one() -> Result<ExecutionResult> {
        ExecutionResult::new(vec!["1".to_string()], vec![vec![json!(1)]], Duration::from_millis(2), false)
    }

    fn connection() -> ConnectionConfig {
        let mut config = ConnectionConfig::sqlite("health.db".into());
        config.password = Some("db-secret-pw".to_string());
        config
    }

    fn llm() -> LlmConfig {
        LlmConfig::new(LlmProvider::OpenAi, "gpt-4o-mini", Some("sk-secret-123".to_string()))
    }

    fn check<'a>(report: &'a HealthReport, name: &str) -> &'a HealthCheck {
        report.checks.iter().find(|c| c.name == name).unwrap()
    }

    #[test]
    fn test_overall_status_is_worst_check() {
        let started = Instant::now();
        let healthy = HealthCheck::new("a", HealthStatus::Healthy, "", started);
        let degraded = HealthCheck::new("b", HealthStatus::Degraded, "", started);
        let unhealthy = HealthCheck::new("c", HealthStatus::Unhealthy, "", started);

        assert!(HealthReport::from_checks(vec![], 0).is_healthy());
        let report = HealthReport::from_checks(vec![healthy.clone(), degraded.clone()], 0);
        assert_eq!(report.status, HealthStatus::Degraded);
        let report = HealthReport::from_checks(vec![unhealthy, degraded, healthy], 0);
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_all_checks_healthy() {
        let report = run_checks(&FixedEngine { outcome: one }, Ok(connection()), Ok(llm())).await;

        assert!(report.is_healthy(), "{report:?}");
        let names: Vec<&str> = report.checks.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["configuration", "database_connectivity", "llm_client"]);
        assert!(check(&report, "llm_client").message.contains("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn test_database_failure_is_unhealthy_and_masked() {
        let engine = FixedEngine {
            outcome: || Err(SqlaskError::connection_failed("auth failed for password db-secret-pw")),
        };
        let report = run_checks(&engine, Ok(connection()), Ok(llm())).await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        let db = check(&report, "database_connectivity");
        assert_eq!(db.status, HealthStatus::Unhealthy);
        assert!(!db.message.contains("db-secret-pw"));
        assert!(db.message.contains("********"));
    }

    #[tokio::test]
    async fn test_unexpected_result_is_unhealthy() {
        let engine = FixedEngine {
            outcome: || ExecutionResult::new(vec!["x".to_string()], vec![], Duration::ZERO, false),
        };
        let report = run_checks(&engine, Ok(connection()), Ok(llm())).await;
        assert_eq!(check(&report, "database_connectivity").status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_missing_api_key_only_degrades() {
        let keyless = LlmConfig::new(LlmProvider::Anthropic, "claude", None);
        let report = run_checks(&FixedEngine { outcome: one }, Ok(connection()), Ok(keyless)).await;

        assert_eq!(report.status, HealthStatus::Degraded);
        let llm = check(&report, "llm_client");
        assert_eq!(llm.status, HealthStatus::Degraded);
        assert!(llm.message.contains("ANTHROPIC_API_KEY"));
    }

    #[tokio::test]
    async fn test_unresolved_settings_reported_as_checks() {
        let report = run_checks(
            &FixedEngine { outcome: one },
            Err(SqlaskError::config_error("No connection, url or DATABASE_URL in profile")),
            Err(SqlaskError::config_error("No 'llm' section in the selected profile")),
        )
        .await;

        assert_eq!(report.status, HealthStatus::Unhealthy);
        let config = check(&report, "configuration");
        assert!(config.message.contains("DATABASE_URL"));
        assert!(config.message.contains("'llm' section"));
        assert_eq!(check(&report, "database_connectivity").status, HealthStatus::Unhealthy);
        assert_eq!(check(&report, "llm_client").status, HealthStatus::Degraded);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["checks"][2]["status"], "degraded");
    }
}
