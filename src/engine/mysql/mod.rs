//! MySQL Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for MySQL databases (including MariaDB).
//!
//! # Features
//! - Client-server connections via TCP
//! - Schema introspection via information_schema
//! - Read-only execution with server-side prepared statements and bound `?` parameters
//!
//! # Implementation Notes
//! - Uses `mysql_async` (async driver, requires tokio runtime)
//! - The session is switched to `READ ONLY` transactions before the statement runs
//! - Timeouts enforced via tokio::time::timeout; the connection is dropped on expiry
//! - Every other exit path closes the connection with `COM_QUIT`
//! - DECIMAL columns are emitted as JSON numbers, JSON columns as nested JSON
//! - Binary data is Base64-encoded for JSON safety
//! - Row limits enforced while streaming, so oversized results are not read in full

use mysql_async::consts::ColumnType;
use mysql_async::{prelude::*, Conn, OptsBuilder, Params, Row, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::engine::{
    expect_engine, float_to_json, infer_relationships, ColumnInfo, ConnectionConfig,
    DatabaseEngine, DatabaseType, ExecutionLimits, ExecutionResult, ForeignKeyInfo, IndexInfo,
    IntrospectionOptions, SchemaDescriptor, TableDescriptor, TableSelector,
};
use crate::error::{mask_secrets, Result, SqlaskError};
use crate::query::GeneratedQuery;

const ENGINE: &str = "mysql";

/// Character set number MySQL reports for binary strings
const BINARY_CHARSET: u16 = 63;

/// MySQL database engine implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlEngine;

impl DatabaseEngine for MySqlEngine {
    async fn introspect(
        &self,
        config: &ConnectionConfig,
        options: &IntrospectionOptions,
    ) -> Result<SchemaDescriptor> {
        expect_engine(config, DatabaseType::MySQL)?;
        let mut conn = connect(config).await?;

        let introspected = introspect_schema(&mut conn, options).await;
        close(conn).await;
        introspected
    }

    async fn execute(
        &self,
        config: &ConnectionConfig,
        query: &GeneratedQuery,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        expect_engine(config, DatabaseType::MySQL)?;

        // Binding problems surface before any connection is opened
        let bound = query.bind(DatabaseType::MySQL)?;
        let values = bound.values.iter().map(json_to_mysql).collect::<Result<Vec<Value>>>()?;
        let params = if values.is_empty() { Params::Empty } else { Params::Positional(values) };

        let mut conn = connect(config).await?;
        if let Err(e) = conn.query_drop("SET SESSION TRANSACTION READ ONLY").await {
            close(conn).await;
            return Err(SqlaskError::execution_failed(format!(
                "Failed to prepare read-only session: {e}"
            )));
        }

        let start = Instant::now();
        let outcome = match limits.timeout_ms {
            Some(timeout_ms) => {
                let run = run_query(&mut conn, &bound.sql, params, limits.max_rows);
                match tokio::time::timeout(Duration::from_millis(timeout_ms), run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        // The statement is still in flight; dropping the socket ends it
                        tracing::warn!(engine = ENGINE, timeout_ms, "statement timed out");
                        return Err(SqlaskError::execution_timeout(timeout_ms));
                    }
                }
            }
            None => run_query(&mut conn, &bound.sql, params, limits.max_rows).await,
        };
        let elapsed = start.elapsed();

        match outcome {
            // Unread rows stay on the wire after truncation, and draining them
            // would defeat the row cap, so the socket is dropped instead
            Ok((columns, rows, true)) => {
                tracing::debug!(engine = ENGINE, "dropping connection with unread rows");
                drop(conn);
                ExecutionResult::new(columns, rows, elapsed, true)
            }
            Ok((columns, rows, false)) => {
                close(conn).await;
                ExecutionResult::new(columns, rows, elapsed, false)
            }
            Err(err) => {
                close(conn).await;
                Err(err)
            }
        }
    }
}

/// Read tables from the connection's current database
async fn introspect_schema(conn: &mut Conn, options: &IntrospectionOptions) -> Result<SchemaDescriptor> {
    let schema: String = conn
        .query_first::<Option<String>, _>("SELECT DATABASE()")
        .await
        .map_err(|e| introspection_error("current database", &e))?
        .flatten()
        .ok_or_else(|| SqlaskError::introspection_failed(ENGINE, "No database selected"))?;

    let table_names: Vec<String> = conn
        .exec(
            "SELECT table_name
             FROM information_schema.tables
             WHERE table_schema = ? AND table_type = 'BASE TABLE'
             ORDER BY table_name",
            (schema.as_str(),),
        )
        .await
        .map_err(|e| introspection_error("tables", &e))?;

    let sample_rows = options.effective_sample_rows();
    let mut selector = TableSelector::new(ENGINE, table_names, options)?;
    let mut tables = Vec::new();

    while let Some(table_name) = selector.next_table() {
        let table =
            introspect_table(conn, &schema, &table_name, options.include_indexes, sample_rows).await?;
        selector.record(&table);
        tables.push(table);
    }

    if options.infer_relationships {
        infer_relationships(&mut tables);
    }

    tracing::debug!(engine = ENGINE, schema = %schema, tables = tables.len(), "introspection complete");
    SchemaDescriptor::new(DatabaseType::MySQL, tables, selector.omitted())
}

/// Close a connection with `COM_QUIT`; a failure is logged, not returned
async fn close(conn: Conn) {
    if let Err(e) = conn.disconnect().await {
        tracing::warn!(engine = ENGINE, error = %e, "failed to disconnect cleanly");
    }
}

/// Build MySQL connection options from ConnectionConfig
fn build_mysql_opts(config: &ConnectionConfig) -> Result<OptsBuilder> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("MySQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("MySQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("MySQL requires 'database' parameter"))?;

    let opts = OptsBuilder::default()
        .ip_or_hostname(host)
        .tcp_port(config.port.unwrap_or(3306))
        .user(Some(user))
        .pass(config.password.as_ref())
        .db_name(Some(database));

    Ok(opts)
}

async fn connect(config: &ConnectionConfig) -> Result<Conn> {
    let opts = build_mysql_opts(config)?;
    let timeout = config.connect_timeout();

    tokio::time::timeout(timeout, Conn::new(opts))
        .await
        .map_err(|_| {
            SqlaskError::connection_failed(format!(
                "Timed out connecting to MySQL after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| {
            SqlaskError::connection_failed(mask_secrets(
                &format!("Failed to connect to MySQL: {e}"),
                &config.secrets(),
            ))
        })
}

fn introspection_error(what: &str, e: &mysql_async::Error) -> SqlaskError {
    SqlaskError::introspection_failed(ENGINE, format!("Failed to query {what}: {e}"))
}

async fn introspect_table(
    conn: &mut Conn,
    schema: &str,
    table_name: &str,
    include_indexes: bool,
    sample_rows: usize,
) -> Result<TableDescriptor> {
    let columns = introspect_columns(conn, schema, table_name).await?;
    let mut table = TableDescriptor::new(table_name, columns);
    table.schema = Some(schema.to_string());
    table.primary_key = introspect_primary_key(conn, schema, table_name).await?;
    table.foreign_keys = introspect_foreign_keys(conn, schema, table_name).await?;

    if include_indexes {
        table.indexes = introspect_indexes(conn, schema, table_name).await?;
    }

    if sample_rows > 0 {
        table.sample_rows = sample_table(conn, table_name, sample_rows).await?;
    }

    Ok(table)
}

/// Introspect table columns
async fn introspect_columns(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = "SELECT column_name, column_type, is_nullable, column_default
                 FROM information_schema.columns
                 WHERE table_schema = ? AND table_name = ?
                 ORDER BY ordinal_position";

    let rows: Vec<(String, String, String, Option<String>)> = conn
        .exec(query, (schema, table_name))
        .await
        .map_err(|e| introspection_error(&format!("columns for {schema}.{table_name}"), &e))?;

    let columns = rows
        .into_iter()
        .map(|(name, data_type, is_nullable, default)| ColumnInfo {
            name,
            data_type,
            nullable: is_nullable == "YES",
            default,
        })
        .collect();

    Ok(columns)
}

/// Introspect primary key
async fn introspect_primary_key(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<String>> {
    let query = "SELECT column_name
                 FROM information_schema.key_column_usage
                 WHERE table_schema = ?
                 AND table_name = ?
                 AND constraint_name = 'PRIMARY'
                 ORDER BY ordinal_position";

    conn.exec(query, (schema, table_name))
        .await
        .map_err(|e| introspection_error(&format!("primary key for {schema}.{table_name}"), &e))
}

/// Introspect foreign keys
async fn introspect_foreign_keys(
    conn: &mut Conn,
    schema: &str,
    table_name: &str,
) -> Result<Vec<ForeignKeyInfo>> {
    let query = "SELECT
                    kcu.constraint_name,
                    kcu.column_name,
                    kcu.referenced_table_name,
                    kcu.referenced_column_name
                 FROM information_schema.key_column_usage kcu
                 WHERE kcu.table_schema = ?
                 AND kcu.table_name = ?
                 AND kcu.referenced_table_name IS NOT NULL
                 ORDER BY kcu.constraint_name, kcu.ordinal_position";

    let rows: Vec<(String, String, String, String)> = conn
        .exec(query, (schema, table_name))
        .await
        .map_err(|e| introspection_error(&format!("foreign keys for {schema}.{table_name}"), &e))?;

    // Group by constraint name; BTreeMap keeps constraint order stable
    let mut grouped: BTreeMap<String, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
    for (constraint, column, referenced_table, referenced_column) in rows {
        let entry = grouped
            .entry(constraint)
            .or_insert_with(|| (referenced_table, Vec::new(), Vec::new()));
        entry.1.push(column);
        entry.2.push(referenced_column);
    }

    let foreign_keys = grouped
        .into_iter()
        .map(|(name, (referenced_table, columns, referenced_columns))| ForeignKeyInfo {
            name,
            columns,
            referenced_table,
            referenced_columns,
            resolved: false,
            inferred: false,
        })
        .collect();

    Ok(foreign_keys)
}

/// Introspect indexes with their columns in key order
async fn introspect_indexes(conn: &mut Conn, schema: &str, table_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "SELECT index_name, non_unique, column_name
                 FROM information_schema.statistics
                 WHERE table_schema = ? AND table_name = ?
                 AND index_name != 'PRIMARY'
                 ORDER BY index_name, seq_in_index";

    // Functional index parts have no column name
    let rows: Vec<(String, i64, Option<String>)> = conn
        .exec(query, (schema, table_name))
        .await
        .map_err(|e| introspection_error(&format!("indexes for {schema}.{table_name}"), &e))?;

    let mut indexes: Vec<IndexInfo> = Vec::new();
    for (index_name, non_unique, column) in rows {
        if indexes.last().map_or(true, |index| index.name != index_name) {
            indexes.push(IndexInfo { name: index_name, columns: Vec::new(), unique: non_unique == 0 });
        }
        if let (Some(index), Some(column)) = (indexes.last_mut(), column) {
            index.columns.push(column);
        }
    }

    Ok(indexes)
}

async fn sample_table(conn: &mut Conn, table_name: &str, limit: usize) -> Result<Vec<Vec<serde_json::Value>>> {
    let sql = format!("SELECT * FROM {} LIMIT ?", DatabaseType::MySQL.quote_ident(table_name));
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);

    let rows: Vec<Row> = conn
        .exec(sql, (limit,))
        .await
        .map_err(|e| introspection_error(&format!("sample rows for {table_name}"), &e))?;

    rows.iter()
        .map(row_to_json)
        .collect::<Result<_>>()
        .map_err(|e| SqlaskError::introspection_failed(ENGINE, e.message()))
}

/// Execute a prepared statement, streaming at most `max_rows` rows
#[allow(clippy::type_complexity)]
async fn run_query(
    conn: &mut Conn,
    sql: &str,
    params: Params,
    max_rows: Option<usize>,
) -> Result<(Vec<String>, Vec<Vec<serde_json::Value>>, bool)> {
    let mut result = conn
        .exec_iter(sql, params)
        .await
        .map_err(|e| SqlaskError::execution_failed(format!("MySQL error: {e}")))?;

    let columns: Vec<String> =
        result.columns_ref().iter().map(|col| col.name_str().to_string()).collect();

    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = result
        .next()
        .await
        .map_err(|e| SqlaskError::execution_failed(format!("MySQL error: {e}")))?
    {
        if max_rows.is_some_and(|max| rows.len() >= max) {
            truncated = true;
            break;
        }
        rows.push(row_to_json(&row)?);
    }

    Ok((columns, rows, truncated))
}

/// Convert a JSON parameter into a MySQL value
fn json_to_mysql(value: &serde_json::Value) -> Result<Value> {
    use serde_json::Value as Json;

    Ok(match value {
        Json::Null => Value::NULL,
        Json::Bool(b) => Value::Int(i64::from(*b)),
        Json::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(u)) => Value::UInt(u),
            _ => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::Bytes(s.clone().into_bytes()),
        Json::Array(_) | Json::Object(_) => {
            return Err(SqlaskError::binding_failed("Parameters must be scalar values"))
        }
    })
}

/// Convert a MySQL row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<serde_json::Value>> {
    (0..row.len()).map(|idx| mysql_value_to_json(row, idx)).collect()
}

/// Convert MySQL value to JSON value
fn mysql_value_to_json(row: &Row, idx: usize) -> Result<serde_json::Value> {
    use base64::Engine;

    let value = row.as_ref(idx).ok_or_else(|| {
        SqlaskError::execution_failed(format!("Failed to get value at index {idx}"))
    })?;
    let column = &row.columns_ref()[idx];

    let json_value = match value {
        Value::NULL => serde_json::Value::Null,

        Value::Bytes(bytes) => match column.column_type() {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => {
                decimal_to_json(&String::from_utf8_lossy(bytes))
            }
            ColumnType::MYSQL_TYPE_JSON => serde_json::from_slice(bytes).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(bytes).into_owned())
            }),
            _ => match std::str::from_utf8(bytes) {
                Ok(s) if column.character_set() != BINARY_CHARSET => {
                    serde_json::Value::String(s.to_string())
                }
                _ => serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(bytes)),
            },
        },

        Value::Int(i) => serde_json::Value::from(*i),

        Value::UInt(u) => serde_json::Value::from(*u),

        Value::Float(f) => float_to_json(f64::from(*f)),

        Value::Double(d) => float_to_json(*d),

        Value::Date(year, month, day, hour, minute, second, micro) => {
            let text = match column.column_type() {
                ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => {
                    format!("{year:04}-{month:02}-{day:02}")
                }
                _ if *micro == 0 => {
                    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}")
                }
                _ => format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
                ),
            };
            serde_json::Value::String(text)
        }

        Value::Time(is_negative, days, hours, minutes, seconds, microseconds) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            let text = if *microseconds == 0 {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}")
            } else {
                format!("{sign}{total_hours:02}:{minutes:02}:{seconds:02}.{microseconds:06}")
            };
            serde_json::Value::String(text)
        }
    };

    Ok(json_value)
}

/// DECIMAL text as a JSON number
fn decimal_to_json(text: &str) -> serde_json::Value {
    if let Ok(i) = text.parse::<i64>() {
        return serde_json::Value::from(i);
    }
    text.parse::<f64>()
        .map_or_else(|_| serde_json::Value::String(text.to_string()), float_to_json)
}
