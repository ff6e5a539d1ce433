//! `SQLite` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `SQLite` databases.
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - Schema introspection via the `pragma_*` table-valued functions
//! - Read-only execution with bound positional parameters
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver) on the blocking thread pool
//! - Connections are always opened with `SQLITE_OPEN_READ_ONLY`
//! - Statement timeouts and abandoned futures interrupt the running statement via its
//!   interrupt handle
//! - BLOB data is Base64-encoded for JSON safety
//! - Row limits enforced in application code
//! - No explicit schema support (`SQLite` uses catalogs)

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, InterruptHandle, OpenFlags, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::{JoinError, JoinHandle};

use crate::engine::{
    expect_engine, float_to_json, infer_relationships, ColumnInfo, ConnectionConfig,
    DatabaseEngine, DatabaseType, ExecutionLimits, ExecutionResult, ForeignKeyInfo, IndexInfo,
    IntrospectionOptions, SchemaDescriptor, TableDescriptor, TableSelector,
};
use crate::error::{Result, SqlaskError};
use crate::query::{BoundQuery, GeneratedQuery};

const ENGINE: &str = "sqlite";

/// Interval between interrupt attempts once a statement has timed out
const INTERRUPT_RETRY: Duration = Duration::from_millis(10);

/// `SQLite` database engine implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteEngine;

impl DatabaseEngine for SqliteEngine {
    async fn introspect(
        &self,
        config: &ConnectionConfig,
        options: &IntrospectionOptions,
    ) -> Result<SchemaDescriptor> {
        expect_engine(config, DatabaseType::SQLite)?;
        let path = database_path(config)?;
        let busy_timeout = config.connect_timeout();
        let options = options.clone();

        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path, busy_timeout)?;
            introspect_schema(&conn, &options)
        })
        .await
        .map_err(|e| SqlaskError::introspection_failed(ENGINE, format!("Worker task failed: {e}")))?
    }

    async fn execute(
        &self,
        config: &ConnectionConfig,
        query: &GeneratedQuery,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        expect_engine(config, DatabaseType::SQLite)?;

        // Binding problems surface before any connection is opened
        let bound = query.bind(DatabaseType::SQLite)?;
        let path = database_path(config)?;
        let busy_timeout = config.connect_timeout();
        let max_rows = limits.max_rows;

        let start = Instant::now();
        let mut worker = QueryWorker::spawn(path, busy_timeout, bound, max_rows);

        let Some(joined) = worker.join(limits.timeout_ms.map(Duration::from_millis)).await else {
            worker.cancel().await;
            let timeout_ms = limits.timeout_ms.unwrap_or_default();
            tracing::warn!(engine = ENGINE, timeout_ms, "statement timed out");
            return Err(SqlaskError::execution_timeout(timeout_ms));
        };

        let outcome = joined
            .map_err(|e| SqlaskError::execution_failed(format!("SQLite worker task failed: {e}")))?;
        let (columns, rows, truncated) = outcome.map_err(|e| match e {
            QueryError::Interrupted => {
                SqlaskError::execution_timeout(limits.timeout_ms.unwrap_or_default())
            }
            QueryError::Failed(err) => err,
        })?;

        ExecutionResult::new(columns, rows, start.elapsed(), truncated)
    }
}

type QueryOutput = std::result::Result<(Vec<String>, Vec<Vec<serde_json::Value>>, bool), QueryError>;

/// A query running on the blocking pool
///
/// Dropping it before the worker finishes (caller timeout, `select!`, a cancelled batch)
/// interrupts the statement in the background so the connection and its read lock are
/// released.
struct QueryWorker {
    task: Option<JoinHandle<QueryOutput>>,
    interrupt: Option<oneshot::Receiver<InterruptHandle>>,
}

impl QueryWorker {
    fn spawn(path: PathBuf, busy_timeout: Duration, bound: BoundQuery, max_rows: Option<usize>) -> Self {
        let (handle_tx, handle_rx) = oneshot::channel();
        let task = tokio::task::spawn_blocking(move || {
            let conn = open_connection(&path, busy_timeout)?;
            let _ = handle_tx.send(conn.get_interrupt_handle());
            run_query(&conn, &bound, max_rows)
        });
        Self { task: Some(task), interrupt: Some(handle_rx) }
    }

    /// Wait for the worker, or `None` once `limit` elapses
    async fn join(&mut self, limit: Option<Duration>) -> Option<std::result::Result<QueryOutput, JoinError>> {
        let task = self.task.as_mut()?;
        let joined = match limit {
            None => task.await,
            Some(limit) => tokio::time::timeout(limit, task).await.ok()?,
        };
        self.task = None;
        Some(joined)
    }

    /// Interrupt the statement and wait for the worker to exit
    async fn cancel(&mut self) {
        if let (Some(task), Some(interrupt)) = (self.task.take(), self.interrupt.take()) {
            interrupt_until_done(task, interrupt).await;
        }
    }
}

impl Drop for QueryWorker {
    fn drop(&mut self) {
        let (Some(task), Some(interrupt)) = (self.task.take(), self.interrupt.take()) else {
            return;
        };
        if task.is_finished() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::debug!(engine = ENGINE, "query abandoned, interrupting statement");
                runtime.spawn(interrupt_until_done(task, interrupt));
            }
            Err(_) => tracing::warn!(engine = ENGINE, "query abandoned outside a runtime"),
        }
    }
}

async fn interrupt_until_done(
    mut task: JoinHandle<QueryOutput>,
    interrupt: oneshot::Receiver<InterruptHandle>,
) {
    // The statement may not have started yet, so keep interrupting until the worker gives up
    let handle = interrupt.await.ok();
    loop {
        if let Some(handle) = &handle {
            handle.interrupt();
        }
        if tokio::time::timeout(INTERRUPT_RETRY, &mut task).await.is_ok() {
            break;
        }
    }
}

/// Failure inside the blocking query worker
#[derive(Debug)]
enum QueryError {
    Interrupted,
    Failed(SqlaskError),
}

impl From<SqlaskError> for QueryError {
    fn from(err: SqlaskError) -> Self {
        Self::Failed(err)
    }
}

fn database_path(config: &ConnectionConfig) -> Result<PathBuf> {
    config
        .file
        .clone()
        .ok_or_else(|| SqlaskError::invalid_input("SQLite requires 'file' parameter"))
}

/// Open a read-only `SQLite` connection
fn open_connection(path: &Path, busy_timeout: Duration) -> Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;

    let conn = Connection::open_with_flags(path, flags).map_err(|e| {
        SqlaskError::connection_failed(format!(
            "Failed to open SQLite database '{}': {e}",
            path.display()
        ))
    })?;

    conn.busy_timeout(busy_timeout)
        .map_err(|e| SqlaskError::connection_failed(format!("Failed to set busy timeout: {e}")))?;

    Ok(conn)
}

fn introspect_schema(conn: &Connection, options: &IntrospectionOptions) -> Result<SchemaDescriptor> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master
             WHERE type = 'table'
             AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
        )
        .map_err(|e| SqlaskError::introspection_failed(ENGINE, format!("Failed to query tables: {e}")))?;

    let table_names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .and_then(Iterator::collect)
        .map_err(|e| {
            SqlaskError::introspection_failed(ENGINE, format!("Failed to fetch table names: {e}"))
        })?;

    let sample_rows = options.effective_sample_rows();
    let mut selector = TableSelector::new(ENGINE, table_names, options)?;
    let mut tables = Vec::new();

    while let Some(table_name) = selector.next_table() {
        let table = introspect_table(conn, &table_name, options.include_indexes, sample_rows)?;
        selector.record(&table);
        tables.push(table);
    }

    if options.infer_relationships {
        infer_relationships(&mut tables);
    }

    tracing::debug!(engine = ENGINE, tables = tables.len(), "introspection complete");
    SchemaDescriptor::new(DatabaseType::SQLite, tables, selector.omitted())
}

fn metadata_error(table: &str, what: &str, e: &rusqlite::Error) -> SqlaskError {
    SqlaskError::introspection_failed(ENGINE, format!("Failed to read {what} for {table}: {e}"))
}

/// Introspect a single table
fn introspect_table(
    conn: &Connection,
    table_name: &str,
    include_indexes: bool,
    sample_rows: usize,
) -> Result<TableDescriptor> {
    // Columns and primary key via pragma_table_info
    let mut stmt = conn
        .prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk
             FROM pragma_table_info(?1)
             ORDER BY cid",
        )
        .map_err(|e| metadata_error(table_name, "columns", &e))?;

    let rows: Vec<(ColumnInfo, i64)> = stmt
        .query_map([table_name], |row| {
            let column = ColumnInfo {
                name: row.get(0)?,
                data_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                nullable: row.get::<_, i64>(2)? == 0, // notnull: 0 = nullable
                default: row.get(3)?,
            };
            Ok((column, row.get::<_, i64>(4)?))
        })
        .and_then(Iterator::collect)
        .map_err(|e| metadata_error(table_name, "columns", &e))?;

    let mut pk_columns: Vec<(i64, String)> = rows
        .iter()
        .filter(|(_, pk)| *pk > 0)
        .map(|(column, pk)| (*pk, column.name.clone()))
        .collect();
    pk_columns.sort();
    let primary_key = pk_columns.into_iter().map(|(_, name)| name).collect();
    let columns = rows.into_iter().map(|(column, _)| column).collect();

    let mut table = TableDescriptor::new(table_name, columns);
    table.primary_key = primary_key;
    table.foreign_keys = introspect_foreign_keys(conn, table_name)?;

    if include_indexes {
        table.indexes = introspect_indexes(conn, table_name)?;
    }

    if sample_rows > 0 {
        table.sample_rows = sample_table(conn, table_name, sample_rows)?;
    }

    Ok(table)
}

fn introspect_foreign_keys(conn: &Connection, table_name: &str) -> Result<Vec<ForeignKeyInfo>> {
    let mut stmt = conn
        .prepare(
            "SELECT id, \"table\", \"from\", \"to\"
             FROM pragma_foreign_key_list(?1)
             ORDER BY id, seq",
        )
        .map_err(|e| metadata_error(table_name, "foreign keys", &e))?;

    let rows: Vec<(i64, String, String, Option<String>)> = stmt
        .query_map([table_name], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
        .and_then(Iterator::collect)
        .map_err(|e| metadata_error(table_name, "foreign keys", &e))?;

    // Group by constraint id; BTreeMap keeps constraint order stable
    let mut grouped: BTreeMap<i64, (String, Vec<String>, Vec<Option<String>>)> = BTreeMap::new();
    for (id, ref_table, from_col, to_col) in rows {
        let entry = grouped.entry(id).or_insert_with(|| (ref_table, Vec::new(), Vec::new()));
        entry.1.push(from_col);
        entry.2.push(to_col);
    }

    let mut foreign_keys = Vec::with_capacity(grouped.len());
    for (id, (ref_table, from_cols, to_cols)) in grouped {
        // A missing "to" column means the referenced table's primary key
        let referenced_columns = if to_cols.iter().all(Option::is_some) {
            to_cols.into_iter().flatten().collect()
        } else {
            primary_key_of(conn, &ref_table)?
        };

        foreign_keys.push(ForeignKeyInfo {
            name: format!("fk_{table_name}_{id}"),
            columns: from_cols,
            referenced_table: ref_table,
            referenced_columns,
            resolved: false,
            inferred: false,
        });
    }

    Ok(foreign_keys)
}

fn primary_key_of(conn: &Connection, table_name: &str) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
        .map_err(|e| metadata_error(table_name, "primary key", &e))?;

    let columns = stmt
        .query_map([table_name], |row| row.get(0))
        .and_then(Iterator::collect)
        .map_err(|e| metadata_error(table_name, "primary key", &e))?;
    Ok(columns)
}

fn introspect_indexes(conn: &Connection, table_name: &str) -> Result<Vec<IndexInfo>> {
    let mut stmt = conn
        .prepare("SELECT name, \"unique\" FROM pragma_index_list(?1) ORDER BY name")
        .map_err(|e| metadata_error(table_name, "indexes", &e))?;

    let index_list: Vec<(String, bool)> = stmt
        .query_map([table_name], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? != 0)))
        .and_then(Iterator::collect)
        .map_err(|e| metadata_error(table_name, "indexes", &e))?;

    let mut info_stmt = conn
        .prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")
        .map_err(|e| metadata_error(table_name, "index columns", &e))?;

    let mut indexes = Vec::new();
    for (index_name, unique) in index_list {
        // Skip auto-created indexes for primary keys and UNIQUE constraints
        if index_name.starts_with("sqlite_autoindex_") {
            continue;
        }

        // Expression index entries have no column name
        let columns: Vec<Option<String>> = info_stmt
            .query_map([&index_name], |row| row.get(0))
            .and_then(Iterator::collect)
            .map_err(|e| metadata_error(table_name, "index columns", &e))?;

        indexes.push(IndexInfo {
            name: index_name,
            columns: columns.into_iter().flatten().collect(),
            unique,
        });
    }

    Ok(indexes)
}

fn sample_table(conn: &Connection, table_name: &str, limit: usize) -> Result<Vec<Vec<serde_json::Value>>> {
    let sql = format!("SELECT * FROM {} LIMIT ?1", DatabaseType::SQLite.quote_ident(table_name));
    let mut stmt = conn.prepare(&sql).map_err(|e| metadata_error(table_name, "sample rows", &e))?;
    let width = stmt.column_count();
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let rows = stmt
        .query_map([limit], |row| row_to_json(width, row))
        .and_then(Iterator::collect)
        .map_err(|e| metadata_error(table_name, "sample rows", &e))?;
    Ok(rows)
}

/// Execute a bound query, collecting at most `max_rows` rows
fn run_query(conn: &Connection, bound: &BoundQuery, max_rows: Option<usize>) -> QueryOutput {
    let mut stmt = conn.prepare(&bound.sql).map_err(query_error)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
    let width = columns.len();

    let params = bound.values.iter().map(json_to_sqlite).collect::<Result<Vec<SqlValue>>>()?;
    let mut rows = stmt.query(params_from_iter(params)).map_err(query_error)?;

    let mut collected = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next().map_err(query_error)? {
        if max_rows.is_some_and(|max| collected.len() >= max) {
            truncated = true;
            break;
        }
        collected.push(row_to_json(width, row).map_err(query_error)?);
    }

    Ok((columns, collected, truncated))
}

fn query_error(e: rusqlite::Error) -> QueryError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::OperationInterrupted => {
            QueryError::Interrupted
        }
        _ => QueryError::Failed(SqlaskError::execution_failed(format!("SQLite error: {e}"))),
    }
}

/// Convert a JSON parameter into a `SQLite` value
fn json_to_sqlite(value: &serde_json::Value) -> Result<SqlValue> {
    use serde_json::Value;

    Ok(match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => {
            return Err(SqlaskError::binding_failed("Parameters must be scalar values"))
        }
    })
}

/// Convert a `SQLite` row to a JSON-safe `Vec`
fn row_to_json(width: usize, row: &Row) -> std::result::Result<Vec<serde_json::Value>, rusqlite::Error> {
    (0..width).map(|idx| sqlite_value_to_json(row, idx)).collect()
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(
    row: &Row,
    idx: usize,
) -> std::result::Result<serde_json::Value, rusqlite::Error> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::Number(i.into()),
        ValueRef::Real(f) => float_to_json(f),
        ValueRef::Text(s) => serde_json::Value::String(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => {
            // Encode BLOB as Base64 for JSON safety
            use base64::Engine;
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}
