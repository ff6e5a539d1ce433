//! `PostgreSQL` Database Engine Implementation
//!
//! This module implements the `DatabaseEngine` trait for `PostgreSQL` databases.
//!
//! # Features
//! - Native async driver (`tokio-postgres`)
//! - Schema introspection via `information_schema` and `pg_catalog`
//! - Read-only execution inside a `READ ONLY` session with `statement_timeout`
//! - Typed parameter binding driven by the types the server infers for `$n`
//!
//! # Implementation Notes
//! - Introspection targets `current_schema()` (usually `public`)
//! - `NUMERIC` values travel in the binary wire format and are decoded exactly
//! - BYTEA data is Base64-encoded for JSON safety
//! - Row limits are enforced with a portal so oversized results are never fetched

use base64::Engine as _;
use bytes::BytesMut;
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row};

use crate::engine::{
    expect_engine, float_to_json, infer_relationships, ColumnInfo, ConnectionConfig,
    DatabaseEngine, DatabaseType, ExecutionLimits, ExecutionResult, ForeignKeyInfo, IndexInfo,
    IntrospectionOptions, SchemaDescriptor, TableDescriptor, TableSelector,
};
use crate::error::{mask_secrets, Result, SqlaskError};
use crate::query::{BoundQuery, GeneratedQuery};

const ENGINE: &str = "postgres";

/// `PostgreSQL` database engine implementation
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresEngine;

impl DatabaseEngine for PostgresEngine {
    async fn introspect(
        &self,
        config: &ConnectionConfig,
        options: &IntrospectionOptions,
    ) -> Result<SchemaDescriptor> {
        expect_engine(config, DatabaseType::Postgres)?;
        let client = connect(config).await?;

        let schema: String = client
            .query_one("SELECT current_schema()::text", &[])
            .await
            .map_err(|e| introspection_error("current schema", &e))?
            .get(0);

        let rows = client
            .query(
                "SELECT table_name::text
                 FROM information_schema.tables
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE'
                 ORDER BY table_name",
                &[&schema],
            )
            .await
            .map_err(|e| introspection_error("tables", &e))?;
        let table_names: Vec<String> = rows.iter().map(|row| row.get(0)).collect();

        let sample_rows = options.effective_sample_rows();
        let mut selector = TableSelector::new(ENGINE, table_names, options)?;
        let mut tables = Vec::new();

        while let Some(table_name) = selector.next_table() {
            let table =
                introspect_table(&client, &schema, &table_name, options.include_indexes, sample_rows)
                    .await?;
            selector.record(&table);
            tables.push(table);
        }

        if options.infer_relationships {
            infer_relationships(&mut tables);
        }

        tracing::debug!(engine = ENGINE, schema = %schema, tables = tables.len(), "introspection complete");
        SchemaDescriptor::new(DatabaseType::Postgres, tables, selector.omitted())
    }

    async fn execute(
        &self,
        config: &ConnectionConfig,
        query: &GeneratedQuery,
        limits: &ExecutionLimits,
    ) -> Result<ExecutionResult> {
        expect_engine(config, DatabaseType::Postgres)?;

        // Binding problems surface before any connection is opened
        let bound = query.bind(DatabaseType::Postgres)?;
        let mut client = connect(config).await?;

        let mut session = String::from("SET SESSION CHARACTERISTICS AS TRANSACTION READ ONLY;");
        if let Some(timeout_ms) = limits.timeout_ms {
            session.push_str(&format!(" SET statement_timeout = {timeout_ms};"));
        }
        client.batch_execute(&session).await.map_err(|e| {
            SqlaskError::execution_failed(format!("Failed to prepare read-only session: {e}"))
        })?;

        let start = Instant::now();
        let (columns, rows, truncated) = match limits.timeout_ms {
            Some(timeout_ms) => tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                run_query(&mut client, &bound, limits.max_rows, limits.timeout_ms),
            )
            .await
            .map_err(|_| {
                tracing::warn!(engine = ENGINE, timeout_ms, "statement timed out");
                SqlaskError::execution_timeout(timeout_ms)
            })??,
            None => run_query(&mut client, &bound, limits.max_rows, None).await?,
        };

        ExecutionResult::new(columns, rows, start.elapsed(), truncated)
    }
}

/// Build `PostgreSQL` connection config from `ConnectionConfig`
fn build_pg_config(config: &ConnectionConfig) -> Result<Config> {
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("PostgreSQL requires 'host' parameter"))?;

    let user = config
        .user
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("PostgreSQL requires 'user' parameter"))?;

    let database = config
        .database
        .as_ref()
        .ok_or_else(|| SqlaskError::invalid_input("PostgreSQL requires 'database' parameter"))?;

    let mut pg_config = Config::new();
    pg_config
        .host(host)
        .port(config.port.unwrap_or(5432))
        .user(user)
        .dbname(database)
        .application_name("sqlask")
        .connect_timeout(config.connect_timeout());

    if let Some(password) = &config.password {
        pg_config.password(password);
    }

    Ok(pg_config)
}

/// Open a connection and spawn its driver task
///
/// The driver task ends when the returned client is dropped.
async fn connect(config: &ConnectionConfig) -> Result<Client> {
    let pg_config = build_pg_config(config)?;
    let timeout = config.connect_timeout();

    let (client, connection) = tokio::time::timeout(timeout, pg_config.connect(NoTls))
        .await
        .map_err(|_| {
            SqlaskError::connection_failed(format!(
                "Timed out connecting to PostgreSQL after {}ms",
                timeout.as_millis()
            ))
        })?
        .map_err(|e| {
            SqlaskError::connection_failed(mask_secrets(
                &format!("Failed to connect to PostgreSQL: {e}"),
                &config.secrets(),
            ))
        })?;

    // Connection errors are not logged to prevent credential leakage
    tokio::spawn(async move {
        let _ = connection.await;
    });

    Ok(client)
}

fn introspection_error(what: &str, e: &tokio_postgres::Error) -> SqlaskError {
    SqlaskError::introspection_failed(ENGINE, format!("Failed to query {what}: {e}"))
}

async fn introspect_table(
    client: &Client,
    schema: &str,
    table_name: &str,
    include_indexes: bool,
    sample_rows: usize,
) -> Result<TableDescriptor> {
    let mut table = TableDescriptor::new(table_name, introspect_columns(client, schema, table_name).await?);
    table.schema = Some(schema.to_string());
    table.primary_key = introspect_primary_key(client, schema, table_name).await?;
    table.foreign_keys = introspect_foreign_keys(client, schema, table_name).await?;

    if include_indexes {
        table.indexes = introspect_indexes(client, schema, table_name).await?;
    }

    if sample_rows > 0 {
        table.sample_rows = sample_table(client, schema, table_name, sample_rows).await?;
    }

    Ok(table)
}

/// Introspect table columns
async fn introspect_columns(client: &Client, schema: &str, table_name: &str) -> Result<Vec<ColumnInfo>> {
    let query = "
        SELECT column_name::text, data_type::text, is_nullable::text, column_default::text
        FROM information_schema.columns
        WHERE table_schema = $1 AND table_name = $2
        ORDER BY ordinal_position";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| introspection_error(&format!("columns for {schema}.{table_name}"), &e))?;

    let columns = rows
        .iter()
        .map(|row| ColumnInfo {
            name: row.get(0),
            data_type: row.get(1),
            nullable: row.get::<_, String>(2) == "YES",
            default: row.get(3),
        })
        .collect();

    Ok(columns)
}

/// Introspect primary key columns in key order
async fn introspect_primary_key(client: &Client, schema: &str, table_name: &str) -> Result<Vec<String>> {
    let query = "
        SELECT kcu.column_name::text
        FROM information_schema.table_constraints tc
        JOIN information_schema.key_column_usage kcu
          ON tc.constraint_name = kcu.constraint_name
          AND tc.table_schema = kcu.table_schema
          AND tc.table_name = kcu.table_name
        WHERE tc.constraint_type = 'PRIMARY KEY'
          AND tc.table_schema = $1
          AND tc.table_name = $2
        ORDER BY kcu.ordinal_position";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| introspection_error(&format!("primary key for {schema}.{table_name}"), &e))?;

    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Introspect foreign keys, pairing local and referenced columns by key position
async fn introspect_foreign_keys(
    client: &Client,
    schema: &str,
    table_name: &str,
) -> Result<Vec<ForeignKeyInfo>> {
    let query = "
        SELECT con.conname::text, att.attname::text, ref.relname::text, refatt.attname::text
        FROM pg_constraint con
        JOIN pg_class cls ON cls.oid = con.conrelid
        JOIN pg_namespace ns ON ns.oid = cls.relnamespace
        JOIN pg_class ref ON ref.oid = con.confrelid
        CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(attnum, refattnum, ord)
        JOIN pg_attribute att ON att.attrelid = con.conrelid AND att.attnum = k.attnum
        JOIN pg_attribute refatt ON refatt.attrelid = con.confrelid AND refatt.attnum = k.refattnum
        WHERE con.contype = 'f' AND ns.nspname = $1 AND cls.relname = $2
        ORDER BY con.conname, k.ord";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| introspection_error(&format!("foreign keys for {schema}.{table_name}"), &e))?;

    // Group by constraint name; BTreeMap keeps constraint order stable
    let mut grouped: BTreeMap<String, (String, Vec<String>, Vec<String>)> = BTreeMap::new();
    for row in &rows {
        let entry = grouped
            .entry(row.get(0))
            .or_insert_with(|| (row.get(2), Vec::new(), Vec::new()));
        entry.1.push(row.get(1));
        entry.2.push(row.get(3));
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

/// Introspect indexes
async fn introspect_indexes(client: &Client, schema: &str, table_name: &str) -> Result<Vec<IndexInfo>> {
    let query = "
        SELECT indexname::text, indexdef
        FROM pg_indexes
        WHERE schemaname = $1 AND tablename = $2
        ORDER BY indexname";

    let rows = client
        .query(query, &[&schema, &table_name])
        .await
        .map_err(|e| introspection_error(&format!("indexes for {schema}.{table_name}"), &e))?;

    let mut indexes = Vec::new();
    for row in rows {
        let index_name: String = row.get(0);
        let index_def: String = row.get(1);

        // Primary key indexes are already captured in primary_key
        if index_name.ends_with("_pkey") {
            continue;
        }

        indexes.push(IndexInfo {
            columns: extract_index_columns(&index_def),
            unique: index_def.contains("UNIQUE INDEX"),
            name: index_name,
        });
    }

    Ok(indexes)
}

/// Extract column names from a `PostgreSQL` index definition
///
/// Example: `CREATE INDEX idx_users_email ON public.users USING btree (email)`
fn extract_index_columns(index_def: &str) -> Vec<String> {
    // Partial indexes carry a WHERE clause after the column list
    let head = index_def.split(" WHERE ").next().unwrap_or(index_def);

    match (head.find('('), head.rfind(')')) {
        (Some(start), Some(end)) if start < end => head[start + 1..end]
            .split(',')
            .map(|s| s.trim().trim_matches('"').to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

async fn sample_table(
    client: &Client,
    schema: &str,
    table_name: &str,
    limit: usize,
) -> Result<Vec<Vec<Value>>> {
    let sql = format!(
        "SELECT * FROM {}.{} LIMIT $1",
        DatabaseType::Postgres.quote_ident(schema),
        DatabaseType::Postgres.quote_ident(table_name)
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let rows = client
        .query(&sql, &[&limit])
        .await
        .map_err(|e| introspection_error(&format!("sample rows for {schema}.{table_name}"), &e))?;

    rows.iter()
        .map(row_to_json)
        .collect::<Result<_>>()
        .map_err(|e| SqlaskError::introspection_failed(ENGINE, e.message()))
}

/// Execute a bound query in a read-only transaction, collecting at most `max_rows` rows
#[allow(clippy::type_complexity)]
async fn run_query(
    client: &mut Client,
    bound: &BoundQuery,
    max_rows: Option<usize>,
    timeout_ms: Option<u64>,
) -> Result<(Vec<String>, Vec<Vec<Value>>, bool)> {
    let transaction = client
        .build_transaction()
        .read_only(true)
        .start()
        .await
        .map_err(|e| driver_error(&e, timeout_ms))?;

    let statement = transaction.prepare(&bound.sql).await.map_err(|e| driver_error(&e, timeout_ms))?;
    let columns: Vec<String> = statement.columns().iter().map(|c| c.name().to_string()).collect();

    if statement.params().len() != bound.values.len() {
        return Err(SqlaskError::binding_failed(format!(
            "Statement expects {} parameter(s) but {} were bound",
            statement.params().len(),
            bound.values.len()
        )));
    }

    let owned = bound
        .values
        .iter()
        .zip(statement.params())
        .enumerate()
        .map(|(idx, (value, ty))| json_to_pg(value, ty, idx + 1))
        .collect::<Result<Vec<_>>>()?;
    let params: Vec<&(dyn ToSql + Sync)> =
        owned.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();

    // Fetch one extra row to detect truncation; zero means "all rows"
    let fetch = max_rows.map_or(0, |max| i32::try_from(max.saturating_add(1)).unwrap_or(i32::MAX));
    let portal = transaction
        .bind(&statement, &params)
        .await
        .map_err(|e| driver_error(&e, timeout_ms))?;
    let mut rows = transaction
        .query_portal(&portal, fetch)
        .await
        .map_err(|e| driver_error(&e, timeout_ms))?;

    let truncated = max_rows.is_some_and(|max| rows.len() > max);
    if let Some(max) = max_rows {
        rows.truncate(max);
    }

    let rows = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
    Ok((columns, rows, truncated))
}

fn driver_error(e: &tokio_postgres::Error, timeout_ms: Option<u64>) -> SqlaskError {
    match (e.code(), timeout_ms) {
        (Some(code), Some(timeout_ms)) if *code == SqlState::QUERY_CANCELED => {
            SqlaskError::execution_timeout(timeout_ms)
        }
        _ => SqlaskError::execution_failed(format!("PostgreSQL error: {e}")),
    }
}

/// NULL of any type
#[derive(Debug)]
struct PgNull;

impl ToSql for PgNull {
    fn to_sql(
        &self,
        _ty: &Type,
        _out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        Ok(IsNull::Yes)
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// `NUMERIC` value carried as exact decimal text
#[derive(Debug, Clone, PartialEq, Eq)]
struct PgNumeric(String);

const NUMERIC_POS: u16 = 0x0000;
const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl ToSql for PgNumeric {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        out.extend_from_slice(&encode_numeric(&self.0)?);
        Ok(IsNull::No)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }

    to_sql_checked!();
}

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Self(decode_numeric(raw)?))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

/// Encode decimal text into the binary `NUMERIC` format (base-10000 digits)
fn encode_numeric(text: &str) -> std::result::Result<Vec<u8>, String> {
    let text = text.trim();
    let header = |ndigits: i16, weight: i16, sign: u16, dscale: u16| {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(&ndigits.to_be_bytes());
        buf.extend_from_slice(&weight.to_be_bytes());
        buf.extend_from_slice(&sign.to_be_bytes());
        buf.extend_from_slice(&dscale.to_be_bytes());
        buf
    };

    if text.eq_ignore_ascii_case("nan") {
        return Ok(header(0, 0, NUMERIC_NAN, 0));
    }

    let (negative, unsigned) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = unsigned.split_once('.').unwrap_or((unsigned, ""));

    let all_digits = int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !all_digits {
        return Err(format!("'{text}' is not a decimal number"));
    }

    let too_large = || format!("'{text}' is out of range for NUMERIC");
    let dscale = u16::try_from(frac_part.len()).map_err(|_| too_large())?;

    let int_part = int_part.trim_start_matches('0');
    let int_padding = (4 - int_part.len() % 4) % 4;
    let frac_padding = (4 - frac_part.len() % 4) % 4;
    let padded = format!(
        "{}{int_part}{frac_part}{}",
        "0".repeat(int_padding),
        "0".repeat(frac_padding)
    );

    let mut groups: Vec<i16> = padded
        .as_bytes()
        .chunks(4)
        .map(|chunk| chunk.iter().fold(0i16, |acc, b| acc * 10 + i16::from(b - b'0')))
        .collect();

    let int_groups = (int_part.len() + int_padding) / 4;
    let mut weight = i32::try_from(int_groups).map_err(|_| too_large())? - 1;

    let leading = groups.iter().take_while(|g| **g == 0).count();
    groups.drain(..leading);
    weight -= i32::try_from(leading).map_err(|_| too_large())?;
    while groups.last() == Some(&0) {
        groups.pop();
    }

    let (weight, sign) = if groups.is_empty() {
        (0, NUMERIC_POS)
    } else {
        (weight, if negative { NUMERIC_NEG } else { NUMERIC_POS })
    };

    let ndigits = i16::try_from(groups.len()).map_err(|_| too_large())?;
    let weight = i16::try_from(weight).map_err(|_| too_large())?;

    let mut buf = header(ndigits, weight, sign, dscale);
    for group in groups {
        buf.extend_from_slice(&group.to_be_bytes());
    }
    Ok(buf)
}

/// Decode the binary `NUMERIC` format into exact decimal text
fn decode_numeric(raw: &[u8]) -> std::result::Result<String, String> {
    let field = |idx: usize| raw.get(idx..idx + 2).map(|b| [b[0], b[1]]);
    let (Some(ndigits), Some(weight), Some(sign), Some(dscale)) = (field(0), field(2), field(4), field(6))
    else {
        return Err("NUMERIC value is shorter than its header".to_string());
    };

    let ndigits = usize::try_from(i16::from_be_bytes(ndigits))
        .map_err(|_| "NUMERIC value has a negative digit count".to_string())?;
    let weight = i32::from(i16::from_be_bytes(weight));
    let sign = u16::from_be_bytes(sign);
    let dscale = usize::from(u16::from_be_bytes(dscale));

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        NUMERIC_POS | NUMERIC_NEG => {}
        other => return Err(format!("NUMERIC value has unknown sign 0x{other:04X}")),
    }

    if raw.len() != 8 + ndigits * 2 {
        return Err("NUMERIC value length does not match its digit count".to_string());
    }
    let digits: Vec<i16> = raw[8..]
        .chunks_exact(2)
        .map(|pair| i16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let digit_at = |idx: i32| -> i16 {
        usize::try_from(idx).ok().and_then(|i| digits.get(i)).copied().unwrap_or(0)
    };

    let mut text = String::new();
    if sign == NUMERIC_NEG {
        text.push('-');
    }

    if weight < 0 {
        text.push('0');
    } else {
        for idx in 0..=weight {
            if idx == 0 {
                text.push_str(&digit_at(idx).to_string());
            } else {
                text.push_str(&format!("{:04}", digit_at(idx)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut idx = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(idx)));
            idx += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }

    Ok(text)
}

/// Emit exact decimal text as a JSON number
fn numeric_to_json(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::from(i);
    }
    text.parse::<f64>().map_or(Value::Null, float_to_json)
}

fn number_text(n: &serde_json::Number) -> String {
    match (n.as_i64(), n.as_u64(), n.as_f64()) {
        (Some(i), _, _) => i.to_string(),
        (None, Some(u), _) => u.to_string(),
        (None, None, Some(f)) => format!("{f}"),
        _ => n.to_string(),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15)
                .map(|f| f as i64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Convert a JSON parameter into a value of the type the server inferred for `$position`
#[allow(clippy::cast_possible_truncation)]
fn json_to_pg(value: &Value, ty: &Type, position: usize) -> Result<Box<dyn ToSql + Sync + Send>> {
    let mismatch = || {
        SqlaskError::binding_failed(format!(
            "Parameter ${position} cannot be bound as PostgreSQL type '{}'",
            ty.name()
        ))
    };

    if value.is_null() {
        return Ok(Box::new(PgNull));
    }

    let text = || match value {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    };

    let boxed: Box<dyn ToSql + Sync + Send> = match *ty {
        Type::BOOL => Box::new(match value {
            Value::Bool(b) => *b,
            Value::String(s) => s.trim().parse::<bool>().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        }),
        Type::INT2 => Box::new(i16::try_from(as_i64(value).ok_or_else(mismatch)?).map_err(|_| mismatch())?),
        Type::INT4 => Box::new(i32::try_from(as_i64(value).ok_or_else(mismatch)?).map_err(|_| mismatch())?),
        Type::INT8 => Box::new(as_i64(value).ok_or_else(mismatch)?),
        Type::OID => Box::new(u32::try_from(as_i64(value).ok_or_else(mismatch)?).map_err(|_| mismatch())?),
        Type::FLOAT4 => Box::new(as_f64(value).ok_or_else(mismatch)? as f32),
        Type::FLOAT8 => Box::new(as_f64(value).ok_or_else(mismatch)?),
        Type::NUMERIC => {
            let decimal = match value {
                Value::Number(n) => number_text(n),
                Value::String(s) => s.trim().to_string(),
                _ => return Err(mismatch()),
            };
            encode_numeric(&decimal).map_err(|_| mismatch())?;
            Box::new(PgNumeric(decimal))
        }
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => Box::new(match value {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            _ => return Err(mismatch()),
        }),
        Type::JSON | Type::JSONB => Box::new(value.clone()),
        Type::UUID => Box::new(uuid::Uuid::parse_str(text().ok_or_else(mismatch)?.trim()).map_err(|_| mismatch())?),
        Type::DATE => Box::new(
            text()
                .ok_or_else(mismatch)?
                .trim()
                .parse::<chrono::NaiveDate>()
                .map_err(|_| mismatch())?,
        ),
        Type::TIME => Box::new(
            text()
                .ok_or_else(mismatch)?
                .trim()
                .parse::<chrono::NaiveTime>()
                .map_err(|_| mismatch())?,
        ),
        Type::TIMESTAMP => {
            let s = text().ok_or_else(mismatch)?.trim();
            let parsed = s
                .parse::<chrono::NaiveDateTime>()
                .or_else(|_| chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                .or_else(|_| s.parse::<chrono::NaiveDate>().map(|d| d.and_time(chrono::NaiveTime::MIN)))
                .map_err(|_| mismatch())?;
            Box::new(parsed)
        }
        Type::TIMESTAMPTZ => Box::new(
            chrono::DateTime::parse_from_rfc3339(text().ok_or_else(mismatch)?.trim())
                .map(|d| d.with_timezone(&chrono::Utc))
                .map_err(|_| mismatch())?,
        ),
        _ => return Err(mismatch()),
    };

    Ok(boxed)
}

/// Convert a `PostgreSQL` row to a JSON-safe `Vec`
fn row_to_json(row: &Row) -> Result<Vec<Value>> {
    (0..row.len()).map(|idx| pg_value_to_json(row, idx)).collect()
}

/// Read a nullable column value
fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<Option<T>> {
    row.try_get::<_, Option<T>>(idx).map_err(|e| {
        SqlaskError::execution_failed(format!(
            "Failed to read column '{}' ({}): {e}",
            row.columns()[idx].name(),
            row.columns()[idx].type_().name()
        ))
    })
}

fn array_to_json<T>(values: Option<Vec<Option<T>>>, convert: impl Fn(T) -> Value) -> Option<Value> {
    values.map(|items| {
        Value::Array(items.into_iter().map(|v| v.map_or(Value::Null, &convert)).collect())
    })
}

/// Convert a `PostgreSQL` value to JSON
fn pg_value_to_json(row: &Row, idx: usize) -> Result<Value> {
    let ty = row.columns()[idx].type_();

    let value = match *ty {
        Type::BOOL => get::<bool>(row, idx)?.map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx)?.map(Value::from),
        Type::INT4 => get::<i32>(row, idx)?.map(Value::from),
        Type::INT8 => get::<i64>(row, idx)?.map(Value::from),
        Type::OID => get::<u32>(row, idx)?.map(Value::from),
        Type::FLOAT4 => get::<f32>(row, idx)?.map(|v| float_to_json(f64::from(v))),
        Type::FLOAT8 => get::<f64>(row, idx)?.map(float_to_json),
        Type::NUMERIC => get::<PgNumeric>(row, idx)?.map(|n| numeric_to_json(&n.0)),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            get::<String>(row, idx)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => get::<Value>(row, idx)?,
        Type::BYTEA => get::<Vec<u8>>(row, idx)?
            .map(|v| Value::String(base64::engine::general_purpose::STANDARD.encode(v))),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx)?
            .map(|v| Value::String(v.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::TIMESTAMPTZ => get::<chrono::DateTime<chrono::Utc>>(row, idx)?
            .map(|v| Value::String(v.to_rfc3339())),
        Type::DATE => get::<chrono::NaiveDate>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::TIME => get::<chrono::NaiveTime>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::UUID => get::<uuid::Uuid>(row, idx)?.map(|v| Value::String(v.to_string())),
        Type::BOOL_ARRAY => array_to_json(get::<Vec<Option<bool>>>(row, idx)?, Value::Bool),
        Type::INT2_ARRAY => array_to_json(get::<Vec<Option<i16>>>(row, idx)?, Value::from),
        Type::INT4_ARRAY => array_to_json(get::<Vec<Option<i32>>>(row, idx)?, Value::from),
        Type::INT8_ARRAY => array_to_json(get::<Vec<Option<i64>>>(row, idx)?, Value::from),
        Type::FLOAT8_ARRAY => array_to_json(get::<Vec<Option<f64>>>(row, idx)?, float_to_json),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => {
            array_to_json(get::<Vec<Option<String>>>(row, idx)?, Value::String)
        }
        _ => get::<String>(row, idx).map_err(|_| {
            SqlaskError::execution_failed(format!(
                "Unsupported PostgreSQL type '{}' in column '{}'",
                ty.name(),
                row.columns()[idx].name()
            ))
        })?
        .map(Value::String),
    };

    Ok(value.unwrap_or(Value::Null))
}
