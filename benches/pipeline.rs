//! Pipeline Performance Benchmarks
//!
//! Measures the CPU-bound stages that run on every question:
//! - Rendering a wide schema under a character budget
//! - Validating a generated query against that schema
//! - Binding named placeholders for each dialect
//! - Executing against a small `SQLite` file

use std::collections::BTreeMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use sqlask::render::DEFAULT_SCHEMA_BUDGET;
use sqlask::{
    render, ColumnInfo, DatabaseType, ForeignKeyInfo, GeneratedQuery, SchemaDescriptor,
    SqlValidator, TableDescriptor,
};

/// `table_0` .. `table_{n-1}`, each with ten columns and a key to its predecessor
fn synthetic_schema(tables: usize) -> SchemaDescriptor {
    let tables = (0..tables)
        .map(|i| {
            let mut columns = vec![ColumnInfo::new("id", "INTEGER", false)];
            columns.extend((0..8).map(|c| ColumnInfo::new(format!("field_{c}"), "TEXT", true)));
            columns.push(ColumnInfo::new("parent_id", "INTEGER", true));

            let mut table = TableDescriptor::new(format!("table_{i}"), columns);
            table.primary_key = vec!["id".to_string()];
            if i > 0 {
                table.foreign_keys.push(ForeignKeyInfo {
                    name: format!("fk_table_{i}_parent"),
                    columns: vec!["parent_id".to_string()],
                    referenced_table: format!("table_{}", i - 1),
                    referenced_columns: vec!["id".to_string()],
                    resolved: true,
                    inferred: false,
                });
            }
            table
        })
        .collect();

    SchemaDescriptor::new(DatabaseType::Postgres, tables, 0).expect("table names are unique")
}

fn join_query() -> GeneratedQuery {
    let mut parameters = BTreeMap::new();
    parameters.insert("label".to_string(), json!("alpha"));
    parameters.insert("limit".to_string(), json!(50));
    GeneratedQuery::new(
        "SELECT a.id, a.field_0, b.field_1 FROM table_1 a JOIN table_0 b ON b.id = a.parent_id \
         WHERE a.field_2 = :label AND b.field_3 = :label ORDER BY a.id LIMIT :limit",
        parameters,
    )
    .expect("placeholders match parameters")
}

fn bench_render(c: &mut Criterion) {
    let small = synthetic_schema(10);
    let wide = synthetic_schema(300);

    c.bench_function("render_10_tables", |b| {
        b.iter(|| render(black_box(&small), black_box(DEFAULT_SCHEMA_BUDGET)));
    });

    c.bench_function("render_300_tables_budgeted", |b| {
        b.iter(|| render(black_box(&wide), black_box(DEFAULT_SCHEMA_BUDGET)));
    });
}

fn bench_validate(c: &mut Criterion) {
    let schema = synthetic_schema(50);
    let query = join_query();
    let validator = SqlValidator::new(&schema);

    c.bench_function("validate_join_query", |b| {
        b.iter(|| validator.validate(black_box(&query)));
    });
}

fn bench_bind(c: &mut Criterion) {
    let query = join_query();

    c.bench_function("bind_postgres", |b| {
        b.iter(|| black_box(&query).bind(DatabaseType::Postgres));
    });

    c.bench_function("bind_mysql", |b| {
        b.iter(|| black_box(&query).bind(DatabaseType::MySQL));
    });
}

#[cfg(feature = "sqlite")]
fn bench_sqlite_execute(c: &mut Criterion) {
    use sqlask::engine::sqlite::SqliteEngine;
    use sqlask::{ConnectionConfig, DatabaseEngine, ExecutionLimits};

    let temp_file = std::env::temp_dir().join("sqlask_bench_execute.db");
    let _ = std::fs::remove_file(&temp_file);
    {
        let conn = rusqlite::Connection::open(&temp_file).expect("Failed to create database");
        conn.execute_batch(
            "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, age INTEGER);
             WITH RECURSIVE seq(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM seq WHERE x < 100)
             INSERT INTO users (name, age) SELECT 'User ' || x, x FROM seq;",
        )
        .expect("Failed to seed database");
    }

    let config = ConnectionConfig::sqlite(temp_file.clone());
    let mut parameters = BTreeMap::new();
    parameters.insert("min_age".to_string(), json!(30));
    let query = GeneratedQuery::new("SELECT id, name FROM users WHERE age > :min_age", parameters)
        .expect("placeholders match parameters");
    let limits = ExecutionLimits::default();
    let runtime = tokio::runtime::Runtime::new().expect("Failed to build runtime");

    c.bench_function("sqlite_execute_filtered", |b| {
        b.iter(|| runtime.block_on(SqliteEngine.execute(black_box(&config), black_box(&query), &limits)));
    });

    let _ = std::fs::remove_file(&temp_file);
}

#[cfg(not(feature = "sqlite"))]
fn bench_sqlite_execute(_c: &mut Criterion) {}

criterion_group!(benches, bench_render, bench_validate, bench_bind, bench_sqlite_execute);
criterion_main!(benches);
