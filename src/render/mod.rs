//! Schema rendering for prompts
//!
//! Serializes a [`SchemaDescriptor`] into compact text for the LLM prompt. The output
//! never exceeds the character budget; when the full rendering does not fit, detail is
//! dropped in a fixed order (sample rows, indexes, foreign-key lines, then whole tables
//! starting with the least referenced) and a truncation marker is appended.

use std::cmp::Reverse;

use crate::engine::{SchemaDescriptor, TableDescriptor};

/// Default character budget for rendered schemas
pub const DEFAULT_SCHEMA_BUDGET: usize = 12_000;

/// Longest rendering of a single sample value
const MAX_SAMPLE_VALUE_CHARS: usize = 48;

/// How much per-table detail to include
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Detail {
    Full,
    NoSamples,
    NoIndexes,
    NoForeignKeys,
}

impl Detail {
    const fn samples(self) -> bool {
        matches!(self, Self::Full)
    }

    const fn indexes(self) -> bool {
        matches!(self, Self::Full | Self::NoSamples)
    }

    const fn foreign_keys(self) -> bool {
        !matches!(self, Self::NoForeignKeys)
    }
}

/// Render a schema within `budget` characters
///
/// Identical inputs always produce identical output.
#[must_use]
pub fn render(schema: &SchemaDescriptor, budget: usize) -> String {
    let all: Vec<&TableDescriptor> = schema.tables.iter().collect();

    let full = render_tables(schema, &all, Detail::Full);
    if char_len(&full) <= budget {
        return full;
    }

    for detail in [Detail::NoSamples, Detail::NoIndexes, Detail::NoForeignKeys] {
        let body = render_tables(schema, &all, detail);
        let marker = truncation_marker(schema, detail, &[]);
        if char_len(&body) + char_len(&marker) <= budget {
            tracing::debug!(budget, ?detail, "schema rendering reduced");
            return body + &marker;
        }
    }

    // Drop whole tables, least referenced first, later tables first on ties
    let mut drop_order: Vec<usize> = (0..schema.tables.len()).collect();
    let incoming = incoming_references(schema);
    drop_order.sort_by_key(|&idx| (incoming[idx], Reverse(idx)));

    let mut dropped: Vec<usize> = Vec::new();
    for idx in drop_order {
        dropped.push(idx);
        let kept: Vec<&TableDescriptor> = schema
            .tables
            .iter()
            .enumerate()
            .filter(|(i, _)| !dropped.contains(i))
            .map(|(_, t)| t)
            .collect();
        let dropped_names: Vec<&str> =
            dropped.iter().map(|&i| schema.tables[i].name.as_str()).collect();

        let body = render_tables(schema, &kept, Detail::NoForeignKeys);
        let marker = truncation_marker(schema, Detail::NoForeignKeys, &dropped_names);
        if char_len(&body) + char_len(&marker) <= budget {
            tracing::warn!(budget, dropped_tables = dropped.len(), "schema rendering dropped tables");
            return body + &marker;
        }
    }

    // Not even the marker alone fits
    let dropped_names: Vec<&str> = schema.tables.iter().map(|t| t.name.as_str()).collect();
    let marker = truncation_marker(schema, Detail::NoForeignKeys, &dropped_names);
    marker.chars().take(budget).collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Number of foreign-key edges pointing at each table
fn incoming_references(schema: &SchemaDescriptor) -> Vec<usize> {
    schema
        .tables
        .iter()
        .map(|target| {
            schema
                .tables
                .iter()
                .flat_map(|t| &t.foreign_keys)
                .filter(|fk| fk.referenced_table.eq_ignore_ascii_case(&target.name))
                .count()
        })
        .collect()
}

fn render_tables(schema: &SchemaDescriptor, tables: &[&TableDescriptor], detail: Detail) -> String {
    let mut out = String::new();
    for table in tables {
        render_table(&mut out, table, detail);
    }
    if schema.omitted_tables > 0 {
        out.push_str(&format!(
            "-- {} more table(s) exist but were not introspected\n",
            schema.omitted_tables
        ));
    }
    out
}

fn render_table(out: &mut String, table: &TableDescriptor, detail: Detail) {
    match &table.schema {
        Some(schema) => out.push_str(&format!("TABLE {}.{}\n", schema, table.name)),
        None => out.push_str(&format!("TABLE {}\n", table.name)),
    }

    for column in &table.columns {
        out.push_str("  ");
        out.push_str(&column.name);
        out.push(' ');
        out.push_str(&column.data_type);
        if table.is_primary_key(&column.name) {
            out.push_str(" PK");
        }
        if table.is_foreign_key(&column.name) {
            out.push_str(" FK");
        }
        if !column.nullable {
            out.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            out.push_str(" DEFAULT ");
            out.push_str(default);
        }
        out.push('\n');
    }

    if detail.foreign_keys() {
        for fk in &table.foreign_keys {
            let label = if fk.inferred { "likely references" } else { "references" };
            out.push_str(&format!(
                "  ({}) {label} {}({})\n",
                fk.columns.join(", "),
                fk.referenced_table,
                fk.referenced_columns.join(", ")
            ));
        }
    }

    if detail.indexes() {
        for index in &table.indexes {
            let unique = if index.unique { "UNIQUE " } else { "" };
            out.push_str(&format!(
                "  {unique}INDEX {} ({})\n",
                index.name,
                index.columns.join(", ")
            ));
        }
    }

    if detail.samples() && !table.sample_rows.is_empty() {
        let header: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        out.push_str(&format!("  sample rows ({}):\n", header.join(", ")));
        for row in &table.sample_rows {
            let values: Vec<String> = row.iter().map(render_sample_value).collect();
            out.push_str(&format!("    ({})\n", values.join(", ")));
        }
    }
}

fn render_sample_value(value: &serde_json::Value) -> String {
    let text = match value {
        serde_json::Value::String(s) => format!("'{s}'"),
        other => other.to_string(),
    };
    if char_len(&text) > MAX_SAMPLE_VALUE_CHARS {
        let clipped: String = text.chars().take(MAX_SAMPLE_VALUE_CHARS - 3).collect();
        format!("{clipped}...")
    } else {
        text
    }
}

fn truncation_marker(schema: &SchemaDescriptor, detail: Detail, dropped: &[&str]) -> String {
    let mut omitted = Vec::new();
    if detail >= Detail::NoSamples && schema.tables.iter().any(|t| !t.sample_rows.is_empty()) {
        omitted.push("sample rows".to_string());
    }
    if detail >= Detail::NoIndexes && schema.tables.iter().any(|t| !t.indexes.is_empty()) {
        omitted.push("indexes".to_string());
    }
    if detail >= Detail::NoForeignKeys && schema.tables.iter().any(|t| !t.foreign_keys.is_empty())
    {
        omitted.push("foreign-key lines".to_string());
    }
    if !dropped.is_empty() {
        omitted.push(format!("{} table(s): {}", dropped.len(), dropped.join(", ")));
    }
    if omitted.is_empty() {
        omitted.push("detail".to_string());
    }
    format!("-- schema truncated, omitted {}\n", omitted.join("; "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ColumnInfo, DatabaseType, ForeignKeyInfo, IndexInfo};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn fk(column: &str, target: &str, inferred: bool) -> ForeignKeyInfo {
        ForeignKeyInfo {
            name: format!("fk_{column}"),
            columns: vec![column.to_string()],
            referenced_table: target.to_string(),
            referenced_columns: vec!["id".to_string()],
            resolved: true,
            inferred,
        }
    }

    fn shop() -> SchemaDescriptor {
        let mut users = TableDescriptor::new(
            "users",
            vec![ColumnInfo::new("id", "INTEGER", false), ColumnInfo::new("name", "TEXT", true)],
        );
        users.primary_key = vec!["id".to_string()];
        users.indexes = vec![IndexInfo {
            name: "idx_users_name".to_string(),
            columns: vec!["name".to_string()],
            unique: true,
        }];
        users.sample_rows = vec![vec![json!(1), json!("Alice")], vec![json!(2), json!(null)]];

        let mut orders = TableDescriptor::new(
            "orders",
            vec![
                ColumnInfo::new("id", "INTEGER", false),
                ColumnInfo::new("user_id", "INTEGER", false),
            ],
        );
        orders.primary_key = vec!["id".to_string()];
        orders.foreign_keys = vec![fk("user_id", "users", false)];

        let mut audit = TableDescriptor::new("audit_log", vec![ColumnInfo::new("msg", "TEXT", true)]);
        audit.foreign_keys = vec![fk("user_id", "users", true)];

        SchemaDescriptor::new(DatabaseType::SQLite, vec![users, orders, audit], 0).unwrap()
    }

    #[test]
    fn test_full_rendering() {
        let text = render(&shop(), 10_000);
        assert_eq!(
            text,
            "TABLE users\n\
             \x20 id INTEGER PK NOT NULL\n\
             \x20 name TEXT\n\
             \x20 UNIQUE INDEX idx_users_name (name)\n\
             \x20 sample rows (id, name):\n\
             \x20   (1, 'Alice')\n\
             \x20   (2, null)\n\
             TABLE orders\n\
             \x20 id INTEGER PK NOT NULL\n\
             \x20 user_id INTEGER FK NOT NULL\n\
             \x20 (user_id) references users(id)\n\
             TABLE audit_log\n\
             \x20 msg TEXT\n\
             \x20 (user_id) likely references users(id)\n"
        );
    }

    #[test]
    fn test_samples_dropped_first() {
        let schema = shop();
        let full = render(&schema, 10_000);
        let budget = char_len(&full) - 1;
        let text = render(&schema, budget);

        assert!(char_len(&text) <= budget);
        assert!(!text.contains("sample rows ("));
        assert!(text.contains("INDEX idx_users_name"));
        assert!(text.ends_with("-- schema truncated, omitted sample rows\n"));
    }

    #[test]
    fn test_tables_dropped_by_priority() {
        let schema = shop();
        let text = render(&schema, 120);
        assert!(char_len(&text) <= 120);
        // users has two incoming references and must survive longest
        assert!(text.contains("TABLE users"));
        assert!(!text.contains("TABLE audit_log"));
        assert!(text.contains("table(s): audit_log"));
    }

    #[test]
    fn test_tiny_budget_clips_marker() {
        let text = render(&shop(), 10);
        assert_eq!(char_len(&text), 10);
        assert!(text.starts_with("-- schema"));
        assert_eq!(render(&shop(), 0), "");
    }

    #[test]
    fn test_omitted_tables_noted() {
        let schema = SchemaDescriptor::new(
            DatabaseType::Postgres,
            vec![TableDescriptor::new("t", vec![ColumnInfo::new("a", "int4", true)])],
            7,
        )
        .unwrap();
        assert!(render(&schema, 1_000).contains("7 more table(s)"));
    }

    #[test]
    fn test_long_sample_values_clipped() {
        let rendered = render_sample_value(&json!("x".repeat(200)));
        assert_eq!(char_len(&rendered), MAX_SAMPLE_VALUE_CHARS);
        assert!(rendered.ends_with("..."));
    }

    fn arb_schema() -> impl Strategy<Value = SchemaDescriptor> {
        proptest::collection::vec(
            (
                proptest::collection::vec("[a-z]{1,10}", 1..6),
                proptest::collection::vec("[a-zA-Z ]{0,30}", 0..4),
                0usize..3,
            ),
            0..8,
        )
        .prop_map(|specs| {
            let names: Vec<String> = (0..specs.len()).map(|i| format!("table_{i}")).collect();
            let tables = specs
                .into_iter()
                .enumerate()
                .map(|(i, (columns, samples, refs))| {
                    let mut table = TableDescriptor::new(
                        names[i].clone(),
                        columns.iter().map(|c| ColumnInfo::new(c, "TEXT", i % 2 == 0)).collect(),
                    );
                    table.sample_rows = samples.iter().map(|s| vec![json!(s)]).collect();
                    table.foreign_keys = (0..refs)
                        .map(|r| fk(&format!("ref_{r}"), &names[(i + r) % names.len()], false))
                        .collect();
                    table
                })
                .collect();
            SchemaDescriptor::new(DatabaseType::SQLite, tables, 0).unwrap()
        })
    }

    proptest! {
        #[test]
        fn prop_render_respects_budget(schema in arb_schema(), budget in 0usize..1_500) {
            let first = render(&schema, budget);
            prop_assert!(char_len(&first) <= budget);
            prop_assert_eq!(first, render(&schema, budget));
        }
    }
}
