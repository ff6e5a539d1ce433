//! Static Validation of Generated SQL
//!
//! Generated SQL is untrusted. Before any execution connection is opened, a query must
//! pass every check here, otherwise it is rejected with `ValidationFailed`.
//!
//! # Validation Strategy
//! - Conservative allow-list: only a single `SELECT`/`WITH` statement is permitted
//! - Text checks run on comment-stripped SQL with string literals blanked
//! - The statement is parsed with the target dialect (`sqlparser`)
//! - Every table and column reference must exist in the introspected schema, under the
//!   schema it was introspected from
//! - Functions with side effects (admin, file, lock, config, remote-link) are refused
//! - String values compared against columns must arrive as bound parameters
//!
//! Some valid but unusual statements (table-valued functions, CTE column lists,
//! `FOR UPDATE` locking reads) are rejected.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::ast::{
    BinaryOperator, Expr, ObjectName, Query, SelectItem, SetExpr, Statement, Value, Visit, Visitor,
};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use std::collections::BTreeSet;
use std::ops::ControlFlow;

use crate::engine::{DatabaseType, SchemaDescriptor, TableDescriptor};
use crate::error::{Result, SqlaskError};
use crate::query::{segments, GeneratedQuery, QuoteRules, SegmentKind};

mod question;

pub use question::{validate_question, MAX_QUESTION_CHARS, MIN_QUESTION_CHARS};

/// Statements that modify data or schema when they lead a query
const DESTRUCTIVE_LEADING: &[&str] =
    &["INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "REPLACE", "MERGE"];

/// Keywords rejected anywhere outside string literals
///
/// `REPLACE` is not listed because it is also a string function.
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "TRUNCATE", "CREATE", "GRANT", "REVOKE",
    "MERGE", "ATTACH", "DETACH", "VACUUM", "COPY", "INTO", "PRAGMA", "CALL", "EXEC", "EXECUTE",
];

/// Functions refused in every dialect
const DENIED_FUNCTIONS: &[&str] = &["sleep", "benchmark", "load_file", "load_extension"];

/// `PostgreSQL` functions that signal backends, touch files, take locks or change settings
const POSTGRES_DENIED_FUNCTIONS: &[&str] = &[
    "pg_terminate_backend", "pg_cancel_backend", "pg_reload_conf", "pg_rotate_logfile",
    "pg_switch_wal", "pg_promote", "pg_stat_file", "set_config", "pg_notify", "nextval", "setval",
    "query_to_xml", "query_to_xml_and_xmlschema", "cursor_to_xml", "table_to_xml",
    "table_to_xml_and_xmlschema", "schema_to_xml", "database_to_xml", "pg_import_system_collations",
];

const POSTGRES_DENIED_PREFIXES: &[&str] = &[
    "dblink", "pg_read_", "pg_ls_", "lo_", "pg_sleep", "pg_advisory", "pg_try_advisory",
    "pg_stat_reset", "pg_create_", "pg_drop_", "pg_replication_", "pg_logical_", "pg_backup_",
    "pg_start_backup", "pg_stop_backup", "pg_wal_replay_", "pg_file_",
];

/// `MySQL` functions that take locks, wait on replication or run commands
const MYSQL_DENIED_FUNCTIONS: &[&str] = &[
    "get_lock", "release_lock", "release_all_locks", "is_free_lock", "is_used_lock",
    "master_pos_wait", "source_pos_wait", "wait_for_executed_gtid_set",
    "wait_until_sql_thread_after_gtids", "sys_exec", "sys_eval",
];

/// `SQLite` functions that read or write files or swap tokenizers
const SQLITE_DENIED_FUNCTIONS: &[&str] = &["readfile", "writefile", "edit", "fts3_tokenizer"];

static WORD_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").unwrap());

static TAUTOLOGY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bOR\s+('[^']*'|\d+)\s*=\s*('[^']*'|\d+)").unwrap()
});

/// Injection-shaped fragments, with a short description used in the error
static INJECTION_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\bUNION\s+(ALL\s+)?SELECT\s+NULL\b", "UNION SELECT NULL column scan"),
        (r"(?i)\bINTO\s+(OUT|DUMP)FILE\b", "INTO OUTFILE"),
        (r"(?i)\bLOAD_FILE\s*\(", "LOAD_FILE()"),
        (r"(?i)\b(PG_)?SLEEP\s*\(", "sleep()"),
        (r"(?i)\bBENCHMARK\s*\(", "BENCHMARK()"),
        (r"(?i)\bXP_CMDSHELL\b", "xp_cmdshell"),
    ]
    .into_iter()
    .map(|(pattern, label)| (Regex::new(pattern).unwrap(), label))
    .collect()
});

/// Validates generated queries against one schema
#[derive(Debug, Clone, Copy)]
pub struct SqlValidator<'a> {
    schema: &'a SchemaDescriptor,
}

impl<'a> SqlValidator<'a> {
    /// Validator for the schema the query was generated from
    #[must_use]
    pub const fn new(schema: &'a SchemaDescriptor) -> Self {
        Self { schema }
    }

    /// Validate a generated query
    ///
    /// # Returns
    /// * `Ok(())` if the query is a single read-only statement over known tables/columns
    /// * `Err(SqlaskError::ValidationFailed)` describing the first problem found
    pub fn validate(&self, query: &GeneratedQuery) -> Result<()> {
        let dialect = self.schema.dialect;
        let rules = QuoteRules::for_dialect(dialect);

        // Pre-process SQL
        let without_comments = strip_comments(query.sql.trim(), rules);
        if without_comments.trim().is_empty() {
            return Err(SqlaskError::validation_failed("Generated SQL is empty"));
        }
        let blanked = blank_quoted(&without_comments, true, rules);

        check_leading_keyword(&blanked)?;
        check_single_statement(&blanked)?;
        check_injection_patterns(&without_comments)?;
        check_write_keywords(&blanked, rules)?;
        check_inline_parameter_values(&without_comments, query, rules)?;

        let bound = query.positional(dialect);
        let statements = parse(&bound.sql, dialect)?;
        if statements.len() != 1 {
            return Err(SqlaskError::validation_failed(format!(
                "Expected exactly one statement, found {}",
                statements.len()
            )));
        }

        let Statement::Query(parsed) = &statements[0] else {
            return Err(SqlaskError::validation_failed("Only SELECT queries are allowed"));
        };

        self.check_references(parsed)
    }

    /// Verify table and column references against the schema
    fn check_references(&self, query: &Query) -> Result<()> {
        let mut collector = ReferenceCollector::default();
        let _ = query.visit(&mut collector);

        if collector.writes {
            return Err(SqlaskError::validation_failed(
                "Data-modifying clauses are not allowed in a read-only query",
            ));
        }

        let dialect = self.schema.dialect;
        if let Some(function) = collector.functions.iter().find(|f| is_denied_function(dialect, f)) {
            return Err(SqlaskError::validation_failed(format!(
                "Function `{function}()` is not allowed in a read-only query"
            )));
        }

        if let Some(literal) = collector.inline_literals.first() {
            return Err(SqlaskError::validation_failed(format!(
                "generated SQL compares against the inline value '{literal}'; values must be bound \
                 as :name parameters"
            )));
        }

        for table in &collector.tables {
            if table.qualifiers.is_empty() && collector.ctes.contains(&table.name.to_lowercase()) {
                continue;
            }
            let Some(descriptor) = self.schema.table(&table.name) else {
                return Err(SqlaskError::validation_failed(format!(
                    "generated SQL referenced an unknown table `{}`; re-phrase the question",
                    table.name
                )));
            };
            if !self.qualifier_matches(&table.qualifiers, descriptor) {
                return Err(SqlaskError::validation_failed(format!(
                    "generated SQL referenced `{}` outside the introspected schema; re-phrase the question",
                    table.qualified()
                )));
            }
        }

        for column in &collector.columns {
            let lower = column.to_lowercase();
            let known = self.schema.has_column(column)
                || collector.aliases.contains(&lower)
                || collector.ctes.contains(&lower)
                || self.schema.table(column).is_some();
            if !known {
                return Err(SqlaskError::validation_failed(format!(
                    "generated SQL referenced an unknown column `{column}`; re-phrase the question"
                )));
            }
        }

        Ok(())
    }

    /// Whether a `schema.table` qualifier names the schema the table was read from
    fn qualifier_matches(&self, qualifiers: &[String], table: &TableDescriptor) -> bool {
        match (qualifiers, &table.schema) {
            ([], _) => true,
            ([qualifier], Some(schema)) => qualifier.eq_ignore_ascii_case(schema),
            ([qualifier], None) => {
                self.schema.dialect == DatabaseType::SQLite && qualifier.eq_ignore_ascii_case("main")
            }
            _ => false,
        }
    }
}

/// Validate a query against a schema
pub fn validate(query: &GeneratedQuery, schema: &SchemaDescriptor) -> Result<()> {
    SqlValidator::new(schema).validate(query)
}

/// A relation as written, split into qualifiers and the table name
#[derive(Debug)]
struct TableRef {
    qualifiers: Vec<String>,
    name: String,
}

impl TableRef {
    fn qualified(&self) -> String {
        let mut parts = self.qualifiers.clone();
        parts.push(self.name.clone());
        parts.join(".")
    }
}

/// Collects relations, identifiers, function calls, compared literals, CTE names and
/// output aliases from a query
#[derive(Debug, Default)]
struct ReferenceCollector {
    tables: Vec<TableRef>,
    columns: Vec<String>,
    functions: Vec<String>,
    inline_literals: Vec<String>,
    ctes: BTreeSet<String>,
    aliases: BTreeSet<String>,
    writes: bool,
}

impl ReferenceCollector {
    fn collect_set_expr(&mut self, body: &SetExpr) {
        match body {
            SetExpr::Select(select) => {
                if select.into.is_some() {
                    self.writes = true;
                }
                for item in &select.projection {
                    if let SelectItem::ExprWithAlias { alias, .. } = item {
                        self.aliases.insert(alias.value.to_lowercase());
                    }
                }
            }
            SetExpr::SetOperation { left, right, .. } => {
                self.collect_set_expr(left);
                self.collect_set_expr(right);
            }
            SetExpr::Insert(_) | SetExpr::Update(_) => self.writes = true,
            _ => {}
        }
    }

    fn note_literals<'e>(&mut self, operands: impl IntoIterator<Item = &'e Expr>) {
        for operand in operands {
            if let Some(text) = string_literal(operand) {
                self.inline_literals.push(text.to_string());
            }
        }
    }
}

impl Visitor for ReferenceCollector {
    type Break = ();

    fn pre_visit_query(&mut self, query: &Query) -> ControlFlow<Self::Break> {
        if let Some(with) = &query.with {
            for cte in &with.cte_tables {
                self.ctes.insert(cte.alias.name.value.to_lowercase());
            }
        }
        self.collect_set_expr(&query.body);
        ControlFlow::Continue(())
    }

    fn pre_visit_relation(&mut self, relation: &ObjectName) -> ControlFlow<Self::Break> {
        if let Some((last, qualifiers)) = relation.0.split_last() {
            self.tables.push(TableRef {
                qualifiers: qualifiers.iter().map(|part| part.value.clone()).collect(),
                name: last.value.clone(),
            });
        }
        ControlFlow::Continue(())
    }

    fn pre_visit_expr(&mut self, expr: &Expr) -> ControlFlow<Self::Break> {
        match expr {
            Expr::Identifier(ident) => self.columns.push(ident.value.clone()),
            Expr::CompoundIdentifier(parts) => {
                if let Some(last) = parts.last() {
                    self.columns.push(last.value.clone());
                }
            }
            Expr::Function(function) => {
                if let Some(last) = function.name.0.last() {
                    self.functions.push(last.value.to_lowercase());
                }
            }
            Expr::BinaryOp { left, op, right } if is_comparison(op) => {
                self.note_literals([left.as_ref(), right.as_ref()]);
            }
            Expr::AnyOp { left, right, .. } | Expr::AllOp { left, right, .. } => {
                self.note_literals([left.as_ref(), right.as_ref()]);
            }
            Expr::InList { list, .. } => self.note_literals(list),
            Expr::Between { low, high, .. } => self.note_literals([low.as_ref(), high.as_ref()]),
            Expr::Like { pattern, .. }
            | Expr::ILike { pattern, .. }
            | Expr::SimilarTo { pattern, .. }
            | Expr::RLike { pattern, .. } => self.note_literals([pattern.as_ref()]),
            _ => {}
        }
        ControlFlow::Continue(())
    }
}

const fn is_comparison(op: &BinaryOperator) -> bool {
    matches!(
        op,
        BinaryOperator::Eq
            | BinaryOperator::NotEq
            | BinaryOperator::Lt
            | BinaryOperator::LtEq
            | BinaryOperator::Gt
            | BinaryOperator::GtEq
            | BinaryOperator::Spaceship
            | BinaryOperator::PGRegexMatch
            | BinaryOperator::PGRegexIMatch
            | BinaryOperator::PGRegexNotMatch
            | BinaryOperator::PGRegexNotIMatch
            | BinaryOperator::PGLikeMatch
            | BinaryOperator::PGILikeMatch
            | BinaryOperator::PGNotLikeMatch
            | BinaryOperator::PGNotILikeMatch
            | BinaryOperator::PGStartsWith
    )
}

/// Text of a string literal, looking through parentheses and casts
fn string_literal(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Nested(inner) | Expr::Cast { expr: inner, .. } => string_literal(inner),
        Expr::TypedString { value, .. } => Some(value.as_str()),
        Expr::Value(value) | Expr::IntroducedString { value, .. } => match value {
            Value::SingleQuotedString(text)
            | Value::DoubleQuotedString(text)
            | Value::EscapedStringLiteral(text)
            | Value::UnicodeStringLiteral(text)
            | Value::NationalStringLiteral(text)
            | Value::TripleSingleQuotedString(text)
            | Value::TripleDoubleQuotedString(text)
            | Value::SingleQuotedRawStringLiteral(text)
            | Value::DoubleQuotedRawStringLiteral(text) => Some(text.as_str()),
            Value::DollarQuotedString(dollar) => Some(dollar.value.as_str()),
            _ => None,
        },
        _ => None,
    }
}

fn is_denied_function(dialect: DatabaseType, name: &str) -> bool {
    let name = name.to_lowercase();
    let (exact, prefixes): (&[&str], &[&str]) = match dialect {
        DatabaseType::Postgres => (POSTGRES_DENIED_FUNCTIONS, POSTGRES_DENIED_PREFIXES),
        DatabaseType::MySQL => (MYSQL_DENIED_FUNCTIONS, &[]),
        DatabaseType::SQLite => (SQLITE_DENIED_FUNCTIONS, &[]),
    };

    DENIED_FUNCTIONS.contains(&name.as_str())
        || exact.contains(&name.as_str())
        || prefixes.iter().any(|prefix| name.starts_with(prefix))
}

fn parse(sql: &str, dialect: DatabaseType) -> Result<Vec<Statement>> {
    let parser_dialect: Box<dyn Dialect> = match dialect {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    };

    Parser::parse_sql(parser_dialect.as_ref(), sql).map_err(|e| {
        SqlaskError::validation_failed(format!(
            "Generated SQL is not valid {}: {e}",
            dialect.dialect_name()
        ))
    })
}

fn check_leading_keyword(blanked: &str) -> Result<()> {
    let leading = WORD_RE
        .find(blanked.trim_start_matches(|c: char| c.is_whitespace() || c == '('))
        .map(|m| m.as_str().to_uppercase())
        .unwrap_or_default();

    match leading.as_str() {
        "SELECT" | "WITH" => Ok(()),
        keyword if DESTRUCTIVE_LEADING.contains(&keyword) => {
            Err(SqlaskError::validation_failed(format!(
                "Destructive statement `{keyword}` is not allowed; only read-only SELECT queries can run"
            )))
        }
        "" => Err(SqlaskError::validation_failed("Generated SQL has no statement keyword")),
        keyword => Err(SqlaskError::validation_failed(format!(
            "Only SELECT or WITH queries are allowed, got `{keyword}`"
        ))),
    }
}

/// Reject any semicolon other than trailing ones
fn check_single_statement(blanked: &str) -> Result<()> {
    let body = blanked.trim_end().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if body.contains(';') {
        return Err(SqlaskError::validation_failed("Multiple statements are not allowed"));
    }
    Ok(())
}

fn check_write_keywords(blanked: &str, rules: QuoteRules) -> Result<()> {
    // Quoted identifiers are blanked too, so a column named "update" is not a keyword
    let unquoted = blank_quoted(blanked, false, rules);
    for word in WORD_RE.find_iter(&unquoted) {
        let upper = word.as_str().to_uppercase();
        if WRITE_KEYWORDS.contains(&upper.as_str()) {
            return Err(SqlaskError::validation_failed(format!(
                "Keyword `{upper}` is not allowed in a read-only query"
            )));
        }
    }
    Ok(())
}

fn check_injection_patterns(sql: &str) -> Result<()> {
    for caps in TAUTOLOGY_RE.captures_iter(sql) {
        if caps[1].eq_ignore_ascii_case(&caps[2]) {
            return Err(SqlaskError::validation_failed(format!(
                "Suspicious tautology `{}` in generated SQL",
                &caps[0]
            )));
        }
    }

    for (pattern, label) in INJECTION_PATTERNS.iter() {
        if pattern.is_match(sql) {
            return Err(SqlaskError::validation_failed(format!(
                "Suspicious fragment ({label}) in generated SQL"
            )));
        }
    }
    Ok(())
}

/// A string parameter value must never also appear inline as a literal
fn check_inline_parameter_values(sql: &str, query: &GeneratedQuery, rules: QuoteRules) -> Result<()> {
    let literals = string_literals(sql, rules);
    for (name, value) in &query.parameters {
        let Some(text) = value.as_str() else {
            continue;
        };
        if !text.is_empty() && literals.iter().any(|lit| lit == text) {
            return Err(SqlaskError::validation_failed(format!(
                "Value of parameter :{name} is also written inline; values must be bound"
            )));
        }
    }
    Ok(())
}

/// Strip SQL comments from query
///
/// Handles:
/// - Line comments: -- comment
/// - Block comments: /* comment */
///
/// Comment markers inside string literals are left alone.
fn strip_comments(sql: &str, rules: QuoteRules) -> String {
    let mut result = String::with_capacity(sql.len());
    for segment in segments(sql, rules) {
        match segment.kind {
            SegmentKind::Comment => result.push(' '),
            _ => result.push_str(&sql[segment.start..segment.end]),
        }
    }
    result
}

/// Replace the contents of quoted sections with spaces
///
/// With `literals_only`, only string literals are blanked; otherwise quoted identifiers
/// are blanked as well. Opening and closing delimiters are kept.
fn blank_quoted(sql: &str, literals_only: bool, rules: QuoteRules) -> String {
    let mut result = String::with_capacity(sql.len());

    for segment in segments(sql, rules) {
        let text = &sql[segment.start..segment.end];
        let blanks = segment.kind == SegmentKind::Literal
            || (!literals_only && segment.kind == SegmentKind::Identifier);
        if !blanks {
            result.push_str(text);
            continue;
        }

        let mut chars = text.chars();
        let open = chars.next();
        let close = chars.next_back();
        result.extend(open);
        result.extend(chars.map(|_| ' '));
        result.extend(close.map(|c| if matches!(c, '\'' | '"' | '`' | '$') { c } else { ' ' }));
    }

    result
}

/// Contents of string literals, unescaped
fn string_literals(sql: &str, rules: QuoteRules) -> Vec<String> {
    segments(sql, rules)
        .into_iter()
        .filter(|segment| segment.kind == SegmentKind::Literal)
        .map(|segment| unquote(&sql[segment.start..segment.end], rules))
        .collect()
}

fn unquote(literal: &str, rules: QuoteRules) -> String {
    if literal.starts_with('$') {
        // $tag$body$tag$
        let Some(open) = literal[1..].find('$') else {
            return String::new();
        };
        let tag = &literal[..open + 2];
        let body = &literal[tag.len()..];
        return body.strip_suffix(tag).unwrap_or(body).to_string();
    }

    let mut chars = literal.chars();
    let Some(quote) = chars.next() else {
        return String::new();
    };
    let mut text = String::new();
    let mut chars = chars.peekable();
    while let Some(ch) = chars.next() {
        if ch == '\\' && rules.backslash_escapes {
            text.extend(chars.next());
        } else if ch == quote {
            if chars.peek() == Some(&quote) {
                chars.next();
                text.push(quote);
            } else {
                break;
            }
        } else {
            text.push(ch);
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ColumnInfo, ForeignKeyInfo, TableDescriptor};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn schema(dialect: DatabaseType) -> SchemaDescriptor {
        let users = TableDescriptor::new(
            "users",
            vec![
                ColumnInfo::new("id", "INTEGER", false),
                ColumnInfo::new("name", "TEXT", false),
                ColumnInfo::new("email", "TEXT", true),
                ColumnInfo::new("updated_at", "TEXT", true),
            ],
        );
        let mut orders = TableDescriptor::new(
            "orders",
            vec![
                ColumnInfo::new("id", "INTEGER", false),
                ColumnInfo::new("user_id", "INTEGER", false),
                ColumnInfo::new("total", "REAL", false),
                ColumnInfo::new("status", "TEXT", false),
            ],
        );
        orders.foreign_keys = vec![ForeignKeyInfo {
            name: "fk_orders_user".to_string(),
            columns: vec!["user_id".to_string()],
            referenced_table: "users".to_string(),
            referenced_columns: vec!["id".to_string()],
            resolved: false,
            inferred: false,
        }];
        SchemaDescriptor::new(dialect, vec![users, orders], 0).unwrap()
    }

    fn check(sql: &str) -> Result<()> {
        validate(&GeneratedQuery::unparameterized(sql), &schema(DatabaseType::SQLite))
    }

    fn check_with(sql: &str, params: &[(&str, serde_json::Value)], dialect: DatabaseType) -> Result<()> {
        let parameters: BTreeMap<String, serde_json::Value> =
            params.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect();
        let query = GeneratedQuery::new(sql, parameters).unwrap();
        validate(&query, &schema(dialect))
    }

    fn rejected_with(sql: &str, needle: &str) {
        let err = check(sql).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR", "sql: {sql}");
        assert!(err.message().contains(needle), "sql: {sql}, message: {}", err.message());
    }

    // Preprocessing tests

    const SQLITE: QuoteRules = QuoteRules::for_dialect(DatabaseType::SQLite);

    #[test]
    fn test_strip_comments() {
        let result = strip_comments("SELECT * FROM users -- this is a comment\nWHERE id = 1", SQLITE);
        assert!(result.contains("WHERE"));
        assert!(!result.contains("this is a comment"));

        let result = strip_comments("SELECT * /* block comment */ FROM users", SQLITE);
        assert!(!result.contains("block comment"));

        let result = strip_comments("SELECT '-- not a comment' FROM users", SQLITE);
        assert!(result.contains("-- not a comment"));
    }

    #[test]
    fn test_blank_quoted() {
        assert_eq!(blank_quoted("SELECT 'drop' FROM t", true, SQLITE), "SELECT '    ' FROM t");
        assert_eq!(blank_quoted(r#"SELECT "delete" FROM t"#, true, SQLITE), r#"SELECT "delete" FROM t"#);
        assert_eq!(blank_quoted(r#"SELECT "delete" FROM t"#, false, SQLITE), r#"SELECT "      " FROM t"#);

        let mysql = QuoteRules::for_dialect(DatabaseType::MySQL);
        assert_eq!(blank_quoted(r"SELECT 'a\'; DROP' FROM t", true, mysql), "SELECT '         ' FROM t");
        let postgres = QuoteRules::for_dialect(DatabaseType::Postgres);
        assert_eq!(blank_quoted("SELECT $q$;drop$q$ FROM t", true, postgres), "SELECT $         $ FROM t");
    }

    #[test]
    fn test_string_literals() {
        assert_eq!(string_literals("WHERE a = 'x' AND b = 'it''s'", SQLITE), vec!["x", "it's"]);

        let mysql = QuoteRules::for_dialect(DatabaseType::MySQL);
        assert_eq!(string_literals(r#"WHERE a = 'O\'Brien' OR b = "c\\d""#, mysql), vec!["O'Brien", r"c\d"]);
        let postgres = QuoteRules::for_dialect(DatabaseType::Postgres);
        assert_eq!(string_literals("SELECT $tag$it's$tag$", postgres), vec!["it's"]);
    }

    // Accepted queries

    #[test]
    fn test_simple_select_accepted() {
        assert!(check("SELECT id, name FROM users").is_ok());
        assert!(check("  select * from USERS;  ").is_ok());
        assert!(check("SELECT u.name, o.total FROM users u JOIN orders o ON o.user_id = u.id").is_ok());
    }

    #[test]
    fn test_aliases_and_ctes_accepted() {
        assert!(check(
            "SELECT user_id, COUNT(*) AS order_count FROM orders GROUP BY user_id ORDER BY order_count DESC"
        )
        .is_ok());
        assert!(check(
            "WITH big AS (SELECT user_id, total FROM orders WHERE total > 100) \
             SELECT users.name, big.total FROM big JOIN users ON users.id = big.user_id"
        )
        .is_ok());
    }

    #[test]
    fn test_column_named_like_keyword_fragment() {
        assert!(check("SELECT updated_at FROM users").is_ok());
    }

    #[test]
    fn test_parameterized_query_accepted_per_dialect() {
        for dialect in [DatabaseType::Postgres, DatabaseType::MySQL, DatabaseType::SQLite] {
            let result = check_with(
                "SELECT id, name FROM users WHERE name = :name AND id > :min_id",
                &[("name", json!("Alice")), ("min_id", json!(3))],
                dialect,
            );
            assert!(result.is_ok(), "{dialect}: {result:?}");
        }
    }

    // Rejected queries

    #[test]
    fn test_destructive_leading_keywords_rejected() {
        for sql in [
            "DROP TABLE users",
            "drop table users;",
            "  \n\tDeLeTe FROM users",
            "UPDATE users SET name = 'x'",
            "INSERT INTO users (id) VALUES (1)",
            "ALTER TABLE users ADD COLUMN x INT",
            "TRUNCATE users",
            "/* hidden */ DROP TABLE users",
            "-- comment\nDROP TABLE users",
        ] {
            let err = check(sql).unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_ERROR", "sql: {sql}");
            assert!(err.message().contains("Destructive statement"), "sql: {sql}");
        }
    }

    #[test]
    fn test_other_leading_keywords_rejected() {
        rejected_with("PRAGMA table_info(users)", "Only SELECT or WITH");
        rejected_with("EXPLAIN SELECT * FROM users", "Only SELECT or WITH");
        rejected_with("", "empty");
        rejected_with("-- only a comment", "empty");
    }

    #[test]
    fn test_multiple_statements_rejected() {
        rejected_with("SELECT * FROM users; DROP TABLE users;", "Multiple statements");
        rejected_with("SELECT * FROM users; SELECT * FROM orders", "Multiple statements");
        // Semicolon inside a literal is fine
        assert!(check("SELECT 'a;b' AS label, id FROM users").is_ok());
    }

    #[test]
    fn test_embedded_writes_rejected() {
        rejected_with(
            "WITH gone AS (DELETE FROM users RETURNING id) SELECT * FROM gone",
            "DELETE",
        );
        rejected_with("SELECT * INTO backup FROM users", "INTO");
        // Keywords inside string literals are data, not statements
        assert!(check("SELECT 'drop table users' AS note FROM users").is_ok());
    }

    #[test]
    fn test_injection_patterns_rejected() {
        rejected_with("SELECT * FROM users WHERE name = 'x' OR 1=1", "tautology");
        rejected_with("SELECT * FROM users WHERE name = '' OR 'a'='a'", "tautology");
        rejected_with("SELECT id FROM users UNION SELECT NULL", "UNION SELECT NULL");
        rejected_with("SELECT name FROM users INTO OUTFILE '/tmp/x'", "INTO OUTFILE");
        rejected_with("SELECT LOAD_FILE('/etc/passwd')", "LOAD_FILE");
        rejected_with("SELECT pg_sleep(10)", "sleep");
        rejected_with("SELECT * FROM users WHERE xp_cmdshell", "xp_cmdshell");
    }

    #[test]
    fn test_inline_parameter_value_rejected() {
        let err = check_with(
            "SELECT * FROM users WHERE name = :name OR name = 'Alice'",
            &[("name", json!("Alice"))],
            DatabaseType::SQLite,
        )
        .unwrap_err();
        assert!(err.message().contains(":name"));
    }

    #[test]
    fn test_inline_literal_comparison_rejected_without_parameters() {
        for dialect in [DatabaseType::Postgres, DatabaseType::MySQL, DatabaseType::SQLite] {
            let err = check_with("SELECT id, name FROM users WHERE name = 'Alice'", &[], dialect).unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_ERROR", "{dialect}");
            assert!(err.message().contains("'Alice'"), "{dialect}: {}", err.message());
        }

        for sql in [
            "SELECT id FROM users WHERE 'Alice' <> name",
            "SELECT id FROM users WHERE name IN ('Alice', 'Bob')",
            "SELECT id FROM users WHERE name LIKE 'Al%'",
            "SELECT id FROM users WHERE updated_at BETWEEN '2024-01-01' AND '2024-12-31'",
            "SELECT id FROM users WHERE updated_at > CAST('2024-01-01' AS DATE)",
            "SELECT id FROM users WHERE (name = ('Alice'))",
        ] {
            rejected_with(sql, "values must be bound");
        }
    }

    #[test]
    fn test_literals_outside_comparisons_accepted() {
        assert!(check("SELECT name || ' <' || email || '>' AS contact FROM users").is_ok());
        assert!(check(
            "SELECT id, CASE WHEN total > 100 THEN 'large' ELSE 'small' END AS size FROM orders"
        )
        .is_ok());
        assert!(check("SELECT COALESCE(email, 'none') AS email FROM users WHERE id > 10").is_ok());
    }

    #[test]
    fn test_side_effect_functions_rejected_per_dialect() {
        let cases = [
            (DatabaseType::Postgres, "SELECT dblink_exec('dbname=app', 'DROP TABLE users') FROM users", "dblink_exec"),
            (DatabaseType::Postgres, "SELECT pg_terminate_backend(1234)", "pg_terminate_backend"),
            (DatabaseType::Postgres, "SELECT pg_catalog.pg_read_file('/etc/passwd')", "pg_read_file"),
            (
                DatabaseType::Postgres,
                "SELECT set_config('default_transaction_read_only', 'off', false)",
                "set_config",
            ),
            (DatabaseType::Postgres, "SELECT pg_advisory_lock(1), id FROM users", "pg_advisory_lock"),
            (DatabaseType::Postgres, "SELECT lo_export(1, '/tmp/out')", "lo_export"),
            (DatabaseType::MySQL, "SELECT GET_LOCK('x', 100000)", "get_lock"),
            (DatabaseType::MySQL, "SELECT id, RELEASE_ALL_LOCKS() FROM users", "release_all_locks"),
            (DatabaseType::SQLite, "SELECT readfile('/etc/passwd')", "readfile"),
            (DatabaseType::SQLite, "SELECT load_extension('/tmp/evil.so')", "load_extension"),
        ];

        for (dialect, sql, function) in cases {
            let err = validate(&GeneratedQuery::unparameterized(sql), &schema(dialect)).unwrap_err();
            assert_eq!(err.error_code(), "VALIDATION_ERROR", "{dialect}: {sql}");
            assert!(
                err.message().contains(&format!("`{function}()`")),
                "{dialect}: {sql}, message: {}",
                err.message()
            );
        }
    }

    #[test]
    fn test_ordinary_functions_accepted_per_dialect() {
        for dialect in [DatabaseType::Postgres, DatabaseType::MySQL, DatabaseType::SQLite] {
            let result = check_with(
                "SELECT user_id, COUNT(*) AS n, ROUND(AVG(total), 2) AS avg_total, MAX(LOWER(status)) AS s \
                 FROM orders WHERE total > :min GROUP BY user_id",
                &[("min", json!(10))],
                dialect,
            );
            assert!(result.is_ok(), "{dialect}: {result:?}");
        }
    }

    #[test]
    fn test_dialect_literals_do_not_hide_statements() {
        let mysql = check_with(
            r"SELECT 'it\'s; DROP TABLE users' AS note, id FROM users WHERE id = :id",
            &[("id", json!(1))],
            DatabaseType::MySQL,
        );
        assert!(mysql.is_ok(), "{mysql:?}");

        let postgres = check_with(
            "SELECT $$a; DELETE FROM users$$ AS note, id FROM users WHERE id = :id",
            &[("id", json!(1))],
            DatabaseType::Postgres,
        );
        assert!(postgres.is_ok(), "{postgres:?}");

        // Without backslash escapes the statement after the semicolon is real
        let sqlite = validate(
            &GeneratedQuery::unparameterized(r"SELECT 'x\'; DELETE FROM users; --' AS note FROM users"),
            &schema(DatabaseType::SQLite),
        );
        assert!(sqlite.is_err());
    }

    #[test]
    fn test_unknown_table_rejected_case_insensitive() {
        rejected_with("SELECT * FROM orders_v2", "unknown table `orders_v2`");
        assert!(check("SELECT * FROM Users").is_ok());
        assert!(check("SELECT * FROM main.users").is_ok());
    }

    #[test]
    fn test_table_qualifier_must_match_introspected_schema() {
        rejected_with("SELECT * FROM other_schema.users", "`other_schema.users` outside the introspected schema");
        rejected_with("SELECT * FROM temp.users", "outside the introspected schema");

        let mut postgres = schema(DatabaseType::Postgres);
        for table in &mut postgres.tables {
            table.schema = Some("public".to_string());
        }
        let check_pg = |sql: &str| validate(&GeneratedQuery::unparameterized(sql), &postgres);

        assert!(check_pg("SELECT id FROM public.users").is_ok());
        assert!(check_pg("SELECT id FROM PUBLIC.users").is_ok());
        assert!(check_pg("SELECT id FROM users").is_ok());
        assert!(check_pg("SELECT id FROM main.users").is_err());
        assert!(check_pg("SELECT id FROM audit.users").is_err());
        assert!(check_pg("SELECT id FROM otherdb.public.users").is_err());
    }

    #[test]
    fn test_unknown_column_rejected() {
        rejected_with("SELECT salary FROM users", "unknown column `salary`");
        rejected_with("SELECT u.salary FROM users u", "unknown column `salary`");
    }

    #[test]
    fn test_unparsable_sql_rejected() {
        rejected_with("SELECT id FROM users WHERE name = (", "not valid SQLite");
    }
}
