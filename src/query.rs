//! Generated queries and dialect parameter binding
//!
//! The LLM writes SQL with named `:name` placeholders. Before execution the template is
//! rewritten into the driver's positional form (`$n` for `PostgreSQL`, `?` for `MySQL`
//! and `SQLite`) with values in matching order. Values are never spliced into SQL text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::engine::DatabaseType;
use crate::error::{Result, SqlaskError};

/// SQL template plus named parameter values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedQuery {
    /// SQL containing `:name` placeholders
    pub sql: String,

    /// Placeholder name -> scalar JSON value
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

/// Positional rendering of a [`GeneratedQuery`] for one dialect
#[derive(Debug, Clone, PartialEq)]
pub struct BoundQuery {
    /// SQL with positional placeholders
    pub sql: String,

    /// Values in placeholder order
    pub values: Vec<Value>,
}

/// A placeholder occurrence in a SQL template
#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    name: String,
    start: usize,
    end: usize,
}

impl GeneratedQuery {
    /// Build a query, rejecting non-scalar values and placeholder/parameter mismatches
    ///
    /// Literals are scanned with [`QuoteRules::PORTABLE`]; use [`GeneratedQuery::for_dialect`]
    /// when the target dialect is known.
    pub fn new(sql: impl Into<String>, parameters: BTreeMap<String, Value>) -> Result<Self> {
        Self::build(sql.into(), parameters, QuoteRules::PORTABLE)
    }

    /// Build a query whose literals follow one dialect's quoting rules
    pub fn for_dialect(
        sql: impl Into<String>,
        parameters: BTreeMap<String, Value>,
        dialect: DatabaseType,
    ) -> Result<Self> {
        Self::build(sql.into(), parameters, QuoteRules::for_dialect(dialect))
    }

    fn build(sql: String, parameters: BTreeMap<String, Value>, rules: QuoteRules) -> Result<Self> {
        let query = Self { sql, parameters };

        if query.sql.trim().is_empty() {
            return Err(SqlaskError::generation_failed("Generated SQL is empty"));
        }

        if let Some((name, _)) = query.parameters.iter().find(|(_, v)| !is_scalar(v)) {
            return Err(SqlaskError::generation_failed(format!(
                "Parameter '{name}' must be a scalar value (string, number, boolean or null)"
            )));
        }

        query.check_placeholders(rules).map_err(|e| match e {
            SqlaskError::ExecutionFailed { detail, .. } => SqlaskError::generation_failed(detail),
            other => other,
        })?;

        Ok(query)
    }

    /// Query without parameters
    #[must_use]
    pub fn unparameterized(sql: impl Into<String>) -> Self {
        Self { sql: sql.into(), parameters: BTreeMap::new() }
    }

    /// Distinct placeholder names, in order of first appearance
    #[must_use]
    pub fn placeholder_names(&self) -> Vec<String> {
        self.names_with(QuoteRules::PORTABLE)
    }

    fn names_with(&self, rules: QuoteRules) -> Vec<String> {
        let mut seen = BTreeSet::new();
        scan_placeholders(&self.sql, rules)
            .into_iter()
            .filter(|p| seen.insert(p.name.clone()))
            .map(|p| p.name)
            .collect()
    }

    /// Check that placeholders and parameters name exactly the same set
    fn check_placeholders(&self, rules: QuoteRules) -> Result<()> {
        let names: BTreeSet<String> = self.names_with(rules).into_iter().collect();
        let keys: BTreeSet<String> = self.parameters.keys().cloned().collect();

        let missing: Vec<&String> = names.difference(&keys).collect();
        if !missing.is_empty() {
            return Err(SqlaskError::binding_failed(format!(
                "No value supplied for placeholder(s): {}",
                join_names(&missing)
            )));
        }

        let unused: Vec<&String> = keys.difference(&names).collect();
        if !unused.is_empty() {
            return Err(SqlaskError::binding_failed(format!(
                "Parameter(s) not referenced by the SQL: {}",
                join_names(&unused)
            )));
        }

        Ok(())
    }

    /// Rewrite the template for a dialect's positional placeholder syntax
    ///
    /// `PostgreSQL` reuses `$n` for repeated names; `MySQL` and `SQLite` get one `?` per
    /// occurrence with the value repeated.
    pub fn bind(&self, dialect: DatabaseType) -> Result<BoundQuery> {
        self.check_placeholders(QuoteRules::for_dialect(dialect))?;
        Ok(self.positional(dialect))
    }

    /// Positional rendering without the placeholder/parameter check
    pub(crate) fn positional(&self, dialect: DatabaseType) -> BoundQuery {
        let placeholders = scan_placeholders(&self.sql, QuoteRules::for_dialect(dialect));
        let mut sql = String::with_capacity(self.sql.len());
        let mut values = Vec::new();
        let mut positions: BTreeMap<&str, usize> = BTreeMap::new();
        let mut cursor = 0;

        for placeholder in &placeholders {
            sql.push_str(&self.sql[cursor..placeholder.start]);
            cursor = placeholder.end;

            let value = self.parameters.get(&placeholder.name).cloned().unwrap_or(Value::Null);
            match dialect {
                DatabaseType::Postgres => {
                    let next = positions.len() + 1;
                    let position = *positions.entry(placeholder.name.as_str()).or_insert_with(|| {
                        values.push(value);
                        next
                    });
                    sql.push('$');
                    sql.push_str(&position.to_string());
                }
                DatabaseType::MySQL | DatabaseType::SQLite => {
                    values.push(value);
                    sql.push('?');
                }
            }
        }
        sql.push_str(&self.sql[cursor..]);

        BoundQuery { sql, values }
    }
}

fn join_names(names: &[&String]) -> String {
    names.iter().map(|n| format!(":{n}")).collect::<Vec<_>>().join(", ")
}

/// Whether a JSON value is usable as a bound parameter
#[must_use]
pub fn is_scalar(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// How a dialect delimits string literals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteRules {
    /// `\'` and `\\` escape inside every string literal (`MySQL`)
    pub backslash_escapes: bool,

    /// `E'...'` literals use backslash escapes (`PostgreSQL`)
    pub escape_prefix: bool,

    /// `$tag$ ... $tag$` bodies are literals (`PostgreSQL`)
    pub dollar_quotes: bool,

    /// `"..."` is a string literal rather than an identifier (`MySQL`)
    pub double_quoted_strings: bool,
}

impl QuoteRules {
    /// Rules used when the dialect is unknown
    ///
    /// Backslash escapes and dollar quotes are both honoured, so a placeholder after
    /// either construct is still found.
    pub const PORTABLE: Self = Self {
        backslash_escapes: true,
        escape_prefix: true,
        dollar_quotes: true,
        double_quoted_strings: false,
    };

    #[must_use]
    pub const fn for_dialect(dialect: DatabaseType) -> Self {
        match dialect {
            DatabaseType::Postgres => Self {
                backslash_escapes: false,
                escape_prefix: true,
                dollar_quotes: true,
                double_quoted_strings: false,
            },
            DatabaseType::MySQL => Self {
                backslash_escapes: true,
                escape_prefix: false,
                dollar_quotes: false,
                double_quoted_strings: true,
            },
            DatabaseType::SQLite => Self {
                backslash_escapes: false,
                escape_prefix: false,
                dollar_quotes: false,
                double_quoted_strings: false,
            },
        }
    }
}

/// Lexical class of a span of SQL text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentKind {
    Code,
    Literal,
    Identifier,
    Comment,
}

/// A byte range of SQL text with its lexical class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Segment {
    pub kind: SegmentKind,
    pub start: usize,
    pub end: usize,
}

/// Split SQL into code, string literals, quoted identifiers and comments
///
/// Unterminated literals and comments run to the end of the text. Line comments stop
/// before their newline.
pub(crate) fn segments(sql: &str, rules: QuoteRules) -> Vec<Segment> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        let (kind, end) = match bytes[i] {
            b'\'' => {
                let backslash =
                    rules.backslash_escapes || (rules.escape_prefix && escape_prefixed(bytes, i));
                (SegmentKind::Literal, quoted_end(bytes, i, backslash))
            }
            b'"' if rules.double_quoted_strings => {
                (SegmentKind::Literal, quoted_end(bytes, i, rules.backslash_escapes))
            }
            b'"' | b'`' => (SegmentKind::Identifier, quoted_end(bytes, i, false)),
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map_or(bytes.len(), |n| i + n);
                (SegmentKind::Comment, end)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let end = sql[i + 2..].find("*/").map_or(bytes.len(), |n| i + 2 + n + 2);
                (SegmentKind::Comment, end)
            }
            b'$' if rules.dollar_quotes => match dollar_tag(sql, i) {
                Some(tag) => {
                    let body = i + tag.len();
                    let end = sql[body..].find(tag).map_or(bytes.len(), |n| body + n + tag.len());
                    (SegmentKind::Literal, end)
                }
                None => {
                    i += 1;
                    continue;
                }
            },
            _ => {
                i += 1;
                continue;
            }
        };

        if code_start < i {
            found.push(Segment { kind: SegmentKind::Code, start: code_start, end: i });
        }
        found.push(Segment { kind, start: i, end });
        i = end;
        code_start = end;
    }

    if code_start < bytes.len() {
        found.push(Segment { kind: SegmentKind::Code, start: code_start, end: bytes.len() });
    }
    found
}

const fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// `E'...'` with the `E` not part of a longer word
fn escape_prefixed(bytes: &[u8], quote: usize) -> bool {
    quote >= 1
        && matches!(bytes[quote - 1], b'E' | b'e')
        && (quote < 2 || !is_ident_byte(bytes[quote - 2]))
}

/// End (exclusive) of the quoted section opening at `start`
fn quoted_end(bytes: &[u8], start: usize, backslash: bool) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if backslash => i += 2,
            b if b == quote => {
                // doubled quote is an escape
                if bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                } else {
                    return i + 1;
                }
            }
            _ => i += 1,
        }
    }
    bytes.len()
}

/// The `$tag$` opening delimiter at `start`, if any
fn dollar_tag(sql: &str, start: usize) -> Option<&str> {
    let bytes = sql.as_bytes();
    if start > 0 && is_ident_byte(bytes[start - 1]) {
        return None;
    }
    let mut i = start + 1;
    if bytes.get(i).is_some_and(u8::is_ascii_digit) {
        return None;
    }
    while bytes.get(i).is_some_and(|b| b.is_ascii_alphanumeric() || *b == b'_') {
        i += 1;
    }
    (bytes.get(i) == Some(&b'$')).then(|| &sql[start..=i])
}

/// Find `:name` placeholders outside literals, quoted identifiers, comments and `::` casts
fn scan_placeholders(sql: &str, rules: QuoteRules) -> Vec<Placeholder> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();

    for segment in segments(sql, rules).into_iter().filter(|s| s.kind == SegmentKind::Code) {
        let mut i = segment.start;
        while i < segment.end {
            match bytes[i] {
                b':' if bytes.get(i + 1) == Some(&b':') => i += 2,
                b':' if bytes.get(i + 1).is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_') => {
                    let start = i;
                    i += 1;
                    while i < segment.end && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                        i += 1;
                    }
                    found.push(Placeholder { name: sql[start + 1..i].to_string(), start, end: i });
                }
                _ => i += 1,
            }
        }
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_placeholder_names_in_order() {
        let query = GeneratedQuery::unparameterized(
            "SELECT * FROM orders WHERE status = :status AND total > :min AND status <> :status",
        );
        assert_eq!(query.placeholder_names(), vec!["status", "min"]);
    }

    #[test]
    fn test_placeholders_ignored_in_literals_comments_and_casts() {
        let query = GeneratedQuery::unparameterized(
            "SELECT created_at::date, ':not_me', \":nor_me\" -- :comment\n\
             FROM t /* :block */ WHERE name = :name AND note = 'it''s :quoted'",
        );
        assert_eq!(query.placeholder_names(), vec!["name"]);
    }

    #[test]
    fn test_new_rejects_mismatches() {
        let missing = GeneratedQuery::new("SELECT * FROM users WHERE name = :name", BTreeMap::new());
        assert!(matches!(missing, Err(SqlaskError::GenerationFailed(_))));

        let unused = GeneratedQuery::new(
            "SELECT * FROM users",
            params(&[("name", json!("Alice"))]),
        );
        let err = unused.unwrap_err();
        assert!(err.message().contains(":name"));

        let nested = GeneratedQuery::new(
            "SELECT * FROM users WHERE id = :ids",
            params(&[("ids", json!([1, 2]))]),
        );
        assert!(nested.unwrap_err().message().contains("scalar"));

        assert!(GeneratedQuery::new("   ", BTreeMap::new()).is_err());
    }

    #[test]
    fn test_bind_postgres_reuses_positions() {
        let query = GeneratedQuery::new(
            "SELECT * FROM t WHERE a = :x OR b = :y OR c = :x",
            params(&[("x", json!(1)), ("y", json!("two"))]),
        )
        .unwrap();

        let bound = query.bind(DatabaseType::Postgres).unwrap();
        assert_eq!(bound.sql, "SELECT * FROM t WHERE a = $1 OR b = $2 OR c = $1");
        assert_eq!(bound.values, vec![json!(1), json!("two")]);
    }

    #[test]
    fn test_bind_question_marks_repeat_values() {
        let query = GeneratedQuery::new(
            "SELECT * FROM t WHERE a = :x OR b = :y OR c = :x",
            params(&[("x", json!(1)), ("y", json!(null))]),
        )
        .unwrap();

        for dialect in [DatabaseType::MySQL, DatabaseType::SQLite] {
            let bound = query.bind(dialect).unwrap();
            assert_eq!(bound.sql, "SELECT * FROM t WHERE a = ? OR b = ? OR c = ?");
            assert_eq!(bound.values, vec![json!(1), json!(null), json!(1)]);
        }
    }

    #[test]
    fn test_bind_mismatch_is_binding_error() {
        let query = GeneratedQuery {
            sql: "SELECT * FROM users WHERE id = :id".to_string(),
            parameters: BTreeMap::new(),
        };
        let err = query.bind(DatabaseType::SQLite).unwrap_err();
        assert_eq!(err.execution_kind(), Some(crate::error::ExecutionErrorKind::Binding));
    }

    #[test]
    fn test_backslash_escaped_quote_keeps_later_placeholder() {
        let query = GeneratedQuery::new(
            "SELECT id FROM users WHERE name = 'O\\'Brien' AND id = :id",
            params(&[("id", json!(1))]),
        )
        .unwrap();

        let bound = query.bind(DatabaseType::MySQL).unwrap();
        assert_eq!(bound.sql, "SELECT id FROM users WHERE name = 'O\\'Brien' AND id = ?");
        assert_eq!(bound.values, vec![json!(1)]);

        // No backslash escapes in SQLite: the second quote opens an unterminated literal
        let sqlite = GeneratedQuery::for_dialect(
            query.sql.clone(),
            params(&[("id", json!(1))]),
            DatabaseType::SQLite,
        );
        assert!(sqlite.unwrap_err().message().contains(":id"));
    }

    #[test]
    fn test_postgres_dollar_and_escape_strings() {
        let query = GeneratedQuery::for_dialect(
            "SELECT $$it's :not_me$$ AS a, $tag$ :nor_me $tag$ AS b, E'x\\' :still_not' AS c \
             FROM t WHERE id = :id AND price::numeric > :min",
            params(&[("id", json!(7)), ("min", json!(1.5))]),
            DatabaseType::Postgres,
        )
        .unwrap();

        let bound = query.bind(DatabaseType::Postgres).unwrap();
        assert_eq!(
            bound.sql,
            "SELECT $$it's :not_me$$ AS a, $tag$ :nor_me $tag$ AS b, E'x\\' :still_not' AS c \
             FROM t WHERE id = $1 AND price::numeric > $2"
        );
    }

    #[test]
    fn test_mysql_double_quotes_are_literals() {
        let rules = QuoteRules::for_dialect(DatabaseType::MySQL);
        let kinds: Vec<SegmentKind> =
            segments("SELECT \"a\\\"b\", `c` -- x\n", rules).iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Code,
                SegmentKind::Literal,
                SegmentKind::Code,
                SegmentKind::Identifier,
                SegmentKind::Code,
                SegmentKind::Comment,
                SegmentKind::Code,
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_placeholder_after_any_literal(text in "[a-zA-Z0-9 ':;$\\\\-]{0,16}") {
            let mysql = format!(
                "SELECT id FROM t WHERE note <> '{}' AND id = :id",
                text.replace('\\', "\\\\").replace('\'', "\\'")
            );
            let standard = format!(
                "SELECT id FROM t WHERE note <> '{}' AND id = :id",
                text.replace('\'', "''")
            );

            let q = GeneratedQuery::for_dialect(mysql, params(&[("id", json!(1))]), DatabaseType::MySQL);
            prop_assert!(q.is_ok(), "{:?}", q);
            for dialect in [DatabaseType::SQLite, DatabaseType::Postgres] {
                let q = GeneratedQuery::for_dialect(standard.clone(), params(&[("id", json!(1))]), dialect);
                prop_assert!(q.is_ok(), "{}: {:?}", dialect, q);
            }
        }

        #[test]
        fn prop_bound_arity_matches(names in proptest::collection::vec("[a-z][a-z0-9_]{0,6}", 0..6)) {
            let sql = format!(
                "SELECT * FROM t WHERE 1 = 1{}",
                names.iter().map(|n| format!(" AND c = :{n}")).collect::<String>()
            );
            let parameters = names.iter().map(|n| (n.clone(), json!(n))).collect();
            let query = GeneratedQuery::new(sql, parameters).unwrap();

            let sqlite = query.bind(DatabaseType::SQLite).unwrap();
            prop_assert_eq!(sqlite.sql.matches('?').count(), sqlite.values.len());
            prop_assert_eq!(sqlite.values.len(), names.len());

            let postgres = query.bind(DatabaseType::Postgres).unwrap();
            prop_assert_eq!(postgres.values.len(), query.placeholder_names().len());
            prop_assert!(!postgres.sql.contains(':'));
        }
    }
}
