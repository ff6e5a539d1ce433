//! Screening of the user's question before any connection is opened

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::error::{Result, SqlaskError};

/// Shortest accepted question, in characters after trimming
pub const MIN_QUESTION_CHARS: usize = 3;

/// Longest accepted question, in characters after trimming
pub const MAX_QUESTION_CHARS: usize = 1000;

/// SQL fragments that have no business in a plain-language question
static DANGEROUS_QUESTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i);\s*(drop|delete|truncate|alter|create|insert|update)\s+",
        r"--",
        r"(?is)/\*.*\*/",
        r"(?i)xp_cmdshell",
        r"(?i)sp_executesql",
        r"(?i)'\s*(or|and)\s*'",
        r"(?i)'\s*(or|and)\s*\d+\s*=\s*\d+",
        r"(?i)'\s*or\s+true",
        r"(?i)union\s+select",
        r"(?i)'\s*;\s*exec",
        r"(?i)'\s*;\s*declare",
        r"(?i)into\s+outfile",
        r"(?i)load_file\s*\(",
    ])
    .unwrap()
});

/// Reject empty, too short, too long or SQL-laden questions
///
/// Returns the trimmed question.
pub fn validate_question(question: &str) -> Result<&str> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return Err(SqlaskError::invalid_input("Question cannot be empty"));
    }

    let chars = trimmed.chars().count();
    if chars < MIN_QUESTION_CHARS {
        return Err(SqlaskError::invalid_input(format!(
            "Question must be at least {MIN_QUESTION_CHARS} characters long"
        )));
    }
    if chars > MAX_QUESTION_CHARS {
        return Err(SqlaskError::invalid_input(format!(
            "Question is too long (maximum {MAX_QUESTION_CHARS} characters)"
        )));
    }

    if DANGEROUS_QUESTION_PATTERNS.is_match(trimmed) {
        tracing::warn!(chars, "question rejected for embedded SQL");
        return Err(SqlaskError::invalid_input("Question contains potentially dangerous SQL patterns"));
    }

    Ok(trimmed)
}
