//! Error Classifier
//!
//! Sorts data-store failures into a small taxonomy. The kind is recorded on
//! the attempt; the message plus hint is fed back to SQL generation.

use crate::error::AnalyticsError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Syntax,
    UnknownTable,
    UnknownColumn,
    Timeout,
    ReadOnlyViolation,
    Unavailable,
    Other,
}

impl fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExecutionErrorKind::Syntax => "syntax",
            ExecutionErrorKind::UnknownTable => "unknown_table",
            ExecutionErrorKind::UnknownColumn => "unknown_column",
            ExecutionErrorKind::Timeout => "timeout",
            ExecutionErrorKind::ReadOnlyViolation => "read_only_violation",
            ExecutionErrorKind::Unavailable => "unavailable",
            ExecutionErrorKind::Other => "other",
        };
        f.write_str(label)
    }
}

pub struct ErrorClassifier;

impl ErrorClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, error: &AnalyticsError) -> ExecutionErrorKind {
        if matches!(error, AnalyticsError::Timeout(_)) {
            return ExecutionErrorKind::Timeout;
        }

        let error_msg = error.to_string().to_lowercase();

        if error_msg.contains("no such table") {
            return ExecutionErrorKind::UnknownTable;
        }

        if error_msg.contains("no such column") || error_msg.contains("ambiguous column") {
            return ExecutionErrorKind::UnknownColumn;
        }

        if error_msg.contains("syntax error")
            || error_msg.contains("incomplete input")
            || error_msg.contains("unrecognized token")
            || error_msg.contains("no such function")
        {
            return ExecutionErrorKind::Syntax;
        }

        if error_msg.contains("readonly") || error_msg.contains("read-only") || error_msg.contains("not read-only") {
            return ExecutionErrorKind::ReadOnlyViolation;
        }

        if error_msg.contains("interrupted") || error_msg.contains("timed out") {
            return ExecutionErrorKind::Timeout;
        }

        if error_msg.contains("unable to open")
            || error_msg.contains("locked")
            || error_msg.contains("busy")
            || error_msg.contains("disk i/o")
            || error_msg.contains("not a database")
            || error_msg.contains("unreachable")
        {
            return ExecutionErrorKind::Unavailable;
        }

        ExecutionErrorKind::Other
    }

    /// Correction hint appended to the retry feedback.
    pub fn hint(&self, kind: ExecutionErrorKind) -> &'static str {
        match kind {
            ExecutionErrorKind::Syntax => "Rewrite the statement using SQLite syntax and functions only.",
            ExecutionErrorKind::UnknownTable => "Use only tables listed in the schema.",
            ExecutionErrorKind::UnknownColumn => {
                "Check every column against its table in the schema and qualify columns with the table alias."
            }
            ExecutionErrorKind::Timeout => "Simplify the query: filter earlier, aggregate, and avoid cross joins.",
            ExecutionErrorKind::ReadOnlyViolation => "Only a single read-only SELECT statement is allowed.",
            ExecutionErrorKind::Unavailable | ExecutionErrorKind::Other => "",
        }
    }

    pub fn feedback(&self, error: &AnalyticsError) -> (ExecutionErrorKind, String) {
        let kind = self.classify(error);
        let hint = self.hint(kind);
        let message = if hint.is_empty() {
            error.to_string()
        } else {
            format!("{} {}", error, hint)
        };
        (kind, message)
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new()
    }
}
