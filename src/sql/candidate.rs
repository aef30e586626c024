use crate::execution::ExecutionErrorKind;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why the validator refused a statement. Closed set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    Empty,
    TooLong { length: usize, limit: usize },
    MutatingKeyword { keyword: String },
    MultipleStatements,
    NotAQuery { first_word: String },
    UnknownTable { table: String },
    UnknownColumn {
        table: String,
        column: String,
        suggestion: Option<String>,
    },
    Malformed { detail: String },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::Empty => write!(f, "Empty SQL query"),
            RejectionReason::TooLong { length, limit } => {
                write!(f, "Statement is {} characters long; the limit is {}", length, limit)
            }
            RejectionReason::MutatingKeyword { keyword } => write!(
                f,
                "Forbidden keyword detected: {}. Only SELECT queries allowed.",
                keyword
            ),
            RejectionReason::MultipleStatements => {
                write!(f, "Only a single statement is allowed")
            }
            RejectionReason::NotAQuery { first_word } => {
                write!(f, "Query must start with SELECT or WITH. Got: {}", first_word)
            }
            RejectionReason::UnknownTable { table } => {
                write!(f, "Table '{}' does not exist in the schema", table)
            }
            RejectionReason::UnknownColumn {
                table,
                column,
                suggestion,
            } => {
                write!(f, "Column '{}' does not exist on table '{}'", column, table)?;
                if let Some(suggestion) = suggestion {
                    write!(f, " (did you mean '{}'?)", suggestion)?;
                }
                Ok(())
            }
            RejectionReason::Malformed { detail } => write!(f, "Statement could not be read: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Unchecked,
    Accepted,
    Rejected { reason: RejectionReason },
}

/// One proposed statement. Each retry produces a new candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlCandidate {
    pub attempt: u32,
    pub statement: String,
    pub verdict: Verdict,
}

impl SqlCandidate {
    pub fn new(attempt: u32, statement: impl Into<String>) -> Self {
        Self {
            attempt,
            statement: statement.into(),
            verdict: Verdict::Unchecked,
        }
    }

    pub fn with_verdict(self, verdict: Verdict) -> Self {
        Self { verdict, ..self }
    }

    pub fn is_accepted(&self) -> bool {
        self.verdict == Verdict::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttemptOutcome {
    GenerationFailed { message: String },
    Rejected { reason: RejectionReason },
    ExecutionFailed { kind: ExecutionErrorKind, message: String },
    Succeeded { row_count: usize },
}

/// Diagnostic record of one pass through the generate/validate/execute loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub candidate: Option<SqlCandidate>,
    pub executed_statement: Option<String>,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    pub fn failure_reason(&self) -> Option<String> {
        match &self.outcome {
            AttemptOutcome::GenerationFailed { message } => Some(message.clone()),
            AttemptOutcome::Rejected { reason } => Some(reason.to_string()),
            AttemptOutcome::ExecutionFailed { message, .. } => Some(message.clone()),
            AttemptOutcome::Succeeded { .. } => None,
        }
    }
}
