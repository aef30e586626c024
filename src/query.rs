//! Query and Intent
//!
//! The immutable question that enters the pipeline and the closed label set
//! used to route it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// A user question, fixed at pipeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub asked_at: DateTime<Utc>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            asked_at: Utc::now(),
        }
    }
}

/// Closed set of question intents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Intent {
    Lookup,
    Aggregation,
    Comparison,
    Trend,
    Report,
}

impl Intent {
    pub const ALL: [Intent; 5] = [
        Intent::Lookup,
        Intent::Aggregation,
        Intent::Comparison,
        Intent::Trend,
        Intent::Report,
    ];

    /// Label used when classification fails or yields an out-of-set label.
    pub const DEFAULT: Intent = Intent::Report;

    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Lookup => "LOOKUP",
            Intent::Aggregation => "AGGREGATION",
            Intent::Comparison => "COMPARISON",
            Intent::Trend => "TREND",
            Intent::Report => "REPORT",
        }
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let label = s.trim().trim_matches(|c: char| c == '"' || c == '\'' || c == '.');
        Intent::ALL
            .iter()
            .copied()
            .find(|intent| intent.as_str().eq_ignore_ascii_case(label))
            .ok_or_else(|| format!("unknown intent label '{}'", label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_intent_labels() {
        assert_eq!("trend".parse::<Intent>().unwrap(), Intent::Trend);
        assert_eq!(" \"LOOKUP\" ".parse::<Intent>().unwrap(), Intent::Lookup);
        assert!("FORECAST".parse::<Intent>().is_err());
    }

    #[test]
    fn test_intent_serializes_uppercase() {
        let json = serde_json::to_string(&Intent::Comparison).unwrap();
        assert_eq!(json, "\"COMPARISON\"");
    }
}
