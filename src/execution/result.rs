//! Execution Result
//!
//! Tabular rows as returned by the data store, plus the shape inspection the
//! KPI engine and chart selector both rely on.

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Category columns with more distinct values than this are not charted.
pub const MAX_CATEGORIES: usize = 50;

/// Integer columns with these names hold calendar numbers, not measures.
const CALENDAR_PARTS: &[&str] = &["year", "quarter", "month", "week", "day", "hour", "dow"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Scalar {
    pub fn is_null(&self) -> bool {
        matches!(self, Scalar::Null)
    }

    /// Numeric view; numeric-looking text counts since SQLite stores loosely.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(v) => Some(*v as f64),
            Scalar::Real(v) if v.is_finite() => Some(*v),
            Scalar::Text(t) => t.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
            _ => None,
        }
    }

    pub fn as_temporal(&self) -> Option<NaiveDateTime> {
        match self {
            Scalar::Text(t) => parse_temporal(t),
            _ => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("NULL"),
            Scalar::Integer(v) => write!(f, "{}", v),
            Scalar::Real(v) => write!(f, "{}", v),
            Scalar::Text(t) => f.write_str(t),
            Scalar::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// Parse the date and datetime text forms SQLite queries produce.
pub fn parse_temporal(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, format) {
            return Some(dt);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0);
    }
    // year-month buckets from strftime('%Y-%m', ...)
    if text.len() == 7 {
        if let Ok(date) = NaiveDate::parse_from_str(&format!("{}-01", text), "%Y-%m-%d") {
            return date.and_hms_opt(0, 0, 0);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Scalar>>,
    pub row_count: usize,
    /// True when the row cap cut the result short
    #[serde(default)]
    pub truncated: bool,
    pub duration_ms: u64,
}

/// What a result looks like, independent of its values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultShape {
    pub row_count: usize,
    pub time_column: Option<String>,
    pub category_column: Option<String>,
    pub measure_columns: Vec<String>,
}

impl ResultShape {
    pub fn has_measure(&self) -> bool {
        !self.measure_columns.is_empty()
    }
}

impl ExecutionResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Scalar>>) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            truncated: false,
            duration_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Scalar> {
        self.rows.iter().filter_map(move |row| row.get(idx))
    }

    /// Numeric values of a column, skipping nulls and non-numeric cells.
    pub fn numeric_values(&self, idx: usize) -> Vec<f64> {
        self.column_values(idx).filter_map(Scalar::as_f64).collect()
    }

    /// Every non-null cell is numeric, and there is at least one.
    pub fn is_numeric_column(&self, idx: usize) -> bool {
        let mut seen = false;
        for value in self.column_values(idx) {
            match value {
                Scalar::Null => continue,
                Scalar::Integer(_) | Scalar::Real(_) => seen = true,
                _ => return false,
            }
        }
        seen
    }

    pub fn is_temporal_column(&self, idx: usize) -> bool {
        let name = self.columns[idx].to_lowercase();
        let calendar_name = CALENDAR_PARTS
            .iter()
            .any(|p| name == *p || name.ends_with(&format!("_{}", p)));

        let mut seen = false;
        for value in self.column_values(idx) {
            match value {
                Scalar::Null => continue,
                Scalar::Text(t) if parse_temporal(t).is_some() => seen = true,
                // year, month or week numbers
                Scalar::Integer(_) if calendar_name => seen = true,
                _ => return false,
            }
        }
        seen
    }

    pub fn distinct_count(&self, idx: usize) -> usize {
        self.column_values(idx)
            .filter(|v| !v.is_null())
            .map(|v| v.to_string())
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn shape(&self) -> ResultShape {
        let time_idx = (0..self.columns.len()).find(|&i| self.is_temporal_column(i));

        let categories: Vec<usize> = (0..self.columns.len())
            .filter(|&i| Some(i) != time_idx)
            .filter(|&i| {
                let mut seen = false;
                for value in self.column_values(i) {
                    match value {
                        Scalar::Text(_) => seen = true,
                        Scalar::Null => {}
                        _ => return false,
                    }
                }
                seen
            })
            .filter(|&i| self.distinct_count(i) <= MAX_CATEGORIES)
            .collect();
        let category_idx = categories
            .iter()
            .copied()
            .find(|&i| self.distinct_count(i) < self.row_count)
            .or_else(|| categories.first().copied());

        let measure_columns = (0..self.columns.len())
            .filter(|&i| Some(i) != time_idx && self.is_numeric_column(i))
            .filter(|&i| !is_identifier_name(&self.columns[i]))
            .map(|i| self.columns[i].clone())
            .collect();

        ResultShape {
            row_count: self.row_count,
            time_column: time_idx.map(|i| self.columns[i].clone()),
            category_column: category_idx.map(|i| self.columns[i].clone()),
            measure_columns,
        }
    }
}

pub fn is_identifier_name(column: &str) -> bool {
    let lower = column.to_lowercase();
    lower == "id" || lower.ends_with("_id")
}
