//! Dialect Normalizer
//!
//! Rewrites the PostgreSQL and MySQL idioms models habitually emit into the
//! SQLite equivalents. Purely lexical: unknown constructs pass through, and
//! nothing that starts inside a quoted string literal is rewritten.

use crate::sql::candidate::SqlCandidate;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::debug;

const MAX_PASSES: usize = 4;

lazy_static! {
    static ref INTERVAL_RE: Regex = Regex::new(
        r"(?i)(NOW\(\s*\)|CURRENT_TIMESTAMP|CURRENT_DATE|DATE\('now'\)|DATETIME\('now'\)|[A-Za-z_][A-Za-z0-9_.]*)\s*([-+])\s*INTERVAL\s*'?\s*(\d+)\s*'?\s*(day|hour|minute|second|week|month|year)s?\b\s*'?"
    )
    .expect("interval pattern");
    static ref DATE_SHIFT_RE: Regex = Regex::new(
        r"(?i)\bDATE_(SUB|ADD)\s*\(\s*(NOW\(\s*\)|CURDATE\(\s*\)|CURRENT_TIMESTAMP|CURRENT_DATE|[A-Za-z_][A-Za-z0-9_.]*)\s*,\s*INTERVAL\s*'?\s*(\d+)\s*'?\s*(day|hour|minute|second|week|month|year)s?\b\s*'?\s*\)"
    )
    .expect("date shift pattern");
    static ref EXTRACT_RE: Regex = Regex::new(
        r"(?i)\bEXTRACT\s*\(\s*(YEAR|MONTH|DAY|HOUR|MINUTE|SECOND|DOW|DOY|WEEK|QUARTER|EPOCH)\s+FROM\s+((?:[^()]|\([^()]*\))+?)\s*\)"
    )
    .expect("extract pattern");
    static ref DATE_TRUNC_RE: Regex = Regex::new(
        r"(?i)\bDATE_TRUNC\s*\(\s*'(hour|day|week|month|year)'\s*,\s*((?:[^()]|\([^()]*\))+?)\s*\)"
    )
    .expect("date_trunc pattern");
    static ref CAST_RE: Regex = Regex::new(
        r"(\b[A-Za-z_0-9][A-Za-z0-9_.]*|'[^']*'|\))\s*::\s*([A-Za-z_]+)(?:\s*\(\s*\d+(?:\s*,\s*\d+)?\s*\))?"
    )
    .expect("cast pattern");
    static ref NOW_RE: Regex = Regex::new(r"(?i)\bNOW\s*\(\s*\)").expect("now pattern");
    static ref CURRENT_TIMESTAMP_RE: Regex =
        Regex::new(r"(?i)\bCURRENT_TIMESTAMP\b(?:\s*\(\s*\))?").expect("current_timestamp pattern");
    static ref CURDATE_RE: Regex = Regex::new(r"(?i)\bCURDATE\s*\(\s*\)").expect("curdate pattern");
    static ref ILIKE_RE: Regex = Regex::new(r"(?i)\bILIKE\b").expect("ilike pattern");
    static ref BOOL_CAST_RE: Regex = Regex::new(r"(?i)\bAS\s+BOOL(?:EAN)?\b").expect("bool cast pattern");
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DialectNormalizer;

impl DialectNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Rewrite to a fixed point, so normalizing twice equals normalizing once.
    pub fn normalize(&self, sql: &str) -> String {
        let mut current = sql.to_string();
        for _ in 0..MAX_PASSES {
            let (next, applied) = self.rewrite_once(&current);
            if applied.is_empty() {
                break;
            }
            debug!("Dialect rewrites applied: {:?}", applied);
            current = next;
        }
        current
    }

    /// Same attempt and verdict, rewritten statement.
    pub fn normalize_candidate(&self, candidate: &SqlCandidate) -> SqlCandidate {
        SqlCandidate {
            statement: self.normalize(&candidate.statement),
            ..candidate.clone()
        }
    }

    fn rewrite_once(&self, sql: &str) -> (String, Vec<&'static str>) {
        let mut applied = Vec::new();
        let mut text = sql.to_string();

        // interval arithmetic must see NOW() before it is rewritten
        let rules: [(&'static str, &Regex, fn(&Captures) -> String); 10] = [
            ("interval", &INTERVAL_RE, rewrite_interval),
            ("date_shift", &DATE_SHIFT_RE, rewrite_date_shift),
            ("extract", &EXTRACT_RE, rewrite_extract),
            ("date_trunc", &DATE_TRUNC_RE, rewrite_date_trunc),
            ("cast", &CAST_RE, rewrite_cast),
            ("now", &NOW_RE, |_| "datetime('now')".to_string()),
            ("current_timestamp", &CURRENT_TIMESTAMP_RE, |_| "datetime('now')".to_string()),
            ("curdate", &CURDATE_RE, |_| "DATE('now')".to_string()),
            ("ilike", &ILIKE_RE, |_| "LIKE".to_string()),
            ("bool_cast", &BOOL_CAST_RE, |_| "AS INTEGER".to_string()),
        ];

        for (name, pattern, rewrite) in rules {
            if pattern.is_match(&text) {
                let literals = literal_spans(&text);
                let next = pattern
                    .replace_all(&text, |caps: &Captures| match caps.get(0) {
                        Some(m) if inside_literal(&literals, m.start()) => m.as_str().to_string(),
                        _ => rewrite(caps),
                    })
                    .into_owned();
                if next != text {
                    applied.push(name);
                    text = next;
                }
            }
        }
        (text, applied)
    }
}

/// Byte offsets of the opening and closing quote of every `'...'` literal.
/// A doubled quote inside a literal is an escape; an unterminated literal
/// runs to the end of the text.
fn literal_spans(sql: &str) -> Vec<(usize, usize)> {
    let bytes = sql.as_bytes();
    let mut spans = Vec::new();
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] != b'\'' {
            idx += 1;
            continue;
        }
        let open = idx;
        idx += 1;
        loop {
            match bytes.get(idx) {
                None => {
                    spans.push((open, bytes.len()));
                    break;
                }
                Some(b'\'') if bytes.get(idx + 1) == Some(&b'\'') => idx += 2,
                Some(b'\'') => {
                    spans.push((open, idx));
                    idx += 1;
                    break;
                }
                Some(_) => idx += 1,
            }
        }
    }
    spans
}

fn inside_literal(spans: &[(usize, usize)], pos: usize) -> bool {
    spans.iter().any(|&(open, close)| pos > open && pos < close)
}

fn modifier(sign: &str, amount: &str, unit: &str) -> String {
    let unit = unit.to_ascii_lowercase();
    let amount: u64 = amount.parse().unwrap_or(0);
    let (amount, unit) = if unit == "week" {
        (amount * 7, "day".to_string())
    } else {
        (amount, unit)
    };
    format!("'{}{} {}s'", sign, amount, unit)
}

fn shifted(anchor: &str, modifier: String) -> String {
    let upper = anchor.to_ascii_uppercase();
    if upper == "CURRENT_DATE" || upper.starts_with("DATE(") || upper.starts_with("CURDATE") {
        format!("DATE('now', {})", modifier)
    } else if upper.starts_with("NOW") || upper == "CURRENT_TIMESTAMP" || upper.starts_with("DATETIME(") {
        format!("datetime('now', {})", modifier)
    } else {
        format!("datetime({}, {})", anchor, modifier)
    }
}

fn rewrite_interval(caps: &Captures) -> String {
    shifted(&caps[1], modifier(&caps[2], &caps[3], &caps[4]))
}

fn rewrite_date_shift(caps: &Captures) -> String {
    let sign = if caps[1].eq_ignore_ascii_case("SUB") { "-" } else { "+" };
    shifted(&caps[2], modifier(sign, &caps[3], &caps[4]))
}

fn rewrite_extract(caps: &Captures) -> String {
    let operand = caps[2].trim();
    let format = match caps[1].to_ascii_uppercase().as_str() {
        "YEAR" => "%Y",
        "MONTH" => "%m",
        "DAY" => "%d",
        "HOUR" => "%H",
        "MINUTE" => "%M",
        "SECOND" => "%S",
        "DOW" => "%w",
        "DOY" => "%j",
        "WEEK" => "%W",
        "EPOCH" => "%s",
        _ => {
            return format!("((CAST(strftime('%m', {}) AS INTEGER) + 2) / 3)", operand);
        }
    };
    format!("CAST(strftime('{}', {}) AS INTEGER)", format, operand)
}

fn rewrite_date_trunc(caps: &Captures) -> String {
    let operand = caps[2].trim();
    match caps[1].to_ascii_lowercase().as_str() {
        "hour" => format!("strftime('%Y-%m-%d %H:00:00', {})", operand),
        "day" => format!("DATE({})", operand),
        // weeks start on Monday
        "week" => format!("DATE({}, 'weekday 0', '-6 days')", operand),
        "month" => format!("strftime('%Y-%m-01', {})", operand),
        _ => format!("strftime('%Y-01-01', {})", operand),
    }
}

fn rewrite_cast(caps: &Captures) -> String {
    let operand = &caps[1];
    if operand == ")" {
        return operand.to_string();
    }
    match caps[2].to_ascii_lowercase().as_str() {
        "date" => format!("DATE({})", operand),
        "timestamp" | "timestamptz" | "datetime" => format!("DATETIME({})", operand),
        "int" | "integer" | "bigint" | "smallint" | "int2" | "int4" | "int8" => {
            format!("CAST({} AS INTEGER)", operand)
        }
        "float" | "float4" | "float8" | "real" | "double" | "numeric" | "decimal" => {
            format!("CAST({} AS REAL)", operand)
        }
        "text" | "varchar" | "char" | "string" => format!("CAST({} AS TEXT)", operand),
        _ => operand.to_string(),
    }
}
