//! SQL Guard
//!
//! Lexical safety check on a candidate statement. Nothing here touches the
//! data store: the statement is tokenized and inspected, never executed.

use crate::catalog::SchemaCatalog;
use crate::sql::candidate::{RejectionReason, SqlCandidate, Verdict};
use lazy_static::lazy_static;
use regex::Regex;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub const DEFAULT_MAX_STATEMENT_CHARS: usize = 4000;

/// Statement-level keywords that can change data, schema or connection state.
const MUTATING_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "CREATE", "REPLACE", "MERGE", "GRANT",
    "REVOKE", "ATTACH", "DETACH", "PRAGMA", "VACUUM", "REINDEX", "EXEC", "EXECUTE",
];

/// Words that end a table reference rather than alias it.
const CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER", "CROSS", "NATURAL", "ON", "USING", "GROUP",
    "ORDER", "LIMIT", "HAVING", "UNION", "INTERSECT", "EXCEPT", "WINDOW", "OFFSET", "AS", "SELECT", "FROM",
    "VALUES", "WITH", "AND", "OR", "NOT", "IS", "IN", "BY", "ASC", "DESC", "WHEN", "THEN", "ELSE", "END",
    "CASE", "FILTER", "OVER", "RETURNING", "SET", "INTO", "LIKE", "BETWEEN",
];

const IMPLICIT_COLUMNS: &[&str] = &["rowid", "oid", "_rowid_"];

lazy_static! {
    static ref MUTATING_RE: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|TRUNCATE|ALTER|CREATE|MERGE|GRANT|REVOKE|ATTACH|DETACH|PRAGMA|VACUUM|REINDEX|EXEC|EXECUTE)\b"
    )
    .expect("mutating keyword pattern");
}

pub struct SqlValidator {
    catalog: Arc<SchemaCatalog>,
    max_chars: usize,
}

impl SqlValidator {
    pub fn new(catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            catalog,
            max_chars: DEFAULT_MAX_STATEMENT_CHARS,
        }
    }

    pub fn with_max_chars(mut self, max_chars: usize) -> Self {
        self.max_chars = max_chars;
        self
    }

    pub fn validate(&self, candidate: &SqlCandidate) -> Verdict {
        match self.check(&candidate.statement) {
            Ok(()) => Verdict::Accepted,
            Err(reason) => {
                debug!("Attempt {} rejected: {}", candidate.attempt, reason);
                Verdict::Rejected { reason }
            }
        }
    }

    pub fn check(&self, sql: &str) -> Result<(), RejectionReason> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Err(RejectionReason::Empty);
        }

        let length = trimmed.chars().count();
        if length > self.max_chars {
            return Err(RejectionReason::TooLong {
                length,
                limit: self.max_chars,
            });
        }

        let dialect = SQLiteDialect {};
        let tokens = match Tokenizer::new(&dialect, trimmed).tokenize() {
            Ok(tokens) => tokens,
            Err(e) => {
                // unreadable text still gets the keyword screen
                if let Some(m) = MUTATING_RE.find(trimmed) {
                    return Err(RejectionReason::MutatingKeyword {
                        keyword: m.as_str().to_ascii_uppercase(),
                    });
                }
                return Err(RejectionReason::Malformed { detail: e.to_string() });
            }
        };
        let tokens: Vec<Token> = tokens
            .into_iter()
            .filter(|t| !matches!(t, Token::Whitespace(_) | Token::EOF))
            .collect();

        for (idx, token) in tokens.iter().enumerate() {
            let Some(word) = bare_word(token) else { continue };
            let upper = word.to_ascii_uppercase();
            if MUTATING_KEYWORDS.contains(&upper.as_str()) {
                // replace(x, from, to) is a scalar function
                if upper == "REPLACE" && matches!(tokens.get(idx + 1), Some(Token::LParen)) {
                    continue;
                }
                return Err(RejectionReason::MutatingKeyword { keyword: upper });
            }
        }

        let mut end = tokens.len();
        while end > 0 && matches!(tokens[end - 1], Token::SemiColon) {
            end -= 1;
        }
        let tokens = &tokens[..end];
        if tokens.is_empty() {
            return Err(RejectionReason::Empty);
        }
        if tokens.iter().any(|t| matches!(t, Token::SemiColon)) {
            return Err(RejectionReason::MultipleStatements);
        }

        match bare_word(&tokens[0]) {
            Some(w) if w.eq_ignore_ascii_case("SELECT") || w.eq_ignore_ascii_case("WITH") => {}
            _ => {
                return Err(RejectionReason::NotAQuery {
                    first_word: tokens[0].to_string().to_ascii_uppercase(),
                })
            }
        }

        self.check_references(tokens)
    }

    fn check_references(&self, tokens: &[Token]) -> Result<(), RejectionReason> {
        let derived = derived_names(tokens);

        // alias (lowercase) -> catalog table
        let mut aliases: HashMap<String, String> = HashMap::new();
        let mut consumed: HashSet<usize> = HashSet::new();
        // one frame per open paren: true when it opens a subquery
        let mut frames: Vec<bool> = Vec::new();

        let mut i = 0;
        while i < tokens.len() {
            match &tokens[i] {
                Token::LParen => {
                    let subquery = bare_word_at(tokens, i + 1)
                        .map(|w| w.eq_ignore_ascii_case("SELECT") || w.eq_ignore_ascii_case("WITH"))
                        .unwrap_or(false);
                    frames.push(subquery);
                }
                Token::RParen => {
                    frames.pop();
                }
                _ => {}
            }

            let in_query_scope = frames.last().copied().unwrap_or(true);
            let is_from = is_keyword(tokens.get(i), "FROM")
                && !(i > 0 && is_keyword(tokens.get(i - 1), "DISTINCT"));
            if !(in_query_scope && (is_from || is_keyword(tokens.get(i), "JOIN"))) {
                i += 1;
                continue;
            }

            let mut j = i + 1;
            loop {
                let Some(Token::Word(first)) = tokens.get(j) else { break };
                let mut name = first.value.clone();
                let mut k = j + 1;
                while matches!(tokens.get(k), Some(Token::Period)) {
                    match tokens.get(k + 1) {
                        Some(Token::Word(next)) => {
                            name = next.value.clone();
                            k += 2;
                        }
                        _ => break,
                    }
                }
                if matches!(tokens.get(k), Some(Token::LParen)) {
                    // table-valued function
                    break;
                }
                consumed.extend(j..k);

                let lower = name.to_lowercase();
                let is_table = if derived.contains(&lower) {
                    false
                } else if self.catalog.has_table(&name) {
                    true
                } else {
                    return Err(RejectionReason::UnknownTable { table: name });
                };

                let mut a = k;
                if is_keyword(tokens.get(a), "AS") {
                    a += 1;
                }
                if let Some(Token::Word(alias)) = tokens.get(a) {
                    let upper = alias.value.to_ascii_uppercase();
                    if alias.quote_style.is_some() || !CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                        if is_table {
                            aliases.insert(alias.value.to_lowercase(), name.clone());
                        }
                        k = a + 1;
                    }
                }
                if is_table {
                    aliases.insert(lower, name.clone());
                }

                j = k;
                if is_from && matches!(tokens.get(j), Some(Token::Comma)) {
                    j += 1;
                    continue;
                }
                break;
            }
            i = j.max(i + 1);
        }

        for idx in 0..tokens.len() {
            if consumed.contains(&idx) {
                continue;
            }
            let (Some(Token::Word(qualifier)), Some(Token::Period), Some(Token::Word(column))) =
                (tokens.get(idx), tokens.get(idx + 1), tokens.get(idx + 2))
            else {
                continue;
            };
            if matches!(tokens.get(idx + 3), Some(Token::Period)) {
                continue;
            }
            // qualifiers that are not catalog tables (CTEs, subqueries) are not checked
            let Some(table) = aliases.get(&qualifier.value.to_lowercase()) else { continue };
            let is_implicit = IMPLICIT_COLUMNS.iter().any(|c| c.eq_ignore_ascii_case(&column.value));
            if !is_implicit && !self.catalog.has_column(table, &column.value) {
                return Err(RejectionReason::UnknownColumn {
                    table: table.clone(),
                    column: column.value.clone(),
                    suggestion: self.suggest_column(table, &column.value),
                });
            }
        }

        Ok(())
    }

    fn suggest_column(&self, table: &str, column: &str) -> Option<String> {
        let table = self.catalog.table(table)?;
        let needle = column.to_lowercase();
        let containing = table
            .columns
            .iter()
            .filter(|c| {
                let name = c.name.to_lowercase();
                name.contains(&needle) || needle.contains(&name)
            })
            .min_by_key(|c| c.name.len());
        if let Some(column) = containing {
            return Some(column.name.clone());
        }
        table
            .columns
            .iter()
            .map(|c| (strsim::jaro_winkler(&needle, &c.name.to_lowercase()), &c.name))
            .filter(|(score, _)| *score >= 0.8)
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(_, name)| name.clone())
    }
}

/// Names introduced by the statement itself: CTEs and aliased subqueries.
fn derived_names(tokens: &[Token]) -> HashSet<String> {
    let mut names = HashSet::new();
    for i in 0..tokens.len() {
        if let Token::Word(word) = &tokens[i] {
            if is_keyword(tokens.get(i + 1), "AS") && matches!(tokens.get(i + 2), Some(Token::LParen)) {
                names.insert(word.value.to_lowercase());
            }
        }
        if matches!(tokens[i], Token::RParen) {
            let mut j = i + 1;
            if is_keyword(tokens.get(j), "AS") {
                j += 1;
            }
            if let Some(Token::Word(alias)) = tokens.get(j) {
                let upper = alias.value.to_ascii_uppercase();
                if !CLAUSE_KEYWORDS.contains(&upper.as_str()) {
                    names.insert(alias.value.to_lowercase());
                }
            }
        }
    }
    names
}

fn bare_word(token: &Token) -> Option<&str> {
    match token {
        Token::Word(w) if w.quote_style.is_none() => Some(w.value.as_str()),
        _ => None,
    }
}

fn bare_word_at(tokens: &[Token], idx: usize) -> Option<&str> {
    tokens.get(idx).and_then(bare_word)
}

fn is_keyword(token: Option<&Token>, keyword: &str) -> bool {
    token
        .and_then(bare_word)
        .map(|w| w.eq_ignore_ascii_case(keyword))
        .unwrap_or(false)
}
