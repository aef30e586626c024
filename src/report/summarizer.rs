//! Summarizer
//!
//! The model writes the words; the KPI set supplies every number. A narrative
//! quoting a number the KPI set does not contain is thrown away.

use crate::error::{AnalyticsError, Result};
use crate::kpi::{KpiSet, KpiValue, Metric};
use crate::llm::{ModelPort, PromptPurpose};
use crate::query::Intent;
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are a manufacturing analytics assistant.
Write a concise 2-3 sentence summary answering the user's question.

RULES:
- Use ONLY the numbers provided in the KPI data below; do not invent, round or combine numbers
- Copy every number exactly as it appears in the KPI data
- Be direct: answer the question first, then add context
- No markdown, no bullet points, just plain sentences
"#;

const MAX_TEMPLATE_FIGURES: usize = 8;

lazy_static! {
    static ref NUMBER_RE: Regex =
        Regex::new(r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?").expect("number pattern");
}

pub struct Summarizer {
    model: ModelPort,
}

impl Summarizer {
    pub fn new(model: ModelPort) -> Self {
        Self { model }
    }

    /// Model narrative that passed the provenance check.
    pub async fn summarize(&self, question: &str, intent: Intent, kpis: &KpiSet) -> Result<String> {
        let prompt = build_prompt(question, intent, kpis);
        let text = self
            .model
            .generate(PromptPurpose::Summarize, SUMMARY_SYSTEM_PROMPT, &prompt)
            .await?;

        if text.is_empty() {
            return Err(AnalyticsError::Narrative("model returned an empty narrative".to_string()));
        }
        if let Err(token) = check_provenance(&text, kpis) {
            warn!("Narrative quoted {} which is not in the KPI set", token);
            return Err(AnalyticsError::Narrative(format!(
                "narrative quoted '{}', which is not a computed KPI",
                token
            )));
        }
        Ok(text)
    }
}

fn build_prompt(question: &str, intent: Intent, kpis: &KpiSet) -> String {
    let kpi_json =
        serde_json::to_string_pretty(&kpis.to_prompt_json()).unwrap_or_else(|_| kpis.to_prompt_json().to_string());
    format!(
        "USER QUESTION: {}\nQUESTION TYPE: {}\n\nCALCULATED KPIs:\n{}\n\nWrite a 2-3 sentence summary answering the user's question using ONLY the numbers above.",
        question, intent, kpi_json
    )
}

/// A number as written, sign included, without thousands separators.
#[derive(Debug, Clone, PartialEq)]
struct NumberToken {
    value: f64,
    text: String,
}

/// Numeric tokens in `text`, skipping digits that belong to identifiers
/// such as `LINE-3` or `PO-1042`. A `-` directly in front of a number that
/// does not follow a word is read as its sign.
fn numeric_tokens(text: &str) -> Vec<(String, NumberToken)> {
    let bytes = text.as_bytes();
    NUMBER_RE
        .find_iter(text)
        .filter_map(|m| {
            let start = m.start();
            let prev = start.checked_sub(1).map(|i| bytes[i]);
            let prev2 = start.checked_sub(2).map(|i| bytes[i]);
            let next = bytes.get(m.end()).copied();
            let glued_to_word = prev.map(|b| b.is_ascii_alphabetic()).unwrap_or(false)
                || next.map(|b| b.is_ascii_alphabetic()).unwrap_or(false);
            let after_joiner = matches!(prev, Some(b'-') | Some(b'_') | Some(b'#'))
                && prev2.map(|b| b.is_ascii_alphanumeric()).unwrap_or(false);
            if glued_to_word || after_joiner {
                return None;
            }

            let sign = if prev == Some(b'-') { "-" } else { "" };
            let plain = format!("{}{}", sign, m.as_str().replace(',', ""));
            plain.parse::<f64>().ok().map(|value| {
                (
                    format!("{}{}", sign, m.as_str()),
                    NumberToken { value, text: plain },
                )
            })
        })
        .collect()
}

/// `token` is `known` itself, or `known` written out and cut short after
/// fewer decimals. Rounding up never matches: 93 does not trace to 92.5.
fn traces_to(token: &NumberToken, known: f64) -> bool {
    if (token.value - known).abs() < 1e-9 {
        return true;
    }
    let written = known.to_string();
    let (known_int, known_frac) = written.split_once('.').unwrap_or((written.as_str(), ""));
    let (token_int, token_frac) = token.text.split_once('.').unwrap_or((token.text.as_str(), ""));
    known_int == token_int && token_frac.len() < known_frac.len() && known_frac.starts_with(token_frac)
}

/// Every numeric token must be a KPI number or a number inside a KPI label,
/// exactly or truncated at the precision written, with the same sign.
/// Returns the first offending token.
pub fn check_provenance(text: &str, kpis: &KpiSet) -> std::result::Result<(), String> {
    let mut known: Vec<f64> = kpis.numbers();
    for label in kpis.labels() {
        known.extend(NUMBER_RE.find_iter(label).filter_map(|m| m.as_str().replace(',', "").parse::<f64>().ok()));
    }

    for (raw, token) in numeric_tokens(text) {
        if !known.iter().any(|k| traces_to(&token, *k)) {
            return Err(raw);
        }
    }
    Ok(())
}

/// Templated narrative built straight from the KPI set.
pub fn fallback_narrative(kpis: &KpiSet) -> String {
    if kpis.is_empty() {
        return "The query returned no rows, so there are no figures to report.".to_string();
    }

    let figures = kpis
        .iter()
        .filter(|(name, _)| name.as_str() != "row_count")
        .filter_map(|(name, value)| {
            let label = name.replace('_', " ");
            match value {
                KpiValue::Scalar(Metric::Value(v)) => Some(format!("{} {}", label, v)),
                KpiValue::Scalar(Metric::Undefined) => Some(format!("{} undefined", label)),
                KpiValue::Label(text) => Some(format!("{} {}", label, text)),
                KpiValue::Breakdown(buckets) | KpiValue::Series(buckets) => {
                    let shown = buckets
                        .iter()
                        .take(MAX_TEMPLATE_FIGURES)
                        .map(|b| format!("{} {}", b.label, b.value))
                        .join(", ");
                    (!shown.is_empty()).then(|| format!("{} ({})", label, shown))
                }
            }
        })
        .take(MAX_TEMPLATE_FIGURES)
        .join("; ");

    let rows = kpis.value("row_count").unwrap_or(0.0);
    if figures.is_empty() {
        format!("The query returned {} rows.", rows)
    } else {
        format!("The query returned {} rows. Key figures: {}.", rows, figures)
    }
}
