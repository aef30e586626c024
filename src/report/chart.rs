//! Chart Selector
//!
//! A fixed decision table on intent and result shape picks the chart. Only
//! when no rule applies to a REPORT or COMPARISON question is the model asked
//! for a proposal, and that proposal is checked against the actual columns.

use crate::error::{AnalyticsError, Result};
use crate::execution::{ExecutionResult, ResultShape};
use crate::llm::{extract_json_object, ModelPort, PromptPurpose};
use crate::query::Intent;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fallback proposals allowed per run.
pub const CHART_ATTEMPT_BUDGET: u32 = 2;

const MAX_SERIES: usize = 3;
const MIN_LINE_POINTS: usize = 3;

const CHART_SYSTEM_PROMPT: &str = r#"You choose a chart for a query result table.
Reply with JSON only, no explanation:
{"kind": "line" | "bar" | "pie" | "scatter", "x": "<column>", "y": ["<numeric column>", ...], "title": "<short title>"}
Use only the columns listed. If no chart would help, reply {"kind": "none"}."#;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Line,
    Bar,
    Pie,
    Scatter,
}

impl ChartKind {
    fn parse(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "line" => Some(ChartKind::Line),
            "bar" | "column" => Some(ChartKind::Bar),
            "pie" => Some(ChartKind::Pie),
            "scatter" => Some(ChartKind::Scatter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartSource {
    Rule,
    Model,
}

/// Which slice of the report's result rows the chart draws.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRef {
    pub columns: Vec<String>,
    pub row_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartSpec {
    pub kind: ChartKind,
    pub title: String,
    pub x: String,
    pub y: Vec<String>,
    pub data: DataRef,
    pub source: ChartSource,
}

impl ChartSpec {
    fn new(kind: ChartKind, x: &str, y: Vec<String>, title: Option<String>, rows: usize, source: ChartSource) -> Self {
        let title = title
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| format!("{} by {}", y.iter().map(|c| humanize(c)).join(", "), humanize(x)));
        let mut columns = vec![x.to_string()];
        columns.extend(y.iter().cloned());
        Self {
            kind,
            title,
            x: x.to_string(),
            y,
            data: DataRef {
                columns,
                row_count: rows,
            },
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChartDecision {
    Chart(ChartSpec),
    /// The shape does not warrant a chart
    NoChart(String),
    /// No rule covers this shape
    NoMatch,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Axis {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct Proposal {
    kind: String,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Option<Axis>,
    #[serde(default)]
    title: Option<String>,
}

pub struct ChartSelector {
    model: ModelPort,
}

impl ChartSelector {
    pub fn new(model: ModelPort) -> Self {
        Self { model }
    }

    /// Decision table on intent and result shape.
    pub fn decide(&self, intent: Intent, result: &ExecutionResult) -> ChartDecision {
        let shape = result.shape();
        if intent == Intent::Lookup {
            return ChartDecision::NoChart("lookup answers are not charted".to_string());
        }
        if shape.row_count < 2 {
            return ChartDecision::NoChart("a single row has nothing to plot".to_string());
        }

        let rows = shape.row_count;
        let line = |shape: &ResultShape| {
            shape.time_column.as_deref().filter(|_| shape.has_measure()).map(|time| {
                ChartSpec::new(ChartKind::Line, time, series(shape), None, rows, ChartSource::Rule)
            })
        };
        let bar = |shape: &ResultShape| {
            shape.category_column.as_deref().filter(|_| shape.has_measure()).map(|category| {
                ChartSpec::new(ChartKind::Bar, category, series(shape), None, rows, ChartSource::Rule)
            })
        };

        let chosen = match intent {
            Intent::Trend => line(&shape),
            Intent::Comparison | Intent::Aggregation => bar(&shape),
            Intent::Report => bar(&shape).or_else(|| line(&shape)),
            Intent::Lookup => None,
        };
        let chosen = chosen.or_else(|| line(&shape).filter(|_| rows >= MIN_LINE_POINTS));

        match chosen {
            Some(spec) => ChartDecision::Chart(spec),
            None => ChartDecision::NoMatch,
        }
    }

    pub fn fallback_allowed(intent: Intent) -> bool {
        matches!(intent, Intent::Report | Intent::Comparison)
    }

    /// One model proposal. `Ok(None)` when the model declines a chart;
    /// `Err` when the proposal is unusable.
    pub async fn propose(
        &self,
        question: &str,
        intent: Intent,
        result: &ExecutionResult,
        prior_error: Option<&str>,
    ) -> Result<Option<ChartSpec>> {
        let prompt = self.build_prompt(question, intent, result, prior_error);
        let reply = self
            .model
            .generate(PromptPurpose::ChartFallback, CHART_SYSTEM_PROMPT, &prompt)
            .await?;
        debug!("Chart proposal: {}", reply);
        let proposal = parse_proposal(&reply, result);
        if let Err(e) = &proposal {
            warn!("Chart proposal unusable: {}", e);
        }
        proposal
    }

    fn build_prompt(&self, question: &str, intent: Intent, result: &ExecutionResult, prior_error: Option<&str>) -> String {
        let columns = result
            .columns
            .iter()
            .enumerate()
            .map(|(idx, name)| {
                let kind = if result.is_temporal_column(idx) {
                    "time"
                } else if result.is_numeric_column(idx) {
                    "numeric"
                } else {
                    "text"
                };
                format!("- {} ({})", name, kind)
            })
            .join("\n");

        let mut prompt = format!(
            "USER QUESTION: {}\nQUESTION TYPE: {}\nROWS: {}\nCOLUMNS:\n{}",
            question, intent, result.row_count, columns
        );
        if let Some(error) = prior_error {
            prompt.push_str(&format!("\n\nYOUR PREVIOUS PROPOSAL WAS UNUSABLE: {}", error));
        }
        prompt
    }
}

fn series(shape: &ResultShape) -> Vec<String> {
    shape.measure_columns.iter().take(MAX_SERIES).cloned().collect()
}

fn humanize(column: &str) -> String {
    column.replace('_', " ")
}

fn parse_proposal(reply: &str, result: &ExecutionResult) -> Result<Option<ChartSpec>> {
    let json = extract_json_object(reply)
        .ok_or_else(|| AnalyticsError::Chart("reply contained no JSON object".to_string()))?;
    let proposal: Proposal =
        serde_json::from_str(json).map_err(|e| AnalyticsError::Chart(format!("unreadable proposal: {}", e)))?;

    if proposal.kind.trim().eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    let kind = ChartKind::parse(&proposal.kind)
        .ok_or_else(|| AnalyticsError::Chart(format!("unknown chart kind '{}'", proposal.kind)))?;

    let x = proposal
        .x
        .ok_or_else(|| AnalyticsError::Chart("proposal has no x column".to_string()))?;
    let x_idx = result
        .column_index(&x)
        .ok_or_else(|| AnalyticsError::Chart(format!("x column '{}' is not in the result", x)))?;

    let y = match proposal.y {
        Some(Axis::One(column)) => vec![column],
        Some(Axis::Many(columns)) => columns,
        None => Vec::new(),
    };
    if y.is_empty() {
        return Err(AnalyticsError::Chart("proposal has no y column".to_string()));
    }
    let mut y_columns = Vec::with_capacity(y.len());
    for column in y {
        let idx = result
            .column_index(&column)
            .ok_or_else(|| AnalyticsError::Chart(format!("y column '{}' is not in the result", column)))?;
        if !result.is_numeric_column(idx) {
            return Err(AnalyticsError::Chart(format!("y column '{}' is not numeric", column)));
        }
        y_columns.push(result.columns[idx].clone());
    }

    Ok(Some(ChartSpec::new(
        kind,
        &result.columns[x_idx],
        y_columns,
        proposal.title,
        result.row_count,
        ChartSource::Model,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::Scalar;
    use crate::llm::{ScriptedModel, ScriptedReply};
    use std::sync::Arc;
    use std::time::Duration;

    fn text(s: &str) -> Scalar {
        Scalar::Text(s.to_string())
    }

    fn selector(model: ScriptedModel) -> (ChartSelector, Arc<ScriptedModel>) {
        let model = Arc::new(model);
        let port = ModelPort::new(model.clone(), Duration::from_secs(1), 128);
        (ChartSelector::new(port), model)
    }

    fn daily_output() -> ExecutionResult {
        ExecutionResult::new(
            vec!["day".into(), "output".into()],
            vec![
                vec![text("2024-03-01"), Scalar::Integer(100)],
                vec![text("2024-03-02"), Scalar::Integer(110)],
                vec![text("2024-03-03"), Scalar::Integer(130)],
            ],
        )
    }

    fn per_line() -> ExecutionResult {
        ExecutionResult::new(
            vec!["line_id".into(), "yield_pct".into()],
            vec![
                vec![text("LINE-1"), Scalar::Real(91.2)],
                vec![text("LINE-2"), Scalar::Real(88.0)],
            ],
        )
    }

    /// Two numeric columns only: no time, no category.
    fn scatter_shape() -> ExecutionResult {
        ExecutionResult::new(
            vec!["planned".into(), "actual".into()],
            vec![
                vec![Scalar::Integer(100), Scalar::Integer(90)],
                vec![Scalar::Integer(200), Scalar::Integer(180)],
            ],
        )
    }

    #[test]
    fn test_decision_table() {
        let (selector, _) = selector(ScriptedModel::new());

        match selector.decide(Intent::Trend, &daily_output()) {
            ChartDecision::Chart(spec) => {
                assert_eq!(spec.kind, ChartKind::Line);
                assert_eq!(spec.x, "day");
                assert_eq!(spec.y, vec!["output".to_string()]);
                assert_eq!(spec.source, ChartSource::Rule);
            }
            other => panic!("expected a chart, got {:?}", other),
        }

        match selector.decide(Intent::Comparison, &per_line()) {
            ChartDecision::Chart(spec) => assert_eq!(spec.kind, ChartKind::Bar),
            other => panic!("expected a chart, got {:?}", other),
        }

        assert!(matches!(
            selector.decide(Intent::Lookup, &per_line()),
            ChartDecision::NoChart(_)
        ));
        assert_eq!(selector.decide(Intent::Report, &scatter_shape()), ChartDecision::NoMatch);
    }

    #[test]
    fn test_single_row_and_aggregation_never_reach_the_model() {
        let (selector, _) = selector(ScriptedModel::new());
        let single = ExecutionResult::new(vec!["order_id".into()], vec![vec![text("PO-1042")]]);
        assert!(matches!(
            selector.decide(Intent::Report, &single),
            ChartDecision::NoChart(_)
        ));

        assert_eq!(selector.decide(Intent::Aggregation, &scatter_shape()), ChartDecision::NoMatch);
        assert!(!ChartSelector::fallback_allowed(Intent::Aggregation));
        assert!(ChartSelector::fallback_allowed(Intent::Comparison));
    }

    #[tokio::test]
    async fn test_fallback_proposal_is_checked_against_columns() {
        let (selector, model) = selector(
            ScriptedModel::new()
                .reply(
                    PromptPurpose::ChartFallback,
                    ScriptedReply::text(r#"{"kind": "bar", "x": "planned", "y": "missing"}"#),
                )
                .reply(
                    PromptPurpose::ChartFallback,
                    ScriptedReply::text(r#"Here: {"kind": "scatter", "x": "planned", "y": ["actual"]}"#),
                ),
        );
        let err = selector
            .propose("planned vs actual", Intent::Report, &scatter_shape(), None)
            .await
            .unwrap_err();
        let spec = selector
            .propose("planned vs actual", Intent::Report, &scatter_shape(), Some(&err.to_string()))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(spec.kind, ChartKind::Scatter);
        assert_eq!(spec.source, ChartSource::Model);
        assert_eq!(model.calls_for(PromptPurpose::ChartFallback), 2);
        assert!(model.prompts_for(PromptPurpose::ChartFallback)[1].contains("not in the result"));
    }

    #[tokio::test]
    async fn test_model_may_decline_a_chart() {
        let (selector, _) = selector(
            ScriptedModel::new().reply(PromptPurpose::ChartFallback, ScriptedReply::text(r#"{"kind": "none"}"#)),
        );
        let proposal = selector
            .propose("planned vs actual", Intent::Comparison, &scatter_shape(), None)
            .await
            .unwrap();
        assert!(proposal.is_none());
    }
}
