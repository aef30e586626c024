//! Report Assembler
//!
//! Folds the artifacts of one run into the terminal [`Report`] and decides
//! its status. Status is the only channel for degradation: a run that lost
//! its data is `failed`, a run that substituted anything along the way is
//! `partial`, everything else is `completed`.

use crate::execution::ExecutionResult;
use crate::kpi::KpiSet;
use crate::query::{Intent, Query};
use crate::report::chart::ChartSpec;
use crate::sql::AttemptRecord;
use crate::workflow::Stage;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Completed,
    Partial,
    Failed,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ReportStatus::Completed => "completed",
            ReportStatus::Partial => "partial",
            ReportStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// Classifier failed or answered outside the label set; REPORT was used
    ClassificationFailure,
    /// Ranking unavailable; every table was offered unranked
    RetrievalDegraded,
    /// Every SQL attempt ended in a validator rejection
    GenerationRejected,
    /// Every SQL attempt ended without a result
    ExecutionFailed,
    /// The query ran but returned no rows
    ComputationEmpty,
    /// Chart fallback failed; the chart was omitted
    ChartFailure,
    /// Narrative was replaced by the KPI template
    SummarizationFailure,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub stage: Stage,
    pub kind: DegradationKind,
    pub reason: String,
}

impl Degradation {
    pub fn new(stage: Stage, kind: DegradationKind, reason: impl Into<String>) -> Self {
        Self {
            stage,
            kind,
            reason: reason.into(),
        }
    }
}

/// Terminal artifact of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub query: Query,
    pub intent: Intent,
    pub status: ReportStatus,
    pub status_reason: Option<String>,
    pub degradations: Vec<Degradation>,
    pub kpis: KpiSet,
    pub chart: Option<ChartSpec>,
    pub narrative: String,
    /// Statement that produced `data`, after normalization
    pub sql: Option<String>,
    pub tables_used: Vec<String>,
    pub row_count: usize,
    pub attempts: Vec<AttemptRecord>,
    pub data: Option<ExecutionResult>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn is_failed(&self) -> bool {
        self.status == ReportStatus::Failed
    }

    pub fn has_degradation(&self, kind: DegradationKind) -> bool {
        self.degradations.iter().any(|d| d.kind == kind)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Report for: {}", self.query.text)?;
        writeln!(f, "Intent: {} | Status: {} | Rows: {}", self.intent, self.status, self.row_count)?;
        if let Some(reason) = &self.status_reason {
            writeln!(f, "Reason: {}", reason)?;
        }

        writeln!(f, "\n=== Summary ===")?;
        writeln!(f, "{}", self.narrative)?;

        if !self.kpis.is_empty() {
            writeln!(f, "\n=== KPIs ===")?;
            for (name, value) in self.kpis.iter() {
                writeln!(f, "- {}: {}", name, crate::report::render_kpi(value))?;
            }
        }

        if let Some(chart) = &self.chart {
            writeln!(f, "\n=== Chart ===")?;
            writeln!(f, "{:?}: {} (x: {}, y: {})", chart.kind, chart.title, chart.x, chart.y.join(", "))?;
        }

        if let Some(sql) = &self.sql {
            writeln!(f, "\n=== SQL ===")?;
            writeln!(f, "{}", sql)?;
        }

        if !self.degradations.is_empty() {
            writeln!(f, "\n=== Degradations ===")?;
            for d in &self.degradations {
                writeln!(f, "- [{}] {:?}: {}", d.stage, d.kind, d.reason)?;
            }
        }

        Ok(())
    }
}

/// Everything the run produced, before a status is decided.
#[derive(Debug, Clone)]
pub struct ReportDraft {
    pub query: Query,
    pub intent: Intent,
    pub kpis: KpiSet,
    pub chart: Option<ChartSpec>,
    pub narrative: Option<String>,
    pub sql: Option<String>,
    pub tables_used: Vec<String>,
    pub attempts: Vec<AttemptRecord>,
    pub data: Option<ExecutionResult>,
    pub degradations: Vec<Degradation>,
    pub cancelled: bool,
}

impl ReportDraft {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            intent: Intent::DEFAULT,
            kpis: KpiSet::new(),
            chart: None,
            narrative: None,
            sql: None,
            tables_used: Vec::new(),
            attempts: Vec::new(),
            data: None,
            degradations: Vec::new(),
            cancelled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReportAssembler;

impl ReportAssembler {
    pub fn new() -> Self {
        Self
    }

    pub fn assemble(&self, draft: ReportDraft) -> Report {
        let ReportDraft {
            query,
            intent,
            mut kpis,
            mut chart,
            narrative,
            sql,
            tables_used,
            attempts,
            mut data,
            degradations,
            cancelled,
        } = draft;

        let (status, status_reason, narrative) = if cancelled {
            kpis = KpiSet::new();
            chart = None;
            data = None;
            (
                ReportStatus::Failed,
                Some("cancelled".to_string()),
                "The run was cancelled before a result could be reported.".to_string(),
            )
        } else if data.is_none() {
            kpis = KpiSet::new();
            chart = None;
            let last_reason = attempts
                .iter()
                .rev()
                .find_map(|a| a.failure_reason())
                .or_else(|| degradations.last().map(|d| d.reason.clone()));
            let explanation = match &last_reason {
                Some(reason) => format!(
                    "The data could not be retrieved after {} attempt(s). Last error: {}",
                    attempts.len(),
                    reason
                ),
                None => "The data could not be retrieved.".to_string(),
            };
            (ReportStatus::Failed, last_reason, explanation)
        } else if !degradations.is_empty() {
            let reason = degradations.iter().map(|d| d.reason.as_str()).join("; ");
            (ReportStatus::Partial, Some(reason), narrative.unwrap_or_default())
        } else {
            (ReportStatus::Completed, None, narrative.unwrap_or_default())
        };

        let row_count = data.as_ref().map(|d| d.row_count).unwrap_or(0);
        let sql = if data.is_some() { sql } else { None };

        info!("Report assembled: status={}, rows={}, attempts={}", status, row_count, attempts.len());

        Report {
            query,
            intent,
            status,
            status_reason,
            degradations,
            kpis,
            chart,
            narrative,
            sql,
            tables_used,
            row_count,
            attempts,
            data,
            generated_at: Utc::now(),
        }
    }
}
