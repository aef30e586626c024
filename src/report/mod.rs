//! Report stages
//!
//! Chart selection, narrative, and final assembly.

pub mod assembler;
pub mod chart;
pub mod summarizer;

pub use assembler::{Degradation, DegradationKind, Report, ReportAssembler, ReportDraft, ReportStatus};
pub use chart::{ChartDecision, ChartKind, ChartSelector, ChartSource, ChartSpec, DataRef, CHART_ATTEMPT_BUDGET};
pub use summarizer::{check_provenance, fallback_narrative, Summarizer};

use crate::kpi::KpiValue;
use itertools::Itertools;

/// One-line text form of a KPI value for terminal output.
pub fn render_kpi(value: &KpiValue) -> String {
    match value {
        KpiValue::Scalar(metric) => metric.to_string(),
        KpiValue::Label(text) => text.clone(),
        KpiValue::Breakdown(buckets) | KpiValue::Series(buckets) => buckets
            .iter()
            .map(|b| format!("{}={}", b.label, b.value))
            .join(", "),
    }
}
