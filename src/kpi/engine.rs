//! KPI Engine
//!
//! Deterministic metrics over an execution result. No model calls and no
//! I/O: the same rows always produce the same set.

use crate::execution::result::{is_identifier_name, parse_temporal, ExecutionResult, Scalar};
use crate::kpi::{Bucket, KpiSet, KpiValue, Metric};
use crate::query::Intent;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::collections::{BTreeMap, HashSet};

const RATIO_LIKE: &[&str] = &["yield", "efficiency", "ratio"];
const SUMMED_MEASURES: &[&str] = &["quantity", "qty", "count", "total", "output", "units", "sum"];
const MIN_TREND_BUCKETS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Aggregate {
    Sum,
    Mean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TimeKey {
    Number(i64),
    Day(NaiveDate),
    Instant(NaiveDateTime),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KpiEngine;

impl KpiEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn compute_for(&self, intent: Intent, result: &ExecutionResult) -> KpiSet {
        let mut kpis = KpiSet::new();
        if result.is_empty() {
            return kpis;
        }

        let ratio = RatioColumns::find(result);

        if result.row_count == 1 {
            self.single_row_metrics(result, &mut kpis);
        }
        if let Some(ratio) = ratio {
            self.ratio_metrics(result, ratio, &mut kpis);
        }
        self.ratio_like_columns(result, &mut kpis);
        self.count_metrics(result, &mut kpis);
        self.duration_metrics(result, &mut kpis);
        self.grouped_metrics(result, ratio, &mut kpis);
        if intent == Intent::Trend {
            self.trend_metrics(result, ratio, &mut kpis);
        }

        kpis.insert("row_count", KpiValue::number(result.row_count as f64));
        kpis
    }

    fn single_row_metrics(&self, result: &ExecutionResult, kpis: &mut KpiSet) {
        let Some(row) = result.rows.first() else { return };
        for (column, value) in result.columns.iter().zip(row) {
            let name = column.to_lowercase();
            match value {
                Scalar::Integer(_) | Scalar::Real(_) => {
                    if let Some(v) = value.as_f64() {
                        kpis.insert(name, KpiValue::number(round2(v)));
                    }
                }
                Scalar::Text(text) => kpis.insert(name, KpiValue::Label(text.clone())),
                Scalar::Null | Scalar::Blob(_) => {}
            }
        }
    }

    fn ratio_metrics(&self, result: &ExecutionResult, ratio: RatioColumns, kpis: &mut KpiSet) {
        let mut planned_sum = 0.0;
        let mut actual_sum = 0.0;
        let mut row_yields = Vec::new();
        for row in &result.rows {
            let (Some(planned), Some(actual)) = (
                row.get(ratio.planned).and_then(Scalar::as_f64),
                row.get(ratio.actual).and_then(Scalar::as_f64),
            ) else {
                continue;
            };
            planned_sum += planned;
            actual_sum += actual;
            if planned != 0.0 {
                row_yields.push(actual / planned * 100.0);
            }
        }

        kpis.insert("total_planned", KpiValue::number(round2(planned_sum)));
        kpis.insert("total_actual", KpiValue::number(round2(actual_sum)));
        kpis.insert("total_variance", KpiValue::number(round2(actual_sum - planned_sum)));
        kpis.insert("yield_pct", KpiValue::Scalar(percent(actual_sum, planned_sum)));
        kpis.insert(
            "variance_pct",
            KpiValue::Scalar(percent(actual_sum - planned_sum, planned_sum)),
        );

        let (avg, min, max) = summarize(&row_yields);
        kpis.insert("avg_yield", KpiValue::Scalar(avg));
        kpis.insert("min_yield", KpiValue::Scalar(min));
        kpis.insert("max_yield", KpiValue::Scalar(max));
    }

    fn ratio_like_columns(&self, result: &ExecutionResult, kpis: &mut KpiSet) {
        if result.row_count < 2 {
            return;
        }
        for (idx, column) in result.columns.iter().enumerate() {
            let name = column.to_lowercase();
            if !RATIO_LIKE.iter().any(|r| name.contains(r)) || !result.is_numeric_column(idx) {
                continue;
            }
            let (avg, min, max) = summarize(&result.numeric_values(idx));
            kpis.insert(format!("avg_{}", name), KpiValue::Scalar(avg));
            kpis.insert(format!("min_{}", name), KpiValue::Scalar(min));
            kpis.insert(format!("max_{}", name), KpiValue::Scalar(max));
        }
    }

    fn count_metrics(&self, result: &ExecutionResult, kpis: &mut KpiSet) {
        let distinct = [
            ("order_id", "total_orders"),
            ("shift_id", "total_shifts"),
            ("supervisor_id", "unique_supervisors"),
            ("operator_id", "unique_operators"),
        ];
        for (column, key) in distinct {
            if let Some(idx) = result.column_index(column) {
                kpis.insert(key, KpiValue::number(result.distinct_count(idx) as f64));
            }
        }

        if let Some(idx) = result.column_index("status") {
            let counts = value_counts(result, idx);
            let completed = counts
                .iter()
                .filter(|(label, _)| label.eq_ignore_ascii_case("completed"))
                .map(|(_, n)| *n)
                .sum::<usize>();
            kpis.insert("status_breakdown", KpiValue::Breakdown(as_buckets(counts)));
            kpis.insert("completed_orders", KpiValue::number(completed as f64));
        }

        if let Some(idx) = result.column_index("shift_type") {
            kpis.insert("shifts_by_type", KpiValue::Breakdown(as_buckets(value_counts(result, idx))));
        }

        if let Some(idx) = result.shape().time_column.and_then(|c| result.column_index(&c)) {
            let mut dated: Vec<(NaiveDateTime, &str)> = result
                .column_values(idx)
                .filter_map(|v| match v {
                    Scalar::Text(t) => parse_temporal(t).map(|dt| (dt, t.as_str())),
                    _ => None,
                })
                .collect();
            if !dated.is_empty() {
                dated.sort();
                let days: HashSet<NaiveDate> = dated.iter().map(|(dt, _)| dt.date()).collect();
                kpis.insert(
                    "date_range",
                    KpiValue::Label(format!("{} to {}", dated[0].1, dated[dated.len() - 1].1)),
                );
                kpis.insert("unique_days", KpiValue::number(days.len() as f64));
            }
        }
    }

    fn duration_metrics(&self, result: &ExecutionResult, kpis: &mut KpiSet) {
        if let (Some(start), Some(end)) = (result.column_index("start_time"), result.column_index("end_time")) {
            let minutes: Vec<f64> = result
                .rows
                .iter()
                .filter_map(|row| {
                    let start = row.get(start).and_then(clock_minutes)?;
                    let end = row.get(end).and_then(clock_minutes)?;
                    let span = end - start;
                    // shifts crossing midnight
                    Some(if span < 0.0 { span + 1440.0 } else { span })
                })
                .collect();
            if !minutes.is_empty() {
                let (avg, min, max) = summarize(&minutes);
                kpis.insert("avg_duration_min", KpiValue::Scalar(avg));
                kpis.insert("min_duration_min", KpiValue::Scalar(min));
                kpis.insert("max_duration_min", KpiValue::Scalar(max));
                kpis.insert(
                    "total_duration_hours",
                    KpiValue::number(round2(minutes.iter().sum::<f64>() / 60.0)),
                );
            }
        }

        if let Some(idx) = result.column_index("cycle_time_minutes") {
            let (avg, _, _) = summarize(&result.numeric_values(idx));
            kpis.insert("avg_cycle_time", KpiValue::Scalar(avg));
        }
    }

    fn grouped_metrics(&self, result: &ExecutionResult, ratio: Option<RatioColumns>, kpis: &mut KpiSet) {
        if result.row_count < 2 {
            return;
        }
        let shape = result.shape();
        let Some(group_column) = shape.category_column.as_deref() else { return };
        let Some(group_idx) = result.column_index(group_column) else { return };
        let group = group_column.to_lowercase();

        let mut ranking: Option<Vec<Bucket>> = None;

        if let Some(ratio) = ratio {
            let buckets = group_by(result, group_idx, |rows| {
                let planned: f64 = rows.iter().filter_map(|r| r.get(ratio.planned).and_then(Scalar::as_f64)).sum();
                let actual: f64 = rows.iter().filter_map(|r| r.get(ratio.actual).and_then(Scalar::as_f64)).sum();
                percent(actual, planned)
            });
            kpis.insert(format!("yield_by_{}", group), KpiValue::Breakdown(buckets.clone()));
            ranking = Some(buckets);
        }

        for measure in &shape.measure_columns {
            let Some(measure_idx) = result.column_index(measure) else { continue };
            let name = measure.to_lowercase();
            let aggregate = if SUMMED_MEASURES.iter().any(|m| name.contains(m)) {
                Aggregate::Sum
            } else {
                Aggregate::Mean
            };
            let buckets = group_by(result, group_idx, |rows| {
                let values: Vec<f64> = rows
                    .iter()
                    .filter_map(|r| r.get(measure_idx).and_then(Scalar::as_f64))
                    .collect();
                aggregate_values(&values, aggregate)
            });
            if ranking.is_none() {
                ranking = Some(buckets.clone());
            }
            kpis.insert(format!("{}_by_{}", name, group), KpiValue::Breakdown(buckets));
        }

        let Some(ranking) = ranking else { return };
        let defined: Vec<(&str, f64)> = ranking
            .iter()
            .filter_map(|b| b.value.value().map(|v| (b.label.as_str(), v)))
            .collect();
        if defined.len() < 2 {
            return;
        }
        // first appearance wins ties
        let mut best = defined[0];
        let mut worst = defined[0];
        for &(label, value) in &defined[1..] {
            if value > best.1 {
                best = (label, value);
            }
            if value < worst.1 {
                worst = (label, value);
            }
        }
        let stem = group.strip_suffix("_id").unwrap_or(&group);
        kpis.insert(format!("best_{}", stem), KpiValue::Label(best.0.to_string()));
        kpis.insert(format!("worst_{}", stem), KpiValue::Label(worst.0.to_string()));
    }

    fn trend_metrics(&self, result: &ExecutionResult, ratio: Option<RatioColumns>, kpis: &mut KpiSet) {
        let shape = result.shape();
        let Some(time_idx) = shape.time_column.as_deref().and_then(|c| result.column_index(c)) else {
            return;
        };

        let keyed: Vec<Option<(TimeKey, String)>> = {
            let has_clock = result.column_values(time_idx).any(|v| {
                v.as_temporal()
                    .map(|dt| dt.time().num_seconds_from_midnight() != 0)
                    .unwrap_or(false)
            });
            result
                .rows
                .iter()
                .map(|row| match row.get(time_idx)? {
                    Scalar::Integer(n) => Some((TimeKey::Number(*n), n.to_string())),
                    Scalar::Text(text) => {
                        let dt = parse_temporal(text)?;
                        if has_clock {
                            let day = dt.date();
                            Some((TimeKey::Day(day), day.format("%Y-%m-%d").to_string()))
                        } else {
                            Some((TimeKey::Instant(dt), text.clone()))
                        }
                    }
                    _ => None,
                })
                .collect()
        };

        let mut periods: BTreeMap<TimeKey, (String, Vec<&Vec<Scalar>>)> = BTreeMap::new();
        for (row, key) in result.rows.iter().zip(keyed) {
            if let Some((key, label)) = key {
                periods.entry(key).or_insert_with(|| (label, Vec::new())).1.push(row);
            }
        }

        let (metric_name, series): (String, Vec<Bucket>) = if let Some(ratio) = ratio {
            let series = periods
                .values()
                .map(|(label, rows)| {
                    let planned: f64 = rows.iter().filter_map(|r| r.get(ratio.planned).and_then(Scalar::as_f64)).sum();
                    let actual: f64 = rows.iter().filter_map(|r| r.get(ratio.actual).and_then(Scalar::as_f64)).sum();
                    Bucket::new(label.clone(), percent(actual, planned))
                })
                .collect();
            ("yield_pct".to_string(), series)
        } else {
            let Some(measure) = shape.measure_columns.first() else { return };
            let Some(measure_idx) = result.column_index(measure) else { return };
            let series = periods
                .values()
                .map(|(label, rows)| {
                    let values: Vec<f64> = rows
                        .iter()
                        .filter_map(|r| r.get(measure_idx).and_then(Scalar::as_f64))
                        .collect();
                    Bucket::new(label.clone(), aggregate_values(&values, Aggregate::Mean))
                })
                .collect();
            (measure.to_lowercase(), series)
        };

        let points: Vec<(f64, f64)> = series
            .iter()
            .enumerate()
            .filter_map(|(i, b)| b.value.value().map(|v| (i as f64, v)))
            .collect();
        kpis.insert(format!("{}_trend", metric_name), KpiValue::Series(series));

        if points.len() >= MIN_TREND_BUCKETS {
            let slope = (least_squares_slope(&points) * 1000.0).round() / 1000.0;
            let direction = if slope > 0.0 {
                "improving"
            } else if slope < 0.0 {
                "declining"
            } else {
                "flat"
            };
            kpis.insert("trend_slope", KpiValue::number(slope));
            kpis.insert("trend_direction", KpiValue::Label(direction.to_string()));
        }
    }
}

/// Column positions of the planned/actual pair behind yield metrics.
#[derive(Debug, Clone, Copy)]
struct RatioColumns {
    planned: usize,
    actual: usize,
}

impl RatioColumns {
    fn find(result: &ExecutionResult) -> Option<Self> {
        let find = |exact: &str, fragment: &str| {
            result.column_index(exact).or_else(|| {
                result.columns.iter().enumerate().position(|(idx, c)| {
                    c.to_lowercase().contains(fragment) && !is_identifier_name(c) && result.is_numeric_column(idx)
                })
            })
        };
        Some(Self {
            planned: find("quantity_planned", "planned")?,
            actual: find("quantity_actual", "actual")?,
        })
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn percent(numerator: f64, denominator: f64) -> Metric {
    if denominator == 0.0 {
        Metric::Undefined
    } else {
        Metric::Value(round2(numerator / denominator * 100.0))
    }
}

fn summarize(values: &[f64]) -> (Metric, Metric, Metric) {
    if values.is_empty() {
        return (Metric::Undefined, Metric::Undefined, Metric::Undefined);
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (
        Metric::Value(round2(mean)),
        Metric::Value(round2(min)),
        Metric::Value(round2(max)),
    )
}

fn aggregate_values(values: &[f64], aggregate: Aggregate) -> Metric {
    if values.is_empty() {
        return Metric::Undefined;
    }
    let total: f64 = values.iter().sum();
    match aggregate {
        Aggregate::Sum => Metric::Value(round2(total)),
        Aggregate::Mean => Metric::Value(round2(total / values.len() as f64)),
    }
}

/// Groups in first-appearance order.
fn group_by<F>(result: &ExecutionResult, group_idx: usize, mut reduce: F) -> Vec<Bucket>
where
    F: FnMut(&[&Vec<Scalar>]) -> Metric,
{
    let mut order: Vec<String> = Vec::new();
    let mut groups: BTreeMap<String, Vec<&Vec<Scalar>>> = BTreeMap::new();
    for row in &result.rows {
        let Some(value) = row.get(group_idx).filter(|v| !v.is_null()) else { continue };
        let label = value.to_string();
        if !groups.contains_key(&label) {
            order.push(label.clone());
        }
        groups.entry(label).or_default().push(row);
    }
    order
        .into_iter()
        .map(|label| {
            let rows = groups.get(&label).map(Vec::as_slice).unwrap_or(&[]);
            let value = reduce(rows);
            Bucket::new(label, value)
        })
        .collect()
}

/// Counts per value, most frequent first, ties by label.
fn value_counts(result: &ExecutionResult, idx: usize) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for value in result.column_values(idx).filter(|v| !v.is_null()) {
        *counts.entry(value.to_string()).or_default() += 1;
    }
    let mut counts: Vec<(String, usize)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts
}

fn as_buckets(counts: Vec<(String, usize)>) -> Vec<Bucket> {
    counts
        .into_iter()
        .map(|(label, n)| Bucket::new(label, Metric::Value(n as f64)))
        .collect()
}

/// Minutes since midnight, from a clock time or a full datetime.
fn clock_minutes(value: &Scalar) -> Option<f64> {
    let Scalar::Text(text) = value else { return None };
    let time = parse_temporal(text).map(|dt| dt.time()).or_else(|| {
        ["%H:%M:%S", "%H:%M"]
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(text.trim(), f).ok())
    })?;
    Some(time.num_seconds_from_midnight() as f64 / 60.0)
}

fn least_squares_slope(points: &[(f64, f64)]) -> f64 {
    let n = points.len() as f64;
    let mean_x = points.iter().map(|p| p.0).sum::<f64>() / n;
    let mean_y = points.iter().map(|p| p.1).sum::<f64>() / n;
    let numerator: f64 = points.iter().map(|(x, y)| (x - mean_x) * (y - mean_y)).sum();
    let denominator: f64 = points.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}
