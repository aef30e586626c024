mod common;

use common::*;
use shopfloor_analyst::execution::ExecutionErrorKind;
use shopfloor_analyst::kpi::Metric;
use shopfloor_analyst::llm::{PromptPurpose, ScriptedModel, ScriptedReply};
use shopfloor_analyst::report::{check_provenance, ChartKind, DegradationKind, ReportStatus};
use shopfloor_analyst::sql::{AttemptOutcome, RejectionReason};
use shopfloor_analyst::workflow::{CancelFlag, Stage};
use shopfloor_analyst::{Intent, Query};
use std::sync::atomic::Ordering;
use std::sync::Arc;

const LINE3_DAILY_YIELD: &str = "```sql
SELECT po.order_date,
       SUM(po.quantity_planned) AS quantity_planned,
       SUM(po.quantity_actual) AS quantity_actual
FROM production_orders po
JOIN line_master lm ON po.line_id = lm.line_id
WHERE lm.line_id = 'LINE-3'
  AND po.order_date >= '2024-03-04'
GROUP BY po.order_date
ORDER BY po.order_date
```";

const LINE3_TOTALS: &str = "SELECT SUM(quantity_planned) AS total_planned, SUM(quantity_actual) AS total_actual \
                            FROM production_orders WHERE line_id = 'LINE-3'";

#[tokio::test]
async fn test_line_yield_question_completes() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text(r#"{"intent": "TREND"}"#))
            .reply(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_DAILY_YIELD))
            .reply(
                PromptPurpose::Summarize,
                ScriptedReply::text("LINE-3 ran at a 92.67% yield this week on 1,200 planned units."),
            ),
    );
    let orchestrator = seeded_orchestrator(model.clone());

    let (report, state) = orchestrator
        .run_traced(Query::new("What was the yield for LINE-3 this week?"), &CancelFlag::new())
        .await;

    let schema = state.schema.as_ref().unwrap();
    let staff = schema.position("staff").unwrap();
    assert!(schema.position("production_orders").unwrap() < staff);
    assert!(schema.position("line_master").unwrap() < staff);

    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
    assert_eq!(report.intent, Intent::Trend);
    assert_eq!(report.row_count, 3);
    let yield_pct = report.kpis.value("yield_pct").unwrap();
    assert!((85.0..=98.0).contains(&yield_pct), "yield_pct = {}", yield_pct);
    assert_eq!(yield_pct, 92.67);
    assert!(report.kpis.contains("yield_pct_trend"));

    let chart = report.chart.as_ref().unwrap();
    assert_eq!(chart.kind, ChartKind::Line);
    assert_eq!(chart.x, "order_date");

    assert_eq!(report.attempts.len(), 1);
    assert_eq!(check_provenance(&report.narrative, &report.kpis), Ok(()));
    assert_eq!(
        state.path(),
        vec![
            Stage::Classify,
            Stage::Retrieve,
            Stage::Generate,
            Stage::Validate,
            Stage::Normalize,
            Stage::Execute,
            Stage::Compute,
            Stage::Chart,
            Stage::Summarize,
            Stage::Assemble,
            Stage::Finished,
        ]
    );
}

#[tokio::test]
async fn test_mutating_statement_is_rejected_then_corrected() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(PromptPurpose::GenerateSql, ScriptedReply::text("DELETE FROM production_orders"))
            .reply(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_TOTALS))
            .reply(
                PromptPurpose::Summarize,
                ScriptedReply::text("LINE-3 delivered 1112 of 1200 planned units."),
            ),
    );
    let orchestrator = seeded_orchestrator(model.clone());

    let report = orchestrator.run(Query::new("How much did LINE-3 produce against plan?")).await;

    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
    assert_eq!(report.attempts.len(), 2);
    assert!(matches!(
        &report.attempts[0].outcome,
        AttemptOutcome::Rejected { reason: RejectionReason::MutatingKeyword { keyword } } if keyword == "DELETE"
    ));
    assert_eq!(report.attempts[0].executed_statement, None);
    assert!(matches!(report.attempts[1].outcome, AttemptOutcome::Succeeded { row_count: 1 }));

    let prompts = model.prompts_for(PromptPurpose::GenerateSql);
    assert_eq!(prompts.len(), 2);
    assert!(!prompts[0].contains("PREVIOUS ATTEMPT FAILED"));
    assert!(prompts[1].contains("PREVIOUS ATTEMPT FAILED"));
    assert!(prompts[1].contains("Forbidden keyword detected: DELETE"));

    assert_eq!(report.kpis.value("total_actual"), Some(1112.0));
    assert!(report.chart.is_none());
}

#[tokio::test]
async fn test_unreachable_store_fails_after_three_attempts() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .always(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_TOTALS)),
    );
    let executor = Arc::new(UnreachableExecutor::default());
    let orchestrator = orchestrator(model.clone(), executor.clone());

    let report = orchestrator.run(Query::new("How much did LINE-3 produce?")).await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert!(report.kpis.is_empty());
    assert!(report.chart.is_none());
    assert!(report.data.is_none());
    assert!(report.narrative.starts_with("The data could not be retrieved after 3 attempt(s)."));
    assert!(report.has_degradation(DegradationKind::ExecutionFailed));

    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    assert_eq!(model.calls_for(PromptPurpose::GenerateSql), 3);
    assert_eq!(model.calls_for(PromptPurpose::Summarize), 0);
    assert!(report.attempts.iter().all(|a| matches!(
        a.outcome,
        AttemptOutcome::ExecutionFailed {
            kind: ExecutionErrorKind::Unavailable,
            ..
        }
    )));

    let prompts = model.prompts_for(PromptPurpose::GenerateSql);
    assert!(prompts[2].contains("unable to open database file"));
}

#[tokio::test]
async fn test_single_row_lookup_has_no_chart() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text(r#"{"intent": "LOOKUP"}"#))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text("SELECT * FROM production_orders WHERE order_id = 'PO-1042'"),
            )
            .reply(
                PromptPurpose::Summarize,
                ScriptedReply::text("Order PO-1042 on LINE-3 planned 300 units and delivered 285."),
            ),
    );
    let orchestrator = seeded_orchestrator(model.clone());

    let report = orchestrator.run(Query::new("Show me details for order PO-1042")).await;

    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
    assert_eq!(report.intent, Intent::Lookup);
    assert_eq!(report.row_count, 1);
    assert!(report.chart.is_none());
    assert_eq!(model.calls_for(PromptPurpose::ChartFallback), 0);
    assert_eq!(report.narrative, "Order PO-1042 on LINE-3 planned 300 units and delivered 285.");
}

#[tokio::test]
async fn test_invented_number_falls_back_to_template() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_TOTALS))
            .reply(
                PromptPurpose::Summarize,
                ScriptedReply::text("LINE-3 hit 97.4% yield, best in the plant."),
            ),
    );
    let orchestrator = seeded_orchestrator(model);

    let report = orchestrator.run(Query::new("LINE-3 totals")).await;

    assert_eq!(report.status, ReportStatus::Partial);
    assert!(report.has_degradation(DegradationKind::SummarizationFailure));
    assert!(report.narrative.starts_with("The query returned 1 rows."));
    assert!(!report.narrative.contains("97.4"));
    assert_eq!(check_provenance(&report.narrative, &report.kpis), Ok(()));
}

#[tokio::test]
async fn test_chart_fallback_is_bounded() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("REPORT"))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text(
                    "SELECT quantity_planned, quantity_actual FROM production_orders WHERE line_id = 'LINE-1'",
                ),
            )
            .always(PromptPurpose::ChartFallback, ScriptedReply::text("a pie chart would be lovely"))
            .reply(PromptPurpose::Summarize, ScriptedReply::text("LINE-1 planned 850 units.")),
    );
    let orchestrator = seeded_orchestrator(model.clone());

    let (report, state) = orchestrator
        .run_traced(Query::new("Give me an overview of LINE-1"), &CancelFlag::new())
        .await;

    assert_eq!(model.calls_for(PromptPurpose::ChartFallback), 2);
    assert!(report.chart.is_none());
    assert!(report.has_degradation(DegradationKind::ChartFailure));
    assert_eq!(report.status, ReportStatus::Partial);

    let chart_entries = state.path().iter().filter(|s| **s == Stage::Chart).count();
    assert_eq!(chart_entries, 2);
    let second_prompt = &model.prompts_for(PromptPurpose::ChartFallback)[1];
    assert!(second_prompt.contains("YOUR PREVIOUS PROPOSAL WAS UNUSABLE"));
}

#[tokio::test]
async fn test_chart_fallback_proposal_is_used() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("COMPARISON"))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text(
                    "SELECT quantity_planned, quantity_actual FROM production_orders WHERE line_id = 'LINE-1'",
                ),
            )
            .reply(
                PromptPurpose::ChartFallback,
                ScriptedReply::text(r#"{"kind": "scatter", "x": "quantity_planned", "y": "quantity_actual"}"#),
            )
            .reply(PromptPurpose::Summarize, ScriptedReply::text("LINE-1 planned 850 units.")),
    );
    let report = seeded_orchestrator(model.clone())
        .run(Query::new("Compare planned and actual on LINE-1"))
        .await;

    let chart = report.chart.as_ref().unwrap();
    assert_eq!(chart.kind, ChartKind::Scatter);
    assert_eq!(chart.y, vec!["quantity_actual".to_string()]);
    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
}

#[tokio::test]
async fn test_model_timeouts_consume_attempts() {
    let model = Arc::new(
        ScriptedModel::new()
            .always(PromptPurpose::Classify, ScriptedReply::Hang)
            .always(PromptPurpose::GenerateSql, ScriptedReply::Hang),
    );
    let report = seeded_orchestrator(model.clone())
        .run(Query::new("What was the yield for LINE-3 this week?"))
        .await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.intent, Intent::Report);
    assert!(report.has_degradation(DegradationKind::ClassificationFailure));
    assert!(report.has_degradation(DegradationKind::GenerationRejected));
    assert_eq!(model.calls_for(PromptPurpose::GenerateSql), 3);
    assert_eq!(report.attempts.len(), 3);
    assert!(report.attempts.iter().all(|a| matches!(a.outcome, AttemptOutcome::GenerationFailed { .. })));
}

#[tokio::test]
async fn test_empty_result_is_partial_without_summary_call() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text("SELECT * FROM production_orders WHERE line_id = 'LINE-9'"),
            ),
    );
    let report = seeded_orchestrator(model.clone()).run(Query::new("orders on LINE-9")).await;

    assert_eq!(report.status, ReportStatus::Partial);
    assert!(report.has_degradation(DegradationKind::ComputationEmpty));
    assert!(report.kpis.is_empty());
    assert_eq!(report.narrative, "The query returned no rows, so there are no figures to report.");
    assert_eq!(model.calls_for(PromptPurpose::Summarize), 0);
}

#[tokio::test]
async fn test_dialect_is_normalized_before_execution() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text(
                    "SELECT COUNT(*) AS order_count FROM production_orders \
                     WHERE status ILIKE 'COMPLETED' AND EXTRACT(YEAR FROM order_date) = 2024",
                ),
            )
            .reply(PromptPurpose::Summarize, ScriptedReply::text("There were 4 completed orders.")),
    );
    let report = seeded_orchestrator(model).run(Query::new("completed orders this year")).await;

    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.attempts);
    let sql = report.sql.as_deref().unwrap();
    assert!(sql.contains("LIKE 'COMPLETED'"));
    assert!(!sql.contains("ILIKE"));
    assert!(sql.contains("strftime('%Y', order_date)"));
    assert_eq!(report.kpis.value("order_count"), Some(4.0));
}

#[tokio::test]
async fn test_unknown_column_feedback_carries_suggestion() {
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text("SELECT SUM(po.qty_actual) AS total_actual FROM production_orders po"),
            )
            .reply(
                PromptPurpose::GenerateSql,
                ScriptedReply::text("SELECT SUM(po.quantity_actual) AS total_actual FROM production_orders po"),
            )
            .reply(PromptPurpose::Summarize, ScriptedReply::text("Total output was 1792 units.")),
    );
    let report = seeded_orchestrator(model.clone()).run(Query::new("total output")).await;

    assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
    assert_eq!(report.attempts.len(), 2);
    let retry_prompt = &model.prompts_for(PromptPurpose::GenerateSql)[1];
    assert!(retry_prompt.contains("Column 'qty_actual' does not exist on table 'production_orders'"));
}

#[tokio::test]
async fn test_cancellation_discards_in_flight_result() {
    let (_, store) = seeded_store();
    let cancel = CancelFlag::new();
    let executor = Arc::new(CancellingExecutor {
        inner: store,
        cancel: cancel.clone(),
    });
    let model = Arc::new(
        ScriptedModel::new()
            .reply(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .reply(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_TOTALS)),
    );
    let orchestrator = orchestrator(model.clone(), executor);

    let (report, state) = orchestrator.run_traced(Query::new("LINE-3 totals"), &cancel).await;

    assert_eq!(report.status, ReportStatus::Failed);
    assert_eq!(report.status_reason.as_deref(), Some("cancelled"));
    assert!(report.data.is_none());
    assert!(report.kpis.is_empty());
    assert_eq!(model.calls_for(PromptPurpose::Summarize), 0);
    assert!(!state.path().contains(&Stage::Compute));
}

#[tokio::test]
async fn test_concurrent_runs_are_independent() {
    let model = Arc::new(
        ScriptedModel::new()
            .always(PromptPurpose::Classify, ScriptedReply::text("AGGREGATION"))
            .always(PromptPurpose::GenerateSql, ScriptedReply::text(LINE3_TOTALS))
            .always(PromptPurpose::Summarize, ScriptedReply::text("LINE-3 delivered 1112 units.")),
    );
    let orchestrator = Arc::new(seeded_orchestrator(model.clone()));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.run(Query::new(format!("LINE-3 totals, run {}", i))).await })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let report = handle.await.unwrap();
        assert_eq!(report.status, ReportStatus::Completed, "{:?}", report.degradations);
        assert_eq!(report.kpis.metric("total_actual"), Some(Metric::Value(1112.0)));
        assert_eq!(report.attempts.len(), 1);
        ids.push(report.query.id);
    }
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert_eq!(model.calls_for(PromptPurpose::GenerateSql), 8);
}
