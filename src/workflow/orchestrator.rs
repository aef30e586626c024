//! Workflow Orchestrator
//!
//! Drives one [`WorkflowState`] through the stage graph. Each stage handler
//! does its work, reports an [`Outcome`], and the transition table picks the
//! next stage. A run always ends in a [`Report`]; failures surface only
//! through its status.

use crate::catalog::SchemaCatalog;
use crate::config::PipelineSettings;
use crate::execution::{ErrorClassifier, QueryExecutor};
use crate::intent::IntentClassifier;
use crate::kpi::KpiEngine;
use crate::llm::ModelPort;
use crate::query::Query;
use crate::report::{
    fallback_narrative, ChartDecision, ChartSelector, Degradation, DegradationKind, Report, ReportAssembler,
    ReportDraft, Summarizer,
};
use crate::schema_rag::{SchemaContext, SchemaRetriever};
use crate::sql::{
    AttemptOutcome, AttemptRecord, DialectNormalizer, RejectionReason, SqlGenerator, SqlValidator, Verdict,
};
use crate::workflow::state::WorkflowState;
use crate::workflow::transitions::{Outcome, Stage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Shared stop signal, checked before every stage.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

type StageResult = (Outcome, Option<String>);

pub struct Orchestrator {
    catalog: Arc<SchemaCatalog>,
    retriever: Arc<dyn SchemaRetriever>,
    executor: Arc<dyn QueryExecutor>,
    classifier: IntentClassifier,
    generator: SqlGenerator,
    validator: SqlValidator,
    normalizer: DialectNormalizer,
    error_classifier: ErrorClassifier,
    kpi_engine: KpiEngine,
    chart_selector: ChartSelector,
    summarizer: Summarizer,
    assembler: ReportAssembler,
    settings: PipelineSettings,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        model: ModelPort,
        executor: Arc<dyn QueryExecutor>,
        retriever: Arc<dyn SchemaRetriever>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            validator: SqlValidator::new(Arc::clone(&catalog)).with_max_chars(settings.max_statement_chars),
            catalog,
            retriever,
            executor,
            classifier: IntentClassifier::new(model.clone()),
            generator: SqlGenerator::new(model.clone(), settings.schema_top_k),
            normalizer: DialectNormalizer::new(),
            error_classifier: ErrorClassifier::new(),
            kpi_engine: KpiEngine::new(),
            chart_selector: ChartSelector::new(model.clone()),
            summarizer: Summarizer::new(model),
            assembler: ReportAssembler::new(),
            settings,
        }
    }

    pub async fn run(&self, query: Query) -> Report {
        self.run_traced(query, &CancelFlag::new()).await.0
    }

    pub async fn run_with_cancel(&self, query: Query, cancel: &CancelFlag) -> Report {
        self.run_traced(query, cancel).await.0
    }

    /// Run to completion and hand back the state alongside the report.
    pub async fn run_traced(&self, query: Query, cancel: &CancelFlag) -> (Report, WorkflowState) {
        info!("Run {} started: {}", query.id, query.text);
        let mut state = WorkflowState::new(query);

        while !state.is_finished() {
            if cancel.is_cancelled() && !state.draft.cancelled && state.stage != Stage::Assemble {
                state.draft.cancelled = true;
                state.degrade(Degradation::new(state.stage, DegradationKind::Cancelled, "cancelled"));
                state.advance(Outcome::Exhausted, Some("cancelled".to_string()));
                continue;
            }

            let (outcome, detail) = match state.stage {
                Stage::Classify => self.classify(&mut state).await,
                Stage::Retrieve => self.retrieve(&mut state),
                Stage::Generate => self.generate(&mut state).await,
                Stage::Validate => self.validate(&mut state),
                Stage::Normalize => self.normalize(&mut state),
                Stage::Execute => self.execute(&mut state, cancel).await,
                Stage::Compute => self.compute(&mut state),
                Stage::Chart => self.chart(&mut state).await,
                Stage::Summarize => self.summarize(&mut state).await,
                Stage::Assemble => self.assemble(&mut state),
                Stage::Finished => break,
            };
            state.advance(outcome, detail);
        }

        let report = match state.report.take() {
            Some(report) => report,
            None => {
                let query = state.query().clone();
                let draft = std::mem::replace(&mut state.draft, ReportDraft::new(query));
                self.assembler.assemble(draft)
            }
        };
        info!("Run {} finished with status {}", report.query.id, report.status);
        (report, state)
    }

    async fn classify(&self, state: &mut WorkflowState) -> StageResult {
        let classification = self.classifier.classify(&state.draft.query.text).await;
        state.draft.intent = classification.intent;
        match classification.fallback_reason {
            Some(reason) => {
                state.degrade(Degradation::new(
                    Stage::Classify,
                    DegradationKind::ClassificationFailure,
                    reason.clone(),
                ));
                (Outcome::Degraded, Some(reason))
            }
            None => (Outcome::Succeeded, Some(classification.intent.to_string())),
        }
    }

    fn retrieve(&self, state: &mut WorkflowState) -> StageResult {
        let (context, fallback_reason) = match self.retriever.rank(&state.draft.query.text, &self.catalog) {
            Ok(context) if context.degraded => (context, Some("retriever returned an unranked table set".to_string())),
            Ok(context) => (context, None),
            Err(e) => {
                warn!("Ranking unavailable, using every table: {}", e);
                (SchemaContext::all_tables(&self.catalog), Some(format!("ranking unavailable: {}", e)))
            }
        };

        state.draft.tables_used = context
            .prompt_tables(self.settings.schema_top_k)
            .iter()
            .map(|t| t.name.clone())
            .collect();
        let ranked = state.draft.tables_used.join(", ");
        state.schema = Some(context);

        match fallback_reason {
            Some(reason) => {
                state.degrade(Degradation::new(
                    Stage::Retrieve,
                    DegradationKind::RetrievalDegraded,
                    reason.clone(),
                ));
                (Outcome::Degraded, Some(reason))
            }
            None => (Outcome::Succeeded, Some(ranked)),
        }
    }

    async fn generate(&self, state: &mut WorkflowState) -> StageResult {
        let attempt = state.begin_attempt(Stage::Generate);
        info!("SQL attempt {} of {}", attempt, Stage::Generate.attempt_budget());
        state.candidate = None;

        let schema = state.schema.clone().unwrap_or_else(|| SchemaContext::all_tables(&self.catalog));
        let proposal = self
            .generator
            .propose(
                &state.draft.query.text,
                state.draft.intent,
                &schema,
                state.feedback.as_deref(),
                attempt,
            )
            .await;

        match proposal {
            Ok(candidate) => {
                state.candidate = Some(candidate);
                (Outcome::Succeeded, None)
            }
            Err(e) => {
                let message = format!("SQL generation failed: {}", e);
                state.record_attempt(AttemptRecord {
                    attempt,
                    candidate: None,
                    executed_statement: None,
                    outcome: AttemptOutcome::GenerationFailed {
                        message: message.clone(),
                    },
                });
                self.fail_sql_attempt(state, Stage::Generate, message)
            }
        }
    }

    fn validate(&self, state: &mut WorkflowState) -> StageResult {
        let Some(candidate) = state.candidate.take() else {
            return self.fail_sql_attempt(state, Stage::Validate, "no candidate to validate".to_string());
        };

        match self.validator.validate(&candidate) {
            Verdict::Accepted => {
                state.candidate = Some(candidate.with_verdict(Verdict::Accepted));
                (Outcome::Succeeded, None)
            }
            verdict => {
                let reason = match &verdict {
                    Verdict::Rejected { reason } => reason.clone(),
                    _ => RejectionReason::Malformed {
                        detail: "statement was not checked".to_string(),
                    },
                };
                let attempt = candidate.attempt;
                warn!("Attempt {} rejected: {}", attempt, reason);
                state.record_attempt(AttemptRecord {
                    attempt,
                    candidate: Some(candidate.with_verdict(verdict)),
                    executed_statement: None,
                    outcome: AttemptOutcome::Rejected { reason: reason.clone() },
                });
                self.fail_sql_attempt(state, Stage::Validate, format!("The statement was rejected: {}", reason))
            }
        }
    }

    fn normalize(&self, state: &mut WorkflowState) -> StageResult {
        match state.candidate.as_ref() {
            Some(candidate) => {
                let normalized = self.normalizer.normalize_candidate(candidate);
                let changed = normalized.statement != candidate.statement;
                state.candidate = Some(normalized);
                (Outcome::Succeeded, changed.then(|| "dialect rewritten".to_string()))
            }
            None => (Outcome::Exhausted, Some("no candidate to normalize".to_string())),
        }
    }

    async fn execute(&self, state: &mut WorkflowState, cancel: &CancelFlag) -> StageResult {
        let Some(candidate) = state.candidate.take() else {
            return self.fail_sql_attempt(state, Stage::Execute, "no candidate to execute".to_string());
        };
        let attempt = candidate.attempt;

        // The rewritten text is what runs, so it must pass the same gate.
        let gate = if candidate.is_accepted() {
            self.validator.check(&candidate.statement)
        } else {
            Err(RejectionReason::Malformed {
                detail: "statement was not accepted by validation".to_string(),
            })
        };
        if let Err(reason) = gate {
            state.record_attempt(AttemptRecord {
                attempt,
                candidate: Some(candidate),
                executed_statement: None,
                outcome: AttemptOutcome::Rejected { reason: reason.clone() },
            });
            return self.fail_sql_attempt(state, Stage::Execute, format!("The statement was rejected: {}", reason));
        }

        let statement = candidate.statement.clone();
        let result = self.executor.execute(&statement).await;

        if cancel.is_cancelled() {
            state.draft.cancelled = true;
            state.degrade(Degradation::new(Stage::Execute, DegradationKind::Cancelled, "cancelled"));
            return (Outcome::Exhausted, Some("cancelled during execution".to_string()));
        }

        match result {
            Ok(result) => {
                state.record_attempt(AttemptRecord {
                    attempt,
                    candidate: Some(candidate),
                    executed_statement: Some(statement.clone()),
                    outcome: AttemptOutcome::Succeeded {
                        row_count: result.row_count,
                    },
                });
                let detail = format!("{} rows in {}ms", result.row_count, result.duration_ms);
                state.draft.sql = Some(statement);
                state.draft.data = Some(result);
                (Outcome::Succeeded, Some(detail))
            }
            Err(e) => {
                let (kind, feedback) = self.error_classifier.feedback(&e);
                warn!("Attempt {} failed on {} ({}): {}", attempt, self.executor.name(), kind, e);
                state.record_attempt(AttemptRecord {
                    attempt,
                    candidate: Some(candidate),
                    executed_statement: Some(statement),
                    outcome: AttemptOutcome::ExecutionFailed {
                        kind,
                        message: e.to_string(),
                    },
                });
                self.fail_sql_attempt(state, Stage::Execute, feedback)
            }
        }
    }

    /// Shared failure path of the SQL loop: keep the reason for the next
    /// proposal, or record why the loop gave up.
    fn fail_sql_attempt(&self, state: &mut WorkflowState, stage: Stage, feedback: String) -> StageResult {
        let outcome = state.retry_or_exhaust(stage);
        if outcome == Outcome::Exhausted {
            let kind = match state.draft.attempts.last().map(|a| &a.outcome) {
                Some(AttemptOutcome::ExecutionFailed { .. }) => DegradationKind::ExecutionFailed,
                _ => DegradationKind::GenerationRejected,
            };
            state.degrade(Degradation::new(
                stage,
                kind,
                format!(
                    "no usable result after {} attempt(s): {}",
                    state.attempts_used(stage),
                    feedback
                ),
            ));
        }
        state.feedback = Some(feedback.clone());
        (outcome, Some(feedback))
    }

    fn compute(&self, state: &mut WorkflowState) -> StageResult {
        let Some(data) = state.draft.data.as_ref() else {
            return (Outcome::Exhausted, Some("no result to compute over".to_string()));
        };

        let kpis = self.kpi_engine.compute_for(state.draft.intent, data);
        let empty = data.is_empty();
        let detail = format!("{} KPIs", kpis.len());
        state.draft.kpis = kpis;

        if empty {
            state.degrade(Degradation::new(
                Stage::Compute,
                DegradationKind::ComputationEmpty,
                "the query returned no rows",
            ));
            (Outcome::Degraded, Some("no rows".to_string()))
        } else {
            (Outcome::Succeeded, Some(detail))
        }
    }

    async fn chart(&self, state: &mut WorkflowState) -> StageResult {
        let intent = state.draft.intent;
        let decision = match state.draft.data.as_ref() {
            Some(data) => self.chart_selector.decide(intent, data),
            None => return (Outcome::Exhausted, Some("no result to chart".to_string())),
        };

        match decision {
            ChartDecision::Chart(spec) => {
                let detail = format!("{:?} chart from rules", spec.kind);
                state.draft.chart = Some(spec);
                return (Outcome::Succeeded, Some(detail));
            }
            ChartDecision::NoChart(reason) => return (Outcome::Succeeded, Some(format!("no chart: {}", reason))),
            ChartDecision::NoMatch if !ChartSelector::fallback_allowed(intent) => {
                return (Outcome::Succeeded, Some("no chart rule matched".to_string()))
            }
            ChartDecision::NoMatch => {}
        }

        let attempt = state.begin_attempt(Stage::Chart);
        let Some(data) = state.draft.data.as_ref() else {
            return (Outcome::Exhausted, Some("no result to chart".to_string()));
        };
        let proposal = self
            .chart_selector
            .propose(&state.draft.query.text, intent, data, state.feedback.as_deref())
            .await;

        match proposal {
            Ok(Some(spec)) => {
                let detail = format!("{:?} chart proposed on attempt {}", spec.kind, attempt);
                state.draft.chart = Some(spec);
                (Outcome::Succeeded, Some(detail))
            }
            Ok(None) => (Outcome::Succeeded, Some("model declined a chart".to_string())),
            Err(e) => {
                let message = e.to_string();
                let outcome = state.retry_or_exhaust(Stage::Chart);
                if outcome == Outcome::Retry {
                    state.feedback = Some(message.clone());
                    (Outcome::Retry, Some(message))
                } else {
                    state.degrade(Degradation::new(
                        Stage::Chart,
                        DegradationKind::ChartFailure,
                        format!("chart omitted after {} proposal(s): {}", attempt, message),
                    ));
                    (Outcome::Degraded, Some(message))
                }
            }
        }
    }

    async fn summarize(&self, state: &mut WorkflowState) -> StageResult {
        if state.draft.kpis.is_empty() {
            state.draft.narrative = Some(fallback_narrative(&state.draft.kpis));
            return (Outcome::Succeeded, Some("nothing to summarize".to_string()));
        }

        match self
            .summarizer
            .summarize(&state.draft.query.text, state.draft.intent, &state.draft.kpis)
            .await
        {
            Ok(text) => {
                state.draft.narrative = Some(text);
                (Outcome::Succeeded, None)
            }
            Err(e) => {
                state.draft.narrative = Some(fallback_narrative(&state.draft.kpis));
                let reason = format!("narrative replaced by KPI template: {}", e);
                state.degrade(Degradation::new(
                    Stage::Summarize,
                    DegradationKind::SummarizationFailure,
                    reason.clone(),
                ));
                (Outcome::Degraded, Some(reason))
            }
        }
    }

    fn assemble(&self, state: &mut WorkflowState) -> StageResult {
        let query = state.draft.query.clone();
        let draft = std::mem::replace(&mut state.draft, ReportDraft::new(query));
        let report = self.assembler.assemble(draft);
        let detail = report.status.to_string();
        state.report = Some(report);
        (Outcome::Succeeded, Some(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TableSchema;
    use crate::execution::{ExecutionResult, Scalar};
    use crate::llm::{PromptPurpose, ScriptedModel, ScriptedReply};
    use crate::report::ReportStatus;
    use crate::schema_rag::LexicalRanker;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct FixedExecutor {
        result: ExecutionResult,
        statements: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl QueryExecutor for FixedExecutor {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, sql: &str) -> crate::error::Result<ExecutionResult> {
            self.statements.lock().unwrap().push(sql.to_string());
            Ok(self.result.clone())
        }
    }

    fn catalog() -> Arc<SchemaCatalog> {
        Arc::new(SchemaCatalog::new(
            vec![TableSchema::new("production_orders")
                .primary_key("order_id", "TEXT")
                .column("line_id", "TEXT")
                .column("quantity_planned", "REAL")
                .column("quantity_actual", "REAL")],
            Vec::new(),
        ))
    }

    fn orchestrator(model: Arc<ScriptedModel>, executor: Arc<FixedExecutor>) -> Orchestrator {
        Orchestrator::new(
            catalog(),
            ModelPort::new(model, Duration::from_millis(100), 256),
            executor,
            Arc::new(LexicalRanker::new()),
            PipelineSettings::default(),
        )
    }

    fn executor() -> Arc<FixedExecutor> {
        Arc::new(FixedExecutor {
            result: ExecutionResult::new(
                vec!["total_planned".to_string(), "total_actual".to_string()],
                vec![vec![Scalar::Real(100.0), Scalar::Real(90.0)]],
            ),
            statements: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_normalized_statement_is_what_runs() {
        let model = Arc::new(
            ScriptedModel::new()
                .reply(PromptPurpose::Classify, ScriptedReply::text(r#"{"intent":"AGGREGATION"}"#))
                .reply(
                    PromptPurpose::GenerateSql,
                    ScriptedReply::text(
                        "SELECT SUM(quantity_planned) AS total_planned, SUM(quantity_actual) AS total_actual \
                         FROM production_orders WHERE line_id ILIKE 'line-3'",
                    ),
                )
                .reply(PromptPurpose::Summarize, ScriptedReply::text("Planned 100, actual 90.")),
        );
        let exec = executor();
        let (report, state) = orchestrator(model, exec.clone())
            .run_traced(Query::new("planned vs actual for line 3"), &CancelFlag::new())
            .await;

        assert_eq!(report.status, ReportStatus::Completed);
        let ran = exec.statements.lock().unwrap().clone();
        assert_eq!(ran.len(), 1);
        assert!(ran[0].contains(" LIKE 'line-3'"));
        assert_eq!(report.sql.as_deref(), Some(ran[0].as_str()));
        assert_eq!(state.path().last(), Some(&Stage::Finished));
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_without_model_calls() {
        let model = Arc::new(ScriptedModel::new());
        let cancel = CancelFlag::new();
        cancel.cancel();

        let (report, state) = orchestrator(model.clone(), executor())
            .run_traced(Query::new("anything"), &cancel)
            .await;

        assert_eq!(report.status, ReportStatus::Failed);
        assert_eq!(report.status_reason.as_deref(), Some("cancelled"));
        assert!(model.calls().is_empty());
        assert_eq!(state.path(), vec![Stage::Classify, Stage::Assemble, Stage::Finished]);
    }
}
