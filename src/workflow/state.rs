//! Workflow State
//!
//! Working record of one run: where it is, what each retry loop has spent,
//! what it has produced, and how it got here. Owned by a single run and
//! never shared.

use crate::query::Query;
use crate::report::{Degradation, Report, ReportDraft};
use crate::schema_rag::SchemaContext;
use crate::sql::{AttemptRecord, SqlCandidate};
use crate::workflow::transitions::{next_stage, Outcome, Stage};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: Stage,
    pub to: Stage,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

/// Stages that share one retry counter report it under the loop's head.
fn loop_head(stage: Stage) -> Stage {
    match stage {
        Stage::Generate | Stage::Validate | Stage::Normalize | Stage::Execute => Stage::Generate,
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub stage: Stage,
    pub attempts: BTreeMap<Stage, u32>,
    /// Failure text fed into the next attempt of the current loop
    pub feedback: Option<String>,
    pub schema: Option<SchemaContext>,
    /// Candidate currently moving through validate/normalize/execute
    pub candidate: Option<SqlCandidate>,
    pub draft: ReportDraft,
    pub report: Option<Report>,
    pub transitions: Vec<TransitionRecord>,
}

impl WorkflowState {
    pub fn new(query: Query) -> Self {
        Self {
            stage: Stage::Classify,
            attempts: BTreeMap::new(),
            feedback: None,
            schema: None,
            candidate: None,
            draft: ReportDraft::new(query),
            report: None,
            transitions: Vec::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.draft.query
    }

    pub fn is_finished(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Count one more attempt for the loop `stage` belongs to.
    pub fn begin_attempt(&mut self, stage: Stage) -> u32 {
        let counter = self.attempts.entry(loop_head(stage)).or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn attempts_used(&self, stage: Stage) -> u32 {
        self.attempts.get(&loop_head(stage)).copied().unwrap_or(0)
    }

    /// `Retry` while the loop has budget left, `Exhausted` otherwise.
    pub fn retry_or_exhaust(&self, stage: Stage) -> Outcome {
        if self.attempts_used(stage) < stage.attempt_budget() {
            Outcome::Retry
        } else {
            Outcome::Exhausted
        }
    }

    pub fn record_attempt(&mut self, record: AttemptRecord) {
        debug!("Attempt {} recorded: {:?}", record.attempt, record.outcome);
        self.draft.attempts.push(record);
    }

    pub fn degrade(&mut self, degradation: Degradation) {
        info!("Degraded at {}: {:?} ({})", degradation.stage, degradation.kind, degradation.reason);
        self.draft.degradations.push(degradation);
    }

    /// Move along the transition table. Leaving a retry loop clears its
    /// counter and any pending feedback.
    pub fn advance(&mut self, outcome: Outcome, detail: Option<String>) -> Stage {
        let from = self.stage;
        let to = next_stage(from, outcome);

        if loop_head(from) != loop_head(to) {
            if outcome == Outcome::Succeeded {
                self.attempts.remove(&loop_head(from));
            }
            self.feedback = None;
        }

        match &detail {
            Some(d) => info!("{} -> {} ({}): {}", from, to, outcome, d),
            None => info!("{} -> {} ({})", from, to, outcome),
        }
        self.transitions.push(TransitionRecord {
            from,
            to,
            outcome,
            detail,
            at: Utc::now(),
        });
        self.stage = to;
        to
    }

    /// Stages visited, in order, starting with `Classify`.
    pub fn path(&self) -> Vec<Stage> {
        let mut path = vec![Stage::Classify];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_loop_shares_one_counter() {
        let mut state = WorkflowState::new(Query::new("q"));
        state.stage = Stage::Generate;
        assert_eq!(state.begin_attempt(Stage::Generate), 1);
        assert_eq!(state.attempts_used(Stage::Execute), 1);
        assert_eq!(state.retry_or_exhaust(Stage::Validate), Outcome::Retry);

        state.begin_attempt(Stage::Generate);
        state.begin_attempt(Stage::Generate);
        assert_eq!(state.retry_or_exhaust(Stage::Execute), Outcome::Exhausted);
    }

    #[test]
    fn test_advance_logs_and_resets_on_loop_exit() {
        let mut state = WorkflowState::new(Query::new("q"));
        state.stage = Stage::Execute;
        state.begin_attempt(Stage::Generate);
        state.feedback = Some("no such column".to_string());

        assert_eq!(state.advance(Outcome::Succeeded, None), Stage::Compute);
        assert_eq!(state.attempts_used(Stage::Generate), 0);
        assert!(state.feedback.is_none());
        assert_eq!(state.transitions.len(), 1);
        assert_eq!(state.path(), vec![Stage::Classify, Stage::Compute]);
    }

    #[test]
    fn test_retry_keeps_feedback() {
        let mut state = WorkflowState::new(Query::new("q"));
        state.stage = Stage::Validate;
        state.begin_attempt(Stage::Generate);
        state.feedback = Some("unknown table".to_string());

        assert_eq!(state.advance(Outcome::Retry, Some("rejected".to_string())), Stage::Generate);
        assert_eq!(state.feedback.as_deref(), Some("unknown table"));
        assert_eq!(state.attempts_used(Stage::Generate), 1);
    }
}
