//! Stage graph
//!
//! The pipeline as a finite-state machine: a closed set of stages, a closed
//! set of stage outcomes, and one table mapping (stage, outcome) to the next
//! stage. The orchestrator never decides routing anywhere else.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attempts allowed for the generate/validate/execute loop.
pub const SQL_ATTEMPT_BUDGET: u32 = 3;
/// Model chart proposals; the decision table itself is not counted.
pub use crate::report::chart::CHART_ATTEMPT_BUDGET;
/// Every other stage runs once.
pub const DEFAULT_ATTEMPT_BUDGET: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Retrieve,
    Generate,
    Validate,
    Normalize,
    Execute,
    Compute,
    Chart,
    Summarize,
    Assemble,
    Finished,
}

impl Stage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Finished)
    }

    /// Budget of the retry loop this stage belongs to.
    pub fn attempt_budget(&self) -> u32 {
        match self {
            Stage::Generate | Stage::Validate | Stage::Normalize | Stage::Execute => SQL_ATTEMPT_BUDGET,
            Stage::Chart => CHART_ATTEMPT_BUDGET,
            _ => DEFAULT_ATTEMPT_BUDGET,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Retrieve => "retrieve",
            Stage::Generate => "generate",
            Stage::Validate => "validate",
            Stage::Normalize => "normalize",
            Stage::Execute => "execute",
            Stage::Compute => "compute",
            Stage::Chart => "chart",
            Stage::Summarize => "summarize",
            Stage::Assemble => "assemble",
            Stage::Finished => "finished",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Succeeded,
    /// Recovered locally with a substitute; the run continues
    Degraded,
    /// Failed with budget left; re-enter the loop
    Retry,
    /// Failed with no budget left
    Exhausted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Outcome::Succeeded => "succeeded",
            Outcome::Degraded => "degraded",
            Outcome::Retry => "retry",
            Outcome::Exhausted => "exhausted",
        };
        f.write_str(label)
    }
}

/// The transition table. Pairs not listed route to `Assemble`, so every
/// path ends in a report.
pub fn next_stage(stage: Stage, outcome: Outcome) -> Stage {
    use Outcome::*;
    use Stage::*;

    match (stage, outcome) {
        (Classify, Succeeded | Degraded) => Retrieve,
        (Retrieve, Succeeded | Degraded) => Generate,

        (Generate, Succeeded) => Validate,
        (Validate, Succeeded) => Normalize,
        (Normalize, Succeeded | Degraded) => Execute,
        (Execute, Succeeded) => Compute,
        (Generate | Validate | Execute, Retry) => Generate,
        (Generate | Validate | Execute, Exhausted) => Assemble,

        (Compute, Succeeded | Degraded) => Chart,
        (Chart, Succeeded | Degraded) => Summarize,
        (Chart, Retry) => Chart,
        (Summarize, Succeeded | Degraded) => Assemble,
        (Assemble, _) => Finished,
        (Finished, _) => Finished,

        _ => Assemble,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_visits_every_stage_once() {
        let mut stage = Stage::Classify;
        let mut visited = vec![stage];
        while !stage.is_terminal() {
            stage = next_stage(stage, Outcome::Succeeded);
            visited.push(stage);
        }
        assert_eq!(
            visited,
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

    #[test]
    fn test_sql_failures_loop_back_to_generation() {
        assert_eq!(next_stage(Stage::Validate, Outcome::Retry), Stage::Generate);
        assert_eq!(next_stage(Stage::Execute, Outcome::Retry), Stage::Generate);
        assert_eq!(next_stage(Stage::Generate, Outcome::Retry), Stage::Generate);
        assert_eq!(next_stage(Stage::Execute, Outcome::Exhausted), Stage::Assemble);
    }

    #[test]
    fn test_degradations_continue_and_unknown_pairs_assemble() {
        assert_eq!(next_stage(Stage::Classify, Outcome::Degraded), Stage::Retrieve);
        assert_eq!(next_stage(Stage::Chart, Outcome::Degraded), Stage::Summarize);
        assert_eq!(next_stage(Stage::Chart, Outcome::Retry), Stage::Chart);
        assert_eq!(next_stage(Stage::Compute, Outcome::Retry), Stage::Assemble);
        assert_eq!(next_stage(Stage::Summarize, Outcome::Exhausted), Stage::Assemble);
    }

    #[test]
    fn test_budgets() {
        assert_eq!(Stage::Execute.attempt_budget(), 3);
        assert_eq!(Stage::Chart.attempt_budget(), 2);
        assert_eq!(Stage::Classify.attempt_budget(), 1);
    }
}
