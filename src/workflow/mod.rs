//! Pipeline workflow: stage graph, per-run state, and the driver.

pub mod orchestrator;
pub mod state;
pub mod transitions;

pub use orchestrator::{CancelFlag, Orchestrator};
pub use state::{TransitionRecord, WorkflowState};
pub use transitions::{next_stage, Outcome, Stage, CHART_ATTEMPT_BUDGET, DEFAULT_ATTEMPT_BUDGET, SQL_ATTEMPT_BUDGET};
