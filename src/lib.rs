//! Shopfloor Analyst
//!
//! Turns a free-text question about manufacturing operations into a report:
//! narrative, computed KPIs and an optional chart. The question runs through
//! a fixed stage graph (classify, retrieve, generate/validate/normalize/
//! execute, compute, chart, summarize, assemble) driven by
//! [`workflow::Orchestrator`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod execution;
pub mod intent;
pub mod kpi;
pub mod llm;
pub mod query;
pub mod report;
pub mod schema_rag;
pub mod sql;
pub mod workflow;

pub use catalog::SchemaCatalog;
pub use error::{AnalyticsError, Result};
pub use query::{Intent, Query};
pub use report::{Report, ReportStatus};
pub use workflow::{CancelFlag, Orchestrator};
