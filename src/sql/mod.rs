pub mod candidate;
pub mod dialect;
pub mod generator;
pub mod validator;

pub use candidate::{AttemptOutcome, AttemptRecord, RejectionReason, SqlCandidate, Verdict};
pub use dialect::DialectNormalizer;
pub use generator::{extract_statement, SqlGenerator};
pub use validator::{SqlValidator, DEFAULT_MAX_STATEMENT_CHARS};
