pub mod error_classifier;
pub mod result;
pub mod sqlite;

pub use error_classifier::{ErrorClassifier, ExecutionErrorKind};
pub use result::{ExecutionResult, ResultShape, Scalar};
pub use sqlite::{QueryExecutor, SqliteExecutor};
