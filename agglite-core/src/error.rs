// agglite-core/src/error.rs
// Error types for the aggregation pipeline engine

use std::fmt;

/// Aggregation pipeline error
///
/// All errors surface upward through `advance`/`current`; stages never
/// catch. Once a pipeline has failed it must be disposed and discarded.
#[derive(Debug, Clone, PartialEq)]
pub enum AggLiteError {
    /// Malformed stage configuration (e.g. `limit: 0`, mixed include/exclude)
    InvalidSpec(String),
    /// Value-level type error during evaluation
    TypeMismatch(String),
    /// A projection omits a field the downstream pipeline requires
    MissingDependency(String),
    /// The storage cursor is no longer usable after a yield
    CursorInvalidated,
    /// Cooperative cancellation observed
    Interrupted,
    /// `current()` called after the stage reported EOF
    ExhaustedSource(&'static str),
    /// A stage was linked to an upstream twice
    AlreadyLinked(&'static str),
    /// Expression evaluation failed
    EvaluationError(String),
    /// JSON (de)serialization failure
    Serialization(String),
}

impl fmt::Display for AggLiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggLiteError::InvalidSpec(msg) => write!(f, "Invalid stage specification: {}", msg),
            AggLiteError::TypeMismatch(msg) => write!(f, "Type mismatch: {}", msg),
            AggLiteError::MissingDependency(path) => {
                write!(f, "Projection omits required field: {}", path)
            }
            AggLiteError::CursorInvalidated => write!(f, "Cursor invalidated during yield"),
            AggLiteError::Interrupted => write!(f, "Operation interrupted"),
            AggLiteError::ExhaustedSource(stage) => {
                write!(f, "current() called on exhausted stage: {}", stage)
            }
            AggLiteError::AlreadyLinked(stage) => {
                write!(f, "Stage linked to an upstream twice: {}", stage)
            }
            AggLiteError::EvaluationError(msg) => write!(f, "Expression evaluation failed: {}", msg),
            AggLiteError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for AggLiteError {}

impl From<serde_json::Error> for AggLiteError {
    fn from(err: serde_json::Error) -> Self {
        AggLiteError::Serialization(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AggLiteError>;
