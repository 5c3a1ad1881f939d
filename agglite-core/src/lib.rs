// agglite-core/src/lib.rs
// Pure Rust aggregation pipeline engine - no storage or network dependencies

pub mod accumulator;
pub mod context;
pub mod cursor;
pub mod dependency;
pub mod document;
pub mod error;
pub mod expression;
pub mod field_path;
pub mod logging;
pub mod matcher;
pub mod pipeline;
pub mod stage;
pub mod value;

// Public exports
pub use context::ExecContext;
pub use cursor::{Collection, CollectionCursor, Cursor, CursorFactory, Pushdown};
pub use dependency::DependencyTracker;
pub use document::{Document, DocumentBuilder};
pub use error::{AggLiteError, Result};
pub use expression::{parse_expression, Expression};
pub use field_path::FieldPath;
pub use logging::{get_log_level, set_log_level, LogLevel};
pub use matcher::Matcher;
pub use pipeline::{Pipeline, PipelineOptions};
pub use stage::{pull_next, Stage};
pub use value::Value;
