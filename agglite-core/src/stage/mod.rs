// agglite-core/src/stage/mod.rs
// The pull-iterator contract shared by every pipeline stage

pub mod filter;
pub mod group;
pub mod limit_skip;
pub mod out;
pub mod project;
pub mod sort;
pub mod source;
pub mod unwind;

use std::any::Any;
use std::fmt;

use crate::dependency::DependencyTracker;
use crate::document::{Document, DocumentBuilder};
use crate::error::{AggLiteError, Result};
use crate::value::Value;

pub type BoxedStage = Box<dyn Stage>;

/// One step of a pipeline, implementing the pull iterator contract.
///
/// The pipeline owns its stages in an ordered `Vec`; a stage never holds
/// an owning reference to its upstream (that creates cycles). Instead the
/// chain of upstream stages is passed to every pull call as a borrowed
/// slice, immediate upstream last, and [`pull_next`] drives it.
///
/// Positioning model: stages start *unstarted*. `advance` moves to the
/// next document; `eof` may materialize the first document to answer but
/// is idempotent and never advances past a document. The canonical driver
/// primes with one `advance` and then alternates `current`/`advance`;
/// drivers that test `eof` before `current` see identical output.
pub trait Stage: fmt::Debug + Send {
    /// The stage's `$`-prefixed name, also the key of its serialized form.
    fn name(&self) -> &'static str;

    /// True iff no further document is available.
    fn eof(&mut self, upstream: &mut [BoxedStage]) -> Result<bool>;

    /// Move to the next document; false at EOF. Checks the cooperative
    /// cancellation flag and fails with `Interrupted` when it is set.
    fn advance(&mut self, upstream: &mut [BoxedStage]) -> Result<bool>;

    /// The document the stage is positioned on. `ExhaustedSource` at EOF
    /// or before the first successful positioning.
    fn current(&self) -> Result<Document>;

    /// Record that this stage has been linked to its upstream neighbor.
    /// Linking twice is a programming error (`AlreadyLinked`).
    fn link(&mut self) -> Result<()>;

    /// Release external resources. Iteration afterwards is safe and
    /// reports EOF. Best-effort; never fails.
    fn dispose(&mut self);

    /// Local simplification of internally-held expressions.
    fn optimize(&mut self) {}

    /// Attempt to merge the immediate successor into self. On success the
    /// caller removes the successor from the pipeline. Repeatable.
    fn coalesce(&mut self, _next: &dyn Stage) -> bool {
        false
    }

    /// Rewrite the tracker to reflect what this stage requires from its
    /// input, given what downstream requires from its output.
    fn manage_dependencies(&mut self, _tracker: &mut DependencyTracker) -> Result<()> {
        Ok(())
    }

    /// A single-field document `{name: spec}` describing the stage. With
    /// `explain`, execution statistics are appended after the spec field.
    fn serialize(&self, explain: bool) -> Document;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// The splittable extension, for stages that partition between a
    /// shard-local half and a router-side half.
    fn as_splittable(&mut self) -> Option<&mut dyn SplittableStage> {
        None
    }
}

/// Extension for stages that split between shards and the router.
pub trait SplittableStage {
    /// The stage to run on each shard; `None` means run nothing there.
    fn shard_source(&mut self) -> Option<BoxedStage>;

    /// The stage that combines shard results on the router; `None` means
    /// nothing is needed there.
    fn router_source(&mut self) -> Option<BoxedStage>;
}

/// Iteration position shared by the stage implementations.
#[derive(Debug, Default)]
pub(crate) enum Position {
    #[default]
    Unstarted,
    At(Document),
    Done,
}

impl Position {
    pub(crate) fn is_unstarted(&self) -> bool {
        matches!(self, Position::Unstarted)
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self, Position::Done)
    }

    pub(crate) fn current(&self, stage: &'static str) -> Result<Document> {
        match self {
            Position::At(doc) => Ok(doc.clone()),
            _ => Err(AggLiteError::ExhaustedSource(stage)),
        }
    }
}

/// State every stage carries: the link-once latch, the disposed flag and
/// the output row counter surfaced by explain.
#[derive(Debug, Default)]
pub(crate) struct StageCore {
    linked: bool,
    disposed: bool,
    n_out: u64,
}

impl StageCore {
    pub(crate) fn link(&mut self, name: &'static str) -> Result<()> {
        if self.linked {
            return Err(AggLiteError::AlreadyLinked(name));
        }
        self.linked = true;
        Ok(())
    }

    pub(crate) fn dispose(&mut self) {
        self.disposed = true;
    }

    pub(crate) fn disposed(&self) -> bool {
        self.disposed
    }

    /// Record `next` as the new position, counting emitted documents.
    pub(crate) fn position(&mut self, state: &mut Position, next: Option<Document>) {
        match next {
            Some(doc) => {
                self.n_out += 1;
                *state = Position::At(doc);
            }
            None => *state = Position::Done,
        }
    }

    pub(crate) fn n_out(&self) -> u64 {
        self.n_out
    }
}

/// Advance the last stage of `chain` against the rest and return its
/// current document, or `None` at EOF. An empty chain is EOF.
pub fn pull_next(chain: &mut [BoxedStage]) -> Result<Option<Document>> {
    let Some((last, rest)) = chain.split_last_mut() else {
        return Ok(None);
    };
    if last.advance(rest)? {
        last.current().map(Some)
    } else {
        Ok(None)
    }
}

/// Build the `{name: spec}` stage document, appending `nOut` for explain.
pub(crate) fn stage_document(
    name: &str,
    spec: serde_json::Value,
    n_out: Option<u64>,
) -> Document {
    let mut builder = DocumentBuilder::new();
    builder.insert(name, Value::from_json(&spec));
    if let Some(n) = n_out {
        builder.insert("nOut", Value::Int(n as i64));
    }
    builder.build()
}
