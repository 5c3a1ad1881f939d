// agglite-core/src/stage/out.rs
// $out: pass-through sink feeding a side-effecting collector

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value as Json};

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::stage::{pull_next, stage_document, BoxedStage, Position, Stage, StageCore};

/// Receives every document the sink forwards, exactly once, in pipeline
/// order. Persistence semantics are entirely the collector's.
pub trait DocumentCollector: Send {
    fn collect(&mut self, doc: &Document) -> Result<()>;
}

/// In-memory collector; the handle stays readable after the pipeline is
/// done.
#[derive(Debug, Default)]
pub struct VecCollector {
    docs: Arc<Mutex<Vec<Document>>>,
}

impl VecCollector {
    pub fn new() -> VecCollector {
        VecCollector::default()
    }

    pub fn handle(&self) -> Arc<Mutex<Vec<Document>>> {
        Arc::clone(&self.docs)
    }
}

impl DocumentCollector for VecCollector {
    fn collect(&mut self, doc: &Document) -> Result<()> {
        self.docs.lock().push(doc.clone());
        Ok(())
    }
}

/// Forwards each input document unchanged while offering it to the
/// collector captured at construction.
pub struct OutStage {
    ctx: Arc<ExecContext>,
    target: String,
    collector: Box<dyn DocumentCollector>,
    state: Position,
    core: StageCore,
}

impl fmt::Debug for OutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutStage")
            .field("target", &self.target)
            .finish()
    }
}

impl OutStage {
    pub const NAME: &'static str = "$out";

    pub fn new(
        ctx: Arc<ExecContext>,
        target: impl Into<String>,
        collector: Box<dyn DocumentCollector>,
    ) -> OutStage {
        OutStage {
            ctx,
            target: target.into(),
            collector,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    /// Parse form: the collector defaults to an in-memory one; callers
    /// that persist construct the stage directly with their collector.
    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<OutStage> {
        let Json::String(target) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "$out requires a target name".to_string(),
            ));
        };
        Ok(OutStage::new(ctx, target.clone(), Box::new(VecCollector::new())))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        match pull_next(upstream)? {
            Some(doc) => {
                self.collector.collect(&doc)?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for OutStage {
    fn name(&self) -> &'static str {
        OutStage::NAME
    }

    fn eof(&mut self, upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(true);
        }
        if self.state.is_unstarted() {
            self.step(upstream)?;
        }
        Ok(self.state.is_done())
    }

    fn advance(&mut self, upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(false);
        }
        self.ctx.check_interrupt()?;
        self.step(upstream)?;
        Ok(!self.state.is_done())
    }

    fn current(&self) -> Result<Document> {
        self.state.current(self.name())
    }

    fn link(&mut self) -> Result<()> {
        self.core.link(self.name())
    }

    fn dispose(&mut self) {
        self.core.dispose();
        self.state = Position::Done;
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            json!(self.target),
            explain.then(|| self.core.n_out()),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
