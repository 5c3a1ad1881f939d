// agglite-core/src/stage/limit_skip.rs
// $limit and $skip: counted windows

use std::any::Any;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::context::ExecContext;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::stage::{pull_next, stage_document, BoxedStage, Position, Stage, StageCore};

/// Emits at most `limit` documents. Adjacent limits coalesce to the
/// smaller one.
#[derive(Debug)]
pub struct LimitStage {
    ctx: Arc<ExecContext>,
    limit: u64,
    emitted: u64,
    state: Position,
    core: StageCore,
}

impl LimitStage {
    pub const NAME: &'static str = "$limit";

    pub fn new(ctx: Arc<ExecContext>, limit: i64) -> Result<LimitStage> {
        if limit <= 0 {
            return Err(AggLiteError::InvalidSpec(
                "$limit must be a positive number".to_string(),
            ));
        }
        Ok(LimitStage {
            ctx,
            limit: limit as u64,
            emitted: 0,
            state: Position::Unstarted,
            core: StageCore::default(),
        })
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<LimitStage> {
        match spec.as_i64() {
            Some(n) => LimitStage::new(ctx, n),
            None => Err(AggLiteError::InvalidSpec(
                "$limit must be a positive number".to_string(),
            )),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        if self.emitted >= self.limit {
            return Ok(None);
        }
        match pull_next(upstream)? {
            Some(doc) => {
                self.emitted += 1;
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

impl Stage for LimitStage {
    fn name(&self) -> &'static str {
        LimitStage::NAME
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

    fn coalesce(&mut self, next: &dyn Stage) -> bool {
        let Some(other) = next.as_any().downcast_ref::<LimitStage>() else {
            return false;
        };
        self.limit = self.limit.min(other.limit);
        true
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            json!(self.limit),
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

/// Drops up to `skip` documents on the first pull, then passes everything
/// through. `skip(0)` is the identity. Adjacent skips coalesce by
/// addition; `$limit`/`$skip` order matters, so they never cross-merge.
#[derive(Debug)]
pub struct SkipStage {
    ctx: Arc<ExecContext>,
    skip: u64,
    skipped: bool,
    state: Position,
    core: StageCore,
}

impl SkipStage {
    pub const NAME: &'static str = "$skip";

    pub fn new(ctx: Arc<ExecContext>, skip: i64) -> Result<SkipStage> {
        if skip < 0 {
            return Err(AggLiteError::InvalidSpec(
                "$skip cannot be negative".to_string(),
            ));
        }
        Ok(SkipStage {
            ctx,
            skip: skip as u64,
            skipped: false,
            state: Position::Unstarted,
            core: StageCore::default(),
        })
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<SkipStage> {
        match spec.as_i64() {
            Some(n) => SkipStage::new(ctx, n),
            None => Err(AggLiteError::InvalidSpec(
                "$skip must be a non-negative number".to_string(),
            )),
        }
    }

    pub fn skip(&self) -> u64 {
        self.skip
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.skip {
                if pull_next(upstream)?.is_none() {
                    return Ok(None);
                }
            }
        }
        pull_next(upstream)
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for SkipStage {
    fn name(&self) -> &'static str {
        SkipStage::NAME
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

    fn coalesce(&mut self, next: &dyn Stage) -> bool {
        let Some(other) = next.as_any().downcast_ref::<SkipStage>() else {
            return false;
        };
        self.skip = self.skip.saturating_add(other.skip);
        true
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            json!(self.skip),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::source::ArraySource;
    use crate::value::Value;
    use serde_json::json;

    fn source_chain(n: i64) -> Vec<BoxedStage> {
        let docs: Vec<Json> = (0..n).map(|i| json!({"i": i})).collect();
        let ctx = ExecContext::new();
        vec![Box::new(
            ArraySource::from_json(ctx, &Json::Array(docs)).unwrap(),
        )]
    }

    fn drive(stage: &mut dyn Stage, upstream: &mut [BoxedStage]) -> Vec<Document> {
        let mut out = Vec::new();
        while stage.advance(upstream).unwrap() {
            out.push(stage.current().unwrap());
        }
        out
    }

    #[test]
    fn test_limit_emits_at_most_n() {
        let ctx = ExecContext::new();
        let mut chain = source_chain(10);
        let mut limit = LimitStage::new(ctx, 3).unwrap();
        assert_eq!(drive(&mut limit, &mut chain).len(), 3);
    }

    #[test]
    fn test_limit_rejects_non_positive() {
        assert!(LimitStage::new(ExecContext::new(), 0).is_err());
        assert!(LimitStage::new(ExecContext::new(), -2).is_err());
    }

    #[test]
    fn test_skip_drops_prefix() {
        let ctx = ExecContext::new();
        let mut chain = source_chain(5);
        let mut skip = SkipStage::new(ctx, 3).unwrap();
        let docs = drive(&mut skip, &mut chain);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("i"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_skip_past_end_and_zero() {
        let ctx = ExecContext::new();
        let mut chain = source_chain(2);
        let mut skip = SkipStage::new(ctx.clone(), 10).unwrap();
        assert!(drive(&mut skip, &mut chain).is_empty());

        let mut chain = source_chain(2);
        let mut identity = SkipStage::new(ctx, 0).unwrap();
        assert_eq!(drive(&mut identity, &mut chain).len(), 2);
    }

    #[test]
    fn test_limit_limit_coalesce_to_min() {
        let ctx = ExecContext::new();
        let mut a = LimitStage::new(ctx.clone(), 10).unwrap();
        let b: BoxedStage = Box::new(LimitStage::new(ctx, 4).unwrap());
        assert!(a.coalesce(b.as_ref()));
        assert_eq!(a.limit(), 4);
    }

    #[test]
    fn test_skip_skip_coalesce_to_sum() {
        let ctx = ExecContext::new();
        let mut a = SkipStage::new(ctx.clone(), 2).unwrap();
        let b: BoxedStage = Box::new(SkipStage::new(ctx, 3).unwrap());
        assert!(a.coalesce(b.as_ref()));
        assert_eq!(a.skip(), 5);
    }

    #[test]
    fn test_limit_and_skip_do_not_cross_coalesce() {
        let ctx = ExecContext::new();
        let mut limit = LimitStage::new(ctx.clone(), 4).unwrap();
        let skip: BoxedStage = Box::new(SkipStage::new(ctx.clone(), 2).unwrap());
        assert!(!limit.coalesce(skip.as_ref()));

        let mut skip = SkipStage::new(ctx.clone(), 2).unwrap();
        let limit: BoxedStage = Box::new(LimitStage::new(ctx, 4).unwrap());
        assert!(!skip.coalesce(limit.as_ref()));
    }
}
