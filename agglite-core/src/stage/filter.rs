// agglite-core/src/stage/filter.rs
// Predicate stages: $match (legacy matcher) and $filter (expression)

use std::any::Any;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::context::ExecContext;
use crate::dependency::DependencyTracker;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::expression::{AndExpr, Expression};
use crate::matcher::Matcher;
use crate::stage::{pull_next, stage_document, BoxedStage, Position, Stage, StageCore};

// ============================================================================
// EXPRESSION FILTER
// ============================================================================

/// Filters by evaluating a compiled boolean expression; truthiness follows
/// the expression language's rules.
#[derive(Debug)]
pub struct ExpressionFilter {
    ctx: Arc<ExecContext>,
    predicate: Arc<dyn Expression>,
    state: Position,
    core: StageCore,
}

impl ExpressionFilter {
    pub const NAME: &'static str = "$filter";

    pub fn new(ctx: Arc<ExecContext>, predicate: Arc<dyn Expression>) -> ExpressionFilter {
        ExpressionFilter {
            ctx,
            predicate,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<ExpressionFilter> {
        Ok(ExpressionFilter::new(ctx, crate::expression::parse_expression(spec)?))
    }

    /// Best-effort pushdown form; `None` keeps the filter in the pipeline.
    pub fn match_predicate(&self) -> Option<Json> {
        self.predicate.to_match_predicate()
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        loop {
            match pull_next(upstream)? {
                Some(doc) => {
                    if self.predicate.evaluate(&doc)?.is_truthy() {
                        return Ok(Some(doc));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for ExpressionFilter {
    fn name(&self) -> &'static str {
        ExpressionFilter::NAME
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

    fn optimize(&mut self) {
        self.predicate = Arc::clone(&self.predicate).optimize();
    }

    fn coalesce(&mut self, next: &dyn Stage) -> bool {
        let Some(other) = next.as_any().downcast_ref::<ExpressionFilter>() else {
            return false;
        };
        self.predicate = Arc::new(AndExpr(vec![
            Arc::clone(&self.predicate),
            Arc::clone(&other.predicate),
        ]));
        true
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        let mut paths = std::collections::BTreeSet::new();
        self.predicate.referenced_paths(&mut paths);
        for path in paths {
            tracker.add_required(path);
        }
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            self.predicate.serialize_spec(),
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

// ============================================================================
// MATCHER FILTER
// ============================================================================

/// `$match`: filters with the legacy matcher predicate. Always
/// representable for pushdown.
#[derive(Debug)]
pub struct MatcherFilter {
    ctx: Arc<ExecContext>,
    matcher: Matcher,
    state: Position,
    core: StageCore,
}

impl MatcherFilter {
    pub const NAME: &'static str = "$match";

    pub fn new(ctx: Arc<ExecContext>, matcher: Matcher) -> MatcherFilter {
        MatcherFilter {
            ctx,
            matcher,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<MatcherFilter> {
        Ok(MatcherFilter::new(ctx, Matcher::new(spec.clone())?))
    }

    pub fn match_predicate(&self) -> Option<Json> {
        Some(self.matcher.predicate().clone())
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        loop {
            match pull_next(upstream)? {
                Some(doc) => {
                    if self.matcher.matches(&doc)? {
                        return Ok(Some(doc));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for MatcherFilter {
    fn name(&self) -> &'static str {
        MatcherFilter::NAME
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
        let Some(other) = next.as_any().downcast_ref::<MatcherFilter>() else {
            return false;
        };
        let merged = Matcher::conjoin(
            self.matcher.predicate().clone(),
            other.matcher.predicate().clone(),
        );
        match Matcher::new(merged) {
            Ok(matcher) => {
                self.matcher = matcher;
                true
            }
            Err(_) => false,
        }
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        let mut paths = std::collections::BTreeSet::new();
        self.matcher.referenced_paths(&mut paths);
        for path in paths {
            tracker.add_required(path);
        }
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            self.matcher.predicate().clone(),
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

    fn chain_with_source(source_json: Json) -> Vec<BoxedStage> {
        let ctx = ExecContext::new();
        vec![Box::new(ArraySource::from_json(ctx, &source_json).unwrap())]
    }

    fn drive(stage: &mut dyn Stage, upstream: &mut [BoxedStage]) -> Vec<Document> {
        let mut out = Vec::new();
        while stage.advance(upstream).unwrap() {
            out.push(stage.current().unwrap());
        }
        out
    }

    #[test]
    fn test_matcher_filter() {
        let ctx = ExecContext::new();
        let mut chain = chain_with_source(json!([{"a": 1}, {"a": 2}, {"a": 3}]));
        let mut filter = MatcherFilter::from_json(ctx, &json!({"a": {"$gt": 1}})).unwrap();
        let docs = drive(&mut filter, &mut chain);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].get("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_expression_filter() {
        let ctx = ExecContext::new();
        let mut chain = chain_with_source(json!([{"a": 1}, {"a": 2}]));
        let mut filter =
            ExpressionFilter::from_json(ctx, &json!({"$gt": ["$a", 1]})).unwrap();
        let docs = drive(&mut filter, &mut chain);
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("a"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_expression_filters_coalesce_by_and() {
        let ctx = ExecContext::new();
        let mut left =
            ExpressionFilter::from_json(ctx.clone(), &json!({"$gt": ["$a", 1]})).unwrap();
        let right: BoxedStage = Box::new(
            ExpressionFilter::from_json(ctx, &json!({"$lt": ["$a", 4]})).unwrap(),
        );
        assert!(left.coalesce(right.as_ref()));

        let mut chain =
            chain_with_source(json!([{"a": 1}, {"a": 2}, {"a": 3}, {"a": 4}]));
        let docs = drive(&mut left, &mut chain);
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_matcher_filters_coalesce() {
        let ctx = ExecContext::new();
        let mut left = MatcherFilter::from_json(ctx.clone(), &json!({"a": {"$gt": 1}})).unwrap();
        let right: BoxedStage =
            Box::new(MatcherFilter::from_json(ctx, &json!({"b": 1})).unwrap());
        assert!(left.coalesce(right.as_ref()));
        assert_eq!(
            left.match_predicate().unwrap(),
            json!({"$and": [{"a": {"$gt": 1}}, {"b": 1}]})
        );
    }

    #[test]
    fn test_filter_kinds_do_not_cross_coalesce() {
        let ctx = ExecContext::new();
        let mut matcher = MatcherFilter::from_json(ctx.clone(), &json!({"a": 1})).unwrap();
        let expr: BoxedStage = Box::new(
            ExpressionFilter::from_json(ctx, &json!({"$gt": ["$a", 1]})).unwrap(),
        );
        assert!(!matcher.coalesce(expr.as_ref()));
    }

    #[test]
    fn test_link_twice_fails() {
        let ctx = ExecContext::new();
        let mut filter = MatcherFilter::from_json(ctx, &json!({"a": 1})).unwrap();
        assert!(filter.link().is_ok());
        assert_eq!(
            filter.link().unwrap_err(),
            AggLiteError::AlreadyLinked("$match")
        );
    }

    #[test]
    fn test_filter_dependencies() {
        let ctx = ExecContext::new();
        let mut filter =
            MatcherFilter::from_json(ctx, &json!({"a.b": 1, "c": {"$gt": 2}})).unwrap();
        let mut tracker = DependencyTracker::empty();
        filter.manage_dependencies(&mut tracker).unwrap();
        let paths: Vec<String> = tracker.required_paths().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["a.b", "c"]);
    }
}
