// agglite-core/src/stage/group.rs
// $group: hash aggregation with pluggable accumulators

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::accumulator::{Accumulator, AccumulatorKind};
use crate::context::ExecContext;
use crate::dependency::DependencyTracker;
use crate::document::{Document, DocumentBuilder};
use crate::error::{AggLiteError, Result};
use crate::expression::{parse_expression, Expression, FieldPathExpr};
use crate::field_path::FieldPath;
use crate::stage::{
    pull_next, stage_document, BoxedStage, Position, SplittableStage, Stage, StageCore,
};
use crate::value::Value;

/// One accumulated output field: name, operator, argument expression.
#[derive(Debug, Clone)]
struct AccumulatorSpec {
    field: String,
    kind: AccumulatorKind,
    arg: Arc<dyn Expression>,
}

/// How this group participates in split execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupRole {
    /// Normal execution: emit final results.
    Whole,
    /// Shard half: emit partial accumulator states.
    ShardPartial,
    /// Router half: inputs are partial states, fold with combine().
    RouterMerge,
}

/// Groups documents by the value of the id expression and folds each
/// group's documents through a fresh set of accumulator instances.
///
/// The whole upstream is drained on the first pull. Emission order is the
/// key table's insertion order; callers must not assume sort order.
#[derive(Debug)]
pub struct GroupStage {
    ctx: Arc<ExecContext>,
    id_expr: Arc<dyn Expression>,
    specs: Vec<AccumulatorSpec>,
    role: GroupRole,
    populated: bool,
    results: VecDeque<Document>,
    state: Position,
    core: StageCore,
}

impl GroupStage {
    pub const NAME: &'static str = "$group";

    pub fn new(
        ctx: Arc<ExecContext>,
        id_expr: Arc<dyn Expression>,
        accumulators: Vec<(String, AccumulatorKind, Arc<dyn Expression>)>,
    ) -> GroupStage {
        GroupStage {
            ctx,
            id_expr,
            specs: accumulators
                .into_iter()
                .map(|(field, kind, arg)| AccumulatorSpec { field, kind, arg })
                .collect(),
            role: GroupRole::Whole,
            populated: false,
            results: VecDeque::new(),
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<GroupStage> {
        let Json::Object(map) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "$group must be an object".to_string(),
            ));
        };
        let id_spec = map.get("_id").ok_or_else(|| {
            AggLiteError::InvalidSpec("$group must have an _id field".to_string())
        })?;
        let id_expr = parse_expression(id_spec)?;

        let mut accumulators = Vec::new();
        for (field, value) in map {
            if field == "_id" {
                continue;
            }
            if field.is_empty() || field.contains('.') {
                return Err(AggLiteError::InvalidSpec(format!(
                    "invalid accumulator field name: {:?}",
                    field
                )));
            }
            let Json::Object(acc) = value else {
                return Err(AggLiteError::InvalidSpec(format!(
                    "accumulator for {} must be an object",
                    field
                )));
            };
            if acc.len() != 1 {
                return Err(AggLiteError::InvalidSpec(format!(
                    "accumulator for {} must have exactly one operator",
                    field
                )));
            }
            let (op, arg_spec) = acc.iter().next().expect("len checked");
            let kind = AccumulatorKind::parse(op)?;
            accumulators.push((field.clone(), kind, parse_expression(arg_spec)?));
        }
        Ok(GroupStage::new(ctx, id_expr, accumulators))
    }

    fn populate(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let mut groups: IndexMap<Value, Vec<Box<dyn Accumulator>>> = IndexMap::new();
        while let Some(doc) = pull_next(upstream)? {
            self.ctx.check_interrupt()?;
            let key = self.id_expr.evaluate(&doc)?;
            let accumulators = groups
                .entry(key)
                .or_insert_with(|| self.specs.iter().map(|s| s.kind.make()).collect());
            for (spec, acc) in self.specs.iter().zip(accumulators.iter_mut()) {
                let arg = spec.arg.evaluate(&doc)?;
                match self.role {
                    GroupRole::RouterMerge => acc.combine(arg)?,
                    _ => acc.process(arg),
                }
            }
        }

        for (key, accumulators) in groups {
            let mut builder = DocumentBuilder::new();
            builder.insert("_id", key);
            for (spec, acc) in self.specs.iter().zip(accumulators.iter()) {
                let value = match self.role {
                    GroupRole::ShardPartial => acc.partial(),
                    _ => acc.result(),
                };
                builder.insert(spec.field.clone(), value);
            }
            self.results.push_back(builder.build());
        }
        self.populated = true;
        Ok(())
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        if !self.populated {
            self.populate(upstream)?;
        }
        Ok(self.results.pop_front())
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }

    fn mergeable(&self) -> bool {
        self.specs.iter().all(|s| s.kind.mergeable())
    }
}

impl Stage for GroupStage {
    fn name(&self) -> &'static str {
        GroupStage::NAME
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
        self.results.clear();
        self.core.dispose();
        self.state = Position::Done;
    }

    fn optimize(&mut self) {
        self.id_expr = Arc::clone(&self.id_expr).optimize();
        for spec in self.specs.iter_mut() {
            spec.arg = Arc::clone(&spec.arg).optimize();
        }
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        // Group output is synthesized; whatever downstream needed, the
        // input only has to cover the id and argument expressions.
        let mut required = BTreeSet::new();
        self.id_expr.referenced_paths(&mut required);
        for spec in &self.specs {
            spec.arg.referenced_paths(&mut required);
        }
        tracker.replace(required);
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        let mut map = serde_json::Map::new();
        map.insert("_id".to_string(), self.id_expr.serialize_spec());
        for spec in &self.specs {
            let mut acc = serde_json::Map::new();
            acc.insert(spec.kind.name().to_string(), spec.arg.serialize_spec());
            map.insert(spec.field.clone(), Json::Object(acc));
        }
        stage_document(
            self.name(),
            Json::Object(map),
            explain.then(|| self.core.n_out()),
        )
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_splittable(&mut self) -> Option<&mut dyn SplittableStage> {
        Some(self)
    }
}

impl SplittableStage for GroupStage {
    /// The shard half groups with the same key and accumulators but emits
    /// partial states. Accumulators without a combine function force the
    /// whole group onto the router, so the shard half is empty.
    fn shard_source(&mut self) -> Option<BoxedStage> {
        if !self.mergeable() {
            return None;
        }
        let mut shard = GroupStage::new(
            Arc::clone(&self.ctx),
            Arc::clone(&self.id_expr),
            self.specs
                .iter()
                .map(|s| (s.field.clone(), s.kind, Arc::clone(&s.arg)))
                .collect(),
        );
        shard.role = GroupRole::ShardPartial;
        Some(Box::new(shard))
    }

    /// The router half re-groups the shard documents by their `_id` and
    /// folds each field's partial states with the accumulator's combine
    /// function. Without a mergeable accumulator set it runs the whole
    /// group instead.
    fn router_source(&mut self) -> Option<BoxedStage> {
        let id_path = FieldPath::parse("_id").expect("static path");
        if !self.mergeable() {
            let whole = GroupStage::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.id_expr),
                self.specs
                    .iter()
                    .map(|s| (s.field.clone(), s.kind, Arc::clone(&s.arg)))
                    .collect(),
            );
            return Some(Box::new(whole));
        }
        let mut router = GroupStage::new(
            Arc::clone(&self.ctx),
            Arc::new(FieldPathExpr(id_path)),
            self.specs
                .iter()
                .map(|s| {
                    let field_ref: Arc<dyn Expression> = Arc::new(FieldPathExpr(
                        FieldPath::parse(&s.field).expect("accumulator field name"),
                    ));
                    (s.field.clone(), s.kind, field_ref)
                })
                .collect(),
        );
        router.role = GroupRole::RouterMerge;
        Some(Box::new(router))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::source::ArraySource;
    use serde_json::json;

    fn run_group(spec: Json, input: Json) -> Vec<Json> {
        let ctx = ExecContext::new();
        let mut chain: Vec<BoxedStage> =
            vec![Box::new(ArraySource::from_json(ctx.clone(), &input).unwrap())];
        let mut group = GroupStage::from_json(ctx, &spec).unwrap();
        let mut out = Vec::new();
        while group.advance(&mut chain).unwrap() {
            out.push(group.current().unwrap().to_json());
        }
        out
    }

    #[test]
    fn test_group_sum_by_key_insertion_order() {
        let out = run_group(
            json!({"_id": "$k", "s": {"$sum": "$v"}}),
            json!([{"k": "x", "v": 1}, {"k": "y", "v": 2}, {"k": "x", "v": 3}]),
        );
        assert_eq!(out, vec![json!({"_id": "x", "s": 4}), json!({"_id": "y", "s": 2})]);
    }

    #[test]
    fn test_group_null_id_single_group() {
        let out = run_group(
            json!({"_id": null, "total": {"$sum": "$v"}, "n": {"$sum": 1}}),
            json!([{"v": 10}, {"v": 20}, {"v": 30}]),
        );
        assert_eq!(out, vec![json!({"_id": null, "total": 60, "n": 3})]);
    }

    #[test]
    fn test_group_missing_key_groups_as_null() {
        let out = run_group(
            json!({"_id": "$city", "n": {"$sum": 1}}),
            json!([{"city": "NYC"}, {}]),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[1], json!({"_id": null, "n": 1}));
    }

    #[test]
    fn test_group_composite_key() {
        let out = run_group(
            json!({"_id": {"a": "$a", "b": "$b"}, "n": {"$sum": 1}}),
            json!([
                {"a": 1, "b": 1},
                {"a": 1, "b": 1},
                {"a": 1, "b": 2}
            ]),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], json!({"_id": {"a": 1, "b": 1}, "n": 2}));
    }

    #[test]
    fn test_group_first_last_push() {
        let out = run_group(
            json!({
                "_id": null,
                "first": {"$first": "$v"},
                "last": {"$last": "$v"},
                "all": {"$push": "$v"}
            }),
            json!([{"v": 1}, {"v": 2}, {"v": 3}]),
        );
        assert_eq!(
            out,
            vec![json!({"_id": null, "first": 1, "last": 3, "all": [1, 2, 3]})]
        );
    }

    #[test]
    fn test_group_requires_id() {
        let err = GroupStage::from_json(ExecContext::new(), &json!({"n": {"$sum": 1}}))
            .unwrap_err();
        assert!(err.to_string().contains("_id"));
    }

    #[test]
    fn test_group_split_round_trip() {
        let ctx = ExecContext::new();
        let mut group = GroupStage::from_json(
            ctx.clone(),
            &json!({"_id": "$k", "s": {"$sum": "$v"}, "a": {"$avg": "$v"}}),
        )
        .unwrap();

        let mut shard_a = group.shard_source().unwrap();
        let mut shard_b = group.shard_source().unwrap();
        let mut router = group.router_source().unwrap();

        let mut chain_a: Vec<BoxedStage> = vec![Box::new(
            ArraySource::from_json(ctx.clone(), &json!([{"k": "x", "v": 1}])).unwrap(),
        )];
        let mut chain_b: Vec<BoxedStage> = vec![Box::new(
            ArraySource::from_json(
                ctx.clone(),
                &json!([{"k": "y", "v": 2}, {"k": "x", "v": 3}]),
            )
            .unwrap(),
        )];

        let mut partials = Vec::new();
        while shard_a.advance(&mut chain_a).unwrap() {
            partials.push(shard_a.current().unwrap().to_json());
        }
        while shard_b.advance(&mut chain_b).unwrap() {
            partials.push(shard_b.current().unwrap().to_json());
        }

        let mut merged_chain: Vec<BoxedStage> = vec![Box::new(
            ArraySource::from_json(ctx, &Json::Array(partials)).unwrap(),
        )];
        let mut merged = std::collections::BTreeMap::new();
        while router.advance(&mut merged_chain).unwrap() {
            let doc = router.current().unwrap().to_json();
            merged.insert(doc["_id"].as_str().unwrap().to_string(), doc.clone());
        }
        assert_eq!(merged["x"]["s"], json!(4));
        assert_eq!(merged["x"]["a"], json!(2.0));
        assert_eq!(merged["y"]["s"], json!(2));
    }

    #[test]
    fn test_group_with_first_does_not_split() {
        let ctx = ExecContext::new();
        let mut group = GroupStage::from_json(
            ctx,
            &json!({"_id": "$k", "f": {"$first": "$v"}}),
        )
        .unwrap();
        assert!(group.shard_source().is_none());
        // Router runs the whole group
        assert!(group.router_source().is_some());
    }

    #[test]
    fn test_group_dependencies() {
        let ctx = ExecContext::new();
        let mut group = GroupStage::from_json(
            ctx,
            &json!({"_id": "$k.sub", "s": {"$sum": "$v"}}),
        )
        .unwrap();
        let mut tracker = DependencyTracker::whole_document();
        group.manage_dependencies(&mut tracker).unwrap();
        assert!(!tracker.needs_whole_document());
        let paths: Vec<String> = tracker.required_paths().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["k.sub", "v"]);
    }
}
