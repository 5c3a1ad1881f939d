// agglite-core/src/stage/sort.rs
// $sort: multi-key in-memory stable sort

use std::any::Any;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::context::ExecContext;
use crate::dependency::DependencyTracker;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::stage::limit_skip::LimitStage;
use crate::stage::{
    pull_next, stage_document, BoxedStage, Position, SplittableStage, Stage, StageCore,
};
use crate::value::Value;

/// Resolve a sort key. Missing stays `None`, a sentinel below every
/// present value; an array sorts by its minimum element ascending and its
/// maximum element descending.
fn sort_key<'a>(doc: &'a Document, path: &FieldPath, ascending: bool) -> Option<&'a Value> {
    match doc.get_path(path) {
        Some(Value::Array(items)) => {
            if ascending {
                items.iter().min()
            } else {
                items.iter().max()
            }
        }
        other => other,
    }
}

fn compare_by_keys(a: &Document, b: &Document, keys: &[(FieldPath, bool)]) -> Ordering {
    for (path, ascending) in keys {
        let left = sort_key(a, path, *ascending);
        let right = sort_key(b, path, *ascending);
        let ordering = match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(l), Some(r)) => l.cmp(r),
        };
        let ordering = if *ascending {
            ordering
        } else {
            ordering.reverse()
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Stable multi-key sort; also the sort applied by a cursor that received
/// a pushed-down sort.
pub fn sort_by_keys(docs: &mut [Document], keys: &[(FieldPath, bool)]) {
    docs.sort_by(|a, b| compare_by_keys(a, b, keys));
}

/// Drains its upstream into memory on first pull, sorts, then emits.
/// Fully tied documents retain their input order. Memory is proportional
/// to the input; callers needing a bound put a `$limit` in front, and a
/// `$limit` directly after the sort registers a top-k bound.
#[derive(Debug)]
pub struct SortStage {
    ctx: Arc<ExecContext>,
    keys: Vec<(FieldPath, bool)>,
    limit_hint: Option<u64>,
    populated: bool,
    results: VecDeque<Document>,
    state: Position,
    core: StageCore,
}

impl SortStage {
    pub const NAME: &'static str = "$sort";

    pub fn new(ctx: Arc<ExecContext>, keys: Vec<(FieldPath, bool)>) -> Result<SortStage> {
        if keys.is_empty() {
            return Err(AggLiteError::InvalidSpec(
                "$sort requires at least one key".to_string(),
            ));
        }
        Ok(SortStage {
            ctx,
            keys,
            limit_hint: None,
            populated: false,
            results: VecDeque::new(),
            state: Position::Unstarted,
            core: StageCore::default(),
        })
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<SortStage> {
        let Json::Object(map) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "$sort must be an object".to_string(),
            ));
        };
        let mut keys = Vec::new();
        for (field, direction) in map {
            let ascending = match direction.as_i64() {
                Some(1) => true,
                Some(-1) => false,
                _ => {
                    return Err(AggLiteError::InvalidSpec(
                        "sort direction must be 1 or -1".to_string(),
                    ))
                }
            };
            keys.push((FieldPath::parse(field)?, ascending));
        }
        SortStage::new(ctx, keys)
    }

    pub fn keys(&self) -> &[(FieldPath, bool)] {
        &self.keys
    }

    pub fn limit_hint(&self) -> Option<u64> {
        self.limit_hint
    }

    fn populate(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let mut docs = Vec::new();
        while let Some(doc) = pull_next(upstream)? {
            self.ctx.check_interrupt()?;
            docs.push(doc);
        }
        sort_by_keys(&mut docs, &self.keys);
        if let Some(limit) = self.limit_hint {
            docs.truncate(limit as usize);
        }
        self.results = docs.into();
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
}

impl Stage for SortStage {
    fn name(&self) -> &'static str {
        SortStage::NAME
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

    /// A `$limit` directly after the sort stays in the pipeline but its
    /// bound lets the sort keep only the top k.
    ///
    /// Adjacent sorts deliberately do not coalesce to the last sort.
    fn coalesce(&mut self, next: &dyn Stage) -> bool {
        if let Some(limit) = next.as_any().downcast_ref::<LimitStage>() {
            let bound = limit.limit();
            self.limit_hint = Some(match self.limit_hint {
                Some(existing) => existing.min(bound),
                None => bound,
            });
        }
        false
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        for (path, _) in &self.keys {
            tracker.add_required(path.clone());
        }
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        let mut map = serde_json::Map::new();
        for (path, ascending) in &self.keys {
            map.insert(path.to_string(), Json::from(if *ascending { 1 } else { -1 }));
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

impl SplittableStage for SortStage {
    /// The shards do no sorting; the router sorts everything.
    fn shard_source(&mut self) -> Option<BoxedStage> {
        None
    }

    fn router_source(&mut self) -> Option<BoxedStage> {
        let mut clone = SortStage::new(Arc::clone(&self.ctx), self.keys.clone())
            .expect("keys already validated");
        clone.limit_hint = self.limit_hint;
        Some(Box::new(clone))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::source::ArraySource;
    use serde_json::json;

    fn run_sort(spec: Json, input: Json) -> Vec<Json> {
        let ctx = ExecContext::new();
        let mut chain: Vec<BoxedStage> =
            vec![Box::new(ArraySource::from_json(ctx.clone(), &input).unwrap())];
        let mut sort = SortStage::from_json(ctx, &spec).unwrap();
        let mut out = Vec::new();
        while sort.advance(&mut chain).unwrap() {
            out.push(sort.current().unwrap().to_json());
        }
        out
    }

    #[test]
    fn test_sort_ascending() {
        let out = run_sort(json!({"a": 1}), json!([{"a": 3}, {"a": 1}, {"a": 2}]));
        assert_eq!(out, vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})]);
    }

    #[test]
    fn test_sort_stability() {
        let out = run_sort(
            json!({"a": 1}),
            json!([{"a": 1, "t": "p"}, {"a": 1, "t": "q"}, {"a": 0, "t": "r"}]),
        );
        assert_eq!(
            out,
            vec![
                json!({"a": 0, "t": "r"}),
                json!({"a": 1, "t": "p"}),
                json!({"a": 1, "t": "q"})
            ]
        );
    }

    #[test]
    fn test_sort_missing_first() {
        let out = run_sort(json!({"a": 1}), json!([{"a": 1}, {"b": 2}, {"a": 0}]));
        assert_eq!(out[0], json!({"b": 2}));
    }

    #[test]
    fn test_sort_descending_multi_key() {
        let out = run_sort(
            json!({"city": 1, "age": -1}),
            json!([
                {"city": "NYC", "age": 30},
                {"city": "LA", "age": 25},
                {"city": "NYC", "age": 40}
            ]),
        );
        assert_eq!(out[0]["city"], json!("LA"));
        assert_eq!(out[1], json!({"city": "NYC", "age": 40}));
    }

    #[test]
    fn test_sort_array_uses_min_asc_max_desc() {
        let asc = run_sort(
            json!({"a": 1}),
            json!([{"a": [5, 6], "t": 1}, {"a": [2, 9], "t": 2}]),
        );
        // min(2,9)=2 < min(5,6)=5
        assert_eq!(asc[0]["t"], json!(2));

        let desc = run_sort(
            json!({"a": -1}),
            json!([{"a": [5, 6], "t": 1}, {"a": [2, 9], "t": 2}]),
        );
        // max(2,9)=9 > max(5,6)=6
        assert_eq!(desc[0]["t"], json!(2));
    }

    #[test]
    fn test_sort_invalid_direction() {
        assert!(SortStage::from_json(ExecContext::new(), &json!({"a": 0})).is_err());
        assert!(SortStage::from_json(ExecContext::new(), &json!({"a": "asc"})).is_err());
    }

    #[test]
    fn test_limit_after_sort_becomes_hint_but_stays() {
        let ctx = ExecContext::new();
        let mut sort = SortStage::from_json(ctx.clone(), &json!({"a": 1})).unwrap();
        let limit: BoxedStage = Box::new(LimitStage::new(ctx, 2).unwrap());
        assert!(!sort.coalesce(limit.as_ref()));
        assert_eq!(sort.limit_hint(), Some(2));
    }

    #[test]
    fn test_adjacent_sorts_do_not_coalesce() {
        let ctx = ExecContext::new();
        let mut first = SortStage::from_json(ctx.clone(), &json!({"a": 1})).unwrap();
        let second: BoxedStage =
            Box::new(SortStage::from_json(ctx, &json!({"b": 1})).unwrap());
        assert!(!first.coalesce(second.as_ref()));
    }

    #[test]
    fn test_sort_split_halves() {
        let ctx = ExecContext::new();
        let mut sort = SortStage::from_json(ctx, &json!({"a": 1})).unwrap();
        assert!(sort.shard_source().is_none());
        let router = sort.router_source().unwrap();
        assert_eq!(router.name(), "$sort");
    }
}
