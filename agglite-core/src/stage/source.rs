// agglite-core/src/stage/source.rs
// Source stages: literal arrays, storage cursors, shard merges

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::context::ExecContext;
use crate::cursor::{Cursor, CursorFactory, Pushdown};
use crate::dependency::DependencyTracker;
use crate::document::{Document, DocumentBuilder};
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::log_warn;
use crate::stage::{stage_document, BoxedStage, Position, Stage, StageCore};
use crate::value::Value;

// ============================================================================
// ARRAY SOURCE
// ============================================================================

/// Yields each element of a literal array as a document, in order.
#[derive(Debug)]
pub struct ArraySource {
    ctx: Arc<ExecContext>,
    items: Vec<Value>,
    position: usize,
    state: Position,
    core: StageCore,
}

impl ArraySource {
    pub const NAME: &'static str = "$arraySource";

    pub fn new(ctx: Arc<ExecContext>, array: Value) -> Result<ArraySource> {
        let items = match array {
            Value::Array(items) => items.as_ref().clone(),
            other => {
                return Err(AggLiteError::TypeMismatch(format!(
                    "array source input must be an array, got {}",
                    other.bracket_name()
                )))
            }
        };
        Ok(ArraySource {
            ctx,
            items,
            position: 0,
            state: Position::Unstarted,
            core: StageCore::default(),
        })
    }

    pub fn from_json(ctx: Arc<ExecContext>, json: &Json) -> Result<ArraySource> {
        ArraySource::new(ctx, Value::from_json(json))
    }

    fn fetch_next(&mut self) -> Result<Option<Document>> {
        if self.position >= self.items.len() {
            return Ok(None);
        }
        let item = &self.items[self.position];
        self.position += 1;
        match item {
            Value::Document(doc) => Ok(Some(doc.clone())),
            other => Err(AggLiteError::TypeMismatch(format!(
                "array source element must be a document, got {}",
                other.bracket_name()
            ))),
        }
    }

    fn step(&mut self) -> Result<()> {
        let next = self.fetch_next()?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for ArraySource {
    fn name(&self) -> &'static str {
        ArraySource::NAME
    }

    fn eof(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(true);
        }
        if self.state.is_unstarted() {
            self.step()?;
        }
        Ok(self.state.is_done())
    }

    fn advance(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(false);
        }
        self.ctx.check_interrupt()?;
        self.step()?;
        Ok(!self.state.is_done())
    }

    fn current(&self) -> Result<Document> {
        self.state.current(self.name())
    }

    fn link(&mut self) -> Result<()> {
        Err(AggLiteError::InvalidSpec(
            "a source stage has no upstream".to_string(),
        ))
    }

    fn dispose(&mut self) {
        self.core.dispose();
        self.state = Position::Done;
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            json!({ "nDocs": self.items.len() }),
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
// CURSOR SOURCE
// ============================================================================

const YIELD_INTERVAL: usize = 16;

/// Adapter over an external storage cursor.
///
/// The cursor opens lazily on the first pull, after the rewrite pass has
/// settled the pushdown (predicate, sort, covered projection). Every
/// `YIELD_INTERVAL` records the read acquisition is cooperatively
/// relinquished; if the world changed across the yield the stage releases
/// the cursor and fails with `CursorInvalidated`. `dispose` releases the
/// cursor; a stage that will not be driven to EOF must be disposed
/// explicitly.
pub struct CursorSource {
    ctx: Arc<ExecContext>,
    factory: Box<dyn CursorFactory>,
    cursor: Option<Box<dyn Cursor>>,
    opened: bool,
    pushdown: Pushdown,
    dependencies: Option<DependencyTracker>,
    records_since_yield: usize,
    state: Position,
    core: StageCore,
}

impl fmt::Debug for CursorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CursorSource")
            .field("opened", &self.opened)
            .field("pushdown", &self.pushdown)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

impl CursorSource {
    pub const NAME: &'static str = "$cursor";

    pub fn new(ctx: Arc<ExecContext>, factory: Box<dyn CursorFactory>) -> CursorSource {
        CursorSource {
            ctx,
            factory,
            cursor: None,
            opened: false,
            pushdown: Pushdown::default(),
            dependencies: None,
            records_since_yield: 0,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    /// Record a predicate pushed down out of the pipeline, conjoining with
    /// any predicate already recorded.
    pub fn push_down_query(&mut self, predicate: Json) {
        self.pushdown.query = Some(match self.pushdown.query.take() {
            Some(existing) => crate::matcher::Matcher::conjoin(existing, predicate),
            None => predicate,
        });
    }

    pub fn push_down_sort(&mut self, keys: Vec<(FieldPath, bool)>) {
        self.pushdown.sort = Some(keys);
    }

    /// Record a covered projection: only these top-level fields are
    /// materialized.
    pub fn push_down_projection(&mut self, fields: std::collections::BTreeSet<String>) {
        self.pushdown.projection = Some(fields);
    }

    /// The dependency set computed by the rewrite pass, used for selective
    /// materialization when no covered projection was recorded.
    pub fn set_dependencies(&mut self, tracker: DependencyTracker) {
        self.dependencies = Some(tracker);
    }

    pub fn pushdown(&self) -> &Pushdown {
        &self.pushdown
    }

    fn materialize(&self, bytes: &[u8]) -> Result<Document> {
        let json: Json = serde_json::from_slice(bytes)?;
        let Json::Object(map) = json else {
            return Err(AggLiteError::TypeMismatch(
                "stored record is not a document".to_string(),
            ));
        };

        let keep: Option<std::collections::BTreeSet<String>> =
            if let Some(fields) = &self.pushdown.projection {
                Some(fields.clone())
            } else {
                match &self.dependencies {
                    Some(deps) if !deps.needs_whole_document() => Some(deps.top_level_fields()),
                    _ => None,
                }
            };

        let mut builder = DocumentBuilder::new();
        for (name, value) in &map {
            if keep.as_ref().is_some_and(|k| !k.contains(name)) {
                continue;
            }
            builder.insert(name.clone(), Value::from_json(value));
        }
        Ok(builder.build())
    }

    fn yield_sometimes(&mut self) -> Result<()> {
        self.ctx.check_interrupt()?;
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.yield_()?;
            if cursor.invalidated() {
                self.cursor = None;
                log_warn!("cursor invalidated during yield; releasing");
                return Err(AggLiteError::CursorInvalidated);
            }
        }
        Ok(())
    }

    fn fetch_next(&mut self) -> Result<Option<Document>> {
        if !self.opened {
            self.cursor = Some(self.factory.open(&self.pushdown)?);
            self.opened = true;
        }
        let record = match self.cursor.as_mut() {
            Some(cursor) => cursor.next()?,
            None => return Ok(None),
        };
        match record {
            Some(bytes) => {
                let doc = self.materialize(&bytes)?;
                self.records_since_yield += 1;
                if self.records_since_yield >= YIELD_INTERVAL {
                    self.records_since_yield = 0;
                    self.yield_sometimes()?;
                }
                Ok(Some(doc))
            }
            None => {
                self.cursor = None;
                Ok(None)
            }
        }
    }

    fn step(&mut self) -> Result<()> {
        let next = self.fetch_next()?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for CursorSource {
    fn name(&self) -> &'static str {
        CursorSource::NAME
    }

    fn eof(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(true);
        }
        if self.state.is_unstarted() {
            self.step()?;
        }
        Ok(self.state.is_done())
    }

    fn advance(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(false);
        }
        self.ctx.check_interrupt()?;
        self.step()?;
        Ok(!self.state.is_done())
    }

    fn current(&self) -> Result<Document> {
        self.state.current(self.name())
    }

    fn link(&mut self) -> Result<()> {
        Err(AggLiteError::InvalidSpec(
            "a source stage has no upstream".to_string(),
        ))
    }

    fn dispose(&mut self) {
        self.cursor = None;
        self.core.dispose();
        self.state = Position::Done;
    }

    fn serialize(&self, explain: bool) -> Document {
        let spec = if explain {
            let fields: Option<Vec<&String>> =
                self.pushdown.projection.as_ref().map(|f| f.iter().collect());
            json!({
                "query": self.pushdown.query.clone().unwrap_or(json!({})),
                "sort": self.pushdown.sort.as_ref().map(|keys| {
                    let mut map = serde_json::Map::new();
                    for (path, ascending) in keys {
                        map.insert(path.to_string(), json!(if *ascending { 1 } else { -1 }));
                    }
                    Json::Object(map)
                }).unwrap_or(json!({})),
                "fields": fields,
            })
        } else {
            json!({})
        };
        stage_document(self.name(), spec, explain.then(|| self.core.n_out()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ============================================================================
// SHARD MERGE SOURCE
// ============================================================================

/// Feeds the router half of a split pipeline: every document of every
/// shard's result array, in deterministic shard-identifier order, tagged
/// with `fromShard`. Documents within a shard keep that shard's order.
#[derive(Debug)]
pub struct ShardMergeSource {
    ctx: Arc<ExecContext>,
    shards: Vec<(String, Vec<Value>)>,
    shard_index: usize,
    item_index: usize,
    state: Position,
    core: StageCore,
}

impl ShardMergeSource {
    pub const NAME: &'static str = "$mergeShards";

    pub fn new(ctx: Arc<ExecContext>, output: BTreeMap<String, Vec<Value>>) -> ShardMergeSource {
        ShardMergeSource {
            ctx,
            shards: output.into_iter().collect(),
            shard_index: 0,
            item_index: 0,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    fn fetch_next(&mut self) -> Result<Option<Document>> {
        while self.shard_index < self.shards.len() {
            let (shard_id, items) = &self.shards[self.shard_index];
            if self.item_index >= items.len() {
                self.shard_index += 1;
                self.item_index = 0;
                continue;
            }
            let item = &items[self.item_index];
            self.item_index += 1;
            return match item {
                Value::Document(doc) => {
                    Ok(Some(doc.with_field("fromShard", Value::String(shard_id.clone()))))
                }
                other => Err(AggLiteError::TypeMismatch(format!(
                    "shard result element must be a document, got {}",
                    other.bracket_name()
                ))),
            };
        }
        Ok(None)
    }

    fn step(&mut self) -> Result<()> {
        let next = self.fetch_next()?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for ShardMergeSource {
    fn name(&self) -> &'static str {
        ShardMergeSource::NAME
    }

    fn eof(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(true);
        }
        if self.state.is_unstarted() {
            self.step()?;
        }
        Ok(self.state.is_done())
    }

    fn advance(&mut self, _upstream: &mut [BoxedStage]) -> Result<bool> {
        if self.core.disposed() {
            return Ok(false);
        }
        self.ctx.check_interrupt()?;
        self.step()?;
        Ok(!self.state.is_done())
    }

    fn current(&self) -> Result<Document> {
        self.state.current(self.name())
    }

    fn link(&mut self) -> Result<()> {
        Err(AggLiteError::InvalidSpec(
            "a source stage has no upstream".to_string(),
        ))
    }

    fn dispose(&mut self) {
        self.core.dispose();
        self.state = Position::Done;
    }

    fn serialize(&self, explain: bool) -> Document {
        let shard_ids: Vec<&String> = self.shards.iter().map(|(id, _)| id).collect();
        stage_document(
            self.name(),
            json!({ "shards": shard_ids }),
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
    use crate::cursor::Collection;
    use serde_json::json;

    fn drive(stage: &mut dyn Stage) -> Vec<Document> {
        let mut out = Vec::new();
        let mut none: [BoxedStage; 0] = [];
        while stage.advance(&mut none).unwrap() {
            out.push(stage.current().unwrap());
        }
        out
    }

    #[test]
    fn test_array_source_yields_in_order() {
        let ctx = ExecContext::new();
        let mut source =
            ArraySource::from_json(ctx, &json!([{"a": 1}, {"a": 2}, {"a": 3}])).unwrap();
        let docs = drive(&mut source);
        assert_eq!(docs.len(), 3);
        assert_eq!(docs[0].get("a"), Some(&Value::Int(1)));
        assert_eq!(docs[2].get("a"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_array_source_rejects_non_document() {
        let ctx = ExecContext::new();
        let mut source = ArraySource::from_json(ctx, &json!([{"a": 1}, 42])).unwrap();
        let mut none: [BoxedStage; 0] = [];
        assert!(source.advance(&mut none).unwrap());
        let err = source.advance(&mut none).unwrap_err();
        assert!(matches!(err, AggLiteError::TypeMismatch(_)));
    }

    #[test]
    fn test_array_source_eof_primes() {
        let ctx = ExecContext::new();
        let mut source = ArraySource::from_json(ctx.clone(), &json!([{"a": 1}])).unwrap();
        let mut none: [BoxedStage; 0] = [];
        // eof materializes the first document without skipping it
        assert!(!source.eof(&mut none).unwrap());
        assert!(!source.eof(&mut none).unwrap());
        assert_eq!(source.current().unwrap().get("a"), Some(&Value::Int(1)));
        assert!(!source.advance(&mut none).unwrap());

        let mut empty = ArraySource::from_json(ctx, &json!([])).unwrap();
        assert!(empty.eof(&mut none).unwrap());
    }

    #[test]
    fn test_cursor_source_scans_collection() {
        let ctx = ExecContext::new();
        let coll = Arc::new(
            Collection::from_json(&json!([{"a": 1, "b": 2}, {"a": 2, "b": 3}])).unwrap(),
        );
        let mut source = CursorSource::new(ctx, Box::new(coll));
        let docs = drive(&mut source);
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].get("b"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_cursor_source_covered_projection() {
        let ctx = ExecContext::new();
        let coll = Arc::new(
            Collection::from_json(&json!([{"a": 1, "b": 2, "c": 3}])).unwrap(),
        );
        let mut source = CursorSource::new(ctx, Box::new(coll));
        source.push_down_projection(["b".to_string()].into_iter().collect());
        let docs = drive(&mut source);
        assert_eq!(docs[0].field_names().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_cursor_source_dispose_releases_and_reports_eof() {
        let ctx = ExecContext::new();
        let coll = Arc::new(Collection::from_json(&json!([{"a": 1}, {"a": 2}])).unwrap());
        let mut source = CursorSource::new(ctx, Box::new(coll));
        let mut none: [BoxedStage; 0] = [];
        assert!(source.advance(&mut none).unwrap());
        source.dispose();
        assert!(!source.advance(&mut none).unwrap());
        assert!(source.eof(&mut none).unwrap());
        assert!(source.current().is_err());
    }

    #[test]
    fn test_cursor_source_interrupt() {
        let ctx = ExecContext::new();
        let coll = Arc::new(Collection::from_json(&json!([{"a": 1}, {"a": 2}])).unwrap());
        let mut source = CursorSource::new(ctx.clone(), Box::new(coll));
        let mut none: [BoxedStage; 0] = [];
        assert!(source.advance(&mut none).unwrap());
        ctx.interrupt();
        assert_eq!(
            source.advance(&mut none).unwrap_err(),
            AggLiteError::Interrupted
        );
        // After dispose, iteration reports EOF without further failure
        source.dispose();
        assert!(!source.advance(&mut none).unwrap());
    }

    #[test]
    fn test_shard_merge_order_and_tag() {
        let ctx = ExecContext::new();
        let mut output = BTreeMap::new();
        output.insert(
            "shardB".to_string(),
            vec![Value::from_json(&json!({"n": 3}))],
        );
        output.insert(
            "shardA".to_string(),
            vec![
                Value::from_json(&json!({"n": 1})),
                Value::from_json(&json!({"n": 2})),
            ],
        );
        let mut source = ShardMergeSource::new(ctx, output);
        let docs = drive(&mut source);
        assert_eq!(docs.len(), 3);
        // shardA first (identifier order), its own order preserved
        assert_eq!(docs[0].get("n"), Some(&Value::Int(1)));
        assert_eq!(docs[1].get("n"), Some(&Value::Int(2)));
        assert_eq!(
            docs[0].get("fromShard"),
            Some(&Value::String("shardA".to_string()))
        );
        assert_eq!(
            docs[2].get("fromShard"),
            Some(&Value::String("shardB".to_string()))
        );
    }
}
