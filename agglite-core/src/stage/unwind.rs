// agglite-core/src/stage/unwind.rs
// $unwind: array flattening with a partial deep clone along the path

use std::any::Any;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::context::ExecContext;
use crate::dependency::DependencyTracker;
use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::stage::{pull_next, stage_document, BoxedStage, Position, Stage, StageCore};
use crate::value::Value;

/// Replace the value at `path` with `element`, cloning only the documents
/// along the path; siblings stay shared with the original.
fn clone_along_path(doc: &Document, path: &FieldPath, element: Value) -> Document {
    match path.tail() {
        None => doc.with_field(path.head(), element),
        Some(tail) => match doc.get(path.head()) {
            Some(Value::Document(inner)) => doc.with_field(
                path.head(),
                Value::Document(clone_along_path(inner, &tail, element)),
            ),
            // The caller only unwinds paths it resolved through documents
            _ => doc.clone(),
        },
    }
}

/// For each input document, resolve the unwind path: a missing or null
/// value or an empty array drops the document, a non-empty array emits one
/// copy per element with the path replaced, anything else passes through
/// unchanged.
#[derive(Debug)]
pub struct UnwindStage {
    ctx: Arc<ExecContext>,
    path: FieldPath,
    input: Option<Document>,
    array: Option<Arc<Vec<Value>>>,
    index: usize,
    state: Position,
    core: StageCore,
}

impl UnwindStage {
    pub const NAME: &'static str = "$unwind";

    pub fn new(ctx: Arc<ExecContext>, path: FieldPath) -> UnwindStage {
        UnwindStage {
            ctx,
            path,
            input: None,
            array: None,
            index: 0,
            state: Position::Unstarted,
            core: StageCore::default(),
        }
    }

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<UnwindStage> {
        let Json::String(s) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "$unwind requires a $-prefixed field path".to_string(),
            ));
        };
        let Some(stripped) = s.strip_prefix('$') else {
            return Err(AggLiteError::InvalidSpec(
                "$unwind field reference must start with $".to_string(),
            ));
        };
        Ok(UnwindStage::new(ctx, FieldPath::parse(stripped)?))
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        loop {
            if let (Some(input), Some(array)) = (&self.input, &self.array) {
                if self.index < array.len() {
                    let element = array[self.index].clone();
                    self.index += 1;
                    return Ok(Some(clone_along_path(input, &self.path, element)));
                }
                self.input = None;
                self.array = None;
            }

            let Some(doc) = pull_next(upstream)? else {
                return Ok(None);
            };
            let resolved = doc.get_path(&self.path).cloned();
            match resolved {
                None | Some(Value::Null) => continue,
                Some(Value::Array(items)) => {
                    if items.is_empty() {
                        continue;
                    }
                    self.array = Some(items);
                    self.index = 0;
                    self.input = Some(doc);
                }
                Some(_) => return Ok(Some(doc)),
            }
        }
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

impl Stage for UnwindStage {
    fn name(&self) -> &'static str {
        UnwindStage::NAME
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
        self.input = None;
        self.array = None;
        self.core.dispose();
        self.state = Position::Done;
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        tracker.add_required(self.path.clone());
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        stage_document(
            self.name(),
            json!(format!("${}", self.path)),
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
    use serde_json::json;

    fn run_unwind(path: &str, input: Json) -> Vec<Json> {
        let ctx = ExecContext::new();
        let mut chain: Vec<BoxedStage> =
            vec![Box::new(ArraySource::from_json(ctx.clone(), &input).unwrap())];
        let mut unwind = UnwindStage::from_json(ctx, &json!(path)).unwrap();
        let mut out = Vec::new();
        while unwind.advance(&mut chain).unwrap() {
            out.push(unwind.current().unwrap().to_json());
        }
        out
    }

    #[test]
    fn test_unwind_array_in_order() {
        let out = run_unwind("$a", json!([{"a": [1, 2], "x": "k"}]));
        assert_eq!(out, vec![json!({"a": 1, "x": "k"}), json!({"a": 2, "x": "k"})]);
    }

    #[test]
    fn test_unwind_missing_null_empty_and_scalar() {
        let out = run_unwind(
            "$a",
            json!([{"a": [1, 2]}, {"a": []}, {"b": 1}, {"a": "x"}, {"a": null}]),
        );
        assert_eq!(
            out,
            vec![json!({"a": 1}), json!({"a": 2}), json!({"a": "x"})]
        );
    }

    #[test]
    fn test_unwind_nested_path_partial_clone() {
        let out = run_unwind(
            "$a.b",
            json!([{"a": {"b": [1, 2], "keep": true}, "top": 9}]),
        );
        assert_eq!(
            out,
            vec![
                json!({"a": {"b": 1, "keep": true}, "top": 9}),
                json!({"a": {"b": 2, "keep": true}, "top": 9})
            ]
        );
    }

    #[test]
    fn test_unwind_shares_siblings() {
        // The sibling array is reference-shared between the emitted copies
        let ctx = ExecContext::new();
        let input = json!([{"a": [1, 2], "big": [9, 9, 9]}]);
        let mut chain: Vec<BoxedStage> =
            vec![Box::new(ArraySource::from_json(ctx.clone(), &input).unwrap())];
        let mut unwind = UnwindStage::from_json(ctx, &json!("$a")).unwrap();

        let mut docs = Vec::new();
        while unwind.advance(&mut chain).unwrap() {
            docs.push(unwind.current().unwrap());
        }
        let (Some(Value::Array(first)), Some(Value::Array(second))) =
            (docs[0].get("big"), docs[1].get("big"))
        else {
            panic!("expected shared sibling arrays");
        };
        assert!(Arc::ptr_eq(first, second));
    }

    #[test]
    fn test_unwind_spec_must_be_reference() {
        assert!(UnwindStage::from_json(ExecContext::new(), &json!("a")).is_err());
        assert!(UnwindStage::from_json(ExecContext::new(), &json!(5)).is_err());
    }
}
