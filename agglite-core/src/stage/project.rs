// agglite-core/src/stage/project.rs
// $project: field inclusion/exclusion plus computed fields

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::context::ExecContext;
use crate::dependency::DependencyTracker;
use crate::document::{Document, DocumentBuilder};
use crate::error::{AggLiteError, Result};
use crate::expression::{parse_expression, Expression};
use crate::field_path::FieldPath;
use crate::stage::{pull_next, stage_document, BoxedStage, Position, Stage, StageCore};
use crate::value::Value;

#[derive(Debug, Clone)]
enum ProjectAction {
    Include,
    Exclude,
    Computed(Arc<dyn Expression>),
}

/// Path tree used for both the include and the exclude walks. A leaf
/// means the whole subtree at that point is selected.
#[derive(Debug, Clone, Default)]
struct PathTree {
    leaf: bool,
    children: IndexMap<String, PathTree>,
}

impl PathTree {
    fn insert(&mut self, path: &FieldPath) {
        let mut node = self;
        for part in path.parts() {
            node = node.children.entry(part.clone()).or_default();
        }
        node.leaf = true;
    }
}

/// Reshapes documents: `_id` is included by default (`_id: 0` excludes
/// it), include and exclude may not mix on non-`_id` paths, included
/// fields keep source order, computed fields are appended in spec order.
#[derive(Debug)]
pub struct ProjectStage {
    ctx: Arc<ExecContext>,
    exclude_id: bool,
    actions: Vec<(FieldPath, ProjectAction)>,
    tree: PathTree,
    include_mode: bool,
    would_be_removed: bool,
    state: Position,
    core: StageCore,
}

impl ProjectStage {
    pub const NAME: &'static str = "$project";

    pub fn from_json(ctx: Arc<ExecContext>, spec: &Json) -> Result<ProjectStage> {
        let Json::Object(map) = spec else {
            return Err(AggLiteError::InvalidSpec(
                "$project must be an object".to_string(),
            ));
        };

        let mut exclude_id = false;
        let mut actions: Vec<(FieldPath, ProjectAction)> = Vec::new();
        for (field, value) in map {
            if field == "_id" {
                match value {
                    Json::Number(n) if n.as_i64() == Some(0) => exclude_id = true,
                    Json::Bool(false) => exclude_id = true,
                    Json::Number(n) if n.as_i64() == Some(1) => {}
                    Json::Bool(true) => {}
                    _ => {
                        return Err(AggLiteError::InvalidSpec(
                            "_id may only be included or excluded".to_string(),
                        ))
                    }
                }
                continue;
            }
            let path = FieldPath::parse(field)?;
            let action = match value {
                Json::Number(n) => match n.as_i64() {
                    Some(1) => ProjectAction::Include,
                    Some(0) => ProjectAction::Exclude,
                    _ => {
                        return Err(AggLiteError::InvalidSpec(format!(
                            "invalid projection value for {}: {}",
                            field, n
                        )))
                    }
                },
                Json::Bool(true) => ProjectAction::Include,
                Json::Bool(false) => ProjectAction::Exclude,
                Json::String(s) if s.starts_with('$') => {
                    ProjectAction::Computed(parse_expression(value)?)
                }
                Json::Object(_) => ProjectAction::Computed(parse_expression(value)?),
                other => {
                    return Err(AggLiteError::InvalidSpec(format!(
                        "invalid projection expression for {}: {}",
                        field, other
                    )))
                }
            };
            actions.push((path, action));
        }

        let has_selected = actions
            .iter()
            .any(|(_, a)| matches!(a, ProjectAction::Include | ProjectAction::Computed(_)));
        let has_excluded = actions
            .iter()
            .any(|(_, a)| matches!(a, ProjectAction::Exclude));
        if has_selected && has_excluded {
            return Err(AggLiteError::InvalidSpec(
                "cannot mix inclusion and exclusion in one $project".to_string(),
            ));
        }

        let include_mode = has_selected;
        let mut tree = PathTree::default();
        for (path, action) in &actions {
            match action {
                ProjectAction::Include if include_mode => tree.insert(path),
                ProjectAction::Exclude if !include_mode => tree.insert(path),
                _ => {}
            }
        }

        Ok(ProjectStage {
            ctx,
            exclude_id,
            actions,
            tree,
            include_mode,
            would_be_removed: false,
            state: Position::Unstarted,
            core: StageCore::default(),
        })
    }

    /// True when the projection is pure include/exclude with no computed
    /// fields; simple projections can be pushed into the cursor.
    pub fn is_simple(&self) -> bool {
        !self
            .actions
            .iter()
            .any(|(_, a)| matches!(a, ProjectAction::Computed(_)))
    }

    /// The covered-projection field set, when the projection is a simple
    /// top-level include. `None` means it cannot be pushed down.
    pub fn pushdown_fields(&self) -> Option<BTreeSet<String>> {
        if !self.include_mode || !self.is_simple() {
            return None;
        }
        if self.actions.iter().any(|(path, _)| path.len() > 1) {
            return None;
        }
        let mut fields: BTreeSet<String> = self
            .actions
            .iter()
            .map(|(path, _)| path.head().to_string())
            .collect();
        if !self.exclude_id {
            fields.insert("_id".to_string());
        }
        Some(fields)
    }

    /// Debug-build marker set just before the rewrite removes this stage.
    pub fn mark_would_be_removed(&mut self) {
        self.would_be_removed = true;
    }

    fn project_document(&self, doc: &Document) -> Result<Document> {
        if self.include_mode {
            let mut builder = DocumentBuilder::new();
            if !self.exclude_id {
                if let Some(id) = doc.get("_id") {
                    builder.insert("_id", id.clone());
                }
            }
            let included = project_included(&self.tree, doc);
            for (name, value) in included.iter() {
                if name != "_id" {
                    builder.insert(name.clone(), value.clone());
                }
            }
            let mut result = builder.build();
            for (path, action) in &self.actions {
                if let ProjectAction::Computed(expr) = action {
                    result = insert_at_path(&result, path, expr.evaluate(doc)?);
                }
            }
            Ok(result)
        } else {
            let mut builder = DocumentBuilder::new();
            let trimmed = project_excluded(&self.tree, doc);
            for (name, value) in trimmed.iter() {
                if name == "_id" && self.exclude_id {
                    continue;
                }
                builder.insert(name.clone(), value.clone());
            }
            Ok(builder.build())
        }
    }

    fn fetch_next(&mut self, upstream: &mut [BoxedStage]) -> Result<Option<Document>> {
        match pull_next(upstream)? {
            Some(doc) => Ok(Some(self.project_document(&doc)?)),
            None => Ok(None),
        }
    }

    fn step(&mut self, upstream: &mut [BoxedStage]) -> Result<()> {
        let next = self.fetch_next(upstream)?;
        self.core.position(&mut self.state, next);
        Ok(())
    }
}

/// Rebuild `doc` keeping only the fields selected by `tree`, preserving
/// source order at each level. A selected path through an array maps over
/// the array's document elements.
fn project_included(tree: &PathTree, doc: &Document) -> Document {
    let mut builder = DocumentBuilder::new();
    for (name, value) in doc.iter() {
        let Some(child) = tree.children.get(name) else {
            continue;
        };
        if child.leaf {
            builder.insert(name.clone(), value.clone());
            continue;
        }
        match value {
            Value::Document(inner) => {
                builder.insert(name.clone(), Value::Document(project_included(child, inner)));
            }
            Value::Array(items) => {
                let mapped: Vec<Value> = items
                    .iter()
                    .filter_map(|item| match item {
                        Value::Document(inner) => {
                            Some(Value::Document(project_included(child, inner)))
                        }
                        _ => None,
                    })
                    .collect();
                builder.insert(name.clone(), Value::array(mapped));
            }
            _ => {}
        }
    }
    builder.build()
}

/// Rebuild `doc` without the subtrees selected by `tree`.
fn project_excluded(tree: &PathTree, doc: &Document) -> Document {
    let mut builder = DocumentBuilder::new();
    for (name, value) in doc.iter() {
        match tree.children.get(name) {
            None => builder.insert(name.clone(), value.clone()),
            Some(child) if child.leaf => {}
            Some(child) => match value {
                Value::Document(inner) => {
                    builder.insert(name.clone(), Value::Document(project_excluded(child, inner)));
                }
                Value::Array(items) => {
                    let mapped: Vec<Value> = items
                        .iter()
                        .map(|item| match item {
                            Value::Document(inner) => {
                                Value::Document(project_excluded(child, inner))
                            }
                            other => other.clone(),
                        })
                        .collect();
                    builder.insert(name.clone(), Value::array(mapped));
                }
                other => builder.insert(name.clone(), other.clone()),
            },
        }
    }
    builder.build()
}

/// Copy-on-write insertion of `value` at a nested path, creating
/// intermediate documents as needed.
fn insert_at_path(doc: &Document, path: &FieldPath, value: Value) -> Document {
    match path.tail() {
        None => doc.with_field(path.head(), value),
        Some(tail) => {
            let inner = match doc.get(path.head()) {
                Some(Value::Document(inner)) => inner.clone(),
                _ => Document::new(),
            };
            doc.with_field(
                path.head(),
                Value::Document(insert_at_path(&inner, &tail, value)),
            )
        }
    }
}

impl Stage for ProjectStage {
    fn name(&self) -> &'static str {
        ProjectStage::NAME
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
        for (_, action) in self.actions.iter_mut() {
            if let ProjectAction::Computed(expr) = action {
                *expr = Arc::clone(expr).optimize();
            }
        }
    }

    fn manage_dependencies(&mut self, tracker: &mut DependencyTracker) -> Result<()> {
        let id_path = FieldPath::parse("_id").expect("static path");

        if tracker.needs_whole_document() {
            if !self.include_mode {
                // Exclusions pass everything else through; the input still
                // needs the whole document.
                return Ok(());
            }
            let mut required = BTreeSet::new();
            if !self.exclude_id {
                required.insert(id_path);
            }
            for (path, action) in &self.actions {
                match action {
                    ProjectAction::Include => {
                        required.insert(path.clone());
                    }
                    ProjectAction::Computed(expr) => expr.referenced_paths(&mut required),
                    ProjectAction::Exclude => {}
                }
            }
            tracker.replace(required);
            return Ok(());
        }

        let downstream: Vec<FieldPath> = tracker.required_paths().cloned().collect();
        let mut required = BTreeSet::new();
        for path in downstream {
            if !self.require_inputs_for(&path, &mut required) {
                return Err(AggLiteError::MissingDependency(path.to_string()));
            }
        }
        tracker.replace(required);
        Ok(())
    }

    fn serialize(&self, explain: bool) -> Document {
        let mut map = serde_json::Map::new();
        if self.exclude_id {
            map.insert("_id".to_string(), Json::from(0));
        }
        for (path, action) in &self.actions {
            let value = match action {
                ProjectAction::Include => Json::from(1),
                ProjectAction::Exclude => Json::from(0),
                ProjectAction::Computed(expr) => expr.serialize_spec(),
            };
            map.insert(path.to_string(), value);
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
}

impl ProjectStage {
    /// Whether the projection produces `path`; on success the input paths
    /// it needs for that are added to `required`.
    fn require_inputs_for(&self, path: &FieldPath, required: &mut BTreeSet<FieldPath>) -> bool {
        let id_path = FieldPath::parse("_id").expect("static path");
        if *path == id_path || path.starts_with(&id_path) {
            if self.exclude_id {
                return false;
            }
            required.insert(path.clone());
            return true;
        }
        if self.include_mode {
            for (p, action) in &self.actions {
                match action {
                    ProjectAction::Include => {
                        if path.starts_with(p) {
                            required.insert(path.clone());
                            return true;
                        }
                        if p.starts_with(path) {
                            required.insert(p.clone());
                            return true;
                        }
                    }
                    ProjectAction::Computed(expr) => {
                        if path.starts_with(p) || p.starts_with(path) {
                            expr.referenced_paths(required);
                            return true;
                        }
                    }
                    ProjectAction::Exclude => {}
                }
            }
            false
        } else {
            for (p, action) in &self.actions {
                if matches!(action, ProjectAction::Exclude) && path.starts_with(p) {
                    return false;
                }
            }
            required.insert(path.clone());
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::source::ArraySource;
    use serde_json::json;

    fn run_project(spec: Json, input: Json) -> Result<Vec<Json>> {
        let ctx = ExecContext::new();
        let mut chain: Vec<BoxedStage> =
            vec![Box::new(ArraySource::from_json(ctx.clone(), &input).unwrap())];
        let mut project = ProjectStage::from_json(ctx, &spec)?;
        let mut out = Vec::new();
        while project.advance(&mut chain)? {
            out.push(project.current()?.to_json());
        }
        Ok(out)
    }

    #[test]
    fn test_include_keeps_source_order() {
        let out = run_project(
            json!({"b": 1, "a": 1}),
            json!([{"_id": 7, "a": 1, "x": 9, "b": 2}]),
        )
        .unwrap();
        // _id first, then included fields in source order (a before b)
        assert_eq!(out[0], json!({"_id": 7, "a": 1, "b": 2}));
    }

    #[test]
    fn test_exclude_id() {
        let out = run_project(json!({"b": 1, "_id": 0}), json!([{"_id": 7, "b": 2}])).unwrap();
        assert_eq!(out[0], json!({"b": 2}));
    }

    #[test]
    fn test_exclude_mode() {
        let out = run_project(
            json!({"secret": 0}),
            json!([{"_id": 1, "name": "x", "secret": "s"}]),
        )
        .unwrap();
        assert_eq!(out[0], json!({"_id": 1, "name": "x"}));
    }

    #[test]
    fn test_mixing_include_and_exclude_fails() {
        let err = ProjectStage::from_json(ExecContext::new(), &json!({"a": 1, "b": 0}))
            .unwrap_err();
        assert!(matches!(err, AggLiteError::InvalidSpec(_)));
        // _id exclusion alongside includes is fine
        assert!(ProjectStage::from_json(ExecContext::new(), &json!({"a": 1, "_id": 0})).is_ok());
    }

    #[test]
    fn test_nested_include_builds_nested_documents() {
        let out = run_project(
            json!({"a.b": 1, "_id": 0}),
            json!([{"a": {"x": 1, "b": 2}, "c": 3}]),
        )
        .unwrap();
        assert_eq!(out[0], json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_nested_exclude_trims() {
        let out = run_project(
            json!({"a.b": 0, "_id": 0}),
            json!([{"a": {"x": 1, "b": 2}, "c": 3}]),
        )
        .unwrap();
        assert_eq!(out[0], json!({"a": {"x": 1}, "c": 3}));
    }

    #[test]
    fn test_include_through_array_maps_elements() {
        let out = run_project(
            json!({"items.name": 1, "_id": 0}),
            json!([{"items": [{"name": "a", "qty": 1}, {"name": "b"}, 5]}]),
        )
        .unwrap();
        assert_eq!(out[0], json!({"items": [{"name": "a"}, {"name": "b"}]}));
    }

    #[test]
    fn test_computed_fields_append_in_spec_order() {
        let out = run_project(
            json!({"a": 1, "renamed": "$b", "flag": {"$gt": ["$a", 0]}}),
            json!([{"_id": 1, "a": 5, "b": "value"}]),
        )
        .unwrap();
        assert_eq!(
            out[0],
            json!({"_id": 1, "a": 5, "renamed": "value", "flag": true})
        );
    }

    #[test]
    fn test_computed_nested_target() {
        let out = run_project(
            json!({"_id": 0, "meta.src": "$b"}),
            json!([{"b": 3}]),
        )
        .unwrap();
        assert_eq!(out[0], json!({"meta": {"src": 3}}));
    }

    #[test]
    fn test_is_simple_and_pushdown_fields() {
        let ctx = ExecContext::new();
        let simple =
            ProjectStage::from_json(ctx.clone(), &json!({"b": 1, "_id": 0})).unwrap();
        assert!(simple.is_simple());
        let fields = simple.pushdown_fields().unwrap();
        assert_eq!(fields.into_iter().collect::<Vec<_>>(), vec!["b"]);

        let computed =
            ProjectStage::from_json(ctx.clone(), &json!({"b": "$a"})).unwrap();
        assert!(!computed.is_simple());
        assert!(computed.pushdown_fields().is_none());

        // Nested includes don't qualify for a covered projection
        let nested = ProjectStage::from_json(ctx, &json!({"a.b": 1})).unwrap();
        assert!(nested.is_simple());
        assert!(nested.pushdown_fields().is_none());
    }

    #[test]
    fn test_missing_dependency_detected() {
        let ctx = ExecContext::new();
        let mut project =
            ProjectStage::from_json(ctx, &json!({"a": 1, "_id": 0})).unwrap();
        let mut tracker = DependencyTracker::empty();
        tracker.add_required(FieldPath::parse("b").unwrap());
        let err = project.manage_dependencies(&mut tracker).unwrap_err();
        assert_eq!(err, AggLiteError::MissingDependency("b".to_string()));
    }

    #[test]
    fn test_dependencies_map_through_computed() {
        let ctx = ExecContext::new();
        let mut project =
            ProjectStage::from_json(ctx, &json!({"out": "$src.inner", "_id": 0})).unwrap();
        let mut tracker = DependencyTracker::empty();
        tracker.add_required(FieldPath::parse("out").unwrap());
        project.manage_dependencies(&mut tracker).unwrap();
        let paths: Vec<String> = tracker.required_paths().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["src.inner"]);
    }

    #[test]
    fn test_whole_document_downstream_narrows_to_projection_inputs() {
        let ctx = ExecContext::new();
        let mut project =
            ProjectStage::from_json(ctx, &json!({"a": 1, "c": "$b", "_id": 0})).unwrap();
        let mut tracker = DependencyTracker::whole_document();
        project.manage_dependencies(&mut tracker).unwrap();
        assert!(!tracker.needs_whole_document());
        let paths: Vec<String> = tracker.required_paths().map(|p| p.to_string()).collect();
        assert_eq!(paths, vec!["a", "b"]);
    }
}
