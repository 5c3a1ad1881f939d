// agglite-core/src/expression.rs
// Expression evaluation interface consumed by the pipeline stages
//
// The engine treats expressions as opaque beyond evaluate/optimize/
// referenced_paths; the implementations here cover constants, field paths,
// comparisons and boolean connectives, which is what the stages and the
// spec parser need.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value as Json};

use crate::document::{Document, DocumentBuilder};
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::value::Value;

/// A compiled expression: evaluates against a document and yields a value.
pub trait Expression: fmt::Debug + Send + Sync {
    fn evaluate(&self, doc: &Document) -> Result<Value>;

    /// Return a simplified equivalent. Constant-only subtrees fold.
    fn optimize(self: Arc<Self>) -> Arc<dyn Expression>;

    /// Collect every field path this expression reads.
    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>);

    /// Emit the specification form this expression parses back from.
    fn serialize_spec(&self) -> Json;

    /// The constant value, if this expression is one.
    fn as_constant(&self) -> Option<&Value> {
        None
    }

    /// The field path, if this expression is a bare path reference.
    fn as_field_path(&self) -> Option<&FieldPath> {
        None
    }

    /// Best-effort conversion to a matcher predicate object, used to move
    /// a filter into the source cursor during rewrite. `None` means "not
    /// representable"; the filter then stays in the pipeline.
    fn to_match_predicate(&self) -> Option<Json> {
        None
    }
}

// ---------------------------------------------------------------------------
// Constant
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Constant(pub Value);

impl Expression for Constant {
    fn evaluate(&self, _doc: &Document) -> Result<Value> {
        Ok(self.0.clone())
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        self
    }

    fn referenced_paths(&self, _out: &mut BTreeSet<FieldPath>) {}

    fn serialize_spec(&self) -> Json {
        match &self.0 {
            Value::Null | Value::Bool(_) | Value::Int(_) | Value::Double(_) => self.0.to_json(),
            other => json!({ "$literal": other.to_json() }),
        }
    }

    fn as_constant(&self) -> Option<&Value> {
        Some(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Field path reference
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FieldPathExpr(pub FieldPath);

impl Expression for FieldPathExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        Ok(doc.get_path(&self.0).cloned().unwrap_or(Value::Null))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        self
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        out.insert(self.0.clone());
    }

    fn serialize_spec(&self) -> Json {
        Json::String(format!("${}", self.0))
    }

    fn as_field_path(&self) -> Option<&FieldPath> {
        Some(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
}

impl CompareOp {
    pub fn name(&self) -> &'static str {
        match self {
            CompareOp::Eq => "$eq",
            CompareOp::Ne => "$ne",
            CompareOp::Gt => "$gt",
            CompareOp::Gte => "$gte",
            CompareOp::Lt => "$lt",
            CompareOp::Lte => "$lte",
        }
    }

    fn parse(name: &str) -> Option<CompareOp> {
        match name {
            "$eq" => Some(CompareOp::Eq),
            "$ne" => Some(CompareOp::Ne),
            "$gt" => Some(CompareOp::Gt),
            "$gte" => Some(CompareOp::Gte),
            "$lt" => Some(CompareOp::Lt),
            "$lte" => Some(CompareOp::Lte),
            _ => None,
        }
    }

    fn apply(&self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CompareOp::Eq => ordering == Equal,
            CompareOp::Ne => ordering != Equal,
            CompareOp::Gt => ordering == Greater,
            CompareOp::Gte => ordering != Less,
            CompareOp::Lt => ordering == Less,
            CompareOp::Lte => ordering != Greater,
        }
    }
}

/// Comparison over the cross-type total order.
#[derive(Debug)]
pub struct CompareExpr {
    pub op: CompareOp,
    pub left: Arc<dyn Expression>,
    pub right: Arc<dyn Expression>,
}

impl Expression for CompareExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        let left = self.left.evaluate(doc)?;
        let right = self.right.evaluate(doc)?;
        Ok(Value::Bool(self.op.apply(left.cmp(&right))))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let optimized = Arc::new(CompareExpr {
            op: self.op,
            left: Arc::clone(&self.left).optimize(),
            right: Arc::clone(&self.right).optimize(),
        });
        if optimized.left.as_constant().is_some() && optimized.right.as_constant().is_some() {
            if let Ok(value) = optimized.evaluate(&Document::new()) {
                return Arc::new(Constant(value));
            }
        }
        optimized
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        self.left.referenced_paths(out);
        self.right.referenced_paths(out);
    }

    fn serialize_spec(&self) -> Json {
        json!({ (self.op.name()): [self.left.serialize_spec(), self.right.serialize_spec()] })
    }

    fn to_match_predicate(&self) -> Option<Json> {
        let path = self.left.as_field_path()?;
        let constant = self.right.as_constant()?;
        let cond = match constant {
            // Matcher comparisons only apply within a bracket; documents and
            // arrays as range bounds don't translate faithfully.
            Value::Document(_) | Value::Array(_) => return None,
            other => other.to_json(),
        };
        let mut op_map = serde_json::Map::new();
        op_map.insert(self.op.name().to_string(), cond);
        let mut clause = serde_json::Map::new();
        clause.insert(path.to_string(), Json::Object(op_map));
        Some(Json::Object(clause))
    }
}

// ---------------------------------------------------------------------------
// Boolean connectives
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct AndExpr(pub Vec<Arc<dyn Expression>>);

impl Expression for AndExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        for operand in &self.0 {
            if !operand.evaluate(doc)?.is_truthy() {
                return Ok(Value::Bool(false));
            }
        }
        Ok(Value::Bool(true))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let mut operands = Vec::with_capacity(self.0.len());
        for operand in &self.0 {
            let operand = Arc::clone(operand).optimize();
            match operand.as_constant() {
                Some(value) if !value.is_truthy() => {
                    return Arc::new(Constant(Value::Bool(false)));
                }
                Some(_) => {} // constant-true operands drop out
                None => operands.push(operand),
            }
        }
        match operands.len() {
            0 => Arc::new(Constant(Value::Bool(true))),
            1 => operands.into_iter().next().expect("len checked"),
            _ => Arc::new(AndExpr(operands)),
        }
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        for operand in &self.0 {
            operand.referenced_paths(out);
        }
    }

    fn serialize_spec(&self) -> Json {
        json!({ "$and": self.0.iter().map(|e| e.serialize_spec()).collect::<Vec<_>>() })
    }

    fn to_match_predicate(&self) -> Option<Json> {
        let clauses: Option<Vec<Json>> =
            self.0.iter().map(|e| e.to_match_predicate()).collect();
        Some(json!({ "$and": clauses? }))
    }
}

#[derive(Debug)]
pub struct OrExpr(pub Vec<Arc<dyn Expression>>);

impl Expression for OrExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        for operand in &self.0 {
            if operand.evaluate(doc)?.is_truthy() {
                return Ok(Value::Bool(true));
            }
        }
        Ok(Value::Bool(false))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let mut operands = Vec::with_capacity(self.0.len());
        for operand in &self.0 {
            let operand = Arc::clone(operand).optimize();
            match operand.as_constant() {
                Some(value) if value.is_truthy() => {
                    return Arc::new(Constant(Value::Bool(true)));
                }
                Some(_) => {} // constant-false operands drop out
                None => operands.push(operand),
            }
        }
        match operands.len() {
            0 => Arc::new(Constant(Value::Bool(false))),
            1 => operands.into_iter().next().expect("len checked"),
            _ => Arc::new(OrExpr(operands)),
        }
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        for operand in &self.0 {
            operand.referenced_paths(out);
        }
    }

    fn serialize_spec(&self) -> Json {
        json!({ "$or": self.0.iter().map(|e| e.serialize_spec()).collect::<Vec<_>>() })
    }

    fn to_match_predicate(&self) -> Option<Json> {
        let clauses: Option<Vec<Json>> =
            self.0.iter().map(|e| e.to_match_predicate()).collect();
        Some(json!({ "$or": clauses? }))
    }
}

#[derive(Debug)]
pub struct NotExpr(pub Arc<dyn Expression>);

impl Expression for NotExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        Ok(Value::Bool(!self.0.evaluate(doc)?.is_truthy()))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let operand = Arc::clone(&self.0).optimize();
        if let Some(value) = operand.as_constant() {
            return Arc::new(Constant(Value::Bool(!value.is_truthy())));
        }
        Arc::new(NotExpr(operand))
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        self.0.referenced_paths(out);
    }

    fn serialize_spec(&self) -> Json {
        json!({ "$not": [self.0.serialize_spec()] })
    }
}

// ---------------------------------------------------------------------------
// Structured expressions
// ---------------------------------------------------------------------------

/// Builds a document from per-field expressions. The group stage uses this
/// for composite keys.
#[derive(Debug)]
pub struct DocumentExpr(pub Vec<(String, Arc<dyn Expression>)>);

impl Expression for DocumentExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        let mut builder = DocumentBuilder::new();
        for (name, expr) in &self.0 {
            builder.insert(name.clone(), expr.evaluate(doc)?);
        }
        Ok(Value::Document(builder.build()))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let fields: Vec<(String, Arc<dyn Expression>)> = self
            .0
            .iter()
            .map(|(name, expr)| (name.clone(), Arc::clone(expr).optimize()))
            .collect();
        if fields.iter().all(|(_, e)| e.as_constant().is_some()) {
            let folded = DocumentExpr(fields);
            if let Ok(value) = folded.evaluate(&Document::new()) {
                return Arc::new(Constant(value));
            }
            return Arc::new(folded);
        }
        Arc::new(DocumentExpr(fields))
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        for (_, expr) in &self.0 {
            expr.referenced_paths(out);
        }
    }

    fn serialize_spec(&self) -> Json {
        let mut map = serde_json::Map::new();
        for (name, expr) in &self.0 {
            map.insert(name.clone(), expr.serialize_spec());
        }
        Json::Object(map)
    }
}

/// Evaluates each element and yields an array.
#[derive(Debug)]
pub struct ArrayExpr(pub Vec<Arc<dyn Expression>>);

impl Expression for ArrayExpr {
    fn evaluate(&self, doc: &Document) -> Result<Value> {
        let mut items = Vec::with_capacity(self.0.len());
        for expr in &self.0 {
            items.push(expr.evaluate(doc)?);
        }
        Ok(Value::array(items))
    }

    fn optimize(self: Arc<Self>) -> Arc<dyn Expression> {
        let elements: Vec<Arc<dyn Expression>> =
            self.0.iter().map(|e| Arc::clone(e).optimize()).collect();
        if elements.iter().all(|e| e.as_constant().is_some()) {
            let folded = ArrayExpr(elements);
            if let Ok(value) = folded.evaluate(&Document::new()) {
                return Arc::new(Constant(value));
            }
            return Arc::new(folded);
        }
        Arc::new(ArrayExpr(elements))
    }

    fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        for expr in &self.0 {
            expr.referenced_paths(out);
        }
    }

    fn serialize_spec(&self) -> Json {
        Json::Array(self.0.iter().map(|e| e.serialize_spec()).collect())
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_operand_list(op: &str, spec: &Json) -> Result<Vec<Arc<dyn Expression>>> {
    match spec {
        Json::Array(items) => items.iter().map(parse_expression).collect(),
        _ => Err(AggLiteError::InvalidSpec(format!(
            "{} requires an array of operands",
            op
        ))),
    }
}

/// Parse an expression specification.
///
/// `"$a.b"` is a field path, `{"$gt": [e, e]}` and friends are operators,
/// `{"$literal": v}` is an escaped constant, a `$`-free object evaluates
/// each field, and everything else is a constant.
pub fn parse_expression(spec: &Json) -> Result<Arc<dyn Expression>> {
    match spec {
        Json::String(s) if s.starts_with('$') => {
            let path = FieldPath::parse(&s[1..])?;
            Ok(Arc::new(FieldPathExpr(path)))
        }
        Json::Array(items) => {
            let elements: Result<Vec<_>> = items.iter().map(parse_expression).collect();
            Ok(Arc::new(ArrayExpr(elements?)))
        }
        Json::Object(map) if map.keys().any(|k| k.starts_with('$')) => {
            if map.len() != 1 {
                return Err(AggLiteError::InvalidSpec(
                    "expression operator object must have exactly one field".to_string(),
                ));
            }
            let (op, inner) = map.iter().next().expect("len checked");
            if op == "$literal" {
                return Ok(Arc::new(Constant(Value::from_json(inner))));
            }
            if let Some(compare) = CompareOp::parse(op) {
                let mut operands = parse_operand_list(op, inner)?;
                if operands.len() != 2 {
                    return Err(AggLiteError::InvalidSpec(format!(
                        "{} requires exactly two operands",
                        op
                    )));
                }
                let right = operands.pop().expect("len checked");
                let left = operands.pop().expect("len checked");
                return Ok(Arc::new(CompareExpr {
                    op: compare,
                    left,
                    right,
                }));
            }
            match op.as_str() {
                "$and" => Ok(Arc::new(AndExpr(parse_operand_list(op, inner)?))),
                "$or" => Ok(Arc::new(OrExpr(parse_operand_list(op, inner)?))),
                "$not" => {
                    let mut operands = parse_operand_list(op, inner)?;
                    if operands.len() != 1 {
                        return Err(AggLiteError::InvalidSpec(
                            "$not requires exactly one operand".to_string(),
                        ));
                    }
                    Ok(Arc::new(NotExpr(operands.pop().expect("len checked"))))
                }
                other => Err(AggLiteError::InvalidSpec(format!(
                    "Unknown expression operator: {}",
                    other
                ))),
            }
        }
        Json::Object(map) => {
            let fields: Result<Vec<(String, Arc<dyn Expression>)>> = map
                .iter()
                .map(|(name, inner)| Ok((name.clone(), parse_expression(inner)?)))
                .collect();
            Ok(Arc::new(DocumentExpr(fields?)))
        }
        other => Ok(Arc::new(Constant(Value::from_json(other)))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(json: Json) -> Document {
        Document::from_json(&json).unwrap()
    }

    #[test]
    fn test_field_path_missing_is_null() {
        let expr = parse_expression(&json!("$a.b")).unwrap();
        let d = doc(json!({"a": {"b": 5}}));
        assert_eq!(expr.evaluate(&d).unwrap(), Value::Int(5));
        assert_eq!(
            expr.evaluate(&doc(json!({"x": 1}))).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_compare() {
        let expr = parse_expression(&json!({"$gt": ["$a", 1]})).unwrap();
        assert_eq!(
            expr.evaluate(&doc(json!({"a": 2}))).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            expr.evaluate(&doc(json!({"a": 1}))).unwrap(),
            Value::Bool(false)
        );
        // Missing resolves to null, which sorts below any number
        assert_eq!(
            expr.evaluate(&doc(json!({}))).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_and_or_not() {
        let expr = parse_expression(&json!({
            "$and": [{"$gt": ["$a", 0]}, {"$lt": ["$a", 10]}]
        }))
        .unwrap();
        assert_eq!(
            expr.evaluate(&doc(json!({"a": 5}))).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            expr.evaluate(&doc(json!({"a": 20}))).unwrap(),
            Value::Bool(false)
        );

        let expr = parse_expression(&json!({"$not": [{"$eq": ["$a", 1]}]})).unwrap();
        assert_eq!(
            expr.evaluate(&doc(json!({"a": 2}))).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_constant_folding() {
        let expr = parse_expression(&json!({"$gt": [3, 1]})).unwrap();
        let optimized = expr.optimize();
        assert_eq!(optimized.as_constant(), Some(&Value::Bool(true)));

        let expr = parse_expression(&json!({
            "$and": [{"$gt": [3, 1]}, {"$gt": ["$a", 1]}]
        }))
        .unwrap();
        let optimized = expr.optimize();
        // The constant-true conjunct drops, leaving the bare comparison
        assert!(optimized.as_constant().is_none());
        assert_eq!(
            optimized.evaluate(&doc(json!({"a": 5}))).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_and_short_circuits_to_false() {
        let expr = parse_expression(&json!({
            "$and": [{"$eq": [1, 2]}, {"$gt": ["$a", 1]}]
        }))
        .unwrap();
        let optimized = expr.optimize();
        assert_eq!(optimized.as_constant(), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_referenced_paths() {
        let expr = parse_expression(&json!({
            "$or": [{"$gt": ["$a.b", 1]}, {"$eq": ["$c", "$d.e"]}]
        }))
        .unwrap();
        let mut paths = BTreeSet::new();
        expr.referenced_paths(&mut paths);
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["a.b", "c", "d.e"]);
    }

    #[test]
    fn test_to_match_predicate() {
        let expr = parse_expression(&json!({"$gt": ["$a", 1]})).unwrap();
        assert_eq!(
            expr.to_match_predicate(),
            Some(json!({"a": {"$gt": 1}}))
        );

        // Path-to-path comparison is not representable
        let expr = parse_expression(&json!({"$gt": ["$a", "$b"]})).unwrap();
        assert_eq!(expr.to_match_predicate(), None);

        let expr = parse_expression(&json!({
            "$and": [{"$gt": ["$a", 1]}, {"$lte": ["$b", 4]}]
        }))
        .unwrap();
        assert_eq!(
            expr.to_match_predicate(),
            Some(json!({"$and": [{"a": {"$gt": 1}}, {"b": {"$lte": 4}}]}))
        );
    }

    #[test]
    fn test_serialize_round_trip() {
        let specs = vec![
            json!("$a.b"),
            json!({"$gt": ["$a", 1]}),
            json!({"$and": [{"$gt": ["$a", 1]}, {"$lt": ["$a", 9]}]}),
            json!({"$literal": "plain"}),
        ];
        for spec in specs {
            let expr = parse_expression(&spec).unwrap();
            assert_eq!(expr.serialize_spec(), spec);
        }
    }

    #[test]
    fn test_document_expr_composite() {
        let expr = parse_expression(&json!({"k": "$k1", "j": "$k2"})).unwrap();
        let value = expr.evaluate(&doc(json!({"k1": 1, "k2": 2}))).unwrap();
        let d = value.as_document().unwrap();
        assert_eq!(d.field_names().collect::<Vec<_>>(), vec!["k", "j"]);
        assert_eq!(d.get("k"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_unknown_operator() {
        let result = parse_expression(&json!({"$frobnicate": [1]}));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unknown expression operator"));
    }
}
