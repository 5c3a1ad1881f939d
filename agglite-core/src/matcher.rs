// agglite-core/src/matcher.rs
//! Legacy matcher used by `$match` and as the pushdown target.
//!
//! Each query operator ($eq, $gt, $in, ...) is a separate type behind the
//! `OperatorMatcher` trait, looked up through a registry. Logical
//! connectives ($and, $or) are handled at the predicate walker level.
//!
//! Comparison operators only match within one type bracket: `{"a": {"$gt":
//! 5}}` never matches a string-valued `a`. Equality treats a missing field
//! like null.

use std::collections::BTreeSet;
use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value as Json};

use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::value::Value;

// ============================================================================
// OPERATOR TRAIT
// ============================================================================

/// A single field-level query operator.
pub trait OperatorMatcher: Send + Sync {
    /// The operator name, e.g. "$gt"
    fn name(&self) -> &'static str;

    /// Test a document value (None when the field is missing) against the
    /// operator's condition value.
    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool>;
}

fn compare_same_bracket(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if a.type_bracket() == b.type_bracket() {
        Some(a.cmp(b))
    } else {
        None
    }
}

fn equals(doc_value: Option<&Value>, cond: &Json) -> bool {
    let target = Value::from_json(cond);
    let effective = doc_value.cloned().unwrap_or(Value::Null);
    effective == target
}

// ============================================================================
// OPERATOR IMPLEMENTATIONS
// ============================================================================

pub struct EqOperator;

impl OperatorMatcher for EqOperator {
    fn name(&self) -> &'static str {
        "$eq"
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        Ok(equals(doc_value, cond))
    }
}

pub struct NeOperator;

impl OperatorMatcher for NeOperator {
    fn name(&self) -> &'static str {
        "$ne"
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        Ok(!equals(doc_value, cond))
    }
}

struct RangeOperator {
    name: &'static str,
    accept: fn(std::cmp::Ordering) -> bool,
}

impl OperatorMatcher for RangeOperator {
    fn name(&self) -> &'static str {
        self.name
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        let Some(value) = doc_value else {
            return Ok(false);
        };
        let target = Value::from_json(cond);
        match compare_same_bracket(value, &target) {
            Some(ordering) => Ok((self.accept)(ordering)),
            None => Ok(false),
        }
    }
}

pub struct InOperator;

impl OperatorMatcher for InOperator {
    fn name(&self) -> &'static str {
        "$in"
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        let Json::Array(candidates) = cond else {
            return Err(AggLiteError::InvalidSpec(
                "$in requires an array".to_string(),
            ));
        };
        Ok(candidates.iter().any(|c| equals(doc_value, c)))
    }
}

pub struct ExistsOperator;

impl OperatorMatcher for ExistsOperator {
    fn name(&self) -> &'static str {
        "$exists"
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        let Json::Bool(want) = cond else {
            return Err(AggLiteError::InvalidSpec(
                "$exists requires a boolean".to_string(),
            ));
        };
        Ok(doc_value.is_some() == *want)
    }
}

pub struct RegexOperator;

impl OperatorMatcher for RegexOperator {
    fn name(&self) -> &'static str {
        "$regex"
    }

    fn matches(&self, doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
        let Json::String(pattern) = cond else {
            return Err(AggLiteError::InvalidSpec(
                "$regex requires a string pattern".to_string(),
            ));
        };
        let re = Regex::new(pattern)
            .map_err(|e| AggLiteError::InvalidSpec(format!("invalid $regex: {}", e)))?;
        match doc_value {
            Some(Value::String(s)) => Ok(re.is_match(s)),
            _ => Ok(false),
        }
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

lazy_static! {
    static ref OPERATOR_REGISTRY: HashMap<&'static str, Box<dyn OperatorMatcher>> = {
        let mut registry: HashMap<&'static str, Box<dyn OperatorMatcher>> = HashMap::new();
        let operators: Vec<Box<dyn OperatorMatcher>> = vec![
            Box::new(EqOperator),
            Box::new(NeOperator),
            Box::new(RangeOperator {
                name: "$gt",
                accept: |o| o == std::cmp::Ordering::Greater,
            }),
            Box::new(RangeOperator {
                name: "$gte",
                accept: |o| o != std::cmp::Ordering::Less,
            }),
            Box::new(RangeOperator {
                name: "$lt",
                accept: |o| o == std::cmp::Ordering::Less,
            }),
            Box::new(RangeOperator {
                name: "$lte",
                accept: |o| o != std::cmp::Ordering::Greater,
            }),
            Box::new(InOperator),
            Box::new(ExistsOperator),
            Box::new(RegexOperator),
        ];
        for op in operators {
            registry.insert(op.name(), op);
        }
        registry
    };
}

// ============================================================================
// PREDICATE WALKER
// ============================================================================

/// Test a document against a predicate object.
pub fn matches_predicate(doc: &Document, predicate: &Json) -> Result<bool> {
    let Json::Object(clauses) = predicate else {
        return Err(AggLiteError::InvalidSpec(
            "matcher predicate must be an object".to_string(),
        ));
    };
    for (key, cond) in clauses {
        let ok = match key.as_str() {
            "$and" => logical_clauses(doc, cond, "$and")?
                .into_iter()
                .all(|b| b),
            "$or" => logical_clauses(doc, cond, "$or")?.into_iter().any(|b| b),
            field => {
                let path = FieldPath::parse(field)?;
                matches_condition(doc.get_path(&path), cond)?
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_clauses(doc: &Document, cond: &Json, op: &str) -> Result<Vec<bool>> {
    let Json::Array(subpredicates) = cond else {
        return Err(AggLiteError::InvalidSpec(format!(
            "{} requires an array of predicates",
            op
        )));
    };
    subpredicates
        .iter()
        .map(|p| matches_predicate(doc, p))
        .collect()
}

fn matches_condition(doc_value: Option<&Value>, cond: &Json) -> Result<bool> {
    if let Json::Object(map) = cond {
        if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) {
            // Tagged values ({"$date": ...} and friends) are equality
            // targets, not operators.
            if !matches!(Value::from_json(cond), Value::Document(_)) {
                return Ok(equals(doc_value, cond));
            }
            for (op_name, op_cond) in map {
                let op = OPERATOR_REGISTRY.get(op_name.as_str()).ok_or_else(|| {
                    AggLiteError::InvalidSpec(format!("Unknown query operator: {}", op_name))
                })?;
                if !op.matches(doc_value, op_cond)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }
    Ok(equals(doc_value, cond))
}

// ============================================================================
// MATCHER
// ============================================================================

/// A compiled predicate-object matcher.
#[derive(Debug, Clone)]
pub struct Matcher {
    predicate: Json,
}

impl Matcher {
    pub fn new(predicate: Json) -> Result<Matcher> {
        if !predicate.is_object() {
            return Err(AggLiteError::InvalidSpec(
                "matcher predicate must be an object".to_string(),
            ));
        }
        Ok(Matcher { predicate })
    }

    pub fn matches(&self, doc: &Document) -> Result<bool> {
        matches_predicate(doc, &self.predicate)
    }

    pub fn predicate(&self) -> &Json {
        &self.predicate
    }

    /// Conjoin two predicate objects; used when adjacent `$match` stages
    /// coalesce and when a filter lands on top of an earlier pushdown.
    pub fn conjoin(a: Json, b: Json) -> Json {
        if let Json::Object(mut map) = a {
            if map.len() == 1 {
                if let Some(Json::Array(clauses)) = map.get_mut("$and") {
                    clauses.push(b);
                    return Json::Object(map);
                }
            }
            return json!({ "$and": [Json::Object(map), b] });
        }
        json!({ "$and": [a, b] })
    }

    /// Collect the field paths the predicate reads.
    pub fn referenced_paths(&self, out: &mut BTreeSet<FieldPath>) {
        collect_paths(&self.predicate, out);
    }
}

fn collect_paths(predicate: &Json, out: &mut BTreeSet<FieldPath>) {
    let Json::Object(clauses) = predicate else {
        return;
    };
    for (key, cond) in clauses {
        match key.as_str() {
            "$and" | "$or" => {
                if let Json::Array(subpredicates) = cond {
                    for p in subpredicates {
                        collect_paths(p, out);
                    }
                }
            }
            field => {
                if let Ok(path) = FieldPath::parse(field) {
                    out.insert(path);
                }
            }
        }
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
    fn test_bare_equality() {
        let m = Matcher::new(json!({"name": "Alice"})).unwrap();
        assert!(m.matches(&doc(json!({"name": "Alice"}))).unwrap());
        assert!(!m.matches(&doc(json!({"name": "Bob"}))).unwrap());
    }

    #[test]
    fn test_null_matches_missing() {
        let m = Matcher::new(json!({"email": null})).unwrap();
        assert!(m.matches(&doc(json!({"name": "Alice"}))).unwrap());
        assert!(m.matches(&doc(json!({"email": null}))).unwrap());
        assert!(!m.matches(&doc(json!({"email": "x@y"}))).unwrap());
    }

    #[test]
    fn test_range_operators() {
        let m = Matcher::new(json!({"age": {"$gte": 18, "$lt": 30}})).unwrap();
        assert!(m.matches(&doc(json!({"age": 25}))).unwrap());
        assert!(!m.matches(&doc(json!({"age": 15}))).unwrap());
        assert!(!m.matches(&doc(json!({"age": 35}))).unwrap());
        // Missing never satisfies a range
        assert!(!m.matches(&doc(json!({}))).unwrap());
    }

    #[test]
    fn test_range_is_bracket_restricted() {
        let m = Matcher::new(json!({"age": {"$gt": 5}})).unwrap();
        assert!(!m.matches(&doc(json!({"age": "ten"}))).unwrap());
    }

    #[test]
    fn test_in_operator() {
        let m = Matcher::new(json!({"city": {"$in": ["NYC", "LA"]}})).unwrap();
        assert!(m.matches(&doc(json!({"city": "NYC"}))).unwrap());
        assert!(!m.matches(&doc(json!({"city": "Chicago"}))).unwrap());
    }

    #[test]
    fn test_exists_operator() {
        let exists = Matcher::new(json!({"email": {"$exists": true}})).unwrap();
        let absent = Matcher::new(json!({"email": {"$exists": false}})).unwrap();
        assert!(exists.matches(&doc(json!({"email": "a@b"}))).unwrap());
        assert!(!exists.matches(&doc(json!({}))).unwrap());
        assert!(absent.matches(&doc(json!({}))).unwrap());
        // Null is present
        assert!(exists.matches(&doc(json!({"email": null}))).unwrap());
    }

    #[test]
    fn test_regex_operator() {
        let m = Matcher::new(json!({"name": {"$regex": "^Al"}})).unwrap();
        assert!(m.matches(&doc(json!({"name": "Alice"}))).unwrap());
        assert!(!m.matches(&doc(json!({"name": "Bob"}))).unwrap());
        assert!(!m.matches(&doc(json!({"name": 42}))).unwrap());
    }

    #[test]
    fn test_logical_connectives() {
        let m = Matcher::new(json!({
            "$and": [
                {"$or": [{"city": "NYC"}, {"city": "LA"}]},
                {"age": {"$gte": 21}}
            ]
        }))
        .unwrap();
        assert!(m.matches(&doc(json!({"city": "LA", "age": 30}))).unwrap());
        assert!(!m.matches(&doc(json!({"city": "LA", "age": 18}))).unwrap());
        assert!(!m
            .matches(&doc(json!({"city": "Chicago", "age": 30})))
            .unwrap());
    }

    #[test]
    fn test_dotted_paths() {
        let m = Matcher::new(json!({"address.city": "NYC"})).unwrap();
        assert!(m
            .matches(&doc(json!({"address": {"city": "NYC"}})))
            .unwrap());
        assert!(!m.matches(&doc(json!({"address": {"city": "LA"}}))).unwrap());
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let m = Matcher::new(json!({"a": {"$frob": 1}})).unwrap();
        let result = m.matches(&doc(json!({"a": 1})));
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Unknown query operator"));
    }

    #[test]
    fn test_conjoin() {
        let merged = Matcher::conjoin(json!({"a": 1}), json!({"b": 2}));
        assert_eq!(merged, json!({"$and": [{"a": 1}, {"b": 2}]}));

        let merged = Matcher::conjoin(merged, json!({"c": 3}));
        assert_eq!(merged, json!({"$and": [{"a": 1}, {"b": 2}, {"c": 3}]}));
    }

    #[test]
    fn test_referenced_paths() {
        let m = Matcher::new(json!({
            "$or": [{"a.b": 1}, {"c": {"$gt": 2}}],
            "d": 4
        }))
        .unwrap();
        let mut paths = BTreeSet::new();
        m.referenced_paths(&mut paths);
        let rendered: Vec<String> = paths.iter().map(|p| p.to_string()).collect();
        assert_eq!(rendered, vec!["a.b", "c", "d"]);
    }
}
