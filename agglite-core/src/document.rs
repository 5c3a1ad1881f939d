// agglite-core/src/document.rs
// Immutable insertion-ordered documents

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::Value as Json;

use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::value::Value;

/// An immutable mapping from field name to value, preserving insertion
/// order.
///
/// Field order is observable: projection appends computed fields at the
/// end and serialization is ordered. Documents carry no identity beyond
/// their content; two documents with the same ordered fields are equal.
///
/// The field map sits behind an `Arc`, so cloning a document is cheap and
/// the copy-on-write editing methods (`with_field`, `without_field`) share
/// every untouched value with the original.
#[derive(Debug, Clone, Default)]
pub struct Document {
    fields: Arc<IndexMap<String, Value>>,
}

impl Document {
    pub fn new() -> Document {
        Document::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Document
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Document {
            fields: Arc::new(pairs.into_iter().collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    /// Resolve a field path by walking nested documents.
    ///
    /// Traversal stops at anything that is not a document; array traversal
    /// is stage-specific and handled by the stages themselves.
    pub fn get_path(&self, path: &FieldPath) -> Option<&Value> {
        let mut parts = path.parts().iter();
        let mut value = self.get(parts.next()?)?;
        for part in parts {
            value = value.as_document()?.get(part)?;
        }
        Some(value)
    }

    pub fn iter(&self) -> indexmap::map::Iter<'_, String, Value> {
        self.fields.iter()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Copy-on-write: a new document with `name` set to `value`.
    ///
    /// An existing field keeps its position; a new field is appended.
    pub fn with_field(&self, name: &str, value: Value) -> Document {
        let mut fields: IndexMap<String, Value> = (*self.fields).clone();
        fields.insert(name.to_string(), value);
        Document {
            fields: Arc::new(fields),
        }
    }

    /// Copy-on-write: a new document without `name`, other fields keeping
    /// their relative order.
    pub fn without_field(&self, name: &str) -> Document {
        let mut fields: IndexMap<String, Value> = (*self.fields).clone();
        fields.shift_remove(name);
        Document {
            fields: Arc::new(fields),
        }
    }

    /// Build a document from a JSON object. Anything else is a
    /// `TypeMismatch`.
    pub fn from_json(json: &Json) -> Result<Document> {
        match json {
            Json::Object(map) => Ok(Document::from_pairs(
                map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
            )),
            other => Err(AggLiteError::TypeMismatch(format!(
                "expected a document, got: {}",
                other
            ))),
        }
    }

    pub fn to_json(&self) -> Json {
        let mut map = serde_json::Map::new();
        for (name, value) in self.fields.iter() {
            map.insert(name.clone(), value.to_json());
        }
        Json::Object(map)
    }

    /// Ordered field-by-field comparison: field name, then value, with a
    /// shorter document sorting first when it is a prefix of the other.
    pub(crate) fn cmp_content(&self, other: &Document) -> Ordering {
        for ((ka, va), (kb, vb)) in self.fields.iter().zip(other.fields.iter()) {
            let c = ka.cmp(kb);
            if c != Ordering::Equal {
                return c;
            }
            let c = va.cmp(vb);
            if c != Ordering::Equal {
                return c;
            }
        }
        self.fields.len().cmp(&other.fields.len())
    }
}

impl PartialEq for Document {
    fn eq(&self, other: &Document) -> bool {
        self.cmp_content(other) == Ordering::Equal
    }
}

impl Eq for Document {}

impl PartialOrd for Document {
    fn partial_cmp(&self, other: &Document) -> Option<Ordering> {
        Some(self.cmp_content(other))
    }
}

impl Ord for Document {
    fn cmp(&self, other: &Document) -> Ordering {
        self.cmp_content(other)
    }
}

impl Hash for Document {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for (name, value) in self.fields.iter() {
            name.hash(state);
            value.hash(state);
        }
    }
}

/// Mutable builder used by stages that assemble output documents.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    fields: IndexMap<String, Value>,
}

impl DocumentBuilder {
    pub fn new() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn build(self) -> Document {
        Document {
            fields: Arc::new(self.fields),
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
    fn test_insertion_order() {
        let d = doc(json!({"z": 1, "a": 2, "m": 3}));
        let names: Vec<&str> = d.field_names().collect();
        assert_eq!(names, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_equality_is_order_sensitive() {
        let a = doc(json!({"x": 1, "y": 2}));
        let b = doc(json!({"y": 2, "x": 1}));
        assert_ne!(a, b);
        assert_eq!(a, doc(json!({"x": 1, "y": 2})));
    }

    #[test]
    fn test_get_path() {
        let d = doc(json!({"a": {"b": {"c": 42}}, "x": 1}));
        let path = FieldPath::parse("a.b.c").unwrap();
        assert_eq!(d.get_path(&path), Some(&Value::Int(42)));
        assert_eq!(d.get_path(&FieldPath::parse("a.b.missing").unwrap()), None);
        // Path through a non-document stops
        assert_eq!(d.get_path(&FieldPath::parse("x.y").unwrap()), None);
    }

    #[test]
    fn test_with_field_keeps_position_and_appends() {
        let d = doc(json!({"a": 1, "b": 2}));
        let replaced = d.with_field("a", Value::Int(9));
        assert_eq!(
            replaced.field_names().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(replaced.get("a"), Some(&Value::Int(9)));

        let appended = d.with_field("c", Value::Int(3));
        assert_eq!(
            appended.field_names().collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );
        // Original untouched
        assert!(!d.contains("c"));
    }

    #[test]
    fn test_without_field() {
        let d = doc(json!({"a": 1, "b": 2, "c": 3}));
        let trimmed = d.without_field("b");
        assert_eq!(trimmed.field_names().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_from_json_rejects_non_object() {
        assert!(Document::from_json(&json!([1, 2])).is_err());
        assert!(Document::from_json(&json!("text")).is_err());
    }

    #[test]
    fn test_prefix_document_sorts_first() {
        let short = doc(json!({"a": 1}));
        let long = doc(json!({"a": 1, "b": 2}));
        assert!(short < long);
    }

    #[test]
    fn test_builder() {
        let mut b = DocumentBuilder::new();
        b.insert("first", Value::Int(1));
        b.insert("second", Value::Int(2));
        let d = b.build();
        assert_eq!(d.field_names().collect::<Vec<_>>(), vec!["first", "second"]);
    }
}
