// agglite-core/src/value.rs
// Immutable value model shared by every pipeline stage

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value as Json;

use crate::document::Document;

/// Canonical cross-type comparison order.
///
/// Values of different brackets always compare in this bracket order,
/// regardless of their contents. All numeric variants (`Int`, `Double`,
/// `Decimal`) share the single "number" bracket and compare numerically.
pub const TYPE_BRACKET_ORDER: [&str; 8] = [
    "null", "number", "string", "document", "array", "binary", "bool", "date",
];

/// An immutable value.
///
/// Arrays and documents are reference-shared, so cloning a value is cheap
/// and structural sharing between documents is the norm.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Decimal(Decimal),
    String(String),
    /// Milliseconds since the Unix epoch
    Date(i64),
    Binary(Vec<u8>),
    Document(Document),
    Array(Arc<Vec<Value>>),
}

impl Value {
    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Arc::new(items))
    }

    /// Index into [`TYPE_BRACKET_ORDER`] for this value.
    pub fn type_bracket(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::Double(_) | Value::Decimal(_) => 1,
            Value::String(_) => 2,
            Value::Document(_) => 3,
            Value::Array(_) => 4,
            Value::Binary(_) => 5,
            Value::Bool(_) => 6,
            Value::Date(_) => 7,
        }
    }

    pub fn bracket_name(&self) -> &'static str {
        TYPE_BRACKET_ORDER[self.type_bracket()]
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Double(_) | Value::Decimal(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric image of the value, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            Value::Decimal(d) => d.to_f64(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Truthiness under the expression language: null, false and numeric
    /// zero are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Double(d) => *d != 0.0,
            Value::Decimal(d) => !d.is_zero(),
            _ => true,
        }
    }

    /// Convert from a JSON value.
    ///
    /// Plain JSON carries no decimal, date or binary types; those round-trip
    /// through tagged single-field objects (`{"$decimal": "1.5"}`,
    /// `{"$date": 1234}`, `{"$binary": "<hex>"}`). A malformed tag falls back
    /// to a plain document.
    pub fn from_json(json: &Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(*b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Double(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s.clone()),
            Json::Array(items) => Value::array(items.iter().map(Value::from_json).collect()),
            Json::Object(map) => {
                if map.len() == 1 {
                    let (key, inner) = map.iter().next().expect("len checked");
                    match (key.as_str(), inner) {
                        ("$decimal", Json::String(s)) => {
                            if let Ok(d) = Decimal::from_str(s) {
                                return Value::Decimal(d);
                            }
                        }
                        ("$date", Json::Number(n)) => {
                            if let Some(ms) = n.as_i64() {
                                return Value::Date(ms);
                            }
                        }
                        ("$binary", Json::String(s)) => {
                            if let Some(bytes) = hex_decode(s) {
                                return Value::Binary(bytes);
                            }
                        }
                        _ => {}
                    }
                }
                Value::Document(Document::from_pairs(
                    map.iter().map(|(k, v)| (k.clone(), Value::from_json(v))),
                ))
            }
        }
    }

    /// Convert to JSON, using the tagged forms for decimal, date and binary.
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(n) => Json::from(*n),
            Value::Double(d) => serde_json::Number::from_f64(*d)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::Decimal(d) => {
                serde_json::json!({ "$decimal": d.to_string() })
            }
            Value::String(s) => Json::String(s.clone()),
            Value::Date(ms) => serde_json::json!({ "$date": ms }),
            Value::Binary(bytes) => serde_json::json!({ "$binary": hex_encode(bytes) }),
            Value::Document(doc) => doc.to_json(),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json).collect()),
        }
    }
}

fn numeric_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Decimal(x), Value::Decimal(y)) => x.cmp(y),
        (Value::Int(x), Value::Decimal(y)) => Decimal::from(*x).cmp(y),
        (Value::Decimal(x), Value::Int(y)) => x.cmp(&Decimal::from(*y)),
        _ => {
            let x = a.as_f64().unwrap_or(f64::NAN);
            let y = b.as_f64().unwrap_or(f64::NAN);
            x.total_cmp(&y)
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Value) -> Ordering {
        let bracket = self.type_bracket().cmp(&other.type_bracket());
        if bracket != Ordering::Equal {
            return bracket;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Date(x), Value::Date(y)) => x.cmp(y),
            (Value::Binary(x), Value::Binary(y)) => {
                x.len().cmp(&y.len()).then_with(|| x.cmp(y))
            }
            (Value::Document(x), Value::Document(y)) => x.cmp_content(y),
            (Value::Array(x), Value::Array(y)) => {
                for (xv, yv) in x.iter().zip(y.iter()) {
                    let c = xv.cmp(yv);
                    if c != Ordering::Equal {
                        return c;
                    }
                }
                x.len().cmp(&y.len())
            }
            _ => numeric_cmp(self, other),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Value) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Numeric variants that compare equal must hash equal, so all
        // numbers hash through their f64 image.
        match self {
            Value::Null => state.write_u8(0),
            Value::Int(_) | Value::Double(_) | Value::Decimal(_) => {
                state.write_u8(1);
                let f = self.as_f64().unwrap_or(f64::NAN);
                let f = if f == 0.0 { 0.0 } else { f };
                if f.is_nan() {
                    state.write_u64(u64::MAX);
                } else {
                    state.write_u64(f.to_bits());
                }
            }
            Value::String(s) => {
                state.write_u8(2);
                s.hash(state);
            }
            Value::Document(doc) => {
                state.write_u8(3);
                doc.hash(state);
            }
            Value::Array(items) => {
                state.write_u8(4);
                for item in items.iter() {
                    item.hash(state);
                }
            }
            Value::Binary(bytes) => {
                state.write_u8(5);
                bytes.hash(state);
            }
            Value::Bool(b) => {
                state.write_u8(6);
                b.hash(state);
            }
            Value::Date(ms) => {
                state.write_u8(7);
                ms.hash(state);
            }
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Value {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Value {
        Value::Document(doc)
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for chunk in bytes.chunks(2) {
        let hi = (chunk[0] as char).to_digit(16)?;
        let lo = (chunk[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    Some(out)
}
