// agglite-core/src/field_path.rs
// Dotted navigation into nested documents

use std::fmt;

use crate::error::{AggLiteError, Result};

/// A non-empty ordered sequence of field names, e.g. `a.b.c`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldPath {
    parts: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty paths and empty components are rejected.
    pub fn parse(path: &str) -> Result<FieldPath> {
        if path.is_empty() {
            return Err(AggLiteError::InvalidSpec(
                "field path cannot be empty".to_string(),
            ));
        }
        let parts: Vec<String> = path.split('.').map(str::to_string).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(AggLiteError::InvalidSpec(format!(
                "field path has an empty component: {}",
                path
            )));
        }
        Ok(FieldPath { parts })
    }

    pub fn from_parts(parts: Vec<String>) -> Result<FieldPath> {
        if parts.is_empty() || parts.iter().any(|p| p.is_empty()) {
            return Err(AggLiteError::InvalidSpec(
                "field path components cannot be empty".to_string(),
            ));
        }
        Ok(FieldPath { parts })
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        false // paths are non-empty by construction
    }

    /// First component of the path.
    pub fn head(&self) -> &str {
        &self.parts[0]
    }

    /// The path without its first component, if anything remains.
    pub fn tail(&self) -> Option<FieldPath> {
        if self.parts.len() > 1 {
            Some(FieldPath {
                parts: self.parts[1..].to_vec(),
            })
        } else {
            None
        }
    }

    /// Whether `prefix` is a (non-strict) prefix of this path.
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        self.parts.len() >= prefix.parts.len()
            && self.parts[..prefix.parts.len()] == prefix.parts[..]
    }

    /// A new path with `name` appended.
    pub fn child(&self, name: &str) -> FieldPath {
        let mut parts = self.parts.clone();
        parts.push(name.to_string());
        FieldPath { parts }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.parts.join("."))
    }
}
