// agglite-core/src/dependency.rs
// Field-set accounting used to prune source materialization

use std::collections::BTreeSet;

use crate::field_path::FieldPath;

/// Tracks which field paths the downstream pipeline requires, plus a flag
/// for "needs the whole document".
///
/// The tracker lives for a single rewrite pass: the driver seeds it with
/// needs-whole-document and walks the stages tail to head, each stage
/// rewriting the set to reflect what it requires from its input given what
/// downstream requires from its output.
#[derive(Debug, Clone)]
pub struct DependencyTracker {
    required: BTreeSet<FieldPath>,
    needs_whole_document: bool,
}

impl DependencyTracker {
    /// A tracker that requires the whole document; the driver's starting
    /// state.
    pub fn whole_document() -> DependencyTracker {
        DependencyTracker {
            required: BTreeSet::new(),
            needs_whole_document: true,
        }
    }

    /// A tracker with an empty requirement set.
    pub fn empty() -> DependencyTracker {
        DependencyTracker {
            required: BTreeSet::new(),
            needs_whole_document: false,
        }
    }

    pub fn needs_whole_document(&self) -> bool {
        self.needs_whole_document
    }

    pub fn set_needs_whole_document(&mut self, needs: bool) {
        self.needs_whole_document = needs;
    }

    pub fn add_required(&mut self, path: FieldPath) {
        self.required.insert(path);
    }

    pub fn remove_required(&mut self, path: &FieldPath) {
        self.required.remove(path);
    }

    pub fn is_required(&self, path: &FieldPath) -> bool {
        self.needs_whole_document || self.required.contains(path)
    }

    /// Whether anything at or below `prefix` is required.
    pub fn any_required_below(&self, prefix: &FieldPath) -> bool {
        if self.needs_whole_document {
            return true;
        }
        self.required.iter().any(|p| p.starts_with(prefix))
    }

    /// Whether `path` or any of its prefixes is required (a requirement on
    /// `a` covers `a.b`).
    pub fn covered_by_required(&self, path: &FieldPath) -> bool {
        if self.needs_whole_document {
            return true;
        }
        self.required.iter().any(|p| path.starts_with(p))
    }

    pub fn required_paths(&self) -> impl Iterator<Item = &FieldPath> {
        self.required.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// Replace the whole requirement set; used by stages whose output is
    /// synthesized rather than passed through (e.g. group).
    pub fn replace(&mut self, required: BTreeSet<FieldPath>) {
        self.required = required;
        self.needs_whole_document = false;
    }

    /// The distinct top-level field names required; the cursor source uses
    /// these to materialize selectively.
    pub fn top_level_fields(&self) -> BTreeSet<String> {
        self.required.iter().map(|p| p.head().to_string()).collect()
    }
}
