// agglite-core/src/cursor.rs
// Storage cursor contract and the in-memory collection behind it

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value as Json;

use crate::document::Document;
use crate::error::{AggLiteError, Result};
use crate::field_path::FieldPath;
use crate::matcher::Matcher;
use crate::stage::sort::sort_by_keys;

/// A single-owner storage cursor supplying serialized record bytes.
pub trait Cursor: Send {
    /// The next record, or `None` at the end of the scan.
    fn next(&mut self) -> Result<Option<Vec<u8>>>;

    /// Whether the world has changed such that the cursor is unusable.
    fn invalidated(&self) -> bool;

    /// Cooperatively relinquish the read acquisition.
    fn yield_(&mut self) -> Result<()>;
}

/// Post-rewrite snapshot of what was pushed into the source: the predicate,
/// the sort, and the covered projection. Also what explain reports.
#[derive(Debug, Clone, Default)]
pub struct Pushdown {
    pub query: Option<Json>,
    pub sort: Option<Vec<(FieldPath, bool)>>,
    pub projection: Option<BTreeSet<String>>,
}

/// Opens cursors against some store, honoring a pushdown. The cursor
/// source holds one of these and opens lazily on first pull, after the
/// rewrite pass has settled the pushdown.
pub trait CursorFactory: Send {
    fn open(&self, pushdown: &Pushdown) -> Result<Box<dyn Cursor>>;
}

/// A minimal in-memory collection. Serves as the cursor factory for tests
/// and for literal inputs that want the full pushdown path exercised.
#[derive(Debug, Default)]
pub struct Collection {
    docs: RwLock<Vec<Document>>,
    invalidated: Arc<AtomicBool>,
}

impl Collection {
    pub fn new(docs: Vec<Document>) -> Collection {
        Collection {
            docs: RwLock::new(docs),
            invalidated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Build from a JSON array of documents.
    pub fn from_json(json: &Json) -> Result<Collection> {
        let Json::Array(items) = json else {
            return Err(AggLiteError::TypeMismatch(
                "collection input must be an array".to_string(),
            ));
        };
        let docs: Result<Vec<Document>> = items.iter().map(Document::from_json).collect();
        Ok(Collection::new(docs?))
    }

    pub fn insert(&self, doc: Document) {
        self.docs.write().push(doc);
    }

    pub fn len(&self) -> usize {
        self.docs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.read().is_empty()
    }

    /// Simulate the world changing under an open cursor; every cursor
    /// opened against this collection reports invalidation from now on.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Relaxed);
    }
}

impl CursorFactory for Arc<Collection> {
    fn open(&self, pushdown: &Pushdown) -> Result<Box<dyn Cursor>> {
        let guard = self.docs.read();
        let mut selected: Vec<Document> = match &pushdown.query {
            Some(predicate) => {
                let matcher = Matcher::new(predicate.clone())?;
                let mut kept = Vec::new();
                for doc in guard.iter() {
                    if matcher.matches(doc)? {
                        kept.push(doc.clone());
                    }
                }
                kept
            }
            None => guard.iter().cloned().collect(),
        };
        drop(guard);

        if let Some(keys) = &pushdown.sort {
            sort_by_keys(&mut selected, keys);
        }

        let records: Result<Vec<Vec<u8>>> = selected
            .iter()
            .map(|doc| serde_json::to_vec(&doc.to_json()).map_err(Into::into))
            .collect();
        Ok(Box::new(CollectionCursor {
            records: records?,
            position: 0,
            invalidated: Arc::clone(&self.invalidated),
        }))
    }
}

/// Snapshot cursor over an in-memory collection.
///
/// The snapshot is taken at open time, so `next` keeps serving records
/// after a yield; the cursor source is the one that checks `invalidated`
/// across yields and aborts.
pub struct CollectionCursor {
    records: Vec<Vec<u8>>,
    position: usize,
    invalidated: Arc<AtomicBool>,
}

impl Cursor for CollectionCursor {
    fn next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.position >= self.records.len() {
            return Ok(None);
        }
        let record = std::mem::take(&mut self.records[self.position]);
        self.position += 1;
        Ok(Some(record))
    }

    fn invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Relaxed)
    }

    fn yield_(&mut self) -> Result<()> {
        // Nothing to relinquish for a snapshot; invalidation is observed
        // by the caller after this returns.
        Ok(())
    }
}
