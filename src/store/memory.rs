//! In-memory document store
//!
//! Databases hold named collections of documents in insertion order.
//! Pipelines run eagerly against a snapshot and are handed out as
//! [`MemoryStream`]s; the store counts open streams so callers can check
//! that abandoned cursors released theirs.

use super::expr::{arithmetic, Arith, Vars};
use super::matcher::matches_filter;
use super::pipeline::run_pipeline;
use super::{DocumentStore, DocumentStream, StoreError, WriteOp, WriteResult};
use crate::native::{to_extended_json, values_equal, Document, JsonMode, NativeValue, ObjectId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

type Collections = BTreeMap<String, Vec<Document>>;

/// Reference [`DocumentStore`] kept entirely in memory
#[derive(Default)]
pub struct MemoryStore {
    databases: RwLock<HashMap<String, Collections>>,
    open_streams: Arc<AtomicUsize>,
    round_trips: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert documents directly, assigning `_id` where missing
    pub fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> Result<u64, StoreError> {
        let op = WriteOp::Insert {
            collection: collection.to_string(),
            documents,
        };
        let mut databases = self.databases.write();
        let collections = databases.entry(database.to_string()).or_default();
        apply(collections, &op).map(|result| result.inserted)
    }

    /// Create an empty collection if it does not exist yet
    pub fn create_collection(&self, database: &str, collection: &str) {
        self.databases
            .write()
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
    }

    /// Number of collection documents, or `None` for an unknown collection
    pub fn count(&self, database: &str, collection: &str) -> Option<usize> {
        self.databases
            .read()
            .get(database)
            .and_then(|c| c.get(collection))
            .map(Vec::len)
    }

    /// Streams handed out and not yet dropped
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    /// Calls made through the [`DocumentStore`] interface
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    fn snapshot(&self, database: &str) -> Collections {
        self.databases.read().get(database).cloned().unwrap_or_default()
    }
}

impl DocumentStore for MemoryStore {
    fn run_pipeline(
        &self,
        database: &str,
        collection: &str,
        stages: &[Document],
    ) -> Result<Box<dyn DocumentStream>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let collections = self.snapshot(database);
        let input = collections.get(collection).cloned().unwrap_or_default();
        let source = |name: &str| collections.get(name).cloned().unwrap_or_default();

        let output = run_pipeline(stages, input, &source, &Vars::new())?;
        debug!(
            database,
            collection,
            stages = stages.len(),
            documents = output.len(),
            "Ran pipeline"
        );
        Ok(Box::new(MemoryStream::new(output, Arc::clone(&self.open_streams))))
    }

    fn sample_documents(
        &self,
        database: &str,
        collection: &str,
        size: Option<usize>,
    ) -> Result<Vec<Document>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let documents = self
            .databases
            .read()
            .get(database)
            .and_then(|c| c.get(collection))
            .cloned()
            .unwrap_or_default();

        let mut keyed: Vec<(u64, usize, Document)> = documents
            .into_iter()
            .enumerate()
            .map(|(position, doc)| (sample_key(&doc), position, doc))
            .collect();
        keyed.sort_by_key(|(key, position, _)| (*key, *position));

        let limit = size.unwrap_or(usize::MAX);
        Ok(keyed.into_iter().take(limit).map(|(_, _, doc)| doc).collect())
    }

    fn apply_write(&self, database: &str, op: &WriteOp) -> Result<WriteResult, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        let mut databases = self.databases.write();
        let collections = databases.entry(database.to_string()).or_default();
        let result = apply(collections, op)?;
        debug!(database, collection = op.collection(), ?result, "Applied write");
        Ok(result)
    }

    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .databases
            .read()
            .get(database)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// FNV-1a over the canonical `_id` text: sampling order independent of storage order
fn sample_key(doc: &Document) -> u64 {
    let id = doc.get("_id").cloned().unwrap_or(NativeValue::Null);
    let text = to_extended_json(&id, JsonMode::Canonical).to_string();
    text.bytes().fold(0xcbf2_9ce4_8422_2325, |hash: u64, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

// ============================================================================
// Writes
// ============================================================================

fn apply(collections: &mut Collections, op: &WriteOp) -> Result<WriteResult, StoreError> {
    match op {
        WriteOp::Insert { collection, documents } => {
            let existing = collections.get(collection.as_str());
            let mut prepared: Vec<Document> = Vec::with_capacity(documents.len());
            for doc in documents {
                let doc = with_id(doc);
                let id = doc.get("_id").cloned().unwrap_or(NativeValue::Null);
                let taken = existing
                    .into_iter()
                    .flatten()
                    .chain(prepared.iter())
                    .any(|other| other.get("_id").is_some_and(|o| values_equal(o, &id)));
                if taken {
                    return Err(StoreError::DuplicateKey {
                        collection: collection.clone(),
                        key: id.to_string(),
                    });
                }
                prepared.push(doc);
            }
            let inserted = prepared.len() as u64;
            collections.entry(collection.clone()).or_default().extend(prepared);
            Ok(WriteResult { inserted, ..WriteResult::default() })
        }
        WriteOp::Update { collection, filter, update, multi } => {
            validate_update(update)?;
            let Some(documents) = collections.get_mut(collection.as_str()) else {
                return Ok(WriteResult::default());
            };
            let mut changes = Vec::new();
            for (position, doc) in documents.iter().enumerate() {
                if !matches_filter(filter, doc, &Vars::new())? {
                    continue;
                }
                changes.push((position, apply_update(doc, update)?));
                if !multi {
                    break;
                }
            }

            let mut result = WriteResult { matched: changes.len() as u64, ..WriteResult::default() };
            for (position, updated) in changes {
                if documents[position] != updated {
                    documents[position] = updated;
                    result.modified += 1;
                }
            }
            Ok(result)
        }
        WriteOp::Delete { collection, filter, multi } => {
            let Some(documents) = collections.get_mut(collection.as_str()) else {
                return Ok(WriteResult::default());
            };
            let mut doomed = Vec::new();
            for (position, doc) in documents.iter().enumerate() {
                if matches_filter(filter, doc, &Vars::new())? {
                    doomed.push(position);
                    if !multi {
                        break;
                    }
                }
            }
            for position in doomed.iter().rev() {
                documents.remove(*position);
            }
            Ok(WriteResult { deleted: doomed.len() as u64, ..WriteResult::default() })
        }
    }
}

/// The document with `_id` first, generating one when missing
fn with_id(doc: &Document) -> Document {
    let id = doc
        .get("_id")
        .cloned()
        .unwrap_or_else(|| NativeValue::ObjectId(ObjectId::new()));
    let mut out = Document::with_capacity(doc.len() + 1);
    out.insert("_id", id);
    for (key, value) in doc.iter().filter(|(k, _)| *k != "_id") {
        out.insert(key, value.clone());
    }
    out
}

fn validate_update(update: &Document) -> Result<(), StoreError> {
    if update.is_empty() {
        return Err(StoreError::invalid_argument("update", "the update document is empty"));
    }
    for (op, fields) in update.iter() {
        if !matches!(op, "$set" | "$unset" | "$inc") {
            return Err(StoreError::UnknownOperator { op: op.to_string() });
        }
        if fields.as_document().is_none() {
            return Err(StoreError::invalid_argument(op, "expected a document of fields"));
        }
    }
    Ok(())
}

fn apply_update(doc: &Document, update: &Document) -> Result<Document, StoreError> {
    let mut updated = doc.clone();
    for (op, fields) in update.iter() {
        let Some(fields) = fields.as_document() else {
            continue;
        };
        for (path, value) in fields.iter() {
            if path == "_id" && updated.get("_id").is_some_and(|id| !values_equal(id, value)) {
                return Err(StoreError::invalid_argument(op, "the _id field is immutable"));
            }
            match op {
                "$set" => updated.set_path(path, value.clone()),
                "$unset" => {
                    updated.remove_path(path);
                }
                _ => {
                    let current = updated.get_path(path).cloned().unwrap_or(NativeValue::Int32(0));
                    if !value.is_numeric() || !current.is_numeric() {
                        return Err(StoreError::invalid_argument(
                            "$inc",
                            format!("cannot increment field '{}' of kind {}", path, current.kind()),
                        ));
                    }
                    updated.set_path(path, arithmetic(Arith::Add, &current, value)?);
                }
            }
        }
    }
    Ok(updated)
}

// ============================================================================
// Streams
// ============================================================================

/// Pipeline output handed out in batches
pub struct MemoryStream {
    pending: VecDeque<Document>,
    open_streams: Arc<AtomicUsize>,
}

impl MemoryStream {
    fn new(documents: Vec<Document>, open_streams: Arc<AtomicUsize>) -> Self {
        open_streams.fetch_add(1, Ordering::SeqCst);
        Self {
            pending: documents.into(),
            open_streams,
        }
    }
}

impl DocumentStream for MemoryStream {
    fn next_batch(&mut self, max: usize) -> Result<Vec<Document>, StoreError> {
        let take = max.max(1).min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::from_extended_json;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        match from_extended_json(&value) {
            NativeValue::Document(d) => d,
            other => panic!("not a document: {:?}", other),
        }
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_many(
                "test",
                "users",
                vec![
                    doc(json!({"_id": 1, "name": "A", "age": 25})),
                    doc(json!({"_id": 2, "name": "B", "age": 40})),
                    doc(json!({"_id": 3, "name": "C", "age": 35})),
                ],
            )
            .unwrap();
        store
    }

    fn drain(mut stream: Box<dyn DocumentStream>) -> Vec<Document> {
        let mut out = Vec::new();
        loop {
            let batch = stream.next_batch(2).unwrap();
            if batch.is_empty() {
                return out;
            }
            out.extend(batch);
        }
    }

    #[test]
    fn test_pipeline_stream_batches() {
        let store = seeded();
        let stages = vec![doc(json!({"$sort": {"age": -1}}))];
        let stream = store.run_pipeline("test", "users", &stages).unwrap();
        assert_eq!(store.open_streams(), 1);

        let names: Vec<_> = drain(stream)
            .iter()
            .map(|d| d.get("name").cloned().unwrap())
            .collect();
        assert_eq!(names, vec!["B".into(), "C".into(), "A".into()]);
        assert_eq!(store.open_streams(), 0);
    }

    #[test]
    fn test_insert_assigns_id_first() {
        let store = MemoryStore::new();
        store
            .apply_write(
                "test",
                &WriteOp::Insert {
                    collection: "notes".into(),
                    documents: vec![doc(json!({"title": "x"}))],
                },
            )
            .unwrap();
        let sample = store.sample_documents("test", "notes", None).unwrap();
        assert_eq!(sample[0].keys().collect::<Vec<_>>(), vec!["_id", "title"]);
        assert!(matches!(sample[0].get("_id"), Some(NativeValue::ObjectId(_))));
    }

    #[test]
    fn test_duplicate_key_inserts_nothing() {
        let store = seeded();
        let result = store.apply_write(
            "test",
            &WriteOp::Insert {
                collection: "users".into(),
                documents: vec![doc(json!({"_id": 9})), doc(json!({"_id": 2}))],
            },
        );
        assert!(matches!(result, Err(StoreError::DuplicateKey { .. })));
        assert_eq!(store.count("test", "users"), Some(3));
    }

    #[test]
    fn test_update_and_delete() {
        let store = seeded();
        let result = store
            .apply_write(
                "test",
                &WriteOp::Update {
                    collection: "users".into(),
                    filter: doc(json!({"age": {"$gte": 35}})),
                    update: doc(json!({"$inc": {"age": 1}, "$set": {"senior": true}})),
                    multi: true,
                },
            )
            .unwrap();
        assert_eq!(result.matched, 2);
        assert_eq!(result.modified, 2);

        let result = store
            .apply_write(
                "test",
                &WriteOp::Delete {
                    collection: "users".into(),
                    filter: doc(json!({"senior": true})),
                    multi: false,
                },
            )
            .unwrap();
        assert_eq!(result.deleted, 1);
        assert_eq!(store.count("test", "users"), Some(2));
    }

    #[test]
    fn test_update_rejects_unknown_operator() {
        let store = seeded();
        let result = store.apply_write(
            "test",
            &WriteOp::Update {
                collection: "users".into(),
                filter: Document::new(),
                update: doc(json!({"$rename": {"a": "b"}})),
                multi: true,
            },
        );
        assert!(matches!(result, Err(StoreError::UnknownOperator { .. })));
    }

    #[test]
    fn test_sampling_is_independent_of_storage_order() {
        let forward = MemoryStore::new();
        let backward = MemoryStore::new();
        let docs: Vec<Document> = (0..50).map(|i| doc(json!({"_id": i}))).collect();
        forward.insert_many("db", "c", docs.clone()).unwrap();
        backward
            .insert_many("db", "c", docs.into_iter().rev().collect())
            .unwrap();

        let a = forward.sample_documents("db", "c", Some(10)).unwrap();
        let b = backward.sample_documents("db", "c", Some(10)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 10);
    }

    #[test]
    fn test_list_collections_sorted() {
        let store = seeded();
        store.create_collection("test", "accounts");
        assert_eq!(
            store.list_collections("test").unwrap(),
            vec!["accounts".to_string(), "users".to_string()]
        );
        assert!(store.list_collections("other").unwrap().is_empty());
    }
}
