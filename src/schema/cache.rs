//! Cached schema snapshots
//!
//! Readers always get the last published snapshot and never wait on
//! sampling. A refresh samples without holding the lock and swaps the new
//! snapshot in when done; stale snapshots are acceptable.

use super::{synthesize_schema, SchemaOptions, TableSchema};
use crate::store::{DocumentStore, StoreError};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct SchemaCache {
    store: Arc<dyn DocumentStore>,
    database: String,
    options: SchemaOptions,
    snapshots: RwLock<HashMap<String, Arc<TableSchema>>>,
    /// Collections with a scheduled refresh still running
    pending: Mutex<HashSet<String>>,
}

impl SchemaCache {
    pub fn new(store: Arc<dyn DocumentStore>, database: impl Into<String>, options: SchemaOptions) -> Self {
        Self {
            store,
            database: database.into(),
            options,
            snapshots: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
        }
    }

    /// The current snapshot, if one was taken
    pub fn get(&self, collection: &str) -> Option<Arc<TableSchema>> {
        self.snapshots.read().get(collection).cloned()
    }

    /// Sample the collection now and publish the result
    pub fn refresh(&self, collection: &str) -> Result<Arc<TableSchema>, StoreError> {
        let schema = Arc::new(synthesize_schema(
            self.store.as_ref(),
            &self.database,
            collection,
            &self.options,
        )?);
        self.snapshots
            .write()
            .insert(collection.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    pub fn get_or_refresh(&self, collection: &str) -> Result<Arc<TableSchema>, StoreError> {
        match self.get(collection) {
            Some(schema) => Ok(schema),
            None => self.refresh(collection),
        }
    }

    /// Refresh on the blocking pool; cursors keep reading the old snapshot meanwhile
    pub fn refresh_in_background(self: &Arc<Self>, collection: &str) -> JoinHandle<Result<Arc<TableSchema>, StoreError>> {
        let cache = Arc::clone(self);
        let collection = collection.to_string();
        debug!(collection = %collection, "Scheduling schema refresh");
        tokio::task::spawn_blocking(move || cache.refresh(&collection))
    }

    /// Start a background refresh unless one is already running. Without a
    /// tokio runtime nothing is scheduled and the caller goes on without hints.
    pub fn schedule_refresh(self: &Arc<Self>, collection: &str) -> bool {
        let Ok(handle) = Handle::try_current() else {
            debug!(collection, "No runtime for a background schema refresh");
            return false;
        };
        if !self.pending.lock().insert(collection.to_string()) {
            return false;
        }
        let cache = Arc::clone(self);
        let collection = collection.to_string();
        debug!(collection = %collection, "Scheduling schema refresh");
        handle.spawn_blocking(move || {
            let result = cache.refresh(&collection);
            cache.pending.lock().remove(&collection);
            if let Err(e) = result {
                warn!(collection = %collection, error = %e, "Background schema refresh failed");
            }
        });
        true
    }

    /// Drop a snapshot, e.g. after a write changed the collection
    pub fn invalidate(&self, collection: &str) {
        self.snapshots.write().remove(collection);
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{Document, NativeValue};
    use crate::store::MemoryStore;
    use crate::types::CanonicalType;

    fn store_with_ages(ages: &[i32]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let docs = ages
            .iter()
            .enumerate()
            .map(|(i, age)| {
                let mut doc = Document::new();
                doc.insert("_id", i as i32);
                doc.insert("age", *age);
                doc
            })
            .collect();
        store.insert_many("db", "users", docs).unwrap();
        store
    }

    #[test]
    fn test_get_or_refresh_caches() {
        let store = store_with_ages(&[1, 2]);
        let cache = SchemaCache::new(store.clone(), "db", SchemaOptions::default());
        assert!(cache.get("users").is_none());

        let first = cache.get_or_refresh("users").unwrap();
        let trips = store.round_trips();
        let second = cache.get_or_refresh("users").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.round_trips(), trips);

        cache.invalidate("users");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_schedule_refresh_needs_a_runtime() {
        let store = store_with_ages(&[1]);
        let cache = Arc::new(SchemaCache::new(store.clone(), "db", SchemaOptions::default()));
        assert!(!cache.schedule_refresh("users"));
        assert_eq!(store.round_trips(), 0);
        assert!(cache.get("users").is_none());
    }

    #[tokio::test]
    async fn test_scheduled_refresh_publishes_snapshot() {
        let store = store_with_ages(&[1, 2]);
        let cache = Arc::new(SchemaCache::new(store.clone(), "db", SchemaOptions::default()));
        assert!(cache.schedule_refresh("users"));

        for _ in 0..200 {
            if cache.get("users").is_some() && cache.pending.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(cache.get("users").unwrap().sampled, 2);
        assert!(cache.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_background_refresh_publishes_snapshot() {
        let store = store_with_ages(&[30]);
        let cache = Arc::new(SchemaCache::new(store.clone(), "db", SchemaOptions::default()));
        cache.refresh("users").unwrap();

        let mut doc = Document::new();
        doc.insert("_id", 99);
        doc.insert("age", NativeValue::Double(1.5));
        store.insert_many("db", "users", vec![doc]).unwrap();

        // the old snapshot stays readable while the refresh runs
        let stale = cache.get("users").unwrap();
        assert_eq!(stale.column("age").unwrap().canonical_type, CanonicalType::Integer);

        let fresh = cache.refresh_in_background("users").await.unwrap().unwrap();
        assert_eq!(fresh.column("age").unwrap().canonical_type, CanonicalType::Float);
        assert_eq!(cache.get("users").unwrap().sampled, 2);
    }
}
