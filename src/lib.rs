//! docbridge - SQL access to document databases
//!
//! Translates DSQL statements into aggregation pipelines and write
//! operations, runs them through a [`store::DocumentStore`], and adapts the
//! resulting documents into typed rows.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         docbridge Engine                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │   DSQL      │  │   Script    │  │   Schema Cache          │  │
//! │  │   Parser    │  │   Bridge    │  │   (sampled snapshots)   │  │
//! │  └──────┬──────┘  └──────┬──────┘  └───────────┬─────────────┘  │
//! │         │                │                     │                │
//! │         ▼                ▼                     │                │
//! │  ┌─────────────────────────────────────────┐   │                │
//! │  │              Translator                 │◄──┤ write kinds    │
//! │  │  (SELECT, INSERT, UPDATE, DELETE, db.*) │   │                │
//! │  └──────────────────┬──────────────────────┘   │                │
//! │                     │ Plan                     │                │
//! │                     ▼                          ▼                │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                  Document Store                             ││
//! │  │  run_pipeline  sample_documents  apply_write  list          ││
//! │  └──────────────────────────┬──────────────────────────────────┘│
//! │                             │ DocumentStream                    │
//! │                             ▼                                   │
//! │  ┌─────────────────────────────────────────────────────────────┐│
//! │  │                 Result Cursor                               ││
//! │  │  (column freezing, overflow column, replay buffer)          ││
//! │  └─────────────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod native;
pub mod plan;
pub mod schema;
pub mod script;
pub mod store;
pub mod types;
pub mod validation;

pub use error::{Error, Result};

pub use config::{ConnectionConfig, EngineConfig};
pub use cursor::{ColumnDescriptor, ResultCursor, Row};
pub use plan::{Params, Plan};
pub use types::{CanonicalType, Cell};

use dsql::Statement;
use plan::Output;
use schema::{list_tables, SchemaCache, TableSchema};
use script::ScriptBridge;
use serde_json::Value;
use std::sync::Arc;
use store::{DocumentStore, StoreError};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use validation::validate_collection_name;

/// The main engine handle, shareable across threads
pub struct Engine {
    store: Arc<dyn DocumentStore>,
    config: EngineConfig,
    bridge: ScriptBridge,
    schemas: Arc<SchemaCache>,
}

impl Engine {
    pub fn new(store: Arc<dyn DocumentStore>, config: EngineConfig) -> Self {
        let schemas = Arc::new(SchemaCache::new(
            Arc::clone(&store),
            config.database.clone(),
            config.schema_options(),
        ));
        let bridge = ScriptBridge::new(config.script.clone());
        info!(database = %config.database, "Opened engine");
        Self {
            store,
            config,
            bridge,
            schemas,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute a statement with a forward-only cursor
    pub fn execute(&self, query: &str, params: &Params) -> Result<ExecuteResult> {
        self.run(query, params, false)
    }

    /// Execute a statement with a scrollable cursor
    pub fn execute_scrollable(&self, query: &str, params: &Params) -> Result<ExecuteResult> {
        self.run(query, params, true)
    }

    /// Parse and translate without contacting the store
    pub fn prepare(&self, query: &str, params: &Params) -> Result<Plan> {
        let statement = dsql::parse(query)?;
        self.translate(&statement, params)
    }

    /// The store operations a statement would run, as extended JSON
    pub fn explain(&self, query: &str, params: &Params) -> Result<Value> {
        Ok(self.prepare(query, params)?.explain())
    }

    /// User collections of the configured database
    pub fn list_tables(&self) -> Result<Vec<String>> {
        Ok(list_tables(self.store.as_ref(), &self.config.database)?)
    }

    /// Synthesized schema of a collection, sampled once and then cached
    pub fn describe_table(&self, collection: &str) -> Result<Arc<TableSchema>> {
        validate_collection_name(collection)?;
        Ok(self.schemas.get_or_refresh(collection)?)
    }

    /// Resample a collection on the blocking pool; running cursors are unaffected
    pub fn refresh_schema(&self, collection: &str) -> JoinHandle<std::result::Result<Arc<TableSchema>, StoreError>> {
        self.schemas.refresh_in_background(collection)
    }

    fn run(&self, query: &str, params: &Params, scrollable: bool) -> Result<ExecuteResult> {
        let statement = dsql::parse(query)?;
        match self.translate(&statement, params)? {
            Plan::Query(pipeline) => {
                let hints = match pipeline.output {
                    Output::Fields if !pipeline.keeps_shape() => None,
                    _ => self.query_hints(&pipeline.collection),
                };
                let stream = self
                    .store
                    .run_pipeline(&self.config.database, &pipeline.collection, &pipeline.documents())?;
                let cursor = ResultCursor::new(
                    stream,
                    pipeline.output,
                    pipeline.default_row,
                    hints,
                    self.config.cursor_options(scrollable),
                );
                Ok(ExecuteResult::Rows(cursor))
            }
            Plan::Write(op) => {
                let result = self.store.apply_write(&self.config.database, &op)?;
                self.schemas.invalidate(op.collection());
                debug!(collection = op.collection(), affected = result.affected(), "Applied write");
                Ok(ExecuteResult::UpdateCount(result.affected()))
            }
        }
    }

    fn translate(&self, statement: &Statement, params: &Params) -> Result<Plan> {
        // writes only use a snapshot that is already cached
        let hints = match statement {
            Statement::Insert(insert) => self.cached_hints(&insert.into),
            Statement::Update(update) => self.cached_hints(&update.collection),
            _ => None,
        };
        plan::Translator::new(&self.bridge, params)?
            .with_hints(hints.as_deref())
            .translate(statement)
    }

    fn cached_hints(&self, collection: &str) -> Option<Arc<TableSchema>> {
        self.config.schema_hints.then(|| self.schemas.get(collection)).flatten()
    }

    /// Hints come from the cache only; a miss schedules a background sample
    /// and this query runs without declared column types
    fn query_hints(&self, collection: &str) -> Option<Arc<TableSchema>> {
        if !self.config.schema_hints {
            return None;
        }
        let hints = self.schemas.get(collection);
        if hints.is_none() && self.schemas.schedule_refresh(collection) {
            debug!(collection, "No schema snapshot, running without hints");
        }
        hints
    }
}

/// Result of executing a statement
pub enum ExecuteResult {
    /// Rows of a query
    Rows(ResultCursor),
    /// Documents inserted, modified or deleted by a write
    UpdateCount(u64),
}

impl std::fmt::Debug for ExecuteResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecuteResult::Rows(cursor) => f.debug_tuple("Rows").field(&cursor.columns().len()).finish(),
            ExecuteResult::UpdateCount(n) => f.debug_tuple("UpdateCount").field(n).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::{Document, NativeValue};
    use crate::store::MemoryStore;

    fn user(id: i32, name: &str) -> Document {
        [("_id", NativeValue::from(id)), ("name", NativeValue::from(name))]
            .into_iter()
            .collect()
    }

    fn engine() -> (Arc<MemoryStore>, Engine) {
        let store = Arc::new(MemoryStore::new());
        let docs = vec![user(1, "Ada"), user(2, "Bob")];
        store.insert_many("admin", "users", docs).unwrap();
        let engine = Engine::new(store.clone(), EngineConfig::default());
        (store, engine)
    }

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_engine_is_shareable() {
        assert_send_sync::<Engine>();
    }

    #[test]
    fn test_prepare_does_not_touch_store() {
        let (store, engine) = engine();
        let plan = engine.prepare("SELECT name FROM users", &Params::new()).unwrap();
        assert!(matches!(plan, Plan::Query(_)));
        assert_eq!(store.round_trips(), 0);
    }

    #[test]
    fn test_write_invalidates_snapshot() {
        let (_store, engine) = engine();
        let before = engine.describe_table("users").unwrap();
        assert!(before.column("age").is_none());

        let result = engine
            .execute("INSERT INTO users (name, age) VALUES ('Cy', 40)", &Params::new())
            .unwrap();
        assert!(matches!(result, ExecuteResult::UpdateCount(1)));

        let after = engine.describe_table("users").unwrap();
        assert!(after.column("age").is_some());
    }

    #[test]
    fn test_cold_query_does_not_sample() {
        let (store, engine) = engine();
        let result = engine.execute("SELECT * FROM users", &Params::new()).unwrap();
        assert!(matches!(result, ExecuteResult::Rows(_)));
        assert_eq!(store.round_trips(), 1);
    }

    #[tokio::test]
    async fn test_cold_query_refreshes_in_background() {
        let (_store, engine) = engine();
        let ExecuteResult::Rows(mut cursor) = engine.execute("SELECT * FROM users", &Params::new()).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(cursor.collect_rows().unwrap().len(), 2);

        for _ in 0..200 {
            if engine.schemas.get("users").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(engine.schemas.get("users").is_some());
    }

    #[test]
    fn test_syntax_error_before_store() {
        let (store, engine) = engine();
        assert!(matches!(
            engine.execute("SELEC name FROM users", &Params::new()),
            Err(Error::Syntax(_))
        ));
        assert_eq!(store.round_trips(), 0);
    }
}
