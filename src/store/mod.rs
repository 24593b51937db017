//! Document store capability
//!
//! The engine talks to the document store only through [`DocumentStore`]:
//! run an aggregation pipeline, sample documents, apply a write and list
//! collections. [`MemoryStore`] is the in-process reference implementation
//! with the store's query and aggregation semantics.

mod expr;
pub mod loader;
mod matcher;
mod memory;
mod pipeline;

pub use expr::{evaluate_expression, Vars};
pub use matcher::matches_filter;
pub use memory::MemoryStore;
pub use pipeline::run_pipeline;

use crate::native::Document;
use std::path::PathBuf;
use thiserror::Error;

/// Errors reported by a document store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Invalid pipeline stage '{stage}': {reason}")]
    InvalidStage { stage: String, reason: String },

    #[error("Unknown operator '{op}'")]
    UnknownOperator { op: String },

    #[error("Invalid argument to '{op}': {reason}")]
    InvalidArgument { op: String, reason: String },

    #[error("Duplicate key {key} in collection '{collection}'")]
    DuplicateKey { collection: String, key: String },

    #[error("Operation timed out after {ms} ms")]
    Timeout { ms: u64 },

    #[error("Failed to read {path}: {message}")]
    Io { path: PathBuf, message: String },

    #[error("Invalid document in {path}: {message}")]
    InvalidData { path: PathBuf, message: String },

    #[error("Stream is closed")]
    Closed,
}

impl StoreError {
    pub(crate) fn invalid_argument(op: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            op: op.to_string(),
            reason: reason.into(),
        }
    }
}

/// A stream of result documents fetched in batches
pub trait DocumentStream: Send {
    /// Fetch up to `max` documents; an empty batch means the stream is exhausted
    fn next_batch(&mut self, max: usize) -> Result<Vec<Document>, StoreError>;
}

/// A write operation
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert {
        collection: String,
        documents: Vec<Document>,
    },
    Update {
        collection: String,
        filter: Document,
        /// Update operators (`$set`, `$unset`, `$inc`)
        update: Document,
        multi: bool,
    },
    Delete {
        collection: String,
        filter: Document,
        multi: bool,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Insert { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }
}

/// Outcome of a write operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteResult {
    pub inserted: u64,
    pub matched: u64,
    pub modified: u64,
    pub deleted: u64,
}

impl WriteResult {
    /// Row count reported for the statement
    pub fn affected(&self) -> u64 {
        self.inserted + self.modified + self.deleted
    }
}

/// Outbound capability the engine needs from a document store
pub trait DocumentStore: Send + Sync {
    /// Run an aggregation pipeline (one document per stage) against a collection
    fn run_pipeline(
        &self,
        database: &str,
        collection: &str,
        stages: &[Document],
    ) -> Result<Box<dyn DocumentStream>, StoreError>;

    /// Sample up to `size` documents (`None` samples everything)
    fn sample_documents(
        &self,
        database: &str,
        collection: &str,
        size: Option<usize>,
    ) -> Result<Vec<Document>, StoreError>;

    fn apply_write(&self, database: &str, op: &WriteOp) -> Result<WriteResult, StoreError>;

    fn list_collections(&self, database: &str) -> Result<Vec<String>, StoreError>;
}
