//! Load a directory of extended-JSON files into a [`MemoryStore`]
//!
//! Each file is one collection, named after the file stem:
//! ```text
//! /data/
//!   users.json      # an array of documents, or a single document
//!   orders.jsonl    # one document per line
//! ```

use super::{MemoryStore, StoreError};
use crate::native::{from_extended_json, Document, NativeValue};
use std::path::Path;
use tokio::fs;
use tracing::info;
use walkdir::WalkDir;

/// Load every `*.json` and `*.jsonl` file under `dir`; returns the number of documents
pub async fn load_dir(store: &MemoryStore, database: &str, dir: &Path) -> Result<u64, StoreError> {
    let mut loaded = 0;
    let mut files: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("json" | "jsonl")))
        .collect();
    files.sort();

    for path in files {
        let Some(collection) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let documents = read_file(&path).await?;
        store.create_collection(database, collection);
        let count = store.insert_many(database, collection, documents)?;
        info!(collection, documents = count, path = %path.display(), "Loaded collection");
        loaded += count;
    }
    Ok(loaded)
}

async fn read_file(path: &Path) -> Result<Vec<Document>, StoreError> {
    let content = fs::read_to_string(path).await.map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let invalid = |message: String| StoreError::InvalidData {
        path: path.to_path_buf(),
        message,
    };

    let values: Vec<serde_json::Value> = if path.extension().is_some_and(|e| e == "jsonl") {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str(line).map_err(|e| invalid(format!("line {}: {}", n + 1, e)))
            })
            .collect::<Result<_, _>>()?
    } else {
        match serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))? {
            serde_json::Value::Array(items) => items,
            single => vec![single],
        }
    };

    values
        .iter()
        .map(|value| match from_extended_json(value) {
            NativeValue::Document(doc) => Ok(doc),
            other => Err(invalid(format!("expected a document, found {}", other.kind()))),
        })
        .collect()
}
