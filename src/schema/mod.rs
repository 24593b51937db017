//! Schema synthesis for schema-less collections
//!
//! Collections have no declared columns. A table schema is derived by
//! sampling documents and merging the kinds seen per field:
//! - `_id` is always the first column, the primary key and never null
//! - a field missing from some sampled documents, or null in any, is nullable
//! - mixed kinds widen along the canonical type lattice
//!
//! Schemas are advisory. They drive `SELECT *` column hints and strict
//! coercion of written values, never the reading of actual documents.

mod cache;

pub use cache::SchemaCache;

use crate::native::{Document, NativeKind, NativeValue};
use crate::store::{DocumentStore, StoreError};
use crate::types::CanonicalType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;

/// Sampling and layout options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchemaOptions {
    /// Documents to sample; `None` reads the whole collection
    pub sample_size: Option<usize>,
    /// Flatten embedded documents into dotted columns
    pub expand: bool,
    /// Order columns alphabetically instead of by discovery
    pub sort_fields: bool,
}

impl Default for SchemaOptions {
    fn default() -> Self {
        Self {
            sample_size: Some(1000),
            expand: false,
            sort_fields: false,
        }
    }
}

/// Observed kinds of one field across the sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldProfile {
    kinds: BTreeMap<NativeKind, usize>,
    merged: CanonicalType,
    present: usize,
    nulls: usize,
}

impl FieldProfile {
    pub fn observe(&mut self, value: &NativeValue) {
        self.present += 1;
        if value.is_null() {
            self.nulls += 1;
        }
        *self.kinds.entry(value.kind()).or_default() += 1;
        self.merged = self.merged.widen(CanonicalType::of_kind(value.kind()));
    }

    /// Canonical type covering every observed kind
    pub fn merged(&self) -> CanonicalType {
        self.merged
    }

    /// How often each kind was seen
    pub fn kinds(&self) -> &BTreeMap<NativeKind, usize> {
        &self.kinds
    }

    /// Most frequent kind whose canonical type is the merged type; ties go
    /// to the kind declared first
    pub fn write_kind(&self) -> Option<NativeKind> {
        self.kinds
            .iter()
            .filter(|(kind, _)| CanonicalType::of_kind(**kind) == self.merged)
            .filter(|(kind, _)| !matches!(kind, NativeKind::Null | NativeKind::Undefined))
            .fold(None, |best: Option<(NativeKind, usize)>, (kind, count)| match best {
                Some((_, top)) if top >= *count => best,
                _ => Some((*kind, *count)),
            })
            .map(|(kind, _)| kind)
    }

    fn nullable(&self, sampled: usize) -> bool {
        self.present < sampled || self.nulls > 0
    }
}

/// One column of a synthesized table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Field path; dotted when expanded
    pub name: String,
    pub canonical_type: CanonicalType,
    /// Kind used when writing values to this column
    pub native_kind: Option<NativeKind>,
    pub nullable: bool,
    pub primary_key: bool,
    /// 1-based position
    pub ordinal: usize,
}

/// Synthesized schema of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub collection: String,
    pub columns: Vec<ColumnSchema>,
    /// Number of documents the schema was derived from
    pub sampled: usize,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Kind to write `field` as, when the sample settled on one
    pub fn write_kind(&self, field: &str) -> Option<NativeKind> {
        self.column(field).and_then(|c| c.native_kind)
    }
}

/// Fields of `doc` in order; with `expand`, embedded documents become dotted paths
pub(crate) fn flatten_fields<'a>(doc: &'a Document, expand: bool) -> Vec<(String, &'a NativeValue)> {
    let mut out = Vec::with_capacity(doc.len());
    collect_fields(doc, "", expand, &mut out);
    out
}

fn collect_fields<'a>(doc: &'a Document, prefix: &str, expand: bool, out: &mut Vec<(String, &'a NativeValue)>) {
    for (key, value) in doc.iter() {
        let path = if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            NativeValue::Document(inner) if expand && !inner.is_empty() => {
                collect_fields(inner, &path, expand, out)
            }
            _ => out.push((path, value)),
        }
    }
}

/// Derive a table schema from sampled documents
pub fn synthesize_schema(
    store: &dyn DocumentStore,
    database: &str,
    collection: &str,
    options: &SchemaOptions,
) -> Result<TableSchema, StoreError> {
    let sample = store.sample_documents(database, collection, options.sample_size)?;
    let schema = schema_from_documents(collection, &sample, options);
    info!(
        collection,
        sampled = schema.sampled,
        columns = schema.columns.len(),
        "Synthesized schema"
    );
    Ok(schema)
}

/// Merge field profiles over `documents`
pub fn schema_from_documents(collection: &str, documents: &[Document], options: &SchemaOptions) -> TableSchema {
    let mut order: Vec<String> = Vec::new();
    let mut profiles: BTreeMap<String, FieldProfile> = BTreeMap::new();
    for doc in documents {
        for (path, value) in flatten_fields(doc, options.expand) {
            let profile = profiles.entry(path.clone()).or_insert_with(|| {
                order.push(path.clone());
                FieldProfile::default()
            });
            profile.observe(value);
        }
    }

    if options.sort_fields {
        order.sort();
    }
    order.retain(|name| name != "_id");
    order.insert(0, "_id".to_string());

    let sampled = documents.len();
    let columns = order
        .into_iter()
        .enumerate()
        .map(|(index, name)| {
            let profile = profiles.remove(&name).unwrap_or_default();
            let primary_key = name == "_id";
            ColumnSchema {
                canonical_type: if primary_key { CanonicalType::String } else { profile.merged() },
                native_kind: profile.write_kind(),
                nullable: !primary_key && profile.nullable(sampled),
                primary_key,
                ordinal: index + 1,
                name,
            }
        })
        .collect();

    TableSchema {
        collection: collection.to_string(),
        columns,
        sampled,
    }
}

/// User collections, sorted; `system.*` internals are hidden
pub fn list_tables(store: &dyn DocumentStore, database: &str) -> Result<Vec<String>, StoreError> {
    let mut tables: Vec<String> = store
        .list_collections(database)?
        .into_iter()
        .filter(|name| !name.starts_with("system."))
        .collect();
    tables.sort();
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::from_extended_json;
    use crate::store::MemoryStore;
    use proptest::prelude::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        match from_extended_json(&value) {
            NativeValue::Document(d) => d,
            other => panic!("not a document: {:?}", other),
        }
    }

    #[test]
    fn test_numeric_widening() {
        let mut docs: Vec<Document> = (0..9).map(|i| doc(json!({"_id": i, "score": i}))).collect();
        docs.push(doc(json!({"_id": 9, "score": 2.5})));

        let schema = schema_from_documents("scores", &docs, &SchemaOptions::default());
        let score = schema.column("score").unwrap();
        assert_eq!(score.canonical_type, CanonicalType::Float);
        assert!(!score.nullable);
        assert_eq!(score.native_kind, Some(NativeKind::Double));
    }

    #[test]
    fn test_write_kind_follows_merged_type() {
        let mut profile = FieldProfile::default();
        for _ in 0..3 {
            profile.observe(&NativeValue::Int32(1));
        }
        profile.observe(&NativeValue::Double(0.5));
        profile.observe(&NativeValue::Null);
        assert_eq!(profile.merged(), CanonicalType::Float);
        assert_eq!(profile.write_kind(), Some(NativeKind::Double));

        // no sampled kind maps to String, so values are written as they are
        let mut mixed = FieldProfile::default();
        mixed.observe(&NativeValue::Int32(1));
        mixed.observe(&NativeValue::Bool(true));
        assert_eq!(mixed.write_kind(), None);
    }

    #[test]
    fn test_id_first_and_nullability() {
        let docs = vec![
            doc(json!({"name": "A", "_id": 1, "tag": null})),
            doc(json!({"_id": 2, "name": "B"})),
        ];
        let schema = schema_from_documents("users", &docs, &SchemaOptions::default());
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "name", "tag"]);

        let id = &schema.columns[0];
        assert!(id.primary_key);
        assert!(!id.nullable);
        assert_eq!(id.canonical_type, CanonicalType::String);
        assert_eq!(id.ordinal, 1);

        assert!(!schema.column("name").unwrap().nullable);
        assert!(schema.column("tag").unwrap().nullable);
    }

    #[test]
    fn test_mixed_kinds_widen_to_string() {
        let docs = vec![doc(json!({"_id": 1, "v": 1})), doc(json!({"_id": 2, "v": true}))];
        let schema = schema_from_documents("c", &docs, &SchemaOptions::default());
        assert_eq!(schema.column("v").unwrap().canonical_type, CanonicalType::String);
    }

    #[test]
    fn test_expand_and_sort_fields() {
        let docs = vec![doc(json!({"_id": 1, "z": 1, "address": {"city": "Oslo", "zip": "0150"}}))];
        let options = SchemaOptions { expand: true, sort_fields: true, ..SchemaOptions::default() };
        let schema = schema_from_documents("c", &docs, &options);
        let names: Vec<_> = schema.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["_id", "address.city", "address.zip", "z"]);
    }

    #[test]
    fn test_list_tables_hides_system_collections() {
        let store = MemoryStore::new();
        for name in ["users", "system.views", "orders", "system.indexes"] {
            store.create_collection("db", name);
        }
        assert_eq!(list_tables(&store, "db").unwrap(), vec!["orders", "users"]);
    }

    #[test]
    fn test_synthesize_from_store() {
        let store = MemoryStore::new();
        store
            .insert_many("db", "users", vec![doc(json!({"_id": 1, "age": 3}))])
            .unwrap();
        let schema = synthesize_schema(&store, "db", "users", &SchemaOptions::default()).unwrap();
        assert_eq!(schema.sampled, 1);
        assert_eq!(schema.column("age").unwrap().canonical_type, CanonicalType::Integer);
    }

    fn arb_field_value() -> impl Strategy<Value = NativeValue> {
        prop_oneof![
            Just(NativeValue::Null),
            any::<bool>().prop_map(NativeValue::Bool),
            any::<i32>().prop_map(NativeValue::Int32),
            any::<i64>().prop_map(NativeValue::Int64),
            (-1e6f64..1e6).prop_map(NativeValue::Double),
            "[a-z]{0,6}".prop_map(NativeValue::String),
            any::<i64>().prop_map(NativeValue::DateTime),
            (any::<u32>(), any::<u32>()).prop_map(|(time, increment)| NativeValue::Timestamp { time, increment }),
        ]
    }

    proptest! {
        #[test]
        fn prop_profile_only_widens(values in prop::collection::vec(arb_field_value(), 1..32)) {
            let mut profile = FieldProfile::default();
            for value in &values {
                let before = profile.merged();
                profile.observe(value);
                prop_assert!(profile.merged().covers(before));
                prop_assert!(profile.merged().covers(CanonicalType::of_kind(value.kind())));
            }
            if let Some(kind) = profile.write_kind() {
                prop_assert_eq!(CanonicalType::of_kind(kind), profile.merged());
            }
        }
    }
}
