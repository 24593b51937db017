//! Column resolution for result documents

use crate::native::Document;
use crate::plan::OutputColumn;
use crate::schema::{flatten_fields, TableSchema};
use crate::types::{to_canonical, CanonicalType, Cell};
use std::sync::Arc;

/// Metadata of one result column
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescriptor {
    pub name: String,
    /// Type reported by the schema snapshot, if the column is known to it
    pub declared_type: Option<CanonicalType>,
    /// Widened type of the values returned so far
    pub inferred_type: CanonicalType,
    pub nullable: bool,
    /// 1-based position
    pub ordinal: usize,
}

impl ColumnDescriptor {
    fn new(name: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            declared_type: None,
            inferred_type: CanonicalType::Null,
            nullable: true,
            ordinal,
        }
    }

    /// The declared type when known, otherwise the inferred one
    pub fn column_type(&self) -> CanonicalType {
        self.declared_type.unwrap_or(self.inferred_type)
    }

    fn observe(&mut self, cell: &Cell) {
        if matches!(cell, Cell::Null) {
            self.nullable = true;
        }
        self.inferred_type = self.inferred_type.widen(cell.canonical_type());
    }

    fn declare(&mut self, hints: Option<&TableSchema>, field: &str) {
        if let Some(column) = hints.and_then(|h| h.column(field)) {
            self.declared_type = Some(column.canonical_type);
            self.nullable = column.nullable;
        }
    }
}

/// How documents become rows
pub(super) enum Layout {
    /// Exactly these keys, in order
    Fixed(Vec<OutputColumn>),
    /// Columns found in the documents; the overflow column is always last
    Discovered {
        fields: Vec<String>,
        expand: bool,
        frozen: bool,
    },
}

pub(super) struct Columns {
    layout: Layout,
    descriptors: Vec<ColumnDescriptor>,
    hints: Option<Arc<TableSchema>>,
}

impl Columns {
    pub(super) fn fixed(columns: Vec<OutputColumn>, hints: Option<Arc<TableSchema>>) -> Self {
        let descriptors = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let mut descriptor = ColumnDescriptor::new(column.label.as_str(), i + 1);
                if let Some(source) = &column.source {
                    descriptor.declare(hints.as_deref(), source);
                }
                descriptor
            })
            .collect();
        Self {
            layout: Layout::Fixed(columns),
            descriptors,
            hints,
        }
    }

    /// Discovered columns start from the schema snapshot, then grow from the first batch
    pub(super) fn discovered(overflow: &str, expand: bool, hints: Option<Arc<TableSchema>>) -> Self {
        let mut columns = Self {
            layout: Layout::Discovered {
                fields: Vec::new(),
                expand,
                frozen: false,
            },
            descriptors: vec![ColumnDescriptor::new(overflow, 1)],
            hints,
        };
        let known: Vec<String> = columns
            .hints
            .iter()
            .flat_map(|h| h.columns.iter().map(|c| c.name.clone()))
            .collect();
        for name in known {
            columns.add_field(name);
        }
        columns
    }

    pub(super) fn descriptors(&self) -> &[ColumnDescriptor] {
        &self.descriptors
    }

    pub(super) fn index_of(&self, name: &str) -> Option<usize> {
        self.descriptors.iter().position(|d| d.name == name)
    }

    /// Fold fields of a batch into the column set, until frozen
    pub(super) fn discover(&mut self, docs: &[Document]) {
        let Layout::Discovered { fields, expand, frozen } = &self.layout else {
            return;
        };
        if *frozen {
            return;
        }
        let expand = *expand;
        let mut unseen = Vec::new();
        for doc in docs {
            for (name, _) in flatten_fields(doc, expand) {
                if !fields.contains(&name) && !unseen.contains(&name) {
                    unseen.push(name);
                }
            }
        }
        for name in unseen {
            self.add_field(name);
        }
    }

    /// No more columns once a row has been handed out
    pub(super) fn freeze(&mut self) {
        if let Layout::Discovered { frozen, .. } = &mut self.layout {
            *frozen = true;
        }
    }

    fn add_field(&mut self, name: String) {
        let Layout::Discovered { fields, .. } = &mut self.layout else {
            return;
        };
        if fields.contains(&name) {
            return;
        }
        let mut descriptor = ColumnDescriptor::new(name.as_str(), fields.len() + 1);
        descriptor.declare(self.hints.as_deref(), &name);
        fields.push(name);

        // the overflow column stays last
        let at = self.descriptors.len() - 1;
        self.descriptors.insert(at, descriptor);
        if let Some(overflow) = self.descriptors.last_mut() {
            overflow.ordinal = at + 2;
        }
    }

    /// Convert a document into cells, one per column
    pub(super) fn row(&mut self, doc: &Document) -> Vec<Cell> {
        let cells = match &self.layout {
            Layout::Fixed(columns) => columns
                .iter()
                .map(|c| doc.get(&c.key).map(to_canonical).unwrap_or(Cell::Null))
                .collect(),
            Layout::Discovered { fields, expand, .. } => {
                let mut cells = vec![Cell::Null; fields.len() + 1];
                let mut overflow = Document::new();
                for (name, value) in flatten_fields(doc, *expand) {
                    match fields.iter().position(|f| *f == name) {
                        Some(index) => cells[index] = to_canonical(value),
                        None => overflow.insert(name, value.clone()),
                    }
                }
                if !overflow.is_empty() {
                    cells[fields.len()] = Cell::Document(overflow);
                }
                cells
            }
        };
        for (descriptor, cell) in self.descriptors.iter_mut().zip(&cells) {
            descriptor.observe(cell);
        }
        cells
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::NativeValue;
    use crate::schema::{schema_from_documents, SchemaOptions};

    fn doc(pairs: &[(&str, NativeValue)]) -> Document {
        pairs.iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    #[test]
    fn test_discovered_columns_freeze() {
        let mut columns = Columns::discovered("_overflow", false, None);
        columns.discover(&[
            doc(&[("_id", 1.into()), ("a", 1.into())]),
            doc(&[("_id", 2.into()), ("b", "x".into())]),
        ]);
        let names: Vec<_> = columns.descriptors().iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, ["_id", "a", "b", "_overflow"]);
        assert_eq!(columns.descriptors()[3].ordinal, 4);

        columns.freeze();
        columns.discover(&[doc(&[("_id", 3.into()), ("c", true.into())])]);
        assert_eq!(columns.descriptors().len(), 4);

        let cells = columns.row(&doc(&[("_id", 3.into()), ("c", true.into())]));
        assert_eq!(cells[0], Cell::Integer(3));
        assert_eq!(cells[1], Cell::Null);
        assert_eq!(cells[3], Cell::Document(doc(&[("c", true.into())])));
    }

    #[test]
    fn test_fixed_columns() {
        let mut columns = Columns::fixed(
            vec![OutputColumn {
                label: "name".into(),
                key: "name".into(),
                source: Some("name".into()),
            }],
            None,
        );
        assert_eq!(columns.row(&doc(&[("age", 3.into())])), vec![Cell::Null]);
        assert_eq!(columns.row(&doc(&[("name", "a".into())])), vec![Cell::String("a".into())]);
        assert_eq!(columns.descriptors()[0].inferred_type, CanonicalType::String);
    }

    #[test]
    fn test_null_rows_make_hinted_column_nullable() {
        let sampled = vec![doc(&[("_id", 1.into()), ("name", "a".into())])];
        let hints = schema_from_documents("users", &sampled, &SchemaOptions::default());
        assert!(!hints.column("name").unwrap().nullable);

        let mut columns = Columns::fixed(
            vec![OutputColumn {
                label: "name".into(),
                key: "name".into(),
                source: Some("name".into()),
            }],
            Some(Arc::new(hints)),
        );
        assert!(!columns.descriptors()[0].nullable);
        columns.row(&doc(&[("name", "b".into())]));
        assert!(!columns.descriptors()[0].nullable);
        assert_eq!(columns.row(&doc(&[("_id", 2.into())])), vec![Cell::Null]);
        assert!(columns.descriptors()[0].nullable);
        assert_eq!(columns.descriptors()[0].declared_type, Some(CanonicalType::String));
    }
}
