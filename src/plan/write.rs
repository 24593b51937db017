//! INSERT, UPDATE and DELETE translation

use super::expr::Context;
use super::{TranslationError, Translator};
use crate::error::{Error, Result};
use crate::native::{Document, NativeValue};
use crate::store::WriteOp;
use crate::types::{natural_kind, to_native, Cell};
use crate::validation::{validate_field_path, validate_writable_collection};
use dsql::{BinaryOp, DeleteStmt, Expr, InsertStmt, TableRef, UpdateStmt};

fn translation(node: impl Into<String>, reason: impl Into<String>) -> Error {
    Error::from(TranslationError::new(node, reason))
}

impl Translator<'_> {
    pub(super) fn translate_insert(&self, insert: &InsertStmt) -> Result<WriteOp> {
        validate_writable_collection(&insert.into)?;
        if insert.columns.is_empty() {
            return Err(translation(insert.into.as_str(), "INSERT needs a column list"));
        }
        for column in &insert.columns {
            validate_field_path(column)?;
        }

        let mut documents = Vec::with_capacity(insert.rows.len());
        for (i, row) in insert.rows.iter().enumerate() {
            if row.len() != insert.columns.len() {
                return Err(translation(
                    format!("VALUES row {}", i + 1),
                    format!("expected {} values, got {}", insert.columns.len(), row.len()),
                ));
            }
            let mut doc = Document::with_capacity(row.len());
            for (column, expr) in insert.columns.iter().zip(row) {
                doc.set_path(column, self.written_value(column, expr)?);
            }
            documents.push(doc);
        }

        Ok(WriteOp::Insert {
            collection: insert.into.clone(),
            documents,
        })
    }

    pub(super) fn translate_update(&self, update: &UpdateStmt) -> Result<WriteOp> {
        validate_writable_collection(&update.collection)?;
        let mut set = Document::new();
        let mut inc = Document::new();
        for clause in &update.set {
            validate_field_path(&clause.column)?;
            match self.increment(&clause.column, &clause.value)? {
                Some(step) => inc.insert(clause.column.as_str(), step),
                None => set.insert(clause.column.as_str(), self.written_value(&clause.column, &clause.value)?),
            }
        }

        let mut operators = Document::with_capacity(2);
        if !set.is_empty() {
            operators.insert("$set", set);
        }
        if !inc.is_empty() {
            operators.insert("$inc", inc);
        }
        Ok(WriteOp::Update {
            collection: update.collection.clone(),
            filter: self.write_filter(&update.collection, update.where_clause.as_ref())?,
            update: operators,
            multi: true,
        })
    }

    pub(super) fn translate_delete(&self, delete: &DeleteStmt) -> Result<WriteOp> {
        validate_writable_collection(&delete.from)?;
        Ok(WriteOp::Delete {
            collection: delete.from.clone(),
            filter: self.write_filter(&delete.from, delete.where_clause.as_ref())?,
            multi: true,
        })
    }

    fn write_filter(&self, collection: &str, condition: Option<&Expr>) -> Result<Document> {
        let table = TableRef::new(collection);
        let ctx = Context::new(&table, &[]);
        match condition {
            Some(condition) => self.filter(condition, &ctx),
            None => Ok(Document::new()),
        }
    }

    /// A value to store in `field`, converted to the kind the collection uses
    fn written_value(&self, field: &str, expr: &Expr) -> Result<NativeValue> {
        if let Expr::Native(span) = expr {
            return self.fragment(&span.text);
        }
        let Some(cell) = self.constant_cell(expr)? else {
            return Err(translation(
                expr.to_string(),
                "written values must be literals, parameters or $$ fragments",
            ));
        };
        let kind = match &cell {
            Cell::Null => natural_kind(&cell),
            _ => self
                .hints
                .and_then(|schema| schema.write_kind(field))
                .unwrap_or_else(|| natural_kind(&cell)),
        };
        Ok(to_native(&cell, kind)?)
    }

    /// `SET n = n + 1` and `SET n = n - 1` become `$inc`
    fn increment(&self, field: &str, expr: &Expr) -> Result<Option<NativeValue>> {
        let Expr::BinaryOp { left, op: op @ (BinaryOp::Add | BinaryOp::Sub), right } = expr else {
            return Ok(None);
        };
        let Expr::Column(column) = left.as_ref() else {
            return Ok(None);
        };
        if column.path() != field {
            return Ok(None);
        }
        let step = match self.constant_cell(right)? {
            Some(Cell::Integer(i)) if *op == BinaryOp::Sub => i
                .checked_neg()
                .map(Cell::Integer)
                .ok_or_else(|| translation(expr.to_string(), "integer overflow"))?,
            Some(Cell::Float(f)) if *op == BinaryOp::Sub => Cell::Float(-f),
            Some(Cell::Decimal(d)) if *op == BinaryOp::Sub => Cell::Decimal(-d),
            Some(cell @ (Cell::Integer(_) | Cell::Float(_) | Cell::Decimal(_))) => cell,
            _ => return Err(translation(expr.to_string(), "increments must be numeric constants")),
        };
        Ok(Some(to_native(&step, natural_kind(&step))?))
    }
}
