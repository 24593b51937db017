//! Query translation for docbridge
//!
//! Turns a parsed statement into a [`Plan`]: an aggregation pipeline for
//! queries, or a write operation for DML. Translation either fully succeeds
//! or fails before the store is contacted. Embedded fragments are evaluated
//! by the script bridge and spliced in as native values; parameters are
//! bound through strict type coercion.
//!
//! Pipelines always follow one stage order, whatever the clause order in
//! the text:
//!
//! ```text
//! $match -> ($lookup, $unwind)* -> $match -> $group -> $match (HAVING)
//!        -> $project -> $sort -> $skip -> $limit
//! ```

mod expr;
mod native;
mod select;
mod write;

pub(crate) use expr::like_to_regex;

use crate::error::{Error, Result};
use crate::native::{to_extended_json, Document, JsonMode, NativeValue};
use crate::schema::TableSchema;
use crate::script::{BindingContext, ScriptBridge};
use crate::store::WriteOp;
use crate::types::{natural_kind, to_native, Cell};
use dsql::{Parameter, Statement};
use serde_json::{json, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// A statement that cannot be expressed as store operations
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Cannot translate `{node}`: {reason}")]
pub struct TranslationError {
    /// The offending part of the statement
    pub node: String,
    pub reason: String,
}

impl TranslationError {
    pub fn new(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            reason: reason.into(),
        }
    }
}

/// Values bound to `?` and `:name` placeholders
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Params {
    /// `?` placeholders, in textual order
    pub positional: Vec<Cell>,
    pub named: HashMap<String, Cell>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn positional(values: Vec<Cell>) -> Self {
        Self {
            positional: values,
            named: HashMap::new(),
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Cell>) -> Self {
        self.named.insert(name.into(), value.into());
        self
    }

    pub fn push(mut self, value: impl Into<Cell>) -> Self {
        self.positional.push(value.into());
        self
    }

    fn get(&self, parameter: &Parameter) -> Option<&Cell> {
        match parameter {
            Parameter::Positional(index) => index.checked_sub(1).and_then(|i| self.positional.get(i)),
            Parameter::Named(name) => self.named.get(name),
        }
    }
}

// ============================================================================
// Plans
// ============================================================================

/// Kind of a pipeline stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageKind {
    Match,
    Project,
    AddFields,
    Unset,
    ReplaceRoot,
    Lookup,
    Unwind,
    Group,
    Sort,
    Skip,
    Limit,
    Count,
    /// A stage taken as-is from a shell command
    Raw(String),
}

impl StageKind {
    pub fn operator(&self) -> &str {
        match self {
            StageKind::Match => "$match",
            StageKind::Project => "$project",
            StageKind::AddFields => "$addFields",
            StageKind::Unset => "$unset",
            StageKind::ReplaceRoot => "$replaceRoot",
            StageKind::Lookup => "$lookup",
            StageKind::Unwind => "$unwind",
            StageKind::Group => "$group",
            StageKind::Sort => "$sort",
            StageKind::Skip => "$skip",
            StageKind::Limit => "$limit",
            StageKind::Count => "$count",
            StageKind::Raw(op) => op,
        }
    }

    pub fn from_operator(op: &str) -> Self {
        match op {
            "$match" => StageKind::Match,
            "$project" => StageKind::Project,
            "$addFields" | "$set" => StageKind::AddFields,
            "$unset" => StageKind::Unset,
            "$replaceRoot" => StageKind::ReplaceRoot,
            "$lookup" => StageKind::Lookup,
            "$unwind" => StageKind::Unwind,
            "$group" => StageKind::Group,
            "$sort" => StageKind::Sort,
            "$skip" => StageKind::Skip,
            "$limit" => StageKind::Limit,
            "$count" => StageKind::Count,
            other => StageKind::Raw(other.to_string()),
        }
    }
}

/// One pipeline stage: `{ <operator>: <spec> }`
#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    pub kind: StageKind,
    pub spec: NativeValue,
}

impl Stage {
    pub fn new(kind: StageKind, spec: impl Into<NativeValue>) -> Self {
        Self { kind, spec: spec.into() }
    }

    pub fn to_document(&self) -> Document {
        let mut doc = Document::with_capacity(1);
        doc.insert(self.kind.operator(), self.spec.clone());
        doc
    }
}

/// A column of the result, read from one key of the output documents
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// Name reported to the client
    pub label: String,
    /// Top-level key in the output documents
    pub key: String,
    /// Field the column reads unchanged, when it is a plain column reference
    pub source: Option<String>,
}

/// Which columns a query produces
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// `SELECT *` and shell queries: columns come from the documents
    Fields,
    /// Exactly these columns, in order
    Columns(Vec<OutputColumn>),
}

/// A translated query
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub collection: String,
    pub stages: Vec<Stage>,
    pub output: Output,
    /// Row to produce when the store returns nothing (ungrouped aggregates)
    pub default_row: Option<Document>,
}

impl Pipeline {
    pub fn documents(&self) -> Vec<Document> {
        self.stages.iter().map(Stage::to_document).collect()
    }

    /// True if output documents are collection documents, possibly filtered or extended
    pub fn keeps_shape(&self) -> bool {
        self.stages.iter().all(|stage| {
            matches!(
                stage.kind,
                StageKind::Match
                    | StageKind::Sort
                    | StageKind::Skip
                    | StageKind::Limit
                    | StageKind::Lookup
                    | StageKind::Unwind
                    | StageKind::AddFields
                    | StageKind::Unset
            )
        })
    }

    pub fn explain(&self) -> Value {
        let stages: Vec<Value> = self
            .stages
            .iter()
            .map(|s| to_extended_json(&NativeValue::Document(s.to_document()), JsonMode::Relaxed))
            .collect();
        json!({ "aggregate": self.collection, "pipeline": stages })
    }
}

/// The store operations for one statement
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Query(Pipeline),
    Write(WriteOp),
}

impl Plan {
    /// The plan as extended JSON, for `EXPLAIN`-style output
    pub fn explain(&self) -> Value {
        let docs = |docs: &[Document]| -> Vec<Value> {
            docs.iter()
                .map(|d| to_extended_json(&NativeValue::Document(d.clone()), JsonMode::Relaxed))
                .collect()
        };
        let doc = |d: &Document| to_extended_json(&NativeValue::Document(d.clone()), JsonMode::Relaxed);
        match self {
            Plan::Query(pipeline) => pipeline.explain(),
            Plan::Write(WriteOp::Insert { collection, documents }) => {
                json!({ "insert": collection, "documents": docs(documents) })
            }
            Plan::Write(WriteOp::Update { collection, filter, update, multi }) => json!({
                "update": collection,
                "updates": [{ "q": doc(filter), "u": doc(update), "multi": multi }],
            }),
            Plan::Write(WriteOp::Delete { collection, filter, multi }) => json!({
                "delete": collection,
                "deletes": [{ "q": doc(filter), "limit": if *multi { 0 } else { 1 } }],
            }),
        }
    }
}

// ============================================================================
// Translator
// ============================================================================

/// Translates statements for one set of parameters
pub struct Translator<'a> {
    bridge: &'a ScriptBridge,
    params: &'a Params,
    bindings: BindingContext,
    hints: Option<&'a TableSchema>,
}

impl<'a> Translator<'a> {
    /// Parameters are converted once here so fragments see them as typed values
    pub fn new(bridge: &'a ScriptBridge, params: &'a Params) -> Result<Self> {
        let mut positional = Vec::with_capacity(params.positional.len());
        for cell in &params.positional {
            positional.push(to_native(cell, natural_kind(cell))?);
        }
        let mut named = HashMap::with_capacity(params.named.len());
        for (name, cell) in &params.named {
            named.insert(name.clone(), to_native(cell, natural_kind(cell))?);
        }
        Ok(Self {
            bridge,
            params,
            bindings: BindingContext::new(positional, named),
            hints: None,
        })
    }

    /// Schema of the written collection, used to pick the kinds of written values
    pub fn with_hints(mut self, hints: Option<&'a TableSchema>) -> Self {
        self.hints = hints;
        self
    }

    pub fn translate(&self, statement: &Statement) -> Result<Plan> {
        let plan = match statement {
            Statement::Select(select) => Plan::Query(self.translate_select(select)?),
            Statement::Insert(insert) => Plan::Write(self.translate_insert(insert)?),
            Statement::Update(update) => Plan::Write(self.translate_update(update)?),
            Statement::Delete(delete) => Plan::Write(self.translate_delete(delete)?),
            Statement::Native(command) => self.translate_native(command)?,
        };
        debug!(plan = %plan.explain(), "Translated statement");
        Ok(plan)
    }

    fn parameter(&self, parameter: &Parameter) -> Result<Cell> {
        self.params.get(parameter).cloned().ok_or_else(|| {
            Error::from(TranslationError::new(
                parameter.to_string(),
                "no value bound for this parameter",
            ))
        })
    }

    /// Evaluate an embedded fragment
    fn fragment(&self, text: &str) -> Result<NativeValue> {
        Ok(self.bridge.evaluate(text, &self.bindings)?)
    }

    fn fragment_document(&self, text: &str) -> Result<Document> {
        Ok(self.bridge.evaluate_document(text, &self.bindings)?)
    }
}
