//! Shell-form commands: `db.<collection>.<method>(...)`

use super::{Output, OutputColumn, Pipeline, Plan, Stage, StageKind, TranslationError, Translator};
use crate::error::{Error, Result};
use crate::native::{Document, NativeValue};
use crate::store::WriteOp;
use crate::validation::{validate_collection_name, validate_writable_collection};
use dsql::NativeCommand;

fn translation(command: &NativeCommand, reason: impl Into<String>) -> Error {
    Error::from(TranslationError::new(
        format!("db.{}.{}", command.collection, command.method),
        reason,
    ))
}

/// Positional arguments of a call, with optional trailing ones
struct Args<'c> {
    command: &'c NativeCommand,
    values: std::vec::IntoIter<NativeValue>,
}

impl<'c> Args<'c> {
    fn document(&mut self, name: &str) -> Result<Document> {
        self.optional_document(name)?
            .ok_or_else(|| translation(self.command, format!("missing {} argument", name)))
    }

    fn optional_document(&mut self, name: &str) -> Result<Option<Document>> {
        match self.values.next() {
            None | Some(NativeValue::Null) | Some(NativeValue::Undefined) => Ok(None),
            Some(NativeValue::Document(doc)) => Ok(Some(doc)),
            Some(other) => Err(translation(
                self.command,
                format!("{} must be a document, got {}", name, other.kind()),
            )),
        }
    }

    fn documents(&mut self, name: &str) -> Result<Vec<Document>> {
        match self.values.next() {
            Some(NativeValue::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    NativeValue::Document(doc) => Ok(doc),
                    other => Err(translation(
                        self.command,
                        format!("{} must contain documents, got {}", name, other.kind()),
                    )),
                })
                .collect(),
            _ => Err(translation(self.command, format!("{} must be an array of documents", name))),
        }
    }

    fn finish(mut self) -> Result<()> {
        match self.values.next() {
            None => Ok(()),
            Some(_) => Err(translation(self.command, "too many arguments")),
        }
    }
}

fn count_argument(command: &NativeCommand, name: &str, value: Option<NativeValue>) -> Result<i64> {
    value
        .as_ref()
        .filter(|v| v.is_numeric())
        .and_then(NativeValue::as_i64)
        .filter(|n| *n >= 0)
        .ok_or_else(|| translation(command, format!("{}() needs a non-negative integer", name)))
}

impl Translator<'_> {
    pub(super) fn translate_native(&self, command: &NativeCommand) -> Result<Plan> {
        let values = self.call_arguments(&command.args.text)?;
        let mut args = Args {
            command,
            values: values.into_iter(),
        };

        if command.method != "find" && !command.modifiers.is_empty() {
            return Err(translation(command, "cursor modifiers are only supported after find()"));
        }

        let plan = match command.method.as_str() {
            "find" => {
                let filter = args.optional_document("filter")?;
                let projection = args.optional_document("projection")?;
                args.finish()?;
                Plan::Query(self.find(command, filter, projection)?)
            }
            "aggregate" => {
                let stages = args
                    .documents("pipeline")?
                    .into_iter()
                    .map(|stage| raw_stage(command, stage))
                    .collect::<Result<Vec<_>>>()?;
                args.finish()?;
                Plan::Query(Pipeline {
                    collection: command.collection.clone(),
                    stages,
                    output: Output::Fields,
                    default_row: None,
                })
            }
            "countDocuments" | "count" => {
                let filter = args.optional_document("filter")?;
                args.finish()?;
                let mut stages = Vec::with_capacity(2);
                if let Some(filter) = filter {
                    stages.push(Stage::new(StageKind::Match, filter));
                }
                stages.push(Stage::new(StageKind::Count, "count"));
                let mut default_row = Document::with_capacity(1);
                default_row.insert("count", NativeValue::Int32(0));
                Plan::Query(Pipeline {
                    collection: command.collection.clone(),
                    stages,
                    output: Output::Columns(vec![OutputColumn {
                        label: "count".to_string(),
                        key: "count".to_string(),
                        source: None,
                    }]),
                    default_row: Some(default_row),
                })
            }
            "insertOne" => {
                let document = args.document("document")?;
                args.finish()?;
                Plan::Write(WriteOp::Insert {
                    collection: command.collection.clone(),
                    documents: vec![document],
                })
            }
            "insertMany" => {
                let documents = args.documents("documents")?;
                args.finish()?;
                Plan::Write(WriteOp::Insert {
                    collection: command.collection.clone(),
                    documents,
                })
            }
            method @ ("updateOne" | "updateMany") => {
                let filter = args.document("filter")?;
                let update = args.document("update")?;
                args.finish()?;
                if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
                    return Err(translation(command, "update must only contain update operators"));
                }
                Plan::Write(WriteOp::Update {
                    collection: command.collection.clone(),
                    filter,
                    update,
                    multi: method == "updateMany",
                })
            }
            method @ ("deleteOne" | "deleteMany") => {
                let filter = args.document("filter")?;
                args.finish()?;
                Plan::Write(WriteOp::Delete {
                    collection: command.collection.clone(),
                    filter,
                    multi: method == "deleteMany",
                })
            }
            _ => return Err(translation(command, "unsupported method")),
        };

        match &plan {
            Plan::Query(_) => validate_collection_name(&command.collection)?,
            Plan::Write(_) => validate_writable_collection(&command.collection)?,
        }
        Ok(plan)
    }

    /// `find` with its cursor modifiers, in cursor order: sort, skip, limit, projection
    fn find(&self, command: &NativeCommand, filter: Option<Document>, projection: Option<Document>) -> Result<Pipeline> {
        let mut projection = projection;
        let (mut sort, mut skip, mut limit) = (None, None, None);
        for (name, span) in &command.modifiers {
            let mut values = self.call_arguments(&span.text)?.into_iter();
            let value = values.next();
            if values.next().is_some() {
                return Err(translation(command, format!("{}() takes one argument", name)));
            }
            match name.as_str() {
                "sort" => match value {
                    Some(NativeValue::Document(doc)) => sort = Some(doc),
                    _ => return Err(translation(command, "sort() needs a document")),
                },
                "skip" => skip = Some(count_argument(command, name, value)?),
                "limit" => limit = Some(count_argument(command, name, value)?),
                "projection" | "project" => match value {
                    Some(NativeValue::Document(doc)) => projection = Some(doc),
                    _ => return Err(translation(command, "projection() needs a document")),
                },
                other => return Err(translation(command, format!("unsupported cursor modifier {}()", other))),
            }
        }

        let mut stages = Vec::new();
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            stages.push(Stage::new(StageKind::Match, filter));
        }
        if let Some(sort) = sort.filter(|s| !s.is_empty()) {
            stages.push(Stage::new(StageKind::Sort, sort));
        }
        if let Some(skip) = skip.filter(|n| *n > 0) {
            stages.push(Stage::new(StageKind::Skip, NativeValue::Int64(skip)));
        }
        // limit(0) means no limit
        if let Some(limit) = limit.filter(|n| *n > 0) {
            stages.push(Stage::new(StageKind::Limit, NativeValue::Int64(limit)));
        }
        if let Some(projection) = projection.filter(|p| !p.is_empty()) {
            stages.push(Stage::new(StageKind::Project, projection));
        }

        Ok(Pipeline {
            collection: command.collection.clone(),
            stages,
            output: Output::Fields,
            default_row: None,
        })
    }

    /// Evaluate an argument list as one array literal
    fn call_arguments(&self, text: &str) -> Result<Vec<NativeValue>> {
        match self.fragment(&format!("[{}]", text))? {
            NativeValue::Array(values) => Ok(values),
            other => Ok(vec![other]),
        }
    }
}

fn raw_stage(command: &NativeCommand, stage: Document) -> Result<Stage> {
    let mut entries = stage.into_iter();
    match (entries.next(), entries.next()) {
        (Some((operator, spec)), None) if operator.starts_with('$') => {
            Ok(Stage::new(StageKind::from_operator(&operator), spec))
        }
        _ => Err(translation(command, "each pipeline stage must have exactly one operator")),
    }
}

#[cfg(test)]
mod tests {
    use crate::plan::{Output, Params, Plan, Translator};
    use crate::script::{ScriptBridge, ScriptConfig};
    use crate::store::WriteOp;
    use serde_json::json;

    fn translate(text: &str) -> crate::error::Result<Plan> {
        let bridge = ScriptBridge::new(ScriptConfig::default());
        let params = Params::new().bind("min", 30i64);
        let statement = dsql::parse(text)?;
        Translator::new(&bridge, &params)?.translate(&statement)
    }

    #[test]
    fn test_find_with_modifiers() {
        let plan = translate("db.users.find({ age: { $gt: :min } }, { name: 1 }).limit(5).sort({ age: -1 })").unwrap();
        assert_eq!(
            plan.explain(),
            json!({
                "aggregate": "users",
                "pipeline": [
                    { "$match": { "age": { "$gt": 30 } } },
                    { "$sort": { "age": -1 } },
                    { "$limit": 5 },
                    { "$project": { "name": 1 } }
                ]
            })
        );
    }

    #[test]
    fn test_find_everything() {
        let Plan::Query(pipeline) = translate("db.users.find()").unwrap() else {
            panic!("expected a query");
        };
        assert!(pipeline.stages.is_empty());
        assert_eq!(pipeline.output, Output::Fields);
    }

    #[test]
    fn test_count_documents() {
        let Plan::Query(pipeline) = translate("db.users.countDocuments({ active: true })").unwrap() else {
            panic!("expected a query");
        };
        assert_eq!(pipeline.stages.len(), 2);
        assert!(pipeline.default_row.is_some());
        assert_eq!(pipeline.explain()["pipeline"][1], json!({ "$count": "count" }));
    }

    #[test]
    fn test_aggregate() {
        let plan = translate("db.orders.aggregate([{ $group: { _id: '$city', n: { $sum: 1 } } }])").unwrap();
        assert_eq!(
            plan.explain()["pipeline"],
            json!([{ "$group": { "_id": "$city", "n": { "$sum": 1 } } }])
        );
    }

    #[test]
    fn test_writes() {
        let plan = translate("db.users.insertMany([{ name: 'a' }, { name: 'b' }])").unwrap();
        assert!(matches!(plan, Plan::Write(WriteOp::Insert { ref documents, .. }) if documents.len() == 2));

        let plan = translate("db.users.updateOne({ name: 'a' }, { $set: { age: 1 } })").unwrap();
        assert!(matches!(plan, Plan::Write(WriteOp::Update { multi: false, .. })));

        let plan = translate("db.users.deleteMany({})").unwrap();
        assert!(matches!(plan, Plan::Write(WriteOp::Delete { multi: true, .. })));
    }

    #[test]
    fn test_rejected_commands() {
        assert!(translate("db.users.drop()").is_err());
        assert!(translate("db.users.insertOne({ a: 1 }).limit(1)").is_err());
        assert!(translate("db.users.updateMany({}, { age: 1 })").is_err());
        assert!(translate("db.users.find().batchSize(10)").is_err());
    }
}
