//! Aggregation pipeline execution over in-memory documents

use super::expr::{arithmetic, evaluate_expression, field_value, length, missing_to_null, Arith, Vars};
use super::matcher::matches_filter;
use super::StoreError;
use crate::native::{compare, to_extended_json, values_equal, Document, JsonMode, NativeValue};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Run `stages` over `docs`
///
/// `source` supplies the documents of other collections for `$lookup`.
pub fn run_pipeline(
    stages: &[Document],
    mut docs: Vec<Document>,
    source: &dyn Fn(&str) -> Vec<Document>,
    vars: &Vars,
) -> Result<Vec<Document>, StoreError> {
    for stage in stages {
        let mut entries = stage.iter();
        let (name, spec) = match (entries.next(), entries.next()) {
            (Some(entry), None) => entry,
            _ => return Err(invalid_stage(&stage.to_string(), "a stage must have exactly one field")),
        };

        docs = match name {
            "$match" => {
                let filter = spec_document(name, spec)?;
                let mut kept = Vec::with_capacity(docs.len());
                for doc in docs {
                    if matches_filter(filter, &doc, vars)? {
                        kept.push(doc);
                    }
                }
                kept
            }
            "$project" => project(spec_document(name, spec)?, docs, vars)?,
            "$addFields" | "$set" => add_fields(spec_document(name, spec)?, docs, vars)?,
            "$unset" => {
                let fields = match spec {
                    NativeValue::String(field) => vec![field.clone()],
                    NativeValue::Array(items) => items
                        .iter()
                        .filter_map(|item| item.as_str().map(str::to_string))
                        .collect(),
                    _ => return Err(invalid_stage(name, "expected a field name or an array of names")),
                };
                docs.into_iter()
                    .map(|mut doc| {
                        for field in &fields {
                            doc.remove_path(field);
                        }
                        doc
                    })
                    .collect()
            }
            "$replaceRoot" => {
                let new_root = spec_document(name, spec)?
                    .get("newRoot")
                    .ok_or_else(|| invalid_stage(name, "missing 'newRoot'"))?;
                let mut out = Vec::with_capacity(docs.len());
                for doc in docs {
                    match evaluate_expression(new_root, &doc, vars)? {
                        NativeValue::Document(root) => out.push(root),
                        other => {
                            return Err(invalid_stage(
                                name,
                                &format!("'newRoot' must evaluate to a document, got {}", other.kind()),
                            ))
                        }
                    }
                }
                out
            }
            "$lookup" => lookup(spec_document(name, spec)?, docs, source, vars)?,
            "$unwind" => unwind(spec, docs)?,
            "$group" => group(spec_document(name, spec)?, docs, vars)?,
            "$sort" => sort(spec_document(name, spec)?, docs)?,
            "$skip" => {
                let n = count_argument(name, spec)?;
                docs.into_iter().skip(n).collect()
            }
            "$limit" => {
                let n = count_argument(name, spec)?;
                docs.truncate(n);
                docs
            }
            "$count" => {
                let field = spec
                    .as_str()
                    .filter(|f| !f.is_empty() && !f.starts_with('$') && !f.contains('.'))
                    .ok_or_else(|| invalid_stage(name, "expected a plain field name"))?;
                if docs.is_empty() {
                    Vec::new()
                } else {
                    let mut out = Document::new();
                    out.insert(field, length(docs.len()));
                    vec![out]
                }
            }
            other => return Err(invalid_stage(other, "unsupported stage")),
        };
    }
    Ok(docs)
}

fn invalid_stage(stage: &str, reason: &str) -> StoreError {
    StoreError::InvalidStage {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}

fn spec_document<'a>(stage: &str, spec: &'a NativeValue) -> Result<&'a Document, StoreError> {
    spec.as_document()
        .ok_or_else(|| invalid_stage(stage, "stage argument must be a document"))
}

fn count_argument(stage: &str, spec: &NativeValue) -> Result<usize, StoreError> {
    spec.as_i64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| invalid_stage(stage, "expected a non-negative integer"))
}

// ============================================================================
// Projection
// ============================================================================

fn is_flag(value: &NativeValue) -> bool {
    matches!(value, NativeValue::Bool(_)) || value.is_numeric()
}

fn project(spec: &Document, docs: Vec<Document>, vars: &Vars) -> Result<Vec<Document>, StoreError> {
    let is_exclusion = |v: &NativeValue| is_flag(v) && !v.is_truthy();
    let excluded: Vec<&str> = spec.iter().filter(|(_, v)| is_exclusion(*v)).map(|(k, _)| k).collect();
    let included: Vec<(&str, &NativeValue)> = spec.iter().filter(|(_, v)| !is_exclusion(*v)).collect();

    if included.is_empty() {
        return Ok(docs
            .into_iter()
            .map(|mut doc| {
                for field in &excluded {
                    doc.remove_path(field);
                }
                doc
            })
            .collect());
    }
    if excluded.iter().any(|k| *k != "_id") {
        return Err(invalid_stage("$project", "cannot mix inclusion and exclusion"));
    }

    let keep_id = !excluded.contains(&"_id");
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut projected = Document::with_capacity(included.len() + 1);
        if keep_id {
            if let Some(id) = doc.get("_id") {
                projected.insert("_id", id.clone());
            }
        }
        for (key, value) in &included {
            if is_flag(value) {
                if *key == "_id" {
                    continue;
                }
                if let Some(found) = doc.get_path(key) {
                    projected.set_path(key, found.clone());
                }
            } else {
                let computed = evaluate_expression(value, &doc, vars)?;
                if !matches!(computed, NativeValue::Undefined) {
                    projected.set_path(key, computed);
                }
            }
        }
        out.push(projected);
    }
    Ok(out)
}

fn add_fields(spec: &Document, docs: Vec<Document>, vars: &Vars) -> Result<Vec<Document>, StoreError> {
    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        let mut values = Vec::with_capacity(spec.len());
        for (key, expr) in spec.iter() {
            values.push((key, evaluate_expression(expr, &doc, vars)?));
        }
        let mut doc = doc;
        for (key, value) in values {
            match value {
                NativeValue::Undefined => {
                    doc.remove_path(key);
                }
                value => doc.set_path(key, value),
            }
        }
        out.push(doc);
    }
    Ok(out)
}

// ============================================================================
// Joins
// ============================================================================

fn string_field<'a>(stage: &str, spec: &'a Document, key: &str) -> Result<&'a str, StoreError> {
    spec.get(key)
        .and_then(NativeValue::as_str)
        .ok_or_else(|| invalid_stage(stage, &format!("missing '{}'", key)))
}

/// A value and, for arrays, its elements
fn join_values(value: Option<&NativeValue>) -> Vec<NativeValue> {
    match value {
        None => vec![NativeValue::Null],
        Some(NativeValue::Array(items)) if !items.is_empty() => items.clone(),
        Some(other) => vec![other.clone()],
    }
}

fn lookup(
    spec: &Document,
    docs: Vec<Document>,
    source: &dyn Fn(&str) -> Vec<Document>,
    vars: &Vars,
) -> Result<Vec<Document>, StoreError> {
    let from = string_field("$lookup", spec, "from")?;
    let target = string_field("$lookup", spec, "as")?;
    let foreign = source(from);
    let mut out = Vec::with_capacity(docs.len());

    if let Some(pipeline) = spec.get("pipeline") {
        let stages = pipeline
            .as_array()
            .ok_or_else(|| invalid_stage("$lookup", "'pipeline' must be an array"))?
            .iter()
            .map(|stage| {
                stage
                    .as_document()
                    .cloned()
                    .ok_or_else(|| invalid_stage("$lookup", "pipeline stages must be documents"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let lets = spec.get("let").and_then(NativeValue::as_document);

        for mut doc in docs {
            let mut inner = vars.clone();
            if let Some(lets) = lets {
                for (name, expr) in lets.iter() {
                    let value = missing_to_null(evaluate_expression(expr, &doc, vars)?);
                    inner.insert(name.to_string(), value);
                }
            }
            let joined = run_pipeline(&stages, foreign.clone(), source, &inner)?;
            doc.set_path(
                target,
                NativeValue::Array(joined.into_iter().map(NativeValue::Document).collect()),
            );
            out.push(doc);
        }
        return Ok(out);
    }

    let local_field = string_field("$lookup", spec, "localField")?;
    let foreign_field = string_field("$lookup", spec, "foreignField")?;
    for mut doc in docs {
        let local = join_values(doc.get_path(local_field));
        let matched: Vec<NativeValue> = foreign
            .iter()
            .filter(|f| {
                join_values(f.get_path(foreign_field))
                    .iter()
                    .any(|fv| local.iter().any(|lv| values_equal(lv, fv)))
            })
            .cloned()
            .map(NativeValue::Document)
            .collect();
        doc.set_path(target, NativeValue::Array(matched));
        out.push(doc);
    }
    Ok(out)
}

fn unwind(spec: &NativeValue, docs: Vec<Document>) -> Result<Vec<Document>, StoreError> {
    let (path, preserve) = match spec {
        NativeValue::String(path) => (path.as_str(), false),
        NativeValue::Document(options) => (
            string_field("$unwind", options, "path")?,
            options
                .get("preserveNullAndEmptyArrays")
                .is_some_and(NativeValue::is_truthy),
        ),
        _ => return Err(invalid_stage("$unwind", "expected a path or a document")),
    };
    let path = path
        .strip_prefix('$')
        .ok_or_else(|| invalid_stage("$unwind", "the path must start with '$'"))?;

    let mut out = Vec::with_capacity(docs.len());
    for doc in docs {
        match doc.get_path(path).cloned() {
            Some(NativeValue::Array(items)) if !items.is_empty() => {
                for item in items {
                    let mut unwound = doc.clone();
                    unwound.set_path(path, item);
                    out.push(unwound);
                }
            }
            Some(NativeValue::Array(_)) => {
                if preserve {
                    let mut kept = doc;
                    kept.remove_path(path);
                    out.push(kept);
                }
            }
            None | Some(NativeValue::Null) | Some(NativeValue::Undefined) => {
                if preserve {
                    out.push(doc);
                }
            }
            Some(_) => out.push(doc),
        }
    }
    Ok(out)
}

// ============================================================================
// Grouping and sorting
// ============================================================================

enum Accumulator {
    Sum(NativeValue),
    Avg { total: NativeValue, count: u64 },
    Min(Option<NativeValue>),
    Max(Option<NativeValue>),
    First(Option<NativeValue>),
    Last(NativeValue),
    Push(Vec<NativeValue>),
    AddToSet(Vec<NativeValue>),
    Count(u64),
}

impl Accumulator {
    fn new(op: &str) -> Result<Self, StoreError> {
        Ok(match op {
            "$sum" => Accumulator::Sum(NativeValue::Int32(0)),
            "$avg" => Accumulator::Avg { total: NativeValue::Int32(0), count: 0 },
            "$min" => Accumulator::Min(None),
            "$max" => Accumulator::Max(None),
            "$first" => Accumulator::First(None),
            "$last" => Accumulator::Last(NativeValue::Null),
            "$push" => Accumulator::Push(Vec::new()),
            "$addToSet" => Accumulator::AddToSet(Vec::new()),
            "$count" => Accumulator::Count(0),
            other => return Err(StoreError::UnknownOperator { op: other.to_string() }),
        })
    }

    fn add(&mut self, value: NativeValue) {
        match self {
            Accumulator::Sum(total) => {
                if value.is_numeric() {
                    if let Ok(next) = arithmetic(Arith::Add, total, &value) {
                        *total = next;
                    }
                }
            }
            Accumulator::Avg { total, count } => {
                if value.is_numeric() {
                    if let Ok(next) = arithmetic(Arith::Add, total, &value) {
                        *total = next;
                        *count += 1;
                    }
                }
            }
            Accumulator::Min(best) => keep_extreme(best, value, Ordering::Less),
            Accumulator::Max(best) => keep_extreme(best, value, Ordering::Greater),
            Accumulator::First(first) => {
                if first.is_none() {
                    *first = Some(missing_to_null(value));
                }
            }
            Accumulator::Last(last) => *last = missing_to_null(value),
            Accumulator::Push(items) => {
                if !matches!(value, NativeValue::Undefined) {
                    items.push(value);
                }
            }
            Accumulator::AddToSet(items) => {
                if !matches!(value, NativeValue::Undefined) && !items.iter().any(|i| values_equal(i, &value)) {
                    items.push(value);
                }
            }
            Accumulator::Count(n) => *n += 1,
        }
    }

    fn finish(self) -> NativeValue {
        match self {
            Accumulator::Sum(total) => total,
            Accumulator::Avg { count: 0, .. } => NativeValue::Null,
            Accumulator::Avg { total: NativeValue::Decimal128(total), count } => {
                NativeValue::Decimal128(total / rust_decimal::Decimal::from(count))
            }
            Accumulator::Avg { total, count } => {
                NativeValue::Double(total.as_f64().unwrap_or(f64::NAN) / count as f64)
            }
            Accumulator::Min(best) | Accumulator::Max(best) => best.unwrap_or(NativeValue::Null),
            Accumulator::First(first) => first.unwrap_or(NativeValue::Null),
            Accumulator::Last(last) => last,
            Accumulator::Push(items) | Accumulator::AddToSet(items) => NativeValue::Array(items),
            Accumulator::Count(n) => NativeValue::Int64(n as i64),
        }
    }
}

fn keep_extreme(best: &mut Option<NativeValue>, value: NativeValue, wanted: Ordering) {
    if value.is_null() {
        return;
    }
    if best.as_ref().map_or(true, |current| compare(&value, current) == wanted) {
        *best = Some(value);
    }
}

/// Grouping identity: numerically equal keys of different kinds group together
fn fingerprint(value: &NativeValue) -> String {
    match value {
        v if v.is_null() => "null".to_string(),
        v if v.is_numeric() => format!("n:{}", v.as_f64().unwrap_or(f64::NAN)),
        NativeValue::Document(doc) => {
            let fields: Vec<String> = doc
                .iter()
                .map(|(k, v)| format!("{:?}:{}", k, fingerprint(v)))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        NativeValue::Array(items) => {
            let items: Vec<String> = items.iter().map(fingerprint).collect();
            format!("[{}]", items.join(","))
        }
        other => format!("{}:{}", other.kind().code(), to_extended_json(other, JsonMode::Canonical)),
    }
}

struct Group {
    key: NativeValue,
    accumulators: Vec<Accumulator>,
}

fn group(spec: &Document, docs: Vec<Document>, vars: &Vars) -> Result<Vec<Document>, StoreError> {
    let id_expr = spec
        .get("_id")
        .ok_or_else(|| invalid_stage("$group", "a group specification must include an _id"))?;

    let mut fields = Vec::new();
    for (name, acc) in spec.iter().filter(|(k, _)| *k != "_id") {
        let mut entries = acc.as_document().map(|d| d.iter()).into_iter().flatten();
        match (entries.next(), entries.next()) {
            (Some((op, arg)), None) => {
                Accumulator::new(op)?;
                fields.push((name, op, arg));
            }
            _ => return Err(invalid_stage("$group", &format!("field '{}' must be an accumulator", name))),
        }
    }

    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for doc in &docs {
        let key = missing_to_null(evaluate_expression(id_expr, doc, vars)?);
        let slot = match index.get(&fingerprint(&key)) {
            Some(slot) => *slot,
            None => {
                let accumulators = fields
                    .iter()
                    .map(|(_, op, _)| Accumulator::new(op))
                    .collect::<Result<Vec<_>, _>>()?;
                index.insert(fingerprint(&key), groups.len());
                groups.push(Group { key, accumulators });
                groups.len() - 1
            }
        };
        for ((_, _, arg), acc) in fields.iter().zip(groups[slot].accumulators.iter_mut()) {
            acc.add(evaluate_expression(arg, doc, vars)?);
        }
    }

    Ok(groups
        .into_iter()
        .map(|group| {
            let mut out = Document::with_capacity(fields.len() + 1);
            out.insert("_id", group.key);
            for ((name, _, _), acc) in fields.iter().zip(group.accumulators) {
                out.insert(*name, acc.finish());
            }
            out
        })
        .collect())
}

fn sort(spec: &Document, mut docs: Vec<Document>) -> Result<Vec<Document>, StoreError> {
    let mut keys = Vec::with_capacity(spec.len());
    for (path, direction) in spec.iter() {
        match direction.as_i64() {
            Some(1) => keys.push((path, true)),
            Some(-1) => keys.push((path, false)),
            _ => return Err(invalid_stage("$sort", "sort direction must be 1 or -1")),
        }
    }
    if keys.is_empty() {
        return Err(invalid_stage("$sort", "at least one sort key is required"));
    }

    docs.sort_by(|a, b| {
        for (path, ascending) in &keys {
            let left = missing_to_null(field_value(a, path));
            let right = missing_to_null(field_value(b, path));
            let ordering = compare(&left, &right);
            if ordering != Ordering::Equal {
                return if *ascending { ordering } else { ordering.reverse() };
            }
        }
        Ordering::Equal
    });
    Ok(docs)
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

    fn docs(values: serde_json::Value) -> Vec<Document> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| doc(v.clone()))
            .collect()
    }

    fn users() -> Vec<Document> {
        docs(json!([
            {"_id": 1, "name": "A", "age": 25, "dept": "x"},
            {"_id": 2, "name": "B", "age": 40, "dept": "y"},
            {"_id": 3, "name": "C", "age": 35, "dept": "x"}
        ]))
    }

    fn orders() -> Vec<Document> {
        docs(json!([
            {"_id": 10, "user": 1, "total": 5},
            {"_id": 11, "user": 1, "total": 7},
            {"_id": 12, "user": 3, "total": 1}
        ]))
    }

    fn source(name: &str) -> Vec<Document> {
        if name == "orders" { orders() } else { Vec::new() }
    }

    fn run(stages: serde_json::Value, input: Vec<Document>) -> Vec<Document> {
        run_pipeline(&docs(stages), input, &source, &Vars::new()).unwrap()
    }

    #[test]
    fn test_match_sort_limit_project() {
        let out = run(
            json!([
                {"$match": {"age": {"$gt": 30}}},
                {"$sort": {"age": 1}},
                {"$limit": 2},
                {"$project": {"_id": 0, "name": 1, "age": 1}}
            ]),
            users(),
        );
        assert_eq!(out, docs(json!([{"name": "C", "age": 35}, {"name": "B", "age": 40}])));
    }

    #[test]
    fn test_group_accumulators() {
        let out = run(
            json!([
                {"$group": {
                    "_id": {"g0": "$dept"},
                    "a0": {"$sum": 1},
                    "a1": {"$avg": "$age"},
                    "a2": {"$max": "$name"}
                }}
            ]),
            users(),
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].get_path("_id.g0"), Some(&NativeValue::from("x")));
        assert_eq!(out[0].get("a0"), Some(&NativeValue::Int32(2)));
        assert_eq!(out[0].get("a1"), Some(&NativeValue::Double(30.0)));
        assert_eq!(out[0].get("a2"), Some(&NativeValue::from("C")));
    }

    #[test]
    fn test_group_numeric_keys_merge() {
        let input = docs(json!([{"k": 1}, {"k": 1.0}, {"k": {"$numberLong": "1"}}]));
        let out = run(json!([{"$group": {"_id": "$k", "n": {"$count": {}}}}]), input);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("n"), Some(&NativeValue::Int64(3)));
    }

    #[test]
    fn test_lookup_localfield() {
        let out = run(
            json!([{"$lookup": {"from": "orders", "localField": "_id", "foreignField": "user", "as": "o"}}]),
            users(),
        );
        let counts: Vec<usize> = out
            .iter()
            .map(|d| d.get("o").and_then(NativeValue::as_array).map_or(0, Vec::len))
            .collect();
        assert_eq!(counts, vec![2, 0, 1]);
    }

    #[test]
    fn test_lookup_pipeline_with_unwind() {
        let stages = json!([
            {"$lookup": {
                "from": "orders",
                "let": {"uid": "$_id"},
                "pipeline": [{"$match": {"$expr": {"$eq": ["$user", "$$uid"]}}}],
                "as": "o"
            }},
            {"$unwind": {"path": "$o", "preserveNullAndEmptyArrays": true}}
        ]);
        let left = run(stages.clone(), users());
        assert_eq!(left.len(), 4);
        assert!(left[2].get("o").is_none());

        let mut inner_stages = stages;
        inner_stages[1] = json!({"$unwind": "$o"});
        let inner = run(inner_stages, users());
        assert_eq!(inner.len(), 3);
        assert_eq!(inner[0].get_path("o.total"), Some(&NativeValue::Int32(5)));
    }

    #[test]
    fn test_count_and_skip() {
        let out = run(json!([{"$skip": 1}, {"$count": "n"}]), users());
        assert_eq!(out, docs(json!([{"n": 2}])));

        let empty = run(json!([{"$match": {"age": 0}}, {"$count": "n"}]), users());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_exclusion_projection() {
        let out = run(json!([{"$project": {"age": 0, "dept": 0}}]), users());
        assert_eq!(out[0], doc(json!({"_id": 1, "name": "A"})));
    }

    #[test]
    fn test_add_fields_and_unset() {
        let out = run(
            json!([
                {"$addFields": {"next": {"$add": ["$age", 1]}}},
                {"$unset": ["dept", "_id"]}
            ]),
            users(),
        );
        assert_eq!(out[0], doc(json!({"name": "A", "age": 25, "next": 26})));
    }

    #[test]
    fn test_unknown_stage() {
        let result = run_pipeline(&docs(json!([{"$out": "x"}])), users(), &source, &Vars::new());
        assert!(matches!(result, Err(StoreError::InvalidStage { .. })));
    }
}
