//! Query filter evaluation (`$match` and write filters)

use super::expr::{evaluate_expression, Vars};
use super::StoreError;
use crate::native::{compare, values_equal, Document, NativeKind, NativeValue};
use regex::{Regex, RegexBuilder};
use std::cmp::Ordering;

/// Evaluate a query filter against a document
pub fn matches_filter(filter: &Document, doc: &Document, vars: &Vars) -> Result<bool, StoreError> {
    for (key, condition) in filter.iter() {
        let matched = match key {
            "$and" => all_clauses(key, condition)?
                .iter()
                .try_fold(true, |acc, clause| Ok::<_, StoreError>(acc && matches_filter(clause, doc, vars)?))?,
            "$or" => {
                let mut any = false;
                for clause in all_clauses(key, condition)? {
                    if matches_filter(clause, doc, vars)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$nor" => {
                let mut none = true;
                for clause in all_clauses(key, condition)? {
                    if matches_filter(clause, doc, vars)? {
                        none = false;
                        break;
                    }
                }
                none
            }
            "$expr" => evaluate_expression(condition, doc, vars)?.is_truthy(),
            "$comment" => true,
            op if op.starts_with('$') => return Err(StoreError::UnknownOperator { op: op.to_string() }),
            path => field_matches(&candidates(doc, path), condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn all_clauses<'a>(op: &str, condition: &'a NativeValue) -> Result<Vec<&'a Document>, StoreError> {
    let items = condition
        .as_array()
        .filter(|items| !items.is_empty())
        .ok_or_else(|| StoreError::invalid_argument(op, "expected a non-empty array"))?;
    items
        .iter()
        .map(|item| {
            item.as_document()
                .ok_or_else(|| StoreError::invalid_argument(op, "clauses must be documents"))
        })
        .collect()
}

/// Values a path reaches, descending into arrays of documents
fn candidates<'a>(doc: &'a Document, path: &str) -> Vec<&'a NativeValue> {
    let mut out = Vec::new();
    collect(doc, path, &mut out);
    out
}

fn collect<'a>(doc: &'a Document, path: &str, out: &mut Vec<&'a NativeValue>) {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    let Some(value) = doc.get(head) else { return };
    match (value, rest) {
        (value, None) => out.push(value),
        (NativeValue::Document(inner), Some(rest)) => collect(inner, rest, out),
        (NativeValue::Array(items), Some(rest)) => {
            if let Some(index) = rest.split('.').next().and_then(|s| s.parse::<usize>().ok()) {
                if let Some(item) = items.get(index) {
                    match rest.split_once('.') {
                        None => out.push(item),
                        Some((_, deeper)) => {
                            if let NativeValue::Document(d) = item {
                                collect(d, deeper, out);
                            }
                        }
                    }
                }
                return;
            }
            for item in items {
                if let NativeValue::Document(d) = item {
                    collect(d, rest, out);
                }
            }
        }
        _ => {}
    }
}

fn is_operator_document(condition: &NativeValue) -> Option<&Document> {
    condition
        .as_document()
        .filter(|d| d.keys().next().is_some_and(|k| k.starts_with('$')))
}

fn field_matches(values: &[&NativeValue], condition: &NativeValue) -> Result<bool, StoreError> {
    match is_operator_document(condition) {
        Some(ops) => {
            for (op, arg) in ops.iter() {
                if !operator_matches(values, op, arg, ops)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        None => equals(values, condition),
    }
}

/// Each candidate and, for arrays, each element
fn expanded<'a>(values: &[&'a NativeValue]) -> Vec<&'a NativeValue> {
    let mut out = Vec::new();
    for value in values {
        out.push(*value);
        if let NativeValue::Array(items) = value {
            out.extend(items.iter());
        }
    }
    out
}

fn equals(values: &[&NativeValue], target: &NativeValue) -> Result<bool, StoreError> {
    if let NativeValue::Regex { pattern, options } = target {
        let regex = compile_regex(pattern, options)?;
        return Ok(expanded(values)
            .iter()
            .any(|v| v.as_str().is_some_and(|s| regex.is_match(s))));
    }
    if target.is_null() && values.is_empty() {
        return Ok(true);
    }
    Ok(expanded(values).iter().any(|v| values_equal(v, target)))
}

/// Comparison brackets: values only order against the same bracket
fn bracket(value: &NativeValue) -> u8 {
    match value.kind() {
        NativeKind::Null | NativeKind::Undefined => 0,
        k if k.is_numeric() => 1,
        NativeKind::String => 2,
        NativeKind::DateTime => 3,
        NativeKind::Timestamp => 4,
        NativeKind::ObjectId => 5,
        NativeKind::Bool => 6,
        NativeKind::Binary => 7,
        NativeKind::Document => 8,
        NativeKind::Array => 9,
        _ => 10,
    }
}

fn compares(values: &[&NativeValue], target: &NativeValue, accept: fn(Ordering) -> bool) -> bool {
    if target.is_null() && values.is_empty() {
        return accept(Ordering::Equal);
    }
    expanded(values)
        .iter()
        .any(|v| bracket(v) == bracket(target) && accept(compare(v, target)))
}

fn type_matches(value: &NativeValue, spec: &NativeValue) -> Result<bool, StoreError> {
    match spec {
        NativeValue::String(alias) if alias == "number" => Ok(value.is_numeric()),
        NativeValue::String(alias) => NativeKind::from_alias(alias)
            .map(|kind| value.kind() == kind)
            .ok_or_else(|| StoreError::invalid_argument("$type", format!("unknown type '{}'", alias))),
        NativeValue::Array(specs) => {
            for spec in specs {
                if type_matches(value, spec)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        code => code
            .as_i64()
            .and_then(|c| i32::try_from(c).ok())
            .and_then(NativeKind::from_code)
            .map(|kind| value.kind() == kind)
            .ok_or_else(|| StoreError::invalid_argument("$type", "expected a type alias or code")),
    }
}

pub(crate) fn compile_regex(pattern: &str, options: &str) -> Result<Regex, StoreError> {
    RegexBuilder::new(pattern)
        .case_insensitive(options.contains('i'))
        .multi_line(options.contains('m'))
        .dot_matches_new_line(options.contains('s'))
        .ignore_whitespace(options.contains('x'))
        .build()
        .map_err(|e| StoreError::invalid_argument("$regex", e.to_string()))
}

fn operator_matches(
    values: &[&NativeValue],
    op: &str,
    arg: &NativeValue,
    siblings: &Document,
) -> Result<bool, StoreError> {
    match op {
        "$eq" => equals(values, arg),
        "$ne" => Ok(!equals(values, arg)?),
        "$gt" => Ok(compares(values, arg, |o| o == Ordering::Greater)),
        "$gte" => Ok(compares(values, arg, |o| o != Ordering::Less)),
        "$lt" => Ok(compares(values, arg, |o| o == Ordering::Less)),
        "$lte" => Ok(compares(values, arg, |o| o != Ordering::Greater)),
        "$in" | "$nin" => {
            let options = arg
                .as_array()
                .ok_or_else(|| StoreError::invalid_argument(op, "expected an array"))?;
            let mut found = false;
            for option in options {
                if equals(values, option)? {
                    found = true;
                    break;
                }
            }
            Ok(if op == "$in" { found } else { !found })
        }
        "$exists" => Ok(arg.is_truthy() != values.is_empty()),
        "$regex" => {
            let (pattern, inline) = match arg {
                NativeValue::String(p) => (p.clone(), String::new()),
                NativeValue::Regex { pattern, options } => (pattern.clone(), options.clone()),
                _ => return Err(StoreError::invalid_argument(op, "expected a pattern")),
            };
            let options = match siblings.get("$options") {
                Some(NativeValue::String(o)) => o.clone(),
                _ => inline,
            };
            let regex = compile_regex(&pattern, &options)?;
            Ok(expanded(values)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| regex.is_match(s))))
        }
        "$options" => Ok(true),
        "$not" => Ok(!field_matches(values, arg)?),
        "$size" => {
            let size = arg
                .as_i64()
                .ok_or_else(|| StoreError::invalid_argument(op, "expected a number"))?;
            Ok(values
                .iter()
                .any(|v| matches!(v, NativeValue::Array(items) if items.len() as i64 == size)))
        }
        "$all" => {
            let required = arg
                .as_array()
                .ok_or_else(|| StoreError::invalid_argument(op, "expected an array"))?;
            if required.is_empty() {
                return Ok(false);
            }
            for item in required {
                if !equals(values, item)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        "$elemMatch" => {
            let query = arg
                .as_document()
                .ok_or_else(|| StoreError::invalid_argument(op, "expected a document"))?;
            let operator_form = is_operator_document(arg).is_some();
            for value in values {
                let NativeValue::Array(items) = value else { continue };
                for item in items {
                    let hit = match item {
                        NativeValue::Document(d) if !operator_form => matches_filter(query, d, &Vars::new())?,
                        other => operator_form && field_matches(&[other], arg)?,
                    };
                    if hit {
                        return Ok(true);
                    }
                }
            }
            Ok(false)
        }
        "$type" => {
            for value in expanded(values) {
                if type_matches(value, arg)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        _ => Err(StoreError::UnknownOperator { op: op.to_string() }),
    }
}
