//! Aggregation expression evaluation

use super::matcher::compile_regex;
use super::StoreError;
use crate::native::{compare, Document, NativeValue};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Variables visible to `$$name` references
pub type Vars = HashMap<String, NativeValue>;

/// Evaluate an aggregation expression against a document
///
/// Field paths (`"$a.b"`) and variables (`"$$name"`) resolve against the
/// document and `vars`; a missing field evaluates to `Undefined`.
pub fn evaluate_expression(
    expr: &NativeValue,
    doc: &Document,
    vars: &Vars,
) -> Result<NativeValue, StoreError> {
    match expr {
        NativeValue::String(s) if s.starts_with("$$") => Ok(variable(&s[2..], doc, vars)),
        NativeValue::String(s) if s.starts_with('$') && s.len() > 1 => Ok(field_value(doc, &s[1..])),
        NativeValue::Document(spec) => {
            let mut entries = spec.iter();
            if let (Some((op, arg)), None) = (entries.next(), entries.next()) {
                if op.starts_with('$') {
                    return operator(op, arg, doc, vars);
                }
            }
            let mut out = Document::with_capacity(spec.len());
            for (key, value) in spec.iter() {
                let value = evaluate_expression(value, doc, vars)?;
                if !matches!(value, NativeValue::Undefined) {
                    out.insert(key, value);
                }
            }
            Ok(NativeValue::Document(out))
        }
        NativeValue::Array(items) => items
            .iter()
            .map(|item| evaluate_expression(item, doc, vars).map(missing_to_null))
            .collect::<Result<Vec<_>, _>>()
            .map(NativeValue::Array),
        other => Ok(other.clone()),
    }
}

/// Resolve a dotted path; arrays of documents map the rest of the path
pub(crate) fn field_value(doc: &Document, path: &str) -> NativeValue {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    match (doc.get(head), rest) {
        (None, _) => NativeValue::Undefined,
        (Some(value), None) => value.clone(),
        (Some(NativeValue::Document(inner)), Some(rest)) => field_value(inner, rest),
        (Some(NativeValue::Array(items)), Some(rest)) => NativeValue::Array(
            items
                .iter()
                .filter_map(|item| match item {
                    NativeValue::Document(d) => {
                        Some(field_value(d, rest)).filter(|v| !matches!(v, NativeValue::Undefined))
                    }
                    _ => None,
                })
                .collect(),
        ),
        _ => NativeValue::Undefined,
    }
}

fn variable(reference: &str, doc: &Document, vars: &Vars) -> NativeValue {
    let (name, path) = match reference.split_once('.') {
        Some((name, path)) => (name, Some(path)),
        None => (reference, None),
    };
    let root = match name {
        "ROOT" | "CURRENT" => NativeValue::Document(doc.clone()),
        "REMOVE" => return NativeValue::Undefined,
        _ => match vars.get(name) {
            Some(value) => value.clone(),
            None => return NativeValue::Undefined,
        },
    };
    match (path, &root) {
        (None, _) => root,
        (Some(path), NativeValue::Document(d)) => field_value(d, path),
        _ => NativeValue::Undefined,
    }
}

/// Expression comparison; a missing value sorts below null
fn compare_operands(a: &NativeValue, b: &NativeValue) -> Ordering {
    match (a, b) {
        (NativeValue::Undefined, NativeValue::Undefined) => Ordering::Equal,
        (NativeValue::Undefined, _) => Ordering::Less,
        (_, NativeValue::Undefined) => Ordering::Greater,
        _ => compare(a, b),
    }
}

pub(crate) fn missing_to_null(value: NativeValue) -> NativeValue {
    match value {
        NativeValue::Undefined => NativeValue::Null,
        other => other,
    }
}

fn operator(op: &str, arg: &NativeValue, doc: &Document, vars: &Vars) -> Result<NativeValue, StoreError> {
    if op == "$literal" {
        return Ok(arg.clone());
    }
    if op == "$cond" {
        if let NativeValue::Document(branches) = arg {
            let pick = |key: &str| {
                branches
                    .get(key)
                    .cloned()
                    .ok_or_else(|| StoreError::invalid_argument(op, format!("missing '{}'", key)))
            };
            let test = evaluate_expression(&pick("if")?, doc, vars)?;
            let branch = if test.is_truthy() { pick("then")? } else { pick("else")? };
            return evaluate_expression(&branch, doc, vars);
        }
    }

    if op == "$regexMatch" {
        let spec = arg
            .as_document()
            .ok_or_else(|| StoreError::invalid_argument(op, "expected {input, regex, options}"))?;
        let field = |key: &str| -> Result<NativeValue, StoreError> {
            match spec.get(key) {
                Some(expr) => evaluate_expression(expr, doc, vars),
                None => Ok(NativeValue::Null),
            }
        };
        let (pattern, mut options) = match field("regex")? {
            NativeValue::String(pattern) => (pattern, String::new()),
            NativeValue::Regex { pattern, options } => (pattern, options),
            other => return Err(StoreError::invalid_argument(op, format!("'regex' must be a string, got {}", other.kind()))),
        };
        if let NativeValue::String(extra) = field("options")? {
            options.push_str(&extra);
        }
        return Ok(NativeValue::Bool(match field("input")? {
            NativeValue::String(input) => compile_regex(&pattern, &options)?.is_match(&input),
            _ => false,
        }));
    }

    let args = match arg {
        NativeValue::Array(items) => items
            .iter()
            .map(|item| evaluate_expression(item, doc, vars))
            .collect::<Result<Vec<_>, _>>()?,
        other => vec![evaluate_expression(other, doc, vars)?],
    };

    match op {
        "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" | "$cmp" => {
            let (a, b) = pair(op, args)?;
            let ordering = compare_operands(&a, &b);
            Ok(match op {
                "$eq" => NativeValue::Bool(ordering == Ordering::Equal),
                "$ne" => NativeValue::Bool(ordering != Ordering::Equal),
                "$gt" => NativeValue::Bool(ordering == Ordering::Greater),
                "$gte" => NativeValue::Bool(ordering != Ordering::Less),
                "$lt" => NativeValue::Bool(ordering == Ordering::Less),
                "$lte" => NativeValue::Bool(ordering != Ordering::Greater),
                _ => NativeValue::Int32(ordering as i32),
            })
        }
        "$and" => Ok(NativeValue::Bool(args.iter().all(NativeValue::is_truthy))),
        "$or" => Ok(NativeValue::Bool(args.iter().any(NativeValue::is_truthy))),
        "$not" => Ok(NativeValue::Bool(!single(op, args)?.is_truthy())),
        "$add" => {
            let mut total = NativeValue::Int32(0);
            for value in args {
                total = match (&total, &value) {
                    (NativeValue::DateTime(ms), n) | (n, NativeValue::DateTime(ms)) if n.is_numeric() => {
                        NativeValue::DateTime(ms + n.as_f64().unwrap_or_default() as i64)
                    }
                    _ => arithmetic(Arith::Add, &total, &value)?,
                };
            }
            Ok(total)
        }
        "$multiply" => args
            .iter()
            .try_fold(NativeValue::Int32(1), |acc, value| arithmetic(Arith::Mul, &acc, value)),
        "$subtract" => {
            let (a, b) = pair(op, args)?;
            match (&a, &b) {
                (NativeValue::DateTime(x), NativeValue::DateTime(y)) => Ok(NativeValue::Int64(x - y)),
                (NativeValue::DateTime(x), n) if n.is_numeric() => {
                    Ok(NativeValue::DateTime(x - n.as_f64().unwrap_or_default() as i64))
                }
                _ => arithmetic(Arith::Sub, &a, &b),
            }
        }
        "$divide" => {
            let (a, b) = pair(op, args)?;
            arithmetic(Arith::Div, &a, &b)
        }
        "$mod" => {
            let (a, b) = pair(op, args)?;
            arithmetic(Arith::Mod, &a, &b)
        }
        "$abs" => match missing_to_null(single(op, args)?) {
            NativeValue::Null => Ok(NativeValue::Null),
            NativeValue::Int32(i) => Ok(i
                .checked_abs()
                .map(NativeValue::Int32)
                .unwrap_or(NativeValue::Int64(i64::from(i).abs()))),
            NativeValue::Int64(i) => Ok(NativeValue::Int64(i.saturating_abs())),
            NativeValue::Double(f) => Ok(NativeValue::Double(f.abs())),
            NativeValue::Decimal128(d) => Ok(NativeValue::Decimal128(d.abs())),
            other => Err(StoreError::invalid_argument(op, format!("expected a number, got {}", other.kind()))),
        },
        "$concat" => {
            let mut out = String::new();
            for value in args {
                match value {
                    NativeValue::String(s) => out.push_str(&s),
                    v if v.is_null() => return Ok(NativeValue::Null),
                    v => {
                        return Err(StoreError::invalid_argument(
                            op,
                            format!("expected strings, got {}", v.kind()),
                        ))
                    }
                }
            }
            Ok(NativeValue::String(out))
        }
        "$toUpper" | "$toLower" => {
            let text = match single(op, args)? {
                v if v.is_null() => String::new(),
                NativeValue::String(s) => s,
                other => display_string(&other),
            };
            Ok(NativeValue::String(if op == "$toUpper" {
                text.to_uppercase()
            } else {
                text.to_lowercase()
            }))
        }
        "$toString" => match single(op, args)? {
            v if v.is_null() => Ok(NativeValue::Null),
            NativeValue::String(s) => Ok(NativeValue::String(s)),
            other => Ok(NativeValue::String(display_string(&other))),
        },
        "$strLenCP" => match single(op, args)? {
            NativeValue::String(s) => Ok(length(s.chars().count())),
            other => Err(StoreError::invalid_argument(op, format!("expected a string, got {}", other.kind()))),
        },
        "$size" => match single(op, args)? {
            NativeValue::Array(items) => Ok(length(items.len())),
            other => Err(StoreError::invalid_argument(op, format!("expected an array, got {}", other.kind()))),
        },
        "$ifNull" => {
            let fallback = args.last().cloned().unwrap_or(NativeValue::Null);
            let count = args.len().saturating_sub(1);
            Ok(args
                .into_iter()
                .take(count)
                .find(|v| !v.is_null())
                .unwrap_or(fallback))
        }
        "$cond" => {
            let mut args = args.into_iter();
            match (args.next(), args.next(), args.next()) {
                (Some(test), Some(then), Some(otherwise)) => {
                    Ok(if test.is_truthy() { then } else { otherwise })
                }
                _ => Err(StoreError::invalid_argument(op, "expected [if, then, else]")),
            }
        }
        "$in" => {
            let (needle, haystack) = pair(op, args)?;
            match haystack {
                NativeValue::Array(items) => Ok(NativeValue::Bool(
                    items.iter().any(|item| compare(item, &needle) == Ordering::Equal),
                )),
                other => Err(StoreError::invalid_argument(op, format!("expected an array, got {}", other.kind()))),
            }
        }
        _ => Err(StoreError::UnknownOperator { op: op.to_string() }),
    }
}

fn pair(op: &str, args: Vec<NativeValue>) -> Result<(NativeValue, NativeValue), StoreError> {
    let mut args = args.into_iter();
    match (args.next(), args.next(), args.next()) {
        (Some(a), Some(b), None) => Ok((a, b)),
        _ => Err(StoreError::invalid_argument(op, "expected exactly 2 arguments")),
    }
}

fn single(op: &str, args: Vec<NativeValue>) -> Result<NativeValue, StoreError> {
    let mut args = args.into_iter();
    match (args.next(), args.next()) {
        (Some(a), None) => Ok(a),
        _ => Err(StoreError::invalid_argument(op, "expected exactly 1 argument")),
    }
}

pub(crate) fn length(len: usize) -> NativeValue {
    i32::try_from(len)
        .map(NativeValue::Int32)
        .unwrap_or(NativeValue::Int64(len as i64))
}

fn display_string(value: &NativeValue) -> String {
    match value {
        NativeValue::String(s) => s.clone(),
        NativeValue::Int64(i) => i.to_string(),
        NativeValue::Double(f) => f.to_string(),
        NativeValue::Decimal128(d) => d.to_string(),
        NativeValue::DateTime(ms) => crate::native::format_millis(*ms),
        NativeValue::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

// ============================================================================
// Numeric arithmetic
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl Arith {
    fn name(self) -> &'static str {
        match self {
            Arith::Add => "$add",
            Arith::Sub => "$subtract",
            Arith::Mul => "$multiply",
            Arith::Div => "$divide",
            Arith::Mod => "$mod",
        }
    }
}

fn to_decimal(value: &NativeValue) -> Option<Decimal> {
    match value {
        NativeValue::Int32(i) => Some(Decimal::from(*i)),
        NativeValue::Int64(i) => Some(Decimal::from(*i)),
        NativeValue::Double(f) => Decimal::from_f64(*f),
        NativeValue::Decimal128(d) => Some(*d),
        _ => None,
    }
}

/// Numeric arithmetic with the store's result kinds
///
/// Null or missing operands give null. Integer results stay 32-bit while
/// both operands are 32-bit and the value fits; division yields a double.
pub(crate) fn arithmetic(op: Arith, a: &NativeValue, b: &NativeValue) -> Result<NativeValue, StoreError> {
    if a.is_null() || b.is_null() {
        return Ok(NativeValue::Null);
    }
    if !a.is_numeric() || !b.is_numeric() {
        return Err(StoreError::invalid_argument(
            op.name(),
            format!("only numbers are supported, got {} and {}", a.kind(), b.kind()),
        ));
    }

    let divides = matches!(op, Arith::Div | Arith::Mod);
    if divides && a.is_numeric() && b.as_f64() == Some(0.0) {
        return Err(StoreError::invalid_argument(op.name(), "can't divide by zero"));
    }

    if matches!(a, NativeValue::Decimal128(_)) || matches!(b, NativeValue::Decimal128(_)) {
        let (Some(x), Some(y)) = (to_decimal(a), to_decimal(b)) else {
            return Err(StoreError::invalid_argument(op.name(), "value out of decimal range"));
        };
        let result = match op {
            Arith::Add => x.checked_add(y),
            Arith::Sub => x.checked_sub(y),
            Arith::Mul => x.checked_mul(y),
            Arith::Div => x.checked_div(y),
            Arith::Mod => x.checked_rem(y),
        };
        return result
            .map(NativeValue::Decimal128)
            .ok_or_else(|| StoreError::invalid_argument(op.name(), "decimal overflow"));
    }

    let integral = |v: &NativeValue| match v {
        NativeValue::Int32(i) => Some(i64::from(*i)),
        NativeValue::Int64(i) => Some(*i),
        _ => None,
    };
    if let (Some(x), Some(y), false) = (integral(a), integral(b), op == Arith::Div) {
        let narrow = matches!(a, NativeValue::Int32(_)) && matches!(b, NativeValue::Int32(_));
        let result = match op {
            Arith::Add => x.checked_add(y),
            Arith::Sub => x.checked_sub(y),
            Arith::Mul => x.checked_mul(y),
            _ => x.checked_rem(y),
        };
        if let Some(n) = result {
            return Ok(match i32::try_from(n) {
                Ok(small) if narrow => NativeValue::Int32(small),
                _ => NativeValue::Int64(n),
            });
        }
    }

    let (x, y) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
    Ok(NativeValue::Double(match op {
        Arith::Add => x + y,
        Arith::Sub => x - y,
        Arith::Mul => x * y,
        Arith::Div => x / y,
        Arith::Mod => x % y,
    }))
}
