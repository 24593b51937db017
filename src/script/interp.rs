//! Tree-walking evaluator for parsed fragments

use super::ast::*;
use super::{BindingContext, ScriptConfig, ScriptError};
use crate::native::{compare, format_millis, values_equal, Document, NativeValue, ObjectId};
use base64::Engine as _;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::hash::{BuildHasher, Hasher};
use std::str::FromStr;
use std::time::Instant;

/// Steps between wall-clock checks
const CHECK_INTERVAL: u64 = 1024;

enum Flow {
    Normal,
    Break,
    Continue,
}

enum Key {
    Field(String),
    Index(usize),
}

pub struct Interpreter<'a> {
    scopes: Vec<HashMap<String, NativeValue>>,
    bindings: &'a BindingContext,
    config: &'a ScriptConfig,
    started: Instant,
    steps: u64,
    completion: NativeValue,
}

impl<'a> Interpreter<'a> {
    pub fn new(bindings: &'a BindingContext, config: &'a ScriptConfig, started: Instant) -> Self {
        Self {
            scopes: vec![HashMap::new()],
            bindings,
            config,
            started,
            steps: 0,
            completion: NativeValue::Undefined,
        }
    }

    /// Run a program; the value of the last expression statement is the result
    pub fn run(mut self, program: &Program) -> Result<NativeValue, ScriptError> {
        for stmt in &program.body {
            if !matches!(self.exec(stmt)?, Flow::Normal) {
                return Err(ScriptError::Syntax {
                    position: 0,
                    message: "break or continue outside of a loop".into(),
                });
            }
        }
        Ok(self.completion)
    }

    fn tick(&mut self) -> Result<(), ScriptError> {
        self.steps += 1;
        if self.steps % CHECK_INTERVAL == 0 && self.started.elapsed() >= self.config.timeout() {
            return Err(ScriptError::Timeout { ms: self.config.timeout_ms });
        }
        Ok(())
    }

    fn checked(&self, value: NativeValue) -> Result<NativeValue, ScriptError> {
        measure(&value, self.config)?;
        Ok(value)
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn exec(&mut self, stmt: &Stmt) -> Result<Flow, ScriptError> {
        match stmt {
            Stmt::Expr(expr) => {
                self.completion = self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Declare(decls) => {
                for (name, init) in decls {
                    let value = match init {
                        Some(expr) => self.eval(expr)?,
                        None => NativeValue::Undefined,
                    };
                    if let Some(scope) = self.scopes.last_mut() {
                        scope.insert(name.clone(), value);
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::If { test, then, otherwise } => {
                if js_truthy(&self.eval(test)?) {
                    self.exec(then)
                } else if let Some(otherwise) = otherwise {
                    self.exec(otherwise)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { test, body } => {
                loop {
                    self.tick()?;
                    if !js_truthy(&self.eval(test)?) {
                        break;
                    }
                    if let Flow::Break = self.exec(body)? {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For { init, test, update, body } => {
                self.scopes.push(HashMap::new());
                let result = self.exec_for(init.as_deref(), test.as_ref(), update.as_ref(), body);
                self.scopes.pop();
                result
            }
            Stmt::Block(body) => {
                self.scopes.push(HashMap::new());
                let result = self.exec_block(body);
                self.scopes.pop();
                result
            }
            Stmt::Break => Ok(Flow::Break),
            Stmt::Continue => Ok(Flow::Continue),
            Stmt::Empty => Ok(Flow::Normal),
        }
    }

    fn exec_block(&mut self, body: &[Stmt]) -> Result<Flow, ScriptError> {
        for stmt in body {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_for(
        &mut self,
        init: Option<&Stmt>,
        test: Option<&Expr>,
        update: Option<&Expr>,
        body: &Stmt,
    ) -> Result<Flow, ScriptError> {
        if let Some(init) = init {
            self.exec(init)?;
        }
        loop {
            self.tick()?;
            if let Some(test) = test {
                if !js_truthy(&self.eval(test)?) {
                    break;
                }
            }
            if let Flow::Break = self.exec(body)? {
                break;
            }
            if let Some(update) = update {
                self.eval(update)?;
            }
        }
        Ok(Flow::Normal)
    }

    // ========================================================================
    // Variables and placeholders
    // ========================================================================

    fn lookup(&self, name: &str) -> Option<&NativeValue> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    /// Slot of an existing variable, or a new global
    fn variable_mut(&mut self, name: &str) -> &mut NativeValue {
        let index = self
            .scopes
            .iter()
            .rposition(|scope| scope.contains_key(name))
            .unwrap_or(0);
        self.scopes[index]
            .entry(name.to_string())
            .or_insert(NativeValue::Undefined)
    }

    fn resolve(&self, name: &str) -> Result<NativeValue, ScriptError> {
        if let Some(value) = self.lookup(name) {
            return Ok(value.clone());
        }
        match name {
            "MinKey" => Ok(NativeValue::MinKey),
            "MaxKey" => Ok(NativeValue::MaxKey),
            _ => Err(ScriptError::Reference(format!("{} is not defined", name))),
        }
    }

    fn bind(&self, placeholder: &Placeholder) -> Result<NativeValue, ScriptError> {
        match placeholder {
            Placeholder::Named(name) => self
                .bindings
                .named
                .get(name)
                .cloned()
                .ok_or_else(|| ScriptError::UnboundParameter(format!(":{}", name))),
            Placeholder::Positional(index) => index
                .checked_sub(1)
                .and_then(|i| self.bindings.positional.get(i))
                .cloned()
                .ok_or_else(|| ScriptError::UnboundParameter(format!("?{}", index))),
        }
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    fn eval(&mut self, expr: &Expr) -> Result<NativeValue, ScriptError> {
        self.tick()?;
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => self.resolve(name),
            Expr::Param(placeholder) => self.bind(placeholder),
            Expr::Object(entries) => {
                let mut doc = Document::with_capacity(entries.len());
                for (key, value) in entries {
                    let value = self.eval(value)?;
                    doc.insert(key.clone(), value);
                }
                self.checked(NativeValue::Document(doc))
            }
            Expr::Array(items) => {
                let values = self.eval_all(items)?;
                self.checked(NativeValue::Array(values))
            }
            Expr::Regex { pattern, flags } => Ok(make_regex(pattern, flags)),
            Expr::Member { object, property } => {
                let value = self.eval(object)?;
                member(&value, property)
            }
            Expr::Index { object, index } => {
                let value = self.eval(object)?;
                let key = self.eval(index)?;
                match key_of(&key) {
                    Key::Field(name) => member(&value, &name),
                    Key::Index(i) => element(&value, i),
                }
            }
            Expr::Call { callee, args } => {
                let args = self.eval_all(args)?;
                let value = call_builtin(callee, args)?;
                self.checked(value)
            }
            Expr::MethodCall { object, method, args } => self.method_call(object, method, args),
            Expr::Unary { op, expr } => {
                let value = self.eval(expr)?;
                Ok(unary(*op, &value))
            }
            Expr::Binary { op, left, right } => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                let value = binary(*op, &left, &right)?;
                self.checked(value)
            }
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if js_truthy(&left) {
                    self.eval(right)
                } else {
                    Ok(left)
                }
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if js_truthy(&left) {
                    Ok(left)
                } else {
                    self.eval(right)
                }
            }
            Expr::Conditional { test, then, otherwise } => {
                if js_truthy(&self.eval(test)?) {
                    self.eval(then)
                } else {
                    self.eval(otherwise)
                }
            }
            Expr::Assign { target, op, value } => {
                let value = self.eval(value)?;
                let value = match op {
                    AssignOp::Set => value,
                    AssignOp::Add => binary(BinOp::Add, &self.eval(target)?, &value)?,
                    AssignOp::Sub => binary(BinOp::Sub, &self.eval(target)?, &value)?,
                    AssignOp::Mul => binary(BinOp::Mul, &self.eval(target)?, &value)?,
                    AssignOp::Div => binary(BinOp::Div, &self.eval(target)?, &value)?,
                };
                let value = self.checked(value)?;
                self.assign(target, value.clone())?;
                Ok(value)
            }
            Expr::Update { target, delta, prefix } => {
                let current = to_number(&self.eval(target)?);
                let next = binary(BinOp::Add, &current, &NativeValue::Int32(i32::from(*delta)))?;
                self.assign(target, next.clone())?;
                Ok(if *prefix { next } else { current })
            }
        }
    }

    fn eval_all(&mut self, exprs: &[Expr]) -> Result<Vec<NativeValue>, ScriptError> {
        exprs.iter().map(|expr| self.eval(expr)).collect()
    }

    fn assign(&mut self, target: &Expr, value: NativeValue) -> Result<(), ScriptError> {
        let mut keys = Vec::new();
        let mut node = target;
        let root = loop {
            match node {
                Expr::Ident(name) => break name,
                Expr::Member { object, property } => {
                    keys.push(Key::Field(property.clone()));
                    node = object;
                }
                Expr::Index { object, index } => {
                    let key = self.eval(index)?;
                    keys.push(key_of(&key));
                    node = object;
                }
                _ => return Err(ScriptError::Type("invalid assignment target".into())),
            }
        };
        keys.reverse();

        let limit = self.config.max_value_len;
        let nested = !keys.is_empty();
        let mut slot = self.variable_mut(root);
        for key in keys {
            slot = child_slot(slot, key, limit)?;
        }
        *slot = value;

        if nested {
            if let Some(root_value) = self.lookup(root) {
                measure(root_value, self.config)?;
            }
        }
        Ok(())
    }

    fn method_call(
        &mut self,
        object: &Expr,
        method: &str,
        args: &[Expr],
    ) -> Result<NativeValue, ScriptError> {
        if let Expr::Ident(name) = object {
            if name == "Math" && self.lookup(name).is_none() {
                let args = self.eval_all(args)?;
                return math(method, &args);
            }
        }

        let target = self.eval(object)?;
        let args = self.eval_all(args)?;

        if method == "push" {
            let NativeValue::Array(mut items) = target else {
                return Err(no_method(&target, method));
            };
            items.extend(args);
            let length = length_value(items.len());
            let array = self.checked(NativeValue::Array(items))?;
            if object.is_target() {
                self.assign(object, array)?;
            }
            return Ok(length);
        }

        let value = call_method(&target, method, &args)?;
        self.checked(value)
    }
}

// ============================================================================
// Limits
// ============================================================================

/// Check nesting depth and total size of a value
fn measure(value: &NativeValue, config: &ScriptConfig) -> Result<(), ScriptError> {
    let mut budget = config.max_value_len;
    weigh(value, 0, config, &mut budget)
}

fn weigh(
    value: &NativeValue,
    depth: usize,
    config: &ScriptConfig,
    budget: &mut usize,
) -> Result<(), ScriptError> {
    let cost = match value {
        NativeValue::String(s) => s.len().max(1),
        NativeValue::Binary { bytes, .. } => bytes.len().max(1),
        _ => 1,
    };
    if cost > *budget {
        return Err(ScriptError::SizeExceeded { limit: config.max_value_len });
    }
    *budget -= cost;

    let nested = match value {
        NativeValue::Document(doc) => doc.iter().map(|(_, v)| v).collect::<Vec<_>>(),
        NativeValue::Array(items) => items.iter().collect(),
        _ => return Ok(()),
    };
    if depth >= config.max_depth {
        return Err(ScriptError::DepthExceeded { limit: config.max_depth });
    }
    for child in nested {
        weigh(child, depth + 1, config, budget)?;
    }
    Ok(())
}

// ============================================================================
// Values
// ============================================================================

fn js_truthy(value: &NativeValue) -> bool {
    match value {
        NativeValue::Double(f) => *f != 0.0 && !f.is_nan(),
        NativeValue::String(s) => !s.is_empty(),
        other => other.is_truthy(),
    }
}

fn js_string(value: &NativeValue) -> String {
    match value {
        NativeValue::Null => "null".into(),
        NativeValue::Undefined => "undefined".into(),
        NativeValue::Bool(b) => b.to_string(),
        NativeValue::Int32(i) => i.to_string(),
        NativeValue::Int64(i) => i.to_string(),
        NativeValue::Double(f) if f.is_nan() => "NaN".into(),
        NativeValue::Double(f) if f.is_infinite() => {
            if *f > 0.0 { "Infinity".into() } else { "-Infinity".into() }
        }
        NativeValue::Double(f) => f.to_string(),
        NativeValue::Decimal128(d) => d.to_string(),
        NativeValue::String(s) => s.clone(),
        NativeValue::DateTime(ms) => format_millis(*ms),
        NativeValue::ObjectId(oid) => oid.to_hex(),
        NativeValue::Array(items) => items
            .iter()
            .map(|item| if item.is_null() { String::new() } else { js_string(item) })
            .collect::<Vec<_>>()
            .join(","),
        NativeValue::Document(_) => "[object Object]".into(),
        other => other.to_string(),
    }
}

fn length_value(len: usize) -> NativeValue {
    i32::try_from(len)
        .map(NativeValue::Int32)
        .unwrap_or(NativeValue::Int64(len as i64))
}

fn integer(n: i64, narrow: bool) -> NativeValue {
    match i32::try_from(n) {
        Ok(small) if narrow => NativeValue::Int32(small),
        _ => NativeValue::Int64(n),
    }
}

fn to_number(value: &NativeValue) -> NativeValue {
    match value {
        NativeValue::Int32(_)
        | NativeValue::Int64(_)
        | NativeValue::Double(_)
        | NativeValue::Decimal128(_) => value.clone(),
        NativeValue::Bool(b) => NativeValue::Int32(i32::from(*b)),
        NativeValue::Null => NativeValue::Int32(0),
        NativeValue::DateTime(ms) => NativeValue::Int64(*ms),
        NativeValue::String(s) => parse_number(s),
        _ => NativeValue::Double(f64::NAN),
    }
}

fn parse_number(text: &str) -> NativeValue {
    let text = text.trim();
    if text.is_empty() {
        return NativeValue::Int32(0);
    }
    if let Ok(i) = text.parse::<i64>() {
        return integer(i, true);
    }
    match text {
        "Infinity" | "+Infinity" => NativeValue::Double(f64::INFINITY),
        "-Infinity" => NativeValue::Double(f64::NEG_INFINITY),
        _ => NativeValue::Double(text.parse().unwrap_or(f64::NAN)),
    }
}

fn make_regex(pattern: &str, flags: &str) -> NativeValue {
    let mut options: Vec<char> = flags.chars().filter(|c| *c != 'g').collect();
    options.sort_unstable();
    options.dedup();
    NativeValue::Regex {
        pattern: pattern.to_string(),
        options: options.into_iter().collect(),
    }
}

fn key_of(value: &NativeValue) -> Key {
    match value.as_i64() {
        Some(i) if value.is_numeric() && i >= 0 => Key::Index(i as usize),
        _ => Key::Field(js_string(value)),
    }
}

fn member(value: &NativeValue, property: &str) -> Result<NativeValue, ScriptError> {
    match (value, property) {
        (NativeValue::Null | NativeValue::Undefined, _) => Err(ScriptError::Type(format!(
            "cannot read property '{}' of {}",
            property,
            js_string(value)
        ))),
        (NativeValue::Document(doc), _) => {
            Ok(doc.get(property).cloned().unwrap_or(NativeValue::Undefined))
        }
        (NativeValue::Array(items), "length") => Ok(length_value(items.len())),
        (NativeValue::String(s), "length") => Ok(length_value(s.chars().count())),
        (NativeValue::ObjectId(oid), "str") => Ok(NativeValue::String(oid.to_hex())),
        (NativeValue::Regex { pattern, .. }, "source") => Ok(NativeValue::String(pattern.clone())),
        _ => Ok(NativeValue::Undefined),
    }
}

fn element(value: &NativeValue, index: usize) -> Result<NativeValue, ScriptError> {
    match value {
        NativeValue::Array(items) => Ok(items.get(index).cloned().unwrap_or(NativeValue::Undefined)),
        NativeValue::String(s) => Ok(s
            .chars()
            .nth(index)
            .map(|c| NativeValue::String(c.to_string()))
            .unwrap_or(NativeValue::Undefined)),
        other => member(other, &index.to_string()),
    }
}

fn child_slot(slot: &mut NativeValue, key: Key, limit: usize) -> Result<&mut NativeValue, ScriptError> {
    match (slot, key) {
        (NativeValue::Document(doc), key) => {
            let name = match key {
                Key::Field(name) => name,
                Key::Index(i) => i.to_string(),
            };
            if !doc.contains_key(&name) {
                doc.insert(name.clone(), NativeValue::Undefined);
            }
            doc.get_mut(&name)
                .ok_or_else(|| ScriptError::Type(format!("cannot set property '{}'", name)))
        }
        (NativeValue::Array(items), Key::Index(i)) => {
            if i >= limit {
                return Err(ScriptError::SizeExceeded { limit });
            }
            if i >= items.len() {
                items.resize(i + 1, NativeValue::Undefined);
            }
            Ok(&mut items[i])
        }
        (other, key) => {
            let name = match key {
                Key::Field(name) => name,
                Key::Index(i) => i.to_string(),
            };
            Err(ScriptError::Type(format!(
                "cannot set property '{}' of {}",
                name,
                other.kind()
            )))
        }
    }
}

// ============================================================================
// Operators
// ============================================================================

fn unary(op: UnaryOp, value: &NativeValue) -> NativeValue {
    match op {
        UnaryOp::Not => NativeValue::Bool(!js_truthy(value)),
        UnaryOp::Plus => to_number(value),
        UnaryOp::Neg => match to_number(value) {
            NativeValue::Int32(i) => i
                .checked_neg()
                .map(NativeValue::Int32)
                .unwrap_or(NativeValue::Int64(-i64::from(i))),
            NativeValue::Int64(i) => i
                .checked_neg()
                .map(NativeValue::Int64)
                .unwrap_or(NativeValue::Double(-(i as f64))),
            NativeValue::Double(f) => NativeValue::Double(-f),
            NativeValue::Decimal128(d) => NativeValue::Decimal128(-d),
            _ => NativeValue::Double(f64::NAN),
        },
    }
}

enum Num {
    Int(i64),
    Double(f64),
    Decimal(Decimal),
}

impl Num {
    fn of(value: &NativeValue) -> Self {
        match value {
            NativeValue::Int32(i) => Num::Int(i64::from(*i)),
            NativeValue::Int64(i) => Num::Int(*i),
            NativeValue::Double(f) => Num::Double(*f),
            NativeValue::Decimal128(d) => Num::Decimal(*d),
            _ => Num::Double(f64::NAN),
        }
    }

    fn to_decimal(&self) -> Option<Decimal> {
        match self {
            Num::Int(i) => Some(Decimal::from(*i)),
            Num::Double(f) => Decimal::from_f64(*f),
            Num::Decimal(d) => Some(*d),
        }
    }

    fn to_f64(&self) -> f64 {
        match self {
            Num::Int(i) => *i as f64,
            Num::Double(f) => *f,
            Num::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        }
    }
}

fn binary(op: BinOp, left: &NativeValue, right: &NativeValue) -> Result<NativeValue, ScriptError> {
    let is_string = |v: &NativeValue| matches!(v, NativeValue::String(_));
    match op {
        BinOp::Add if is_string(left) || is_string(right) => {
            Ok(NativeValue::String(js_string(left) + &js_string(right)))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Mod => {
            arithmetic(op, &to_number(left), &to_number(right))
        }
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => Ok(NativeValue::Bool(relational(op, left, right))),
        BinOp::LooseEq => Ok(NativeValue::Bool(loose_eq(left, right))),
        BinOp::LooseNe => Ok(NativeValue::Bool(!loose_eq(left, right))),
        BinOp::StrictEq => Ok(NativeValue::Bool(strict_eq(left, right))),
        BinOp::StrictNe => Ok(NativeValue::Bool(!strict_eq(left, right))),
    }
}

/// Integers stay integral while exact; decimals win over doubles
fn arithmetic(op: BinOp, left: &NativeValue, right: &NativeValue) -> Result<NativeValue, ScriptError> {
    let narrow = !matches!(left, NativeValue::Int64(_)) && !matches!(right, NativeValue::Int64(_));
    let (x, y) = (Num::of(left), Num::of(right));

    if matches!(x, Num::Decimal(_)) || matches!(y, Num::Decimal(_)) {
        let (Some(a), Some(b)) = (x.to_decimal(), y.to_decimal()) else {
            return Ok(NativeValue::Double(f64::NAN));
        };
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div => a.checked_div(b),
            _ => a.checked_rem(b),
        };
        return result
            .map(NativeValue::Decimal128)
            .ok_or_else(|| ScriptError::Type("decimal overflow or division by zero".into()));
    }

    if let (Num::Int(a), Num::Int(b)) = (&x, &y) {
        let (a, b) = (*a, *b);
        let result = match op {
            BinOp::Add => a.checked_add(b),
            BinOp::Sub => a.checked_sub(b),
            BinOp::Mul => a.checked_mul(b),
            BinOp::Div if a.checked_rem(b) == Some(0) => a.checked_div(b),
            BinOp::Div => None,
            _ => a.checked_rem(b),
        };
        if let Some(n) = result {
            return Ok(integer(n, narrow));
        }
    }

    let (a, b) = (x.to_f64(), y.to_f64());
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => a % b,
    };
    Ok(NativeValue::Double(result))
}

fn relational(op: BinOp, left: &NativeValue, right: &NativeValue) -> bool {
    let ordering = match (left, right) {
        (NativeValue::String(a), NativeValue::String(b)) => Some(a.cmp(b)),
        _ => {
            let a = Num::of(&to_number(left)).to_f64();
            let b = Num::of(&to_number(right)).to_f64();
            a.partial_cmp(&b)
        }
    };
    match (op, ordering) {
        (_, None) => false,
        (BinOp::Lt, Some(o)) => o == Ordering::Less,
        (BinOp::Le, Some(o)) => o != Ordering::Greater,
        (BinOp::Gt, Some(o)) => o == Ordering::Greater,
        (_, Some(o)) => o != Ordering::Less,
    }
}

fn is_nan(value: &NativeValue) -> bool {
    matches!(value, NativeValue::Double(f) if f.is_nan())
}

fn numeric_eq(left: &NativeValue, right: &NativeValue) -> bool {
    !is_nan(left) && !is_nan(right) && compare(left, right) == Ordering::Equal
}

fn loose_eq(left: &NativeValue, right: &NativeValue) -> bool {
    let scalar = |v: &NativeValue| v.is_numeric() || matches!(v, NativeValue::Bool(_));
    match (left, right) {
        (l, r) if l.is_null() || r.is_null() => l.is_null() && r.is_null(),
        (l, r) if scalar(l) && (scalar(r) || matches!(r, NativeValue::String(_))) => {
            numeric_eq(&to_number(l), &to_number(r))
        }
        (NativeValue::String(_), r) if scalar(r) => numeric_eq(&to_number(left), &to_number(r)),
        _ => values_equal(left, right),
    }
}

fn strict_eq(left: &NativeValue, right: &NativeValue) -> bool {
    if left.is_numeric() && right.is_numeric() {
        return numeric_eq(left, right);
    }
    left.kind() == right.kind() && values_equal(left, right)
}

// ============================================================================
// Built-in constructors and methods
// ============================================================================

fn type_error(message: String) -> ScriptError {
    ScriptError::Type(message)
}

fn no_method(target: &NativeValue, method: &str) -> ScriptError {
    type_error(format!("{} has no method '{}'", target.kind(), method))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_date_text(text: &str) -> Option<i64> {
    dsql::parse_timestamp(text).or_else(|| {
        chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc().timestamp_millis())
    })
}

fn integral_arg(callee: &str, value: &NativeValue) -> Result<i64, ScriptError> {
    let number = to_number(value);
    match Num::of(&number) {
        Num::Int(i) => Ok(i),
        Num::Double(f) if f.is_finite() => Ok(f.trunc() as i64),
        Num::Decimal(d) => d
            .trunc()
            .to_i64()
            .ok_or_else(|| type_error(format!("{}: {} is out of range", callee, d))),
        _ => Err(type_error(format!("{}: {} is not a number", callee, js_string(value)))),
    }
}

fn random_uuid() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for chunk in bytes.chunks_mut(8) {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write(&ObjectId::new().bytes());
        chunk.copy_from_slice(&hasher.finish().to_be_bytes());
    }
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    bytes
}

fn call_builtin(callee: &str, args: Vec<NativeValue>) -> Result<NativeValue, ScriptError> {
    let mut args = args.into_iter();
    let first = args.next();
    let second = args.next();

    match callee {
        "ObjectId" => match first {
            None | Some(NativeValue::Undefined) => Ok(NativeValue::ObjectId(ObjectId::new())),
            Some(NativeValue::String(hex)) => ObjectId::parse_str(&hex)
                .map(NativeValue::ObjectId)
                .ok_or_else(|| type_error(format!("invalid ObjectId '{}'", hex))),
            Some(NativeValue::ObjectId(oid)) => Ok(NativeValue::ObjectId(oid)),
            Some(other) => Err(type_error(format!("ObjectId expects a hex string, got {}", other.kind()))),
        },
        "ISODate" | "Date" => match first {
            None | Some(NativeValue::Undefined) => Ok(NativeValue::DateTime(now_millis())),
            Some(NativeValue::String(text)) => parse_date_text(&text)
                .map(NativeValue::DateTime)
                .ok_or_else(|| type_error(format!("invalid date '{}'", text))),
            Some(NativeValue::DateTime(ms)) => Ok(NativeValue::DateTime(ms)),
            Some(other) => integral_arg(callee, &other).map(NativeValue::DateTime),
        },
        "NumberInt" => {
            let value = first.map(|v| integral_arg(callee, &v)).transpose()?.unwrap_or(0);
            i32::try_from(value)
                .map(NativeValue::Int32)
                .map_err(|_| type_error(format!("NumberInt: {} is out of range", value)))
        }
        "NumberLong" => Ok(NativeValue::Int64(
            first.map(|v| integral_arg(callee, &v)).transpose()?.unwrap_or(0),
        )),
        "NumberDecimal" => {
            let decimal = match first {
                None => Some(Decimal::ZERO),
                Some(NativeValue::String(text)) => Decimal::from_str(text.trim())
                    .or_else(|_| Decimal::from_scientific(text.trim()))
                    .ok(),
                Some(NativeValue::Double(f)) => Decimal::from_str(&f.to_string()).ok(),
                Some(other) => Num::of(&to_number(&other)).to_decimal(),
            };
            decimal
                .map(NativeValue::Decimal128)
                .ok_or_else(|| type_error("NumberDecimal: not a decimal value".into()))
        }
        "RegExp" => {
            let flags = second.map(|f| js_string(&f)).unwrap_or_default();
            match first {
                Some(NativeValue::Regex { pattern, options }) if flags.is_empty() => {
                    Ok(make_regex(&pattern, &options))
                }
                Some(NativeValue::Regex { pattern, .. }) => Ok(make_regex(&pattern, &flags)),
                Some(other) => Ok(make_regex(&js_string(&other), &flags)),
                None => Ok(make_regex("(?:)", &flags)),
            }
        }
        "Timestamp" => {
            let time = first.map(|v| integral_arg(callee, &v)).transpose()?.unwrap_or(0);
            let increment = second.map(|v| integral_arg(callee, &v)).transpose()?.unwrap_or(0);
            match (u32::try_from(time), u32::try_from(increment)) {
                (Ok(time), Ok(increment)) => Ok(NativeValue::Timestamp { time, increment }),
                _ => Err(type_error("Timestamp: arguments out of range".into())),
            }
        }
        "BinData" => {
            let subtype = first.map(|v| integral_arg(callee, &v)).transpose()?.unwrap_or(0);
            let subtype = u8::try_from(subtype)
                .map_err(|_| type_error(format!("BinData: invalid subtype {}", subtype)))?;
            let encoded = second.map(|v| js_string(&v)).unwrap_or_default();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| type_error(format!("BinData: {}", e)))?;
            Ok(NativeValue::Binary { subtype, bytes })
        }
        "UUID" => {
            let bytes = match first {
                None => random_uuid().to_vec(),
                Some(value) => {
                    let text = js_string(&value).replace('-', "");
                    hex::decode(&text)
                        .ok()
                        .filter(|b| b.len() == 16)
                        .ok_or_else(|| type_error(format!("invalid UUID '{}'", js_string(&value))))?
                }
            };
            Ok(NativeValue::Binary { subtype: 4, bytes })
        }
        "MinKey" => Ok(NativeValue::MinKey),
        "MaxKey" => Ok(NativeValue::MaxKey),
        "Number" => Ok(first.map(|v| to_number(&v)).unwrap_or(NativeValue::Int32(0))),
        "String" => Ok(NativeValue::String(first.map(|v| js_string(&v)).unwrap_or_default())),
        "Boolean" => Ok(NativeValue::Bool(first.map(|v| js_truthy(&v)).unwrap_or(false))),
        _ => Err(ScriptError::Reference(format!("{} is not defined", callee))),
    }
}

fn math(method: &str, args: &[NativeValue]) -> Result<NativeValue, ScriptError> {
    let arg = |i: usize| args.get(i).map(|v| Num::of(&to_number(v)).to_f64()).unwrap_or(f64::NAN);
    let integral = |f: f64| {
        if f.is_finite() && f.abs() < 2_147_483_648.0 {
            NativeValue::Int32(f as i32)
        } else {
            NativeValue::Double(f)
        }
    };
    match method {
        "floor" => Ok(integral(arg(0).floor())),
        "ceil" => Ok(integral(arg(0).ceil())),
        "round" => Ok(integral((arg(0) + 0.5).floor())),
        "trunc" => Ok(integral(arg(0).trunc())),
        "abs" => Ok(match args.first().map(to_number) {
            Some(NativeValue::Int32(i)) => i.checked_abs().map(NativeValue::Int32).unwrap_or(NativeValue::Int64(i64::from(i).abs())),
            Some(NativeValue::Int64(i)) => i.checked_abs().map(NativeValue::Int64).unwrap_or(NativeValue::Double((i as f64).abs())),
            Some(NativeValue::Decimal128(d)) => NativeValue::Decimal128(d.abs()),
            _ => NativeValue::Double(arg(0).abs()),
        }),
        "pow" => Ok(NativeValue::Double(arg(0).powf(arg(1)))),
        "min" | "max" => {
            let mut best: Option<NativeValue> = None;
            for value in args.iter().map(to_number) {
                if is_nan(&value) {
                    return Ok(value);
                }
                let better = match &best {
                    None => true,
                    Some(current) => {
                        let ordering = compare(&value, current);
                        if method == "min" { ordering == Ordering::Less } else { ordering == Ordering::Greater }
                    }
                };
                if better {
                    best = Some(value);
                }
            }
            let empty = if method == "min" { f64::INFINITY } else { f64::NEG_INFINITY };
            Ok(best.unwrap_or(NativeValue::Double(empty)))
        }
        _ => Err(type_error(format!("Math.{} is not supported", method))),
    }
}

fn call_method(target: &NativeValue, method: &str, args: &[NativeValue]) -> Result<NativeValue, ScriptError> {
    let text_arg = |i: usize| args.get(i).map(js_string).unwrap_or_else(|| "undefined".into());
    match (target, method) {
        (NativeValue::Null | NativeValue::Undefined, _) => Err(type_error(format!(
            "cannot call '{}' on {}",
            method,
            js_string(target)
        ))),
        (_, "toString") => Ok(NativeValue::String(js_string(target))),
        (NativeValue::String(s), "toUpperCase") => Ok(NativeValue::String(s.to_uppercase())),
        (NativeValue::String(s), "toLowerCase") => Ok(NativeValue::String(s.to_lowercase())),
        (NativeValue::String(s), "trim") => Ok(NativeValue::String(s.trim().to_string())),
        (NativeValue::String(s), "indexOf") => Ok(s
            .find(&text_arg(0))
            .map(|byte| length_value(s[..byte].chars().count()))
            .unwrap_or(NativeValue::Int32(-1))),
        (NativeValue::String(s), "includes") => Ok(NativeValue::Bool(s.contains(&text_arg(0)))),
        (NativeValue::DateTime(ms), "getTime" | "valueOf") => Ok(NativeValue::Int64(*ms)),
        (NativeValue::DateTime(ms), "toISOString") => Ok(NativeValue::String(format_millis(*ms))),
        (NativeValue::ObjectId(oid), "toHexString" | "valueOf") => Ok(NativeValue::String(oid.to_hex())),
        (NativeValue::ObjectId(oid), "getTimestamp") => {
            Ok(NativeValue::DateTime(i64::from(oid.timestamp()) * 1000))
        }
        (NativeValue::ObjectId(oid), "equals") => Ok(NativeValue::Bool(
            matches!(args.first(), Some(NativeValue::ObjectId(other)) if other == oid),
        )),
        (NativeValue::Array(items), "join") => {
            let separator = args.first().map(js_string).unwrap_or_else(|| ",".into());
            Ok(NativeValue::String(
                items
                    .iter()
                    .map(|item| if item.is_null() { String::new() } else { js_string(item) })
                    .collect::<Vec<_>>()
                    .join(&separator),
            ))
        }
        (NativeValue::Array(items), "indexOf") => {
            let needle = args.first().cloned().unwrap_or(NativeValue::Undefined);
            Ok(items
                .iter()
                .position(|item| strict_eq(item, &needle))
                .map(length_value)
                .unwrap_or(NativeValue::Int32(-1)))
        }
        (NativeValue::Array(items), "includes") => {
            let needle = args.first().cloned().unwrap_or(NativeValue::Undefined);
            Ok(NativeValue::Bool(items.iter().any(|item| strict_eq(item, &needle))))
        }
        _ => Err(no_method(target, method)),
    }
}

#[cfg(test)]
mod tests {
    use super::super::parser::parse_program;
    use super::*;
    use std::time::Duration;

    fn config() -> ScriptConfig {
        ScriptConfig::default()
    }

    fn eval_with(src: &str, bindings: &BindingContext, config: &ScriptConfig) -> Result<NativeValue, ScriptError> {
        let program = parse_program(src, config.max_depth)?;
        Interpreter::new(bindings, config, Instant::now()).run(&program)
    }

    fn eval(src: &str) -> NativeValue {
        eval_with(src, &BindingContext::default(), &config()).unwrap()
    }

    #[test]
    fn test_filter_document() {
        let value = eval("{ age: { $gt: 30 }, name: /^A/i }");
        let doc = value.as_document().unwrap();
        assert_eq!(doc.get_path("age.$gt"), Some(&NativeValue::Int32(30)));
        assert_eq!(
            doc.get("name"),
            Some(&NativeValue::Regex { pattern: "^A".into(), options: "i".into() })
        );
    }

    #[test]
    fn test_last_expression_is_result() {
        let value = eval("var n = 0; for (var i = 1; i <= 4; i++) { n += i } ({ total: n })");
        assert_eq!(value.as_document().unwrap().get("total"), Some(&NativeValue::Int32(10)));
    }

    #[test]
    fn test_arithmetic_kinds() {
        assert_eq!(eval("7 / 2"), NativeValue::Double(3.5));
        assert_eq!(eval("8 / 2"), NativeValue::Int32(4));
        assert_eq!(eval("2147483647 + 1"), NativeValue::Int64(2_147_483_648));
        assert_eq!(eval("'a' + 1"), NativeValue::String("a1".into()));
        assert_eq!(
            eval("NumberDecimal('1.10') + 1"),
            NativeValue::Decimal128(Decimal::from_str("2.10").unwrap())
        );
    }

    #[test]
    fn test_equality() {
        assert_eq!(eval("null == undefined"), NativeValue::Bool(true));
        assert_eq!(eval("null === undefined"), NativeValue::Bool(false));
        assert_eq!(eval("1 === NumberLong(1)"), NativeValue::Bool(true));
        assert_eq!(eval("'1' == 1"), NativeValue::Bool(true));
        assert_eq!(eval("NaN == NaN"), NativeValue::Bool(false));
    }

    #[test]
    fn test_constructors() {
        assert_eq!(eval("ISODate('2024-01-02')"), NativeValue::DateTime(1_704_153_600_000));
        assert_eq!(eval("NumberLong('9007199254740993')"), NativeValue::Int64(9_007_199_254_740_993));
        assert_eq!(eval("NumberInt(3.9)"), NativeValue::Int32(3));
        assert_eq!(
            eval("ObjectId('64b0f0c2a1b2c3d4e5f60718').str"),
            NativeValue::String("64b0f0c2a1b2c3d4e5f60718".into())
        );
        assert_eq!(eval("Timestamp(5, 1)"), NativeValue::Timestamp { time: 5, increment: 1 });
        assert!(matches!(eval("UUID()"), NativeValue::Binary { subtype: 4, ref bytes } if bytes.len() == 16));
        assert!(matches!(
            eval_with("NumberInt(3000000000)", &BindingContext::default(), &config()),
            Err(ScriptError::Type(_))
        ));
    }

    #[test]
    fn test_member_assignment_and_push() {
        let value = eval("var q = { tags: [] }; q.tags.push('a', 'b'); q.meta = {}; q.meta.n = q.tags.length; q");
        let doc = value.as_document().unwrap();
        assert_eq!(doc.get_path("tags.1"), Some(&NativeValue::String("b".into())));
        assert_eq!(doc.get_path("meta.n"), Some(&NativeValue::Int32(2)));
    }

    #[test]
    fn test_bindings() {
        let mut bindings = BindingContext::default();
        bindings.positional.push(NativeValue::Int32(30));
        bindings.named.insert("name".into(), NativeValue::String("Ada".into()));

        let value = eval_with("{ age: { $gt: ?1 }, name: :name }", &bindings, &config()).unwrap();
        let doc = value.as_document().unwrap();
        assert_eq!(doc.get_path("age.$gt"), Some(&NativeValue::Int32(30)));
        assert_eq!(doc.get("name"), Some(&NativeValue::String("Ada".into())));

        assert_eq!(
            eval_with("{ a: ?2 }", &bindings, &config()),
            Err(ScriptError::UnboundParameter("?2".into()))
        );
    }

    #[test]
    fn test_reference_errors() {
        assert!(matches!(
            eval_with("db.users.drop()", &BindingContext::default(), &config()),
            Err(ScriptError::Reference(_))
        ));
        assert!(matches!(
            eval_with("var a; a.b", &BindingContext::default(), &config()),
            Err(ScriptError::Type(_))
        ));
    }

    #[test]
    fn test_infinite_loop_times_out() {
        let config = ScriptConfig { timeout_ms: 50, ..ScriptConfig::default() };
        let started = Instant::now();
        let result = eval_with("while (true) {}", &BindingContext::default(), &config);
        assert_eq!(result, Err(ScriptError::Timeout { ms: 50 }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_size_limit() {
        let config = ScriptConfig { max_value_len: 1000, ..ScriptConfig::default() };
        let result = eval_with(
            "var s = 'x'; while (true) { s = s + s }",
            &BindingContext::default(),
            &config,
        );
        assert_eq!(result, Err(ScriptError::SizeExceeded { limit: 1000 }));
    }

    #[test]
    fn test_value_depth_limit() {
        let config = ScriptConfig { max_depth: 8, ..ScriptConfig::default() };
        let result = eval_with(
            "var x = {}; for (var i = 0; i < 20; i++) { x = { child: x } }",
            &BindingContext::default(),
            &config,
        );
        assert_eq!(result, Err(ScriptError::DepthExceeded { limit: 8 }));
    }

    #[test]
    fn test_math_and_methods() {
        assert_eq!(eval("Math.floor(2.7)"), NativeValue::Int32(2));
        assert_eq!(eval("Math.max(1, 5, 3)"), NativeValue::Int32(5));
        assert_eq!(eval("' Ab '.trim().toUpperCase()"), NativeValue::String("AB".into()));
        assert_eq!(eval("[1, 2, 3].join('-')"), NativeValue::String("1-2-3".into()));
        assert_eq!(eval("ISODate('2024-01-02').getTime()"), NativeValue::Int64(1_704_153_600_000));
    }
}
