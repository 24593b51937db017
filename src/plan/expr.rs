//! Expression translation
//!
//! SQL expressions become either query filters (`{ age: { $gt: 30 } }`),
//! used for WHERE wherever a field is compared with a constant, or
//! aggregation expressions (`{ $gt: ["$age", 30] }`) for everything else.

use super::{Translator, TranslationError};
use crate::error::{Error, Result};
use crate::native::{Document, NativeValue};
use crate::types::{natural_kind, to_native, Cell};
use dsql::{BinaryOp, ColumnRef, Expr, Join, Literal, TableRef, UnaryOp};

/// Name resolution for one SELECT
pub(super) struct Context<'s> {
    base: &'s TableRef,
    joins: Vec<&'s str>,
}

impl<'s> Context<'s> {
    pub(super) fn new(base: &'s TableRef, joins: &'s [Join]) -> Self {
        Self {
            base,
            joins: joins.iter().map(|j| j.table.binding()).collect(),
        }
    }

    /// Field path of a column in the pipeline's documents
    ///
    /// Base-table qualifiers are dropped; joined tables live under their binding.
    pub(super) fn resolve(&self, column: &ColumnRef) -> String {
        match column.parts.split_first() {
            Some((head, rest))
                if !rest.is_empty() && (head == self.base.binding() || *head == self.base.name) =>
            {
                rest.join(".")
            }
            _ => column.path(),
        }
    }

    /// The join binding a column is qualified with, if any
    pub(super) fn join_of(&self, column: &ColumnRef) -> Option<&'s str> {
        if column.parts.len() < 2 {
            return None;
        }
        self.joins.iter().copied().find(|j| *j == column.parts[0])
    }

    pub(super) fn references_join(&self, expr: &Expr) -> bool {
        let mut found = false;
        expr.walk(&mut |e| {
            if let Expr::Column(column) = e {
                found |= self.join_of(column).is_some();
            }
        });
        found
    }

    /// Structural equality, with columns compared by resolved path
    pub(super) fn same(&self, a: &Expr, b: &Expr) -> bool {
        match (a, b) {
            (Expr::Column(x), Expr::Column(y)) => self.resolve(x) == self.resolve(y),
            _ => a == b,
        }
    }
}

/// An aggregate call computed by the `$group` stage
pub(super) struct GroupedAggregate {
    pub expr: Expr,
    /// Reference to the result in post-group documents
    pub reference: NativeValue,
}

/// What column references mean where an expression is translated
pub(super) enum Scope<'s> {
    /// Fields of the current document
    Row,
    /// Inside a join's sub-pipeline: the joined binding is the current
    /// document, other columns are passed in as `let` variables
    Join {
        binding: &'s str,
        lets: Vec<(String, String)>,
    },
    /// After `$group`: only group keys and aggregates are visible
    Grouped {
        keys: &'s [Expr],
        aggregates: &'s [GroupedAggregate],
    },
}

/// `{ <op>: [args...] }`
pub(super) fn operator(op: &str, args: Vec<NativeValue>) -> NativeValue {
    let mut doc = Document::with_capacity(1);
    doc.insert(op, NativeValue::Array(args));
    NativeValue::Document(doc)
}

/// Wrap constants an aggregation expression would otherwise interpret
pub(super) fn literal(value: NativeValue) -> NativeValue {
    let ambiguous = match &value {
        NativeValue::String(s) => s.starts_with('$'),
        NativeValue::Document(_) | NativeValue::Array(_) => true,
        _ => false,
    };
    if ambiguous {
        let mut doc = Document::with_capacity(1);
        doc.insert("$literal", value);
        NativeValue::Document(doc)
    } else {
        value
    }
}

pub(super) fn literal_cell(literal: &Literal) -> Cell {
    match literal {
        Literal::Null => Cell::Null,
        Literal::Bool(b) => Cell::Boolean(*b),
        Literal::Int(i) => Cell::Integer(*i),
        Literal::Float(f) => Cell::Float(*f),
        Literal::String(s) => Cell::String(s.clone()),
        Literal::DateTime(ms) => Cell::DateTime(*ms),
    }
}

fn expression_operator(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Eq => "$eq",
        BinaryOp::Ne => "$ne",
        BinaryOp::Lt => "$lt",
        BinaryOp::Le => "$lte",
        BinaryOp::Gt => "$gt",
        BinaryOp::Ge => "$gte",
        BinaryOp::And => "$and",
        BinaryOp::Or => "$or",
        BinaryOp::Add => "$add",
        BinaryOp::Sub => "$subtract",
        BinaryOp::Mul => "$multiply",
        BinaryOp::Div => "$divide",
        BinaryOp::Mod => "$mod",
        BinaryOp::Concat => "$concat",
    }
}

/// Anchored regex for a LIKE pattern; leading or trailing `%` drops the anchor
pub(crate) fn like_to_regex(pattern: &str) -> String {
    enum Token {
        Any,
        One,
        Char(char),
    }

    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '\\' => Token::Char(chars.next().unwrap_or('\\')),
            '%' => Token::Any,
            '_' => Token::One,
            c => Token::Char(c),
        });
    }

    let start = tokens.iter().take_while(|t| matches!(t, Token::Any)).count();
    let body = &tokens[start..];
    let end = body.len() - body.iter().rev().take_while(|t| matches!(t, Token::Any)).count();
    let body = &body[..end];

    if start == tokens.len() && start > 0 {
        return String::new();
    }
    let mut regex = String::new();
    if start == 0 {
        regex.push('^');
    }
    let mut buf = [0u8; 4];
    for token in body {
        match token {
            Token::Any => regex.push_str(".*"),
            Token::One => regex.push('.'),
            Token::Char(c) => regex.push_str(&regex::escape(c.encode_utf8(&mut buf))),
        }
    }
    if end == tokens.len() - start {
        regex.push('$');
    }
    regex
}

fn translation(node: &Expr, reason: impl Into<String>) -> Error {
    Error::from(TranslationError::new(node.to_string(), reason))
}

impl Translator<'_> {
    /// A constant as a cell: literals, parameters and negated numbers
    pub(super) fn constant_cell(&self, expr: &Expr) -> Result<Option<Cell>> {
        Ok(match expr {
            Expr::Literal(lit) => Some(literal_cell(lit)),
            Expr::Parameter(p) => Some(self.parameter(p)?),
            Expr::UnaryOp { op: UnaryOp::Neg, expr: inner } => match self.constant_cell(inner)? {
                Some(Cell::Integer(i)) => Some(Cell::Integer(
                    i.checked_neg().ok_or_else(|| translation(expr, "integer overflow"))?,
                )),
                Some(Cell::Float(f)) => Some(Cell::Float(-f)),
                Some(Cell::Decimal(d)) => Some(Cell::Decimal(-d)),
                _ => None,
            },
            _ => None,
        })
    }

    /// A constant as a native value; fragments count as constants
    pub(super) fn constant(&self, expr: &Expr) -> Result<Option<NativeValue>> {
        if let Expr::Native(span) = expr {
            return self.fragment(&span.text).map(Some);
        }
        match self.constant_cell(expr)? {
            Some(cell) => Ok(Some(to_native(&cell, natural_kind(&cell))?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Query filters
    // ========================================================================

    /// Translate a WHERE condition into a query filter document
    pub(super) fn filter(&self, expr: &Expr, ctx: &Context) -> Result<Document> {
        let mut out = Document::new();
        match expr {
            Expr::BinaryOp { op: op @ (BinaryOp::And | BinaryOp::Or), .. } => {
                let mut parts = Vec::new();
                collect_chain(expr, *op, &mut parts);
                let filters = parts
                    .into_iter()
                    .map(|part| self.filter(part, ctx).map(NativeValue::Document))
                    .collect::<Result<Vec<_>>>()?;
                let name = if *op == BinaryOp::And { "$and" } else { "$or" };
                out.insert(name, filters);
            }
            Expr::UnaryOp { op: UnaryOp::Not, expr: inner } => {
                out.insert("$nor", vec![NativeValue::Document(self.filter(inner, ctx)?)]);
            }
            Expr::BinaryOp { left, op, right } if op.is_comparison() => {
                let field = match (left.as_ref(), right.as_ref()) {
                    (Expr::Column(column), other) => Some((column, *op, other)),
                    (other, Expr::Column(column)) => Some((column, op.flipped(), other)),
                    _ => None,
                };
                let constant = match field {
                    Some((column, op, other)) => self.constant(other)?.map(|value| (column, op, value)),
                    None => None,
                };
                match constant {
                    Some((column, op, value)) => {
                        out.insert(ctx.resolve(column), condition(expression_operator(op), value));
                    }
                    None => return self.expr_filter(expr, ctx),
                }
            }
            Expr::In { expr: inner, list, negated } => {
                let (Expr::Column(column), Some(values)) = (inner.as_ref(), self.constants(list)?) else {
                    return self.expr_filter(expr, ctx);
                };
                let op = if *negated { "$nin" } else { "$in" };
                out.insert(ctx.resolve(column), condition(op, NativeValue::Array(values)));
            }
            Expr::IsNull { expr: inner, negated } => {
                let Expr::Column(column) = inner.as_ref() else {
                    return self.expr_filter(expr, ctx);
                };
                let op = if *negated { "$ne" } else { "$eq" };
                out.insert(ctx.resolve(column), condition(op, NativeValue::Null));
            }
            Expr::Between { expr: inner, low, high, negated } => {
                let (Expr::Column(column), Some(low), Some(high)) =
                    (inner.as_ref(), self.constant(low)?, self.constant(high)?)
                else {
                    return self.expr_filter(expr, ctx);
                };
                let path = ctx.resolve(column);
                if *negated {
                    let below: Document = [(path.clone(), condition("$lt", low))].into_iter().collect();
                    let above: Document = [(path, condition("$gt", high))].into_iter().collect();
                    out.insert("$or", vec![NativeValue::Document(below), NativeValue::Document(above)]);
                } else {
                    let mut range = Document::with_capacity(2);
                    range.insert("$gte", low);
                    range.insert("$lte", high);
                    out.insert(path, range);
                }
            }
            Expr::Like { expr: inner, pattern, negated } => {
                let (Expr::Column(column), Some(pattern)) = (inner.as_ref(), self.constant(pattern)?) else {
                    return self.expr_filter(expr, ctx);
                };
                let NativeValue::String(pattern) = pattern else {
                    return Err(translation(expr, "LIKE needs a string pattern"));
                };
                let regex = condition("$regex", NativeValue::String(like_to_regex(&pattern)));
                let path = ctx.resolve(column);
                if *negated {
                    out.insert(path, condition("$not", NativeValue::Document(regex)));
                } else {
                    out.insert(path, regex);
                }
            }
            Expr::Native(span) => return self.fragment_document(&span.text),
            Expr::Literal(Literal::Bool(true)) => {}
            _ => return self.expr_filter(expr, ctx),
        }
        Ok(out)
    }

    /// Fallback: `{ $expr: <aggregation expression> }`
    fn expr_filter(&self, expr: &Expr, ctx: &Context) -> Result<Document> {
        let mut out = Document::with_capacity(1);
        out.insert("$expr", self.aggregate_expr(expr, ctx, &mut Scope::Row)?);
        Ok(out)
    }

    fn constants(&self, list: &[Expr]) -> Result<Option<Vec<NativeValue>>> {
        let mut values = Vec::with_capacity(list.len());
        for item in list {
            match self.constant(item)? {
                Some(value) => values.push(value),
                None => return Ok(None),
            }
        }
        Ok(Some(values))
    }

    // ========================================================================
    // Aggregation expressions
    // ========================================================================

    pub(super) fn aggregate_expr(&self, expr: &Expr, ctx: &Context, scope: &mut Scope) -> Result<NativeValue> {
        if let Scope::Grouped { keys, aggregates } = scope {
            if let Some(index) = keys.iter().position(|k| ctx.same(k, expr)) {
                return Ok(NativeValue::String(format!("$_id.g{}", index)));
            }
            if let Expr::Aggregate { .. } = expr {
                return aggregates
                    .iter()
                    .find(|a| a.expr == *expr)
                    .map(|a| a.reference.clone())
                    .ok_or_else(|| translation(expr, "aggregate is not computed by the grouping"));
            }
            if let Expr::Column(column) = expr {
                return Err(translation(
                    expr,
                    format!("column '{}' must appear in GROUP BY or be used in an aggregate", column.path()),
                ));
            }
        }

        Ok(match expr {
            Expr::Literal(lit) => {
                let cell = literal_cell(lit);
                literal(to_native(&cell, natural_kind(&cell))?)
            }
            Expr::Parameter(_) => match self.constant(expr)? {
                Some(value) => literal(value),
                None => NativeValue::Null,
            },
            Expr::Native(span) => self.fragment(&span.text)?,
            Expr::Column(column) => self.column_reference(column, ctx, scope),
            Expr::BinaryOp { left, op, right } => {
                operator(expression_operator(*op), self.aggregate_exprs(&[&**left, &**right], ctx, scope)?)
            }
            Expr::UnaryOp { op: UnaryOp::Not, expr: inner } => operator("$not", self.aggregate_exprs(&[&**inner], ctx, scope)?),
            Expr::UnaryOp { op: UnaryOp::Neg, expr: inner } => match self.constant(expr)? {
                Some(value) => literal(value),
                None => {
                    let value = self.aggregate_expr(inner, ctx, scope)?;
                    operator("$multiply", vec![NativeValue::Int32(-1), value])
                }
            },
            Expr::Function { name, args: call_args } => {
                let values = call_args
                    .iter()
                    .map(|a| self.aggregate_expr(a, ctx, scope))
                    .collect::<Result<Vec<_>>>()?;
                function(expr, name, values)?
            }
            Expr::Aggregate { .. } => {
                return Err(translation(expr, "aggregate functions are not allowed here"))
            }
            Expr::In { expr: inner, list, negated } => {
                let needle = self.aggregate_expr(inner, ctx, scope)?;
                let items = list
                    .iter()
                    .map(|item| self.aggregate_expr(item, ctx, scope))
                    .collect::<Result<Vec<_>>>()?;
                negate(operator("$in", vec![needle, NativeValue::Array(items)]), *negated)
            }
            Expr::Like { expr: inner, pattern, negated } => {
                let Some(NativeValue::String(pattern)) = self.constant(pattern)? else {
                    return Err(translation(expr, "LIKE needs a constant string pattern"));
                };
                let mut spec = Document::with_capacity(2);
                spec.insert("input", self.aggregate_expr(inner, ctx, scope)?);
                spec.insert("regex", like_to_regex(&pattern));
                let mut doc = Document::with_capacity(1);
                doc.insert("$regexMatch", spec);
                negate(NativeValue::Document(doc), *negated)
            }
            Expr::IsNull { expr: inner, negated } => {
                let value = null_if_missing(self.aggregate_expr(inner, ctx, scope)?);
                let op = if *negated { "$ne" } else { "$eq" };
                operator(op, vec![value, NativeValue::Null])
            }
            Expr::Between { expr: inner, low, high, negated } => {
                let values = self.aggregate_exprs(&[&**inner, &**low, &**high], ctx, scope)?;
                let [value, low, high]: [NativeValue; 3] = values
                    .try_into()
                    .map_err(|_| translation(expr, "malformed BETWEEN"))?;
                let range = operator(
                    "$and",
                    vec![
                        operator("$gte", vec![value.clone(), low]),
                        operator("$lte", vec![value, high]),
                    ],
                );
                negate(range, *negated)
            }
        })
    }

    fn aggregate_exprs(&self, exprs: &[&Expr], ctx: &Context, scope: &mut Scope) -> Result<Vec<NativeValue>> {
        exprs.iter().map(|e| self.aggregate_expr(e, ctx, scope)).collect()
    }

    fn column_reference(&self, column: &ColumnRef, ctx: &Context, scope: &mut Scope) -> NativeValue {
        match scope {
            Scope::Join { binding, lets } => {
                if ctx.join_of(column) == Some(*binding) {
                    return NativeValue::String(format!("${}", column.parts[1..].join(".")));
                }
                let path = ctx.resolve(column);
                let index = match lets.iter().position(|(_, p)| *p == path) {
                    Some(index) => index,
                    None => {
                        lets.push((format!("v{}", lets.len()), path));
                        lets.len() - 1
                    }
                };
                NativeValue::String(format!("$${}", lets[index].0))
            }
            _ => NativeValue::String(format!("${}", ctx.resolve(column))),
        }
    }
}

/// `{ <op>: <value> }` as a field condition
fn condition(op: &str, value: NativeValue) -> Document {
    let mut doc = Document::with_capacity(1);
    doc.insert(op, value);
    doc
}

/// A missing field is not equal to null in aggregation expressions
pub(super) fn null_if_missing(value: NativeValue) -> NativeValue {
    operator("$ifNull", vec![value, NativeValue::Null])
}

fn negate(value: NativeValue, negated: bool) -> NativeValue {
    if negated {
        operator("$not", vec![value])
    } else {
        value
    }
}

/// Operands of a chain of the same logical operator, flattened
fn collect_chain<'e>(expr: &'e Expr, op: BinaryOp, out: &mut Vec<&'e Expr>) {
    match expr {
        Expr::BinaryOp { left, op: inner, right } if *inner == op => {
            collect_chain(left, op, out);
            collect_chain(right, op, out);
        }
        other => out.push(other),
    }
}

/// Top-level AND operands of a condition
pub(super) fn conjuncts(expr: &Expr) -> Vec<&Expr> {
    let mut out = Vec::new();
    collect_chain(expr, BinaryOp::And, &mut out);
    out
}

/// Rebuild a condition from AND operands
pub(super) fn conjunction(parts: Vec<&Expr>) -> Option<Expr> {
    parts.into_iter().cloned().reduce(|left, right| Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOp::And,
        right: Box::new(right),
    })
}

fn function(expr: &Expr, name: &str, mut args: Vec<NativeValue>) -> Result<NativeValue> {
    let name = name.to_ascii_uppercase();
    let unary = |op: &str, mut args: Vec<NativeValue>| -> Result<NativeValue> {
        match args.len() {
            1 => Ok(operator(op, vec![args.remove(0)])),
            n => Err(translation(expr, format!("{} expects 1 argument, got {}", name, n))),
        }
    };
    match name.as_str() {
        "UPPER" => unary("$toUpper", args),
        "LOWER" => unary("$toLower", args),
        "LENGTH" => unary("$strLenCP", args),
        "ABS" => unary("$abs", args),
        "CONCAT" if !args.is_empty() => Ok(operator("$concat", args)),
        "COALESCE" if !args.is_empty() => {
            let mut value = args.pop().unwrap_or(NativeValue::Null);
            while let Some(previous) = args.pop() {
                value = operator("$ifNull", vec![previous, value]);
            }
            Ok(value)
        }
        "CONCAT" | "COALESCE" => Err(translation(expr, format!("{} expects at least 1 argument", name))),
        _ => Err(translation(expr, format!("unknown function {}", name))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_like_to_regex() {
        assert_eq!(like_to_regex("abc"), "^abc$");
        assert_eq!(like_to_regex("abc%"), "^abc");
        assert_eq!(like_to_regex("%abc"), "abc$");
        assert_eq!(like_to_regex("%a_c%"), "a.c");
        assert_eq!(like_to_regex("a.b%"), "^a\\.b");
        assert_eq!(like_to_regex("100\\%"), "^100%$");
        assert_eq!(like_to_regex("%"), "");
        assert_eq!(like_to_regex("%%"), "");
        assert_eq!(like_to_regex(""), "^$");
    }

    #[test]
    fn test_literal_wrapping() {
        assert_eq!(literal(NativeValue::Int32(1)), NativeValue::Int32(1));
        assert_eq!(
            literal(NativeValue::from("$price")),
            NativeValue::Document([("$literal", "$price")].into_iter().collect())
        );
    }

    #[test]
    fn test_conjunction_round_trip() {
        let expr = dsql::parse("SELECT * FROM t WHERE a = 1 AND b = 2 AND c = 3").unwrap();
        let dsql::Statement::Select(select) = expr else { panic!("not a select") };
        let condition = select.where_clause.unwrap();
        let parts = conjuncts(&condition);
        assert_eq!(parts.len(), 3);
        assert_eq!(conjunction(parts).unwrap(), condition);
    }
}
