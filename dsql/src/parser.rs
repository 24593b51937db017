//! DSQL Parser using nom
//!
//! Parses DSQL query strings into AST nodes. Boolean and arithmetic
//! expressions use precedence climbing; everything else is plain
//! recursive descent over nom combinators.

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while, take_while1},
    character::complete::{char, digit1, none_of, one_of},
    combinator::{cut, map, opt, recognize, value, verify},
    error::{context, ErrorKind, ParseError as _, VerboseError, VerboseErrorKind},
    multi::{many0, separated_list1},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};

use crate::ast::*;
use crate::error::SyntaxError;

type Res<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

/// Parse a complete statement
pub fn parse_statement(input: &str) -> Result<Statement, SyntaxError> {
    let (remaining, stmt) = statement(input).map_err(|e| SyntaxError::from_nom(input, e))?;

    // Only whitespace, comments and semicolons may follow
    let remaining = skip_separators(remaining);
    if !remaining.is_empty() {
        return Err(SyntaxError::new(input, input.len() - remaining.len(), "end of statement"));
    }

    Ok(finish(input, stmt))
}

/// Parse multiple statements separated by semicolons
pub fn parse_statements(input: &str) -> Result<Vec<Statement>, SyntaxError> {
    let mut statements = Vec::new();
    let mut remaining = skip_separators(input);

    while !remaining.is_empty() {
        let (rest, stmt) = statement(remaining).map_err(|e| SyntaxError::from_nom(input, e))?;
        let (rest, _) = sp(rest).map_err(|e| SyntaxError::from_nom(input, e))?;
        if !rest.is_empty() && !rest.starts_with(';') {
            return Err(SyntaxError::new(input, input.len() - rest.len(), "';' or end of input"));
        }
        statements.push(finish(input, stmt));
        remaining = skip_separators(rest);
    }

    Ok(statements)
}

fn skip_separators(mut input: &str) -> &str {
    loop {
        let trimmed = match sp(input) {
            Ok((rest, _)) => rest,
            Err(_) => input,
        };
        match trimmed.strip_prefix(';') {
            Some(rest) => input = rest,
            None => return trimmed,
        }
    }
}

/// Resolve parse-time offsets into statement positions and number `?` placeholders.
///
/// While parsing, spans and placeholders record how much input remained after
/// them; every slice ends where `source` ends, so `source.len() - remaining`
/// is the byte offset.
fn finish(source: &str, mut stmt: Statement) -> Statement {
    let total = source.len();

    let mut offsets = Vec::new();
    for expr in stmt.exprs_mut() {
        expr.walk(&mut |e| {
            if let Expr::Parameter(Parameter::Positional(remaining)) = e {
                offsets.push(*remaining);
            }
        });
    }
    // Larger remaining length means earlier in the text
    offsets.sort_unstable_by(|a, b| b.cmp(a));

    for expr in stmt.exprs_mut() {
        expr.walk_mut(&mut |e| match e {
            Expr::Parameter(Parameter::Positional(remaining)) => {
                let index = offsets.iter().position(|o| o == remaining).unwrap_or(0);
                *remaining = index + 1;
            }
            Expr::Native(span) => span.position = total - span.position,
            _ => {}
        });
    }

    if let Statement::Native(cmd) = &mut stmt {
        cmd.args.position = total - cmd.args.position;
        for (_, span) in &mut cmd.modifiers {
            span.position = total - span.position;
        }
    }

    stmt
}

// ============================================================================
// Lexical helpers
// ============================================================================

const RESERVED: &[&str] = &[
    "SELECT", "DISTINCT", "FROM", "WHERE", "AND", "OR", "NOT", "IN", "IS", "NULL", "LIKE",
    "BETWEEN", "JOIN", "INNER", "LEFT", "OUTER", "ON", "GROUP", "BY", "HAVING", "ORDER", "ASC",
    "DESC", "LIMIT", "OFFSET", "AS", "TRUE", "FALSE", "INSERT", "INTO", "VALUES", "UPDATE",
    "SET", "DELETE",
];

fn is_reserved(word: &str) -> bool {
    RESERVED.iter().any(|k| k.eq_ignore_ascii_case(word))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Skip whitespace and `--` line comments
fn sp(mut input: &str) -> Res<'_, ()> {
    loop {
        let trimmed = input.trim_start();
        if let Some(comment) = trimmed.strip_prefix("--") {
            input = comment.find('\n').map(|nl| &comment[nl..]).unwrap_or("");
        } else {
            return Ok((trimmed, ()));
        }
    }
}

/// Case-insensitive keyword that is not the prefix of a longer word
fn kw<'a>(word: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    move |input: &'a str| {
        let (input, _) = sp(input)?;
        let (rest, matched) = tag_no_case::<_, _, VerboseError<&'a str>>(word)(input)?;
        if rest.chars().next().map_or(false, is_ident_char) {
            return Err(nom::Err::Error(VerboseError::from_error_kind(input, ErrorKind::Tag)));
        }
        Ok((rest, matched))
    }
}

/// Punctuation symbol
fn sym<'a>(s: &'static str) -> impl FnMut(&'a str) -> Res<'a, &'a str> {
    preceded(sp, tag(s))
}

fn failure<'a, T>(at: &'a str, expected: &'static str) -> Res<'a, T> {
    Err(nom::Err::Failure(VerboseError {
        errors: vec![(at, VerboseErrorKind::Context(expected))],
    }))
}

fn ident_token(input: &str) -> Res<'_, String> {
    alt((
        map(delimited(char('`'), take_while1(|c| c != '`'), char('`')), String::from),
        map(
            verify(
                recognize(pair(
                    take_while1(|c: char| c.is_alphabetic() || c == '_'),
                    take_while(is_ident_char),
                )),
                |s: &str| !is_reserved(s),
            ),
            String::from,
        ),
    ))(input)
}

/// Any word, reserved or not (collection and method names in shell commands)
fn word_token(input: &str) -> Res<'_, String> {
    map(
        recognize(pair(
            take_while1(|c: char| c.is_alphabetic() || c == '_'),
            take_while(is_ident_char),
        )),
        String::from,
    )(input)
}

fn identifier(input: &str) -> Res<'_, String> {
    context("identifier", preceded(sp, ident_token))(input)
}

/// `a`, `a.b.c`, `` `odd name`.x ``
fn path(input: &str) -> Res<'_, Vec<String>> {
    let (input, first) = identifier(input)?;
    let (input, rest) = many0(preceded(char('.'), ident_token))(input)?;
    let mut parts = vec![first];
    parts.extend(rest);
    Ok((input, parts))
}

fn collection_name(input: &str) -> Res<'_, String> {
    context("collection name", map(path, |parts| parts.join(".")))(input)
}

// ============================================================================
// Statement Parsers
// ============================================================================

fn statement(input: &str) -> Res<'_, Statement> {
    let (start, _) = sp(input)?;
    let (_, word) = take_while::<_, &str, VerboseError<&str>>(is_ident_char)(start)?;

    match word.to_ascii_uppercase().as_str() {
        "SELECT" => map(select_stmt, Statement::Select)(start),
        "INSERT" => map(insert_stmt, Statement::Insert)(start),
        "UPDATE" => map(update_stmt, Statement::Update)(start),
        "DELETE" => map(delete_stmt, Statement::Delete)(start),
        "DB" => map(native_command, Statement::Native)(start),
        _ => Err(nom::Err::Error(VerboseError {
            errors: vec![(
                start,
                VerboseErrorKind::Context("SELECT, INSERT, UPDATE, DELETE or db.<collection> command"),
            )],
        })),
    }
}

// ============================================================================
// SELECT
// ============================================================================

fn select_stmt(input: &str) -> Res<'_, SelectStmt> {
    let (input, _) = kw("SELECT")(input)?;
    let (input, distinct) = opt(kw("DISTINCT"))(input)?;
    let (input, columns) = cut(context(
        "select list",
        separated_list1(sym(","), select_item),
    ))(input)?;
    let (input, _) = cut(context("FROM", kw("FROM")))(input)?;
    let (input, from) = cut(table_ref)(input)?;
    let (input, joins) = many0(join_clause)(input)?;
    let (input, where_clause) = opt(preceded(
        kw("WHERE"),
        cut(context("WHERE condition", expr)),
    ))(input)?;
    let (input, group_by) = opt(preceded(
        pair(kw("GROUP"), cut(kw("BY"))),
        cut(context("GROUP BY expression", separated_list1(sym(","), expr))),
    ))(input)?;
    let (input, having) = opt(preceded(
        kw("HAVING"),
        cut(context("HAVING condition", expr)),
    ))(input)?;
    let (input, order_by) = opt(preceded(
        pair(kw("ORDER"), cut(kw("BY"))),
        cut(context("ORDER BY expression", separated_list1(sym(","), order_by_item))),
    ))(input)?;
    let (input, (limit, offset)) = limit_offset(input)?;

    Ok((input, SelectStmt {
        distinct: distinct.is_some(),
        columns,
        from,
        joins,
        where_clause,
        group_by: group_by.unwrap_or_default(),
        having,
        order_by: order_by.unwrap_or_default(),
        limit,
        offset,
    }))
}

fn select_item(input: &str) -> Res<'_, SelectItem> {
    alt((
        map(sym("*"), |_| SelectItem::Star),
        map(pair(expr, opt(alias)), |(expr, alias)| SelectItem::Expr { expr, alias }),
    ))(input)
}

fn alias(input: &str) -> Res<'_, String> {
    alt((
        preceded(kw("AS"), cut(context("alias", alt((identifier, preceded(sp, string_literal)))))),
        identifier,
    ))(input)
}

fn table_ref(input: &str) -> Res<'_, TableRef> {
    let (input, name) = collection_name(input)?;
    let (input, alias) = opt(alt((preceded(kw("AS"), cut(identifier)), identifier)))(input)?;
    Ok((input, TableRef { name, alias }))
}

fn join_clause(input: &str) -> Res<'_, Join> {
    let (input, kind) = alt((
        value(JoinKind::Inner, pair(kw("INNER"), cut(kw("JOIN")))),
        value(JoinKind::Left, tuple((kw("LEFT"), opt(kw("OUTER")), cut(kw("JOIN"))))),
        value(JoinKind::Inner, kw("JOIN")),
    ))(input)?;
    let (input, table) = cut(table_ref)(input)?;
    let (input, _) = cut(context("ON", kw("ON")))(input)?;
    let (input, on) = cut(context("join condition", expr))(input)?;
    Ok((input, Join { kind, table, on }))
}

fn order_by_item(input: &str) -> Res<'_, OrderBy> {
    let (input, expr) = expr(input)?;
    let (input, dir) = opt(alt((
        value(OrderDirection::Asc, kw("ASC")),
        value(OrderDirection::Desc, kw("DESC")),
    )))(input)?;

    Ok((input, OrderBy {
        expr,
        direction: dir.unwrap_or_default(),
    }))
}

/// LIMIT and OFFSET, accepted in either order
fn limit_offset(mut input: &str) -> Res<'_, (Option<Expr>, Option<Expr>)> {
    let mut limit = None;
    let mut offset = None;
    loop {
        if limit.is_none() {
            if let Ok((rest, _)) = kw("LIMIT")(input) {
                let (rest, n) = cut(context("row count", count_value))(rest)?;
                limit = Some(n);
                input = rest;
                continue;
            }
        }
        if offset.is_none() {
            if let Ok((rest, _)) = kw("OFFSET")(input) {
                let (rest, n) = cut(context("row offset", count_value))(rest)?;
                offset = Some(n);
                input = rest;
                continue;
            }
        }
        return Ok((input, (limit, offset)));
    }
}

fn count_value(input: &str) -> Res<'_, Expr> {
    alt((
        map(preceded(sp, digit1), |digits: &str| {
            Expr::Literal(digits.parse::<i64>().map(Literal::Int).unwrap_or(Literal::Int(i64::MAX)))
        }),
        parameter,
    ))(input)
}

// ============================================================================
// INSERT / UPDATE / DELETE
// ============================================================================

fn insert_stmt(input: &str) -> Res<'_, InsertStmt> {
    let (input, _) = kw("INSERT")(input)?;
    let (input, _) = cut(kw("INTO"))(input)?;
    let (input, into) = cut(collection_name)(input)?;
    let (input, columns) = cut(context(
        "column list",
        delimited(
            sym("("),
            separated_list1(sym(","), map(path, |p| p.join("."))),
            sym(")"),
        ),
    ))(input)?;
    let (input, _) = cut(context("VALUES", kw("VALUES")))(input)?;
    let (input, rows) = cut(context(
        "value list",
        separated_list1(
            sym(","),
            delimited(sym("("), separated_list1(sym(","), expr), sym(")")),
        ),
    ))(input)?;

    Ok((input, InsertStmt { into, columns, rows }))
}

fn update_stmt(input: &str) -> Res<'_, UpdateStmt> {
    let (input, _) = kw("UPDATE")(input)?;
    let (input, collection) = cut(collection_name)(input)?;
    let (input, _) = cut(context("SET", kw("SET")))(input)?;
    let (input, set) = cut(separated_list1(sym(","), set_clause))(input)?;
    let (input, where_clause) = opt(preceded(
        kw("WHERE"),
        cut(context("WHERE condition", expr)),
    ))(input)?;

    Ok((input, UpdateStmt { collection, set, where_clause }))
}

fn set_clause(input: &str) -> Res<'_, SetClause> {
    let (input, column) = map(path, |p| p.join("."))(input)?;
    let (input, _) = cut(context("'='", sym("=")))(input)?;
    let (input, value) = cut(context("value", expr))(input)?;

    Ok((input, SetClause { column, value }))
}

fn delete_stmt(input: &str) -> Res<'_, DeleteStmt> {
    let (input, _) = kw("DELETE")(input)?;
    let (input, _) = cut(context("FROM", kw("FROM")))(input)?;
    let (input, from) = cut(collection_name)(input)?;
    let (input, where_clause) = opt(preceded(
        kw("WHERE"),
        cut(context("WHERE condition", expr)),
    ))(input)?;

    Ok((input, DeleteStmt { from, where_clause }))
}

// ============================================================================
// Native shell commands: db.<collection>.<method>(<args>)[.<modifier>(<args>)]*
// ============================================================================

fn native_command(input: &str) -> Res<'_, NativeCommand> {
    let (input, _) = kw("DB")(input)?;
    let (input, _) = cut(char::<&str, VerboseError<&str>>('.'))(input)?;
    let (input, segments) = cut(context(
        "collection and method",
        separated_list1(char('.'), word_token),
    ))(input)?;
    if segments.len() < 2 {
        return failure(input, "db.<collection>.<method>(...)");
    }
    let method = segments[segments.len() - 1].clone();
    let collection = segments[..segments.len() - 1].join(".");
    let (input, args) = cut(balanced_args)(input)?;

    let mut modifiers = Vec::new();
    let mut input = input;
    while let Ok((rest, name)) = preceded(pair(sp, char('.')), word_token)(input) {
        let (rest, span) = cut(balanced_args)(rest)?;
        modifiers.push((name, span));
        input = rest;
    }

    Ok((input, NativeCommand { collection, method, args, modifiers }))
}

/// `( ... )` with nesting and quoted strings respected; yields the inner text
fn balanced_args(input: &str) -> Res<'_, NativeSpan> {
    let (body, _) = context("'('", preceded(sp, char('(')))(input)?;
    let mut depth = 1usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => quote = Some(c),
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => {
                depth -= 1;
                if depth == 0 {
                    let span = NativeSpan {
                        text: body[..i].to_string(),
                        position: body.len(),
                    };
                    return Ok((&body[i + 1..], span));
                }
            }
            _ => {}
        }
    }

    failure(input, "closing ')'")
}

// ============================================================================
// Expressions (precedence climbing)
// ============================================================================

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_ADD: u8 = 5;
const PREC_MUL: u8 = 6;
const PREC_UNARY: u8 = 7;

#[derive(Debug, Clone, Copy)]
enum Infix {
    Binary(BinaryOp),
    IsNull { negated: bool },
    Like { negated: bool },
    In { negated: bool },
    Between { negated: bool },
}

impl Infix {
    fn precedence(self) -> u8 {
        match self {
            Infix::Binary(BinaryOp::Or) => PREC_OR,
            Infix::Binary(BinaryOp::And) => PREC_AND,
            Infix::Binary(op) if op.is_comparison() => PREC_CMP,
            Infix::Binary(BinaryOp::Add | BinaryOp::Sub | BinaryOp::Concat) => PREC_ADD,
            Infix::Binary(_) => PREC_MUL,
            Infix::IsNull { .. } | Infix::Like { .. } | Infix::In { .. } | Infix::Between { .. } => {
                PREC_CMP
            }
        }
    }
}

pub(crate) fn expr(input: &str) -> Res<'_, Expr> {
    expr_bp(input, 0)
}

fn expr_bp(input: &str, min_prec: u8) -> Res<'_, Expr> {
    let (mut input, mut lhs) = prefix(input)?;

    loop {
        let (after, op) = match infix(input) {
            Ok(found) => found,
            Err(nom::Err::Error(_)) => break,
            Err(e) => return Err(e),
        };
        let prec = op.precedence();
        if prec < min_prec {
            break;
        }

        match op {
            Infix::Binary(op) => {
                let (rest, rhs) = cut(context("operand", |i| expr_bp(i, prec + 1)))(after)?;
                lhs = Expr::BinaryOp {
                    left: Box::new(lhs),
                    op,
                    right: Box::new(rhs),
                };
                input = rest;
            }
            Infix::IsNull { negated } => {
                lhs = Expr::IsNull { expr: Box::new(lhs), negated };
                input = after;
            }
            Infix::Like { negated } => {
                let (rest, pattern) = cut(context("LIKE pattern", |i| expr_bp(i, PREC_ADD)))(after)?;
                lhs = Expr::Like {
                    expr: Box::new(lhs),
                    pattern: Box::new(pattern),
                    negated,
                };
                input = rest;
            }
            Infix::In { negated } => {
                let (rest, list) = cut(context(
                    "IN list",
                    delimited(sym("("), separated_list1(sym(","), expr), sym(")")),
                ))(after)?;
                lhs = Expr::In { expr: Box::new(lhs), list, negated };
                input = rest;
            }
            Infix::Between { negated } => {
                let (rest, low) = cut(context("lower bound", |i| expr_bp(i, PREC_ADD)))(after)?;
                let (rest, _) = cut(context("AND", kw("AND")))(rest)?;
                let (rest, high) = cut(context("upper bound", |i| expr_bp(i, PREC_ADD)))(rest)?;
                lhs = Expr::Between {
                    expr: Box::new(lhs),
                    low: Box::new(low),
                    high: Box::new(high),
                    negated,
                };
                input = rest;
            }
        }
    }

    Ok((input, lhs))
}

fn prefix(input: &str) -> Res<'_, Expr> {
    if let Ok((rest, _)) = kw("NOT")(input) {
        let (rest, operand) = cut(context("operand", |i| expr_bp(i, PREC_NOT)))(rest)?;
        return Ok((rest, Expr::UnaryOp { op: UnaryOp::Not, expr: Box::new(operand) }));
    }
    if let Ok((rest, _)) = sym("-")(input) {
        let (rest, operand) = cut(context("operand", |i| expr_bp(i, PREC_UNARY)))(rest)?;
        let negated = match operand {
            Expr::Literal(Literal::Int(i)) => Expr::Literal(Literal::Int(-i)),
            Expr::Literal(Literal::Float(f)) => Expr::Literal(Literal::Float(-f)),
            other => Expr::UnaryOp { op: UnaryOp::Neg, expr: Box::new(other) },
        };
        return Ok((rest, negated));
    }
    context("expression", primary)(input)
}

fn infix(input: &str) -> Res<'_, Infix> {
    alt((
        value(Infix::Binary(BinaryOp::Or), kw("OR")),
        value(Infix::Binary(BinaryOp::And), kw("AND")),
        value(
            Infix::IsNull { negated: true },
            tuple((kw("IS"), kw("NOT"), cut(kw("NULL")))),
        ),
        value(Infix::IsNull { negated: false }, pair(kw("IS"), cut(kw("NULL")))),
        map(
            pair(
                opt(kw("NOT")),
                alt((
                    value(0u8, kw("LIKE")),
                    value(1u8, kw("IN")),
                    value(2u8, kw("BETWEEN")),
                )),
            ),
            |(not, which)| {
                let negated = not.is_some();
                match which {
                    0 => Infix::Like { negated },
                    1 => Infix::In { negated },
                    _ => Infix::Between { negated },
                }
            },
        ),
        preceded(
            sp,
            alt((
                value(Infix::Binary(BinaryOp::Le), tag("<=")),
                value(Infix::Binary(BinaryOp::Ge), tag(">=")),
                value(Infix::Binary(BinaryOp::Ne), alt((tag("<>"), tag("!=")))),
                value(Infix::Binary(BinaryOp::Concat), tag("||")),
                value(Infix::Binary(BinaryOp::Eq), tag("=")),
                value(Infix::Binary(BinaryOp::Lt), tag("<")),
                value(Infix::Binary(BinaryOp::Gt), tag(">")),
                value(Infix::Binary(BinaryOp::Add), tag("+")),
                value(Infix::Binary(BinaryOp::Sub), tag("-")),
                value(Infix::Binary(BinaryOp::Mul), tag("*")),
                value(Infix::Binary(BinaryOp::Div), tag("/")),
                value(Infix::Binary(BinaryOp::Mod), tag("%")),
            )),
        ),
    ))(input)
}

fn primary(input: &str) -> Res<'_, Expr> {
    alt((
        delimited(sym("("), cut(expr), cut(context("')'", sym(")")))),
        map(native_span, Expr::Native),
        map(literal, Expr::Literal),
        parameter,
        function_call,
        map(path, |parts| Expr::Column(ColumnRef { parts })),
    ))(input)
}

fn parameter(input: &str) -> Res<'_, Expr> {
    let (start, _) = sp(input)?;
    alt((
        map(char('?'), move |_| Expr::Parameter(Parameter::Positional(start.len()))),
        map(preceded(char(':'), cut(ident_token)), |name| {
            Expr::Parameter(Parameter::Named(name))
        }),
    ))(start)
}

fn function_call(input: &str) -> Res<'_, Expr> {
    let (input, name) = identifier(input)?;
    let (input, _) = sym("(")(input)?;

    if let Some(func) = AggregateFunc::from_name(&name) {
        if func == AggregateFunc::Count {
            if let Ok((rest, _)) = pair(sym("*"), sym(")"))(input) {
                return Ok((rest, Expr::Aggregate { func, arg: None, distinct: false }));
            }
        }
        let (input, distinct) = opt(kw("DISTINCT"))(input)?;
        let (input, arg) = cut(context("aggregate argument", expr))(input)?;
        let (input, _) = cut(context("')'", sym(")")))(input)?;
        return Ok((input, Expr::Aggregate {
            func,
            arg: Some(Box::new(arg)),
            distinct: distinct.is_some(),
        }));
    }

    let (input, args) = opt(separated_list1(sym(","), expr))(input)?;
    let (input, _) = cut(context("')'", sym(")")))(input)?;
    Ok((input, Expr::Function {
        name: name.to_ascii_uppercase(),
        args: args.unwrap_or_default(),
    }))
}

/// `$$ ... $$`; the closing marker is only recognized outside quoted strings
fn native_span(input: &str) -> Res<'_, NativeSpan> {
    let (body, _) = preceded(sp, tag("$$"))(input)?;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c == '\'' || c == '"' || c == '`' {
            quote = Some(c);
        } else if body[i..].starts_with("$$") {
            let span = NativeSpan {
                text: body[..i].to_string(),
                position: body.len(),
            };
            return Ok((&body[i + 2..], span));
        }
    }

    failure(input, "closing $$")
}

// ============================================================================
// Literals
// ============================================================================

fn literal(input: &str) -> Res<'_, Literal> {
    alt((
        value(Literal::Null, kw("NULL")),
        value(Literal::Bool(true), kw("TRUE")),
        value(Literal::Bool(false), kw("FALSE")),
        date_literal,
        timestamp_literal,
        preceded(sp, number_literal),
        map(preceded(sp, string_literal), Literal::String),
    ))(input)
}

fn number_literal(input: &str) -> Res<'_, Literal> {
    let scanned: Res<'_, &str> = recognize(tuple((
        digit1,
        opt(pair(char('.'), digit1)),
        opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
    )))(input);
    let (rest, text) = scanned?;

    let is_float = text.contains(|c| matches!(c, '.' | 'e' | 'E'));
    let lit = if is_float {
        Literal::Float(text.parse().unwrap_or(f64::NAN))
    } else {
        // Integers beyond i64 degrade to float rather than failing
        text.parse::<i64>()
            .map(Literal::Int)
            .unwrap_or_else(|_| Literal::Float(text.parse().unwrap_or(f64::INFINITY)))
    };
    Ok((rest, lit))
}

fn date_literal(input: &str) -> Res<'_, Literal> {
    let (input, _) = kw("DATE")(input)?;
    let (text_start, _) = sp(input)?;
    let (rest, text) = string_literal(text_start)?;
    match chrono::NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        Ok(date) => {
            let millis = date
                .and_hms_opt(0, 0, 0)
                .map(|dt| dt.and_utc().timestamp_millis())
                .unwrap_or_default();
            Ok((rest, Literal::DateTime(millis)))
        }
        Err(_) => failure(text_start, "date literal 'YYYY-MM-DD'"),
    }
}

fn timestamp_literal(input: &str) -> Res<'_, Literal> {
    let (input, _) = kw("TIMESTAMP")(input)?;
    let (text_start, _) = sp(input)?;
    let (rest, text) = string_literal(text_start)?;
    match parse_timestamp(&text) {
        Some(millis) => Ok((rest, Literal::DateTime(millis))),
        None => failure(text_start, "timestamp literal 'YYYY-MM-DD HH:MM:SS'"),
    }
}

/// RFC 3339, or a naive `YYYY-MM-DD[ T]HH:MM:SS[.fff]` taken as UTC
pub(crate) fn parse_timestamp(text: &str) -> Option<i64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|dt| dt.and_utc().timestamp_millis())
}

fn string_literal(input: &str) -> Res<'_, String> {
    alt((
        delimited(
            char('\''),
            map(
                many0(alt((
                    map(tag("''"), |_| "'".to_string()),
                    map(none_of("'"), |c| c.to_string()),
                ))),
                |v| v.join(""),
            ),
            cut(context("closing quote", char('\''))),
        ),
        delimited(
            char('"'),
            map(
                many0(alt((
                    map(tag("\\\""), |_| "\"".to_string()),
                    map(tag("\\n"), |_| "\n".to_string()),
                    map(tag("\\t"), |_| "\t".to_string()),
                    map(tag("\\\\"), |_| "\\".to_string()),
                    map(none_of("\"\\"), |c| c.to_string()),
                ))),
                |v| v.join(""),
            ),
            cut(context("closing quote", char('"'))),
        ),
    ))(input)
}
