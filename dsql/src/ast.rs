//! Abstract Syntax Tree for DSQL

use serde::{Deserialize, Serialize};
use std::fmt;

/// A complete DSQL statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    Select(SelectStmt),
    Insert(InsertStmt),
    Update(UpdateStmt),
    Delete(DeleteStmt),
    /// Shell-form command such as `db.users.find({...})`
    Native(NativeCommand),
}

/// SELECT statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectStmt {
    /// SELECT DISTINCT
    pub distinct: bool,
    /// Projected items (never empty)
    pub columns: Vec<SelectItem>,
    /// Collection to select from
    pub from: TableRef,
    /// JOIN clauses in source order
    pub joins: Vec<Join>,
    /// Optional WHERE clause
    pub where_clause: Option<Expr>,
    /// GROUP BY expressions
    pub group_by: Vec<Expr>,
    /// Optional HAVING clause
    pub having: Option<Expr>,
    /// ORDER BY clauses
    pub order_by: Vec<OrderBy>,
    /// LIMIT clause (integer literal or parameter)
    pub limit: Option<Expr>,
    /// OFFSET clause (integer literal or parameter)
    pub offset: Option<Expr>,
}

/// One item of the SELECT list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SelectItem {
    /// All columns (*)
    Star,
    /// Expression with optional alias
    Expr { expr: Expr, alias: Option<String> },
}

/// A collection reference with an optional alias
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    pub name: String,
    pub alias: Option<String>,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), alias: None }
    }

    /// The name columns are qualified with: the alias if any, else the collection name
    pub fn binding(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// JOIN clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Join {
    pub kind: JoinKind,
    pub table: TableRef,
    pub on: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// INSERT statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertStmt {
    /// Target collection
    pub into: String,
    /// Column names (dotted paths allowed)
    pub columns: Vec<String>,
    /// One entry per VALUES tuple
    pub rows: Vec<Vec<Expr>>,
}

/// UPDATE statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateStmt {
    /// Target collection
    pub collection: String,
    /// SET clauses
    pub set: Vec<SetClause>,
    /// WHERE clause
    pub where_clause: Option<Expr>,
}

/// SET clause in UPDATE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetClause {
    pub column: String,
    pub value: Expr,
}

/// DELETE statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteStmt {
    /// Target collection
    pub from: String,
    /// WHERE clause
    pub where_clause: Option<Expr>,
}

/// `db.<collection>.<method>(<args>)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeCommand {
    pub collection: String,
    pub method: String,
    /// Raw argument list text, without the surrounding parentheses
    pub args: NativeSpan,
    /// Chained cursor modifiers such as `.sort({...})` or `.limit(5)`
    pub modifiers: Vec<(String, NativeSpan)>,
}

/// Opaque native-language text captured from the statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeSpan {
    pub text: String,
    /// Byte offset of `text` in the statement
    pub position: usize,
}

/// A column reference, possibly qualified (`u.name`) or nested (`address.city`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    pub parts: Vec<String>,
}

impl ColumnRef {
    pub fn new(path: &str) -> Self {
        Self { parts: path.split('.').map(String::from).collect() }
    }

    pub fn path(&self) -> String {
        self.parts.join(".")
    }

    pub fn last(&self) -> &str {
        self.parts.last().map(String::as_str).unwrap_or_default()
    }
}

/// Query parameter placeholder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parameter {
    /// `?`, numbered from 1 in textual order
    Positional(usize),
    /// `:name`
    Named(String),
}

/// Expression in the SELECT list, WHERE, HAVING, ON, ORDER BY or SET
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    /// Literal value
    Literal(Literal),
    /// Column reference
    Column(ColumnRef),
    /// Bound parameter
    Parameter(Parameter),
    /// Binary operation
    BinaryOp {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    /// Unary operation
    UnaryOp {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    /// Scalar function call
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// Aggregate function call; `arg: None` is `COUNT(*)`
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
    },
    /// IN expression: expr IN (values...)
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    /// LIKE expression
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    /// IS NULL / IS NOT NULL
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    /// BETWEEN expression
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    /// Embedded native-language fragment (`$$ ... $$`)
    Native(NativeSpan),
}

/// Literal values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// DATE / TIMESTAMP literal as epoch milliseconds (UTC)
    DateTime(i64),
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    // Logical
    And,
    Or,
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    // String
    Concat,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(self, Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, Self::And | Self::Or)
    }

    /// The comparison with operands swapped (`a < b` is `b > a`)
    pub fn flipped(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Concat => "||",
        }
    }
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COUNT" => Some(Self::Count),
            "SUM" => Some(Self::Sum),
            "AVG" => Some(Self::Avg),
            "MIN" => Some(Self::Min),
            "MAX" => Some(Self::Max),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }
}

impl Expr {
    pub fn column(path: &str) -> Self {
        Expr::Column(ColumnRef::new(path))
    }

    /// True if an aggregate call appears anywhere in this expression
    pub fn contains_aggregate(&self) -> bool {
        let mut found = false;
        self.walk(&mut |e| {
            if matches!(e, Expr::Aggregate { .. }) {
                found = true;
            }
        });
        found
    }

    /// Pre-order traversal over this expression and its children
    pub fn walk<F: FnMut(&Expr)>(&self, f: &mut F) {
        f(self);
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.walk(f);
                right.walk(f);
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => expr.walk(f),
            Expr::Function { args, .. } => args.iter().for_each(|a| a.walk(f)),
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk(f);
                }
            }
            Expr::In { expr, list, .. } => {
                expr.walk(f);
                list.iter().for_each(|a| a.walk(f));
            }
            Expr::Like { expr, pattern, .. } => {
                expr.walk(f);
                pattern.walk(f);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.walk(f);
                low.walk(f);
                high.walk(f);
            }
            Expr::Literal(_) | Expr::Column(_) | Expr::Parameter(_) | Expr::Native(_) => {}
        }
    }

    pub(crate) fn walk_mut<F: FnMut(&mut Expr)>(&mut self, f: &mut F) {
        f(self);
        match self {
            Expr::BinaryOp { left, right, .. } => {
                left.walk_mut(f);
                right.walk_mut(f);
            }
            Expr::UnaryOp { expr, .. } | Expr::IsNull { expr, .. } => expr.walk_mut(f),
            Expr::Function { args, .. } => args.iter_mut().for_each(|a| a.walk_mut(f)),
            Expr::Aggregate { arg, .. } => {
                if let Some(arg) = arg {
                    arg.walk_mut(f);
                }
            }
            Expr::In { expr, list, .. } => {
                expr.walk_mut(f);
                list.iter_mut().for_each(|a| a.walk_mut(f));
            }
            Expr::Like { expr, pattern, .. } => {
                expr.walk_mut(f);
                pattern.walk_mut(f);
            }
            Expr::Between { expr, low, high, .. } => {
                expr.walk_mut(f);
                low.walk_mut(f);
                high.walk_mut(f);
            }
            Expr::Literal(_) | Expr::Column(_) | Expr::Parameter(_) | Expr::Native(_) => {}
        }
    }
}

impl SelectStmt {
    pub fn new(from: impl Into<String>) -> Self {
        Self {
            distinct: false,
            columns: vec![SelectItem::Star],
            from: TableRef::new(from),
            joins: vec![],
            where_clause: None,
            group_by: vec![],
            having: None,
            order_by: vec![],
            limit: None,
            offset: None,
        }
    }

    pub fn is_star(&self) -> bool {
        self.columns.iter().any(|c| matches!(c, SelectItem::Star))
    }
}

impl Statement {
    /// Visit every expression in textual clause order
    pub(crate) fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        let mut out: Vec<&mut Expr> = Vec::new();
        match self {
            Statement::Select(s) => {
                for item in &mut s.columns {
                    if let SelectItem::Expr { expr, .. } = item {
                        out.push(expr);
                    }
                }
                for join in &mut s.joins {
                    out.push(&mut join.on);
                }
                out.extend(s.where_clause.as_mut());
                out.extend(s.group_by.iter_mut());
                out.extend(s.having.as_mut());
                out.extend(s.order_by.iter_mut().map(|o| &mut o.expr));
                out.extend(s.limit.as_mut());
                out.extend(s.offset.as_mut());
            }
            Statement::Insert(i) => {
                for row in &mut i.rows {
                    out.extend(row.iter_mut());
                }
            }
            Statement::Update(u) => {
                out.extend(u.set.iter_mut().map(|s| &mut s.value));
                out.extend(u.where_clause.as_mut());
            }
            Statement::Delete(d) => out.extend(d.where_clause.as_mut()),
            Statement::Native(_) => {}
        }
        out
    }

    /// Number of positional (`?`) parameters in the statement
    pub fn positional_parameter_count(&self) -> usize {
        let mut max = 0;
        let mut stmt = self.clone();
        for expr in stmt.exprs_mut() {
            expr.walk(&mut |e| {
                if let Expr::Parameter(Parameter::Positional(i)) = e {
                    max = max.max(*i);
                }
            });
        }
        max
    }
}

// ============================================================================
// Display (used for column labels and diagnostics)
// ============================================================================

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "NULL"),
            Literal::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{:?}", v),
            Literal::String(s) => write!(f, "'{}'", s.replace('\'', "''")),
            Literal::DateTime(ms) => match chrono::DateTime::from_timestamp_millis(*ms) {
                Some(dt) => write!(f, "TIMESTAMP '{}'", dt.format("%Y-%m-%d %H:%M:%S%.3f")),
                None => write!(f, "TIMESTAMP {}", ms),
            },
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parameter::Positional(i) => write!(f, "?{}", i),
            Parameter::Named(n) => write!(f, ":{}", n),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(lit) => write!(f, "{}", lit),
            Expr::Column(col) => write!(f, "{}", col.path()),
            Expr::Parameter(p) => write!(f, "{}", p),
            Expr::BinaryOp { left, op, right } => write!(f, "{} {} {}", left, op.symbol(), right),
            Expr::UnaryOp { op: UnaryOp::Not, expr } => write!(f, "NOT {}", expr),
            Expr::UnaryOp { op: UnaryOp::Neg, expr } => write!(f, "-{}", expr),
            Expr::Function { name, args } => {
                write!(f, "{}(", name.to_ascii_uppercase())?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expr::Aggregate { func, arg, distinct } => {
                write!(f, "{}(", func.name())?;
                if *distinct {
                    write!(f, "DISTINCT ")?;
                }
                match arg {
                    Some(arg) => write!(f, "{})", arg),
                    None => write!(f, "*)"),
                }
            }
            Expr::In { expr, list, negated } => {
                write!(f, "{} {}IN (", expr, if *negated { "NOT " } else { "" })?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
            Expr::Like { expr, pattern, negated } => {
                write!(f, "{} {}LIKE {}", expr, if *negated { "NOT " } else { "" }, pattern)
            }
            Expr::IsNull { expr, negated } => {
                write!(f, "{} IS {}NULL", expr, if *negated { "NOT " } else { "" })
            }
            Expr::Between { expr, low, high, negated } => write!(
                f,
                "{} {}BETWEEN {} AND {}",
                expr,
                if *negated { "NOT " } else { "" },
                low,
                high
            ),
            Expr::Native(span) => write!(f, "$${}$$", span.text),
        }
    }
}
