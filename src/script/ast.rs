//! Syntax tree for the shell script subset

use crate::native::NativeValue;

#[derive(Debug, Clone, PartialEq)]
pub enum Placeholder {
    Named(String),
    Positional(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Lt,
    Le,
    Gt,
    Ge,
    LooseEq,
    LooseNe,
    StrictEq,
    StrictNe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Set,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(NativeValue),
    Ident(String),
    Param(Placeholder),
    /// Keys keep source order
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    Regex { pattern: String, flags: String },
    Member { object: Box<Expr>, property: String },
    Index { object: Box<Expr>, index: Box<Expr> },
    /// Call of a global constructor or function (`new` is accepted and ignored)
    Call { callee: String, args: Vec<Expr> },
    MethodCall { object: Box<Expr>, method: String, args: Vec<Expr> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Conditional { test: Box<Expr>, then: Box<Expr>, otherwise: Box<Expr> },
    Assign { target: Box<Expr>, op: AssignOp, value: Box<Expr> },
    Update { target: Box<Expr>, delta: i8, prefix: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Expr(Expr),
    Declare(Vec<(String, Option<Expr>)>),
    If { test: Expr, then: Box<Stmt>, otherwise: Option<Box<Stmt>> },
    While { test: Expr, body: Box<Stmt> },
    For {
        init: Option<Box<Stmt>>,
        test: Option<Expr>,
        update: Option<Expr>,
        body: Box<Stmt>,
    },
    Block(Vec<Stmt>),
    Break,
    Continue,
    Empty,
}

/// A parsed fragment
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub body: Vec<Stmt>,
}

impl Expr {
    /// Assignable shapes: `x`, `x.y`, `x[i]`
    pub fn is_target(&self) -> bool {
        match self {
            Expr::Ident(_) => true,
            Expr::Member { object, .. } | Expr::Index { object, .. } => object.is_target(),
            _ => false,
        }
    }
}
