use std::sync::Arc;

use crate::diagnostics::SourceSpan;

#[derive(Debug, Clone, Default)]
pub struct Program {
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Expr),
    Assign {
        targets: Vec<Expr>,
        value: Expr,
        span: SourceSpan,
    },
    AugAssign {
        target: Expr,
        op: BinaryOp,
        value: Expr,
        span: SourceSpan,
    },
    If {
        test: Expr,
        body: Vec<Stmt>,
        orelse: Vec<Stmt>,
        span: SourceSpan,
    },
    For {
        target: String,
        iter: Expr,
        body: Vec<Stmt>,
        span: SourceSpan,
    },
    While {
        test: Expr,
        body: Vec<Stmt>,
        span: SourceSpan,
    },
    FunctionDef(Arc<FunctionDef>),
    Return {
        value: Option<Expr>,
        span: SourceSpan,
    },
    Break(SourceSpan),
    Pass(SourceSpan),
    Try {
        body: Vec<Stmt>,
        handlers: Vec<ExceptHandler>,
        orelse: Vec<Stmt>,
        finalbody: Vec<Stmt>,
        span: SourceSpan,
    },
}

impl Stmt {
    pub fn span(&self) -> SourceSpan {
        match self {
            Stmt::Expr(e) => e.span(),
            Stmt::Assign { span, .. }
            | Stmt::AugAssign { span, .. }
            | Stmt::If { span, .. }
            | Stmt::For { span, .. }
            | Stmt::While { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Try { span, .. } => *span,
            Stmt::FunctionDef(def) => def.span,
            Stmt::Break(span) | Stmt::Pass(span) => *span,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExceptHandler {
    /// Exception class named in the clause; informational only.
    pub kind: Option<String>,
    pub alias: Option<String>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
    LShift,
    RShift,
    BitAnd,
    BitOr,
    BitXor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoolOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtE,
    Gt,
    GtE,
    In,
    NotIn,
    Is,
    IsNot,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Constant(Constant, SourceSpan),
    Name(String, SourceSpan),
    Attribute {
        value: Box<Expr>,
        attr: String,
        span: SourceSpan,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
        span: SourceSpan,
    },
    Slice {
        lower: Option<Box<Expr>>,
        upper: Option<Box<Expr>>,
        step: Option<Box<Expr>>,
        span: SourceSpan,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        span: SourceSpan,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
        span: SourceSpan,
    },
    Bool {
        op: BoolOp,
        values: Vec<Expr>,
        span: SourceSpan,
    },
    /// Chains parse fully, but only the first pair is evaluated.
    Compare {
        left: Box<Expr>,
        ops: Vec<CompareOp>,
        comparators: Vec<Expr>,
        span: SourceSpan,
    },
    IfExp {
        test: Box<Expr>,
        body: Box<Expr>,
        orelse: Box<Expr>,
        span: SourceSpan,
    },
    List(Vec<Expr>, SourceSpan),
    Tuple(Vec<Expr>, SourceSpan),
    Set(Vec<Expr>, SourceSpan),
    Dict(Vec<(Expr, Expr)>, SourceSpan),
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        kwargs: Vec<(String, Expr)>,
        span: SourceSpan,
    },
}

impl Expr {
    pub fn span(&self) -> SourceSpan {
        match self {
            Expr::Constant(_, s)
            | Expr::Name(_, s)
            | Expr::List(_, s)
            | Expr::Tuple(_, s)
            | Expr::Set(_, s)
            | Expr::Dict(_, s) => *s,
            Expr::Attribute { span, .. }
            | Expr::Subscript { span, .. }
            | Expr::Slice { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Bool { span, .. }
            | Expr::Compare { span, .. }
            | Expr::IfExp { span, .. }
            | Expr::Call { span, .. } => *span,
        }
    }

    /// Identifier named by a call target, used in error messages.
    pub fn callee_name(&self) -> String {
        match self {
            Expr::Name(n, _) => n.clone(),
            Expr::Attribute { attr, .. } => attr.clone(),
            _ => "<expression>".to_string(),
        }
    }
}
