//! Untyped syntax tree produced by the parser.

use std::fmt::{self, Display, Formatter, Write};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

use super::{Direction, Literal};
use crate::error::Span;

/// The root of a parsed query: `/segment/:format`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub segment: Option<Expr>,
    pub format: Option<String>,
    #[serde(skip)]
    pub span: Span,
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        self.segment == other.segment && self.format == other.format
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expr {
    pub kind: ExprKind,
    #[serde(skip)]
    pub span: Span,
}

// Structural equality, spans ignored.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum ExprKind {
    Literal(Literal),
    /// Identifier, lowered for lookup; the span still covers the original
    /// spelling.
    Ident(String),
    /// `$name`
    Reference(String),
    /// `*` or `*N`
    Wildcard(Option<u32>),
    /// `^`
    Complement,
    /// `( test )`
    Group(Box<Expr>),
    Call(Call),
    Unary {
        op: UnOp,
        expr: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `left . right`
    Compose {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// `base ? predicate`
    Sieve {
        base: Box<Expr>,
        predicate: Box<Expr>,
    },
    /// `base { elements }`; without a base, a selection over the current flow.
    Selection {
        base: Option<Box<Expr>>,
        elements: Vec<Expr>,
    },
    /// `base ^ kernel`
    Projection {
        base: Box<Expr>,
        kernel: Box<Expr>,
    },
    /// `seed -> target`
    Link {
        seed: Box<Expr>,
        target: Box<Expr>,
    },
    /// `target := value`
    Assign {
        target: Box<Expr>,
        value: Box<Expr>,
    },
    /// `expr +` / `expr -`
    Direction {
        expr: Box<Expr>,
        direction: Direction,
    },
    /// `/sub` inside a selection.
    Nested(Box<Expr>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub name: String,
    #[serde(skip)]
    pub name_span: Span,
    pub args: Vec<Expr>,
}

// Structural equality, spans ignored.
impl PartialEq for Call {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.args == other.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Not,
    Neg,
    Pos,
}

impl UnOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            UnOp::Not => "!",
            UnOp::Neg => "-",
            UnOp::Pos => "+",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Lte,
    Gt,
    Gte,
    Contains,
    NotContains,
    Add,
    Sub,
    Mul,
    Div,
}

impl BinOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Or => "|",
            BinOp::And => "&",
            BinOp::Eq => "=",
            BinOp::Ne => "!=",
            BinOp::StrictEq => "==",
            BinOp::StrictNe => "!==",
            BinOp::Lt => "<",
            BinOp::Lte => "<=",
            BinOp::Gt => ">",
            BinOp::Gte => ">=",
            BinOp::Contains => "~",
            BinOp::NotContains => "!~",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
        }
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_char('/')?;
        if let Some(segment) = &self.segment {
            write!(f, "{segment}")?;
        }
        if let Some(format) = &self.format {
            write!(f, "/:{format}")?;
        }
        Ok(())
    }
}

// The printer leans on the parse tree being precedence-correct: parentheses
// are printed only for explicit Group nodes, so print∘parse∘print is stable.
impl Display for Expr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ExprKind::Literal(literal) => write!(f, "{literal}"),
            ExprKind::Ident(name) => f.write_str(name),
            ExprKind::Reference(name) => write!(f, "${name}"),
            ExprKind::Wildcard(None) => f.write_char('*'),
            ExprKind::Wildcard(Some(n)) => write!(f, "*{n}"),
            ExprKind::Complement => f.write_char('^'),
            ExprKind::Group(inner) => write!(f, "({inner})"),
            ExprKind::Call(call) => {
                f.write_str(&call.name)?;
                f.write_char('(')?;
                for (i, arg) in call.args.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_char(')')
            }
            ExprKind::Unary { op, expr } => write!(f, "{}{expr}", op.symbol()),
            ExprKind::Binary { op, left, right } => {
                write!(f, "{left}{}{right}", op.symbol())
            }
            ExprKind::Compose { left, right } => write!(f, "{left}.{right}"),
            ExprKind::Sieve { base, predicate } => write!(f, "{base}?{predicate}"),
            ExprKind::Selection { base, elements } => {
                if let Some(base) = base {
                    write!(f, "{base}")?;
                }
                f.write_char('{')?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_char(',')?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_char('}')
            }
            ExprKind::Projection { base, kernel } => write!(f, "{base}^{kernel}"),
            ExprKind::Link { seed, target } => write!(f, "{seed}->{target}"),
            ExprKind::Assign { target, value } => write!(f, "{target}:={value}"),
            ExprKind::Direction { expr, direction } => {
                let suffix = match direction {
                    Direction::Asc => '+',
                    Direction::Desc => '-',
                };
                write!(f, "{expr}{suffix}")
            }
            ExprKind::Nested(inner) => write!(f, "/{inner}"),
        }
    }
}
