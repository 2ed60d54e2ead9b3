//! Intermediate representations of the compiler pipeline.
//!
//! Each stage consumes the previous stage's tree and produces a richer one:
//! [syntax] (parser) → [bound] (binder) → [flow] (encoder) → [term]
//! (assembler). Source spans travel through every stage.

pub mod bound;
pub mod flow;
pub mod syntax;
pub mod term;

use std::fmt::{self, Display, Formatter};

use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};

/// A literal value. The scanner only produces numbers and text; the other
/// variants appear once the binder pins an untyped literal to a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EnumAsInner)]
pub enum Literal {
    Null,
    Boolean(bool),
    Integer(i64),
    /// Kept as written so exact decimals survive into the SQL text.
    Decimal(String),
    Float(f64),
    Text(String),
    Date(String),
    Time(String),
    DateTime(String),
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null()"),
            Literal::Boolean(true) => write!(f, "true()"),
            Literal::Boolean(false) => write!(f, "false()"),
            Literal::Integer(i) => write!(f, "{i}"),
            Literal::Decimal(d) => write!(f, "{d}"),
            Literal::Float(v) => write!(f, "{v:e}"),
            Literal::Text(s) | Literal::Date(s) | Literal::Time(s) | Literal::DateTime(s) => {
                write!(f, "'{}'", s.replace('\'', "''"))
            }
        }
    }
}

/// Sort direction suffix (`+` / `-`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Asc,
    Desc,
}

/// Aggregate functions: plural in, singular out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggFunc {
    Count,
    Exists,
    Every,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggFunc {
    pub fn name(&self) -> &'static str {
        match self {
            AggFunc::Count => "count",
            AggFunc::Exists => "exists",
            AggFunc::Every => "every",
            AggFunc::Sum => "sum",
            AggFunc::Avg => "avg",
            AggFunc::Min => "min",
            AggFunc::Max => "max",
        }
    }
}

/// Scalar operations shared by the bound tree, the flow tree, and the SQL
/// writer. Overload resolution picks one of these plus operand coercions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    And,
    Or,
    Not,
    /// Null-regular equality.
    Eq,
    Ne,
    /// Null-strict equality: `null == null` is true.
    StrictEq,
    StrictNe,
    Lt,
    Lte,
    Gt,
    Gte,
    /// Case-insensitive substring containment.
    Contains,
    NotContains,
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    /// Null-coalescing text concatenation.
    Concat,
    DateAdd,
    DateSub,
    DateDiff,
    Length,
    Upper,
    Lower,
    Trim,
    Ltrim,
    Rtrim,
    Replace,
    Round,
    RoundTo,
    Head,
    Tail,
    Slice,
    At,
    IfNull,
    NullIf,
    IsNull,
    Today,
    Now,
    Year,
    Month,
    Day,
    Hour,
    Minute,
    Second,
}
