//! Domain coercion: literal pinning, numeric widening, truth casts, and
//! operator overload resolution.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::ast::bound::{Expr, ExprKind};
use crate::ast::syntax::BinOp;
use crate::ast::{Literal, Op};
use crate::catalog::Domain;
use crate::error::{Error, Reason, Span};

static DECIMAL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)$").unwrap());
static DATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());
static TIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{1,2}:\d{2}(:\d{2}(\.\d+)?)?$").unwrap());
static DATETIME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}[ T]\d{1,2}:\d{2}(:\d{2}(\.\d+)?)?$").unwrap());

/// Numeric widening order: integer < decimal < float.
fn widen(a: &Domain, b: &Domain) -> Option<Domain> {
    use Domain::*;
    match (a, b) {
        (Float, _) | (_, Float) => Some(Float),
        (Decimal, _) | (_, Decimal) => Some(Decimal),
        (Integer, Integer) => Some(Integer),
        _ => None,
    }
}

/// The common domain two operands coerce to, if one exists.
pub fn unify(a: &Domain, b: &Domain) -> Option<Domain> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (Domain::Untyped, other) | (other, Domain::Untyped) if other.is_scalar() => {
            Some(other.clone())
        }
        _ if a.is_numeric() && b.is_numeric() => widen(a, b),
        _ => None,
    }
}

fn type_mismatch(expected: &Domain, found: &Domain, span: Span) -> Error {
    Error::new(Reason::TypeMismatch {
        expected: expected.to_string(),
        found: found.to_string(),
    })
    .with_span(Some(span))
}

fn bad_literal(domain: &Domain, text: &str, span: Span) -> Error {
    Error::new(Reason::BadLiteral {
        domain: domain.to_string(),
        text: text.to_string(),
    })
    .with_span(Some(span))
}

/// Pins an expression to a target domain: untyped literals are re-read in
/// the target domain, numeric operands widen, anything else needs an
/// explicit cast.
pub fn pin(expr: Expr, target: &Domain) -> Result<Expr, Error> {
    if &expr.domain == target {
        return Ok(expr);
    }

    // untyped literals take the domain of the context that consumes them
    if expr.domain == Domain::Untyped {
        if let ExprKind::Literal(literal) = &expr.kind {
            let pinned = match literal {
                Literal::Null => Some(Literal::Null),
                Literal::Text(text) => read_literal(text, target, expr.span)?,
                other => Some(other.clone()),
            };
            if let Some(literal) = pinned {
                return Ok(Expr {
                    kind: ExprKind::Literal(literal),
                    domain: target.clone(),
                    alias: expr.alias,
                    span: expr.span,
                });
            }
        }
        // e.g. a parameter: decided at execution time, cast in SQL
        return Ok(cast(expr, target.clone()));
    }

    if expr.domain.is_numeric() && target.is_numeric() {
        if widen(&expr.domain, target) == Some(target.clone()) {
            return Ok(cast(expr, target.clone()));
        }
    }

    Err(type_mismatch(target, &expr.domain, expr.span))
}

/// Re-reads an untyped literal's text in the given domain. `Ok(None)` means
/// the domain has no literal form and a runtime cast is needed instead.
fn read_literal(text: &str, target: &Domain, span: Span) -> Result<Option<Literal>, Error> {
    let literal = match target {
        Domain::Text | Domain::Untyped => Literal::Text(text.to_string()),
        Domain::Integer => text
            .parse::<i64>()
            .map(Literal::Integer)
            .map_err(|_| bad_literal(target, text, span))?,
        Domain::Decimal => {
            if DECIMAL_RE.is_match(text) {
                Literal::Decimal(text.to_string())
            } else {
                return Err(bad_literal(target, text, span));
            }
        }
        Domain::Float => text
            .parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| bad_literal(target, text, span))?,
        Domain::Boolean => match text {
            "true" => Literal::Boolean(true),
            "false" => Literal::Boolean(false),
            _ => return Err(bad_literal(target, text, span)),
        },
        Domain::Date => {
            if DATE_RE.is_match(text) {
                Literal::Date(text.to_string())
            } else {
                return Err(bad_literal(target, text, span));
            }
        }
        Domain::Time => {
            if TIME_RE.is_match(text) {
                Literal::Time(text.to_string())
            } else {
                return Err(bad_literal(target, text, span));
            }
        }
        Domain::DateTime => {
            if DATETIME_RE.is_match(text) {
                Literal::DateTime(text.to_string())
            } else {
                return Err(bad_literal(target, text, span));
            }
        }
        Domain::Enum(values) => {
            if values.iter().any(|v| v == text) {
                Literal::Text(text.to_string())
            } else {
                return Err(bad_literal(target, text, span));
            }
        }
        Domain::Opaque | Domain::Record | Domain::Void => return Ok(None),
    };
    Ok(Some(literal))
}

fn cast(expr: Expr, domain: Domain) -> Expr {
    let span = expr.span;
    Expr::new(
        ExprKind::Cast {
            expr: Box::new(expr),
            domain: domain.clone(),
        },
        domain,
        span,
    )
}

/// Coerces an expression into a logical context. The tri-valued semantics
/// of text truth (null and '' are false) live in the Truth node.
pub fn truth(expr: Expr) -> Result<Expr, Error> {
    if expr.domain == Domain::Boolean {
        return Ok(expr);
    }
    match (&expr.domain, &expr.kind) {
        (Domain::Untyped, ExprKind::Literal(Literal::Null)) => Ok(Expr {
            kind: ExprKind::Literal(Literal::Boolean(false)),
            domain: Domain::Boolean,
            alias: expr.alias,
            span: expr.span,
        }),
        (Domain::Untyped, ExprKind::Literal(Literal::Text(text))) => Ok(Expr {
            kind: ExprKind::Literal(Literal::Boolean(!text.is_empty())),
            domain: Domain::Boolean,
            alias: expr.alias,
            span: expr.span,
        }),
        (Domain::Text | Domain::Untyped, _) => {
            let span = expr.span;
            Ok(Expr::new(
                ExprKind::Truth {
                    expr: Box::new(expr),
                },
                Domain::Boolean,
                span,
            ))
        }
        _ => Err(type_mismatch(&Domain::Boolean, &expr.domain, expr.span)),
    }
}

fn formula(op: Op, args: Vec<Expr>, domain: Domain, span: Span) -> Expr {
    Expr::new(ExprKind::Formula { op, args }, domain, span)
}

/// Overload resolution for the binary operators.
pub fn binary(op: BinOp, left: Expr, right: Expr, span: Span) -> Result<Expr, Error> {
    use Domain::*;

    match op {
        BinOp::And | BinOp::Or => {
            let left = truth(left)?;
            let right = truth(right)?;
            let sem = if op == BinOp::And { Op::And } else { Op::Or };
            Ok(formula(sem, vec![left, right], Boolean, span))
        }

        BinOp::Eq | BinOp::Ne | BinOp::StrictEq | BinOp::StrictNe => {
            // x == null collapses into a null test
            if matches!(op, BinOp::StrictEq | BinOp::StrictNe) {
                let null_test = |operand: Expr| {
                    let test = formula(Op::IsNull, vec![operand], Boolean, span);
                    if op == BinOp::StrictNe {
                        formula(Op::Not, vec![test], Boolean, span)
                    } else {
                        test
                    }
                };
                if matches!(right.kind, ExprKind::Literal(Literal::Null)) {
                    return Ok(null_test(left));
                }
                if matches!(left.kind, ExprKind::Literal(Literal::Null)) {
                    return Ok(null_test(right));
                }
            }

            let (left, right) = equalize(left, right, span)?;
            let sem = match op {
                BinOp::Eq => Op::Eq,
                BinOp::Ne => Op::Ne,
                BinOp::StrictEq => Op::StrictEq,
                BinOp::StrictNe => Op::StrictNe,
                _ => unreachable!(),
            };
            Ok(formula(sem, vec![left, right], Boolean, span))
        }

        BinOp::Lt | BinOp::Lte | BinOp::Gt | BinOp::Gte => {
            let (left, right) = equalize(left, right, span)?;
            if !left.domain.is_orderable() {
                return Err(type_mismatch(&Text, &left.domain, span));
            }
            let sem = match op {
                BinOp::Lt => Op::Lt,
                BinOp::Lte => Op::Lte,
                BinOp::Gt => Op::Gt,
                BinOp::Gte => Op::Gte,
                _ => unreachable!(),
            };
            Ok(formula(sem, vec![left, right], Boolean, span))
        }

        BinOp::Contains | BinOp::NotContains => {
            let left = pin(left, &Text)?;
            let right = pin(right, &Text)?;
            let sem = if op == BinOp::Contains {
                Op::Contains
            } else {
                Op::NotContains
            };
            Ok(formula(sem, vec![left, right], Boolean, span))
        }

        BinOp::Add => match (&left.domain, &right.domain) {
            (Date, Integer | Untyped) => {
                let right = pin(right, &Integer)?;
                Ok(formula(Op::DateAdd, vec![left, right], Date, span))
            }
            (Integer | Untyped, Date) => {
                let left = pin(left, &Integer)?;
                Ok(formula(Op::DateAdd, vec![right, left], Date, span))
            }
            (Text, _) | (_, Text) | (Untyped, Untyped) => {
                let left = pin(left, &Text)?;
                let right = pin(right, &Text)?;
                Ok(formula(Op::Concat, vec![left, right], Text, span))
            }
            _ => arithmetic(Op::Add, left, right, span),
        },

        BinOp::Sub => match (&left.domain, &right.domain) {
            (Date, Date) => Ok(formula(Op::DateDiff, vec![left, right], Integer, span)),
            (Date, Integer | Untyped) => {
                let right = pin(right, &Integer)?;
                Ok(formula(Op::DateSub, vec![left, right], Date, span))
            }
            _ => arithmetic(Op::Sub, left, right, span),
        },

        BinOp::Mul => arithmetic(Op::Mul, left, right, span),

        BinOp::Div => {
            let (left, right) = equalize_numeric(left, right, span)?;
            // division is exact: integers promote to decimal
            let domain = if left.domain == Float { Float } else { Decimal };
            let left = if left.domain == Integer {
                cast(left, Decimal)
            } else {
                left
            };
            Ok(formula(Op::Div, vec![left, right], domain, span))
        }
    }
}

fn arithmetic(op: Op, left: Expr, right: Expr, span: Span) -> Result<Expr, Error> {
    let (left, right) = equalize_numeric(left, right, span)?;
    let domain = left.domain.clone();
    Ok(formula(op, vec![left, right], domain, span))
}

fn equalize_numeric(left: Expr, right: Expr, span: Span) -> Result<(Expr, Expr), Error> {
    let (left, right) = equalize(left, right, span)?;
    if !left.domain.is_numeric() {
        return Err(type_mismatch(&Domain::Integer, &left.domain, span));
    }
    Ok((left, right))
}

/// Brings both operands to a common domain, pinning untyped literals.
pub fn equalize(left: Expr, right: Expr, span: Span) -> Result<(Expr, Expr), Error> {
    let common = unify(&left.domain, &right.domain).ok_or_else(|| {
        Error::new(Reason::TypeMismatch {
            expected: left.domain.to_string(),
            found: right.domain.to_string(),
        })
        .with_span(Some(span))
    })?;
    let common = if common == Domain::Untyped {
        Domain::Text
    } else {
        common
    };
    Ok((pin(left, &common)?, pin(right, &common)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(literal: Literal, domain: Domain) -> Expr {
        Expr::new(
            ExprKind::Literal(literal),
            domain,
            Span { start: 0, end: 1 },
        )
    }

    fn untyped(text: &str) -> Expr {
        lit(Literal::Text(text.to_string()), Domain::Untyped)
    }

    #[test]
    fn test_untyped_literal_pins_to_context() {
        let pinned = pin(untyped("2010-04-15"), &Domain::Date).unwrap();
        assert_eq!(pinned.domain, Domain::Date);
        assert!(matches!(
            pinned.kind,
            ExprKind::Literal(Literal::Date(_))
        ));

        assert!(pin(untyped("2010-99-99x"), &Domain::Date).is_err());
        assert!(pin(untyped("abc"), &Domain::Integer).is_err());
    }

    #[test]
    fn test_numeric_widening() {
        assert_eq!(
            unify(&Domain::Integer, &Domain::Decimal),
            Some(Domain::Decimal)
        );
        assert_eq!(unify(&Domain::Decimal, &Domain::Float), Some(Domain::Float));
        assert_eq!(unify(&Domain::Text, &Domain::Integer), None);
    }

    #[test]
    fn test_division_is_decimal() {
        let division = binary(
            BinOp::Div,
            lit(Literal::Integer(1), Domain::Integer),
            lit(Literal::Integer(2), Domain::Integer),
            Span { start: 0, end: 3 },
        )
        .unwrap();
        assert_eq!(division.domain, Domain::Decimal);
    }

    #[test]
    fn test_string_plus_is_concat() {
        let concat = binary(
            BinOp::Add,
            lit(Literal::Text("a".into()), Domain::Text),
            untyped("b"),
            Span { start: 0, end: 3 },
        )
        .unwrap();
        assert!(matches!(
            concat.kind,
            ExprKind::Formula {
                op: Op::Concat,
                ..
            }
        ));
    }

    #[test]
    fn test_truth_folds_untyped_literals() {
        let truthy = truth(untyped("x")).unwrap();
        assert!(matches!(
            truthy.kind,
            ExprKind::Literal(Literal::Boolean(true))
        ));
        let falsy = truth(untyped("")).unwrap();
        assert!(matches!(
            falsy.kind,
            ExprKind::Literal(Literal::Boolean(false))
        ));
        assert!(truth(lit(Literal::Integer(1), Domain::Integer)).is_err());
    }

    #[test]
    fn test_strict_equality_with_null() {
        let test = binary(
            BinOp::StrictEq,
            lit(Literal::Text("a".into()), Domain::Text),
            lit(Literal::Null, Domain::Untyped),
            Span { start: 0, end: 3 },
        )
        .unwrap();
        assert!(matches!(
            test.kind,
            ExprKind::Formula { op: Op::IsNull, .. }
        ));
    }

    #[test]
    fn test_enum_literal_pinning() {
        let degree = Domain::Enum(vec!["ba".into(), "ms".into()]);
        assert!(pin(untyped("ba"), &degree).is_ok());
        assert!(pin(untyped("xx"), &degree).is_err());
    }
}
