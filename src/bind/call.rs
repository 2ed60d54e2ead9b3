//! Scalar function signatures and overload selection.
//!
//! Each entry pairs a domain signature with the operation the SQL writer
//! eventually renders; resolution is a single deterministic match, with
//! untyped literals pinned by the parameter they land in.

use super::coerce;
use crate::ast::bound::{Expr, ExprKind};
use crate::ast::Op;
use crate::catalog::Domain;
use crate::error::{Error, Reason, Span};

fn formula(op: Op, args: Vec<Expr>, domain: Domain, span: Span) -> Expr {
    Expr::new(ExprKind::Formula { op, args }, domain, span)
}

fn arity(name: &str, args: &[Expr], min: usize, max: usize, span: Span) -> Result<(), Error> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{min} argument(s)")
        } else {
            format!("{min} to {max} arguments")
        };
        return Err(Error::new(Reason::Expected {
            who: Some(format!("`{name}`")),
            expected,
            found: format!("{}", args.len()),
        })
        .with_span(Some(span)));
    }
    Ok(())
}

fn numeric(expr: Expr) -> Result<Expr, Error> {
    if expr.domain.is_numeric() {
        return Ok(expr);
    }
    if expr.domain == Domain::Untyped {
        return coerce::pin(expr, &Domain::Decimal);
    }
    Err(Error::new(Reason::TypeMismatch {
        expected: Domain::Decimal.to_string(),
        found: expr.domain.to_string(),
    })
    .with_span(Some(expr.span)))
}

fn temporal(name: &str, expr: Expr, allowed: &[Domain]) -> Result<Expr, Error> {
    if allowed.contains(&expr.domain) {
        return Ok(expr);
    }
    if expr.domain == Domain::Untyped {
        return coerce::pin(expr, &allowed[0]);
    }
    Err(Error::new(Reason::TypeMismatch {
        expected: format!("a {} argument for `{name}`", allowed[0]),
        found: expr.domain.to_string(),
    })
    .with_span(Some(expr.span)))
}

/// Binds a call to one of the scalar built-ins. Returns `None` when the name
/// is not in the table.
pub(super) fn scalar(
    name: &str,
    mut args: Vec<Expr>,
    span: Span,
) -> Option<Result<Expr, Error>> {
    let result = match name {
        "length" => arity(name, &args, 1, 1, span).and_then(|_| {
            let text = coerce::pin(args.remove(0), &Domain::Text)?;
            Ok(formula(Op::Length, vec![text], Domain::Integer, span))
        }),

        "upper" | "lower" | "trim" | "ltrim" | "rtrim" => {
            arity(name, &args, 1, 1, span).and_then(|_| {
                let op = match name {
                    "upper" => Op::Upper,
                    "lower" => Op::Lower,
                    "trim" => Op::Trim,
                    "ltrim" => Op::Ltrim,
                    _ => Op::Rtrim,
                };
                let text = coerce::pin(args.remove(0), &Domain::Text)?;
                Ok(formula(op, vec![text], Domain::Text, span))
            })
        }

        "replace" => arity(name, &args, 3, 3, span).and_then(|_| {
            let with = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            let what = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            let text = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            Ok(formula(
                Op::Replace,
                vec![text, what, with],
                Domain::Text,
                span,
            ))
        }),

        "round" => arity(name, &args, 1, 2, span).and_then(|_| {
            let digits = if args.len() == 2 {
                Some(coerce::pin(args.pop().unwrap(), &Domain::Integer)?)
            } else {
                None
            };
            let value = numeric(args.pop().unwrap())?;
            let domain = value.domain.clone();
            Ok(match digits {
                Some(digits) => formula(Op::RoundTo, vec![value, digits], domain, span),
                None => formula(Op::Round, vec![value], domain, span),
            })
        }),

        "head" | "tail" => arity(name, &args, 1, 2, span).and_then(|_| {
            let op = if name == "head" { Op::Head } else { Op::Tail };
            let count = if args.len() == 2 {
                Some(coerce::pin(args.pop().unwrap(), &Domain::Integer)?)
            } else {
                None
            };
            let text = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            let mut all = vec![text];
            all.extend(count);
            Ok(formula(op, all, Domain::Text, span))
        }),

        "slice" => arity(name, &args, 3, 3, span).and_then(|_| {
            let until = coerce::pin(args.pop().unwrap(), &Domain::Integer)?;
            let from = coerce::pin(args.pop().unwrap(), &Domain::Integer)?;
            let text = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            Ok(formula(
                Op::Slice,
                vec![text, from, until],
                Domain::Text,
                span,
            ))
        }),

        "at" => arity(name, &args, 2, 3, span).and_then(|_| {
            let count = if args.len() == 3 {
                Some(coerce::pin(args.pop().unwrap(), &Domain::Integer)?)
            } else {
                None
            };
            let index = coerce::pin(args.pop().unwrap(), &Domain::Integer)?;
            let text = coerce::pin(args.pop().unwrap(), &Domain::Text)?;
            let mut all = vec![text, index];
            all.extend(count);
            Ok(formula(Op::At, all, Domain::Text, span))
        }),

        "if_null" | "null_if" => arity(name, &args, 2, 2, span).and_then(|_| {
            let right = args.pop().unwrap();
            let left = args.pop().unwrap();
            let (left, right) = coerce::equalize(left, right, span)?;
            let domain = left.domain.clone();
            let op = if name == "if_null" {
                Op::IfNull
            } else {
                Op::NullIf
            };
            Ok(formula(op, vec![left, right], domain, span))
        }),

        "is_null" => arity(name, &args, 1, 1, span).and_then(|_| {
            let value = args.pop().unwrap();
            if !value.domain.is_scalar() {
                return Err(Error::new(Reason::TypeMismatch {
                    expected: "a scalar value".to_string(),
                    found: value.domain.to_string(),
                })
                .with_span(Some(value.span)));
            }
            Ok(formula(Op::IsNull, vec![value], Domain::Boolean, span))
        }),

        "year" | "month" | "day" => arity(name, &args, 1, 1, span).and_then(|_| {
            let op = match name {
                "year" => Op::Year,
                "month" => Op::Month,
                _ => Op::Day,
            };
            let value = temporal(name, args.remove(0), &[Domain::Date, Domain::DateTime])?;
            Ok(formula(op, vec![value], Domain::Integer, span))
        }),

        "hour" | "minute" | "second" => arity(name, &args, 1, 1, span).and_then(|_| {
            let op = match name {
                "hour" => Op::Hour,
                "minute" => Op::Minute,
                _ => Op::Second,
            };
            let value = temporal(name, args.remove(0), &[Domain::Time, Domain::DateTime])?;
            Ok(formula(op, vec![value], Domain::Integer, span))
        }),

        _ => return None,
    };
    Some(result)
}
