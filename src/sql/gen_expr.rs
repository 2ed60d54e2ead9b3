//! Translation of term values into sqlparser expressions.

use anyhow::Result;
use itertools::Itertools;
use sqlparser::ast::{
    self as sql_ast, BinaryOperator, DataType, DateTimeField, ExactNumberInfo, Function,
    FunctionArg, FunctionArgExpr, Ident, ObjectName, TimezoneInfo, UnaryOperator,
    Value as SqlValue,
};

use super::dialect::DialectHandler;
use crate::ast::term::{Value, ValueKind};
use crate::ast::{AggFunc, Literal, Op};
use crate::catalog::Domain;

pub(super) struct Context<'a> {
    pub dialect: Box<dyn DialectHandler>,
    pub catalog: &'a crate::catalog::Catalog,
    /// Bound parameters in order of first appearance.
    pub parameters: Vec<(String, Domain)>,
}

fn is_plain(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Identifiers are quoted only when the plain spelling would not survive
/// the backend's case folding.
pub(super) fn translate_ident(name: &str, ctx: &Context<'_>) -> Ident {
    if is_plain(name) {
        Ident::new(name)
    } else {
        Ident::with_quote(ctx.dialect.ident_quote(), name)
    }
}

fn function(name: &str, args: Vec<sql_ast::Expr>) -> sql_ast::Expr {
    sql_ast::Expr::Function(Function {
        name: ObjectName(vec![Ident::new(name)]),
        args: args
            .into_iter()
            .map(FunctionArgExpr::Expr)
            .map(FunctionArg::Unnamed)
            .collect(),
        over: None,
        distinct: false,
        special: false,
        order_by: vec![],
    })
}

fn niladic(name: &str) -> sql_ast::Expr {
    sql_ast::Expr::Function(Function {
        name: ObjectName(vec![Ident::new(name)]),
        args: vec![],
        over: None,
        distinct: false,
        special: true,
        order_by: vec![],
    })
}

fn number(text: impl ToString) -> sql_ast::Expr {
    sql_ast::Expr::Value(SqlValue::Number(text.to_string(), false))
}

fn text_literal(text: &str) -> sql_ast::Expr {
    sql_ast::Expr::Value(SqlValue::SingleQuotedString(text.to_string()))
}

pub(super) fn translate_value(value: &Value, ctx: &mut Context<'_>) -> Result<sql_ast::Expr> {
    Ok(match &value.kind {
        ValueKind::Column { table, column } => sql_ast::Expr::CompoundIdentifier(vec![
            Ident::new(table.clone()),
            translate_ident(column, ctx),
        ]),

        ValueKind::Literal(literal) => translate_literal(literal, ctx),

        ValueKind::Parameter { name, domain } => {
            let placeholder = if ctx.dialect.numbered_placeholders() {
                let position = match ctx.parameters.iter().position(|(n, _)| n == name) {
                    Some(position) => position + 1,
                    None => {
                        ctx.parameters.push((name.clone(), domain.clone()));
                        ctx.parameters.len()
                    }
                };
                format!("${position}")
            } else {
                ctx.parameters.push((name.clone(), domain.clone()));
                "?".to_string()
            };
            sql_ast::Expr::Value(SqlValue::Placeholder(placeholder))
        }

        ValueKind::Operation { op, args } => translate_operation(*op, args, ctx)?,

        ValueKind::Case {
            branches,
            otherwise,
        } => {
            let conditions = branches
                .iter()
                .map(|(condition, _)| translate_value(condition, ctx))
                .try_collect()?;
            let results = branches
                .iter()
                .map(|(_, result)| translate_value(result, ctx))
                .try_collect()?;
            let else_result = otherwise
                .as_ref()
                .map(|value| translate_value(value, ctx))
                .transpose()?
                .map(Box::new);
            sql_ast::Expr::Case {
                operand: None,
                conditions,
                results,
                else_result,
            }
        }

        ValueKind::Cast { value, domain } => sql_ast::Expr::Cast {
            expr: Box::new(translate_value(value, ctx)?),
            data_type: translate_domain(domain),
        },

        ValueKind::Truth { value } => {
            // null and '' are false, anything else is true
            let operand = translate_value(value, ctx)?;
            let not_null = sql_ast::Expr::IsNotNull(Box::new(operand.clone()));
            let not_empty = sql_ast::Expr::BinaryOp {
                left: Box::new(operand),
                op: BinaryOperator::NotEq,
                right: Box::new(text_literal("")),
            };
            sql_ast::Expr::BinaryOp {
                left: Box::new(not_null),
                op: BinaryOperator::And,
                right: Box::new(not_empty),
            }
        }

        ValueKind::Aggregate {
            func,
            distinct,
            arg,
        } => translate_aggregate(*func, *distinct, arg.as_deref(), ctx)?,

        ValueKind::Subquery(statement) => sql_ast::Expr::Subquery(Box::new(
            super::gen_query::translate_statement(statement, ctx)?,
        )),
    })
}

fn translate_literal(literal: &Literal, ctx: &Context<'_>) -> sql_ast::Expr {
    match literal {
        Literal::Null => sql_ast::Expr::Value(SqlValue::Null),
        Literal::Boolean(b) => ctx.dialect.bool_literal(*b),
        Literal::Integer(i) => number(i),
        Literal::Decimal(text) => number(text),
        Literal::Float(f) => number(format!("{f:?}")),
        Literal::Text(text) => text_literal(text),
        Literal::Date(text) => typed_literal(DataType::Date, text, ctx),
        Literal::Time(text) => {
            typed_literal(DataType::Time(None, TimezoneInfo::None), text, ctx)
        }
        Literal::DateTime(text) => {
            typed_literal(DataType::Timestamp(None, TimezoneInfo::None), text, ctx)
        }
    }
}

fn typed_literal(data_type: DataType, text: &str, ctx: &Context<'_>) -> sql_ast::Expr {
    if ctx.dialect.typed_date_literals() {
        sql_ast::Expr::TypedString {
            data_type,
            value: text.to_string(),
        }
    } else {
        text_literal(text)
    }
}

pub(super) fn translate_domain(domain: &Domain) -> DataType {
    match domain {
        Domain::Boolean => DataType::Boolean,
        Domain::Integer => DataType::Integer(None),
        Domain::Decimal => DataType::Decimal(ExactNumberInfo::None),
        Domain::Float => DataType::DoublePrecision,
        Domain::Date => DataType::Date,
        Domain::Time => DataType::Time(None, TimezoneInfo::None),
        Domain::DateTime => DataType::Timestamp(None, TimezoneInfo::None),
        Domain::Untyped
        | Domain::Text
        | Domain::Enum(_)
        | Domain::Opaque
        | Domain::Record
        | Domain::Void => DataType::Text,
    }
}

fn translate_operation(op: Op, args: &[Value], ctx: &mut Context<'_>) -> Result<sql_ast::Expr> {
    use Op::*;

    Ok(match op {
        And | Or => {
            let operator = if op == And {
                BinaryOperator::And
            } else {
                BinaryOperator::Or
            };
            translate_binary(&args[0], operator, &args[1], ctx)?
        }

        Not => {
            // `!is_null(x)` reads better as IS NOT NULL
            if let [Value {
                kind: ValueKind::Operation {
                    op: IsNull,
                    args: inner,
                },
                ..
            }] = args
            {
                let operand = translate_operand(&inner[0], 5, ctx)?;
                return Ok(sql_ast::Expr::IsNotNull(Box::new(operand)));
            }
            let operand = translate_operand(&args[0], UnaryOperator::Not.binding_strength(), ctx)?;
            sql_ast::Expr::UnaryOp {
                op: UnaryOperator::Not,
                expr: Box::new(operand),
            }
        }

        Eq => translate_binary(&args[0], BinaryOperator::Eq, &args[1], ctx)?,
        Ne => translate_binary(&args[0], BinaryOperator::NotEq, &args[1], ctx)?,
        Lt => translate_binary(&args[0], BinaryOperator::Lt, &args[1], ctx)?,
        Lte => translate_binary(&args[0], BinaryOperator::LtEq, &args[1], ctx)?,
        Gt => translate_binary(&args[0], BinaryOperator::Gt, &args[1], ctx)?,
        Gte => translate_binary(&args[0], BinaryOperator::GtEq, &args[1], ctx)?,

        StrictEq | StrictNe => {
            let left = translate_value(&args[0], ctx)?;
            let right = translate_value(&args[1], ctx)?;
            if ctx.dialect.has_is_distinct_from() {
                if op == StrictEq {
                    sql_ast::Expr::IsNotDistinctFrom(Box::new(left), Box::new(right))
                } else {
                    sql_ast::Expr::IsDistinctFrom(Box::new(left), Box::new(right))
                }
            } else {
                let strict = strict_equality(left, right);
                if op == StrictEq {
                    strict
                } else {
                    sql_ast::Expr::UnaryOp {
                        op: UnaryOperator::Not,
                        expr: Box::new(sql_ast::Expr::Nested(Box::new(strict))),
                    }
                }
            }
        }

        Contains | NotContains => translate_contains(op == NotContains, args, ctx)?,

        Add => translate_binary(&args[0], BinaryOperator::Plus, &args[1], ctx)?,
        Sub => translate_binary(&args[0], BinaryOperator::Minus, &args[1], ctx)?,
        Mul => translate_binary(&args[0], BinaryOperator::Multiply, &args[1], ctx)?,
        Div => translate_binary(&args[0], BinaryOperator::Divide, &args[1], ctx)?,
        DateAdd => translate_binary(&args[0], BinaryOperator::Plus, &args[1], ctx)?,
        DateSub | DateDiff => {
            translate_binary(&args[0], BinaryOperator::Minus, &args[1], ctx)?
        }

        Neg => {
            let operand =
                translate_operand(&args[0], UnaryOperator::Minus.binding_strength(), ctx)?;
            sql_ast::Expr::UnaryOp {
                op: UnaryOperator::Minus,
                expr: Box::new(operand),
            }
        }

        Concat => {
            let parts = collect_concat(args)
                .into_iter()
                .map(|part| {
                    let expr = translate_value(part, ctx)?;
                    // a null operand acts as the empty string
                    Ok(function("COALESCE", vec![expr, text_literal("")]))
                })
                .collect::<Result<Vec<_>>>()?;
            if ctx.dialect.has_concat_function() {
                function("CONCAT", parts)
            } else {
                parts
                    .into_iter()
                    .reduce(|left, right| sql_ast::Expr::BinaryOp {
                        left: Box::new(left),
                        op: BinaryOperator::StringConcat,
                        right: Box::new(right),
                    })
                    .expect("concat always has operands")
            }
        }

        Length => function("CHAR_LENGTH", vec![translate_value(&args[0], ctx)?]),
        Upper => function("UPPER", vec![translate_value(&args[0], ctx)?]),
        Lower => function("LOWER", vec![translate_value(&args[0], ctx)?]),
        Trim => function("TRIM", vec![translate_value(&args[0], ctx)?]),
        Ltrim => function("LTRIM", vec![translate_value(&args[0], ctx)?]),
        Rtrim => function("RTRIM", vec![translate_value(&args[0], ctx)?]),
        Replace => function(
            "REPLACE",
            args.iter()
                .map(|arg| translate_value(arg, ctx))
                .try_collect()?,
        ),
        Round | RoundTo => function(
            "ROUND",
            args.iter()
                .map(|arg| translate_value(arg, ctx))
                .try_collect()?,
        ),

        Head => {
            let text = translate_value(&args[0], ctx)?;
            let count = match args.get(1) {
                Some(count) => translate_value(count, ctx)?,
                None => number(1),
            };
            substring(text, number(1), Some(count))
        }
        Tail => {
            let text = translate_value(&args[0], ctx)?;
            let count = match args.get(1) {
                Some(count) => translate_value(count, ctx)?,
                None => number(1),
            };
            // from CHAR_LENGTH(s) - n + 1 to the end
            let from = sql_ast::Expr::BinaryOp {
                left: Box::new(sql_ast::Expr::BinaryOp {
                    left: Box::new(function("CHAR_LENGTH", vec![text.clone()])),
                    op: BinaryOperator::Minus,
                    right: Box::new(nested_if_weaker(count, 11)),
                }),
                op: BinaryOperator::Plus,
                right: Box::new(number(1)),
            };
            substring(text, from, None)
        }
        Slice => {
            let text = translate_value(&args[0], ctx)?;
            let from = translate_value(&args[1], ctx)?;
            let until = translate_value(&args[2], ctx)?;
            // zero-based [from, until)
            let start = sql_ast::Expr::BinaryOp {
                left: Box::new(nested_if_weaker(from.clone(), 10)),
                op: BinaryOperator::Plus,
                right: Box::new(number(1)),
            };
            let length = sql_ast::Expr::BinaryOp {
                left: Box::new(nested_if_weaker(until, 10)),
                op: BinaryOperator::Minus,
                right: Box::new(nested_if_weaker(from, 11)),
            };
            substring(text, start, Some(length))
        }
        At => {
            let text = translate_value(&args[0], ctx)?;
            let index = translate_value(&args[1], ctx)?;
            let count = match args.get(2) {
                Some(count) => translate_value(count, ctx)?,
                None => number(1),
            };
            let start = sql_ast::Expr::BinaryOp {
                left: Box::new(nested_if_weaker(index, 10)),
                op: BinaryOperator::Plus,
                right: Box::new(number(1)),
            };
            substring(text, start, Some(count))
        }

        IfNull => function(
            "COALESCE",
            args.iter()
                .map(|arg| translate_value(arg, ctx))
                .try_collect()?,
        ),
        NullIf => function(
            "NULLIF",
            args.iter()
                .map(|arg| translate_value(arg, ctx))
                .try_collect()?,
        ),
        IsNull => {
            let operand = translate_operand(&args[0], 5, ctx)?;
            sql_ast::Expr::IsNull(Box::new(operand))
        }

        Today => niladic("CURRENT_DATE"),
        Now => niladic("CURRENT_TIMESTAMP"),

        Year => extract(DateTimeField::Year, &args[0], ctx)?,
        Month => extract(DateTimeField::Month, &args[0], ctx)?,
        Day => extract(DateTimeField::Day, &args[0], ctx)?,
        Hour => extract(DateTimeField::Hour, &args[0], ctx)?,
        Minute => extract(DateTimeField::Minute, &args[0], ctx)?,
        Second => extract(DateTimeField::Second, &args[0], ctx)?,
    })
}

fn substring(
    text: sql_ast::Expr,
    from: sql_ast::Expr,
    length: Option<sql_ast::Expr>,
) -> sql_ast::Expr {
    sql_ast::Expr::Substring {
        expr: Box::new(text),
        substring_from: Some(Box::new(from)),
        substring_for: length.map(Box::new),
    }
}

fn extract(field: DateTimeField, arg: &Value, ctx: &mut Context<'_>) -> Result<sql_ast::Expr> {
    Ok(sql_ast::Expr::Extract {
        field,
        expr: Box::new(translate_value(arg, ctx)?),
    })
}

/// `null == null` is true, `v == null` is false.
fn strict_equality(left: sql_ast::Expr, right: sql_ast::Expr) -> sql_ast::Expr {
    let either_null = sql_ast::Expr::BinaryOp {
        left: Box::new(sql_ast::Expr::IsNull(Box::new(left.clone()))),
        op: BinaryOperator::Or,
        right: Box::new(sql_ast::Expr::IsNull(Box::new(right.clone()))),
    };
    let both_null = sql_ast::Expr::BinaryOp {
        left: Box::new(sql_ast::Expr::IsNull(Box::new(left.clone()))),
        op: BinaryOperator::And,
        right: Box::new(sql_ast::Expr::IsNull(Box::new(right.clone()))),
    };
    let plain = sql_ast::Expr::BinaryOp {
        left: Box::new(left),
        op: BinaryOperator::Eq,
        right: Box::new(right),
    };
    sql_ast::Expr::Case {
        operand: None,
        conditions: vec![either_null],
        results: vec![both_null],
        else_result: Some(Box::new(plain)),
    }
}

/// Case-insensitive substring containment.
fn translate_contains(
    negated: bool,
    args: &[Value],
    ctx: &mut Context<'_>,
) -> Result<sql_ast::Expr> {
    let target = translate_operand(&args[0], 8, ctx)?;

    // literal needles turn into a plain pattern; anything else is wrapped
    // in `%` at execution time
    let (pattern, escape_char) = match &args[1].kind {
        ValueKind::Literal(Literal::Text(needle)) => {
            let escaped = needle
                .replace('\\', "\\\\")
                .replace('%', "\\%")
                .replace('_', "\\_");
            let lowered = if ctx.dialect.has_ilike() {
                escaped
            } else {
                escaped.to_lowercase()
            };
            let has_escapes = lowered.contains('\\');
            (
                text_literal(&format!("%{lowered}%")),
                has_escapes.then_some('\\'),
            )
        }
        _ => {
            let needle = translate_value(&args[1], ctx)?;
            let needle = if ctx.dialect.has_ilike() {
                needle
            } else {
                function("LOWER", vec![needle])
            };
            let wrapped = sql_ast::Expr::BinaryOp {
                left: Box::new(sql_ast::Expr::BinaryOp {
                    left: Box::new(text_literal("%")),
                    op: BinaryOperator::StringConcat,
                    right: Box::new(needle),
                }),
                op: BinaryOperator::StringConcat,
                right: Box::new(text_literal("%")),
            };
            (wrapped, None)
        }
    };

    Ok(if ctx.dialect.has_ilike() {
        sql_ast::Expr::ILike {
            negated,
            expr: Box::new(target),
            pattern: Box::new(pattern),
            escape_char,
        }
    } else {
        sql_ast::Expr::Like {
            negated,
            expr: Box::new(function("LOWER", vec![target])),
            pattern: Box::new(pattern),
            escape_char,
        }
    })
}

fn translate_aggregate(
    func: AggFunc,
    distinct: bool,
    arg: Option<&Value>,
    ctx: &mut Context<'_>,
) -> Result<sql_ast::Expr> {
    let name = match func {
        AggFunc::Count | AggFunc::Exists => "COUNT",
        AggFunc::Sum => "SUM",
        AggFunc::Avg => "AVG",
        AggFunc::Min => "MIN",
        AggFunc::Max => "MAX",
        AggFunc::Every => "MIN",
    };

    let args = match (func, arg) {
        (AggFunc::Every, Some(predicate)) => {
            // MIN over 1/0 is the conjunction
            let case = sql_ast::Expr::Case {
                operand: None,
                conditions: vec![translate_value(predicate, ctx)?],
                results: vec![number(1)],
                else_result: Some(Box::new(number(0))),
            };
            vec![FunctionArg::Unnamed(FunctionArgExpr::Expr(case))]
        }
        (_, Some(arg)) => vec![FunctionArg::Unnamed(FunctionArgExpr::Expr(
            translate_value(arg, ctx)?,
        ))],
        (_, None) => vec![FunctionArg::Unnamed(FunctionArgExpr::Wildcard)],
    };

    Ok(sql_ast::Expr::Function(Function {
        name: ObjectName(vec![Ident::new(name)]),
        args,
        over: None,
        distinct,
        special: false,
        order_by: vec![],
    }))
}

fn collect_concat(args: &[Value]) -> Vec<&Value> {
    let mut parts = Vec::new();
    for arg in args {
        match &arg.kind {
            ValueKind::Operation {
                op: Op::Concat,
                args,
            } => parts.extend(collect_concat(args)),
            _ => parts.push(arg),
        }
    }
    parts
}

fn translate_binary(
    left: &Value,
    op: BinaryOperator,
    right: &Value,
    ctx: &mut Context<'_>,
) -> Result<sql_ast::Expr> {
    let strength = op.binding_strength();
    let left_assoc = matches!(
        op,
        BinaryOperator::Minus | BinaryOperator::Divide | BinaryOperator::Modulo
    );
    let left = translate_operand(left, strength, ctx)?;
    let right = translate_operand(right, strength + i32::from(left_assoc), ctx)?;
    Ok(sql_ast::Expr::BinaryOp {
        left: Box::new(left),
        op,
        right: Box::new(right),
    })
}

fn translate_operand(
    value: &Value,
    min_strength: i32,
    ctx: &mut Context<'_>,
) -> Result<sql_ast::Expr> {
    Ok(nested_if_weaker(translate_value(value, ctx)?, min_strength))
}

fn nested_if_weaker(expr: sql_ast::Expr, min_strength: i32) -> sql_ast::Expr {
    if expr.binding_strength() < min_strength {
        sql_ast::Expr::Nested(Box::new(expr))
    } else {
        expr
    }
}

trait SQLExpression {
    /// Higher binds tighter.
    fn binding_strength(&self) -> i32;
}

impl SQLExpression for sql_ast::Expr {
    fn binding_strength(&self) -> i32 {
        match self {
            sql_ast::Expr::BinaryOp { op, .. } => op.binding_strength(),
            sql_ast::Expr::UnaryOp { op, .. } => op.binding_strength(),
            sql_ast::Expr::Like { .. } | sql_ast::Expr::ILike { .. } => 7,
            sql_ast::Expr::IsNull(_)
            | sql_ast::Expr::IsNotNull(_)
            | sql_ast::Expr::IsDistinctFrom(_, _)
            | sql_ast::Expr::IsNotDistinctFrom(_, _) => 5,
            sql_ast::Expr::Case { .. } => 20,
            // all other items bind stronger (function calls, literals, ...)
            _ => 20,
        }
    }
}

impl SQLExpression for BinaryOperator {
    fn binding_strength(&self) -> i32 {
        use BinaryOperator::*;
        match self {
            Modulo | Multiply | Divide => 11,
            Minus | Plus => 10,
            Gt | Lt | GtEq | LtEq | Eq | NotEq => 6,
            And => 3,
            Or => 2,
            _ => 9,
        }
    }
}

impl SQLExpression for UnaryOperator {
    fn binding_strength(&self) -> i32 {
        match self {
            UnaryOperator::Minus | UnaryOperator::Plus => 13,
            UnaryOperator::Not => 4,
            _ => 9,
        }
    }
}
