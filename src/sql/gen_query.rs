//! Translation of relational statements into the sqlparser AST. Rendering
//! the string is then just `.to_string()`.

use anyhow::Result;
use itertools::Itertools;
use sqlparser::ast::{
    self as sql_ast, Ident, Join, JoinConstraint, JoinOperator, ObjectName, OrderByExpr, Select,
    SelectItem, SetExpr, TableAlias, TableFactor, TableWithJoins,
};

use super::gen_expr::{translate_ident, translate_value, Context};
use crate::ast::term::{From, JoinKind, Joined, OrderKey, Statement, Term, TermKind, Value};

pub(super) fn translate_statement(
    statement: &Statement,
    ctx: &mut Context<'_>,
) -> Result<sql_ast::Query> {
    let projection = if statement.projection.is_empty() {
        // SQL insists on at least one output column
        vec![SelectItem::UnnamedExpr(sql_ast::Expr::Value(
            sql_ast::Value::Number("1".to_string(), false),
        ))]
    } else {
        statement
            .projection
            .iter()
            .map(|projected| {
                let expr = translate_value(&projected.value, ctx)?;
                Ok(match &projected.name {
                    Some(name) => SelectItem::ExprWithAlias {
                        expr,
                        alias: translate_ident(name, ctx),
                    },
                    None => SelectItem::UnnamedExpr(expr),
                })
            })
            .collect::<Result<Vec<_>>>()?
    };

    let from = statement
        .from
        .as_ref()
        .map(|from| translate_from(from, ctx))
        .transpose()?
        .map_or_else(Vec::new, |from| vec![from]);

    let selection = statement
        .filters
        .iter()
        .map(|filter| translate_value(filter, ctx))
        .fold_ok(None, |acc: Option<sql_ast::Expr>, expr| {
            let expr = nest_for_and(expr);
            Some(match acc {
                None => expr,
                Some(acc) => sql_ast::Expr::BinaryOp {
                    left: Box::new(acc),
                    op: sql_ast::BinaryOperator::And,
                    right: Box::new(expr),
                },
            })
        })?;

    let group_by = statement
        .group_by
        .iter()
        .map(|value| translate_value(value, ctx))
        .try_collect()?;

    let order_by = statement
        .order
        .iter()
        .map(|key| translate_order_key(key, ctx))
        .try_collect()?;

    let use_top = ctx.dialect.use_top() && statement.offset.is_none();
    let top = statement.limit.filter(|_| use_top).map(|limit| sql_ast::Top {
        with_ties: false,
        percent: false,
        quantity: Some(sql_ast::Expr::Value(sql_ast::Value::Number(
            limit.to_string(),
            false,
        ))),
    });
    let limit = statement.limit.filter(|_| !use_top).map(|limit| {
        sql_ast::Expr::Value(sql_ast::Value::Number(limit.to_string(), false))
    });
    let offset = statement.offset.map(|offset| sql_ast::Offset {
        value: sql_ast::Expr::Value(sql_ast::Value::Number(offset.to_string(), false)),
        rows: sql_ast::OffsetRows::None,
    });

    Ok(sql_ast::Query {
        order_by,
        limit,
        offset,
        ..default_query(SetExpr::Select(Box::new(Select {
            top,
            projection,
            from,
            selection,
            group_by,
            ..default_select()
        })))
    })
}

fn translate_order_key(key: &OrderKey, ctx: &mut Context<'_>) -> Result<OrderByExpr> {
    let expr = translate_value(&key.value, ctx)?;
    let asc = if key.descending { Some(false) } else { None };
    // ascending puts nulls last, descending puts them first; emitted only
    // when the key can actually be null and the dialect has the syntax
    let nulls_first = (key.nullable && ctx.dialect.supports_nulls_ordering())
        .then_some(key.descending);
    Ok(OrderByExpr {
        expr,
        asc,
        nulls_first,
    })
}

fn translate_from(from: &From, ctx: &mut Context<'_>) -> Result<TableWithJoins> {
    let relation = translate_term(&from.first, ctx)?;
    let joins = from
        .joins
        .iter()
        .map(|joined| translate_join(joined, ctx))
        .try_collect()?;
    Ok(TableWithJoins { relation, joins })
}

fn translate_join(joined: &Joined, ctx: &mut Context<'_>) -> Result<Join> {
    let relation = translate_term(&joined.term, ctx)?;
    let join_operator = match joined.kind {
        JoinKind::Cross => JoinOperator::CrossJoin,
        JoinKind::Inner | JoinKind::Left => {
            let condition = join_condition(&joined.on, ctx)?;
            let constraint = JoinConstraint::On(condition);
            if joined.kind == JoinKind::Inner {
                JoinOperator::Inner(constraint)
            } else {
                JoinOperator::LeftOuter(constraint)
            }
        }
    };
    Ok(Join {
        relation,
        join_operator,
    })
}

fn join_condition(on: &[(Value, Value)], ctx: &mut Context<'_>) -> Result<sql_ast::Expr> {
    on.iter()
        .map(|(left, right)| -> Result<sql_ast::Expr> {
            Ok(sql_ast::Expr::BinaryOp {
                left: Box::new(translate_value(left, ctx)?),
                op: sql_ast::BinaryOperator::Eq,
                right: Box::new(translate_value(right, ctx)?),
            })
        })
        .fold_ok(None, |acc: Option<sql_ast::Expr>, expr| {
            Some(match acc {
                None => expr,
                Some(acc) => sql_ast::Expr::BinaryOp {
                    left: Box::new(acc),
                    op: sql_ast::BinaryOperator::And,
                    right: Box::new(expr),
                },
            })
        })?
        .ok_or_else(|| anyhow::anyhow!("a join needs at least one key equality"))
}

fn translate_term(term: &Term, ctx: &mut Context<'_>) -> Result<TableFactor> {
    Ok(match &term.kind {
        TermKind::Table { class, alias } => {
            let table = ctx.catalog.class(*class).name.clone();
            TableFactor::Table {
                name: ObjectName(vec![translate_ident(&table, ctx)]),
                alias: Some(simple_table_alias(Ident::new(alias.clone()))),
                args: None,
                with_hints: vec![],
            }
        }
        TermKind::Subquery { select, alias } => TableFactor::Derived {
            lateral: false,
            subquery: Box::new(translate_statement(select, ctx)?),
            alias: Some(simple_table_alias(Ident::new(alias.clone()))),
        },
    })
}

// an OR filter needs its own parentheses next to the ANDed siblings
fn nest_for_and(expr: sql_ast::Expr) -> sql_ast::Expr {
    match &expr {
        sql_ast::Expr::BinaryOp {
            op: sql_ast::BinaryOperator::Or,
            ..
        } => sql_ast::Expr::Nested(Box::new(expr)),
        _ => expr,
    }
}

fn simple_table_alias(name: Ident) -> TableAlias {
    TableAlias {
        name,
        columns: Vec::new(),
    }
}

fn default_query(body: sql_ast::SetExpr) -> sql_ast::Query {
    sql_ast::Query {
        with: None,
        body: Box::new(body),
        order_by: Vec::new(),
        limit: None,
        offset: None,
        fetch: None,
        locks: Vec::new(),
    }
}

fn default_select() -> Select {
    Select {
        distinct: None,
        top: None,
        projection: Vec::new(),
        into: None,
        from: Vec::new(),
        lateral_views: Vec::new(),
        selection: None,
        group_by: Vec::new(),
        cluster_by: Vec::new(),
        distribute_by: Vec::new(),
        sort_by: Vec::new(),
        having: None,
        named_window: Vec::new(),
        qualify: None,
    }
}
