//! Assembler: flow tree → relational statements.
//!
//! Chooses join shapes (inner for total links, left outer for partial
//! ones), turns each aggregate unit into a grouped subquery joined on the
//! enclosing flow's key, injects the primary-key ordering fallback, and
//! emits one statement per nesting level, correlated by shared ordering
//! prefixes.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use itertools::Itertools;

use crate::ast::flow::{
    AggregateCode, Code, CodeKind, Flow, FlowId, FlowKind, KernelPart, Query, Segment,
};
use crate::ast::term::{
    From, Joined, JoinKind, OrderKey, Projected, Statement, Term, TermKind, Value, ValueKind,
};
use crate::ast::{AggFunc, Direction, Literal, Op};
use crate::catalog::{Catalog, ClassId};
use crate::error::{Error, Reason, Span};
use crate::utils::sql_name;

pub fn assemble(query: &Query, catalog: &Catalog) -> anyhow::Result<Vec<Statement>> {
    let mut assembler = Assembler {
        catalog,
        tables: 0,
        quotients: 0,
        units: 0,
        wrappers: 0,
    };
    let mut statements = Vec::new();
    assembler.build_segment(&query.segment, &mut statements)?;
    log::debug!("assembled {} statement(s)", statements.len());
    Ok(statements)
}

struct Assembler<'a> {
    catalog: &'a Catalog,
    tables: usize,
    quotients: usize,
    units: usize,
    wrappers: usize,
}

/// Routing for one flow: the relational alias its rows live under, and the
/// column renames a wrapping subquery introduced.
#[derive(Debug, Clone)]
struct Route {
    alias: String,
    class: Option<ClassId>,
    columns: Option<Rc<BTreeMap<String, String>>>,
}

impl Route {
    fn column(&self, name: &str) -> String {
        match &self.columns {
            Some(map) => map.get(name).cloned().unwrap_or_else(|| name.to_string()),
            None => name.to_string(),
        }
    }
}

#[derive(Debug)]
struct UnitSlot {
    join_index: usize,
    alias: String,
    columns: usize,
    routes: BTreeMap<FlowId, Route>,
    kernel_cols: BTreeMap<FlowId, Vec<String>>,
}

/// Per-statement build state.
#[derive(Debug, Default)]
struct Frame {
    routes: BTreeMap<FlowId, Route>,
    kernel_cols: BTreeMap<FlowId, Vec<String>>,
    from: Option<From>,
    filters: Vec<Value>,
    user_sorts: Vec<(Code, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    units: BTreeMap<(usize, usize), UnitSlot>,
    in_unit: bool,
}

impl Frame {
    fn new() -> Frame {
        Frame::default()
    }

    fn unit() -> Frame {
        Frame {
            in_unit: true,
            ..Frame::default()
        }
    }
}

fn col(table: &str, column: String, span: Span) -> Value {
    Value::new(
        ValueKind::Column {
            table: table.to_string(),
            column,
        },
        span,
    )
}

fn operation(op: Op, args: Vec<Value>, span: Span) -> Value {
    Value::new(ValueKind::Operation { op, args }, span)
}

fn integer(value: i64, span: Span) -> Value {
    Value::new(ValueKind::Literal(Literal::Integer(value)), span)
}

impl<'a> Assembler<'a> {
    fn table_alias(&mut self) -> String {
        self.tables += 1;
        format!("t{}", self.tables)
    }

    fn quotient_alias(&mut self) -> String {
        self.quotients += 1;
        format!("q{}", self.quotients)
    }

    fn unit_alias(&mut self) -> String {
        self.units += 1;
        format!("u{}", self.units)
    }

    fn wrapper_alias(&mut self) -> String {
        self.wrappers += 1;
        format!("w{}", self.wrappers)
    }

    fn build_segment(
        &mut self,
        segment: &Segment,
        out: &mut Vec<Statement>,
    ) -> Result<(), Error> {
        self.tables = 0;
        self.quotients = 0;
        self.units = 0;
        self.wrappers = 0;

        let mut frame = Frame::new();
        self.ensure(&mut frame, &segment.flow)?;

        let mut projection = Vec::new();
        let mut children = Vec::new();
        for item in &segment.items {
            match item {
                crate::ast::flow::OutputItem::Column { title, code } => {
                    let value = self.value(&mut frame, code)?;
                    let name = title.clone().or_else(|| self.derived_name(code));
                    projection.push(Projected { name, value });
                }
                crate::ast::flow::OutputItem::Nested { segment, .. } => {
                    children.push(segment);
                }
            }
        }

        let order = self.order_keys(&mut frame, &segment.flow)?;

        out.push(Statement {
            from: frame.from,
            projection,
            filters: frame.filters,
            group_by: Vec::new(),
            order,
            limit: frame.limit,
            offset: frame.offset,
            span: segment.span,
        });

        for child in children {
            self.build_segment(child, out)?;
        }
        Ok(())
    }

    fn derived_name(&self, code: &Code) -> Option<String> {
        match &code.kind {
            CodeKind::Column { flow, attribute } => {
                let class = flow.class?;
                Some(self.catalog.attributes(class)[*attribute].name.clone())
            }
            CodeKind::Kernel { quotient, index } => match &quotient.kind {
                FlowKind::Quotient { kernel, .. } => kernel[*index].name.clone(),
                _ => None,
            },
            CodeKind::Cast { code, .. } => self.derived_name(code),
            _ => None,
        }
    }

    fn attach(
        &mut self,
        frame: &mut Frame,
        term: Term,
        kind: JoinKind,
        on: Vec<(Value, Value)>,
    ) {
        match &mut frame.from {
            None => {
                frame.from = Some(From {
                    first: term,
                    joins: Vec::new(),
                });
                // correlated attachment: the left sides live in an
                // enclosing statement
                for (left, right) in on {
                    let span = left.span;
                    frame
                        .filters
                        .push(operation(Op::Eq, vec![left, right], span));
                }
            }
            Some(from) => from.joins.push(Joined { term, kind, on }),
        }
    }

    fn ensure(&mut self, frame: &mut Frame, flow: &Rc<Flow>) -> Result<(), Error> {
        if frame.routes.contains_key(&flow.id) {
            return Ok(());
        }
        let span = flow.span;

        match &flow.kind {
            FlowKind::Root => {
                frame.routes.insert(
                    flow.id,
                    Route {
                        alias: String::new(),
                        class: None,
                        columns: None,
                    },
                );
            }

            FlowKind::Class { base, class } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                let alias = self.table_alias();
                let kind = if frame.from.is_some() {
                    JoinKind::Cross
                } else {
                    JoinKind::Inner
                };
                self.attach(
                    frame,
                    Term {
                        kind: TermKind::Table {
                            class: *class,
                            alias: alias.clone(),
                        },
                    },
                    kind,
                    Vec::new(),
                );
                frame.routes.insert(
                    flow.id,
                    Route {
                        alias,
                        class: Some(*class),
                        columns: None,
                    },
                );
            }

            FlowKind::Traverse { base, link } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                let link = self.catalog.link(*link);
                let origin_route = frame.routes.get(&base.id).unwrap().clone();
                let alias = self.table_alias();

                let on = link
                    .origin_columns
                    .iter()
                    .zip(&link.target_columns)
                    .map(|(o, t)| {
                        let origin_name = &self.catalog.attributes(link.origin)[*o].name;
                        let target_name = &self.catalog.attributes(link.target)[*t].name;
                        (
                            col(&origin_route.alias, origin_route.column(origin_name), span),
                            col(&alias, target_name.clone(), span),
                        )
                    })
                    .collect_vec();

                let kind = if link.singular && !link.total {
                    JoinKind::Left
                } else {
                    JoinKind::Inner
                };
                self.attach(
                    frame,
                    Term {
                        kind: TermKind::Table {
                            class: link.target,
                            alias: alias.clone(),
                        },
                    },
                    kind,
                    on,
                );
                frame.routes.insert(
                    flow.id,
                    Route {
                        alias,
                        class: Some(link.target),
                        columns: None,
                    },
                );
            }

            FlowKind::Sieve { base, predicate } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                let predicate = self.value(frame, predicate)?;
                frame.filters.push(predicate);
                let route = frame.routes.get(&base.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }

            FlowKind::Sort { base, keys } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                for (position, key) in keys.iter().enumerate() {
                    frame
                        .user_sorts
                        .insert(position, (key.code.clone(), key.direction));
                }
                let route = frame.routes.get(&base.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }

            FlowKind::Slice {
                base,
                limit,
                offset,
            } => {
                self.ensure(frame, base)?;
                if frame.limit.is_some() {
                    self.wrap(frame, base)?;
                }
                frame.limit = *limit;
                frame.offset = *offset;
                let route = frame.routes.get(&base.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }

            FlowKind::Quotient { base, kernel } => {
                if frame.in_unit {
                    return Err(Error::new_simple(
                        "a projection inside an aggregate must be the aggregated flow itself",
                    )
                    .with_span(Some(span)));
                }
                let (statement, names) = self.quotient_statement(base, kernel, span)?;
                let alias = self.quotient_alias();
                let kind = if frame.from.is_some() {
                    JoinKind::Cross
                } else {
                    JoinKind::Inner
                };
                self.attach(
                    frame,
                    Term {
                        kind: TermKind::Subquery {
                            select: Box::new(statement),
                            alias: alias.clone(),
                        },
                    },
                    kind,
                    Vec::new(),
                );
                frame.kernel_cols.insert(flow.id, names);
                frame.routes.insert(
                    flow.id,
                    Route {
                        alias,
                        class: None,
                        columns: None,
                    },
                );
            }

            FlowKind::Complement { quotient } => {
                self.ensure(frame, quotient)?;
                let FlowKind::Quotient { base, kernel } = &quotient.kind else {
                    unreachable!("complements always hang off quotients");
                };
                // a fresh instance of the base flow, rejoined on the kernel
                self.ensure(frame, base)?;
                let quotient_route = frame.routes.get(&quotient.id).unwrap().clone();
                let names = frame.kernel_cols.get(&quotient.id).unwrap().clone();
                for (part, name) in kernel.iter().zip(names) {
                    let left = self.value(frame, &part.code)?;
                    let right = col(&quotient_route.alias, name, span);
                    frame.filters.push(operation(Op::Eq, vec![left, right], span));
                }
                let route = frame.routes.get(&base.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }

            FlowKind::Linked {
                base,
                seeds,
                target,
                counterparts,
            } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                self.ensure(frame, target)?;
                for (seed, counterpart) in seeds.iter().zip(counterparts) {
                    let left = self.value(frame, seed)?;
                    let right = self.value(frame, counterpart)?;
                    frame.filters.push(operation(Op::Eq, vec![left, right], span));
                }
                let route = frame.routes.get(&target.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }

            FlowKind::Forked {
                base,
                mirror,
                left,
                right,
            } => {
                self.ensure(frame, base)?;
                self.wrap_if_sliced(frame, base)?;
                self.ensure(frame, mirror)?;
                for (l, r) in left.iter().zip(right) {
                    let l = self.value(frame, l)?;
                    let r = self.value(frame, r)?;
                    frame.filters.push(operation(Op::Eq, vec![l, r], span));
                }
                let route = frame.routes.get(&mirror.id).unwrap().clone();
                frame.routes.insert(flow.id, route);
            }
        }
        Ok(())
    }

    /// The grouped subquery for a projection: distinct non-null kernel
    /// tuples over the base flow.
    fn quotient_statement(
        &mut self,
        base: &Rc<Flow>,
        kernel: &[KernelPart],
        span: Span,
    ) -> Result<(Statement, Vec<String>), Error> {
        let mut sub = Frame::new();
        self.ensure(&mut sub, base)?;

        let mut names = Vec::new();
        let mut projection = Vec::new();
        let mut group_by = Vec::new();
        for (index, part) in kernel.iter().enumerate() {
            let value = self.value(&mut sub, &part.code)?;
            let name = part
                .name
                .as_deref()
                .and_then(sql_name)
                .filter(|n| !names.contains(n))
                .unwrap_or_else(|| format!("k{index}"));
            sub.filters.push(operation(
                Op::Not,
                vec![operation(Op::IsNull, vec![value.clone()], part.code.span)],
                part.code.span,
            ));
            projection.push(Projected {
                name: Some(name.clone()),
                value: value.clone(),
            });
            group_by.push(value);
            names.push(name);
        }

        Ok((
            Statement {
                from: sub.from,
                projection,
                filters: sub.filters,
                group_by,
                order: Vec::new(),
                limit: None,
                offset: None,
                span,
            },
            names,
        ))
    }

    fn wrap_if_sliced(&mut self, frame: &mut Frame, upto: &Rc<Flow>) -> Result<(), Error> {
        if frame.limit.is_some() || frame.offset.is_some() {
            self.wrap(frame, upto)?;
        }
        Ok(())
    }

    /// Closes the statement built so far into a derived subquery, so later
    /// joins and filters apply to the sliced rows. All routed columns are
    /// re-exported under disambiguated names.
    fn wrap(&mut self, frame: &mut Frame, upto: &Rc<Flow>) -> Result<(), Error> {
        let order = self.order_keys(frame, upto)?;
        let alias = self.wrapper_alias();

        let mut projection = Vec::new();
        let mut projected_aliases = BTreeSet::new();
        let mut rename_per_alias: BTreeMap<(String, usize), Rc<BTreeMap<String, String>>> =
            BTreeMap::new();

        let mut new_routes = BTreeMap::new();
        let mut new_kernels = BTreeMap::new();

        for (id, route) in &frame.routes {
            if route.alias.is_empty() {
                new_routes.insert(*id, route.clone());
                continue;
            }

            if let Some(cols) = frame.kernel_cols.get(id) {
                let mut new_cols = Vec::new();
                for name in cols {
                    let out = format!("{}_{}", route.alias, name);
                    if projected_aliases.insert(out.clone()) {
                        projection.push(Projected {
                            name: Some(out.clone()),
                            value: col(&route.alias, name.clone(), upto.span),
                        });
                    }
                    new_cols.push(out);
                }
                new_kernels.insert(*id, new_cols);
                new_routes.insert(
                    *id,
                    Route {
                        alias: alias.clone(),
                        class: None,
                        columns: None,
                    },
                );
                continue;
            }

            let Some(class) = route.class else {
                new_routes.insert(*id, route.clone());
                continue;
            };
            let renames = rename_per_alias
                .entry((route.alias.clone(), class.0))
                .or_insert_with(|| {
                    let mut map = BTreeMap::new();
                    for attribute in self.catalog.attributes(class) {
                        let actual = route.column(&attribute.name);
                        let out = format!("{}_{}", route.alias, actual);
                        map.insert(attribute.name.clone(), out);
                    }
                    Rc::new(map)
                })
                .clone();
            for attribute in self.catalog.attributes(class) {
                let out = renames.get(&attribute.name).unwrap().clone();
                if projected_aliases.insert(out.clone()) {
                    projection.push(Projected {
                        name: Some(out),
                        value: col(&route.alias, route.column(&attribute.name), upto.span),
                    });
                }
            }
            new_routes.insert(
                *id,
                Route {
                    alias: alias.clone(),
                    class: Some(class),
                    columns: Some(renames),
                },
            );
        }

        let inner = Statement {
            from: frame.from.take(),
            projection,
            filters: std::mem::take(&mut frame.filters),
            group_by: Vec::new(),
            order,
            limit: frame.limit.take(),
            offset: frame.offset.take(),
            span: upto.span,
        };

        frame.from = Some(From {
            first: Term {
                kind: TermKind::Subquery {
                    select: Box::new(inner),
                    alias,
                },
            },
            joins: Vec::new(),
        });
        frame.routes = new_routes;
        frame.kernel_cols = new_kernels;
        frame.units.clear();
        Ok(())
    }

    /// Default ordering keys of a flow: enclosing keys first, then the
    /// flow's own primary key (kernel for projections).
    fn default_keys(&self, flow: &Rc<Flow>) -> Vec<Code> {
        let pk_of = |node: &Rc<Flow>, class: ClassId| -> Vec<Code> {
            self.catalog
                .primary_key(class)
                .iter()
                .map(|index| {
                    let attribute = &self.catalog.attributes(class)[*index];
                    Code {
                        kind: CodeKind::Column {
                            flow: node.clone(),
                            attribute: *index,
                        },
                        domain: attribute.domain.clone(),
                        nullable: attribute.nullable,
                        span: node.span,
                    }
                })
                .collect()
        };

        match &flow.kind {
            FlowKind::Root => Vec::new(),
            FlowKind::Class { base, class } => {
                let mut keys = self.default_keys(base);
                keys.extend(pk_of(flow, *class));
                keys
            }
            FlowKind::Traverse { base, link } => {
                let mut keys = self.default_keys(base);
                let link = self.catalog.link(*link);
                if link.is_plural() {
                    keys.extend(pk_of(flow, link.target));
                }
                keys
            }
            FlowKind::Sieve { base, .. }
            | FlowKind::Sort { base, .. }
            | FlowKind::Slice { base, .. } => self.default_keys(base),
            // kernel references, routed through the quotient's alias
            FlowKind::Quotient { kernel, .. } => kernel
                .iter()
                .enumerate()
                .map(|(index, part)| Code {
                    kind: CodeKind::Kernel {
                        quotient: flow.clone(),
                        index,
                    },
                    domain: part.code.domain.clone(),
                    nullable: false,
                    span: flow.span,
                })
                .collect(),
            FlowKind::Complement { quotient } => {
                let mut keys = self.default_keys(quotient);
                if let Some(class) = flow.class {
                    keys.extend(pk_of(flow, class));
                }
                keys
            }
            FlowKind::Linked { base, .. } | FlowKind::Forked { base, .. } => {
                let mut keys = self.default_keys(base);
                if let Some(class) = flow.class {
                    keys.extend(pk_of(flow, class));
                }
                keys
            }
        }
    }

    /// Final ORDER BY: user sort keys, then the primary-key fallback,
    /// deduplicated.
    fn order_keys(&mut self, frame: &mut Frame, flow: &Rc<Flow>) -> Result<Vec<OrderKey>, Error> {
        let mut keys: Vec<OrderKey> = Vec::new();
        let user = frame.user_sorts.clone();
        for (code, direction) in &user {
            let value = self.value(frame, code)?;
            if keys.iter().any(|k| k.value == value) {
                continue;
            }
            keys.push(OrderKey {
                value,
                descending: *direction == Direction::Desc,
                nullable: code.nullable,
            });
        }
        for code in self.default_keys(flow) {
            let value = self.value(frame, &code)?;
            if keys.iter().any(|k| k.value == value) {
                continue;
            }
            keys.push(OrderKey {
                value,
                descending: false,
                nullable: code.nullable,
            });
        }
        Ok(keys)
    }

    fn value(&mut self, frame: &mut Frame, code: &Code) -> Result<Value, Error> {
        let span = code.span;
        match &code.kind {
            CodeKind::Column { flow, attribute } => {
                self.ensure(frame, flow)?;
                let route = frame.routes.get(&flow.id).unwrap().clone();
                let class = flow.class.expect("column flows carry a class");
                let name = &self.catalog.attributes(class)[*attribute].name;
                Ok(col(&route.alias, route.column(name), span))
            }
            CodeKind::Kernel { quotient, index } => {
                self.ensure(frame, quotient)?;
                let route = frame.routes.get(&quotient.id).unwrap().clone();
                let name = frame.kernel_cols.get(&quotient.id).unwrap()[*index].clone();
                Ok(col(&route.alias, name, span))
            }
            CodeKind::Literal(literal) => {
                Ok(Value::new(ValueKind::Literal(literal.clone()), span))
            }
            CodeKind::Parameter { name } => Ok(Value::new(
                ValueKind::Parameter {
                    name: name.clone(),
                    domain: code.domain.clone(),
                },
                span,
            )),
            CodeKind::Formula { op, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.value(frame, arg))
                    .collect::<Result<Vec<_>, Error>>()?;
                Ok(operation(*op, args, span))
            }
            CodeKind::If {
                branches,
                otherwise,
            } => {
                let branches = branches
                    .iter()
                    .map(|(condition, value)| {
                        Ok((self.value(frame, condition)?, self.value(frame, value)?))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                let otherwise = otherwise
                    .as_ref()
                    .map(|value| self.value(frame, value))
                    .transpose()?
                    .map(Box::new);
                Ok(Value::new(
                    ValueKind::Case {
                        branches,
                        otherwise,
                    },
                    span,
                ))
            }
            CodeKind::Cast { code, domain } => {
                let value = self.value(frame, code)?;
                Ok(Value::new(
                    ValueKind::Cast {
                        value: Box::new(value),
                        domain: domain.clone(),
                    },
                    span,
                ))
            }
            CodeKind::Truth { code } => {
                let value = self.value(frame, code)?;
                Ok(Value::new(
                    ValueKind::Truth {
                        value: Box::new(value),
                    },
                    span,
                ))
            }
            CodeKind::Aggregate(aggregate) => self.unit_value(frame, aggregate, span),
        }
    }

    /// Lowers an aggregate unit. The default strategy is a left join to a
    /// grouped subquery correlated on the enclosing flow's key; aggregates
    /// over whole classes become standalone scalar subqueries, and
    /// projections collapse into DISTINCT aggregation.
    fn unit_value(
        &mut self,
        frame: &mut Frame,
        aggregate: &AggregateCode,
        span: Span,
    ) -> Result<Value, Error> {
        self.ensure(frame, &aggregate.over)?;

        // aggregation over distinct kernel tuples
        if let FlowKind::Quotient { base, kernel } = &aggregate.flow.kind {
            let arg = match (&aggregate.arg, kernel.len()) {
                (Some(arg), _) => inline_kernel(arg, aggregate.flow.id, kernel),
                (None, 1) => kernel[0].code.clone(),
                (None, _) => {
                    return Err(Error::new_simple(
                        "counting a multi-part projection is not supported; count a single kernel part",
                    )
                    .with_span(Some(span)))
                }
            };
            let rebased = AggregateCode {
                func: aggregate.func,
                over: aggregate.over.clone(),
                flow: base.clone(),
                arg: Some(arg),
            };
            return self.lower_unit(frame, &rebased, true, span);
        }

        self.lower_unit(frame, aggregate, false, span)
    }

    fn lower_unit(
        &mut self,
        frame: &mut Frame,
        aggregate: &AggregateCode,
        distinct: bool,
        span: Span,
    ) -> Result<Value, Error> {
        // the chain strictly below `over`, bottom-up; `top` attaches to the
        // enclosing statement
        let mut chain = Vec::new();
        let mut cursor = aggregate.flow.clone();
        while !Rc::ptr_eq(&cursor, &aggregate.over) {
            if matches!(cursor.kind, FlowKind::Slice { .. }) {
                return Err(Error::new_simple(
                    "limit inside an aggregate is not supported",
                )
                .with_span(Some(span)));
            }
            chain.push(cursor.clone());
            let base = cursor.base().expect("the encoder checked ancestry").clone();
            cursor = base;
        }
        let top = chain.last().expect("aggregates range over plural flows").clone();

        match &top.kind {
            // uncorrelated: one value for the whole statement
            FlowKind::Class { .. } => self.scalar_unit(frame, aggregate, distinct, None, span),
            // correlated scalar subquery
            FlowKind::Linked { .. } | FlowKind::Forked { .. } => {
                let route = frame.routes.get(&aggregate.over.id).unwrap().clone();
                self.scalar_unit(
                    frame,
                    aggregate,
                    distinct,
                    Some((aggregate.over.id, route)),
                    span,
                )
            }
            // grouped left join on the link's key columns
            FlowKind::Traverse { link, .. } => {
                let link = self.catalog.link(*link);
                let over_route = frame.routes.get(&aggregate.over.id).unwrap().clone();
                let left = link
                    .origin_columns
                    .iter()
                    .map(|index| {
                        let name = &self.catalog.attributes(link.origin)[*index].name;
                        col(&over_route.alias, over_route.column(name), span)
                    })
                    .collect_vec();
                let target = link.target;
                let target_columns = link.target_columns.clone();
                self.grouped_unit(frame, aggregate, distinct, span, |assembler, sub| {
                    let alias = assembler.table_alias();
                    assembler.attach(
                        sub,
                        Term {
                            kind: TermKind::Table {
                                class: target,
                                alias: alias.clone(),
                            },
                        },
                        JoinKind::Inner,
                        Vec::new(),
                    );
                    sub.routes.insert(
                        top.id,
                        Route {
                            alias: alias.clone(),
                            class: Some(target),
                            columns: None,
                        },
                    );
                    let group = target_columns
                        .iter()
                        .map(|index| {
                            let name =
                                &assembler.catalog.attributes(target)[*index].name;
                            col(&alias, name.clone(), span)
                        })
                        .collect_vec();
                    Ok((group, left))
                })
            }
            // grouped left join on the kernel
            FlowKind::Complement { quotient } => {
                let FlowKind::Quotient { base, kernel } = &quotient.kind else {
                    unreachable!("complements always hang off quotients");
                };
                let quotient_route = frame.routes.get(&quotient.id).unwrap().clone();
                let left = frame
                    .kernel_cols
                    .get(&quotient.id)
                    .unwrap()
                    .iter()
                    .map(|name| col(&quotient_route.alias, name.clone(), span))
                    .collect_vec();
                let base = base.clone();
                let kernel: Vec<Code> = kernel.iter().map(|part| part.code.clone()).collect();
                let top_id = top.id;
                self.grouped_unit(frame, aggregate, distinct, span, |assembler, sub| {
                    assembler.ensure(sub, &base)?;
                    let group = kernel
                        .iter()
                        .map(|code| assembler.value(sub, code))
                        .collect::<Result<Vec<_>, Error>>()?;
                    let route = sub.routes.get(&base.id).unwrap().clone();
                    sub.routes.insert(top_id, route);
                    Ok((group, left))
                })
            }
            // a sieve or sort directly over the enclosing flow: correlate
            // the whole chain through the enclosing row
            FlowKind::Sieve { .. } | FlowKind::Sort { .. } => {
                let route = frame.routes.get(&aggregate.over.id).unwrap().clone();
                self.scalar_unit(
                    frame,
                    aggregate,
                    distinct,
                    Some((aggregate.over.id, route)),
                    span,
                )
            }
            _ => Err(Error::new(Reason::SingularAggregate).with_span(Some(span))),
        }
    }

    /// A scalar subquery unit, optionally correlated through a seeded
    /// route.
    fn scalar_unit(
        &mut self,
        frame: &mut Frame,
        aggregate: &AggregateCode,
        distinct: bool,
        seed: Option<(FlowId, Route)>,
        span: Span,
    ) -> Result<Value, Error> {
        let mut sub = Frame::unit();
        if let Some((id, route)) = seed {
            sub.routes.insert(id, route);
        }
        self.ensure(&mut sub, &aggregate.flow)?;
        let agg_value = self.aggregate_value(&mut sub, aggregate, distinct, span)?;

        let statement = Statement {
            from: sub.from,
            projection: vec![Projected {
                name: None,
                value: agg_value,
            }],
            filters: sub.filters,
            group_by: Vec::new(),
            order: Vec::new(),
            limit: None,
            offset: None,
            span,
        };
        let subquery = Value::new(ValueKind::Subquery(Box::new(statement)), span);
        Ok(self.finish_aggregate(aggregate.func, subquery, span))
    }

    /// A grouped subquery unit, left-joined on correlation keys produced by
    /// `correlate`.
    fn grouped_unit(
        &mut self,
        frame: &mut Frame,
        aggregate: &AggregateCode,
        distinct: bool,
        span: Span,
        correlate: impl FnOnce(
            &mut Self,
            &mut Frame,
        ) -> Result<(Vec<Value>, Vec<Value>), Error>,
    ) -> Result<Value, Error> {
        let key = (aggregate.over.id.0, aggregate.flow.id.0);

        // reuse a unit over the same plural flow when the new aggregate
        // only reads already-routed columns
        if let Some(slot) = frame.units.get(&key) {
            let mut probe = Frame::unit();
            probe.routes = slot.routes.clone();
            probe.kernel_cols = slot.kernel_cols.clone();
            let probe_agg = self.aggregate_value(&mut probe, aggregate, distinct, span);
            if let Ok(agg_value) = probe_agg {
                if probe.from.is_none() && probe.filters.is_empty() {
                    let slot = frame.units.get_mut(&key).unwrap();
                    let column = format!("a{}", slot.columns);
                    slot.columns += 1;
                    let alias = slot.alias.clone();
                    let join_index = slot.join_index;
                    if let Some(from) = &mut frame.from {
                        if let TermKind::Subquery { select, .. } =
                            &mut from.joins[join_index].term.kind
                        {
                            select.projection.push(Projected {
                                name: Some(column.clone()),
                                value: agg_value,
                            });
                        }
                    }
                    let value = col(&alias, column, span);
                    return Ok(self.finish_aggregate(aggregate.func, value, span));
                }
            }
        }

        let mut sub = Frame::unit();
        let (group, left) = correlate(self, &mut sub)?;
        self.ensure(&mut sub, &aggregate.flow)?;
        let agg_value = self.aggregate_value(&mut sub, aggregate, distinct, span)?;

        let mut projection = Vec::new();
        let mut group_by = Vec::new();
        for (index, value) in group.iter().enumerate() {
            projection.push(Projected {
                name: Some(format!("g{index}")),
                value: value.clone(),
            });
            group_by.push(value.clone());
        }
        projection.push(Projected {
            name: Some("a0".to_string()),
            value: agg_value,
        });

        let statement = Statement {
            from: sub.from,
            projection,
            filters: sub.filters,
            group_by,
            order: Vec::new(),
            limit: None,
            offset: None,
            span,
        };

        let alias = self.unit_alias();
        let on = left
            .into_iter()
            .enumerate()
            .map(|(index, l)| (l, col(&alias, format!("g{index}"), span)))
            .collect_vec();
        let join_index = frame.from.as_ref().map(|f| f.joins.len()).unwrap_or(0);
        self.attach(
            frame,
            Term {
                kind: TermKind::Subquery {
                    select: Box::new(statement),
                    alias: alias.clone(),
                },
            },
            JoinKind::Left,
            on,
        );
        frame.units.insert(
            key,
            UnitSlot {
                join_index,
                alias: alias.clone(),
                columns: 1,
                routes: sub.routes,
                kernel_cols: sub.kernel_cols,
            },
        );

        let value = col(&alias, "a0".to_string(), span);
        Ok(self.finish_aggregate(aggregate.func, value, span))
    }

    /// The aggregate expression inside a unit subquery; predicates of
    /// `exists`/`every` land in the subquery's filter or the CASE arm.
    fn aggregate_value(
        &mut self,
        sub: &mut Frame,
        aggregate: &AggregateCode,
        distinct: bool,
        span: Span,
    ) -> Result<Value, Error> {
        let arg = aggregate
            .arg
            .as_ref()
            .map(|arg| self.value(sub, arg))
            .transpose()?;
        let value = match aggregate.func {
            AggFunc::Count => Value::new(
                ValueKind::Aggregate {
                    func: AggFunc::Count,
                    distinct,
                    arg: arg.map(Box::new),
                },
                span,
            ),
            AggFunc::Exists => {
                if let Some(predicate) = arg {
                    sub.filters.push(predicate);
                }
                Value::new(
                    ValueKind::Aggregate {
                        func: AggFunc::Count,
                        distinct: false,
                        arg: None,
                    },
                    span,
                )
            }
            AggFunc::Every => Value::new(
                ValueKind::Aggregate {
                    func: AggFunc::Every,
                    distinct: false,
                    arg: arg.map(Box::new),
                },
                span,
            ),
            func => Value::new(
                ValueKind::Aggregate {
                    func,
                    distinct,
                    arg: arg.map(Box::new),
                },
                span,
            ),
        };
        Ok(value)
    }

    /// Wraps the raw unit column/subquery into the aggregate's outer form:
    /// missing groups coalesce to the aggregate's identity.
    fn finish_aggregate(&self, func: AggFunc, raw: Value, span: Span) -> Value {
        match func {
            AggFunc::Count | AggFunc::Sum => operation(
                Op::IfNull,
                vec![raw, integer(0, span)],
                span,
            ),
            AggFunc::Exists => operation(
                Op::Gt,
                vec![
                    operation(Op::IfNull, vec![raw, integer(0, span)], span),
                    integer(0, span),
                ],
                span,
            ),
            AggFunc::Every => operation(
                Op::Eq,
                vec![
                    operation(Op::IfNull, vec![raw, integer(1, span)], span),
                    integer(1, span),
                ],
                span,
            ),
            AggFunc::Min | AggFunc::Max | AggFunc::Avg => raw,
        }
    }
}

/// Replaces references to a projection's kernel parts with the underlying
/// kernel expressions; used when a projection collapses into DISTINCT
/// aggregation.
fn inline_kernel(code: &Code, quotient: FlowId, kernel: &[KernelPart]) -> Code {
    let mut out = code.clone();
    out.kind = match &code.kind {
        CodeKind::Kernel {
            quotient: q,
            index,
        } if q.id == quotient => return kernel[*index].code.clone(),
        CodeKind::Formula { op, args } => CodeKind::Formula {
            op: *op,
            args: args
                .iter()
                .map(|arg| inline_kernel(arg, quotient, kernel))
                .collect(),
        },
        CodeKind::If {
            branches,
            otherwise,
        } => CodeKind::If {
            branches: branches
                .iter()
                .map(|(c, v)| {
                    (
                        inline_kernel(c, quotient, kernel),
                        inline_kernel(v, quotient, kernel),
                    )
                })
                .collect(),
            otherwise: otherwise
                .as_ref()
                .map(|value| Box::new(inline_kernel(value, quotient, kernel))),
        },
        CodeKind::Cast { code: inner, domain } => CodeKind::Cast {
            code: Box::new(inline_kernel(inner, quotient, kernel)),
            domain: domain.clone(),
        },
        CodeKind::Truth { code: inner } => CodeKind::Truth {
            code: Box::new(inline_kernel(inner, quotient, kernel)),
        },
        other => other.clone(),
    };
    out
}
