//! Encoder: bound tree → flow algebra.
//!
//! Makes the data-flow structure explicit: assigns stable ids to flow
//! nodes, enforces the singular/plural discipline (output columns must be
//! singular; anything plural needs an aggregate or a nested segment),
//! resolves each unit's plural flow, and drops redundant identity sieves.

use std::collections::HashMap;
use std::rc::Rc;

use crate::ast::flow::{
    self, is_ancestor, AggregateCode, Code, CodeKind, Flow, FlowId, FlowKind, KernelPart,
    OutputItem, Segment, SortKey,
};
use crate::ast::{bound, Literal, Op};
use crate::bind::is_ancestor as is_bound_ancestor;
use crate::catalog::{Catalog, ClassId, Domain};
use crate::error::{Error, Reason, Span};
use crate::utils::IdGenerator;

pub fn encode(query: &bound::Query, catalog: &Catalog) -> anyhow::Result<flow::Query> {
    let mut encoder = Encoder {
        catalog,
        ids: IdGenerator::new(),
        memo: HashMap::new(),
    };
    let segment = encoder.encode_segment(&query.selection, query.span)?;
    log::debug!(
        "encoded flow tree; top segment ranges over flow {:?}",
        segment.flow.id
    );
    Ok(flow::Query {
        segment,
        format: query.format.clone(),
    })
}

struct Encoder<'a> {
    catalog: &'a Catalog,
    ids: IdGenerator<FlowId>,
    /// Shared bound flows map to the same encoded node, keeping the DAG.
    memo: HashMap<*const bound::Flow, Rc<Flow>>,
}

impl<'a> Encoder<'a> {
    fn make(&mut self, kind: FlowKind, span: Span) -> Rc<Flow> {
        let class = self.class_of(&kind);
        Rc::new(Flow {
            id: self.ids.gen(),
            kind,
            class,
            span,
        })
    }

    fn class_of(&self, kind: &FlowKind) -> Option<ClassId> {
        match kind {
            FlowKind::Root | FlowKind::Quotient { .. } => None,
            FlowKind::Class { class, .. } => Some(*class),
            FlowKind::Traverse { link, .. } => Some(self.catalog.link(*link).target),
            FlowKind::Sieve { base, .. }
            | FlowKind::Sort { base, .. }
            | FlowKind::Slice { base, .. } => base.class,
            FlowKind::Forked { mirror, .. } => mirror.class,
            FlowKind::Complement { quotient } => match &quotient.kind {
                FlowKind::Quotient { base, .. } => base.class,
                _ => None,
            },
            FlowKind::Linked { target, .. } => target.class,
        }
    }

    fn encode_flow(&mut self, flow: &Rc<bound::Flow>) -> Result<Rc<Flow>, Error> {
        let key = Rc::as_ptr(flow);
        if let Some(encoded) = self.memo.get(&key) {
            return Ok(encoded.clone());
        }

        let span = flow.span;
        let encoded = match &flow.kind {
            bound::FlowKind::Root => self.make(FlowKind::Root, span),
            bound::FlowKind::Class { base, class } => {
                let base = self.encode_flow(base)?;
                self.make(
                    FlowKind::Class {
                        base,
                        class: *class,
                    },
                    span,
                )
            }
            bound::FlowKind::Traverse { base, link } => {
                let base = self.encode_flow(base)?;
                self.make(FlowKind::Traverse { base, link: *link }, span)
            }
            bound::FlowKind::Sieve { base, predicate } => {
                let base = self.encode_flow(base)?;
                // `?true()` is the identity sieve
                if matches!(
                    predicate.kind,
                    bound::ExprKind::Literal(Literal::Boolean(true))
                ) {
                    base
                } else {
                    let predicate = self.encode_code(predicate, &base)?;
                    self.make(FlowKind::Sieve { base, predicate }, span)
                }
            }
            bound::FlowKind::Sort { base, keys } => {
                let base = self.encode_flow(base)?;
                let keys = keys
                    .iter()
                    .map(|key| {
                        Ok(SortKey {
                            code: self.encode_code(&key.code, &base)?,
                            direction: key.direction,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                self.make(FlowKind::Sort { base, keys }, span)
            }
            bound::FlowKind::Slice {
                base,
                limit,
                offset,
            } => {
                let base = self.encode_flow(base)?;
                self.make(
                    FlowKind::Slice {
                        base,
                        limit: *limit,
                        offset: *offset,
                    },
                    span,
                )
            }
            bound::FlowKind::Quotient { base, kernel } => {
                let base = self.encode_flow(base)?;
                let kernel = kernel
                    .iter()
                    .map(|part| {
                        Ok(KernelPart {
                            name: part.name.clone(),
                            code: self.encode_code(&part.code, &base)?,
                        })
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                self.make(FlowKind::Quotient { base, kernel }, span)
            }
            bound::FlowKind::Complement { quotient } => {
                let quotient = self.encode_flow(quotient)?;
                self.make(FlowKind::Complement { quotient }, span)
            }
            bound::FlowKind::Linked {
                base,
                seeds,
                target,
                counterparts,
            } => {
                let base = self.encode_flow(base)?;
                let seeds = seeds
                    .iter()
                    .map(|seed| self.encode_code(seed, &base))
                    .collect::<Result<Vec<_>, Error>>()?;
                let target = self.encode_flow(target)?;
                let counterparts = counterparts
                    .iter()
                    .map(|code| self.encode_code(code, &target))
                    .collect::<Result<Vec<_>, Error>>()?;
                self.make(
                    FlowKind::Linked {
                        base,
                        seeds,
                        target,
                        counterparts,
                    },
                    span,
                )
            }
            bound::FlowKind::Forked { base, kernel } => {
                let encoded_base = self.encode_flow(base)?;
                let left = kernel
                    .iter()
                    .map(|code| self.encode_code(code, &encoded_base))
                    .collect::<Result<Vec<_>, Error>>()?;

                // the mirror instance can only mirror codes rooted directly
                // in the forked flow
                for code in &left {
                    let mut ok = true;
                    visit_code_flows(code, &mut |flow| {
                        if !Rc::ptr_eq(flow, &encoded_base) {
                            ok = false;
                        }
                    });
                    if !ok {
                        return Err(Error::new_simple(
                            "a fork kernel may only use attributes of the forked flow",
                        )
                        .with_span(Some(code.span)));
                    }
                }

                // fresh instance of the class, joined back on the kernel
                let mut root = encoded_base.clone();
                while let Some(parent) = root.base() {
                    let parent = parent.clone();
                    root = parent;
                }
                let class = encoded_base.class.ok_or_else(|| {
                    Error::new_simple("`fork` needs an entity flow").with_span(Some(span))
                })?;
                let mirror = self.make(FlowKind::Class { base: root, class }, span);

                // re-point the kernel codes at the mirror instance
                let mut scratch = HashMap::new();
                scratch.insert(Rc::as_ptr(base), mirror.clone());
                std::mem::swap(&mut self.memo, &mut scratch);
                let right = kernel
                    .iter()
                    .map(|code| self.encode_code(code, &mirror))
                    .collect::<Result<Vec<_>, Error>>();
                std::mem::swap(&mut self.memo, &mut scratch);
                let right = right?;

                self.make(
                    FlowKind::Forked {
                        base: encoded_base,
                        mirror,
                        left,
                        right,
                    },
                    span,
                )
            }
        };

        self.memo.insert(key, encoded.clone());
        Ok(encoded)
    }

    /// Checks that `target`'s rows are reachable from `ctx` without
    /// multiplying rows, and reports whether the path can introduce nulls.
    fn check_singular(
        &self,
        ctx: &Rc<Flow>,
        target: &Rc<Flow>,
        what: &str,
        span: Span,
    ) -> Result<bool, Error> {
        // a value of an enclosing flow is constant per row
        if is_ancestor(target, ctx) {
            return Ok(false);
        }
        if !is_ancestor(ctx, target) {
            return Err(Error::new(Reason::Plural {
                what: what.to_string(),
            })
            .with_help("this value belongs to an unrelated flow")
            .with_span(Some(span)));
        }

        let mut nullable = false;
        let mut cursor = target.clone();
        while !Rc::ptr_eq(&cursor, ctx) {
            if cursor.is_plural_step(self.catalog) {
                return Err(Error::new(Reason::Plural {
                    what: what.to_string(),
                })
                .with_help("wrap it in an aggregate such as count() or use a nested segment")
                .with_span(Some(span)));
            }
            if let FlowKind::Traverse { link, .. } = &cursor.kind {
                let link = self.catalog.link(*link);
                if !link.total {
                    nullable = true;
                }
            }
            let base = cursor.base().expect("ancestry was just checked").clone();
            cursor = base;
        }
        Ok(nullable)
    }

    fn encode_code(&mut self, expr: &bound::Expr, ctx: &Rc<Flow>) -> Result<Code, Error> {
        let span = expr.span;
        match &expr.kind {
            bound::ExprKind::Column { flow, attribute } => {
                let flow = self.encode_flow(flow)?;
                let path_nullable = self.check_singular(ctx, &flow, "this column", span)?;
                let class = flow.class.expect("column flows carry a class");
                let column = &self.catalog.attributes(class)[*attribute];
                Ok(Code {
                    kind: CodeKind::Column {
                        flow,
                        attribute: *attribute,
                    },
                    domain: expr.domain.clone(),
                    nullable: column.nullable || path_nullable,
                    span,
                })
            }

            bound::ExprKind::KernelRef { quotient, index } => {
                let quotient = self.encode_flow(quotient)?;
                self.check_singular(ctx, &quotient, "this kernel part", span)?;
                Ok(Code {
                    kind: CodeKind::Kernel {
                        quotient,
                        index: *index,
                    },
                    domain: expr.domain.clone(),
                    // the projection keeps only non-null kernel tuples
                    nullable: false,
                    span,
                })
            }

            bound::ExprKind::Literal(literal) => Ok(Code {
                kind: CodeKind::Literal(literal.clone()),
                domain: expr.domain.clone(),
                nullable: matches!(literal, Literal::Null),
                span,
            }),

            bound::ExprKind::Parameter { name } => Ok(Code {
                kind: CodeKind::Parameter { name: name.clone() },
                domain: expr.domain.clone(),
                nullable: true,
                span,
            }),

            bound::ExprKind::Formula { op, args } => {
                let args = args
                    .iter()
                    .map(|arg| self.encode_code(arg, ctx))
                    .collect::<Result<Vec<_>, Error>>()?;
                let nullable = formula_nullable(*op, &args);
                Ok(Code {
                    kind: CodeKind::Formula { op: *op, args },
                    domain: expr.domain.clone(),
                    nullable,
                    span,
                })
            }

            bound::ExprKind::If {
                branches,
                otherwise,
            } => {
                let branches = branches
                    .iter()
                    .map(|(condition, value)| {
                        Ok((
                            self.encode_code(condition, ctx)?,
                            self.encode_code(value, ctx)?,
                        ))
                    })
                    .collect::<Result<Vec<_>, Error>>()?;
                let otherwise = otherwise
                    .as_ref()
                    .map(|value| self.encode_code(value, ctx))
                    .transpose()?
                    .map(Box::new);
                let nullable = otherwise.as_ref().map_or(true, |o| o.nullable)
                    || branches.iter().any(|(_, value)| value.nullable);
                Ok(Code {
                    kind: CodeKind::If {
                        branches,
                        otherwise,
                    },
                    domain: expr.domain.clone(),
                    nullable,
                    span,
                })
            }

            bound::ExprKind::Aggregate { func, over, input } => {
                let over = self.encode_flow(over)?;
                self.check_singular(ctx, &over, "this aggregate", span)?;

                let (plural, arg) = match input {
                    bound::AggInput::Flow(flow) => (self.encode_flow(flow)?, None),
                    bound::AggInput::Code(code) => {
                        let home = self.bound_home(code).ok_or_else(|| {
                            Error::new(Reason::SingularAggregate).with_span(Some(span))
                        })?;
                        let plural = self.encode_flow(&home)?;
                        let arg = self.encode_code(code, &plural)?;
                        (plural, Some(arg))
                    }
                };

                // the argument must be plural relative to the aggregate's
                // own flow
                if !is_ancestor(&over, &plural) {
                    return Err(Error::new(Reason::Plural {
                        what: "the aggregate argument".to_string(),
                    })
                    .with_help("it belongs to an unrelated flow")
                    .with_span(Some(span)));
                }
                let mut plural_steps = 0;
                let mut cursor = plural.clone();
                while !Rc::ptr_eq(&cursor, &over) {
                    if cursor.is_plural_step(self.catalog) {
                        plural_steps += 1;
                    }
                    let base = cursor.base().expect("ancestry was just checked").clone();
                    cursor = base;
                }
                if plural_steps == 0 {
                    return Err(Error::new(Reason::SingularAggregate).with_span(Some(span)));
                }

                let nullable = matches!(
                    func,
                    crate::ast::AggFunc::Min | crate::ast::AggFunc::Max | crate::ast::AggFunc::Avg
                );
                Ok(Code {
                    kind: CodeKind::Aggregate(Box::new(AggregateCode {
                        func: *func,
                        over,
                        flow: plural,
                        arg,
                    })),
                    domain: expr.domain.clone(),
                    nullable,
                    span,
                })
            }

            bound::ExprKind::Cast { expr: inner, domain } => {
                let code = self.encode_code(inner, ctx)?;
                let nullable = code.nullable;
                Ok(Code {
                    kind: CodeKind::Cast {
                        code: Box::new(code),
                        domain: domain.clone(),
                    },
                    domain: expr.domain.clone(),
                    nullable,
                    span,
                })
            }

            bound::ExprKind::Truth { expr: inner } => {
                let code = self.encode_code(inner, ctx)?;
                Ok(Code {
                    kind: CodeKind::Truth {
                        code: Box::new(code),
                    },
                    domain: Domain::Boolean,
                    nullable: false,
                    span,
                })
            }

            bound::ExprKind::FlowValue(_) | bound::ExprKind::Selection(_) => {
                Err(Error::new(Reason::Plural {
                    what: "this record expression".to_string(),
                })
                .with_help("wrap it in an aggregate or list it as a nested segment")
                .with_span(Some(span)))
            }

            bound::ExprKind::NestedSegment(_) => {
                Err(Error::new(Reason::NestedInScalar).with_span(Some(span)))
            }
        }
    }

    /// The deepest flow a bound code draws from.
    fn bound_home(&self, expr: &bound::Expr) -> Option<Rc<bound::Flow>> {
        let mut best: Option<Rc<bound::Flow>> = None;
        visit_bound_flows(expr, &mut |flow| match &best {
            None => best = Some(flow.clone()),
            Some(current) => {
                if is_bound_ancestor(current, flow) {
                    best = Some(flow.clone());
                }
            }
        });
        best
    }

    fn encode_segment(
        &mut self,
        selection: &bound::Selection,
        span: Span,
    ) -> Result<Segment, Error> {
        let flow = self.encode_flow(&selection.flow)?;
        let mut items = Vec::new();
        for item in &selection.items {
            match &item.kind {
                bound::ExprKind::NestedSegment(child) => {
                    let segment = self.encode_segment(child, item.span)?;
                    items.push(OutputItem::Nested {
                        title: item.alias.clone(),
                        segment,
                    });
                }
                _ => {
                    let code = self.encode_code(item, &flow)?;
                    items.push(OutputItem::Column {
                        title: item.alias.clone(),
                        code,
                    });
                }
            }
        }
        Ok(Segment { flow, items, span })
    }
}

fn formula_nullable(op: Op, args: &[Code]) -> bool {
    use Op::*;
    match op {
        // locked to non-null results
        IsNull | Concat | Today | Now => false,
        IfNull => args.get(1).map_or(true, |fallback| fallback.nullable),
        _ => args.iter().any(|arg| arg.nullable),
    }
}

fn visit_code_flows(code: &Code, visit: &mut impl FnMut(&Rc<Flow>)) {
    match &code.kind {
        CodeKind::Column { flow, .. } => visit(flow),
        CodeKind::Kernel { quotient, .. } => visit(quotient),
        CodeKind::Aggregate(aggregate) => visit(&aggregate.over),
        CodeKind::Formula { args, .. } => {
            for arg in args {
                visit_code_flows(arg, visit);
            }
        }
        CodeKind::If {
            branches,
            otherwise,
        } => {
            for (condition, value) in branches {
                visit_code_flows(condition, visit);
                visit_code_flows(value, visit);
            }
            if let Some(value) = otherwise {
                visit_code_flows(value, visit);
            }
        }
        CodeKind::Cast { code, .. } | CodeKind::Truth { code } => visit_code_flows(code, visit),
        CodeKind::Literal(_) | CodeKind::Parameter { .. } => {}
    }
}

fn visit_bound_flows(expr: &bound::Expr, visit: &mut impl FnMut(&Rc<bound::Flow>)) {
    match &expr.kind {
        bound::ExprKind::Column { flow, .. } => visit(flow),
        bound::ExprKind::KernelRef { quotient, .. } => visit(quotient),
        bound::ExprKind::Aggregate { over, .. } => visit(over),
        bound::ExprKind::Formula { args, .. } => {
            for arg in args {
                visit_bound_flows(arg, visit);
            }
        }
        bound::ExprKind::If {
            branches,
            otherwise,
        } => {
            for (condition, value) in branches {
                visit_bound_flows(condition, visit);
                visit_bound_flows(value, visit);
            }
            if let Some(value) = otherwise {
                visit_bound_flows(value, visit);
            }
        }
        bound::ExprKind::Cast { expr, .. } | bound::ExprKind::Truth { expr } => {
            visit_bound_flows(expr, visit)
        }
        _ => {}
    }
}
