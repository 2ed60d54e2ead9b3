//! Name resolution, scope walking and overload selection.
//!
//! The binder walks the syntax tree with a scope stack whose frames are
//! derived from flows: the root scope names the entity classes, a class
//! scope names attributes and links, a projection scope names the kernel
//! parts and the complement. Lookup is lexical; only `$name` references
//! cross scope boundaries.

mod call;
mod coerce;
mod scope;

use std::collections::HashMap;
use std::rc::Rc;

use itertools::Itertools;

use crate::ast::bound::{
    AggInput, Expr, ExprKind, Flow, FlowKind, KernelPart, Selection, SortKey,
};
use crate::ast::syntax::{self, BinOp, UnOp};
use crate::ast::{bound, AggFunc, Direction, Literal, Op};
use crate::catalog::{Catalog, ClassId, Domain};
use crate::error::{Error, Reason, Span};
use scope::{CalcDef, Local, Scope};

const MAX_CALC_DEPTH: usize = 64;

/// Binds a parsed query against a catalog snapshot. Returns the bound query
/// plus collected warnings.
pub fn bind(
    query: &syntax::Query,
    catalog: &Catalog,
    parameters: &HashMap<String, Domain>,
) -> anyhow::Result<(bound::Query, Vec<Error>)> {
    let mut binder = Binder {
        catalog,
        parameters,
        class_locals: HashMap::new(),
        warnings: Vec::new(),
        depth: 0,
    };

    let segment = query.segment.as_ref().ok_or_else(|| {
        Error::new_simple("the query is empty").with_span(Some(query.span))
    })?;

    let root = Flow::new(FlowKind::Root, query.span);
    let scope = Scope::root(root);
    let selection = binder.bind_segment(&scope, segment)?;
    log::debug!("bound {} output item(s)", selection.items.len());

    Ok((
        bound::Query {
            selection,
            format: query.format.clone(),
            span: query.span,
        },
        binder.warnings,
    ))
}

struct Binder<'a> {
    catalog: &'a Catalog,
    parameters: &'a HashMap<String, Domain>,
    /// `define(T.name := expr)` attachments, in order of appearance.
    class_locals: HashMap<ClassId, Vec<(String, Rc<CalcDef>)>>,
    warnings: Vec<Error>,
    depth: usize,
}

/// A bound expression plus the scope that follows it in a composition.
struct Resolved {
    expr: Expr,
    follow: Option<Rc<Scope>>,
}

impl Resolved {
    fn plain(expr: Expr) -> Resolved {
        Resolved { expr, follow: None }
    }
}

/// Is `a` an ancestor of (or the same node as) `b`?
pub(crate) fn is_ancestor(a: &Rc<Flow>, b: &Rc<Flow>) -> bool {
    let mut cursor = b.clone();
    loop {
        if Rc::ptr_eq(a, &cursor) {
            return true;
        }
        match cursor.base() {
            Some(base) => cursor = base.clone(),
            None => return false,
        }
    }
}

impl<'a> Binder<'a> {
    fn bind_segment(
        &mut self,
        scope: &Rc<Scope>,
        segment: &syntax::Expr,
    ) -> Result<Selection, Error> {
        let resolved = self.bind_resolved(scope, segment)?;
        match resolved.expr.kind {
            ExprKind::Selection(selection) => Ok(selection),
            ExprKind::FlowValue(flow) => {
                let items = self.expand_flow_items(&flow, segment.span)?;
                Ok(Selection { flow, items })
            }
            _ => {
                let flow = self.home_flow(&resolved.expr, &scope.flow);
                Ok(Selection {
                    flow,
                    items: vec![resolved.expr],
                })
            }
        }
    }

    fn bind_expr(&mut self, scope: &Rc<Scope>, expr: &syntax::Expr) -> Result<Expr, Error> {
        Ok(self.bind_resolved(scope, expr)?.expr)
    }

    fn bind_resolved(
        &mut self,
        scope: &Rc<Scope>,
        expr: &syntax::Expr,
    ) -> Result<Resolved, Error> {
        let span = expr.span;
        match &expr.kind {
            syntax::ExprKind::Literal(literal) => {
                let (literal, domain) = match literal {
                    Literal::Integer(i) => (Literal::Integer(*i), Domain::Integer),
                    Literal::Decimal(d) => (Literal::Decimal(d.clone()), Domain::Decimal),
                    Literal::Float(v) => (Literal::Float(*v), Domain::Float),
                    Literal::Text(s) => (Literal::Text(s.clone()), Domain::Untyped),
                    other => (other.clone(), Domain::Untyped),
                };
                Ok(Resolved::plain(Expr::new(
                    ExprKind::Literal(literal),
                    domain,
                    span,
                )))
            }

            syntax::ExprKind::Ident(name) => self.lookup_name(scope, name, span),

            syntax::ExprKind::Reference(name) => {
                if let Some(value) = scope.reference(name) {
                    let mut expr = value.clone();
                    expr.span = span;
                    let follow = self.follow_for(scope, &expr);
                    return Ok(Resolved { expr, follow });
                }
                let domain = self
                    .parameters
                    .get(name)
                    .cloned()
                    .unwrap_or(Domain::Untyped);
                Ok(Resolved::plain(Expr::new(
                    ExprKind::Parameter { name: name.clone() },
                    domain,
                    span,
                )))
            }

            syntax::ExprKind::Wildcard(index) => self.bind_wildcard(scope, *index, span),

            syntax::ExprKind::Complement => self.bind_complement(scope, span),

            syntax::ExprKind::Group(inner) => self.bind_resolved(scope, inner),

            syntax::ExprKind::Call(call) => self.bind_call(scope, call, None, span),

            syntax::ExprKind::Unary { op, expr: inner } => {
                let value = self.bind_expr(scope, inner)?;
                match op {
                    UnOp::Not => {
                        let value = coerce::truth(value)?;
                        Ok(Resolved::plain(Expr::new(
                            ExprKind::Formula {
                                op: Op::Not,
                                args: vec![value],
                            },
                            Domain::Boolean,
                            span,
                        )))
                    }
                    UnOp::Pos => Ok(Resolved::plain(self.to_numeric(value)?)),
                    UnOp::Neg => {
                        let value = self.to_numeric(value)?;
                        let domain = value.domain.clone();
                        Ok(Resolved::plain(Expr::new(
                            ExprKind::Formula {
                                op: Op::Neg,
                                args: vec![value],
                            },
                            domain,
                            span,
                        )))
                    }
                }
            }

            syntax::ExprKind::Binary { op, left, right } => {
                // `x = {a, b}` is elementwise: `(x = a) | (x = b)`
                if matches!(op, BinOp::Eq | BinOp::Ne) {
                    if let syntax::ExprKind::Selection {
                        base: None,
                        elements,
                    } = &right.kind
                    {
                        return self.bind_membership(scope, *op, left, elements, span);
                    }
                }
                let left = self.bind_expr(scope, left)?;
                let right = self.bind_expr(scope, right)?;
                self.expect_scalar(&left)?;
                self.expect_scalar(&right)?;
                Ok(Resolved::plain(coerce::binary(*op, left, right, span)?))
            }

            syntax::ExprKind::Compose { left, right } => {
                self.bind_compose(scope, left, right, span)
            }

            syntax::ExprKind::Sieve { base, predicate } => {
                self.bind_sieve(scope, base, predicate, span)
            }

            syntax::ExprKind::Selection { base, elements } => {
                self.bind_selection(scope, base.as_deref(), elements, span)
            }

            syntax::ExprKind::Projection { base, kernel } => {
                self.bind_projection(scope, base, kernel, span)
            }

            syntax::ExprKind::Link { seed, target } => {
                self.bind_linked(scope, seed, target, span)
            }

            syntax::ExprKind::Assign { .. } => Err(Error::new_simple(
                "an assignment is only allowed in definitions and selections",
            )
            .with_span(Some(span))),

            // a direction suffix is consumed by sort keys and selections;
            // anywhere else it is transparent
            syntax::ExprKind::Direction { expr: inner, .. } => self.bind_resolved(scope, inner),

            syntax::ExprKind::Nested(_) => {
                Err(Error::new(Reason::NestedInScalar).with_span(Some(span)))
            }
        }
    }

    fn follow_for(&self, scope: &Rc<Scope>, expr: &Expr) -> Option<Rc<Scope>> {
        expr.flow().map(|flow| scope.enter(flow.clone()))
    }

    fn scope_description(&self, scope: &Scope) -> String {
        match scope.flow.class(self.catalog) {
            Some(class) => format!("`{}`", self.catalog.class(class).name),
            None => match scope.flow.kind {
                FlowKind::Quotient { .. } => "the projection".to_string(),
                _ => "the root scope".to_string(),
            },
        }
    }

    fn lookup_name(
        &mut self,
        scope: &Rc<Scope>,
        name: &str,
        span: Span,
    ) -> Result<Resolved, Error> {
        // user extensions shadow everything else
        if let Some(local) = scope.local(name).cloned() {
            return match local {
                Local::Value(value) => {
                    let mut expr = value;
                    expr.span = span;
                    let follow = self.follow_for(scope, &expr);
                    Ok(Resolved { expr, follow })
                }
                Local::Calc(def) => self.bind_calc(&def, None, scope, &[], span),
            };
        }

        match &scope.flow.kind {
            FlowKind::Quotient { base, kernel } => {
                if let Some((index, part)) = kernel
                    .iter()
                    .enumerate()
                    .find(|(_, p)| p.name.as_deref() == Some(name))
                {
                    return Ok(Resolved::plain(Expr::new(
                        ExprKind::KernelRef {
                            quotient: scope.flow.clone(),
                            index,
                        },
                        part.code.domain.clone(),
                        span,
                    )));
                }
                // the complement carries the base class name
                if let Some(class) = base.class(self.catalog) {
                    if self.catalog.class(class).name.eq_ignore_ascii_case(name) {
                        return self.bind_complement(scope, span);
                    }
                }
            }
            _ => {
                if let Some(class) = scope.flow.class(self.catalog) {
                    let attribute = self.catalog.class(class).attribute(name);
                    let link = self.catalog.link_of(class, name);
                    match (attribute, link) {
                        (Some(_), Some(link)) => {
                            // a link shadows an attribute of the same name
                            self.warnings.push(
                                Error::new(Reason::Shadowed {
                                    name: name.to_string(),
                                })
                                .with_span(Some(span)),
                            );
                            return self.traverse(scope, link.id, span);
                        }
                        (None, Some(link)) => return self.traverse(scope, link.id, span),
                        (Some((index, attribute)), None) => {
                            return Ok(Resolved::plain(Expr::new(
                                ExprKind::Column {
                                    flow: scope.flow.clone(),
                                    attribute: index,
                                },
                                attribute.domain.clone(),
                                span,
                            )));
                        }
                        (None, None) => {}
                    }
                    if let Some(def) = self.class_calc(class, name) {
                        return self.bind_calc(&def, Some(scope.flow.clone()), scope, &[], span);
                    }
                } else if matches!(scope.flow.kind, FlowKind::Root) {
                    if let Some(entity) = self.catalog.entity(name) {
                        let flow = Flow::new(
                            FlowKind::Class {
                                base: scope.flow.clone(),
                                class: entity.id,
                            },
                            span,
                        );
                        return Ok(Resolved {
                            expr: Expr::new(
                                ExprKind::FlowValue(flow.clone()),
                                Domain::Record,
                                span,
                            ),
                            follow: Some(scope.enter(flow)),
                        });
                    }
                }
            }
        }

        if let Some(resolved) = self.bind_niladic(scope, name, span)? {
            return Ok(resolved);
        }

        Err(Error::new(Reason::NotFound {
            name: name.to_string(),
            namespace: self.scope_description(scope),
        })
        .with_span(Some(span)))
    }

    fn traverse(
        &mut self,
        scope: &Rc<Scope>,
        link: crate::catalog::LinkId,
        span: Span,
    ) -> Result<Resolved, Error> {
        let flow = Flow::new(
            FlowKind::Traverse {
                base: scope.flow.clone(),
                link,
            },
            span,
        );
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow.clone()), Domain::Record, span),
            follow: Some(scope.enter(flow)),
        })
    }

    fn bind_niladic(
        &mut self,
        scope: &Rc<Scope>,
        name: &str,
        span: Span,
    ) -> Result<Option<Resolved>, Error> {
        let expr = match name {
            "true" => Expr::new(
                ExprKind::Literal(Literal::Boolean(true)),
                Domain::Boolean,
                span,
            ),
            "false" => Expr::new(
                ExprKind::Literal(Literal::Boolean(false)),
                Domain::Boolean,
                span,
            ),
            "null" => Expr::new(ExprKind::Literal(Literal::Null), Domain::Untyped, span),
            "today" => Expr::new(
                ExprKind::Formula {
                    op: Op::Today,
                    args: vec![],
                },
                Domain::Date,
                span,
            ),
            "now" => Expr::new(
                ExprKind::Formula {
                    op: Op::Now,
                    args: vec![],
                },
                Domain::DateTime,
                span,
            ),
            "this" => {
                return Ok(Some(Resolved {
                    expr: Expr::new(
                        ExprKind::FlowValue(scope.flow.clone()),
                        Domain::Record,
                        span,
                    ),
                    follow: Some(scope.clone()),
                }))
            }
            "root" => {
                let mut outermost = scope.clone();
                while let Some(parent) = outermost.parent.clone() {
                    outermost = parent;
                }
                return Ok(Some(Resolved {
                    expr: Expr::new(
                        ExprKind::FlowValue(outermost.flow.clone()),
                        Domain::Record,
                        span,
                    ),
                    follow: Some(outermost),
                }));
            }
            _ => return Ok(None),
        };
        Ok(Some(Resolved::plain(expr)))
    }

    fn bind_complement(&mut self, scope: &Rc<Scope>, span: Span) -> Result<Resolved, Error> {
        if !matches!(scope.flow.kind, FlowKind::Quotient { .. }) {
            return Err(Error::new(Reason::NotFound {
                name: "^".to_string(),
                namespace: self.scope_description(scope),
            })
            .with_help("the complement only exists inside a projection")
            .with_span(Some(span)));
        }
        let flow = Flow::new(
            FlowKind::Complement {
                quotient: scope.flow.clone(),
            },
            span,
        );
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow.clone()), Domain::Record, span),
            follow: Some(scope.enter(flow)),
        })
    }

    fn bind_wildcard(
        &mut self,
        scope: &Rc<Scope>,
        index: Option<u32>,
        span: Span,
    ) -> Result<Resolved, Error> {
        let items = self.expand_flow_items(&scope.flow, span)?;
        match index {
            None => Ok(Resolved::plain(Expr::new(
                ExprKind::Selection(Selection {
                    flow: scope.flow.clone(),
                    items,
                }),
                Domain::Record,
                span,
            ))),
            Some(n) => {
                let n = n as usize;
                if n == 0 || n > items.len() {
                    return Err(Error::new_simple(format!(
                        "`*{n}` is out of range; there are {} columns",
                        items.len()
                    ))
                    .with_span(Some(span)));
                }
                let mut item = items.into_iter().nth(n - 1).unwrap();
                item.span = span;
                Ok(Resolved::plain(item))
            }
        }
    }

    /// The ordered output tuple a bare flow stands for: all attributes of a
    /// class, or the kernel parts of a projection.
    fn expand_flow_items(&self, flow: &Rc<Flow>, span: Span) -> Result<Vec<Expr>, Error> {
        if let FlowKind::Quotient { kernel, .. } = &flow.kind {
            return Ok(kernel
                .iter()
                .enumerate()
                .map(|(index, part)| {
                    let mut expr = Expr::new(
                        ExprKind::KernelRef {
                            quotient: flow.clone(),
                            index,
                        },
                        part.code.domain.clone(),
                        span,
                    );
                    expr.alias = part.name.clone();
                    expr
                })
                .collect());
        }
        if let Some(class) = flow.class(self.catalog) {
            return Ok(self
                .catalog
                .attributes(class)
                .iter()
                .enumerate()
                .map(|(index, attribute)| {
                    Expr::new(
                        ExprKind::Column {
                            flow: flow.clone(),
                            attribute: index,
                        },
                        attribute.domain.clone(),
                        span,
                    )
                })
                .collect());
        }
        Err(Error::new_simple("there is nothing to select here").with_span(Some(span)))
    }

    fn bind_membership(
        &mut self,
        scope: &Rc<Scope>,
        op: BinOp,
        left: &syntax::Expr,
        elements: &[syntax::Expr],
        span: Span,
    ) -> Result<Resolved, Error> {
        let left = self.bind_expr(scope, left)?;
        self.expect_scalar(&left)?;
        let mut folded: Option<Expr> = None;
        for element in elements {
            let right = self.bind_expr(scope, element)?;
            let comparison = coerce::binary(op, left.clone(), right, span)?;
            folded = Some(match folded {
                None => comparison,
                Some(acc) => {
                    let fold_op = if op == BinOp::Eq { Op::Or } else { Op::And };
                    Expr::new(
                        ExprKind::Formula {
                            op: fold_op,
                            args: vec![acc, comparison],
                        },
                        Domain::Boolean,
                        span,
                    )
                }
            });
        }
        let result = folded.unwrap_or_else(|| {
            Expr::new(
                ExprKind::Literal(Literal::Boolean(op != BinOp::Eq)),
                Domain::Boolean,
                span,
            )
        });
        Ok(Resolved::plain(result))
    }

    fn bind_compose(
        &mut self,
        scope: &Rc<Scope>,
        left: &syntax::Expr,
        right: &syntax::Expr,
        span: Span,
    ) -> Result<Resolved, Error> {
        let left = self.bind_resolved(scope, left)?;

        match &right.kind {
            syntax::ExprKind::Ident(name) => match &left.follow {
                Some(inner) => {
                    let inner = inner.clone();
                    self.lookup_name(&inner, name, right.span)
                }
                None => Err(Error::new(Reason::NotFound {
                    name: name.clone(),
                    namespace: format!("a value of {}", left.expr.domain),
                })
                .with_span(Some(right.span))),
            },
            syntax::ExprKind::Call(call) => self.bind_call(scope, call, Some(left), span),
            syntax::ExprKind::Wildcard(index) => match &left.follow {
                Some(inner) => {
                    let inner = inner.clone();
                    self.bind_wildcard(&inner, *index, right.span)
                }
                None => Err(Error::new_simple("`*` needs a flow to select from")
                    .with_span(Some(right.span))),
            },
            _ => Err(Error::new_simple("only a name or a call may follow `.`")
                .with_span(Some(right.span))),
        }
    }

    fn bind_sieve(
        &mut self,
        scope: &Rc<Scope>,
        base: &syntax::Expr,
        predicate: &syntax::Expr,
        span: Span,
    ) -> Result<Resolved, Error> {
        let resolved = self.bind_resolved(scope, base)?;
        let inner = match &resolved.follow {
            Some(follow) => follow.clone(),
            None => {
                return Err(Error::new(Reason::TypeMismatch {
                    expected: "a flow".to_string(),
                    found: resolved.expr.domain.to_string(),
                })
                .with_span(Some(base.span)))
            }
        };

        let predicate = coerce::truth(self.bind_expr(&inner, predicate)?)?;

        match resolved.expr.kind {
            ExprKind::Selection(selection) => {
                let flow = Flow::new(
                    FlowKind::Sieve {
                        base: selection.flow.clone(),
                        predicate,
                    },
                    span,
                );
                let follow = inner.with_flow(flow.clone());
                Ok(Resolved {
                    expr: Expr::new(
                        ExprKind::Selection(Selection {
                            flow,
                            items: selection.items,
                        }),
                        Domain::Record,
                        span,
                    ),
                    follow: Some(follow),
                })
            }
            ExprKind::FlowValue(base_flow) => {
                let flow = Flow::new(
                    FlowKind::Sieve {
                        base: base_flow,
                        predicate,
                    },
                    span,
                );
                let follow = inner.with_flow(flow.clone());
                Ok(Resolved {
                    expr: Expr::new(ExprKind::FlowValue(flow), Domain::Record, span),
                    follow: Some(follow),
                })
            }
            _ => Err(Error::new(Reason::TypeMismatch {
                expected: "a flow".to_string(),
                found: resolved.expr.domain.to_string(),
            })
            .with_span(Some(base.span))),
        }
    }

    fn bind_selection(
        &mut self,
        scope: &Rc<Scope>,
        base: Option<&syntax::Expr>,
        elements: &[syntax::Expr],
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner) = match base {
            Some(base) => {
                let resolved = self.bind_resolved(scope, base)?;
                let flow = match resolved.expr.flow() {
                    Some(flow) => flow.clone(),
                    None => {
                        return Err(Error::new(Reason::TypeMismatch {
                            expected: "a flow".to_string(),
                            found: resolved.expr.domain.to_string(),
                        })
                        .with_span(Some(base.span)))
                    }
                };
                let inner = resolved
                    .follow
                    .unwrap_or_else(|| scope.enter(flow.clone()));
                (flow, inner)
            }
            None => (scope.flow.clone(), scope.clone()),
        };

        let (items, sort_keys) = self.bind_elements(&inner, elements)?;

        let flow = if sort_keys.is_empty() {
            flow
        } else {
            Flow::new(
                FlowKind::Sort {
                    base: flow,
                    keys: sort_keys,
                },
                span,
            )
        };
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(
                ExprKind::Selection(Selection { flow, items }),
                Domain::Record,
                span,
            ),
            follow: Some(follow),
        })
    }

    /// Binds selection elements; `expr+`/`expr-` elements double as sort
    /// keys of the selection's flow.
    fn bind_elements(
        &mut self,
        inner: &Rc<Scope>,
        elements: &[syntax::Expr],
    ) -> Result<(Vec<Expr>, Vec<SortKey>), Error> {
        let mut items = Vec::new();
        let mut sort_keys = Vec::new();

        for element in elements {
            match &element.kind {
                syntax::ExprKind::Nested(sub) => {
                    let child = self.bind_segment(inner, sub)?;
                    items.push(Expr::new(
                        ExprKind::NestedSegment(child),
                        Domain::Record,
                        element.span,
                    ));
                }
                syntax::ExprKind::Assign { target, value } => {
                    let name = match &target.kind {
                        syntax::ExprKind::Ident(name) => name.clone(),
                        _ => {
                            return Err(Error::new_simple(
                                "a selection alias must be a plain name",
                            )
                            .with_span(Some(target.span)))
                        }
                    };
                    let mut value = self.bind_expr(inner, value)?;
                    value.alias = Some(name);
                    value.span = element.span;
                    items.push(value);
                }
                syntax::ExprKind::Direction { expr, direction } => {
                    let code = self.bind_expr(inner, expr)?;
                    self.check_sortable(&code)?;
                    sort_keys.push(SortKey {
                        code: code.clone(),
                        direction: *direction,
                    });
                    items.push(code);
                }
                syntax::ExprKind::Wildcard(None) => {
                    items.extend(self.expand_flow_items(&inner.flow, element.span)?);
                }
                _ => items.push(self.bind_expr(inner, element)?),
            }
        }
        Ok((items, sort_keys))
    }

    fn bind_projection(
        &mut self,
        scope: &Rc<Scope>,
        base: &syntax::Expr,
        kernel: &syntax::Expr,
        span: Span,
    ) -> Result<Resolved, Error> {
        let resolved = self.bind_resolved(scope, base)?;
        let flow = match resolved.expr.flow() {
            Some(flow) => flow.clone(),
            None => {
                return Err(Error::new(Reason::InvalidProjection {
                    detail: format!("`^` needs a flow, not {}", resolved.expr.domain),
                })
                .with_span(Some(base.span)))
            }
        };
        let inner = resolved
            .follow
            .unwrap_or_else(|| scope.enter(flow.clone()));

        let parts: Vec<&syntax::Expr> = match &kernel.kind {
            syntax::ExprKind::Selection {
                base: None,
                elements,
            } => elements.iter().collect(),
            _ => vec![kernel],
        };

        let mut kernel_parts: Vec<KernelPart> = Vec::new();
        for part in parts {
            let (name, code_syntax) = match &part.kind {
                syntax::ExprKind::Assign { target, value } => match &target.kind {
                    syntax::ExprKind::Ident(name) => (Some(name.clone()), value.as_ref()),
                    _ => {
                        return Err(Error::new(Reason::InvalidKernel {
                            detail: "a kernel alias must be a plain name".to_string(),
                        })
                        .with_span(Some(target.span)))
                    }
                },
                syntax::ExprKind::Ident(name) => (Some(name.clone()), part),
                syntax::ExprKind::Compose { right, .. } => match &right.kind {
                    syntax::ExprKind::Ident(name) => (Some(name.clone()), part),
                    _ => (None, part),
                },
                _ => (None, part),
            };
            let code = self.bind_expr(&inner, code_syntax)?;
            if !code.domain.is_scalar() {
                return Err(Error::new(Reason::InvalidKernel {
                    detail: format!("a kernel part must be scalar, not {}", code.domain),
                })
                .with_span(Some(part.span)));
            }
            if let Some(name) = &name {
                if kernel_parts.iter().any(|p| p.name.as_deref() == Some(name)) {
                    return Err(Error::new(Reason::InvalidKernel {
                        detail: format!("duplicate kernel part `{name}`"),
                    })
                    .with_span(Some(part.span)));
                }
            }
            kernel_parts.push(KernelPart { name, code });
        }

        if kernel_parts.is_empty() {
            return Err(Error::new(Reason::InvalidKernel {
                detail: "the kernel is empty".to_string(),
            })
            .with_span(Some(kernel.span)));
        }

        let flow = Flow::new(
            FlowKind::Quotient {
                base: flow,
                kernel: kernel_parts,
            },
            span,
        );
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow.clone()), Domain::Record, span),
            follow: Some(scope.enter(flow)),
        })
    }

    fn bind_linked(
        &mut self,
        scope: &Rc<Scope>,
        seed: &syntax::Expr,
        target: &syntax::Expr,
        span: Span,
    ) -> Result<Resolved, Error> {
        let seed_syntax: Vec<&syntax::Expr> = match &seed.kind {
            syntax::ExprKind::Selection {
                base: None,
                elements,
            } => elements.iter().collect(),
            _ => vec![seed],
        };
        let mut seeds = Vec::new();
        for s in seed_syntax {
            let code = self.bind_expr(scope, s)?;
            self.expect_scalar(&code)?;
            seeds.push(code);
        }

        let mut outermost = scope.clone();
        while let Some(parent) = outermost.parent.clone() {
            outermost = parent;
        }
        let resolved = self.bind_resolved(&outermost, target)?;
        let (target_flow, mut counterparts) = match resolved.expr.kind {
            ExprKind::Selection(selection) => (selection.flow, selection.items),
            ExprKind::FlowValue(flow) => {
                let class = flow.class(self.catalog).ok_or_else(|| {
                    Error::new_simple("the link target must be an entity flow")
                        .with_span(Some(target.span))
                })?;
                let keys = self
                    .catalog
                    .primary_key(class)
                    .iter()
                    .map(|index| {
                        let attribute = &self.catalog.attributes(class)[*index];
                        Expr::new(
                            ExprKind::Column {
                                flow: flow.clone(),
                                attribute: *index,
                            },
                            attribute.domain.clone(),
                            target.span,
                        )
                    })
                    .collect();
                (flow, keys)
            }
            _ => {
                return Err(Error::new_simple("the link target must be a flow")
                    .with_span(Some(target.span)))
            }
        };

        if seeds.len() != counterparts.len() {
            return Err(Error::new(Reason::Expected {
                who: Some("`->`".to_string()),
                expected: format!("{} counterpart column(s)", seeds.len()),
                found: format!("{}", counterparts.len()),
            })
            .with_span(Some(span)));
        }

        let mut coerced_seeds = Vec::new();
        let mut coerced_counterparts = Vec::new();
        for (seed, counterpart) in seeds.into_iter().zip(counterparts.drain(..)) {
            let (seed, counterpart) = coerce::equalize(seed, counterpart, span)?;
            coerced_seeds.push(seed);
            coerced_counterparts.push(counterpart);
        }

        let flow = Flow::new(
            FlowKind::Linked {
                base: scope.flow.clone(),
                seeds: coerced_seeds,
                target: target_flow,
                counterparts: coerced_counterparts,
            },
            span,
        );
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow.clone()), Domain::Record, span),
            follow: Some(scope.enter(flow)),
        })
    }

    fn expect_scalar(&self, expr: &Expr) -> Result<(), Error> {
        if expr.domain.is_scalar() {
            Ok(())
        } else {
            Err(Error::new(Reason::TypeMismatch {
                expected: "a scalar value".to_string(),
                found: expr.domain.to_string(),
            })
            .with_span(Some(expr.span)))
        }
    }

    fn check_sortable(&self, code: &Expr) -> Result<(), Error> {
        if code.domain.is_orderable() || code.domain == Domain::Boolean {
            Ok(())
        } else {
            Err(Error::new(Reason::OrderingNotSupported {
                domain: code.domain.to_string(),
            })
            .with_span(Some(code.span)))
        }
    }

    fn to_numeric(&self, expr: Expr) -> Result<Expr, Error> {
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

    fn class_calc(&self, class: ClassId, name: &str) -> Option<Rc<CalcDef>> {
        self.class_locals
            .get(&class)
            .and_then(|locals| locals.iter().rev().find(|(n, _)| n == name))
            .map(|(_, def)| def.clone())
    }

    /// Expands a user calculation at a call site. `flow_override` rebases
    /// the body onto the use-site flow for class-attached calculations.
    fn bind_calc(
        &mut self,
        def: &Rc<CalcDef>,
        flow_override: Option<Rc<Flow>>,
        call_scope: &Rc<Scope>,
        args: &[syntax::Expr],
        span: Span,
    ) -> Result<Resolved, Error> {
        if args.len() != def.params.len() {
            return Err(Error::new(Reason::Expected {
                who: Some("this calculation".to_string()),
                expected: format!("{} argument(s)", def.params.len()),
                found: format!("{}", args.len()),
            })
            .with_span(Some(span)));
        }

        let mut env = match &flow_override {
            Some(flow) => Rc::new(Scope {
                flow: flow.clone(),
                parent: Some(def.env.clone()),
                locals: Vec::new(),
                refs: Vec::new(),
            }),
            None => def.env.clone(),
        };
        for (param, arg) in def.params.iter().zip(args) {
            let value = self.bind_expr(call_scope, arg)?;
            env = env.with_reference(param.clone(), value);
        }

        self.depth += 1;
        if self.depth > MAX_CALC_DEPTH {
            self.depth -= 1;
            return Err(Error::new_simple(
                "this definition is recursive or nested too deeply",
            )
            .with_span(Some(span)));
        }
        let result = self.bind_resolved(&env, &def.body);
        self.depth -= 1;
        let mut resolved = result?;
        resolved.expr.span = span;
        Ok(resolved)
    }

    fn bind_call(
        &mut self,
        scope: &Rc<Scope>,
        call: &syntax::Call,
        pre: Option<Resolved>,
        span: Span,
    ) -> Result<Resolved, Error> {
        let name = call.name.as_str();

        // user-defined calculations win over built-ins
        if pre.is_none() {
            if let Some(Local::Calc(def)) = scope.local(name).cloned() {
                return self.bind_calc(&def, None, scope, &call.args, span);
            }
        }
        let method_scope = match &pre {
            Some(resolved) => resolved.follow.clone().unwrap_or_else(|| scope.clone()),
            None => scope.clone(),
        };
        if let Some(class) = method_scope.flow.class(self.catalog) {
            if let Some(def) = self.class_calc(class, name) {
                return self.bind_calc(
                    &def,
                    Some(method_scope.flow.clone()),
                    scope,
                    &call.args,
                    span,
                );
            }
        }

        match name {
            "define" => self.bind_define(&method_scope, call, span),
            "where" => self.bind_where(&method_scope, call, span),
            "as" => self.bind_as(scope, pre, call, span),
            "sort" => self.bind_sort(scope, pre, call, span),
            "limit" => self.bind_limit(scope, pre, call, span),
            "filter" => self.bind_filter(scope, pre, call, span),
            "select" => self.bind_select_fn(scope, pre, call, span),
            "fork" => self.bind_fork(scope, pre, call, span),
            "distinct" => self.bind_distinct(scope, pre, call, span),
            "count" | "exists" | "every" | "sum" | "avg" | "min" | "max" => {
                self.bind_aggregate(scope, pre, call, span)
            }
            "string" | "integer" | "decimal" | "float" | "boolean" | "date" | "time"
            | "datetime" => self.bind_cast_call(scope, pre, call, span),
            "if" => self.bind_if(scope, pre, call, span),
            "switch" => self.bind_switch(scope, pre, call, span),
            "true" | "false" | "null" | "today" | "now" | "this" | "root"
                if call.args.is_empty() && pre.is_none() =>
            {
                Ok(self.bind_niladic(scope, name, span)?.unwrap())
            }
            _ => {
                let mut args = Vec::new();
                if let Some(resolved) = pre {
                    self.expect_scalar(&resolved.expr)?;
                    args.push(resolved.expr);
                }
                for arg in &call.args {
                    let value = self.bind_expr(scope, arg)?;
                    self.expect_scalar(&value)?;
                    args.push(value);
                }
                match call::scalar(name, args, span) {
                    Some(result) => Ok(Resolved::plain(result?)),
                    None => Err(Error::new(Reason::NotFound {
                        name: name.to_string(),
                        namespace: "function".to_string(),
                    })
                    .with_span(Some(call.name_span))),
                }
            }
        }
    }

    /// The flow a flow-operation applies to: the method receiver, or the
    /// first argument. Returns the flow, the scope inside it, and the
    /// remaining arguments.
    fn flow_and_rest<'s>(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &'s syntax::Call,
        span: Span,
    ) -> Result<(Rc<Flow>, Rc<Scope>, &'s [syntax::Expr]), Error> {
        let (resolved, rest) = match pre {
            Some(resolved) => (resolved, call.args.as_slice()),
            None => {
                let first = call.args.first().ok_or_else(|| {
                    Error::new(Reason::Expected {
                        who: Some(format!("`{}`", call.name)),
                        expected: "a flow argument".to_string(),
                        found: "none".to_string(),
                    })
                    .with_span(Some(span))
                })?;
                (self.bind_resolved(scope, first)?, &call.args[1..])
            }
        };
        let flow = match resolved.expr.flow() {
            Some(flow) => flow.clone(),
            None => {
                return Err(Error::new(Reason::TypeMismatch {
                    expected: "a flow".to_string(),
                    found: resolved.expr.domain.to_string(),
                })
                .with_span(Some(resolved.expr.span)))
            }
        };
        let inner = resolved
            .follow
            .unwrap_or_else(|| scope.enter(flow.clone()));
        Ok((flow, inner, rest))
    }

    fn bind_define(
        &mut self,
        method_scope: &Rc<Scope>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let mut extended = method_scope.clone();
        for arg in &call.args {
            let (target, value) = match &arg.kind {
                syntax::ExprKind::Assign { target, value } => (target, value),
                _ => {
                    return Err(Error::new(Reason::Expected {
                        who: Some("`define`".to_string()),
                        expected: "an assignment".to_string(),
                        found: "an expression".to_string(),
                    })
                    .with_span(Some(arg.span)))
                }
            };
            extended = self.bind_definition(&extended, target, value)?;
        }
        Ok(Resolved {
            expr: Expr::new(
                ExprKind::FlowValue(extended.flow.clone()),
                Domain::Record,
                span,
            ),
            follow: Some(extended),
        })
    }

    fn bind_definition(
        &mut self,
        scope: &Rc<Scope>,
        target: &syntax::Expr,
        value: &syntax::Expr,
    ) -> Result<Rc<Scope>, Error> {
        match &target.kind {
            syntax::ExprKind::Ident(name) => {
                let bound = self.bind_expr(scope, value)?;
                Ok(scope.with_local(name.clone(), Local::Value(bound)))
            }
            syntax::ExprKind::Reference(name) => {
                let bound = self.bind_expr(scope, value)?;
                Ok(scope.with_reference(name.clone(), bound))
            }
            syntax::ExprKind::Call(calc) => {
                let params = self.calc_params(calc)?;
                Ok(scope.with_local(
                    calc.name.clone(),
                    Local::Calc(Rc::new(CalcDef {
                        params,
                        body: value.clone(),
                        env: scope.clone(),
                    })),
                ))
            }
            syntax::ExprKind::Compose { left, right } => {
                let class_name = match &left.kind {
                    syntax::ExprKind::Ident(name) => name,
                    _ => {
                        return Err(Error::new_simple(
                            "only `class.name := expr` definitions may use `.`",
                        )
                        .with_span(Some(target.span)))
                    }
                };
                let class = self
                    .catalog
                    .entity(class_name)
                    .ok_or_else(|| {
                        Error::new(Reason::NotFound {
                            name: class_name.clone(),
                            namespace: "the root scope".to_string(),
                        })
                        .with_span(Some(left.span))
                    })?
                    .id;
                let (name, params) = match &right.kind {
                    syntax::ExprKind::Ident(name) => (name.clone(), Vec::new()),
                    syntax::ExprKind::Call(calc) => {
                        (calc.name.clone(), self.calc_params(calc)?)
                    }
                    _ => {
                        return Err(Error::new_simple("cannot define this target")
                            .with_span(Some(right.span)))
                    }
                };
                self.class_locals.entry(class).or_default().push((
                    name,
                    Rc::new(CalcDef {
                        params,
                        body: value.clone(),
                        env: scope.clone(),
                    }),
                ));
                Ok(scope.clone())
            }
            _ => Err(Error::new_simple("cannot define this target").with_span(Some(target.span))),
        }
    }

    fn calc_params(&self, calc: &syntax::Call) -> Result<Vec<String>, Error> {
        calc.args
            .iter()
            .map(|p| match &p.kind {
                syntax::ExprKind::Reference(name) => Ok(name.clone()),
                _ => Err(Error::new_simple(
                    "calculation parameters must be `$name` references",
                )
                .with_span(Some(p.span))),
            })
            .try_collect()
    }

    fn bind_where(
        &mut self,
        method_scope: &Rc<Scope>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        if call.args.is_empty() {
            return Err(Error::new(Reason::Expected {
                who: Some("`where`".to_string()),
                expected: "an expression".to_string(),
                found: "no arguments".to_string(),
            })
            .with_span(Some(span)));
        }
        let mut extended = method_scope.clone();
        for arg in &call.args[1..] {
            let (target, value) = match &arg.kind {
                syntax::ExprKind::Assign { target, value } => (target, value),
                _ => {
                    return Err(Error::new(Reason::Expected {
                        who: Some("`where`".to_string()),
                        expected: "an assignment".to_string(),
                        found: "an expression".to_string(),
                    })
                    .with_span(Some(arg.span)))
                }
            };
            extended = self.bind_definition(&extended, target, value)?;
        }
        let resolved = self.bind_resolved(&extended, &call.args[0])?;
        let mut expr = resolved.expr;
        expr.span = span;
        let follow = self.follow_for(method_scope, &expr);
        Ok(Resolved { expr, follow })
    }

    fn bind_as(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let wrong_shape = || {
            Error::new(Reason::Expected {
                who: Some("`as`".to_string()),
                expected: "a value and a string title".to_string(),
                found: "something else".to_string(),
            })
            .with_span(Some(span))
        };

        let (mut resolved, title_arg) = match (pre, call.args.as_slice()) {
            (Some(resolved), [title]) => (resolved, title),
            (None, [value, title]) => (self.bind_resolved(scope, value)?, title),
            _ => return Err(wrong_shape()),
        };
        let title = match &title_arg.kind {
            syntax::ExprKind::Literal(Literal::Text(text)) => text.clone(),
            _ => return Err(wrong_shape()),
        };
        resolved.expr.alias = Some(title);
        resolved.expr.span = span;
        Ok(resolved)
    }

    fn bind_sort(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner, keys) = self.flow_and_rest(scope, pre, call, span)?;
        let mut sort_keys = Vec::new();
        for key in keys {
            let (key_syntax, direction) = match &key.kind {
                syntax::ExprKind::Direction { expr, direction } => (expr.as_ref(), *direction),
                _ => (key, Direction::Asc),
            };
            let code = self.bind_expr(&inner, key_syntax)?;
            self.check_sortable(&code)?;
            sort_keys.push(SortKey { code, direction });
        }
        if sort_keys.is_empty() {
            return Err(Error::new(Reason::Expected {
                who: Some("`sort`".to_string()),
                expected: "at least one key".to_string(),
                found: "none".to_string(),
            })
            .with_span(Some(span)));
        }
        let flow = Flow::new(
            FlowKind::Sort {
                base: flow,
                keys: sort_keys,
            },
            span,
        );
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow), Domain::Record, span),
            follow: Some(follow),
        })
    }

    fn bind_limit(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner, rest) = self.flow_and_rest(scope, pre, call, span)?;
        if rest.is_empty() || rest.len() > 2 {
            return Err(Error::new(Reason::Expected {
                who: Some("`limit`".to_string()),
                expected: "limit(count) or limit(count, skip)".to_string(),
                found: format!("{} argument(s)", rest.len()),
            })
            .with_span(Some(span)));
        }
        let limit = self.literal_count(&rest[0])?;
        let offset = rest.get(1).map(|arg| self.literal_count(arg)).transpose()?;
        let flow = Flow::new(
            FlowKind::Slice {
                base: flow,
                limit: Some(limit),
                offset,
            },
            span,
        );
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow), Domain::Record, span),
            follow: Some(follow),
        })
    }

    fn literal_count(&self, arg: &syntax::Expr) -> Result<u64, Error> {
        match &arg.kind {
            syntax::ExprKind::Group(inner) => self.literal_count(inner),
            syntax::ExprKind::Literal(Literal::Integer(n)) => Ok(*n as u64),
            syntax::ExprKind::Unary {
                op: UnOp::Neg | UnOp::Pos,
                expr,
            } => {
                if matches!(
                    expr.kind,
                    syntax::ExprKind::Literal(Literal::Integer(_))
                ) && matches!(arg.kind, syntax::ExprKind::Unary { op: UnOp::Neg, .. })
                {
                    Err(Error::new(Reason::NegativeLimit).with_span(Some(arg.span)))
                } else {
                    self.literal_count(expr)
                }
            }
            syntax::ExprKind::Literal(other) => Err(Error::new(Reason::NonIntegerLimit {
                found: other.to_string(),
            })
            .with_span(Some(arg.span))),
            _ => Err(Error::new(Reason::NonIntegerLimit {
                found: "an expression".to_string(),
            })
            .with_span(Some(arg.span))),
        }
    }

    fn bind_filter(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner, rest) = self.flow_and_rest(scope, pre, call, span)?;
        let [predicate] = rest else {
            return Err(Error::new(Reason::Expected {
                who: Some("`filter`".to_string()),
                expected: "one predicate".to_string(),
                found: format!("{} argument(s)", rest.len()),
            })
            .with_span(Some(span)));
        };
        let predicate = coerce::truth(self.bind_expr(&inner, predicate)?)?;
        let flow = Flow::new(
            FlowKind::Sieve {
                base: flow,
                predicate,
            },
            span,
        );
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow), Domain::Record, span),
            follow: Some(follow),
        })
    }

    fn bind_select_fn(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner, rest) = self.flow_and_rest(scope, pre, call, span)?;
        let (items, sort_keys) = self.bind_elements(&inner, rest)?;
        let flow = if sort_keys.is_empty() {
            flow
        } else {
            Flow::new(
                FlowKind::Sort {
                    base: flow,
                    keys: sort_keys,
                },
                span,
            )
        };
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(
                ExprKind::Selection(Selection { flow, items }),
                Domain::Record,
                span,
            ),
            follow: Some(follow),
        })
    }

    fn bind_fork(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let (flow, inner) = match pre {
            Some(resolved) => {
                let flow = match resolved.expr.flow() {
                    Some(flow) => flow.clone(),
                    None => {
                        return Err(Error::new(Reason::TypeMismatch {
                            expected: "a flow".to_string(),
                            found: resolved.expr.domain.to_string(),
                        })
                        .with_span(Some(resolved.expr.span)))
                    }
                };
                let inner = resolved
                    .follow
                    .unwrap_or_else(|| scope.enter(flow.clone()));
                (flow, inner)
            }
            None => (scope.flow.clone(), scope.clone()),
        };
        if flow.class(self.catalog).is_none() {
            return Err(
                Error::new_simple("`fork` needs an entity flow").with_span(Some(span))
            );
        }
        let mut kernel = Vec::new();
        for arg in &call.args {
            let code = self.bind_expr(&inner, arg)?;
            self.expect_scalar(&code)?;
            kernel.push(code);
        }
        let flow = Flow::new(FlowKind::Forked { base: flow, kernel }, span);
        let follow = inner.with_flow(flow.clone());
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow), Domain::Record, span),
            follow: Some(follow),
        })
    }

    fn bind_distinct(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let resolved = match pre {
            Some(resolved) => resolved,
            None => {
                let [arg] = call.args.as_slice() else {
                    return Err(Error::new(Reason::Expected {
                        who: Some("`distinct`".to_string()),
                        expected: "one selection argument".to_string(),
                        found: format!("{}", call.args.len()),
                    })
                    .with_span(Some(span)));
                };
                self.bind_resolved(scope, arg)?
            }
        };
        let ExprKind::Selection(selection) = resolved.expr.kind else {
            return Err(Error::new(Reason::InvalidProjection {
                detail: "`distinct` needs a selection, e.g. distinct(school{campus})"
                    .to_string(),
            })
            .with_span(Some(span)));
        };
        let kernel = selection
            .items
            .into_iter()
            .map(|item| {
                let name = item.alias.clone().or_else(|| match &item.kind {
                    ExprKind::Column { flow, attribute } => flow
                        .class(self.catalog)
                        .map(|class| self.catalog.attributes(class)[*attribute].name.clone()),
                    _ => None,
                });
                KernelPart { name, code: item }
            })
            .collect_vec();
        if kernel.iter().any(|part| !part.code.domain.is_scalar()) {
            return Err(Error::new(Reason::InvalidKernel {
                detail: "kernel parts must be scalar".to_string(),
            })
            .with_span(Some(span)));
        }
        let flow = Flow::new(
            FlowKind::Quotient {
                base: selection.flow,
                kernel,
            },
            span,
        );
        Ok(Resolved {
            expr: Expr::new(ExprKind::FlowValue(flow.clone()), Domain::Record, span),
            follow: Some(scope.enter(flow)),
        })
    }

    fn bind_aggregate(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let func = match call.name.as_str() {
            "count" => AggFunc::Count,
            "exists" => AggFunc::Exists,
            "every" => AggFunc::Every,
            "sum" => AggFunc::Sum,
            "avg" => AggFunc::Avg,
            "min" => AggFunc::Min,
            "max" => AggFunc::Max,
            _ => unreachable!(),
        };

        let mut inputs: Vec<Expr> = Vec::new();
        if let Some(resolved) = pre {
            inputs.push(resolved.expr);
        }
        for arg in &call.args {
            inputs.push(self.bind_expr(scope, arg)?);
        }
        let [input] = <[Expr; 1]>::try_from(inputs).map_err(|inputs| {
            Error::new(Reason::Expected {
                who: Some(format!("`{}`", call.name)),
                expected: "one argument".to_string(),
                found: format!("{}", inputs.len()),
            })
            .with_span(Some(span))
        })?;

        let flow_input = match &input.kind {
            ExprKind::FlowValue(flow) => Some(flow.clone()),
            ExprKind::Selection(selection) => Some(selection.flow.clone()),
            _ => None,
        };

        let (agg_input, domain) = match (func, flow_input) {
            (AggFunc::Count, Some(flow)) => (AggInput::Flow(flow), Domain::Integer),
            (AggFunc::Count, None) => (AggInput::Code(Box::new(input)), Domain::Integer),
            (AggFunc::Exists, Some(flow)) => (AggInput::Flow(flow), Domain::Boolean),
            (AggFunc::Exists, None) => (
                AggInput::Code(Box::new(coerce::truth(input)?)),
                Domain::Boolean,
            ),
            (AggFunc::Every, Some(_)) => {
                return Err(Error::new(Reason::TypeMismatch {
                    expected: Domain::Boolean.to_string(),
                    found: Domain::Record.to_string(),
                })
                .with_span(Some(span)))
            }
            (AggFunc::Every, None) => (
                AggInput::Code(Box::new(coerce::truth(input)?)),
                Domain::Boolean,
            ),
            (AggFunc::Sum, None) => {
                let input = self.to_numeric(input)?;
                let domain = input.domain.clone();
                (AggInput::Code(Box::new(input)), domain)
            }
            (AggFunc::Avg, None) => {
                let input = self.to_numeric(input)?;
                let domain = if input.domain == Domain::Float {
                    Domain::Float
                } else {
                    Domain::Decimal
                };
                (AggInput::Code(Box::new(input)), domain)
            }
            (AggFunc::Min | AggFunc::Max, None) => {
                if !input.domain.is_orderable() {
                    return Err(Error::new(Reason::OrderingNotSupported {
                        domain: input.domain.to_string(),
                    })
                    .with_span(Some(input.span)));
                }
                let domain = input.domain.clone();
                (AggInput::Code(Box::new(input)), domain)
            }
            (AggFunc::Sum | AggFunc::Avg | AggFunc::Min | AggFunc::Max, Some(_)) => {
                return Err(Error::new(Reason::TypeMismatch {
                    expected: "a scalar value".to_string(),
                    found: Domain::Record.to_string(),
                })
                .with_span(Some(span)))
            }
        };

        Ok(Resolved::plain(Expr::new(
            ExprKind::Aggregate {
                func,
                over: scope.flow.clone(),
                input: agg_input,
            },
            domain,
            span,
        )))
    }

    fn bind_cast_call(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let target = match call.name.as_str() {
            "string" => Domain::Text,
            "integer" => Domain::Integer,
            "decimal" => Domain::Decimal,
            "float" => Domain::Float,
            "boolean" => Domain::Boolean,
            "date" => Domain::Date,
            "time" => Domain::Time,
            "datetime" => Domain::DateTime,
            _ => unreachable!(),
        };

        let mut inputs: Vec<Expr> = Vec::new();
        if let Some(resolved) = pre {
            inputs.push(resolved.expr);
        }
        for arg in &call.args {
            inputs.push(self.bind_expr(scope, arg)?);
        }
        let [input] = <[Expr; 1]>::try_from(inputs).map_err(|inputs| {
            Error::new(Reason::Expected {
                who: Some(format!("`{}`", call.name)),
                expected: "one argument".to_string(),
                found: format!("{}", inputs.len()),
            })
            .with_span(Some(span))
        })?;

        if input.domain == target {
            return Ok(Resolved::plain(input));
        }
        if input.domain == Domain::Untyped {
            if matches!(input.kind, ExprKind::Literal(_)) {
                return Ok(Resolved::plain(coerce::pin(input, &target)?));
            }
        }
        if target == Domain::Boolean {
            return Ok(Resolved::plain(coerce::truth(input)?));
        }

        let from = &input.domain;
        let allowed = matches!(
            (from, &target),
            (Domain::Untyped | Domain::Text, _)
                | (_, Domain::Text)
                | (Domain::Integer | Domain::Decimal | Domain::Float, Domain::Integer)
                | (Domain::Integer | Domain::Decimal | Domain::Float, Domain::Decimal)
                | (Domain::Integer | Domain::Decimal | Domain::Float, Domain::Float)
                | (Domain::Date, Domain::DateTime)
                | (Domain::DateTime, Domain::Date)
                | (Domain::DateTime, Domain::Time)
                | (Domain::Enum(_), Domain::Text)
        );
        if !allowed {
            return Err(Error::new(Reason::BadCast {
                from: from.to_string(),
                to: target.to_string(),
            })
            .with_span(Some(span)));
        }

        Ok(Resolved::plain(Expr::new(
            ExprKind::Cast {
                expr: Box::new(input),
                domain: target.clone(),
            },
            target,
            span,
        )))
    }

    fn bind_if(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let mut args: Vec<Expr> = Vec::new();
        if let Some(resolved) = pre {
            args.push(resolved.expr);
        }
        for arg in &call.args {
            args.push(self.bind_expr(scope, arg)?);
        }
        if args.len() < 2 {
            return Err(Error::new(Reason::Expected {
                who: Some("`if`".to_string()),
                expected: "a condition and a value".to_string(),
                found: format!("{} argument(s)", args.len()),
            })
            .with_span(Some(span)));
        }

        let otherwise = if args.len() % 2 == 1 {
            Some(args.pop().unwrap())
        } else {
            None
        };
        let mut branches = Vec::new();
        let mut values = Vec::new();
        for (condition, value) in args.into_iter().tuples() {
            branches.push(coerce::truth(condition)?);
            values.push(value);
        }
        self.finish_if(branches, values, otherwise, span)
    }

    fn bind_switch(
        &mut self,
        scope: &Rc<Scope>,
        pre: Option<Resolved>,
        call: &syntax::Call,
        span: Span,
    ) -> Result<Resolved, Error> {
        let mut args: Vec<Expr> = Vec::new();
        if let Some(resolved) = pre {
            args.push(resolved.expr);
        }
        for arg in &call.args {
            args.push(self.bind_expr(scope, arg)?);
        }
        if args.len() < 3 {
            return Err(Error::new(Reason::Expected {
                who: Some("`switch`".to_string()),
                expected: "a subject, cases and values".to_string(),
                found: format!("{} argument(s)", args.len()),
            })
            .with_span(Some(span)));
        }
        let subject = args.remove(0);
        self.expect_scalar(&subject)?;
        let otherwise = if args.len() % 2 == 1 {
            Some(args.pop().unwrap())
        } else {
            None
        };
        let mut branches = Vec::new();
        let mut values = Vec::new();
        for (case, value) in args.into_iter().tuples() {
            branches.push(coerce::binary(BinOp::Eq, subject.clone(), case, span)?);
            values.push(value);
        }
        self.finish_if(branches, values, otherwise, span)
    }

    /// Unifies all result arms to the most general domain and assembles the
    /// If node; a missing else arm is null of that domain.
    fn finish_if(
        &mut self,
        conditions: Vec<Expr>,
        values: Vec<Expr>,
        otherwise: Option<Expr>,
        span: Span,
    ) -> Result<Resolved, Error> {
        let mut domain = Domain::Untyped;
        for value in values.iter().chain(otherwise.iter()) {
            domain = coerce::unify(&domain, &value.domain).ok_or_else(|| {
                Error::new(Reason::TypeMismatch {
                    expected: domain.to_string(),
                    found: value.domain.to_string(),
                })
                .with_span(Some(value.span))
            })?;
        }
        if domain == Domain::Untyped {
            domain = Domain::Text;
        }

        let values = values
            .into_iter()
            .map(|value| coerce::pin(value, &domain))
            .collect::<Result<Vec<_>, _>>()?;
        let otherwise = otherwise
            .map(|value| coerce::pin(value, &domain))
            .transpose()?
            .map(Box::new);

        let branches = conditions.into_iter().zip(values).collect_vec();
        Ok(Resolved::plain(Expr::new(
            ExprKind::If {
                branches,
                otherwise,
            },
            domain,
            span,
        )))
    }

    /// The deepest flow a code draws from; output normalization uses it as
    /// the segment flow for bare codes like `/count(school)`.
    fn home_flow(&self, expr: &Expr, default: &Rc<Flow>) -> Rc<Flow> {
        let mut best = default.clone();
        collect_flows(expr, &mut |flow| {
            if is_ancestor(&best, flow) {
                best = flow.clone();
            }
        });
        best
    }
}

fn collect_flows(expr: &Expr, visit: &mut impl FnMut(&Rc<Flow>)) {
    match &expr.kind {
        ExprKind::Column { flow, .. } => visit(flow),
        ExprKind::KernelRef { quotient, .. } => visit(quotient),
        ExprKind::Aggregate { over, .. } => visit(over),
        ExprKind::Formula { args, .. } => {
            for arg in args {
                collect_flows(arg, visit);
            }
        }
        ExprKind::If {
            branches,
            otherwise,
        } => {
            for (condition, value) in branches {
                collect_flows(condition, visit);
                collect_flows(value, visit);
            }
            if let Some(value) = otherwise {
                collect_flows(value, visit);
            }
        }
        ExprKind::Cast { expr, .. } | ExprKind::Truth { expr } => collect_flows(expr, visit),
        _ => {}
    }
}
