//! Bound tree produced by the binder.
//!
//! Every identifier is resolved against the catalog and the scope stack,
//! every call and operator is matched to a concrete operation, and every
//! expression carries a [Domain]. Flows form a DAG shared through `Rc`;
//! nothing is mutated after construction.

use std::rc::Rc;

use super::{AggFunc, Direction, Literal, Op};
use crate::catalog::{Catalog, ClassId, Domain, LinkId};
use crate::error::Span;

/// A sequence of rows: an ancestor flow plus one operation.
#[derive(Debug, Clone)]
pub struct Flow {
    pub kind: FlowKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum FlowKind {
    /// The scalar singleton every query starts from.
    Root,
    /// All rows of an entity class.
    Class { base: Rc<Flow>, class: ClassId },
    /// Link traversal.
    Traverse { base: Rc<Flow>, link: LinkId },
    Sieve {
        base: Rc<Flow>,
        predicate: Expr,
    },
    Sort {
        base: Rc<Flow>,
        keys: Vec<SortKey>,
    },
    Slice {
        base: Rc<Flow>,
        limit: Option<u64>,
        offset: Option<u64>,
    },
    /// Distinct tuples of the kernel over the base flow.
    Quotient {
        base: Rc<Flow>,
        kernel: Vec<KernelPart>,
    },
    /// The reverse link from a quotient back to its base flow.
    Complement { quotient: Rc<Flow> },
    /// Arbitrary link: `seed -> target{counterpart}`.
    Linked {
        base: Rc<Flow>,
        seeds: Vec<Expr>,
        target: Rc<Flow>,
        counterparts: Vec<Expr>,
    },
    /// Self-link on kernel equality.
    Forked {
        base: Rc<Flow>,
        kernel: Vec<Expr>,
    },
}

impl Flow {
    pub fn new(kind: FlowKind, span: Span) -> Rc<Flow> {
        Rc::new(Flow { kind, span })
    }

    pub fn base(&self) -> Option<&Rc<Flow>> {
        match &self.kind {
            FlowKind::Root => None,
            FlowKind::Class { base, .. }
            | FlowKind::Traverse { base, .. }
            | FlowKind::Sieve { base, .. }
            | FlowKind::Sort { base, .. }
            | FlowKind::Slice { base, .. }
            | FlowKind::Quotient { base, .. }
            | FlowKind::Linked { base, .. }
            | FlowKind::Forked { base, .. } => Some(base),
            FlowKind::Complement { quotient } => Some(quotient),
        }
    }

    /// The entity class whose records this flow ranges over, if any.
    pub fn class(&self, catalog: &Catalog) -> Option<ClassId> {
        match &self.kind {
            FlowKind::Root | FlowKind::Quotient { .. } => None,
            FlowKind::Class { class, .. } => Some(*class),
            FlowKind::Traverse { link, .. } => Some(catalog.link(*link).target),
            FlowKind::Sieve { base, .. }
            | FlowKind::Sort { base, .. }
            | FlowKind::Slice { base, .. }
            | FlowKind::Forked { base, .. } => base.class(catalog),
            FlowKind::Complement { quotient } => match &quotient.kind {
                FlowKind::Quotient { base, .. } => base.class(catalog),
                _ => None,
            },
            FlowKind::Linked { target, .. } => target.class(catalog),
        }
    }

    /// Whether this step multiplies rows relative to its base.
    pub fn is_plural_step(&self, catalog: &Catalog) -> bool {
        match &self.kind {
            FlowKind::Root
            | FlowKind::Sieve { .. }
            | FlowKind::Sort { .. }
            | FlowKind::Slice { .. } => false,
            FlowKind::Class { .. }
            | FlowKind::Quotient { .. }
            | FlowKind::Complement { .. }
            | FlowKind::Linked { .. }
            | FlowKind::Forked { .. } => true,
            FlowKind::Traverse { link, .. } => catalog.link(*link).is_plural(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SortKey {
    pub code: Expr,
    pub direction: Direction,
}

#[derive(Debug, Clone)]
pub struct KernelPart {
    pub name: Option<String>,
    pub code: Expr,
}

/// A scalar (or flow-valued) expression with a resolved domain.
#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub domain: Domain,
    pub alias: Option<String>,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, domain: Domain, span: Span) -> Self {
        Expr {
            kind,
            domain,
            alias: None,
            span,
        }
    }

    pub fn flow(&self) -> Option<&Rc<Flow>> {
        match &self.kind {
            ExprKind::FlowValue(flow) => Some(flow),
            ExprKind::Selection(selection) => Some(&selection.flow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    /// A flow used as a value (record domain).
    FlowValue(Rc<Flow>),
    Column {
        flow: Rc<Flow>,
        attribute: usize,
    },
    /// A named part of a quotient's kernel, seen from the quotient's scope.
    KernelRef {
        quotient: Rc<Flow>,
        index: usize,
    },
    Literal(Literal),
    /// A `$name` supplied by the caller at execution time.
    Parameter { name: String },
    Formula {
        op: Op,
        args: Vec<Expr>,
    },
    If {
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Aggregate {
        func: AggFunc,
        /// The flow the aggregate is singular over.
        over: Rc<Flow>,
        input: AggInput,
    },
    Cast {
        expr: Box<Expr>,
        domain: Domain,
    },
    /// Tri-valued boolean coercion of a text operand: null and the empty
    /// string are false, everything else is true.
    Truth {
        expr: Box<Expr>,
    },
    Selection(Selection),
    /// `/sub` inside a selection: a correlated child sequence.
    NestedSegment(Selection),
}

#[derive(Debug, Clone)]
pub enum AggInput {
    Flow(Rc<Flow>),
    Code(Box<Expr>),
}

/// A flow together with its output tuple.
#[derive(Debug, Clone)]
pub struct Selection {
    pub flow: Rc<Flow>,
    pub items: Vec<Expr>,
}

/// The fully bound query.
#[derive(Debug, Clone)]
pub struct Query {
    pub selection: Selection,
    pub format: Option<String>,
    pub span: Span,
}
