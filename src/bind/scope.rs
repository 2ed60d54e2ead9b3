//! Scope stack for name resolution.
//!
//! A scope pairs a base flow with the names visible over it. Scopes are
//! persistent: extending one produces a new scope sharing its parent, so
//! `define`/`where` never mutate an environment someone else holds.

use std::rc::Rc;

use crate::ast::{bound, syntax};

#[derive(Debug, Clone)]
pub struct Scope {
    pub flow: Rc<bound::Flow>,
    /// Lexically enclosing scope; reachable only through `$name` references.
    pub parent: Option<Rc<Scope>>,
    pub locals: Vec<(String, Local)>,
    pub refs: Vec<(String, bound::Expr)>,
}

#[derive(Debug, Clone)]
pub enum Local {
    /// `name := expr`, bound eagerly at its definition point.
    Value(bound::Expr),
    /// `name($p, …) := expr`, bound at each call site.
    Calc(Rc<CalcDef>),
}

#[derive(Debug)]
pub struct CalcDef {
    pub params: Vec<String>,
    pub body: syntax::Expr,
    /// Scope at the definition site; `$` references resolve against it.
    pub env: Rc<Scope>,
}

impl Scope {
    pub fn root(flow: Rc<bound::Flow>) -> Rc<Scope> {
        Rc::new(Scope {
            flow,
            parent: None,
            locals: Vec::new(),
            refs: Vec::new(),
        })
    }

    /// Walks into a flow: a fresh scope whose parent is `self`.
    pub fn enter(self: &Rc<Self>, flow: Rc<bound::Flow>) -> Rc<Scope> {
        Rc::new(Scope {
            flow,
            parent: Some(self.clone()),
            locals: Vec::new(),
            refs: Vec::new(),
        })
    }

    /// The same environment over a new flow; used when a flow operation
    /// (sieve, sort, slice) refines the scope's flow without changing the
    /// visible names.
    pub fn with_flow(self: &Rc<Self>, flow: Rc<bound::Flow>) -> Rc<Scope> {
        Rc::new(Scope {
            flow,
            parent: self.parent.clone(),
            locals: self.locals.clone(),
            refs: self.refs.clone(),
        })
    }

    pub fn with_local(self: &Rc<Self>, name: String, local: Local) -> Rc<Scope> {
        let mut locals = self.locals.clone();
        locals.push((name, local));
        Rc::new(Scope {
            flow: self.flow.clone(),
            parent: self.parent.clone(),
            locals,
            refs: self.refs.clone(),
        })
    }

    pub fn with_reference(self: &Rc<Self>, name: String, value: bound::Expr) -> Rc<Scope> {
        let mut refs = self.refs.clone();
        refs.push((name, value));
        Rc::new(Scope {
            flow: self.flow.clone(),
            parent: self.parent.clone(),
            locals: self.locals.clone(),
            refs,
        })
    }

    /// Latest local binding for `name` in this scope, if any.
    pub fn local(&self, name: &str) -> Option<&Local> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, local)| local)
    }

    /// Resolves `$name`, walking outward through enclosing scopes.
    pub fn reference(&self, name: &str) -> Option<&bound::Expr> {
        if let Some((_, value)) = self.refs.iter().rev().find(|(n, _)| n == name) {
            return Some(value);
        }
        self.parent.as_ref().and_then(|p| p.reference(name))
    }
}
