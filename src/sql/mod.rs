//! Backend for translating the term tree into SQL text.

mod dialect;
mod gen_expr;
mod gen_query;

pub use dialect::Dialect;

use anyhow::Result;

use crate::ast::term::Statement;
use crate::catalog::{Catalog, Domain};

/// SQL writer options.
#[derive(Debug, Clone)]
pub struct Options {
    pub dialect: Dialect,
    /// Reflow the rendered SQL for human eyes.
    pub format: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            dialect: Dialect::default(),
            format: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlOutput {
    /// One SELECT per output level; nested levels share their parent's
    /// ordering prefix.
    pub statements: Vec<String>,
    /// Bound parameters in placeholder order.
    pub parameters: Vec<(String, Domain)>,
}

/// Render the term tree for a dialect.
pub fn write(
    statements: &[Statement],
    catalog: &Catalog,
    options: &Options,
) -> Result<SqlOutput> {
    let mut ctx = gen_expr::Context {
        dialect: options.dialect.handler(),
        catalog,
        parameters: Vec::new(),
    };

    let mut rendered = Vec::new();
    for statement in statements {
        let query = gen_query::translate_statement(statement, &mut ctx)?;
        let sql = query.to_string();
        let sql = if options.format {
            sqlformat::format(
                &sql,
                &sqlformat::QueryParams::default(),
                sqlformat::FormatOptions::default(),
            )
        } else {
            sql
        };
        rendered.push(sql);
    }
    log::debug!(
        "rendered {} statement(s) with {} bound parameter(s)",
        rendered.len(),
        ctx.parameters.len()
    );

    Ok(SqlOutput {
        statements: rendered,
        parameters: ctx.parameters,
    })
}
