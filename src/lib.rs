//! Compiler for the NavQL query language.
//! Translates URI-style navigational queries into SQL.
//!
//! You probably want to start with the [compile] wrapper function.
//!
//! For more granular access, refer to this diagram:
//! ```ascii
//!                 NavQL
//!
//!       (parse)    │        percent decoding, lexing, grammar
//! syntax_of_source │
//!                  ▼
//!                       ────────►
//!             syntax tree          JSON (json_of_syntax)
//!                       ◄────────
//!       (bind)     │        scopes, overloads, domains
//!                  ▼
//!              bound tree
//!       (encode)   │        flows, codes, singular/plural units
//!                  ▼
//!              flow tree
//!       (assemble) │        joins, grouped units, ordering
//!                  ▼
//!              term tree
//!       (write)    │        dialect profile
//!                  ▼
//!
//!                  SQL
//! ```

// Our error type carries several strings and an enum, which lands right on
// the default large-error lint threshold. We are not performance sensitive
// on the error path.
#![allow(clippy::result_large_err)]

mod assemble;
pub mod ast;
mod bind;
pub mod catalog;
mod encode;
mod error;
mod parser;
pub mod sql;
#[cfg(test)]
mod test;
mod utils;

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use serde::Serialize;

pub use catalog::{Catalog, CatalogBuilder, Domain};
pub use error::{ErrorMessage, ErrorMessages, Severity, SourceLocation, Span};
pub use sql::Dialect;

use crate::ast::flow::{CodeKind, FlowKind, OutputItem, Segment};

/// Compile options: the target dialect, formatting, and the declared
/// domains of `$name` parameters.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub dialect: Dialect,
    /// Reflow the rendered SQL for human eyes.
    pub format: bool,
    /// Domains of query parameters; unspecified parameters are untyped.
    pub parameters: HashMap<String, Domain>,
    /// Colored diagnostics.
    pub color: bool,
}

/// A query parameter the embedder must bind at execution time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
    pub name: String,
    pub domain: Domain,
}

/// Shape of one output column.
#[derive(Debug, Clone, Serialize)]
pub struct OutputColumn {
    pub name: String,
    pub domain: Domain,
    pub nullable: bool,
    /// Present when the column is a nested segment.
    pub nested: Option<OutputSchema>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSchema {
    pub columns: Vec<OutputColumn>,
}

/// The result of a successful compilation.
#[derive(Debug, Clone)]
pub struct Compiled {
    /// All statements joined; the common single-level case is one SELECT.
    pub sql: String,
    /// One SELECT per output level, parents first.
    pub statements: Vec<String>,
    /// Bound parameters in placeholder order.
    pub parameters: Vec<Parameter>,
    pub schema: OutputSchema,
    /// The `/:name` format decorator, for the embedder's formatter.
    pub format: Option<String>,
    pub warnings: Vec<ErrorMessage>,
}

/// Compile a NavQL query against a catalog snapshot.
///
/// This is a wrapper for:
/// - [syntax_of_source] — percent-decode and parse the query text
/// - `bind` — resolve names and overloads against the catalog
/// - `encode` — lower to the flow algebra, enforcing plurality
/// - `assemble` — choose joins and orderings
/// - `sql::write` — render for the dialect
pub fn compile(
    source: &str,
    catalog: &Catalog,
    options: &Options,
) -> Result<Compiled, ErrorMessages> {
    let decoded = parser::percent_decode(source)
        .map_err(error::downcast)
        .map_err(|e| e.composed("", source, options.color))?;

    compile_decoded(&decoded, catalog, options)
        .map_err(error::downcast)
        .map_err(|e| e.composed("", &decoded, options.color))
}

fn compile_decoded(
    decoded: &str,
    catalog: &Catalog,
    options: &Options,
) -> anyhow::Result<Compiled> {
    let syntax = parser::parse(decoded)?;
    let (bound, warnings) = bind::bind(&syntax, catalog, &options.parameters)?;
    let flow = encode::encode(&bound, catalog)?;
    let statements = assemble::assemble(&flow, catalog)?;
    let output = sql::write(
        &statements,
        catalog,
        &sql::Options {
            dialect: options.dialect,
            format: options.format,
        },
    )?;

    let schema = output_schema(&flow.segment, decoded, catalog);
    let warnings = ErrorMessages {
        inner: warnings
            .into_iter()
            .map(|warning| ErrorMessage::from(warning).as_warning())
            .collect(),
    }
    .composed("", decoded, options.color)
    .inner;

    Ok(Compiled {
        sql: output.statements.join(";\n\n"),
        statements: output.statements,
        parameters: output
            .parameters
            .into_iter()
            .map(|(name, domain)| Parameter { name, domain })
            .collect(),
        schema,
        format: flow.format.clone(),
        warnings,
    })
}

/// Percent-decode and parse a query into its syntax tree.
pub fn syntax_of_source(source: &str) -> Result<ast::syntax::Query, ErrorMessages> {
    parser::percent_decode(source)
        .and_then(|decoded| parser::parse(&decoded))
        .map_err(error::downcast)
        .map_err(|e| e.composed("", source, false))
}

/// JSON serialization of the syntax tree.
pub fn json_of_syntax(query: &ast::syntax::Query) -> Result<String, ErrorMessages> {
    serde_json::to_string(query).map_err(|e| error::downcast(anyhow::anyhow!(e)))
}

/// JSON deserialization of the syntax tree.
pub fn syntax_of_json(json: &str) -> Result<ast::syntax::Query, ErrorMessages> {
    serde_json::from_str(json).map_err(|e| error::downcast(anyhow::anyhow!(e)))
}

/// A stable content-addressed key for embedder-owned compilation caches:
/// source text, catalog snapshot version, and declared parameter domains.
pub fn content_key(
    source: &str,
    catalog: &Catalog,
    parameters: &HashMap<String, Domain>,
) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    catalog.version().hash(&mut hasher);
    let sorted: BTreeMap<&String, &Domain> = parameters.iter().collect();
    for (name, domain) in sorted {
        name.hash(&mut hasher);
        domain.hash(&mut hasher);
    }
    hasher.finish()
}

fn output_schema(segment: &Segment, source: &str, catalog: &Catalog) -> OutputSchema {
    let slice = |span: Span| -> String {
        source
            .chars()
            .skip(span.start)
            .take(span.end.saturating_sub(span.start))
            .collect()
    };

    let columns = segment
        .items
        .iter()
        .map(|item| match item {
            OutputItem::Column { title, code } => {
                let derived = match &code.kind {
                    CodeKind::Column { flow, attribute } => flow
                        .class
                        .map(|class| catalog.attributes(class)[*attribute].name.clone()),
                    CodeKind::Kernel { quotient, index } => match &quotient.kind {
                        FlowKind::Quotient { kernel, .. } => kernel[*index].name.clone(),
                        _ => None,
                    },
                    _ => None,
                };
                OutputColumn {
                    name: title
                        .clone()
                        .or(derived)
                        .unwrap_or_else(|| slice(code.span)),
                    domain: code.domain.clone(),
                    nullable: code.nullable,
                    nested: None,
                }
            }
            OutputItem::Nested { title, segment } => OutputColumn {
                name: title.clone().unwrap_or_else(|| slice(segment.span)),
                domain: Domain::Record,
                nullable: false,
                nested: Some(output_schema(segment, source, catalog)),
            },
        })
        .collect();

    OutputSchema { columns }
}
