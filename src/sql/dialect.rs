//! Dialect profiles for the SQL writer.
//!
//! The term tree is dialect-agnostic; everything backend-specific funnels
//! through [DialectHandler]. The default targets the common denominator of
//! the major engines, and dialects override only where the generic form is
//! not accepted.

use core::fmt::Debug;

use serde::{Deserialize, Serialize};
use sqlparser::ast::{self as sql_ast, Value};
use std::any::{Any, TypeId};

/// SQL dialect.
///
/// This only changes the output for a relatively small subset of features.
#[derive(
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
    strum::EnumString,
    strum::EnumVariantNames,
)]
#[strum(serialize_all = "lowercase")]
pub enum Dialect {
    Generic,
    Postgres,
    SQLite,
    MySql,
    MsSql,
}

impl Dialect {
    pub(super) fn handler(&self) -> Box<dyn DialectHandler> {
        match self {
            Dialect::Generic => Box::new(GenericDialect),
            Dialect::Postgres => Box::new(PostgresDialect),
            Dialect::SQLite => Box::new(SQLiteDialect),
            Dialect::MySql => Box::new(MySqlDialect),
            Dialect::MsSql => Box::new(MsSqlDialect),
        }
    }
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect::Generic
    }
}

#[derive(Debug)]
pub struct GenericDialect;
#[derive(Debug)]
pub struct PostgresDialect;
#[derive(Debug)]
pub struct SQLiteDialect;
#[derive(Debug)]
pub struct MySqlDialect;
#[derive(Debug)]
pub struct MsSqlDialect;

pub(super) trait DialectHandler: Any + Debug {
    fn ident_quote(&self) -> char {
        '"'
    }

    /// `$n` placeholders instead of `?`.
    fn numbered_placeholders(&self) -> bool {
        false
    }

    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    fn use_top(&self) -> bool {
        false
    }

    /// Case-insensitive LIKE. When absent the writer lowers both sides.
    fn has_ilike(&self) -> bool {
        false
    }

    /// CONCAT function; when absent the writer uses `||`.
    fn has_concat_function(&self) -> bool {
        false
    }

    /// IS [NOT] DISTINCT FROM; when absent the writer expands a CASE.
    fn has_is_distinct_from(&self) -> bool {
        true
    }

    /// DATE '...' style typed literals.
    fn typed_date_literals(&self) -> bool {
        true
    }

    fn supports_full_outer_join(&self) -> bool {
        true
    }

    fn bool_literal(&self, value: bool) -> sql_ast::Expr {
        sql_ast::Expr::Value(Value::Boolean(value))
    }
}

impl dyn DialectHandler {
    #[inline]
    pub fn is<T: DialectHandler + 'static>(&self) -> bool {
        TypeId::of::<T>() == self.type_id()
    }
}

impl DialectHandler for GenericDialect {}

impl DialectHandler for PostgresDialect {
    fn numbered_placeholders(&self) -> bool {
        true
    }

    fn has_ilike(&self) -> bool {
        true
    }
}

impl DialectHandler for SQLiteDialect {
    fn typed_date_literals(&self) -> bool {
        false
    }

    fn supports_full_outer_join(&self) -> bool {
        false
    }
}

impl DialectHandler for MySqlDialect {
    fn ident_quote(&self) -> char {
        '`'
    }

    fn has_concat_function(&self) -> bool {
        true
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn has_is_distinct_from(&self) -> bool {
        // MySQL spells it `<=>`
        false
    }

    fn typed_date_literals(&self) -> bool {
        false
    }
}

impl DialectHandler for MsSqlDialect {
    fn use_top(&self) -> bool {
        true
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn has_is_distinct_from(&self) -> bool {
        false
    }

    fn typed_date_literals(&self) -> bool {
        false
    }

    fn bool_literal(&self, value: bool) -> sql_ast::Expr {
        sql_ast::Expr::Value(Value::Number(
            if value { "1" } else { "0" }.to_string(),
            false,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::Dialect;
    use insta::assert_debug_snapshot;
    use std::str::FromStr;

    #[test]
    fn test_dialect_from_str() {
        assert_debug_snapshot!(Dialect::from_str("postgres"), @r###"
        Ok(
            Postgres,
        )
        "###);

        assert_debug_snapshot!(Dialect::from_str("foo"), @r###"
        Err(
            VariantNotFound,
        )
        "###);
    }
}
