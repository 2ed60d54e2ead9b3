//! Percent decoding, lexing and parsing of the query text.

mod decode;
mod grammar;
mod lexer;

pub use decode::percent_decode;

use anyhow::{anyhow, Result};
use chumsky::error::SimpleReason;
use chumsky::{Parser, Stream};
use itertools::Itertools;

use self::lexer::Token;
use crate::ast::syntax;
use crate::error::{Error, Reason, Span};

/// Build a syntax tree from the (already percent-decoded) query text.
pub fn parse(decoded: &str) -> Result<syntax::Query> {
    let tokens = lexer::lexer()
        .parse(decoded)
        .map_err(|errors| anyhow!(convert_char_error(errors)))?;
    log::debug!("lexed {} tokens", tokens.len());

    let len = decoded.chars().count();
    let stream = Stream::from_iter(len..len + 1, tokens.into_iter());

    grammar::query()
        .parse(stream)
        .map_err(|errors| anyhow!(convert_error(errors)))
}

// The compiler stops at the first fatal error, so only the earliest parser
// error is reported.
fn convert_error(errors: Vec<chumsky::error::Simple<Token>>) -> Error {
    let e = errors
        .into_iter()
        .min_by_key(|e| e.span().start)
        .expect("at least one parse error");
    let span = Some(Span {
        start: e.span().start,
        end: e.span().end,
    });

    if let SimpleReason::Custom(message) = e.reason() {
        return Error::new_simple(message).with_span(span);
    }

    let expected = e
        .expected()
        .filter_map(|t| t.as_ref().map(|t| t.to_string()))
        .unique()
        .sorted()
        .collect_vec();
    let found = e
        .found()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "end of input".to_string());

    if expected.is_empty() || expected.len() > 8 {
        Error::new(Reason::Unexpected { found }).with_span(span)
    } else {
        Error::new(Reason::Expected {
            who: None,
            expected: expected.join(", "),
            found,
        })
        .with_span(span)
    }
}

fn convert_char_error(errors: Vec<chumsky::error::Simple<char>>) -> Error {
    let e = errors
        .into_iter()
        .min_by_key(|e| e.span().start)
        .expect("at least one lex error");
    let span = Some(Span {
        start: e.span().start,
        end: e.span().end,
    });

    match e.found() {
        Some(c) => Error::new(Reason::Unexpected {
            found: format!("`{c}`"),
        })
        .with_span(span),
        None => Error::new(Reason::Unexpected {
            found: "end of input".to_string(),
        })
        .with_span(span)
        .with_help("a string may be missing its closing quote"),
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_yaml_snapshot;

    use super::*;
    use crate::ast::syntax::ExprKind;

    fn parse_display(source: &str) -> String {
        parse(source).unwrap().to_string()
    }

    #[test]
    fn test_parse_class() {
        assert_yaml_snapshot!(parse("/school").unwrap().segment.unwrap(), @r###"
        ---
        kind:
          Ident: school
        "###);
    }

    #[test]
    fn test_parse_selection_and_composition() {
        assert_yaml_snapshot!(parse("/school{name, department.count()}").unwrap().segment.unwrap(), @r###"
        ---
        kind:
          Selection:
            base:
              kind:
                Ident: school
            elements:
              - kind:
                  Ident: name
              - kind:
                  Compose:
                    left:
                      kind:
                        Ident: department
                    right:
                      kind:
                        Call:
                          name: count
                          args: []
        "###);
    }

    #[test]
    fn test_parse_filter_precedence() {
        assert_yaml_snapshot!(
            parse("/course?credits>3&department.school_code='eng'").unwrap().segment.unwrap(), @r###"
        ---
        kind:
          Sieve:
            base:
              kind:
                Ident: course
            predicate:
              kind:
                Binary:
                  op: And
                  left:
                    kind:
                      Binary:
                        op: Gt
                        left:
                          kind:
                            Ident: credits
                        right:
                          kind:
                            Literal:
                              Integer: 3
                  right:
                    kind:
                      Binary:
                        op: Eq
                        left:
                          kind:
                            Compose:
                              left:
                                kind:
                                  Ident: department
                              right:
                                kind:
                                  Ident: school_code
                        right:
                          kind:
                            Literal:
                              Text: eng
        "###);
    }

    #[test]
    fn test_spans_cover_source_slices() {
        let query = parse("/school{name, count(department)}").unwrap();
        let segment = query.segment.unwrap();
        let (base, elements) = match segment.kind {
            ExprKind::Selection { base, elements } => (base.unwrap(), elements),
            kind => panic!("expected a selection, got {kind:?}"),
        };
        assert_eq!((base.span.start, base.span.end), (1, 7));
        assert_eq!((elements[0].span.start, elements[0].span.end), (8, 12));
        assert_eq!((elements[1].span.start, elements[1].span.end), (14, 31));
    }

    #[test]
    fn test_parse_projection() {
        let query = parse("/school^campus{campus, count(school)}").unwrap();
        assert_eq!(query.to_string(), "/school^campus{campus,count(school)}");
    }

    #[test]
    fn test_parse_nested_segment() {
        let query = parse("/school{name, /department{name}}").unwrap();
        assert_eq!(query.to_string(), "/school{name,/department{name}}");
    }

    #[test]
    fn test_parse_define_and_reference() {
        let query = parse("/define($a:=avg(course.credits)).course{title}?credits>$a").unwrap();
        assert_eq!(
            query.to_string(),
            "/define($a:=avg(course.credits)).course{title}?credits>$a"
        );
    }

    #[test]
    fn test_parse_infix_call_desugars() {
        // `x :f y` is `f(x, y)`
        assert_eq!(parse_display("/school:top(3)"), "/top(school,3)");
        assert_eq!(parse_display("/name:as 'Title'"), "/as(name,'Title')");
        assert_eq!(parse_display("/school:count"), "/count(school)");
    }

    #[test]
    fn test_parse_direction_vs_addition() {
        assert_eq!(parse_display("/school.sort(name+)"), "/school.sort(name+)");
        assert_eq!(parse_display("/{a+b}"), "/{a+b}");
        assert_eq!(parse_display("/{a+}"), "/{a+}");
    }

    #[test]
    fn test_parse_format_decorator() {
        let query = parse("/school/:json").unwrap();
        assert_eq!(query.format.as_deref(), Some("json"));
        assert_eq!(query.to_string(), "/school/:json");
    }

    #[test]
    fn test_parse_wildcards() {
        assert_eq!(parse_display("/school{*}"), "/school{*}");
        assert_eq!(parse_display("/school{*2}"), "/school{*2}");
        assert_eq!(parse_display("/school.*"), "/school.*");
    }

    #[test]
    fn test_parse_link_operator() {
        assert_eq!(
            parse_display("/'eng'->school{code}"),
            "/'eng'->school{code}"
        );
    }

    #[test]
    fn test_reparsing_printed_form_is_stable() {
        let sources = [
            "/school{name, count(department)}",
            "/course?credits>3&department.school_code='eng'",
            "/school^campus{campus, count(school)}",
            "/define($a:=avg(course.credits)).course{title,credits}?credits>$a",
            "/school{name, /department{name}}",
            "/school.sort(campus-, name+).limit(5, 10)",
            "/{2+2*2, -3, !(a=b)}",
        ];
        for source in sources {
            let first = parse(source).unwrap();
            let second = parse(&first.to_string()).unwrap();
            assert_eq!(first, second, "round-trip failed for {source}");
            assert_eq!(first.to_string(), second.to_string());
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("/school{name").is_err());
        assert!(parse("/school?").is_err());
        assert!(parse("/a=b=c").is_err());
        assert!(parse("school").is_err());
    }
}
