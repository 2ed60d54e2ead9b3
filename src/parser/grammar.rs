//! Recursive-descent grammar over the token stream, built with chumsky.
//!
//! Precedence, loosest first: infix call, direction, `|`, `&`, `!`,
//! comparison (non-associative), additive, multiplicative, unary sign,
//! projection (`^`), sieve/selection, composition (`.`), call, atom.

use chumsky::prelude::*;

use super::lexer::Token;
use crate::ast::syntax::{BinOp, Call, Expr, ExprKind, Query, UnOp};
use crate::ast::{Direction, Literal};
use crate::error::Span;

type S = std::ops::Range<usize>;

fn into_expr(kind: ExprKind, span: S) -> Expr {
    Expr::new(
        kind,
        Span {
            start: span.start,
            end: span.end,
        },
    )
}

fn sym(s: &'static str) -> impl Parser<Token, Token, Error = Simple<Token>> + Clone {
    just(Token::Symbol(s))
}

fn name_part() -> impl Parser<Token, String, Error = Simple<Token>> + Clone {
    select! { Token::Name(name) => name }.labelled("name")
}

fn literal() -> impl Parser<Token, Literal, Error = Simple<Token>> + Clone {
    filter_map(|span: S, token| match token {
        Token::Integer(text) => text
            .parse::<i64>()
            .map(Literal::Integer)
            .map_err(|_| Simple::custom(span, format!("number `{text}` is out of range"))),
        Token::Decimal(text) => Ok(Literal::Decimal(text)),
        Token::Float(text) => text
            .parse::<f64>()
            .map(Literal::Float)
            .map_err(|_| Simple::custom(span, format!("number `{text}` is out of range"))),
        Token::Text(text) => Ok(Literal::Text(text)),
        token => Err(Simple::expected_input_found(
            span,
            std::iter::empty(),
            Some(token),
        )),
    })
    .labelled("literal")
}

fn wildcard() -> impl Parser<Token, ExprKind, Error = Simple<Token>> + Clone {
    sym("*")
        .ignore_then(select! { Token::Integer(text) => text }.or_not())
        .try_map(|index, span: S| {
            let index = match index {
                Some(text) => Some(
                    text.parse::<u32>()
                        .map_err(|_| Simple::custom(span, "selection index is out of range"))?,
                ),
                None => None,
            };
            Ok(ExprKind::Wildcard(index))
        })
}

pub fn query() -> impl Parser<Token, Query, Error = Simple<Token>> {
    let format = sym("/").ignore_then(sym(":")).ignore_then(name_part());

    sym("/")
        .ignore_then(test().or_not())
        .then(format.or_not())
        .then_ignore(end())
        .map_with_span(|(segment, format), span: S| Query {
            segment,
            format,
            span: Span {
                start: span.start,
                end: span.end,
            },
        })
}

pub fn test() -> impl Parser<Token, Expr, Error = Simple<Token>> {
    recursive(|test| {
        let call = name_part()
            .map_with_span(|name, span: S| (name, span))
            .then(call_args(test.clone()).or_not())
            .map(|((name, name_span), args)| match args {
                Some(args) => ExprKind::Call(Call {
                    name,
                    name_span: Span {
                        start: name_span.start,
                        end: name_span.end,
                    },
                    args,
                }),
                None => ExprKind::Ident(name),
            });

        let group = test
            .clone()
            .delimited_by(sym("("), sym(")"))
            .map(|inner| ExprKind::Group(Box::new(inner)));

        let atom = choice((
            literal().map(ExprKind::Literal),
            wildcard(),
            sym("^").to(ExprKind::Complement),
            sym("$").ignore_then(name_part()).map(ExprKind::Reference),
            group,
            call,
        ))
        .map_with_span(into_expr)
        .boxed();

        // atom ('.' NAME call-args?)* ('.' '*N'?)?
        let postfix = sym(".")
            .ignore_then(
                wildcard()
                    .map_with_span(into_expr)
                    .or(name_part()
                        .map_with_span(|name, span: S| (name, span))
                        .then(call_args(test.clone()).or_not())
                        .map_with_span(|((name, name_span), args), span: S| {
                            let kind = match args {
                                Some(args) => ExprKind::Call(Call {
                                    name,
                                    name_span: Span {
                                        start: name_span.start,
                                        end: name_span.end,
                                    },
                                    args,
                                }),
                                None => ExprKind::Ident(name),
                            };
                            into_expr(kind, span)
                        })),
            )
            .boxed();

        let specifier = atom
            .then(postfix.repeated())
            .foldl(|left, right| {
                let span = left.span + right.span;
                Expr {
                    kind: ExprKind::Compose {
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    span,
                }
            })
            .boxed();

        let element = sym("/")
            .ignore_then(test.clone())
            .map_with_span(|inner, span: S| into_expr(ExprKind::Nested(Box::new(inner)), span))
            .or(argument(test.clone()))
            .boxed();

        let selector = element
            .separated_by(sym(","))
            .allow_trailing()
            .delimited_by(sym("{"), sym("}"))
            .boxed();

        // a bare selector is a selection over the current flow
        let bare = selector.clone().map_with_span(|elements, span: S| {
            into_expr(
                ExprKind::Selection {
                    base: None,
                    elements,
                },
                span,
            )
        });
        let primary = specifier.or(bare).boxed();

        let power = recursive(|power| {
            primary
                .then(sym("^").ignore_then(power).or_not())
                .map_with_span(|(base, kernel), span: S| match kernel {
                    Some(kernel) => into_expr(
                        ExprKind::Projection {
                            base: Box::new(base),
                            kernel: Box::new(kernel),
                        },
                        span,
                    ),
                    None => base,
                })
        })
        .boxed();

        // the selector and filter apply to the whole projection:
        // `school^campus{campus}` selects from the quotient
        let sieve = power
            .then(selector.or_not())
            .map_with_span(|(base, selection), span: S| match selection {
                Some(elements) => into_expr(
                    ExprKind::Selection {
                        base: Some(Box::new(base)),
                        elements,
                    },
                    span,
                ),
                None => base,
            })
            .then(sym("?").ignore_then(test.clone()).or_not())
            .map_with_span(|(base, predicate), span: S| match predicate {
                Some(predicate) => into_expr(
                    ExprKind::Sieve {
                        base: Box::new(base),
                        predicate: Box::new(predicate),
                    },
                    span,
                ),
                None => base,
            })
            .boxed();

        let factor = recursive(|factor| {
            sym("+")
                .to(UnOp::Pos)
                .or(sym("-").to(UnOp::Neg))
                .then(factor)
                .map_with_span(|(op, expr), span: S| {
                    into_expr(
                        ExprKind::Unary {
                            op,
                            expr: Box::new(expr),
                        },
                        span,
                    )
                })
                .or(sieve.clone())
        })
        .boxed();

        let term = binary_op_parser(
            factor,
            sym("*").to(BinOp::Mul).or(sym("/").to(BinOp::Div)),
        );
        let expr = binary_op_parser(term, sym("+").to(BinOp::Add).or(sym("-").to(BinOp::Sub)));

        let cmp_op = choice((
            sym("!==").to(BinOp::StrictNe),
            sym("==").to(BinOp::StrictEq),
            sym("!=").to(BinOp::Ne),
            sym("=").to(BinOp::Eq),
            sym("<=").to(BinOp::Lte),
            sym(">=").to(BinOp::Gte),
            sym("<").to(BinOp::Lt),
            sym(">").to(BinOp::Gt),
            sym("!~").to(BinOp::NotContains),
            sym("~").to(BinOp::Contains),
        ));

        // non-associative
        let cmp = expr
            .clone()
            .then(cmp_op.then(expr).or_not())
            .map_with_span(|(left, tail), span: S| match tail {
                Some((op, right)) => into_expr(
                    ExprKind::Binary {
                        op,
                        left: Box::new(left),
                        right: Box::new(right),
                    },
                    span,
                ),
                None => left,
            })
            .boxed();

        let not_test = recursive(|not_test| {
            sym("!")
                .ignore_then(not_test)
                .map_with_span(|expr: Expr, span: S| {
                    into_expr(
                        ExprKind::Unary {
                            op: UnOp::Not,
                            expr: Box::new(expr),
                        },
                        span,
                    )
                })
                .or(cmp)
        })
        .boxed();

        let and_test = binary_op_parser(not_test, sym("&").to(BinOp::And));
        let or_test = binary_op_parser(and_test, sym("|").to(BinOp::Or));

        let linked = or_test
            .clone()
            .then(sym("->").ignore_then(sieve).or_not())
            .map_with_span(|(seed, target), span: S| match target {
                Some(target) => into_expr(
                    ExprKind::Link {
                        seed: Box::new(seed),
                        target: Box::new(target),
                    },
                    span,
                ),
                None => seed,
            })
            .boxed();

        // `x :f y` is sugar for `f(x, y)`; `x :f (y, z)` for `f(x, y, z)`.
        let infix_args = call_args(test.clone())
            .map(InfixArgs::List)
            .or(linked.clone().map(InfixArgs::Single));
        let infix = linked
            .then(
                sym(":")
                    .ignore_then(name_part().map_with_span(|name, span: S| (name, span)))
                    .then(infix_args.or_not())
                    .repeated(),
            )
            .foldl(|acc, ((name, name_span), args)| {
                let mut call_args = vec![acc];
                let mut end = name_span.end;
                match args {
                    Some(InfixArgs::List(args)) => {
                        if let Some(last) = args.last() {
                            end = end.max(last.span.end + 1);
                        }
                        call_args.extend(args);
                    }
                    Some(InfixArgs::Single(arg)) => {
                        end = end.max(arg.span.end);
                        call_args.push(arg);
                    }
                    None => {}
                }
                let span = Span {
                    start: call_args[0].span.start,
                    end,
                };
                Expr {
                    kind: ExprKind::Call(Call {
                        name,
                        name_span: Span {
                            start: name_span.start,
                            end: name_span.end,
                        },
                        args: call_args,
                    }),
                    span,
                }
            })
            .boxed();

        infix
            .then(
                sym("+")
                    .to(Direction::Asc)
                    .or(sym("-").to(Direction::Desc))
                    .or_not(),
            )
            .map_with_span(|(expr, direction), span: S| match direction {
                Some(direction) => into_expr(
                    ExprKind::Direction {
                        expr: Box::new(expr),
                        direction,
                    },
                    span,
                ),
                None => expr,
            })
            .boxed()
    })
}

enum InfixArgs {
    List(Vec<Expr>),
    Single(Expr),
}

/// `( test (',' test)* ','? )?` with `target := value` arguments allowed.
fn call_args<'a>(
    test: impl Parser<Token, Expr, Error = Simple<Token>> + Clone + 'a,
) -> BoxedParser<'a, Token, Vec<Expr>, Simple<Token>> {
    argument(test)
        .separated_by(sym(","))
        .allow_trailing()
        .delimited_by(sym("("), sym(")"))
        .boxed()
}

fn argument<'a>(
    test: impl Parser<Token, Expr, Error = Simple<Token>> + Clone + 'a,
) -> BoxedParser<'a, Token, Expr, Simple<Token>> {
    test.clone()
        .then(sym(":=").ignore_then(test).or_not())
        .map_with_span(|(target, value), span: S| match value {
            Some(value) => into_expr(
                ExprKind::Assign {
                    target: Box::new(target),
                    value: Box::new(value),
                },
                span,
            ),
            None => target,
        })
        .boxed()
}

fn binary_op_parser<'a, Term, Op>(
    term: Term,
    op: Op,
) -> BoxedParser<'a, Token, Expr, Simple<Token>>
where
    Term: Parser<Token, Expr, Error = Simple<Token>> + 'a,
    Op: Parser<Token, BinOp, Error = Simple<Token>> + 'a,
{
    let term = term.map_with_span(|e, s: S| (e, s)).boxed();

    (term.clone())
        .then(op.then(term).repeated())
        .foldl(|left, (op, right)| {
            let span = left.1.start..right.1.end;
            let kind = ExprKind::Binary {
                left: Box::new(left.0),
                op,
                right: Box::new(right.0),
            };
            (into_expr(kind, span.clone()), span)
        })
        .map(|(e, _)| e)
        .boxed()
}
