use chumsky::prelude::*;

/// The fixed symbol table, longest match first.
pub const SYMBOLS: &[&str] = &[
    "=~~", "^~~", "$~~", "!=~~", "!^~~", "!$~~", "!==", "!=~", "!^~", "!$~", "->", ":=", "==",
    "!=", "<=", ">=", "!~", "=~", "^~", "$~", "/", ".", ",", ";", ":", "?", "&", "|", "!", "=",
    "<", ">", "~", "+", "-", "*", "^", "$", "@", "{", "}", "(", ")",
];

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Token {
    /// Identifier, lowered for case-insensitive lookup.
    Name(String),
    Integer(String),
    Decimal(String),
    Float(String),
    Text(String),
    Symbol(&'static str),
}

pub fn lexer() -> impl Parser<char, Vec<(Token, std::ops::Range<usize>)>, Error = Simple<char>> {
    let name = filter(|c: &char| c.is_alphabetic() || *c == '_')
        .map(Some)
        .chain::<char, Vec<_>, _>(
            filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated(),
        )
        .collect::<String>()
        .map(|text| Token::Name(text.to_lowercase()));

    let number = number();

    let string = just('\'')
        .ignore_then(
            (just("''").to('\''))
                .or(filter(|c: &char| *c != '\''))
                .repeated(),
        )
        .then_ignore(just('\''))
        .collect::<String>()
        .map(Token::Text)
        .labelled("string");

    let symbol = symbols().map(Token::Symbol);

    // Longest-match order: number before symbol so `2.5` is not `2` `.` `5`,
    // symbol table itself is ordered longest first.
    choice((string, name, number, symbol))
        .map_with_span(|token, span| (token, span))
        .padded()
        .repeated()
        .then_ignore(end())
}

fn symbols() -> impl Parser<char, &'static str, Error = Simple<char>> + Clone {
    let mut table: Vec<&'static str> = SYMBOLS.to_vec();
    table.sort_by_key(|s| std::cmp::Reverse(s.len()));

    let mut parser = just(table[0]).boxed();
    for s in &table[1..] {
        parser = parser.or(just(*s)).boxed();
    }
    parser.labelled("symbol")
}

/// Integer, decimal, or exponential shape; the shape picks the initial
/// domain.
fn number() -> impl Parser<char, Token, Error = Simple<char>> {
    let digits = text::digits::<char, Simple<char>>(10);

    let frac = just('.').chain::<char, _, _>(text::digits(10));
    let exp = one_of("eE")
        .chain::<char, _, _>(one_of("+-").or_not())
        .chain::<char, _, _>(text::digits(10));

    digits
        .chain::<char, _, _>(frac.or_not().flatten())
        .chain::<char, _, _>(exp.or_not().flatten())
        .collect::<String>()
        .map(|text| {
            if text.contains('e') || text.contains('E') {
                Token::Float(text)
            } else if text.contains('.') {
                Token::Decimal(text)
            } else {
                Token::Integer(text)
            }
        })
        .labelled("number")
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Name(name) => write!(f, "`{name}`"),
            Token::Integer(text) | Token::Decimal(text) | Token::Float(text) => {
                write!(f, "{text}")
            }
            Token::Text(text) => write!(f, "'{text}'"),
            Token::Symbol(symbol) => write!(f, "`{symbol}`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::Parser;

    fn lex(source: &str) -> Vec<Token> {
        lexer()
            .parse(source)
            .unwrap()
            .into_iter()
            .map(|(token, _)| token)
            .collect()
    }

    #[test]
    fn test_names_are_lowered() {
        assert_eq!(
            lex("School _x é9"),
            vec![
                Token::Name("school".to_string()),
                Token::Name("_x".to_string()),
                Token::Name("é9".to_string()),
            ]
        );
    }

    #[test]
    fn test_number_shapes() {
        assert_eq!(
            lex("2 2.5 1e3 2.5E-1"),
            vec![
                Token::Integer("2".to_string()),
                Token::Decimal("2.5".to_string()),
                Token::Float("1e3".to_string()),
                Token::Float("2.5E-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_quote_escape() {
        assert_eq!(lex("'o''hare'"), vec![Token::Text("o'hare".to_string())]);
        assert_eq!(lex("''"), vec![Token::Text(String::new())]);
    }

    #[test]
    fn test_longest_symbol_match() {
        assert_eq!(
            lex("<= := !== ->"),
            vec![
                Token::Symbol("<="),
                Token::Symbol(":="),
                Token::Symbol("!=="),
                Token::Symbol("->"),
            ]
        );
        // `!===` splits as `!==` `=`
        assert_eq!(lex("!==="), vec![Token::Symbol("!=="), Token::Symbol("=")]);
    }

    #[test]
    fn test_unterminated_string_fails() {
        assert!(lexer().parse("'oops").is_err());
    }

    #[test]
    fn test_spans_cover_tokens() {
        let tokens = lexer().parse("/school").unwrap();
        assert_eq!(tokens[0].1, 0..1);
        assert_eq!(tokens[1].1, 1..7);
    }
}
