//! Tokenizer for `{{ … }}` templates.
//!
//! Text outside actions is passed through as [`TokenKind::Text`]. Inside an
//! action the lexer produces operands (strings, numbers, fields, variables,
//! identifiers) and punctuation. Trim markers (`{{- ` and ` -}}`) are applied
//! here so the parser never sees them, and comments (`{{/* … */}}`) are
//! dropped entirely.

use std::ops::Range;

use chumsky::Stream;
use chumsky::error::SimpleReason;
use chumsky::prelude::*;

use super::error::{TemplateError, line_col};

/// Byte range of a token in the source.
pub type Span = Range<usize>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Text(String),
    LeftDelim,
    RightDelim,
    Identifier(String),
    /// `.` on its own.
    Dot,
    /// `.A.B` field chain.
    Field(Vec<String>),
    /// `$` or `$name`, with any `.a.b` chain that directly follows.
    Variable {
        name: String,
        fields: Vec<String>,
    },
    Str(String),
    Number(String),
    Bool(bool),
    Nil,
    Pipe,
    LeftParen,
    RightParen,
    /// `:=`
    Declare,
    /// `=`
    Assign,
    Comma,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the token in the source.
    pub pos: usize,
}

/// A region of source before trim markers are applied.
#[derive(Debug, Clone)]
enum Piece {
    Text {
        text: String,
        pos: usize,
    },
    Action {
        trim_left: bool,
        trim_right: bool,
        open: usize,
        close: usize,
        tokens: Vec<Token>,
    },
    Comment {
        trim_left: bool,
        trim_right: bool,
    },
}

impl Piece {
    fn trims(&self) -> (bool, bool) {
        match self {
            Piece::Text { .. } => (false, false),
            Piece::Action {
                trim_left,
                trim_right,
                ..
            }
            | Piece::Comment {
                trim_left,
                trim_right,
            } => (*trim_left, *trim_right),
        }
    }
}

/// Split `src` into tokens.
pub fn lex(name: &str, src: &str) -> Result<Vec<Token>, TemplateError> {
    let eoi = src.len()..src.len();
    let chars = src.char_indices().map(|(i, c)| (c, i..i + c.len_utf8()));
    let pieces = pieces()
        .parse(Stream::from_iter(eoi, chars))
        .map_err(|errors| syntax_error(name, src, errors))?;
    Ok(flatten(pieces))
}

fn whitespace() -> impl Parser<char, char, Error = Simple<char>> + Clone {
    filter(|c: &char| c.is_whitespace())
}

fn ident() -> impl Parser<char, String, Error = Simple<char>> + Clone {
    filter(|c: &char| c.is_alphabetic() || *c == '_')
        .chain(filter(|c: &char| c.is_alphanumeric() || *c == '_').repeated())
        .collect()
}

fn pieces() -> impl Parser<char, Vec<Piece>, Error = Simple<char>> {
    // `{{- ` trims the text before it; `{{-3}}` is a negative number.
    let open = just("{{").ignore_then(
        just('-')
            .then(whitespace().rewind())
            .or_not()
            .map(|marker| marker.is_some()),
    );
    let close = choice((
        whitespace().repeated().at_least(1).ignore_then(just("-}}")).to(true),
        whitespace().repeated().ignore_then(just("}}")).to(false),
    ));

    let comment = open
        .clone()
        .then_ignore(whitespace().repeated())
        .then_ignore(just("/*"))
        .then_ignore(take_until(just("*/")))
        .then(close.clone())
        .map(|(trim_left, trim_right)| Piece::Comment {
            trim_left,
            trim_right,
        });

    let action = open
        .then(whitespace().repeated().ignore_then(token()).repeated())
        .then(close)
        .map_with_span(|((trim_left, tokens), trim_right), span: Span| Piece::Action {
            trim_left,
            trim_right,
            open: span.start,
            close: span.end.saturating_sub(2),
            tokens,
        });

    // A lone `{` is text; `{{` always starts an action.
    let text_char =
        none_of("{").or(just('{').then_ignore(none_of("{").ignored().or(end()).rewind()));
    let text = text_char
        .repeated()
        .at_least(1)
        .collect::<String>()
        .map_with_span(|text, span: Span| Piece::Text {
            text,
            pos: span.start,
        });

    choice((comment, action, text)).repeated().then_ignore(end())
}

fn token() -> impl Parser<char, Token, Error = Simple<char>> + Clone {
    let unicode = just('u')
        .ignore_then(
            filter(|c: &char| c.is_ascii_hexdigit())
                .repeated()
                .at_least(4)
                .at_most(4)
                .collect::<String>(),
        )
        .try_map(|hex, span: Span| {
            u32::from_str_radix(&hex, 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .ok_or_else(|| Simple::custom(span, format!("invalid unicode escape \\u{hex}")))
        });
    let escape = just('\\').ignore_then(
        choice((
            just('n').to('\n'),
            just('t').to('\t'),
            just('r').to('\r'),
            just('"').to('"'),
            just('\\').to('\\'),
            just('/').to('/'),
        ))
        .map(String::from)
        .or(unicode)
        .or(filter(|c: &char| *c != 'u').map(|c| format!("\\{c}"))),
    );
    let quoted = just('"')
        .ignore_then(none_of("\\\"").map(String::from).or(escape).repeated())
        .then_ignore(just('"'))
        .map(|parts| TokenKind::Str(parts.concat()));
    let raw = none_of("`")
        .repeated()
        .collect::<String>()
        .delimited_by(just('`'), just('`'))
        .map(TokenKind::Str);

    let digit = || filter(|c: &char| c.is_ascii_digit());
    let mantissa = digit()
        .chain::<char, _, _>(filter(|c: &char| c.is_ascii_digit() || *c == '.' || *c == '_').repeated())
        .or(just('.')
            .chain::<char, _, _>(digit())
            .chain::<char, _, _>(filter(|c: &char| c.is_ascii_digit() || *c == '_').repeated()));
    let exponent = one_of("eE")
        .chain::<char, _, _>(one_of("+-").or_not())
        .chain::<char, _, _>(digit().repeated().at_least(1));
    let number = one_of("+-")
        .or_not()
        .chain::<char, _, _>(mantissa)
        .chain::<char, _, _>(exponent.or_not().map(Option::<Vec<char>>::unwrap_or_default))
        .collect::<String>()
        .map(|n| TokenKind::Number(n.replace('_', "")));

    let field_chain = just('.').ignore_then(ident()).repeated();
    let variable = just('$')
        .ignore_then(ident().or_not())
        .then(field_chain.clone())
        .map(|(name, fields)| TokenKind::Variable {
            name: format!("${}", name.unwrap_or_default()),
            fields,
        });
    let field = just('.')
        .ignore_then(ident())
        .repeated()
        .at_least(1)
        .map(TokenKind::Field);
    let dot = just('.').to(TokenKind::Dot);
    let word = ident().map(|word| match word.as_str() {
        "true" => TokenKind::Bool(true),
        "false" => TokenKind::Bool(false),
        "nil" => TokenKind::Nil,
        _ => TokenKind::Identifier(word),
    });
    let punct = choice((
        just(":=").to(TokenKind::Declare),
        just("=").to(TokenKind::Assign),
        just("|").to(TokenKind::Pipe),
        just("(").to(TokenKind::LeftParen),
        just(")").to(TokenKind::RightParen),
        just(",").to(TokenKind::Comma),
    ));

    choice((quoted, raw, number, variable, field, dot, word, punct))
        .map_with_span(|kind, span: Span| Token {
            kind,
            pos: span.start,
        })
}

/// Apply trim markers to neighbouring text and drop comments.
fn flatten(pieces: Vec<Piece>) -> Vec<Token> {
    let trims: Vec<(bool, bool)> = pieces.iter().map(Piece::trims).collect();
    let mut out = Vec::new();
    for (i, piece) in pieces.into_iter().enumerate() {
        match piece {
            Piece::Text {
                text,
                pos,
            } => {
                let mut text = text.as_str();
                if i > 0 && trims[i - 1].1 {
                    text = text.trim_start();
                }
                if trims.get(i + 1).is_some_and(|t| t.0) {
                    text = text.trim_end();
                }
                if !text.is_empty() {
                    out.push(Token {
                        kind: TokenKind::Text(text.to_string()),
                        pos,
                    });
                }
            }
            Piece::Action {
                open,
                close,
                tokens,
                ..
            } => {
                out.push(Token {
                    kind: TokenKind::LeftDelim,
                    pos: open,
                });
                out.extend(tokens);
                out.push(Token {
                    kind: TokenKind::RightDelim,
                    pos: close,
                });
            }
            Piece::Comment { .. } => {}
        }
    }
    out
}

fn syntax_error(name: &str, src: &str, errors: Vec<Simple<char>>) -> TemplateError {
    let (pos, message) = match errors.into_iter().next() {
        None => (src.len(), "invalid template".to_string()),
        Some(err) => match (err.reason(), err.found()) {
            (SimpleReason::Custom(msg), _) => (err.span().start, msg.clone()),
            // Running out of input means the last action never closed.
            (_, None) => {
                let at = err.span().start.min(src.len());
                (src[..at].rfind("{{").unwrap_or(0), "unclosed action".to_string())
            }
            (_, Some(c)) => (err.span().start, format!("unexpected character {c:?} in action")),
        },
    };
    let (line, column) = line_col(src, pos);
    TemplateError::Syntax {
        name: name.to_string(),
        line,
        column,
        message,
    }
}
