//! Parse tokens into a template tree.

use chumsky::Stream;
use chumsky::error::SimpleReason;
use chumsky::prelude::*;
use serde_json::Value;

use super::error::{TemplateError, line_col};
use super::lexer::{Span, Token, TokenKind};

/// A node of the parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    /// `{{ pipeline }}`; prints the result unless the pipeline declares variables.
    Action {
        pos: usize,
        pipe: Pipeline,
    },
    If(Branch),
    Range(Branch),
    With(Branch),
}

/// Shared shape of `if`, `range` and `with`.
#[derive(Debug, Clone, PartialEq)]
pub struct Branch {
    pub pos: usize,
    pub pipe: Pipeline,
    pub list: Vec<Node>,
    pub else_list: Option<Vec<Node>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    pub pos: usize,
    /// Variables declared (`:=`) or assigned (`=`) by this pipeline.
    pub decl: Vec<String>,
    pub is_assign: bool,
    pub cmds: Vec<Command>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub pos: usize,
    pub args: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Literal(Value),
    /// Field chain on dot; empty for `.` itself.
    Field(Vec<String>),
    Variable {
        name: String,
        fields: Vec<String>,
    },
    /// A function name.
    Function {
        pos: usize,
        name: String,
    },
    /// Parenthesized pipeline.
    Pipe(Box<Pipeline>),
}

type ParseError = Simple<TokenKind, Span>;
type Boxed<O> = BoxedParser<'static, TokenKind, O, ParseError>;

/// Words that open or close blocks and never name a function.
const KEYWORDS: &[&str] = &["if", "else", "end", "range", "with"];
const UNSUPPORTED: &[&str] = &["define", "template", "block", "break", "continue"];

/// Parse a token stream produced by [`super::lexer::lex`].
pub fn parse(name: &str, src: &str, tokens: Vec<Token>) -> Result<Vec<Node>, TemplateError> {
    let eoi = src.len()..src.len() + 1;
    let stream = Stream::from_iter(eoi, tokens.into_iter().map(|t| (t.kind, t.pos..t.pos + 1)));
    template()
        .parse(stream)
        .map_err(|errors| syntax_error(name, src, errors))
}

fn keyword(word: &str) -> impl Parser<TokenKind, TokenKind, Error = ParseError> + Clone {
    just(TokenKind::Identifier(word.to_string()))
}

/// `{{`, yielding its byte offset.
fn left_delim() -> impl Parser<TokenKind, usize, Error = ParseError> + Clone {
    just(TokenKind::LeftDelim).map_with_span(|_, span: Span| span.start)
}

fn right_delim() -> impl Parser<TokenKind, TokenKind, Error = ParseError> + Clone {
    just(TokenKind::RightDelim)
}

fn unexpected<O>(span: Span, found: TokenKind) -> Result<O, ParseError> {
    Err(Simple::expected_input_found(span, std::iter::empty(), Some(found)))
}

/// A pipeline without declarations: commands joined by `|`.
fn pipeline() -> Boxed<Pipeline> {
    recursive(|pipeline| {
        let operand = filter_map(|span: Span, kind: TokenKind| -> Result<Arg, ParseError> {
            match kind {
                TokenKind::Str(s) => Ok(Arg::Literal(Value::String(s))),
                TokenKind::Bool(b) => Ok(Arg::Literal(Value::Bool(b))),
                TokenKind::Nil => Ok(Arg::Literal(Value::Null)),
                TokenKind::Number(n) => match parse_number(&n) {
                    Some(value) => Ok(Arg::Literal(value)),
                    None => Err(Simple::custom(span, format!("bad number syntax: {n:?}"))),
                },
                TokenKind::Dot => Ok(Arg::Field(Vec::new())),
                TokenKind::Field(fields) => Ok(Arg::Field(fields)),
                TokenKind::Variable {
                    name,
                    fields,
                } => Ok(Arg::Variable {
                    name,
                    fields,
                }),
                TokenKind::Identifier(name) if UNSUPPORTED.contains(&name.as_str()) => {
                    Err(Simple::custom(span, format!("{{{{{name}}}}} is not supported")))
                }
                TokenKind::Identifier(name) if !KEYWORDS.contains(&name.as_str()) => {
                    Ok(Arg::Function {
                        pos: span.start,
                        name,
                    })
                }
                other => unexpected(span, other),
            }
        });
        let parenthesized = pipeline
            .delimited_by(just(TokenKind::LeftParen), just(TokenKind::RightParen))
            .map(|pipe| Arg::Pipe(Box::new(pipe)));
        let command = operand
            .or(parenthesized)
            .repeated()
            .at_least(1)
            .map_with_span(|args, span: Span| Command {
                pos: span.start,
                args,
            });
        command
            .separated_by(just(TokenKind::Pipe))
            .at_least(1)
            .map_with_span(|cmds, span: Span| Pipeline {
                pos: span.start,
                decl: Vec::new(),
                is_assign: false,
                cmds,
            })
    })
    .boxed()
}

/// A pipeline optionally prefixed by `$x :=`, `$x =` or `$i, $e :=`.
fn declared(pipe: Boxed<Pipeline>) -> Boxed<Pipeline> {
    let name = filter_map(|span: Span, kind: TokenKind| match kind {
        TokenKind::Variable {
            name,
            fields,
        } if fields.is_empty() => Ok(name),
        other => unexpected(span, other),
    });
    let decl = name
        .separated_by(just(TokenKind::Comma))
        .at_least(1)
        .then(just(TokenKind::Declare).to(false).or(just(TokenKind::Assign).to(true)));
    decl.or_not()
        .then(pipe)
        .map_with_span(|(decl, mut pipe), span: Span| {
            pipe.pos = span.start;
            if let Some((names, is_assign)) = decl {
                pipe.decl = names;
                pipe.is_assign = is_assign;
            }
            pipe
        })
        .boxed()
}

/// `{{keyword pipeline}} list [{{else}} list] {{end}}`.
///
/// When `chained`, `{{else keyword pipeline}}` opens a nested branch that
/// shares the outer `{{end}}`.
fn branch(
    word: &'static str,
    chained: bool,
    make: fn(Branch) -> Node,
    list: Boxed<Vec<Node>>,
    pipe: Boxed<Pipeline>,
) -> Boxed<Node> {
    let end_tag = just(TokenKind::LeftDelim)
        .then(keyword("end"))
        .then(right_delim())
        .ignored();
    let else_tag = just(TokenKind::LeftDelim)
        .then(keyword("else"))
        .then(right_delim());
    let head = left_delim()
        .then_ignore(keyword(word))
        .then(pipe.clone())
        .then_ignore(right_delim())
        .then(list.clone());

    let tail = recursive(move |tail| {
        let closing = end_tag.clone().to(None).or(else_tag
            .clone()
            .ignore_then(list.clone())
            .then_ignore(end_tag.clone())
            .map(Some));
        if !chained {
            return closing.boxed();
        }
        let nested = left_delim()
            .then_ignore(keyword("else"))
            .then_ignore(keyword(word))
            .then(pipe.clone())
            .then_ignore(right_delim())
            .then(list.clone())
            .then(tail)
            .map(move |(((pos, pipe), list), else_list)| {
                Some(vec![make(Branch {
                    pos,
                    pipe,
                    list,
                    else_list,
                })])
            });
        closing.or(nested).boxed()
    });

    head.then(tail)
        .try_map(move |(((pos, pipe), list), else_list), span: Span| {
            if word == "range" && pipe.decl.len() > 2 {
                return Err(Simple::custom(span, "too many declarations in range"));
            }
            Ok(make(Branch {
                pos,
                pipe,
                list,
                else_list,
            }))
        })
        .boxed()
}

fn template() -> impl Parser<TokenKind, Vec<Node>, Error = ParseError> {
    let pipe = declared(pipeline());
    let node = recursive(|node| {
        let list: Boxed<Vec<Node>> = node.repeated().boxed();
        let text = filter_map(|span: Span, kind: TokenKind| match kind {
            TokenKind::Text(text) => Ok(Node::Text(text)),
            other => unexpected(span, other),
        });
        let action = left_delim()
            .then(pipe.clone())
            .then_ignore(right_delim())
            .map(|(pos, pipe)| Node::Action {
                pos,
                pipe,
            });
        choice((
            text.boxed(),
            branch("if", true, Node::If, list.clone(), pipe.clone()),
            branch("with", true, Node::With, list.clone(), pipe.clone()),
            branch("range", false, Node::Range, list, pipe.clone()),
            action.boxed(),
        ))
    });
    node.repeated().then_ignore(end())
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Text(_) => "text".to_string(),
        TokenKind::LeftDelim => "{{".to_string(),
        TokenKind::RightDelim => "}}".to_string(),
        TokenKind::Identifier(word) => word.clone(),
        TokenKind::Dot => ".".to_string(),
        TokenKind::Field(fields) => format!(".{}", fields.join(".")),
        TokenKind::Variable {
            name,
            ..
        } => name.clone(),
        TokenKind::Str(s) => format!("{s:?}"),
        TokenKind::Number(n) => n.clone(),
        TokenKind::Bool(b) => b.to_string(),
        TokenKind::Nil => "nil".to_string(),
        TokenKind::Pipe => "|".to_string(),
        TokenKind::LeftParen => "(".to_string(),
        TokenKind::RightParen => ")".to_string(),
        TokenKind::Declare => ":=".to_string(),
        TokenKind::Assign => "=".to_string(),
        TokenKind::Comma => ",".to_string(),
    }
}

fn syntax_error(name: &str, src: &str, errors: Vec<ParseError>) -> TemplateError {
    let (pos, message) = match errors.into_iter().next() {
        None => (src.len(), "invalid template".to_string()),
        Some(err) => {
            let message = match (err.reason(), err.found()) {
                (SimpleReason::Custom(msg), _) => msg.clone(),
                (_, Some(found)) => format!("unexpected {}", describe(found)),
                (_, None) => "unexpected end of template".to_string(),
            };
            (err.span().start, message)
        }
    };
    let (line, column) = line_col(src, pos);
    TemplateError::Syntax {
        name: name.to_string(),
        line,
        column,
        message,
    }
}

fn parse_number(text: &str) -> Option<Value> {
    if let Ok(i) = text.parse::<i64>() {
        return Some(Value::from(i));
    }
    text.parse::<f64>()
        .ok()
        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
}
