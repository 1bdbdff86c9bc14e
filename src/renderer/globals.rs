//! Extraction of the top-level `globals` block of a dinghyfile.
//!
//! Globals must be known before the template runs, since every module call
//! made while rendering sees them as the outermost variable frame. The
//! template text is therefore parsed as a document first, with each action
//! replaced by something the parser accepts:
//!
//! | Action | Outside a string | Inside a string |
//! |---|---|---|
//! | `module`, `appModule`, `local_module` | `{"a":1}`, or `"key": 1` in key position | removed |
//! | control (`if`, `range`, `end`, ...), assignments, comments | removed | removed |
//! | anything else (`var`, `pipelineID`, fields) | `1` | removed |

use serde_json::{Map, Value};

use crate::config::ParserFormat;
use crate::core::{DinghyError, RenderStage};
use crate::preprocessor::find_action_end;

const MODULE_FUNCTIONS: &[&str] = &["module", "appModule", "local_module"];
const SILENT_KEYWORDS: &[&str] =
    &["if", "else", "end", "range", "with", "define", "template", "block", "break", "continue"];

#[derive(Debug, PartialEq, Eq)]
enum Placeholder {
    Module,
    Scalar,
    Nothing,
}

fn classify(body: &str) -> Placeholder {
    let body = body.trim_matches(|c: char| c == '-' || c.is_whitespace());
    if body.is_empty() || body.starts_with("/*") {
        return Placeholder::Nothing;
    }
    let first = body.split(|c: char| c.is_whitespace() || c == '(').next().unwrap_or_default();
    if MODULE_FUNCTIONS.contains(&first) {
        Placeholder::Module
    } else if SILENT_KEYWORDS.contains(&first) || (first.starts_with('$') && body.contains('=')) {
        Placeholder::Nothing
    } else {
        Placeholder::Scalar
    }
}

/// Tracks JSON-ish structure of the text between actions.
#[derive(Default)]
struct Scanner {
    in_string: bool,
    escaped: bool,
    brackets: Vec<char>,
    last_significant: Option<char>,
}

impl Scanner {
    fn feed(&mut self, text: &str) {
        for c in text.chars() {
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if c == '\\' {
                    self.escaped = true;
                } else if c == '"' {
                    self.in_string = false;
                }
            } else {
                match c {
                    '"' => self.in_string = true,
                    '{' | '[' => self.brackets.push(c),
                    '}' | ']' => {
                        self.brackets.pop();
                    }
                    _ => {}
                }
            }
            if !c.is_whitespace() {
                self.last_significant = Some(c);
            }
        }
    }

    /// Whether an object member, not a value, is expected next.
    fn expects_key(&self) -> bool {
        self.brackets.last() == Some(&'{') && matches!(self.last_significant, Some('{') | Some(','))
    }
}

/// Replace every action in `src` with a parser-friendly placeholder.
pub fn blank_actions(src: &str) -> String {
    let mut out = String::with_capacity(src.len());
    let mut scanner = Scanner::default();
    let mut placeholders = 0usize;
    let mut cursor = 0;

    while let Some(offset) = src[cursor..].find("{{") {
        let open = cursor + offset;
        let text = &src[cursor..open];
        scanner.feed(text);
        out.push_str(text);

        let Some(close) = find_action_end(src, open + 2) else {
            cursor = open;
            break;
        };
        let replacement = if scanner.in_string {
            String::new()
        } else {
            match classify(&src[open + 2..close]) {
                Placeholder::Module if scanner.expects_key() => {
                    placeholders += 1;
                    format!("\"dinghy_placeholder_{placeholders}\": 1")
                }
                Placeholder::Module => "{\"a\":1}".to_string(),
                Placeholder::Scalar => "1".to_string(),
                Placeholder::Nothing => String::new(),
            }
        };
        scanner.feed(&replacement);
        out.push_str(&replacement);
        cursor = close + 2;
    }
    out.push_str(&src[cursor..]);
    out
}

/// The `globals` map of the dinghyfile `src` (already preprocessed).
///
/// A document that never mentions `globals` is not parsed at all; one that
/// does but has no top-level `globals` key yields an empty map. Unparseable
/// documents fail with [`RenderStage::GlobalVars`].
pub fn extract_globals(
    format: ParserFormat,
    path: &str,
    src: &str,
) -> Result<Map<String, Value>, DinghyError> {
    if !src.contains("globals") {
        return Ok(Map::new());
    }

    let document = format.parse(&blank_actions(src)).map_err(|message| {
        let message = format!("unable to parse {format} for globals: {message}");
        DinghyError::render(RenderStage::GlobalVars, path, message)
    })?;
    match document.get("globals") {
        None | Some(Value::Null) => Ok(Map::new()),
        Some(Value::Object(globals)) => Ok(globals.clone()),
        Some(other) => Err(DinghyError::render(
            RenderStage::GlobalVars,
            path,
            format!("globals must be a map, found {}", crate::template::value::type_name(other)),
        )),
    }
}
