//! Source normalization applied before a template is parsed.
//!
//! Dinghyfile authors pass JSON literals straight into module calls and use an
//! elvis operator for defaults:
//!
//! ```text
//! {{ module "wait" "waitTime" 30 "notifications" [{"type": "slack"}] }}
//! {{ var "type" ?: "deploy" }}
//! ```
//!
//! Neither is valid action syntax, so before parsing:
//!
//! - every balanced `{…}` or `[…]` literal at an argument position inside an
//!   action is wrapped in a quoted string, with interior `"` and `\` escaped.
//!   Only the outermost group is wrapped; newlines are kept so positions in
//!   later errors still line up.
//! - `?:` between arguments is replaced with a single space.
//!
//! Text outside actions is never touched and running the preprocessor twice
//! gives the same result as running it once.

use crate::template::TemplateError;
use crate::template::error::line_col;

/// Normalize `src`. `name` is only used in error messages.
pub fn preprocess(name: &str, src: &str) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(src.len());
    let mut cursor = 0;
    while let Some(offset) = src[cursor..].find("{{") {
        let open = cursor + offset;
        let body_start = open + 2;
        let Some(close) = find_action_end(src, body_start) else {
            let (line, column) = line_col(src, open);
            return Err(TemplateError::Syntax {
                name: name.to_string(),
                line,
                column,
                message: "unclosed action: missing }}".to_string(),
            });
        };
        out.push_str(&src[cursor..body_start]);
        out.push_str(&rewrite_action(&src[body_start..close]));
        out.push_str("}}");
        cursor = close + 2;
    }
    out.push_str(&src[cursor..]);
    Ok(out)
}

/// Byte offset of the `}}` closing the action whose body starts at `from`.
///
/// Braces inside the body nest, so `{{ module "m" "k" {"a": {"b": 1}} }}`
/// closes at the last `}}`. String and raw-string literals are skipped.
pub(crate) fn find_action_end(src: &str, from: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut i = from;

    let body = src[from..].trim_start_matches(['-', ' ', '\t', '\r', '\n']);
    if body.starts_with("/*") {
        let comment_start = src.len() - body.len();
        let comment_end = comment_start + body.find("*/")? + 2;
        return src[comment_end..].find("}}").map(|o| comment_end + o);
    }

    let mut depth = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'}' if depth == 0 && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            b'"' => i = skip_quoted(bytes, i)?,
            b'`' => i = skip_raw(bytes, i)?,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the closing quote of the string starting at `start`.
fn skip_quoted(bytes: &[u8], start: usize) -> Option<usize> {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn skip_raw(bytes: &[u8], start: usize) -> Option<usize> {
    bytes[start + 1..].iter().position(|b| *b == b'`').map(|p| start + 1 + p)
}

/// Index of the bracket closing the group opened at `start`.
fn matching_close(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => i = skip_quoted(bytes, i)?,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn rewrite_action(body: &str) -> String {
    if body.trim_start_matches(['-', ' ', '\t', '\r', '\n']).starts_with("/*") {
        return body.to_string();
    }
    let bytes = body.as_bytes();
    let mut out = String::with_capacity(body.len() + 8);
    let mut i = 0;
    let mut copied = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'`' => {
                let end = if bytes[i] == b'"' {
                    skip_quoted(bytes, i)
                } else {
                    skip_raw(bytes, i)
                };
                match end {
                    Some(end) => i = end + 1,
                    None => break,
                }
            }
            b'?' if bytes.get(i + 1) == Some(&b':') => {
                out.push_str(&body[copied..i]);
                out.push(' ');
                i += 2;
                copied = i;
            }
            b'{' | b'[' if at_argument_position(bytes, i) => match matching_close(bytes, i) {
                Some(close) => {
                    out.push_str(&body[copied..i]);
                    out.push('"');
                    for c in body[i..=close].chars() {
                        if c == '"' || c == '\\' {
                            out.push('\\');
                        }
                        out.push(c);
                    }
                    out.push('"');
                    i = close + 1;
                    copied = i;
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }
    out.push_str(&body[copied..]);
    out
}

fn at_argument_position(bytes: &[u8], i: usize) -> bool {
    i == 0 || matches!(bytes[i - 1], b' ' | b'\t' | b'\n' | b'\r' | b'(')
}
