//! Template errors with source positions.

use thiserror::Error;

/// Errors raised while parsing or executing a template.
///
/// Every variant carries the template name and a 1-based line and column so
/// the message can be pasted straight into a commit status.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("{name}:{line}:{column}: {message}")]
    Syntax {
        name: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error("{name}:{line}:{column}: {message}")]
    Exec {
        name: String,
        line: usize,
        column: usize,
        message: String,
    },

    #[error(
        "{name}:{line}:{column}: function \"{function}\" not defined{}",
        did_you_mean(suggestions)
    )]
    UnknownFunction {
        name: String,
        line: usize,
        column: usize,
        function: String,
        suggestions: Vec<String>,
    },

    #[error("{name}:{line}:{column}: error calling {function}: {source:#}")]
    Call {
        name: String,
        line: usize,
        column: usize,
        function: String,
        #[source]
        source: anyhow::Error,
    },
}

fn did_you_mean(suggestions: &[String]) -> String {
    if suggestions.is_empty() {
        String::new()
    } else {
        format!(" (did you mean {}?)", suggestions.join(", "))
    }
}

impl TemplateError {
    /// Take the error a template function failed with, if that is what happened.
    ///
    /// Nested module renders fail inside a function call; the renderer uses
    /// this to surface the innermost classified error instead of a generic
    /// template failure.
    pub fn into_call_source(self) -> Result<anyhow::Error, Self> {
        match self {
            TemplateError::Call {
                source,
                ..
            } => Ok(source),
            other => Err(other),
        }
    }
}

/// 1-based line and column of byte offset `pos` in `src`.
pub fn line_col(src: &str, pos: usize) -> (usize, usize) {
    let pos = pos.min(src.len());
    let before = &src[..pos];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map_or(0, |i| i + 1);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}
