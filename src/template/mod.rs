//! Text template engine for dinghyfiles and modules.
//!
//! Dinghyfiles are written in the `{{ … }}` action syntax popularised by Go's
//! `text/template`: pipelines with `|`, `if`/`else if`/`range`/`with` blocks,
//! `$variables`, `.Field` access and function calls. Values are
//! [`serde_json::Value`]s so rendered output can be spliced directly into
//! JSON documents.
//!
//! # Architecture
//!
//! - [`lexer`]: splits source into text and action tokens
//! - [`parser`]: builds the node tree
//! - `exec`: asynchronous evaluator
//! - [`funcs`]: builtin helpers (`eq`, `upper`, `toJson`, `default`, …)
//!
//! Application functions (`module`, `var`, `pipelineID`, …) are supplied by
//! the caller through the [`Functions`] trait and take precedence over
//! builtins of the same name. Calling a function that is neither defined nor
//! a builtin is an error even when it sits in a branch that is never taken.
//!
//! # Example
//!
//! ```rust,no_run
//! use dinghy::template::{NoFunctions, Template};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let template = Template::parse("dinghyfile", r#"{"name": "{{ .app | upper }}"}"#)?;
//! let rendered = template.execute(&NoFunctions, &json!({"app": "demo"})).await?;
//! assert_eq!(rendered, r#"{"name": "DEMO"}"#);
//! # Ok(())
//! # }
//! ```

pub mod error;
mod exec;
pub mod funcs;
pub mod lexer;
pub mod parser;
pub mod value;

use async_trait::async_trait;
use serde_json::Value;

pub use error::TemplateError;
use parser::{Arg, Node, Pipeline};

/// Caller-supplied template functions.
#[async_trait]
pub trait Functions: Send + Sync {
    /// Whether `name` is handled by this table.
    fn has(&self, name: &str) -> bool;

    /// Names offered as suggestions when an unknown function is called.
    fn names(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoke `name` with evaluated arguments. A piped value arrives last.
    async fn call(&self, name: &str, args: Vec<Value>) -> anyhow::Result<Value>;
}

/// A function table with nothing in it; only builtins are available.
pub struct NoFunctions;

#[async_trait]
impl Functions for NoFunctions {
    fn has(&self, _name: &str) -> bool {
        false
    }

    async fn call(&self, name: &str, _args: Vec<Value>) -> anyhow::Result<Value> {
        anyhow::bail!("function {name} is not defined")
    }
}

/// A parsed template ready for execution.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    /// Parse `source`, naming the template `name` in error messages.
    pub fn parse(
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<Self, TemplateError> {
        let name = name.into();
        let source = source.into();
        let tokens = lexer::lex(&name, &source)?;
        let nodes = parser::parse(&name, &source, tokens)?;
        Ok(Self {
            name,
            source,
            nodes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every function referenced by the template with its byte offset.
    pub fn function_calls(&self) -> Vec<(usize, &str)> {
        let mut calls = Vec::new();
        collect_nodes(&self.nodes, &mut calls);
        calls
    }

    /// Check every referenced function exists, in source order.
    pub fn check_functions(&self, funcs: &dyn Functions) -> Result<(), TemplateError> {
        for (pos, name) in self.function_calls() {
            if !funcs.has(name) && !funcs::is_builtin(name) {
                return Err(exec::unknown_function(&self.name, &self.source, funcs, pos, name));
            }
        }
        Ok(())
    }

    /// Render the template with `data` as the initial dot and `$`.
    pub async fn execute(
        &self,
        funcs: &dyn Functions,
        data: &Value,
    ) -> Result<String, TemplateError> {
        self.check_functions(funcs)?;
        exec::Exec::new(&self.name, &self.source, funcs, data).run(&self.nodes, data).await
    }
}

fn collect_nodes<'t>(nodes: &'t [Node], calls: &mut Vec<(usize, &'t str)>) {
    for node in nodes {
        match node {
            Node::Text(_) => {}
            Node::Action {
                pipe,
                ..
            } => collect_pipeline(pipe, calls),
            Node::If(branch) | Node::Range(branch) | Node::With(branch) => {
                collect_pipeline(&branch.pipe, calls);
                collect_nodes(&branch.list, calls);
                if let Some(else_list) = &branch.else_list {
                    collect_nodes(else_list, calls);
                }
            }
        }
    }
}

fn collect_pipeline<'t>(pipe: &'t Pipeline, calls: &mut Vec<(usize, &'t str)>) {
    for cmd in &pipe.cmds {
        for arg in &cmd.args {
            match arg {
                Arg::Function {
                    pos,
                    name,
                } => calls.push((*pos, name.as_str())),
                Arg::Pipe(inner) => collect_pipeline(inner, calls),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    async fn render(src: &str, data: Value) -> Result<String, TemplateError> {
        Template::parse("t", src)?.execute(&NoFunctions, &data).await
    }

    /// Records calls and echoes arguments joined by `+`.
    struct Recorder {
        calls: Mutex<Vec<Vec<Value>>>,
    }

    #[async_trait]
    impl Functions for Recorder {
        fn has(&self, name: &str) -> bool {
            name == "module" || name == "upper"
        }

        fn names(&self) -> Vec<String> {
            vec!["module".to_string()]
        }

        async fn call(&self, name: &str, args: Vec<Value>) -> anyhow::Result<Value> {
            self.calls.lock().unwrap().push(args.clone());
            if name == "upper" {
                return Ok(json!("shadowed"));
            }
            if args.is_empty() {
                anyhow::bail!("module: missing name");
            }
            Ok(Value::String(args.iter().map(value::to_text).collect::<Vec<_>>().join("+")))
        }
    }

    #[tokio::test]
    async fn test_text_and_fields() {
        let data = json!({"who": {"name": "dinghy"}});
        let out = render("hello {{ .who.name }}!{{ .missing.field }}", data).await.unwrap();
        assert_eq!(out, "hello dinghy!");
    }

    #[tokio::test]
    async fn test_objects_print_as_json() {
        let out = render(r#"{"v": {{ .v }}}"#, json!({"v": {"a": [1, "x"]}})).await.unwrap();
        assert_eq!(out, r#"{"v": {"a":[1,"x"]}}"#);
    }

    #[tokio::test]
    async fn test_control_flow() {
        let src = r#"{{ if eq .env "prod" }}P{{ else if eq .env "dev" }}D{{ else }}O{{ end }}"#;
        assert_eq!(render(src, json!({"env": "dev"})).await.unwrap(), "D");
        assert_eq!(render(src, json!({"env": "qa"})).await.unwrap(), "O");

        let src = r#"{{ range $i, $e := .items }}{{ if $i }},{{ end }}{{ $e }}{{ end }}"#;
        assert_eq!(render(src, json!({"items": ["a", "b", "c"]})).await.unwrap(), "a,b,c");

        let src = r#"{{ range .items }}x{{ else }}none{{ end }}"#;
        assert_eq!(render(src, json!({"items": []})).await.unwrap(), "none");

        let src = r#"{{ with .user }}{{ .name }}{{ else }}anon{{ end }}"#;
        assert_eq!(render(src, json!({"user": {"name": "kim"}})).await.unwrap(), "kim");
        assert_eq!(render(src, json!({})).await.unwrap(), "anon");
    }

    #[tokio::test]
    async fn test_range_over_map_is_sorted() {
        let src = r#"{{ range $k, $v := . }}{{ $k }}={{ $v }};{{ end }}"#;
        assert_eq!(render(src, json!({"b": 2, "a": 1})).await.unwrap(), "a=1;b=2;");
    }

    #[tokio::test]
    async fn test_variables_and_assignment() {
        let src = r#"{{ $x := "a" }}{{ if true }}{{ $x = "b" }}{{ end }}{{ $x }}{{ $.top }}"#;
        assert_eq!(render(src, json!({"top": "!"})).await.unwrap(), "b!");
    }

    #[tokio::test]
    async fn test_pipelines_append_last_argument() {
        let src = r#"{{ "api-svc" | trimSuffix "-svc" | upper }}"#;
        assert_eq!(render(src, json!({})).await.unwrap(), "API");
        let src = r#"{{ printf "%s-%s" "a" ("b" | upper) }}"#;
        assert_eq!(render(src, json!({})).await.unwrap(), "a-B");
    }

    #[tokio::test]
    async fn test_caller_functions_take_precedence() {
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let template = Template::parse("t", r#"{{ module "m" "k" 1 }} {{ upper "x" }}"#).unwrap();
        let out = template.execute(&recorder, &json!({})).await.unwrap();
        assert_eq!(out, "m+k+1 shadowed");
        assert_eq!(recorder.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_function_failure_is_call_error() {
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let template = Template::parse("t", "\n  {{ module }}").unwrap();
        let err = template.execute(&recorder, &json!({})).await.unwrap_err();
        assert!(err.to_string().starts_with("t:2:6: error calling module"));
        assert!(err.into_call_source().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_function_in_dead_branch_fails() {
        let recorder = Recorder {
            calls: Mutex::new(Vec::new()),
        };
        let template = Template::parse("t", r#"{{ if false }}{{ modul "x" }}{{ end }}"#).unwrap();
        let err = template.execute(&recorder, &json!({})).await.unwrap_err();
        match err {
            TemplateError::UnknownFunction {
                function,
                suggestions,
                ..
            } => {
                assert_eq!(function, "modul");
                assert_eq!(suggestions, vec!["module".to_string()]);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_field_on_scalar_is_exec_error() {
        let err = render("{{ .name.first }}", json!({"name": "x"})).await.unwrap_err();
        assert!(matches!(err, TemplateError::Exec { .. }));
    }
}
