//! Asynchronous tree-walking evaluator.
//!
//! Evaluation is async because template functions may download files or
//! query remote services. Recursive walks return boxed futures.

use futures::future::BoxFuture;
use serde_json::Value;

use super::Functions;
use super::error::{TemplateError, line_col};
use super::funcs;
use super::parser::{Arg, Branch, Command, Node, Pipeline};
use super::value::{to_text, truthy, type_name};

pub(super) struct Exec<'a> {
    name: &'a str,
    src: &'a str,
    funcs: &'a dyn Functions,
    vars: Vec<(String, Value)>,
    out: String,
    /// Position of the command being evaluated, for error messages.
    pos: usize,
}

impl<'a> Exec<'a> {
    pub(super) fn new(name: &'a str, src: &'a str, funcs: &'a dyn Functions, data: &Value) -> Self {
        Self {
            name,
            src,
            funcs,
            vars: vec![("$".to_string(), data.clone())],
            out: String::new(),
            pos: 0,
        }
    }

    pub(super) async fn run(
        mut self,
        nodes: &[Node],
        data: &Value,
    ) -> Result<String, TemplateError> {
        self.walk_list(data, nodes).await?;
        Ok(self.out)
    }

    fn walk_list<'b>(
        &'b mut self,
        dot: &'b Value,
        nodes: &'b [Node],
    ) -> BoxFuture<'b, Result<(), TemplateError>> {
        Box::pin(async move {
            for node in nodes {
                self.walk(dot, node).await?;
            }
            Ok(())
        })
    }

    fn walk<'b>(
        &'b mut self,
        dot: &'b Value,
        node: &'b Node,
    ) -> BoxFuture<'b, Result<(), TemplateError>> {
        Box::pin(async move {
            match node {
                Node::Text(text) => self.out.push_str(text),
                Node::Action {
                    pipe,
                    ..
                } => {
                    let value = self.eval_pipeline(dot, pipe, true).await?;
                    if pipe.decl.is_empty() {
                        self.out.push_str(&to_text(&value));
                    }
                }
                Node::If(branch) => {
                    let mark = self.vars.len();
                    let value = self.eval_pipeline(dot, &branch.pipe, true).await?;
                    if truthy(&value) {
                        self.walk_list(dot, &branch.list).await?;
                    } else if let Some(else_list) = &branch.else_list {
                        self.walk_list(dot, else_list).await?;
                    }
                    self.vars.truncate(mark);
                }
                Node::With(branch) => {
                    let mark = self.vars.len();
                    let value = self.eval_pipeline(dot, &branch.pipe, true).await?;
                    if truthy(&value) {
                        self.walk_list(&value, &branch.list).await?;
                    } else if let Some(else_list) = &branch.else_list {
                        self.walk_list(dot, else_list).await?;
                    }
                    self.vars.truncate(mark);
                }
                Node::Range(branch) => self.walk_range(dot, branch).await?,
            }
            Ok(())
        })
    }

    async fn walk_range(&mut self, dot: &Value, branch: &Branch) -> Result<(), TemplateError> {
        let mark = self.vars.len();
        let value = self.eval_pipeline(dot, &branch.pipe, false).await?;
        let items: Vec<(Value, Value)> = match value {
            Value::Array(items) => {
                items.into_iter().enumerate().map(|(i, item)| (Value::from(i), item)).collect()
            }
            Value::Object(map) => {
                let mut entries: Vec<(String, Value)> = map.into_iter().collect();
                entries.sort_by(|a, b| a.0.cmp(&b.0));
                entries.into_iter().map(|(k, v)| (Value::String(k), v)).collect()
            }
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                let count = n.as_i64().unwrap_or(0).max(0);
                (0..count).map(|i| (Value::from(i), Value::from(i))).collect()
            }
            Value::Null => Vec::new(),
            other => {
                return Err(self.exec_err(
                    branch.pos,
                    format!("range can't iterate over {}", type_name(&other)),
                ));
            }
        };

        if items.is_empty() {
            if let Some(else_list) = &branch.else_list {
                self.walk_list(dot, else_list).await?;
            }
            return Ok(());
        }

        for (key, item) in items {
            let iteration = self.vars.len();
            match branch.pipe.decl.as_slice() {
                [] => {}
                [elem] => self.vars.push((elem.clone(), item.clone())),
                [index, elem, ..] => {
                    self.vars.push((index.clone(), key));
                    self.vars.push((elem.clone(), item.clone()));
                }
            }
            self.walk_list(&item, &branch.list).await?;
            self.vars.truncate(iteration);
        }
        self.vars.truncate(mark);
        Ok(())
    }

    fn eval_pipeline<'b>(
        &'b mut self,
        dot: &'b Value,
        pipe: &'b Pipeline,
        apply_decl: bool,
    ) -> BoxFuture<'b, Result<Value, TemplateError>> {
        Box::pin(async move {
            let mut value: Option<Value> = None;
            for cmd in &pipe.cmds {
                value = Some(self.eval_command(dot, cmd, value.take()).await?);
            }
            let value = value.unwrap_or(Value::Null);

            if apply_decl {
                if let Some(var) = pipe.decl.first() {
                    if pipe.is_assign {
                        let Some(slot) = self.vars.iter().rposition(|(name, _)| name == var) else {
                            let message = format!("undefined variable: {var}");
                            return Err(self.exec_err(pipe.pos, message));
                        };
                        self.vars[slot].1 = value.clone();
                    } else {
                        self.vars.push((var.clone(), value.clone()));
                    }
                }
            }
            Ok(value)
        })
    }

    async fn eval_command(
        &mut self,
        dot: &Value,
        cmd: &Command,
        piped: Option<Value>,
    ) -> Result<Value, TemplateError> {
        self.pos = cmd.pos;
        let Some(first) = cmd.args.first() else {
            return Err(self.exec_err(cmd.pos, "empty command"));
        };

        if let Arg::Function {
            pos,
            name,
        } = first
        {
            let mut args = Vec::with_capacity(cmd.args.len());
            for arg in &cmd.args[1..] {
                args.push(self.eval_arg(dot, arg).await?);
            }
            args.extend(piped);
            return self.call(*pos, name, args).await;
        }

        if cmd.args.len() > 1 || piped.is_some() {
            return Err(self.exec_err(cmd.pos, "can't give argument to non-function"));
        }
        self.eval_arg(dot, first).await
    }

    fn eval_arg<'b>(
        &'b mut self,
        dot: &'b Value,
        arg: &'b Arg,
    ) -> BoxFuture<'b, Result<Value, TemplateError>> {
        Box::pin(async move {
            match arg {
                Arg::Literal(value) => Ok(value.clone()),
                Arg::Field(fields) => self.walk_fields(dot.clone(), fields),
                Arg::Variable {
                    name,
                    fields,
                } => {
                    let value = self.lookup(name).ok_or_else(|| {
                        self.exec_err(self.pos, format!("undefined variable: {name}"))
                    })?;
                    self.walk_fields(value, fields)
                }
                Arg::Function {
                    pos,
                    name,
                } => self.call(*pos, name, Vec::new()).await,
                Arg::Pipe(pipe) => self.eval_pipeline(dot, pipe, false).await,
            }
        })
    }

    async fn call(
        &mut self,
        pos: usize,
        function: &str,
        args: Vec<Value>,
    ) -> Result<Value, TemplateError> {
        let result = if self.funcs.has(function) {
            self.funcs.call(function, args).await
        } else {
            match funcs::call(function, args) {
                Some(result) => result,
                None => {
                    return Err(unknown_function(self.name, self.src, self.funcs, pos, function));
                }
            }
        };
        result.map_err(|source| {
            let (line, column) = line_col(self.src, pos);
            TemplateError::Call {
                name: self.name.to_string(),
                line,
                column,
                function: function.to_string(),
                source,
            }
        })
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        self.vars.iter().rev().find(|(n, _)| n == name).map(|(_, v)| v.clone())
    }

    fn walk_fields(&self, mut value: Value, fields: &[String]) -> Result<Value, TemplateError> {
        for field in fields {
            value = match value {
                Value::Object(mut map) => map.remove(field).unwrap_or(Value::Null),
                Value::Null => Value::Null,
                other => {
                    return Err(self.exec_err(
                        self.pos,
                        format!("can't evaluate field {field} in type {}", type_name(&other)),
                    ));
                }
            };
        }
        Ok(value)
    }

    fn exec_err(&self, pos: usize, message: impl Into<String>) -> TemplateError {
        let (line, column) = line_col(self.src, pos);
        TemplateError::Exec {
            name: self.name.to_string(),
            line,
            column,
            message: message.into(),
        }
    }
}

/// Build an [`TemplateError::UnknownFunction`] with close-match suggestions.
pub(super) fn unknown_function(
    name: &str,
    src: &str,
    table: &dyn Functions,
    pos: usize,
    function: &str,
) -> TemplateError {
    let mut candidates: Vec<String> =
        funcs::BUILTIN_NAMES.iter().map(|s| (*s).to_string()).collect();
    candidates.extend(table.names());
    let mut scored: Vec<(usize, String)> = candidates
        .into_iter()
        .map(|candidate| (strsim::levenshtein(function, &candidate), candidate))
        .filter(|(distance, _)| *distance <= 2)
        .collect();
    scored.sort();
    scored.dedup_by(|a, b| a.1 == b.1);

    let (line, column) = line_col(src, pos);
    TemplateError::UnknownFunction {
        name: name.to_string(),
        line,
        column,
        function: function.to_string(),
        suggestions: scored.into_iter().take(3).map(|(_, s)| s).collect(),
    }
}
