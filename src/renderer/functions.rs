//! The dinghyfile function vocabulary.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use super::vars::VarStack;
use super::Renderer;
use crate::template::Functions;
use crate::template::value::{to_text, type_name};
use crate::vcs::FileLocation;

const NAMES: &[&str] = &["module", "appModule", "local_module", "var", "pipelineID", "makeSlice"];

/// Functions bound to one template render.
pub(super) struct RenderFunctions<'r> {
    pub(super) renderer: &'r Renderer,
    /// The template being rendered.
    pub(super) location: FileLocation,
    /// Branch that template-repo modules are fetched from.
    pub(super) module_branch: String,
    pub(super) is_dinghyfile: bool,
    pub(super) vars: VarStack,
    pub(super) depth: usize,
    /// Encoded URLs of every module called, in call order.
    pub(super) deps: Mutex<Vec<String>>,
}

impl RenderFunctions<'_> {
    /// Dependencies discovered so far, sorted and without duplicates.
    pub(super) fn take_deps(&self) -> Vec<String> {
        let mut deps = std::mem::take(&mut *self.deps.lock());
        deps.sort();
        deps.dedup();
        deps
    }

    fn record_dep(&self, url: String) {
        self.deps.lock().push(url);
    }

    async fn module(&self, org: &str, repo: &str, branch: &str, args: Vec<Value>) -> Result<Value> {
        let mut args = args.into_iter();
        let name = match args.next() {
            Some(Value::String(name)) => name,
            Some(other) => bail!("module name must be a string, got {}", type_name(&other)),
            None => bail!("module requires a name"),
        };
        let params: Vec<Value> = args.collect();
        if params.len() % 2 != 0 {
            self.renderer.log.warn(format!(
                "odd number of parameters passed to module {name}, ignoring trailing {:?}",
                params.last().map(to_text).unwrap_or_default()
            ));
        }

        let mut frame = Map::new();
        for pair in params.chunks_exact(2) {
            let Value::String(key) = &pair[0] else {
                let found = type_name(&pair[0]);
                bail!("module {name}: parameter names must be strings, got {found}");
            };
            if let Some(value) = self.resolve_param(&name, key, &pair[1]) {
                frame.insert(key.clone(), value);
            }
        }

        self.record_dep(self.renderer.downloader.encode_url(org, repo, &name, branch));
        let location = FileLocation {
            org: org.to_string(),
            repo: repo.to_string(),
            path: name,
            branch: branch.to_string(),
        };
        let rendered =
            self.renderer.render_at(location, self.vars.push(frame), self.depth + 1).await?;
        Ok(Value::String(rendered))
    }

    /// Apply deep-variable substitution to a module parameter.
    ///
    /// A value starting with `{{var name}}` has that reference replaced by
    /// `name` as seen by the caller. A bare reference keeps the variable's
    /// type; anything after it is appended to the variable's text. An
    /// unresolved reference leaves the parameter unset so the module's own
    /// default applies.
    fn resolve_param(&self, module: &str, key: &str, value: &Value) -> Option<Value> {
        let Some((var_name, suffix)) = value.as_str().and_then(deep_var_ref) else {
            return Some(value.clone());
        };
        match self.vars.lookup(var_name) {
            Some(found) if suffix.is_empty() => Some(found.clone()),
            Some(found) => Some(Value::String(format!("{}{suffix}", to_text(found)))),
            None => {
                let message = format!("module {module}: {key} refers to undefined {var_name}");
                self.renderer.log.warn(message);
                None
            }
        }
    }

    fn var(&self, args: &[Value]) -> Result<Value> {
        let (name, default) = match args {
            [name] => (name, None),
            [name, default] => (name, Some(default)),
            _ => bail!("var takes a name and an optional default, got {} arguments", args.len()),
        };
        let Value::String(name) = name else {
            bail!("var name must be a string, got {}", type_name(name));
        };

        if let Some(value) = self.vars.lookup(name) {
            return Ok(value.clone());
        }
        match default {
            Some(Value::String(reference)) if reference.starts_with('@') => {
                let other = &reference[1..];
                match self.vars.lookup(other) {
                    Some(value) => Ok(value.clone()),
                    None => {
                        let message = format!("var {name}: default {reference} is not defined");
                        self.renderer.log.warn(message);
                        Ok(Value::String(String::new()))
                    }
                }
            }
            Some(default) => Ok(default.clone()),
            None => Ok(Value::String(String::new())),
        }
    }

    async fn pipeline_id(&self, args: &[Value]) -> Result<Value> {
        let [app, pipeline] = args else {
            bail!(
                "pipelineID takes an application and a pipeline name, got {} arguments",
                args.len()
            );
        };
        let app = self.vars.lookup("triggerApp").unwrap_or(app);
        let pipeline = self.vars.lookup("triggerPipeline").unwrap_or(pipeline);
        let (Value::String(app), Value::String(pipeline)) = (app, pipeline) else {
            bail!("pipelineID arguments must be strings");
        };
        let id = self.renderer.orchestrator.pipeline_id(app, pipeline).await?;
        Ok(Value::String(id))
    }
}

/// Name referenced by a leading `{{var name}}`, quoted or not, and the text
/// that follows it.
fn deep_var_ref(text: &str) -> Option<(&str, &str)> {
    let text = text.trim();
    let (inner, suffix) = text.strip_prefix("{{")?.split_once("}}")?;
    let inner = inner.trim_matches(|c: char| c == '-' || c.is_whitespace());
    let rest = inner.strip_prefix("var")?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let name = rest.trim().trim_matches('"');
    (!name.is_empty()).then_some((name, suffix))
}

#[async_trait]
impl Functions for RenderFunctions<'_> {
    fn has(&self, name: &str) -> bool {
        NAMES.contains(&name)
    }

    fn names(&self) -> Vec<String> {
        NAMES.iter().map(|n| n.to_string()).collect()
    }

    async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        let settings = &self.renderer.settings;
        match name {
            "module" | "appModule" => {
                let (org, repo) = (&settings.template_org, &settings.template_repo);
                self.module(org, repo, &self.module_branch, args).await
            }
            "local_module" => {
                let location = &self.location;
                if settings.is_template_repo(&location.org, &location.repo) && !self.is_dinghyfile {
                    bail!("local_module cannot be called from inside a module ({})", location.path);
                }
                self.module(&location.org, &location.repo, &location.branch, args).await
            }
            "var" => self.var(&args),
            "pipelineID" => self.pipeline_id(&args).await,
            "makeSlice" => Ok(Value::Array(args)),
            other => Err(anyhow!("function {other} is not defined")),
        }
    }
}
