//! Dinghyfile rendering.
//!
//! A render downloads a template, preprocesses it, extracts `globals` when it
//! is a dinghyfile, and executes it with the dinghyfile function vocabulary:
//!
//! | Function | Effect |
//! |---|---|
//! | `module name k v ...` | render `name` from the template repo, `k: v` as innermost frame |
//! | `appModule name k v ...` | same as `module` |
//! | `local_module name k v ...` | same, resolved in the calling repository |
//! | `var name [default]` | innermost binding of `name`; `"@other"` as default looks up `other` |
//! | `pipelineID app name` | orchestrator id of a pipeline, created empty if missing |
//! | `makeSlice x ...` | its arguments as a list |
//!
//! Module expansion is depth-first and the result is spliced into the
//! caller's output. After each template finishes, the modules it called are
//! written to the dependency graph in a single `set_deps` call.

pub mod events;
mod functions;
pub mod globals;
pub mod vars;

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::config::Settings;
use crate::constants::{MAX_MODULE_DEPTH, TEMPLATE_MODULE_BRANCH};
use crate::core::{DinghyError, DinghyLog, RenderStage};
use crate::graph::DependencyManager;
use crate::orchestrator::Orchestrator;
use crate::preprocessor::preprocess;
use crate::template::Template;
use crate::vcs::{Downloader, FileLocation, base_name};

pub use events::{EventSink, RenderEvent, RenderEventKind, TracingEventSink};
use functions::RenderFunctions;
pub use vars::VarStack;

/// Whether a run may change external state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Write pipelines and dependency edges.
    Process,
    /// Render and check only; writes go to read-only surrogates.
    Validate,
}

/// Renders dinghyfiles and modules for one push.
pub struct Renderer {
    settings: Arc<Settings>,
    downloader: Arc<dyn Downloader>,
    deps: Arc<dyn DependencyManager>,
    orchestrator: Arc<dyn Orchestrator>,
    events: Arc<dyn EventSink>,
    log: DinghyLog,
    action: Action,
    rebuilding: bool,
    raw_data: Value,
}

impl Renderer {
    pub fn new(
        settings: Arc<Settings>,
        downloader: Arc<dyn Downloader>,
        deps: Arc<dyn DependencyManager>,
        orchestrator: Arc<dyn Orchestrator>,
        action: Action,
    ) -> Self {
        Self {
            settings,
            downloader,
            deps,
            orchestrator,
            events: Arc::new(TracingEventSink),
            log: DinghyLog::new(),
            action,
            rebuilding: false,
            raw_data: Value::Null,
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Capture log shared with the rest of the webhook.
    pub fn with_log(mut self, log: DinghyLog) -> Self {
        self.log = log;
        self
    }

    /// Push payload exposed to templates as `.RawData`.
    pub fn with_raw_data(mut self, raw_data: Value) -> Self {
        self.raw_data = raw_data;
        self
    }

    /// Mark renders as part of a module rebuild, which leaves stored push
    /// payloads untouched.
    pub fn rebuilding(mut self, rebuilding: bool) -> Self {
        self.rebuilding = rebuilding;
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn log(&self) -> &DinghyLog {
        &self.log
    }

    /// Render `path` with `vars` as the caller's scope.
    pub async fn render(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
        vars: &VarStack,
    ) -> Result<String, DinghyError> {
        let location = FileLocation {
            org: org.to_string(),
            repo: repo.to_string(),
            path: path.to_string(),
            branch: branch.to_string(),
        };
        self.render_at(location, vars.clone(), 0).await
    }

    /// Check that `path` parses as a module and only calls known functions.
    pub async fn validate_module(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<(), DinghyError> {
        let source = self.downloader.download(org, repo, path, branch).await?;
        let source = preprocess(path, &source)
            .map_err(|e| DinghyError::render(RenderStage::Preprocess, path, e.to_string()))?;
        let template = Template::parse(path, source)
            .map_err(|e| DinghyError::render(RenderStage::Template, path, e.to_string()))?;
        let functions = self.functions(
            FileLocation {
                org: org.to_string(),
                repo: repo.to_string(),
                path: path.to_string(),
                branch: branch.to_string(),
            },
            false,
            VarStack::new(),
            0,
        );
        template
            .check_functions(&functions)
            .map_err(|e| DinghyError::render(RenderStage::Template, path, e.to_string()))
    }

    fn functions(
        &self,
        location: FileLocation,
        is_dinghyfile: bool,
        vars: VarStack,
        depth: usize,
    ) -> RenderFunctions<'_> {
        let module_branch = if self.settings.is_template_repo(&location.org, &location.repo) {
            location.branch.clone()
        } else {
            TEMPLATE_MODULE_BRANCH.to_string()
        };
        RenderFunctions {
            renderer: self,
            location,
            module_branch,
            is_dinghyfile,
            vars,
            depth,
            deps: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, kind: RenderEventKind, location: &FileLocation, message: String, module: bool) {
        self.events.emit(RenderEvent {
            kind,
            org: location.org.clone(),
            repo: location.repo.clone(),
            path: location.path.clone(),
            branch: location.branch.clone(),
            message,
            module,
        });
    }

    fn render_at(
        &self,
        location: FileLocation,
        vars: VarStack,
        depth: usize,
    ) -> BoxFuture<'_, Result<String, DinghyError>> {
        Box::pin(async move {
            let path = location.path.clone();
            if depth > MAX_MODULE_DEPTH {
                return Err(DinghyError::render(
                    RenderStage::ModuleRecursion,
                    &path,
                    format!("modules nested deeper than {MAX_MODULE_DEPTH} levels"),
                ));
            }
            let is_dinghyfile = base_name(&path) == self.settings.dinghy_filename;
            let is_module = !is_dinghyfile;

            let source = match self
                .downloader
                .download(&location.org, &location.repo, &path, &location.branch)
                .await
            {
                Ok(source) => source,
                Err(e) => {
                    self.emit(RenderEventKind::DownloadFailed, &location, e.to_string(), is_module);
                    return Err(e);
                }
            };

            let source = preprocess(&path, &source)
                .map_err(|e| DinghyError::render(RenderStage::Preprocess, &path, e.to_string()))?;

            let mut vars = vars;
            if is_dinghyfile {
                match globals::extract_globals(self.settings.parser_format, &path, &source) {
                    Ok(globals) => vars = vars.push_outermost(globals),
                    Err(e) => {
                        let kind = RenderEventKind::GlobalsFailed;
                        self.emit(kind, &location, e.to_string(), is_module);
                        return Err(e);
                    }
                }
            }

            let template = match Template::parse(path.as_str(), source) {
                Ok(template) => template,
                Err(e) => {
                    let err = DinghyError::render(RenderStage::Template, &path, e.to_string());
                    let kind = RenderEventKind::TemplateFailed;
                    self.emit(kind, &location, err.to_string(), is_module);
                    return Err(err);
                }
            };

            let data = json!({
                "Org": location.org,
                "Repo": location.repo,
                "Path": location.path,
                "Branch": location.branch,
                "RawData": self.raw_data,
            });
            let functions = self.functions(location.clone(), is_dinghyfile, vars, depth);
            let rendered = match template.execute(&functions, &data).await {
                Ok(rendered) => rendered,
                Err(e) => {
                    let message = e.to_string();
                    let source = e.into_call_source().map(|s| s.downcast::<DinghyError>());
                    let err = match source {
                        // A nested render already classified its failure.
                        Ok(Ok(inner)) => inner,
                        _ => DinghyError::render(RenderStage::Template, &path, message),
                    };
                    let kind = RenderEventKind::TemplateFailed;
                    self.emit(kind, &location, err.to_string(), is_module);
                    return Err(err);
                }
            };

            let url =
                self.downloader.encode_url(&location.org, &location.repo, &path, &location.branch);
            self.deps.set_deps(&url, &functions.take_deps()).await?;
            if is_dinghyfile && !self.rebuilding {
                let raw = serde_json::to_string(&self.raw_data)
                    .map_err(|e| DinghyError::render(RenderStage::Template, &path, e.to_string()))?;
                self.deps.set_raw_data(&url, &raw).await?;
            }

            self.emit(RenderEventKind::Parse, &location, rendered.clone(), is_module);
            Ok(rendered)
        })
    }
}
