//! Turns dinghyfiles into orchestrator state.
//!
//! [`PipelineBuilder::process_dinghyfile`] renders a dinghyfile, unmarshals
//! it, makes sure its application exists with the declared permissions and
//! notifications, checks that the pusher may write to it, and upserts every
//! pipeline. [`PipelineBuilder::rebuild_module_roots`] does the same for every
//! dinghyfile that includes a changed module.
//!
//! A builder is created per webhook. Its [`Action`] decides whether the
//! collaborators it was given are the writeable ones or read-only surrogates;
//! the builder itself never checks.

mod dinghyfile;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Value, json};

use crate::config::Settings;
use crate::core::{DinghyError, DinghyLog};
use crate::graph::DependencyManager;
use crate::metrics::Metrics;
use crate::orchestrator::types::{self, ApplicationSpec, Pipeline};
use crate::orchestrator::Orchestrator;
use crate::renderer::{Action, EventSink, Renderer, TracingEventSink, VarStack};
use crate::vcs::Downloader;

pub use dinghyfile::Dinghyfile;

/// Result of processing one dinghyfile.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedDinghyfile {
    /// Encoded URL of the dinghyfile.
    pub url: String,
    pub path: String,
    pub application: String,
    pub rendered: String,
    /// Application notification settings, for notifiers.
    pub notifications: Option<Value>,
    /// Pipelines written, in document order.
    pub pipelines: Vec<String>,
}

/// Renders and applies dinghyfiles for one webhook.
pub struct PipelineBuilder {
    settings: Arc<Settings>,
    downloader: Arc<dyn Downloader>,
    deps: Arc<dyn DependencyManager>,
    orchestrator: Arc<dyn Orchestrator>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    log: DinghyLog,
    action: Action,
    pusher: Option<String>,
    raw_data: Value,
    vars: VarStack,
}

impl PipelineBuilder {
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
            metrics: Arc::new(Metrics::new()),
            log: DinghyLog::new(),
            action,
            pusher: None,
            raw_data: Value::Null,
            vars: VarStack::new(),
        }
    }

    pub fn with_log(mut self, log: DinghyLog) -> Self {
        self.log = log;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Login checked by the write-access policy.
    pub fn with_pusher(mut self, pusher: Option<String>) -> Self {
        self.pusher = pusher;
        self
    }

    /// Webhook payload, exposed to templates as `.RawData` and stored per
    /// dinghyfile for later rebuilds.
    pub fn with_raw_data(mut self, raw_data: Value) -> Self {
        self.raw_data = raw_data;
        self
    }

    /// Variables visible to the top-level render, beneath globals.
    pub fn with_vars(mut self, vars: VarStack) -> Self {
        self.vars = vars;
        self
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn log(&self) -> &DinghyLog {
        &self.log
    }

    fn renderer(&self, raw_data: Value, rebuilding: bool) -> Renderer {
        Renderer::new(
            self.settings.clone(),
            self.downloader.clone(),
            self.deps.clone(),
            self.orchestrator.clone(),
            self.action,
        )
        .with_events(self.events.clone())
        .with_log(self.log.clone())
        .with_raw_data(raw_data)
        .rebuilding(rebuilding)
    }

    /// Render, unmarshal and apply the dinghyfile at `path`.
    pub async fn process_dinghyfile(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<ProcessedDinghyfile, DinghyError> {
        self.process_with(self.renderer(self.raw_data.clone(), false), org, repo, path, branch)
            .await
    }

    async fn process_with(
        &self,
        renderer: Renderer,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<ProcessedDinghyfile, DinghyError> {
        self.log.info(format!("processing {org}/{repo}/{path}@{branch}"));
        let rendered = renderer.render(org, repo, path, branch, &self.vars).await?;
        self.metrics.dinghyfile_rendered();
        self.log.debug(format!("rendered {path}:\n{rendered}"));

        let format = self.settings.parser_format;
        let mut dinghyfile = Dinghyfile::parse(format, path, &rendered)?;
        dinghyfile.apply_defaults(format, path, &self.settings.default_email)?;

        self.check_write_access(&dinghyfile.spec).await?;
        self.reconcile_application(&dinghyfile.spec).await?;
        let pipelines = self.reconcile_pipelines(&dinghyfile).await?;

        Ok(ProcessedDinghyfile {
            url: self.downloader.encode_url(org, repo, path, branch),
            path: path.to_string(),
            application: dinghyfile.application,
            rendered,
            notifications: dinghyfile.spec.notifications,
            pipelines,
        })
    }

    /// Check that the module at `path` parses and calls only known functions.
    pub async fn validate_module(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<(), DinghyError> {
        self.renderer(Value::Null, false).validate_module(org, repo, path, branch).await
    }

    /// Reprocess every dinghyfile that includes the module at `path`.
    ///
    /// Each root is rendered with the payload stored by its last regular
    /// render. Failures do not stop the pass; they are returned together as
    /// [`DinghyError::Rebuild`].
    pub async fn rebuild_module_roots(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<Vec<ProcessedDinghyfile>, DinghyError> {
        let url = self.downloader.encode_url(org, repo, path, branch);
        let roots = self.deps.get_roots(&url).await?;
        self.log
            .info(format!("{path} changed, rebuilding {} dinghyfile(s) that use it", roots.len()));

        let mut processed = Vec::new();
        let mut failures = Vec::new();
        for root in &roots {
            match self.rebuild_root(root).await {
                Ok(done) => processed.push(done),
                Err(e) => {
                    self.log.error(format!("failed to rebuild {root}: {e}"));
                    failures.push((root.clone(), e));
                }
            }
        }

        if failures.is_empty() {
            Ok(processed)
        } else {
            Err(DinghyError::Rebuild {
                total: roots.len(),
                failures,
            })
        }
    }

    async fn rebuild_root(&self, url: &str) -> Result<ProcessedDinghyfile, DinghyError> {
        let location = self.downloader.decode_url(url)?;
        let raw_data = match self.deps.get_raw_data(url).await? {
            Some(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                self.log.warn(format!("stored payload for {url} is not JSON ({e}), ignoring it"));
                Value::Null
            }),
            None => Value::Null,
        };
        self.process_with(
            self.renderer(raw_data, true),
            &location.org,
            &location.repo,
            &location.path,
            &location.branch,
        )
        .await
    }

    /// Enforce the write-access policy for the pusher.
    ///
    /// The WRITE set is taken from the application as it exists now, so a
    /// push cannot grant itself access; for a new application the declared
    /// permissions apply. An empty WRITE set allows everyone.
    async fn check_write_access(&self, spec: &ApplicationSpec) -> Result<(), DinghyError> {
        if !self.settings.user_write_permissions_check_enabled {
            return Ok(());
        }
        let Some(user) = self.pusher.as_deref() else {
            self.log.warn("write permission check enabled but the push has no user, skipping");
            return Ok(());
        };
        if self.settings.user_write_permission_exceptions.iter().any(|u| u == user) {
            self.log.debug(format!("{user} is exempt from the write permission check"));
            return Ok(());
        }

        let existing = self.orchestrator.get_application(&spec.name).await?;
        let write = existing
            .as_ref()
            .and_then(|app| app.permissions.as_ref())
            .or(spec.permissions.as_ref())
            .map(|p| p.write.clone())
            .unwrap_or_default();
        if write.is_empty() {
            return Ok(());
        }

        let roles = self.orchestrator.user_roles(user).await?;
        if roles.iter().any(|role| write.contains(role)) {
            Ok(())
        } else {
            Err(DinghyError::UserNotAuthorized {
                user: user.to_string(),
                application: spec.name.clone(),
            })
        }
    }

    async fn reconcile_application(&self, spec: &ApplicationSpec) -> Result<(), DinghyError> {
        if !self.orchestrator.application_exists(&spec.name).await? {
            self.log.info(format!("creating application {}", spec.name));
            self.orchestrator.create_application(spec).await?;
        }
        if let Some(permissions) = spec.permissions.as_ref().filter(|p| !p.is_empty()) {
            self.orchestrator.update_permissions(&spec.name, permissions).await?;
            // Roles are cached by the authorization service.
            self.orchestrator.force_refresh().await?;
        }
        if let Some(notifications) = &spec.notifications {
            self.orchestrator.update_notifications(&spec.name, notifications).await?;
        }
        Ok(())
    }

    async fn reconcile_pipelines(
        &self,
        dinghyfile: &Dinghyfile,
    ) -> Result<Vec<String>, DinghyError> {
        let application = &dinghyfile.application;
        let existing: HashMap<String, String> = self
            .orchestrator
            .pipelines(application)
            .await?
            .iter()
            .filter_map(|p| {
                Some((types::pipeline_name(p)?.to_string(), types::pipeline_id(p)?.to_string()))
            })
            .collect();

        let mut written = Vec::with_capacity(dinghyfile.pipelines.len());
        for pipeline in &dinghyfile.pipelines {
            let mut pipeline: Pipeline = pipeline.clone();
            let name = types::pipeline_name(&pipeline).unwrap_or_default().to_string();
            if let Some(id) = existing.get(&name) {
                pipeline.insert("id".to_string(), Value::String(id.clone()));
            }
            if self.settings.auto_lock_pipelines {
                pipeline.insert(
                    "locked".to_string(),
                    json!({
                        "ui": true,
                        "allowUnlockUi": true,
                        "description": "Managed by dinghy; edit the dinghyfile instead.",
                    }),
                );
            }
            self.log.info(format!("upserting pipeline {application}/{name}"));
            self.orchestrator.upsert_pipeline(&pipeline).await?;
            self.metrics.pipeline_upserted();
            written.push(name);
        }

        let delete_stale = dinghyfile
            .delete_stale_pipelines
            .unwrap_or(self.settings.delete_stale_pipelines_default);
        if delete_stale {
            let keep: HashSet<&str> = written.iter().map(String::as_str).collect();
            let mut stale: Vec<&String> =
                existing.keys().filter(|name| !keep.contains(name.as_str())).collect();
            stale.sort();
            for name in stale {
                self.log.info(format!("deleting stale pipeline {application}/{name}"));
                self.orchestrator.delete_pipeline(application, name).await?;
                self.metrics.pipeline_deleted();
            }
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MemoryDependencyGraph;
    use crate::orchestrator::Permissions;
    use crate::test_utils::{FakeOrchestrator, MemoryDownloader};

    const ORG: &str = "armory";
    const TEMPLATES: &str = "templates";

    struct Fixture {
        settings: Settings,
        downloader: Arc<MemoryDownloader>,
        graph: Arc<MemoryDependencyGraph>,
        orchestrator: Arc<FakeOrchestrator>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                settings: Settings {
                    template_org: ORG.to_string(),
                    template_repo: TEMPLATES.to_string(),
                    ..Settings::default()
                },
                downloader: Arc::new(MemoryDownloader::new()),
                graph: Arc::new(MemoryDependencyGraph::new()),
                orchestrator: Arc::new(FakeOrchestrator::new()),
            }
        }

        fn builder(&self) -> PipelineBuilder {
            PipelineBuilder::new(
                Arc::new(self.settings.clone()),
                self.downloader.clone(),
                self.graph.clone(),
                self.orchestrator.clone(),
                Action::Process,
            )
        }
    }

    #[tokio::test]
    async fn test_creates_application_and_pipelines() {
        let fx = Fixture::new();
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "app",
                "pipelines": [{"name": "deploy", "stages": [ {{ module "wait" }} ]}]}"#,
        );
        fx.downloader.insert(ORG, TEMPLATES, "wait", "master", r#"{"type": "wait"}"#);

        let done =
            fx.builder().process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap();
        assert_eq!(done.application, "app");
        assert_eq!(done.pipelines, vec!["deploy".to_string()]);
        assert_eq!(
            fx.orchestrator.writes(),
            vec!["create application app".to_string(), "upsert pipeline app/deploy".to_string()]
        );
        let stored = fx.orchestrator.pipeline("app", "deploy").unwrap();
        assert_eq!(stored["stages"], json!([{"type": "wait"}]));
    }

    #[tokio::test]
    async fn test_spec_name_decides_target_application() {
        let fx = Fixture::new();
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "fromapp", "spec": {"name": "fromspec"},
                "pipelines": [{"name": "deploy"}]}"#,
        );

        let done =
            fx.builder().process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap();
        assert_eq!(done.application, "fromspec");
        assert_eq!(
            fx.orchestrator.writes(),
            vec![
                "create application fromspec".to_string(),
                "upsert pipeline fromspec/deploy".to_string()
            ]
        );
        assert!(fx.orchestrator.pipeline("fromapp", "deploy").is_none());
    }

    #[tokio::test]
    async fn test_existing_ids_are_reused_and_stale_deleted() {
        let fx = Fixture::new();
        fx.orchestrator.add_application("app");
        fx.orchestrator.add_pipeline("app", "deploy", "id-deploy");
        fx.orchestrator.add_pipeline("app", "old", "id-old");
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "app", "deleteStalePipelines": true,
                "pipelines": [{"name": "deploy"}]}"#,
        );

        fx.builder().process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap();
        assert_eq!(
            fx.orchestrator.writes(),
            vec!["upsert pipeline app/deploy".to_string(), "delete pipeline app/old".to_string()]
        );
        assert_eq!(fx.orchestrator.pipeline("app", "deploy").unwrap()["id"], json!("id-deploy"));
    }

    #[tokio::test]
    async fn test_auto_lock() {
        let mut fx = Fixture::new();
        fx.settings.auto_lock_pipelines = true;
        let body = r#"{"application": "app", "pipelines": [{"name": "p"}]}"#;
        fx.downloader.insert(ORG, "svc", "dinghyfile", "master", body);
        fx.builder().process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap();
        let locked = &fx.orchestrator.pipeline("app", "p").unwrap()["locked"];
        assert_eq!(locked["ui"], json!(true));
        assert_eq!(locked["allowUnlockUi"], json!(true));
    }

    #[tokio::test]
    async fn test_malformed_output() {
        let fx = Fixture::new();
        let body = r#"{"application": "app", "pipelines": [ }"#;
        fx.downloader.insert(ORG, "svc", "dinghyfile", "master", body);
        let err =
            fx.builder().process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap_err();
        assert!(err.is_malformed());
        assert_eq!(err.http_status(false), 422);
        assert!(fx.orchestrator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_permissions_and_write_access() {
        let mut fx = Fixture::new();
        fx.settings.user_write_permissions_check_enabled = true;
        fx.orchestrator.set_roles("alice", &["devs"]);
        fx.orchestrator.set_roles("mallory", &["guests"]);
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "app",
                "spec": {"permissions": {"READ": ["devs"], "WRITE": ["devs"]}},
                "pipelines": []}"#,
        );

        let err = fx
            .builder()
            .with_pusher(Some("mallory".to_string()))
            .process_dinghyfile(ORG, "svc", "dinghyfile", "master")
            .await
            .unwrap_err();
        assert!(matches!(err, DinghyError::UserNotAuthorized { .. }));
        assert!(fx.orchestrator.writes().is_empty());

        fx.builder()
            .with_pusher(Some("alice".to_string()))
            .process_dinghyfile(ORG, "svc", "dinghyfile", "master")
            .await
            .unwrap();
        assert_eq!(
            fx.orchestrator.writes(),
            vec![
                "create application app".to_string(),
                "update permissions app".to_string(),
                "force refresh".to_string(),
            ]
        );
        assert_eq!(
            fx.orchestrator.application("app").unwrap().permissions,
            Some(Permissions {
                read: vec!["devs".to_string()],
                write: vec!["devs".to_string()],
                execute: vec![],
            })
        );
    }

    #[tokio::test]
    async fn test_write_access_exceptions() {
        let mut fx = Fixture::new();
        fx.settings.user_write_permissions_check_enabled = true;
        fx.settings.user_write_permission_exceptions = vec!["ci-bot".to_string()];
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "app", "spec": {"permissions": {"WRITE": ["devs"]}}}"#,
        );
        fx.builder()
            .with_pusher(Some("ci-bot".to_string()))
            .process_dinghyfile(ORG, "svc", "dinghyfile", "master")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_processes_each_root_once() {
        let fx = Fixture::new();
        fx.downloader.insert(
            ORG,
            "svc",
            "dinghyfile",
            "master",
            r#"{"application": "app", "pipelines": [
                {"name": "p", "stages": [ {{ module "m1" }}, {{ module "m2" }} ]}
            ]}"#,
        );
        fx.downloader.insert(ORG, TEMPLATES, "m1", "master", r#"{{ module "m3" }}"#);
        fx.downloader.insert(ORG, TEMPLATES, "m2", "master", r#"{{ module "m3" }}"#);
        fx.downloader.insert(ORG, TEMPLATES, "m3", "master", r#"{"type": "wait"}"#);

        let builder = fx.builder().with_raw_data(json!({"after": "abc"}));
        builder.process_dinghyfile(ORG, "svc", "dinghyfile", "master").await.unwrap();

        let rebuilt = builder.rebuild_module_roots(ORG, TEMPLATES, "m3", "master").await.unwrap();
        assert_eq!(rebuilt.len(), 1);
        assert_eq!(rebuilt[0].path, "dinghyfile");
        assert_eq!(
            fx.orchestrator.writes().iter().filter(|w| w.starts_with("upsert")).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_rebuild_collects_failures() {
        let fx = Fixture::new();
        let df = |name: &str| fx.downloader.encode_url(ORG, name, "dinghyfile", "master");
        let module = fx.downloader.encode_url(ORG, TEMPLATES, "m", "master");
        fx.graph.set_deps(&df("one"), &[module.clone()]).await.unwrap();
        fx.graph.set_deps(&df("two"), &[module]).await.unwrap();
        let body = r#"{"application": "one", "pipelines": []}"#;
        fx.downloader.insert(ORG, "one", "dinghyfile", "master", body);

        let err =
            fx.builder().rebuild_module_roots(ORG, TEMPLATES, "m", "master").await.unwrap_err();
        let DinghyError::Rebuild {
            total,
            failures,
        } = &err
        else {
            panic!("expected rebuild error, got {err}");
        };
        assert_eq!(*total, 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, df("two"));
        assert!(err.is_file_not_found());
        assert_eq!(fx.orchestrator.writes(), vec!["create application one".to_string()]);
    }
}
