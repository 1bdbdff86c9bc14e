//! The per-webhook state machine.
//!
//! [`PushHandler::process`] takes a decoded, authenticated push through:
//!
//! 1. the ignore filter: a push touching only ignored files ends here
//! 2. the branch gate, choosing [`Action::Process`] or [`Action::Validate`]
//! 3. a `pending` commit status, unless the commit already has one
//! 4. the render loop over every changed dinghyfile
//! 5. for the template repository, module validation and a rebuild of every
//!    dinghyfile that uses a changed module
//! 6. the final commit status, a log event and notifications
//!
//! Errors are classified here and nowhere else: [`DinghyError::http_status`]
//! and [`DinghyError::commit_state`] decide the response and commit status.

mod ignore;
mod signature;

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::Instrument;

use crate::builder::{PipelineBuilder, ProcessedDinghyfile};
use crate::config::Settings;
use crate::core::{DinghyError, DinghyLog};
use crate::graph::{DependencyManager, ReadOnlyDependencyManager};
use crate::logevents::{LogEvent, LogEventStatus, LogEventStore};
use crate::metrics::{Metrics, Outcome};
use crate::notifier::{Notice, Notifiers};
use crate::orchestrator::{Orchestrator, ReadOnlyOrchestrator};
use crate::renderer::{Action, EventSink, TracingEventSink, VarStack};
use crate::vcs::cache::OverlayDownloader;
use crate::vcs::status::pending_description;
use crate::vcs::{
    CachingDownloader, CommitState, Downloader, FileLocation, Push, PushEvent, base_name,
};

pub use ignore::IgnoreFilter;
pub use signature::{find_validation, sign, validate_signature};

/// What happened to one webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub action: Action,
    /// HTTP status for the webhook response.
    pub status: u16,
    pub error: Option<String>,
    /// Dinghyfiles written or validated, including rebuilt ones.
    pub processed: Vec<ProcessedDinghyfile>,
    /// Nothing was rendered: the push was ignored or had nothing to do.
    pub skipped: bool,
}

impl PushOutcome {
    fn skipped(action: Action) -> Self {
        Self {
            action,
            status: 200,
            error: None,
            processed: Vec::new(),
            skipped: true,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Long-lived collaborators shared by every webhook.
pub struct PushHandler {
    settings: Arc<Settings>,
    graph: Arc<dyn DependencyManager>,
    orchestrator: Arc<dyn Orchestrator>,
    notifiers: Notifiers,
    log_events: Arc<LogEventStore>,
    metrics: Arc<Metrics>,
    events: Arc<dyn EventSink>,
    ignore: IgnoreFilter,
}

impl PushHandler {
    pub fn new(
        settings: Arc<Settings>,
        graph: Arc<dyn DependencyManager>,
        orchestrator: Arc<dyn Orchestrator>,
        notifiers: Notifiers,
        log_events: Arc<LogEventStore>,
        metrics: Arc<Metrics>,
    ) -> Result<Self, DinghyError> {
        let ignore = IgnoreFilter::from_settings(&settings)?;
        Ok(Self {
            settings,
            graph,
            orchestrator,
            notifiers,
            log_events,
            metrics,
            events: Arc::new(TracingEventSink),
            ignore,
        })
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn graph(&self) -> &Arc<dyn DependencyManager> {
        &self.graph
    }

    pub fn orchestrator(&self) -> &Arc<dyn Orchestrator> {
        &self.orchestrator
    }

    pub fn log_events(&self) -> &Arc<LogEventStore> {
        &self.log_events
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Process mode unless the branch gate says otherwise.
    ///
    /// A repository listed in `repo_config` is processed only on its
    /// configured branch; any other repository only on `master` or `main`.
    pub fn action_for(&self, push: &dyn Push) -> Action {
        let processing_branch = match self.settings.repo_branch(push.name(), push.repo()) {
            Some(branch) => push.is_branch(branch),
            None => push.is_master(),
        };
        if processing_branch {
            Action::Process
        } else {
            Action::Validate
        }
    }

    /// Builder for a manual or CLI render, always in validate mode.
    pub fn validation_builder(&self, downloader: Arc<dyn Downloader>) -> PipelineBuilder {
        PipelineBuilder::new(
            self.settings.clone(),
            downloader,
            Arc::new(ReadOnlyDependencyManager::new(self.graph.clone())),
            Arc::new(ReadOnlyOrchestrator::new(self.orchestrator.clone())),
            Action::Validate,
        )
        .with_events(self.events.clone())
        .with_metrics(self.metrics.clone())
    }

    /// Render a dinghyfile body that was never committed, as if it lived at `location`.
    ///
    /// Modules still come from `modules`. Nothing is written to the graph or
    /// the orchestrator.
    pub async fn render_uncommitted(
        &self,
        modules: Arc<dyn Downloader>,
        location: &FileLocation,
        body: impl Into<String>,
        vars: VarStack,
    ) -> Result<ProcessedDinghyfile, DinghyError> {
        let overlay = OverlayDownloader::new(modules);
        overlay.insert(&location.org, &location.repo, &location.path, &location.branch, body);
        self.validation_builder(Arc::new(overlay))
            .with_vars(vars)
            .process_dinghyfile(&location.org, &location.repo, &location.path, &location.branch)
            .await
    }

    /// Record a webhook whose signature did not check out.
    pub fn reject(&self, event: &PushEvent, err: &DinghyError) {
        tracing::warn!(
            "rejecting {} webhook for {}/{}: {}",
            event.provider,
            event.org,
            event.repo,
            err
        );
        self.metrics.webhook_rejected();
        self.log_events.save(LogEvent {
            org: event.org.clone(),
            repo: event.repo.clone(),
            branch: event.branch.clone(),
            files: event.files.clone(),
            commits: event.commits.clone(),
            message: err.to_string(),
            status: LogEventStatus::Error,
            rendered_dinghyfile: String::new(),
            date: chrono::Utc::now(),
        });
    }

    /// Run one push through the state machine, fetching files with `downloader`.
    pub async fn process(&self, push: &dyn Push, downloader: Arc<dyn Downloader>) -> PushOutcome {
        let span = tracing::info_span!(
            "webhook",
            provider = push.name(),
            org = push.org(),
            repo = push.repo(),
            branch = push.branch()
        );
        self.process_inner(push, downloader).instrument(span).await
    }

    async fn process_inner(&self, push: &dyn Push, downloader: Arc<dyn Downloader>) -> PushOutcome {
        let action = self.action_for(push);
        if self.ignore.all_ignored(push.files()) {
            tracing::info!("every changed file is ignored, skipping");
            self.set_status(push, CommitState::Success, "All changed files are ignored").await;
            self.metrics.webhook_finished(Outcome::Skipped);
            return PushOutcome::skipped(action);
        }

        let is_template_repo = self.settings.is_template_repo(push.org(), push.repo());
        let files: Vec<&String> =
            push.files().iter().filter(|f| !self.ignore.is_ignored(f)).collect();
        let dinghyfiles: Vec<&String> = files
            .iter()
            .copied()
            .filter(|f| base_name(f) == self.settings.dinghy_filename)
            .collect();
        if dinghyfiles.is_empty() && !is_template_repo {
            tracing::debug!("no dinghyfile changed, nothing to do");
            self.metrics.webhook_finished(Outcome::Skipped);
            return PushOutcome::skipped(action);
        }

        let validating = action == Action::Validate;
        let (graph, orchestrator): (Arc<dyn DependencyManager>, Arc<dyn Orchestrator>) =
            if validating {
                (
                    Arc::new(ReadOnlyDependencyManager::new(self.graph.clone())),
                    Arc::new(ReadOnlyOrchestrator::new(self.orchestrator.clone())),
                )
            } else {
                (self.graph.clone(), self.orchestrator.clone())
            };
        let log = DinghyLog::new();
        let builder = PipelineBuilder::new(
            self.settings.clone(),
            Arc::new(CachingDownloader::new(downloader)),
            graph,
            orchestrator,
            action,
        )
        .with_log(log.clone())
        .with_events(self.events.clone())
        .with_metrics(self.metrics.clone())
        .with_pusher(push.event().pusher.clone())
        .with_raw_data(push.raw().clone());

        match push.get_commit_status().await {
            Ok(Some(state)) => log.debug(format!("commit already has a {state} status")),
            Ok(None) => {
                self.set_status(push, CommitState::Pending, pending_description(validating)).await
            }
            Err(e) => {
                log.warn(format!("could not read commit status: {e:#}"));
                self.set_status(push, CommitState::Pending, pending_description(validating)).await;
            }
        }

        let mut processed = Vec::new();
        let mut failure: Option<(String, DinghyError, bool)> = None;
        for path in &dinghyfiles {
            match builder.process_dinghyfile(push.org(), push.repo(), path, push.branch()).await {
                Ok(done) => processed.push(done),
                Err(e) => {
                    failure = Some(((*path).clone(), e, false));
                    break;
                }
            }
        }

        if failure.is_none() && is_template_repo {
            failure = self.rebuild_modules(&builder, push, &files, &mut processed).await;
        }

        let outcome = match failure {
            None => {
                let description =
                    if validating { "Dinghyfile validated" } else { "Pipelines updated" };
                log.info(format!("{description} ({} dinghyfile(s))", processed.len()));
                self.set_status(push, CommitState::Success, description).await;
                self.metrics.webhook_finished(Outcome::Success);
                PushOutcome {
                    action,
                    status: 200,
                    error: None,
                    processed,
                    skipped: false,
                }
            }
            Some((path, err, rebuilding)) => {
                let message = err.to_string();
                log.error(format!("{path}: {message}"));
                let state = err.commit_state();
                self.set_status(push, state, &message).await;
                self.metrics.webhook_finished(match state {
                    CommitState::Failure => Outcome::Failure,
                    _ => Outcome::Error,
                });
                self.notify(push, &path, Some(message.clone()), None).await;
                PushOutcome {
                    action,
                    status: err.http_status(rebuilding),
                    error: Some(message),
                    processed,
                    skipped: false,
                }
            }
        };

        for done in &outcome.processed {
            self.notify(push, &done.path, None, done.notifications.clone()).await;
        }
        self.save_log_event(push, &log, &outcome);
        outcome
    }

    /// Validate changed modules, then rebuild the dinghyfiles using them.
    async fn rebuild_modules(
        &self,
        builder: &PipelineBuilder,
        push: &dyn Push,
        files: &[&String],
        processed: &mut Vec<ProcessedDinghyfile>,
    ) -> Option<(String, DinghyError, bool)> {
        let modules: Vec<&String> = files
            .iter()
            .copied()
            .filter(|f| base_name(f) != self.settings.dinghy_filename)
            .collect();

        for module in &modules {
            let validated =
                builder.validate_module(push.org(), push.repo(), module, push.branch()).await;
            if let Err(e) = validated {
                return Some(((*module).clone(), e, false));
            }
        }
        for module in &modules {
            let rebuilt =
                builder.rebuild_module_roots(push.org(), push.repo(), module, push.branch()).await;
            match rebuilt {
                Ok(rebuilt) => processed.extend(rebuilt),
                Err(e) => return Some(((*module).clone(), e, true)),
            }
        }
        None
    }

    async fn set_status(&self, push: &dyn Push, state: CommitState, description: &str) {
        if let Err(e) = push.set_commit_status(state, description).await {
            tracing::warn!("failed to set {} commit status: {:#}", state, e);
        }
    }

    async fn notify(
        &self,
        push: &dyn Push,
        path: &str,
        error: Option<String>,
        notifications: Option<Value>,
    ) {
        let notice = Notice {
            org: push.org().to_string(),
            repo: push.repo().to_string(),
            path: path.to_string(),
            error,
            notifications,
            context: json!({
                "provider": push.name(),
                "branch": push.branch(),
                "commits": push.commits(),
            }),
        };
        self.notifiers.dispatch(notice).await;
    }

    fn save_log_event(&self, push: &dyn Push, log: &DinghyLog, outcome: &PushOutcome) {
        let rendered = outcome
            .processed
            .iter()
            .map(|p| p.rendered.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.log_events.save(LogEvent {
            org: push.org().to_string(),
            repo: push.repo().to_string(),
            branch: push.branch().to_string(),
            files: push.files().to_vec(),
            commits: push.commits().to_vec(),
            message: log.contents(),
            status: if outcome.is_success() {
                LogEventStatus::Success
            } else {
                LogEventStatus::Error
            },
            rendered_dinghyfile: rendered,
            date: chrono::Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoConfig;
    use crate::graph::MemoryDependencyGraph;
    use crate::test_utils::fixtures::push_event;
    use crate::test_utils::{FakeOrchestrator, FakePush, MemoryDownloader};

    fn handler(settings: Settings, orchestrator: Arc<FakeOrchestrator>) -> PushHandler {
        PushHandler::new(
            Arc::new(settings),
            Arc::new(MemoryDependencyGraph::new()),
            orchestrator,
            Notifiers::new(Vec::new(), std::time::Duration::from_secs(1)),
            Arc::new(LogEventStore::with_ttl_minutes(15)),
            Arc::new(Metrics::new()),
        )
        .unwrap()
    }

    #[test]
    fn test_branch_gate() {
        let settings = Settings {
            repo_config: vec![RepoConfig {
                provider: "github".to_string(),
                repo: "svc".to_string(),
                branch: "release".to_string(),
            }],
            ..Settings::default()
        };
        let handler = handler(settings, Arc::new(FakeOrchestrator::new()));
        let gate = |repo: &str, branch: &str| {
            handler.action_for(&FakePush::new(push_event("o", repo, branch, &[])))
        };

        assert_eq!(gate("other", "master"), Action::Process);
        assert_eq!(gate("other", "main"), Action::Process);
        assert_eq!(gate("other", "feature"), Action::Validate);
        assert_eq!(gate("svc", "release"), Action::Process);
        assert_eq!(gate("svc", "master"), Action::Validate);
    }

    #[tokio::test]
    async fn test_existing_status_suppresses_pending() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let handler = handler(Settings::default(), orchestrator);
        let downloader = Arc::new(MemoryDownloader::new());
        downloader.insert("o", "svc", "dinghyfile", "master", r#"{"application": "app"}"#);

        let push = FakePush::new(push_event("o", "svc", "master", &["dinghyfile"]))
            .with_status(CommitState::Success, "earlier run");
        let outcome = handler.process(&push, downloader).await;
        assert!(outcome.is_success());
        assert_eq!(push.states(), vec![CommitState::Success, CommitState::Success]);
    }

    #[tokio::test]
    async fn test_nothing_to_do_posts_no_status() {
        let handler = handler(Settings::default(), Arc::new(FakeOrchestrator::new()));
        let push = FakePush::new(push_event("o", "svc", "master", &["README.md"]));
        let outcome = handler.process(&push, Arc::new(MemoryDownloader::new())).await;
        assert!(outcome.skipped);
        assert!(push.statuses().is_empty());
        assert!(handler.log_events().events().is_empty());
    }

    #[tokio::test]
    async fn test_render_uncommitted_writes_nothing() {
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let settings = Settings {
            template_org: "o".to_string(),
            template_repo: "templates".to_string(),
            ..Settings::default()
        };
        let handler = handler(settings, orchestrator.clone());
        let modules = Arc::new(MemoryDownloader::new());
        let stage = r#"{"type": "wait", "name": "{{ var "name" }}"}"#;
        modules.insert("o", "templates", "wait.stage", "master", stage);

        let location = FileLocation {
            org: "o".to_string(),
            repo: "svc".to_string(),
            path: "dinghyfile".to_string(),
            branch: "master".to_string(),
        };
        let body = r#"{"application": "app", "pipelines": [
            {"name": "p", "stages": [{{ module "wait.stage" "name" "w" }}]}
        ]}"#;
        let done =
            handler.render_uncommitted(modules, &location, body, VarStack::new()).await.unwrap();

        assert_eq!(done.application, "app");
        assert_eq!(done.pipelines, vec!["p".to_string()]);
        assert!(done.rendered.replace(char::is_whitespace, "").contains(r#""name":"w""#));
        assert!(orchestrator.writes().is_empty());
        assert!(handler.graph().get_roots(&done.url).await.unwrap().is_empty());
    }

    #[test]
    fn test_reject_records_log_event() {
        let handler = handler(Settings::default(), Arc::new(FakeOrchestrator::new()));
        let event = push_event("o", "svc", "master", &["dinghyfile"]);
        let err = DinghyError::SignatureInvalid {
            provider: "github".to_string(),
            org: "o".to_string(),
            repo: "svc".to_string(),
        };
        handler.reject(&event, &err);

        let events = handler.log_events().events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, LogEventStatus::Error);
        assert_eq!(handler.metrics().webhooks_received(), 0);
    }
}
