//! Shared harness for integration tests.
//!
//! [`Harness`] wires a [`PushHandler`] to in-memory collaborators: files live
//! in a [`MemoryDownloader`], pipelines in a [`FakeOrchestrator`] and
//! notifications in a [`RecordingNotifier`].

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dinghy::config::Settings;
use dinghy::graph::MemoryDependencyGraph;
use dinghy::logevents::LogEventStore;
use dinghy::metrics::Metrics;
use dinghy::notifier::Notifiers;
use dinghy::push::{PushHandler, PushOutcome};
use dinghy::test_utils::fixtures::push_event;
use dinghy::test_utils::{
    FakeOrchestrator, FakePush, MemoryDownloader, RecordingNotifier, init_test_logging,
};
use dinghy::vcs::Downloader;

pub const ORG: &str = "armory";
pub const TEMPLATES: &str = "templates";

pub struct Harness {
    pub downloader: Arc<MemoryDownloader>,
    pub graph: Arc<MemoryDependencyGraph>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub notifier: Arc<RecordingNotifier>,
    pub handler: PushHandler,
}

/// Settings with the template repository at `armory/templates`.
pub fn settings() -> Settings {
    Settings {
        template_org: ORG.to_string(),
        template_repo: TEMPLATES.to_string(),
        ..Settings::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: Settings) -> Self {
        init_test_logging(None);
        let downloader = Arc::new(MemoryDownloader::new());
        let graph = Arc::new(MemoryDependencyGraph::new());
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let handler = PushHandler::new(
            Arc::new(settings),
            graph.clone(),
            orchestrator.clone(),
            Notifiers::new(vec![notifier.clone()], Duration::from_secs(5)),
            Arc::new(LogEventStore::with_ttl_minutes(15)),
            Arc::new(Metrics::new()),
        )
        .expect("valid settings");
        Self {
            downloader,
            graph,
            orchestrator,
            notifier,
            handler,
        }
    }

    /// Add a module to the template repository on `master`.
    pub fn module(&self, name: &str, body: &str) {
        self.downloader.insert(ORG, TEMPLATES, name, "master", body);
    }

    /// Add a file to `repo` on `branch`.
    pub fn file(&self, repo: &str, path: &str, branch: &str, body: &str) {
        self.downloader.insert(ORG, repo, path, branch, body);
    }

    pub fn url(&self, repo: &str, path: &str) -> String {
        self.downloader.encode_url(ORG, repo, path, "master")
    }

    /// Deliver a push touching `files` and return it with the outcome.
    pub async fn push(&self, repo: &str, branch: &str, files: &[&str]) -> (FakePush, PushOutcome) {
        let push = FakePush::new(push_event(ORG, repo, branch, files));
        let outcome = self.handler.process(&push, self.downloader.clone()).await;
        (push, outcome)
    }

    pub fn upserts(&self) -> usize {
        self.orchestrator.writes().iter().filter(|w| w.starts_with("upsert")).count()
    }
}

/// Remove whitespace so rendered JSON compares structurally.
pub fn compact(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}
