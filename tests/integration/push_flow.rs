use dinghy::config::Settings;
use dinghy::logevents::LogEventStatus;
use dinghy::metrics::Outcome;
use dinghy::vcs::CommitState;

use crate::common::{Harness, TEMPLATES, settings};

const DINGHYFILE: &str =
    r#"{"application": "app", "pipelines": [{"name": "deploy", "stages": []}]}"#;

#[tokio::test]
async fn test_success_goes_pending_then_success() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "master", DINGHYFILE);

    let (push, outcome) = h.push("svc", "master", &["dinghyfile", "src/main.rs"]).await;
    assert_eq!(outcome.status, 200);
    assert!(outcome.is_success());
    assert_eq!(push.states(), vec![CommitState::Pending, CommitState::Success]);

    let events = h.handler.log_events().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, LogEventStatus::Success);
    assert!(events[0].rendered_dinghyfile.contains("deploy"));

    let successes = h.notifier.successes();
    assert_eq!(successes.len(), 1);
    assert_eq!(successes[0].path, "dinghyfile");
    assert!(h.notifier.failures().is_empty());
    assert_eq!(h.handler.metrics().outcome(Outcome::Success), 1);
}

#[tokio::test]
async fn test_nested_dinghyfiles_are_all_processed() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "master", DINGHYFILE);
    h.file(
        "svc",
        "apps/worker/dinghyfile",
        "master",
        r#"{"application": "worker", "pipelines": [{"name": "deploy", "stages": []}]}"#,
    );

    let (_, outcome) = h.push("svc", "master", &["dinghyfile", "apps/worker/dinghyfile"]).await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    let apps: Vec<&str> = outcome.processed.iter().map(|p| p.application.as_str()).collect();
    assert_eq!(apps, vec!["app", "worker"]);
    assert_eq!(h.notifier.successes().len(), 2);
}

#[tokio::test]
async fn test_malformed_document_is_failure_422() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "master", r#"{"application": "app", "pipelines": ["#);

    let (push, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert_eq!(outcome.status, 422);
    assert_eq!(push.states(), vec![CommitState::Pending, CommitState::Failure]);
    assert!(h.orchestrator.writes().is_empty());

    let events = h.handler.log_events().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, LogEventStatus::Error);

    let failures = h.notifier.failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error.is_some());
    assert_eq!(h.handler.metrics().outcome(Outcome::Failure), 1);
}

#[tokio::test]
async fn test_missing_module_is_error_500() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app",
            "pipelines": [{"name": "deploy", "stages": [ {{ module "missing" }} ]}]}"#,
    );

    let (push, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert_eq!(outcome.status, 500);
    assert_eq!(push.states(), vec![CommitState::Pending, CommitState::Error]);
    assert!(outcome.error.unwrap().contains("missing"));
}

#[tokio::test]
async fn test_orchestrator_failure_is_error_500() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "master", DINGHYFILE);
    h.orchestrator.fail_upserts("front50 is down");

    let (push, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert_eq!(outcome.status, 500);
    assert_eq!(push.states().last(), Some(&CommitState::Error));
    assert_eq!(h.handler.metrics().outcome(Outcome::Error), 1);
}

#[tokio::test]
async fn test_missing_root_during_rebuild_is_404() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app",
            "pipelines": [{"name": "deploy", "stages": [ {{ module "wait" }} ]}]}"#,
    );
    h.module("wait", r#"{"type": "wait"}"#);
    let (_, first) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(first.is_success(), "{:?}", first.error);

    h.downloader.remove(crate::common::ORG, "svc", "dinghyfile", "master");
    let (push, outcome) = h.push(TEMPLATES, "master", &["wait"]).await;
    assert_eq!(outcome.status, 404);
    assert_eq!(push.states().last(), Some(&CommitState::Error));
}

#[tokio::test]
async fn test_broken_module_fails_before_rebuild() {
    let h = Harness::new();
    h.module("wait", r#"{"type": "{{ var "type" "#);

    let (push, outcome) = h.push(TEMPLATES, "master", &["wait"]).await;
    assert_eq!(outcome.status, 500);
    assert_eq!(push.states().last(), Some(&CommitState::Error));
    assert!(h.orchestrator.writes().is_empty());
}

#[tokio::test]
async fn test_ignored_push_changes_nothing() {
    let h = Harness::with_settings(Settings {
        ignore_patterns: vec!["\\.md$".to_string(), "^docs/".to_string()],
        ..settings()
    });
    h.file("svc", "dinghyfile", "master", DINGHYFILE);

    let (push, outcome) = h.push("svc", "master", &["README.md", "docs/dinghyfile"]).await;
    assert!(outcome.skipped);
    assert_eq!(push.states(), vec![CommitState::Success]);
    assert!(h.orchestrator.writes().is_empty());
    assert!(h.notifier.successes().is_empty());
    assert!(h.notifier.failures().is_empty());
    assert_eq!(h.handler.metrics().outcome(Outcome::Skipped), 1);
}

#[tokio::test]
async fn test_stale_pipelines_deleted_on_request() {
    let h = Harness::new();
    h.orchestrator.add_application("app");
    h.orchestrator.add_pipeline("app", "old", "id-old");
    h.orchestrator.add_pipeline("app", "deploy", "id-deploy");
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app", "deleteStalePipelines": true,
            "pipelines": [{"name": "deploy", "stages": []}]}"#,
    );

    let (_, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert!(h.orchestrator.pipeline("app", "old").is_none());
    assert_eq!(h.orchestrator.pipeline("app", "deploy").unwrap()["id"], "id-deploy");
}
