use dinghy::config::{RepoConfig, Settings};
use dinghy::renderer::Action;
use dinghy::vcs::CommitState;

use crate::common::{Harness, TEMPLATES, settings};

const DINGHYFILE: &str = r#"{"application": "app",
    "pipelines": [{"name": "deploy", "stages": [ {{ module "wait" }} ]}]}"#;

#[tokio::test]
async fn test_feature_branch_is_validated_without_writes() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "feature", DINGHYFILE);
    h.module("wait", r#"{"type": "wait"}"#);

    let (push, outcome) = h.push("svc", "feature", &["dinghyfile"]).await;
    assert_eq!(outcome.action, Action::Validate);
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(outcome.processed.len(), 1);

    assert!(h.orchestrator.writes().is_empty());
    assert!(h.graph.is_empty());
    assert_eq!(push.states(), vec![CommitState::Pending, CommitState::Success]);
    assert_eq!(push.statuses()[0].1, "Validating dinghyfile");
}

#[tokio::test]
async fn test_validation_still_reports_malformed_documents() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "feature", r#"{"application": "app", "pipelines": {"#);

    let (push, outcome) = h.push("svc", "feature", &["dinghyfile"]).await;
    assert_eq!(outcome.status, 422);
    assert_eq!(push.states().last(), Some(&CommitState::Failure));
    assert!(h.orchestrator.writes().is_empty());
}

#[tokio::test]
async fn test_repo_config_moves_the_processing_branch() {
    let h = Harness::with_settings(Settings {
        repo_config: vec![RepoConfig {
            provider: "github".to_string(),
            repo: "svc".to_string(),
            branch: "release".to_string(),
        }],
        ..settings()
    });
    h.module("wait", r#"{"type": "wait"}"#);
    h.file("svc", "dinghyfile", "master", DINGHYFILE);
    h.file("svc", "dinghyfile", "release", DINGHYFILE);

    let (_, on_master) = h.push("svc", "master", &["dinghyfile"]).await;
    assert_eq!(on_master.action, Action::Validate);
    assert!(h.orchestrator.writes().is_empty());

    let (_, on_release) = h.push("svc", "release", &["dinghyfile"]).await;
    assert_eq!(on_release.action, Action::Process);
    assert!(h.orchestrator.pipeline("app", "deploy").is_some());
}

#[tokio::test]
async fn test_module_branch_validation_leaves_graph_alone() {
    let h = Harness::new();
    h.file("svc", "dinghyfile", "master", DINGHYFILE);
    h.module("wait", r#"{"type": "wait"}"#);
    let (_, first) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(first.is_success(), "{:?}", first.error);
    let graph_before = h.graph.snapshot();
    let writes_before = h.orchestrator.writes();

    h.file(TEMPLATES, "wait", "feature", r#"{"type": "manualJudgment"}"#);
    let (_, outcome) = h.push(TEMPLATES, "feature", &["wait"]).await;
    assert_eq!(outcome.action, Action::Validate);
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(h.graph.snapshot(), graph_before);
    assert_eq!(h.orchestrator.writes(), writes_before);
}
