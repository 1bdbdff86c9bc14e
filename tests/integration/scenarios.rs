use serde_json::{Value, json};

use dinghy::graph::{DependencyManager, MemoryDependencyGraph};

use crate::common::{Harness, TEMPLATES, compact};

#[tokio::test]
async fn test_single_dinghyfile_with_two_modules() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app", "pipelines": [
            {"name": "deploy", "stages": [ {{ module "mod1" }}, {{ module "mod2" }} ]}
        ]}"#,
    );
    h.module("mod1", r#"{"foo":"bar","type":"{{ var "type" ?: "deploy" }}"}"#);
    h.module("mod2", r#"{"type":"{{ var "type" ?: "jenkins" }}"}"#);

    let (_, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    let rendered = compact(&outcome.processed[0].rendered);
    assert!(rendered.contains(r#""stages":[{"foo":"bar","type":"deploy"},{"type":"jenkins"}]"#));

    let pipeline = h.orchestrator.pipeline("app", "deploy").unwrap();
    assert_eq!(pipeline["stages"], json!([{"foo": "bar", "type": "deploy"}, {"type": "jenkins"}]));
    assert_eq!(
        h.graph.children(&h.url("svc", "dinghyfile")).await.unwrap(),
        vec![h.url(TEMPLATES, "mod1"), h.url(TEMPLATES, "mod2")]
    );
}

#[tokio::test]
async fn test_globals_flow_into_modules() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app", "globals": {"type": "foo"}, "pipelines": [
            {"name": "a", "stages": [ {{ module "mod1" }} ]},
            {"name": "b", "stages": [ {{ module "mod2" "type" "foobar" }} ]}
        ]}"#,
    );
    h.module("mod1", r#"{"type":"{{ var "type" }}"}"#);
    h.module("mod2", r#"{"type":"{{ var "type" }}"}"#);

    let (_, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    assert_eq!(h.orchestrator.pipeline("app", "a").unwrap()["stages"], json!([{"type": "foo"}]));
    assert_eq!(h.orchestrator.pipeline("app", "b").unwrap()["stages"], json!([{"type": "foobar"}]));
}

#[tokio::test]
async fn test_nested_default_and_deep_variables() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "dinernotifications", "pipelines": [{"name": "deploy", "stages": [
            {{ module "discovery" "application" "dinernotifications" }},
            {{ module "outer" "artifact" "art11" }}
        ]}]}"#,
    );
    h.module("discovery", r#"{"service": "{{ var "discovery-service-name" ?: "@application" }}"}"#);
    h.module("outer", r#"{{ module "inner" "artifact" "{{var artifact}}" }}"#);
    h.module("inner", r#"{"artifact": "{{ var "artifact" }}"}"#);

    let (_, outcome) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(outcome.is_success(), "{:?}", outcome.error);
    let pipeline = h.orchestrator.pipeline("dinernotifications", "deploy").unwrap();
    let stages: Value = pipeline["stages"].clone();
    assert_eq!(stages, json!([{"service": "dinernotifications"}, {"artifact": "art11"}]));
}

#[tokio::test]
async fn test_graph_replaces_children() {
    let graph = MemoryDependencyGraph::new();
    let deps = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    graph.set_deps("df", &deps(&["m1", "m2"])).await.unwrap();
    graph.set_deps("df", &deps(&["m2", "m3"])).await.unwrap();
    let before = graph.snapshot();
    graph.set_deps("df", &deps(&["m2", "m3"])).await.unwrap();
    assert_eq!(graph.snapshot(), before);

    assert_eq!(graph.upstream_urls("m2").await.unwrap(), (deps(&["df"]), deps(&["df"])));
    assert_eq!(graph.upstream_urls("m1").await.unwrap(), (Vec::new(), Vec::new()));
    assert!(!graph.children("df").await.unwrap().contains(&"m1".to_string()));
}

#[tokio::test]
async fn test_module_push_rebuilds_each_root_once() {
    let h = Harness::new();
    h.file(
        "svc",
        "dinghyfile",
        "master",
        r#"{"application": "app", "pipelines": [
            {"name": "deploy", "stages": [ {{ module "m1" }}, {{ module "m2" }} ]}
        ]}"#,
    );
    h.module("m1", r#"{{ module "m3" }}"#);
    h.module("m2", r#"{{ module "m3" }}"#);
    h.module("m3", r#"{"type": "wait"}"#);

    let (_, first) = h.push("svc", "master", &["dinghyfile"]).await;
    assert!(first.is_success(), "{:?}", first.error);
    assert_eq!(h.upserts(), 1);

    h.module("m3", r#"{"type": "manualJudgment"}"#);
    let (push, rebuild) = h.push(TEMPLATES, "master", &["m3"]).await;
    assert!(rebuild.is_success(), "{:?}", rebuild.error);
    assert_eq!(rebuild.processed.len(), 1);
    assert_eq!(rebuild.processed[0].application, "app");
    assert_eq!(h.upserts(), 2);
    assert_eq!(
        h.orchestrator.pipeline("app", "deploy").unwrap()["stages"],
        json!([{"type": "manualJudgment"}, {"type": "manualJudgment"}])
    );
    assert_eq!(push.states().last(), Some(&dinghy::vcs::CommitState::Success));
}
