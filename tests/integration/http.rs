use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use dinghy::config::{ProviderSettings, Settings, WebhookValidation};
use dinghy::graph::MemoryDependencyGraph;
use dinghy::logevents::{LogEventStatus, LogEventStore};
use dinghy::metrics::Metrics;
use dinghy::notifier::Notifiers;
use dinghy::push::{PushHandler, sign};
use dinghy::server::{AppState, Providers, build_router};
use dinghy::test_utils::FakeOrchestrator;
use dinghy::test_utils::fixtures::github_push_body;

use crate::common::{ORG, settings};

fn app(settings: Settings, orchestrator: Arc<FakeOrchestrator>) -> (AppState, axum::Router) {
    let settings = Arc::new(settings);
    let providers = Providers::from_settings(&settings).unwrap();
    let handler = PushHandler::new(
        settings,
        Arc::new(MemoryDependencyGraph::new()),
        orchestrator,
        Notifiers::new(Vec::new(), Duration::from_secs(1)),
        Arc::new(LogEventStore::with_ttl_minutes(15)),
        Arc::new(Metrics::new()),
    )
    .unwrap();
    let state = AppState::new(Arc::new(handler), Arc::new(providers));
    (state.clone(), build_router(state))
}

fn github_settings(server: &mockito::Server) -> Settings {
    Settings {
        github: ProviderSettings {
            endpoint: server.url(),
            token: "token".to_string(),
            ..ProviderSettings::default()
        },
        ..settings()
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_github_push_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let contents = server
        .mock("GET", "/repos/armory/svc/contents/dinghyfile")
        .match_query(mockito::Matcher::UrlEncoded("ref".into(), "master".into()))
        .with_body(r#"{"application": "app", "pipelines": [{"name": "deploy", "stages": []}]}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/repos/armory/svc/commits/abc123/statuses")
        .with_body("[]")
        .create_async()
        .await;
    let statuses = server
        .mock("POST", "/repos/armory/svc/statuses/abc123")
        .with_status(201)
        .expect(2)
        .create_async()
        .await;

    let orchestrator = Arc::new(FakeOrchestrator::new());
    let (state, app) = app(github_settings(&server), orchestrator.clone());
    let body = github_push_body(ORG, "svc", "master", &["dinghyfile"], "abc123").to_string();
    let response = app
        .oneshot(
            Request::post("/v1/webhooks/github")
                .header("x-github-event", "push")
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "accepted"}));
    contents.assert_async().await;
    statuses.assert_async().await;
    assert!(orchestrator.pipeline("app", "deploy").is_some());

    let events = state.handler().log_events().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, LogEventStatus::Success);
}

#[tokio::test]
async fn test_github_malformed_dinghyfile_is_422() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/repos/armory/svc/contents/dinghyfile")
        .match_query(mockito::Matcher::Any)
        .with_body(r#"{"application": "#)
        .create_async()
        .await;
    server
        .mock("GET", "/repos/armory/svc/commits/abc123/statuses")
        .with_body("[]")
        .create_async()
        .await;
    let failure = server
        .mock("POST", "/repos/armory/svc/statuses/abc123")
        .match_body(mockito::Matcher::PartialJson(json!({"state": "failure"})))
        .with_status(201)
        .create_async()
        .await;
    server
        .mock("POST", "/repos/armory/svc/statuses/abc123")
        .match_body(mockito::Matcher::PartialJson(json!({"state": "pending"})))
        .with_status(201)
        .create_async()
        .await;

    let (_, app) = app(github_settings(&server), Arc::new(FakeOrchestrator::new()));
    let body = github_push_body(ORG, "svc", "master", &["dinghyfile"], "abc123").to_string();
    let response = app
        .oneshot(Request::post("/v1/webhooks/github").body(Body::from(body)).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json = json_body(response).await;
    assert_eq!(json["status"], 422);
    assert!(json["error"].as_str().unwrap().contains("malformed"));
    failure.assert_async().await;
}

#[tokio::test]
async fn test_signed_webhook_is_processed() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/repos/armory/svc/contents/dinghyfile")
        .match_query(mockito::Matcher::Any)
        .with_body(r#"{"application": "app", "pipelines": []}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/repos/armory/svc/commits/abc123/statuses")
        .with_body("[]")
        .create_async()
        .await;
    server
        .mock("POST", "/repos/armory/svc/statuses/abc123")
        .with_status(201)
        .expect(2)
        .create_async()
        .await;

    let settings = Settings {
        webhook_validation_enabled_providers: vec!["github".to_string()],
        webhook_validations: vec![WebhookValidation {
            enabled: true,
            provider: "github".to_string(),
            org: ORG.to_string(),
            repo: "default-webhook-secret".to_string(),
            secret: "org-secret".to_string(),
        }],
        ..github_settings(&server)
    };
    let orchestrator = Arc::new(FakeOrchestrator::new());
    let (state, app) = app(settings, orchestrator.clone());
    let body = github_push_body(ORG, "svc", "master", &["dinghyfile"], "abc123").to_string();
    let response = app
        .oneshot(
            Request::post("/v1/webhooks/github")
                .header("X-Hub-Signature", sign("org-secret", body.as_bytes()))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(orchestrator.application("app").is_some());
    assert_eq!(state.handler().metrics().webhooks_received(), 1);
}

#[tokio::test]
async fn test_unhandled_events_are_accepted() {
    let (state, app) = app(settings(), Arc::new(FakeOrchestrator::new()));

    let response = app
        .clone()
        .oneshot(
            Request::post("/v1/webhooks/bitbucket")
                .header("x-event-key", "repo:fork")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let tag = json!({
        "ref": "refs/tags/v1.0.0",
        "repository": {"name": "svc", "owner": {"login": ORG}}
    });
    let response = app
        .oneshot(
            Request::post("/v1/webhooks/github")
                .header("x-github-event", "push")
                .body(Body::from(tag.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"status": "accepted"}));
    assert!(state.handler().log_events().events().is_empty());
}
