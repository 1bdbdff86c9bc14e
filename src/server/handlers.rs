//! Route handlers.

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use super::AppState;
use super::providers::Hook;
use crate::push::validate_signature;
use crate::renderer::VarStack;
use crate::vcs::{FileLocation, ProviderPush};

fn accepted() -> Response {
    (StatusCode::OK, Json(json!({"status": "accepted"}))).into_response()
}

fn failure(status: u16, error: impl Into<String>) -> Response {
    let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (code, Json(json!({"status": status, "error": error.into()}))).into_response()
}

pub(super) async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub(super) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.handler().metrics().render(),
    )
}

pub(super) async fn log_events(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.handler().log_events().events())
}

pub(super) async fn github(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, Hook::Github, &headers, &body).await
}

pub(super) async fn gitlab(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, Hook::Gitlab, &headers, &body).await
}

pub(super) async fn stash(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, Hook::Stash, &headers, &body).await
}

pub(super) async fn bitbucket(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(&state, Hook::Bitbucket, &headers, &body).await
}

/// Decode, authenticate and process every push in a webhook.
///
/// Pushes are processed in payload order; the first failure decides the
/// response. A push with a bad signature is recorded and skipped.
async fn receive(state: &AppState, hook: Hook, headers: &HeaderMap, body: &[u8]) -> Response {
    let handler = state.handler();
    handler.metrics().webhook_received();

    let raw: Value = match serde_json::from_slice(body) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!("undecodable {:?} webhook: {}", hook, e);
            return failure(400, format!("invalid webhook body: {e}"));
        }
    };
    let decoded = match state.providers().decode(hook, headers, &raw).await {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return accepted(),
        Err(e) => {
            tracing::error!("failed to decode {:?} webhook: {:#}", hook, e);
            return failure(500, format!("{e:#}"));
        }
    };

    let settings = handler.settings();
    let signature = headers
        .get(settings.webhook_signature_header.as_str())
        .and_then(|v| v.to_str().ok());
    let mut first_failure: Option<(u16, String)> = None;
    for event in decoded.events {
        let verified = validate_signature(
            settings,
            &event.provider,
            &event.org,
            &event.repo,
            body,
            &raw,
            signature,
        );
        if let Err(e) = verified {
            handler.reject(&event, &e);
            continue;
        }
        let deck_url = settings.orchestrator.deck_url.clone();
        let push = ProviderPush::new(event, decoded.status.clone(), deck_url);
        let outcome = handler.process(&push, decoded.downloader.clone()).await;
        if let Some(error) = outcome.error {
            first_failure.get_or_insert((outcome.status, error));
        }
    }

    match first_failure {
        None => accepted(),
        Some((status, error)) => failure(status, error),
    }
}

/// Where a manually rendered dinghyfile pretends to live.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(super) struct RenderTarget {
    org: Option<String>,
    repo: Option<String>,
    path: Option<String>,
    branch: Option<String>,
}

pub(super) async fn update_pipeline(
    State(state): State<AppState>,
    Query(target): Query<RenderTarget>,
    body: String,
) -> Response {
    let handler = state.handler();
    let settings = handler.settings();
    let location = FileLocation {
        org: target.org.unwrap_or_else(|| settings.template_org.clone()),
        repo: target.repo.unwrap_or_else(|| settings.template_repo.clone()),
        path: target.path.unwrap_or_else(|| settings.dinghy_filename.clone()),
        branch: target.branch.unwrap_or_else(|| "master".to_string()),
    };

    let modules = state.providers().modules();
    match handler.render_uncommitted(modules, &location, body, VarStack::new()).await {
        Ok(done) => Json(json!({
            "application": done.application,
            "pipelines": done.pipelines,
            "rendered": done.rendered,
        }))
        .into_response(),
        Err(e) => {
            tracing::warn!("manual render failed: {}", e);
            failure(e.http_status(false), e.to_string())
        }
    }
}
