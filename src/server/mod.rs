//! HTTP surface.
//!
//! ```text
//! /                        GET   health
//! /health, /healthcheck    GET   health
//! /v1/webhooks/{provider}  POST  github, gitlab, stash, bitbucket
//! /v1/updatePipeline       POST  manual render, nothing is persisted
//! /v1/logevents            GET   stored log events
//! /metrics                 GET   Prometheus text exposition
//! ```

mod handlers;
pub mod providers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use tokio::signal;

use crate::push::PushHandler;

pub use providers::{Hook, Providers};

/// Shared state of every route.
#[derive(Clone)]
pub struct AppState {
    handler: Arc<PushHandler>,
    providers: Arc<Providers>,
}

impl AppState {
    pub fn new(handler: Arc<PushHandler>, providers: Arc<Providers>) -> Self {
        Self {
            handler,
            providers,
        }
    }

    pub fn handler(&self) -> &Arc<PushHandler> {
        &self.handler
    }

    pub fn providers(&self) -> &Arc<Providers> {
        &self.providers
    }
}

/// Build the router for every route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::health))
        .route("/health", get(handlers::health))
        .route("/healthcheck", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest("/v1", api_router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/github", post(handlers::github))
        .route("/webhooks/gitlab", post(handlers::gitlab))
        .route("/webhooks/stash", post(handlers::stash))
        .route("/webhooks/bitbucket", post(handlers::bitbucket))
        .route("/updatePipeline", post(handlers::update_pipeline))
        .route("/logevents", get(handlers::log_events))
}

/// Serve until SIGINT or SIGTERM.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => tracing::error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
