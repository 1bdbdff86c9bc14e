//! HTTP requests with exponential backoff.
//!
//! Orchestrator and VCS calls retry on transport errors and on any 4xx/5xx
//! response until the retry budget is spent. Callers can mark specific
//! statuses as final (a download answering 404 will not start existing on
//! the third try).

use std::time::Duration;

use anyhow::Result;
use reqwest::{RequestBuilder, Response, StatusCode};
use thiserror::Error;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;

use crate::constants::{MAX_BACKOFF_DELAY_MS, STARTING_BACKOFF_DELAY_MS};

/// A response whose status was neither accepted nor retried into success.
#[derive(Debug, Error)]
#[error("{url} returned HTTP {status}: {body}")]
pub struct HttpStatusError {
    pub url: String,
    pub status: u16,
    pub body: String,
}

/// Delays between attempts: 100ms, 1s, then capped at 5s.
pub fn backoff(retries: usize) -> impl Iterator<Item = Duration> {
    ExponentialBackoff::from_millis(10)
        .factor(STARTING_BACKOFF_DELAY_MS / 10)
        .max_delay(Duration::from_millis(MAX_BACKOFF_DELAY_MS))
        .take(retries)
}

/// Send the request produced by `build`, retrying up to `retries` times.
///
/// 2xx and 3xx responses are returned, as is any status for which `accept`
/// returns true. Everything else is retried; once the budget is exhausted the
/// last failure is returned, an [`HttpStatusError`] for HTTP failures.
pub async fn send_with_retry<B, A>(retries: usize, accept: A, build: B) -> Result<Response>
where
    B: Fn() -> RequestBuilder,
    A: Fn(StatusCode) -> bool,
{
    Retry::start(backoff(retries), || {
        let request = build();
        let accept = &accept;
        async move {
            let response = request.send().await?;
            let status = response.status();
            if status.is_success() || status.is_redirection() || accept(status) {
                return Ok(response);
            }

            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(target: "http::retry", "HTTP {} from {}, will retry", status, url);
            Err(anyhow::Error::new(HttpStatusError {
                url,
                status: status.as_u16(),
                body,
            }))
        }
    })
    .await
}

/// Status code of `err` if it is an HTTP failure.
pub fn status_of(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<HttpStatusError>().map(|e| e.status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let delays: Vec<Duration> = backoff(5).collect();
        assert_eq!(delays.len(), 5);
        assert_eq!(delays[0], Duration::from_millis(100));
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(MAX_BACKOFF_DELAY_MS)));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut server = mockito::Server::new_async().await;
        let failing = server.mock("GET", "/flaky").with_status(502).expect(1).create_async().await;
        let client = reqwest::Client::new();
        let url = format!("{}/flaky", server.url());

        let err = send_with_retry(0, |_| false, || client.get(&url)).await.unwrap_err();
        assert_eq!(status_of(&err), Some(502));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_accepted_status_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let missing =
            server.mock("GET", "/missing").with_status(404).expect(1).create_async().await;
        let client = reqwest::Client::new();
        let url = format!("{}/missing", server.url());

        let response =
            send_with_retry(3, |s| s == StatusCode::NOT_FOUND, || client.get(&url)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        missing.assert_async().await;
    }
}
