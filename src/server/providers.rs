//! Provider clients and webhook decoding.

use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderMap;
use serde_json::Value;

use crate::config::Settings;
use crate::constants::DEFAULT_HTTP_RETRIES;
use crate::core::DinghyError;
use crate::vcs::bitbucket::BitbucketClient;
use crate::vcs::github::GithubClient;
use crate::vcs::gitlab::GitlabClient;
use crate::vcs::stash::StashClient;
use crate::vcs::{Downloader, PushEvent, StatusApi};

/// The webhook routes, one per payload dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Github,
    Gitlab,
    Stash,
    Bitbucket,
}

/// Pushes decoded from one webhook, with the client that serves them.
pub struct Decoded {
    pub events: Vec<PushEvent>,
    pub status: Arc<dyn StatusApi>,
    pub downloader: Arc<dyn Downloader>,
}

/// One REST client per configured provider.
pub struct Providers {
    github: Arc<GithubClient>,
    gitlab: Arc<GitlabClient>,
    bitbucket: Arc<BitbucketClient>,
    /// Bitbucket Server has no public default endpoint.
    stash: Option<Arc<StashClient>>,
}

impl Providers {
    pub fn from_settings(settings: &Settings) -> Result<Self, DinghyError> {
        let stash = if settings.stash.endpoint.is_empty() {
            None
        } else {
            Some(Arc::new(StashClient::new(&settings.stash, DEFAULT_HTTP_RETRIES)?))
        };
        Ok(Self {
            github: Arc::new(GithubClient::new(&settings.github, DEFAULT_HTTP_RETRIES)?),
            gitlab: Arc::new(GitlabClient::new(&settings.gitlab, DEFAULT_HTTP_RETRIES)?),
            bitbucket: Arc::new(BitbucketClient::new(&settings.bitbucket, DEFAULT_HTTP_RETRIES)?),
            stash,
        })
    }

    /// Downloader for manual renders, whose modules live on GitHub.
    pub fn modules(&self) -> Arc<dyn Downloader> {
        self.github.clone()
    }

    /// Decode a webhook body. `Ok(None)` means the event is not one dinghy acts on.
    pub async fn decode(
        &self,
        hook: Hook,
        headers: &HeaderMap,
        raw: &Value,
    ) -> anyhow::Result<Option<Decoded>> {
        match hook {
            Hook::Github => {
                let event = header(headers, "x-github-event");
                if !matches!(event, None | Some("push" | "pull_request")) {
                    tracing::debug!("ignoring GitHub {:?} event", event);
                    return Ok(None);
                }
                let events = self.github.decode_push(raw).await?.into_iter().collect();
                Ok(Some(self.github_decoded(events)))
            }
            Hook::Gitlab => {
                let events = crate::vcs::gitlab::parse_push(raw)?.into_iter().collect();
                Ok(Some(Decoded {
                    events,
                    status: self.gitlab.clone(),
                    downloader: self.gitlab.clone(),
                }))
            }
            Hook::Stash => {
                let stash = self.stash()?;
                let key = raw.get("eventKey").and_then(Value::as_str);
                let events = stash.decode_pushes(key, raw).await?;
                Ok(Some(Decoded {
                    events,
                    status: stash.clone(),
                    downloader: stash,
                }))
            }
            Hook::Bitbucket => {
                let Some(key) = bitbucket_event(headers, raw) else {
                    tracing::debug!("Bitbucket webhook without an event type, ignoring");
                    return Ok(None);
                };
                match key.as_str() {
                    "repo:push" | "pullrequest:fulfilled" => {
                        let events = self.bitbucket.decode_pushes(&key, raw).await?;
                        Ok(Some(Decoded {
                            events,
                            status: self.bitbucket.clone(),
                            downloader: self.bitbucket.clone(),
                        }))
                    }
                    "repo:refs_changed" | "pr:merged" => {
                        let stash = self.stash()?;
                        let events = stash.decode_pushes(Some(&key), raw).await?;
                        Ok(Some(Decoded {
                            events,
                            status: stash.clone(),
                            downloader: stash,
                        }))
                    }
                    other => {
                        tracing::debug!("ignoring Bitbucket {} event", other);
                        Ok(None)
                    }
                }
            }
        }
    }

    fn github_decoded(&self, events: Vec<PushEvent>) -> Decoded {
        Decoded {
            events,
            status: self.github.clone(),
            downloader: self.github.clone(),
        }
    }

    fn stash(&self) -> anyhow::Result<Arc<StashClient>> {
        self.stash
            .clone()
            .context("received a Bitbucket Server webhook but stash.endpoint is not configured")
    }
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Event type of a Bitbucket webhook: the body's `event_type` or `eventKey`,
/// else the `X-Event-Key` header.
pub fn bitbucket_event(headers: &HeaderMap, raw: &Value) -> Option<String> {
    raw.get("event_type")
        .or_else(|| raw.get("eventKey"))
        .and_then(Value::as_str)
        .or_else(|| header(headers, "x-event-key"))
        .map(str::to_string)
}
