//! Version-control collaborators.
//!
//! The push handler and renderer only see two capabilities:
//!
//! - [`Push`]: a decoded webhook event that can read and post commit
//!   statuses for its own commits
//! - [`Downloader`]: fetches file contents and maps `(org, repo, path,
//!   branch)` locations to and from the URL keys used by the dependency graph
//!
//! Provider adapters live in the submodules:
//!
//! - [`github`] - GitHub and GitHub Enterprise
//! - [`gitlab`] - GitLab push hooks
//! - [`stash`] - Stash / Bitbucket Server (`repo:refs_changed`, `pr:merged`)
//! - [`bitbucket`] - Bitbucket Cloud (`repo:push`, `pullrequest:fulfilled`)
//!
//! Shared pieces are [`status`] (commit status payloads), [`cache`] (a
//! per-webhook download cache) and [`UrlCodec`].

pub mod bitbucket;
pub mod cache;
pub mod github;
pub mod gitlab;
pub mod stash;
pub mod status;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::constants::{DEFAULT_BRANCHES, HTTP_REQUEST_TIMEOUT};
use crate::core::{DinghyError, DownloadErrorKind};
use crate::utils::retry::{send_with_retry, status_of};

pub use cache::CachingDownloader;
pub use status::CommitStatus;

/// State of a commit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitState {
    Pending,
    Success,
    Failure,
    Error,
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommitState::Pending => "pending",
            CommitState::Success => "success",
            CommitState::Failure => "failure",
            CommitState::Error => "error",
        };
        f.write_str(label)
    }
}

/// Provider-independent contents of a push webhook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    /// Provider tag: `github`, `gitlab`, `stash` or `bitbucket-cloud`
    pub provider: String,
    pub org: String,
    pub repo: String,
    /// Branch name without any `refs/heads/` prefix
    pub branch: String,
    /// Paths added or modified by the push, deduplicated, in payload order
    pub files: Vec<String>,
    /// Commit identifiers, oldest first; the last one receives statuses
    pub commits: Vec<String>,
    /// Login of the user who pushed, when the provider reports it
    pub pusher: Option<String>,
    /// The decoded webhook body
    pub raw: Value,
}

impl PushEvent {
    /// Append `path` unless it is already listed.
    pub fn add_file(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.files.contains(&path) {
            self.files.push(path);
        }
    }
}

/// A webhook event that can report commit statuses.
#[async_trait]
pub trait Push: Send + Sync {
    /// The decoded event.
    fn event(&self) -> &PushEvent;

    /// Provider tag.
    fn name(&self) -> &str {
        &self.event().provider
    }

    fn org(&self) -> &str {
        &self.event().org
    }

    fn repo(&self) -> &str {
        &self.event().repo
    }

    fn branch(&self) -> &str {
        &self.event().branch
    }

    fn files(&self) -> &[String] {
        &self.event().files
    }

    fn commits(&self) -> &[String] {
        &self.event().commits
    }

    fn raw(&self) -> &Value {
        &self.event().raw
    }

    fn contains_file(&self, path: &str) -> bool {
        self.event().files.iter().any(|f| f == path)
    }

    fn is_branch(&self, branch: &str) -> bool {
        self.event().branch == branch
    }

    /// Whether the push landed on a default branch (`master` or `main`).
    fn is_master(&self) -> bool {
        DEFAULT_BRANCHES.iter().any(|b| self.is_branch(b))
    }

    /// Post a status on the head commit.
    async fn set_commit_status(&self, state: CommitState, description: &str) -> anyhow::Result<()>;

    /// Current dinghy status of the head commit, if any was posted.
    async fn get_commit_status(&self) -> anyhow::Result<Option<CommitState>>;
}

/// Provider endpoint for posting and listing commit statuses.
#[async_trait]
pub trait StatusApi: Send + Sync {
    async fn post_status(
        &self,
        event: &PushEvent,
        sha: &str,
        status: &CommitStatus,
    ) -> anyhow::Result<()>;

    /// `(context, state)` pairs for `sha`, newest first.
    async fn list_statuses(
        &self,
        event: &PushEvent,
        sha: &str,
    ) -> anyhow::Result<Vec<(String, CommitState)>>;
}

/// A decoded push bound to the provider API that reports its statuses.
pub struct ProviderPush {
    event: PushEvent,
    api: Arc<dyn StatusApi>,
    deck_url: Option<String>,
}

impl ProviderPush {
    pub fn new(event: PushEvent, api: Arc<dyn StatusApi>, deck_url: Option<String>) -> Self {
        Self {
            event,
            api,
            deck_url,
        }
    }
}

#[async_trait]
impl Push for ProviderPush {
    fn event(&self) -> &PushEvent {
        &self.event
    }

    async fn set_commit_status(&self, state: CommitState, description: &str) -> anyhow::Result<()> {
        let Some(sha) = self.event.commits.last() else {
            tracing::debug!("push has no commits, skipping {} status", state);
            return Ok(());
        };
        let status = CommitStatus::new(state, description, self.deck_url.as_deref());
        self.api.post_status(&self.event, sha, &status).await
    }

    async fn get_commit_status(&self) -> anyhow::Result<Option<CommitState>> {
        let Some(sha) = self.event.commits.last() else {
            return Ok(None);
        };
        let statuses = self.api.list_statuses(&self.event, sha).await?;
        Ok(status::latest_dinghy_state(statuses.iter().map(|(c, s)| (c.as_str(), *s))))
    }
}

/// HTTP client used by the provider adapters.
pub(crate) fn http_client() -> Result<reqwest::Client, DinghyError> {
    reqwest::Client::builder()
        .timeout(HTTP_REQUEST_TIMEOUT)
        .user_agent(concat!("dinghy/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| DinghyError::Config(format!("failed to build HTTP client: {e}")))
}

/// Fetch a raw file, classifying failures for the push handler.
///
/// `key` is the encoded URL reported in errors. 404 is never retried.
pub(crate) async fn fetch_file<B>(
    retries: usize,
    key: &str,
    build: B,
) -> Result<String, DinghyError>
where
    B: Fn() -> RequestBuilder + Send + Sync,
{
    let not_found = |s: StatusCode| s == StatusCode::NOT_FOUND;
    let response = send_with_retry(retries, not_found, build).await.map_err(|e| {
        let kind = match status_of(&e) {
            Some(403 | 429) => DownloadErrorKind::RateLimited,
            _ => DownloadErrorKind::Transport,
        };
        DinghyError::download(kind, key, format!("{e:#}"))
    })?;
    if response.status() == StatusCode::NOT_FOUND {
        return Err(DinghyError::download(DownloadErrorKind::FileNotFound, key, "file not found"));
    }
    response
        .text()
        .await
        .map_err(|e| DinghyError::download(DownloadErrorKind::Transport, key, e.to_string()))
}

/// Turn a failed status response into an error.
pub(crate) async fn check_status(
    response: reqwest::Response,
    what: &str,
) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("{what} failed with HTTP {status}: {body}")
}

/// A file location inside a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileLocation {
    pub org: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
}

/// Fetches files and encodes their locations as graph keys.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the contents of `path` at `branch`.
    ///
    /// Missing files fail with [`DownloadErrorKind::FileNotFound`].
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError>;

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String;

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError>;
}

/// Encodes file locations as URLs whose query carries every component.
///
/// `https://github.example.com/org/repo/blob/main/dinghyfile` style paths
/// are kept for readability, but decoding only trusts the query so paths with
/// slashes and branches with slashes round-trip.
#[derive(Debug, Clone)]
pub struct UrlCodec {
    base: Url,
}

impl UrlCodec {
    /// Build a codec rooted at `base`, e.g. `https://api.github.com`.
    pub fn new(base: &str) -> Result<Self, DinghyError> {
        let base = Url::parse(base)
            .map_err(|e| DinghyError::Config(format!("invalid base URL {base}: {e}")))?;
        Ok(Self {
            base,
        })
    }

    pub fn encode(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend([org, repo, "blob", branch]);
            segments.extend(path.split('/').filter(|s| !s.is_empty()));
        }
        url.query_pairs_mut()
            .append_pair("org", org)
            .append_pair("repo", repo)
            .append_pair("path", path)
            .append_pair("branch", branch);
        url.to_string()
    }

    pub fn decode(&self, encoded: &str) -> Result<FileLocation, DinghyError> {
        let invalid = |message: String| {
            DinghyError::download(DownloadErrorKind::Transport, encoded, message)
        };
        let url = Url::parse(encoded).map_err(|e| invalid(format!("invalid file URL: {e}")))?;

        let mut location = FileLocation {
            org: String::new(),
            repo: String::new(),
            path: String::new(),
            branch: String::new(),
        };
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "org" => location.org = value.into_owned(),
                "repo" => location.repo = value.into_owned(),
                "path" => location.path = value.into_owned(),
                "branch" => location.branch = value.into_owned(),
                _ => {}
            }
        }
        if location.org.is_empty() || location.repo.is_empty() || location.path.is_empty() {
            return Err(invalid("file URL is missing org, repo or path".to_string()));
        }
        Ok(location)
    }
}

/// Base name of `path` (text after the last `/`).
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
