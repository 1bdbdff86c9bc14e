//! GitLab adapter: push hooks, raw file downloads and commit statuses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use super::{CommitState, CommitStatus, Downloader, FileLocation, PushEvent, StatusApi, UrlCodec};
use crate::config::ProviderSettings;
use crate::core::DinghyError;
use crate::utils::retry::send_with_retry;

pub const PROVIDER: &str = "gitlab";
const DEFAULT_ENDPOINT: &str = "https://gitlab.com";

#[derive(Debug, Deserialize)]
struct PushHook {
    #[serde(default)]
    object_kind: String,
    #[serde(rename = "ref")]
    git_ref: String,
    checkout_sha: Option<String>,
    user_username: Option<String>,
    project: Project,
    #[serde(default)]
    commits: Vec<Commit>,
}

#[derive(Debug, Deserialize)]
struct Project {
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct Commit {
    id: String,
    #[serde(default)]
    added: Vec<String>,
    #[serde(default)]
    modified: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    name: String,
    status: String,
}

/// Decode a push hook. Tag pushes and branch deletions yield `None`.
pub fn parse_push(raw: &Value) -> Result<Option<PushEvent>> {
    let hook: PushHook =
        serde_json::from_value(raw.clone()).context("Failed to decode GitLab push hook")?;
    if !hook.object_kind.is_empty() && hook.object_kind != "push" {
        return Ok(None);
    }
    let Some(branch) = hook.git_ref.strip_prefix("refs/heads/") else {
        return Ok(None);
    };
    // Deleting a branch sends a null checkout sha.
    if hook.checkout_sha.is_none() {
        return Ok(None);
    }

    // Nested groups: everything before the last segment is the namespace.
    let (org, repo) = match hook.project.path_with_namespace.rsplit_once('/') {
        Some((org, repo)) => (org.to_string(), repo.to_string()),
        None => (String::new(), hook.project.path_with_namespace.clone()),
    };
    let mut event = PushEvent {
        provider: PROVIDER.to_string(),
        org,
        repo,
        branch: branch.to_string(),
        pusher: hook.user_username,
        raw: raw.clone(),
        ..PushEvent::default()
    };
    for commit in hook.commits {
        for path in commit.added.into_iter().chain(commit.modified) {
            event.add_file(path);
        }
        event.commits.push(commit.id);
    }
    Ok(Some(event))
}

fn gitlab_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "running",
        CommitState::Success => "success",
        CommitState::Failure | CommitState::Error => "failed",
    }
}

fn parse_gitlab_state(state: &str) -> Option<CommitState> {
    match state {
        "pending" | "running" | "created" => Some(CommitState::Pending),
        "success" => Some(CommitState::Success),
        "failed" => Some(CommitState::Failure),
        "canceled" => Some(CommitState::Error),
        _ => None,
    }
}

/// Percent-encode a path segment the way the GitLab API expects (`/` included).
fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect::<String>().replace('+', "%20")
}

/// GitLab REST client (API v4).
pub struct GitlabClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    codec: UrlCodec,
    retries: usize,
}

impl GitlabClient {
    pub fn new(settings: &ProviderSettings, retries: usize) -> Result<Self, DinghyError> {
        let endpoint = settings.endpoint_or(DEFAULT_ENDPOINT).to_string();
        Ok(Self {
            http: super::http_client()?,
            codec: UrlCodec::new(&endpoint)?,
            endpoint,
            token: settings.token.clone(),
            retries,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let mut request = self.http.request(method, format!("{}/api/v4{}", self.endpoint, path));
        if !self.token.is_empty() {
            request = request.header("PRIVATE-TOKEN", &self.token);
        }
        request
    }

    fn project_path(org: &str, repo: &str) -> String {
        let full = if org.is_empty() {
            repo.to_string()
        } else {
            format!("{org}/{repo}")
        };
        format!("/projects/{}", encode_segment(&full))
    }
}

#[async_trait]
impl Downloader for GitlabClient {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.encode_url(org, repo, path, branch);
        let project = Self::project_path(org, repo);
        let api_path = format!("{}/repository/files/{}/raw", project, encode_segment(path));
        super::fetch_file(self.retries, &key, || {
            self.request(Method::GET, &api_path).query(&[("ref", branch)])
        })
        .await
    }

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        self.codec.encode(org, repo, path, branch)
    }

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError> {
        self.codec.decode(url)
    }
}

#[async_trait]
impl StatusApi for GitlabClient {
    async fn post_status(&self, event: &PushEvent, sha: &str, status: &CommitStatus) -> Result<()> {
        let path = format!("{}/statuses/{}", Self::project_path(&event.org, &event.repo), sha);
        let mut query = vec![
            ("state", gitlab_state(status.state).to_string()),
            ("name", status.context.clone()),
            ("description", status.description.clone()),
        ];
        if let Some(target) = &status.target_url {
            query.push(("target_url", target.clone()));
        }
        send_with_retry(self.retries, |_| false, || self.request(Method::POST, &path).query(&query))
            .await
            .with_context(|| format!("Failed to post {} status on {}", status.state, sha))?;
        Ok(())
    }

    async fn list_statuses(
        &self,
        event: &PushEvent,
        sha: &str,
    ) -> Result<Vec<(String, CommitState)>> {
        let project = Self::project_path(&event.org, &event.repo);
        let path = format!("{project}/repository/commits/{sha}/statuses");
        let entries: Vec<StatusEntry> =
            send_with_retry(self.retries, |_| false, || self.request(Method::GET, &path))
                .await?
                .json()
                .await
                .context("Failed to decode commit statuses")?;
        Ok(entries
            .into_iter()
            .filter_map(|e| parse_gitlab_state(&e.status).map(|state| (e.name, state)))
            .collect())
    }
}
