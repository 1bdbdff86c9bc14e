//! GitHub adapter: push decoding, contents downloader and commit statuses.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use super::status::parse_state;
use super::{CommitState, CommitStatus, Downloader, FileLocation, PushEvent, StatusApi, UrlCodec};
use crate::config::ProviderSettings;
use crate::core::DinghyError;
use crate::utils::retry::send_with_retry;

pub const PROVIDER: &str = "github";
const DEFAULT_ENDPOINT: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: Repository,
    #[serde(default)]
    commits: Vec<Commit>,
    pusher: Option<Pusher>,
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Deserialize)]
struct Repository {
    name: String,
    owner: Owner,
}

#[derive(Debug, Deserialize)]
struct Owner {
    login: Option<String>,
    name: Option<String>,
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
struct Pusher {
    name: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestPayload {
    action: String,
    number: u64,
    pull_request: PullRequest,
    sender: Option<Sender>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: PullRef,
    base: PullBase,
}

#[derive(Debug, Deserialize)]
struct PullRef {
    #[serde(rename = "ref")]
    git_ref: String,
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PullBase {
    repo: Repository,
}

#[derive(Debug, Deserialize)]
struct Sender {
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullFile {
    filename: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    context: String,
    state: String,
}

/// Decode a push event. Branch deletions and tag pushes yield `None`.
pub fn parse_push(raw: &Value) -> Result<Option<PushEvent>> {
    let payload: PushPayload =
        serde_json::from_value(raw.clone()).context("Failed to decode GitHub push payload")?;
    let Some(branch) = payload.git_ref.strip_prefix("refs/heads/") else {
        return Ok(None);
    };
    if payload.deleted {
        return Ok(None);
    }

    let org = payload.repository.owner.login.or(payload.repository.owner.name).unwrap_or_default();
    let mut event = PushEvent {
        provider: PROVIDER.to_string(),
        org,
        repo: payload.repository.name,
        branch: branch.to_string(),
        pusher: payload.pusher.map(|p| p.name),
        raw: raw.clone(),
        ..PushEvent::default()
    };
    for commit in payload.commits {
        for path in commit.added.into_iter().chain(commit.modified) {
            event.add_file(path);
        }
        event.commits.push(commit.id);
    }
    Ok(Some(event))
}

/// GitHub REST client.
pub struct GithubClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
    codec: UrlCodec,
    retries: usize,
}

impl GithubClient {
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
        let mut request = self
            .http
            .request(method, format!("{}{}", self.endpoint, path))
            .header(ACCEPT, "application/vnd.github.v3+json");
        if !self.token.is_empty() {
            request = request.header(AUTHORIZATION, format!("token {}", self.token));
        }
        request
    }

    /// Decode a webhook body: push events, or pull requests being opened or updated.
    ///
    /// Pull request files are not in the payload and are listed through the API.
    pub async fn decode_push(&self, raw: &Value) -> Result<Option<PushEvent>> {
        if raw.get("pull_request").is_none() {
            return parse_push(raw);
        }

        let payload: PullRequestPayload = serde_json::from_value(raw.clone())
            .context("Failed to decode GitHub pull request payload")?;
        if !matches!(payload.action.as_str(), "opened" | "synchronize" | "reopened") {
            return Ok(None);
        }
        let repo = payload.pull_request.base.repo;
        let org = repo.owner.login.or(repo.owner.name).unwrap_or_default();
        let path =
            format!("/repos/{}/{}/pulls/{}/files?per_page=100", org, repo.name, payload.number);
        let files: Vec<PullFile> =
            send_with_retry(self.retries, |_| false, || self.request(Method::GET, &path))
                .await?
                .json()
                .await
                .context("Failed to decode pull request files")?;

        let mut event = PushEvent {
            provider: PROVIDER.to_string(),
            org,
            repo: repo.name,
            branch: payload.pull_request.head.git_ref,
            commits: vec![payload.pull_request.head.sha],
            pusher: payload.sender.map(|s| s.login),
            raw: raw.clone(),
            ..PushEvent::default()
        };
        for file in files.into_iter().filter(|f| f.status != "removed") {
            event.add_file(file.filename);
        }
        Ok(Some(event))
    }
}

#[async_trait]
impl Downloader for GithubClient {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.encode_url(org, repo, path, branch);
        let api_path = format!("/repos/{org}/{repo}/contents/{path}");
        super::fetch_file(self.retries, &key, || {
            self.request(Method::GET, &api_path)
                .header(ACCEPT, "application/vnd.github.v3.raw")
                .query(&[("ref", branch)])
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
impl StatusApi for GithubClient {
    async fn post_status(&self, event: &PushEvent, sha: &str, status: &CommitStatus) -> Result<()> {
        let path = format!("/repos/{}/{}/statuses/{}", event.org, event.repo, sha);
        send_with_retry(self.retries, |_| false, || self.request(Method::POST, &path).json(status))
            .await
            .with_context(|| format!("Failed to post {} status on {}", status.state, sha))?;
        Ok(())
    }

    async fn list_statuses(
        &self,
        event: &PushEvent,
        sha: &str,
    ) -> Result<Vec<(String, CommitState)>> {
        let path = format!("/repos/{}/{}/commits/{}/statuses", event.org, event.repo, sha);
        let entries: Vec<StatusEntry> =
            send_with_retry(self.retries, |_| false, || self.request(Method::GET, &path))
                .await?
                .json()
                .await
                .context("Failed to decode commit statuses")?;
        Ok(entries
            .into_iter()
            .filter_map(|e| parse_state(&e.state).map(|state| (e.context, state)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::{ProviderPush, Push};
    use serde_json::json;
    use std::sync::Arc;

    fn push_body() -> Value {
        json!({
            "ref": "refs/heads/master",
            "repository": {"name": "svc", "owner": {"name": "armory", "login": "armory"}},
            "commits": [
                {"id": "abc", "added": ["dinghyfile"], "modified": []},
                {"id": "def", "added": [], "modified": ["dinghyfile", "README.md"]}
            ],
            "pusher": {"name": "octocat"}
        })
    }

    fn client(server: &mockito::Server) -> GithubClient {
        let settings = ProviderSettings {
            endpoint: server.url(),
            token: "secret".to_string(),
            ..ProviderSettings::default()
        };
        GithubClient::new(&settings, 0).unwrap()
    }

    #[test]
    fn test_parse_push() {
        let event = parse_push(&push_body()).unwrap().unwrap();
        assert_eq!(event.provider, "github");
        assert_eq!(event.org, "armory");
        assert_eq!(event.repo, "svc");
        assert_eq!(event.branch, "master");
        assert_eq!(event.files, vec!["dinghyfile".to_string(), "README.md".to_string()]);
        assert_eq!(event.commits, vec!["abc".to_string(), "def".to_string()]);
        assert_eq!(event.pusher.as_deref(), Some("octocat"));
    }

    #[test]
    fn test_tags_and_deletions_are_skipped() {
        let mut body = push_body();
        body["ref"] = json!("refs/tags/v1");
        assert!(parse_push(&body).unwrap().is_none());

        let mut body = push_body();
        body["deleted"] = json!(true);
        assert!(parse_push(&body).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_download_and_not_found() {
        let mut server = mockito::Server::new_async().await;
        let found = server
            .mock("GET", "/repos/armory/templates/contents/stages/wait")
            .match_query(mockito::Matcher::UrlEncoded("ref".into(), "master".into()))
            .match_header("authorization", "token secret")
            .with_body(r#"{"type": "wait"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/armory/templates/contents/missing")
            .match_query(mockito::Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let client = client(&server);
        let body = client.download("armory", "templates", "stages/wait", "master").await.unwrap();
        assert_eq!(body, r#"{"type": "wait"}"#);
        found.assert_async().await;

        let err = client.download("armory", "templates", "missing", "master").await.unwrap_err();
        assert!(err.is_file_not_found());
    }

    #[tokio::test]
    async fn test_statuses() {
        let mut server = mockito::Server::new_async().await;
        let posted = server
            .mock("POST", "/repos/armory/svc/statuses/def")
            .match_body(mockito::Matcher::PartialJson(
                json!({"state": "pending", "context": "dinghy"}),
            ))
            .with_status(201)
            .create_async()
            .await;
        server
            .mock("GET", "/repos/armory/svc/commits/def/statuses")
            .with_body(concat!(
                r#"[{"context": "ci", "state": "failure"}, "#,
                r#"{"context": "dinghy", "state": "success"}]"#,
            ))
            .create_async()
            .await;

        let client = Arc::new(client(&server));
        let event = parse_push(&push_body()).unwrap().unwrap();
        let push = ProviderPush::new(event, client, None);

        push.set_commit_status(CommitState::Pending, "Updating pipelines").await.unwrap();
        posted.assert_async().await;
        assert_eq!(push.get_commit_status().await.unwrap(), Some(CommitState::Success));
    }
}
