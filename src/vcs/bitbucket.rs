//! Bitbucket Cloud adapter (`repo:push`, `pullrequest:fulfilled`).

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use super::{CommitState, CommitStatus, Downloader, FileLocation, PushEvent, StatusApi, UrlCodec};
use crate::config::ProviderSettings;
use crate::core::DinghyError;
use crate::utils::retry::send_with_retry;

pub const PROVIDER: &str = "bitbucket-cloud";
const DEFAULT_ENDPOINT: &str = "https://api.bitbucket.org";

/// A branch update: destination branch plus the commit range to diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudChange {
    pub org: String,
    pub repo: String,
    pub branch: String,
    /// Commit that receives statuses.
    pub head: String,
    /// Previous tip, when known; files are diffed against it.
    pub base: Option<String>,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PushPayload {
    repository: Repository,
    push: Push,
    actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct Push {
    #[serde(default)]
    changes: Vec<Change>,
}

#[derive(Debug, Deserialize)]
struct Change {
    new: Option<RefState>,
    old: Option<RefState>,
}

#[derive(Debug, Deserialize)]
struct RefState {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    target: Target,
}

#[derive(Debug, Deserialize)]
struct Target {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct Actor {
    nickname: Option<String>,
    display_name: Option<String>,
}

impl Actor {
    fn login(self) -> Option<String> {
        self.nickname.or(self.display_name)
    }
}

#[derive(Debug, Deserialize)]
struct Fulfilled {
    repository: Repository,
    pullrequest: PullRequest,
    actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    destination: Endpoint,
    merge_commit: Option<Target>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    branch: Branch,
    commit: Target,
}

#[derive(Debug, Deserialize)]
struct Branch {
    name: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiffStat {
    status: String,
    new: Option<DiffPath>,
}

#[derive(Debug, Deserialize)]
struct DiffPath {
    path: String,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    key: String,
    state: String,
}

fn split_full_name(full_name: &str) -> Result<(String, String)> {
    match full_name.split_once('/') {
        Some((org, repo)) => Ok((org.to_string(), repo.to_string())),
        None => bail!("repository full_name {full_name:?} is not owner/repo"),
    }
}

/// Extract branch updates from a Bitbucket Cloud webhook.
pub fn parse_changes(event_type: &str, raw: &Value) -> Result<Vec<CloudChange>> {
    match event_type {
        "repo:push" => {
            let payload: PushPayload =
                serde_json::from_value(raw.clone()).context("Failed to decode repo:push payload")?;
            let (org, repo) = split_full_name(&payload.repository.full_name)?;
            let actor = payload.actor.and_then(Actor::login);
            Ok(payload
                .push
                .changes
                .into_iter()
                .filter_map(|change| {
                    let new = change.new?;
                    if new.kind != "branch" {
                        return None;
                    }
                    Some(CloudChange {
                        org: org.clone(),
                        repo: repo.clone(),
                        branch: new.name,
                        head: new.target.hash,
                        base: change.old.map(|old| old.target.hash),
                        actor: actor.clone(),
                    })
                })
                .collect())
        }
        "pullrequest:fulfilled" => {
            let payload: Fulfilled = serde_json::from_value(raw.clone())
                .context("Failed to decode pullrequest:fulfilled payload")?;
            let (org, repo) = split_full_name(&payload.repository.full_name)?;
            let pr = payload.pullrequest;
            let head = pr.merge_commit.map_or(pr.destination.commit.hash, |c| c.hash);
            Ok(vec![CloudChange {
                org,
                repo,
                branch: pr.destination.branch.name,
                head,
                base: None,
                actor: payload.actor.and_then(Actor::login),
            }])
        }
        other => bail!("unsupported Bitbucket Cloud event {other}"),
    }
}

fn cloud_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "INPROGRESS",
        CommitState::Success => "SUCCESSFUL",
        CommitState::Failure => "FAILED",
        CommitState::Error => "STOPPED",
    }
}

fn parse_cloud_state(state: &str) -> Option<CommitState> {
    match state {
        "INPROGRESS" => Some(CommitState::Pending),
        "SUCCESSFUL" => Some(CommitState::Success),
        "FAILED" => Some(CommitState::Failure),
        "STOPPED" => Some(CommitState::Error),
        _ => None,
    }
}

/// Bitbucket Cloud REST client (API 2.0).
pub struct BitbucketClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    token: String,
    codec: UrlCodec,
    retries: usize,
}

impl BitbucketClient {
    pub fn new(settings: &ProviderSettings, retries: usize) -> Result<Self, DinghyError> {
        let endpoint = settings.endpoint_or(DEFAULT_ENDPOINT).to_string();
        Ok(Self {
            http: super::http_client()?,
            codec: UrlCodec::new(&endpoint)?,
            endpoint,
            username: settings.username.clone(),
            token: settings.token.clone(),
            retries,
        })
    }

    fn request_url(&self, method: Method, url: &str) -> RequestBuilder {
        let request = self.http.request(method, url);
        if self.username.is_empty() {
            request.bearer_auth(&self.token)
        } else {
            request.basic_auth(&self.username, Some(&self.token))
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.request_url(method, &format!("{}/2.0{}", self.endpoint, path))
    }

    async fn changed_files(&self, change: &CloudChange) -> Result<Vec<String>> {
        let spec = match &change.base {
            Some(base) => format!("{}..{}", change.head, base),
            None => change.head.clone(),
        };
        let (org, repo) = (&change.org, &change.repo);
        let mut url = format!("{}/2.0/repositories/{org}/{repo}/diffstat/{spec}", self.endpoint);
        let mut files = Vec::new();
        loop {
            let page: Page<DiffStat> =
                send_with_retry(self.retries, |_| false, || self.request_url(Method::GET, &url))
                    .await?
                    .json()
                    .await
                    .context("Failed to decode diffstat")?;
            files.extend(
                page.values
                    .into_iter()
                    .filter(|d| d.status != "removed")
                    .filter_map(|d| d.new.map(|n| n.path)),
            );
            match page.next {
                Some(next) => url = next,
                None => break,
            }
        }
        Ok(files)
    }

    /// Decode a webhook into one push per updated branch.
    pub async fn decode_pushes(&self, event_type: &str, raw: &Value) -> Result<Vec<PushEvent>> {
        let mut events = Vec::new();
        for change in parse_changes(event_type, raw)? {
            let mut event = PushEvent {
                provider: PROVIDER.to_string(),
                org: change.org.clone(),
                repo: change.repo.clone(),
                branch: change.branch.clone(),
                commits: vec![change.head.clone()],
                pusher: change.actor.clone(),
                raw: raw.clone(),
                ..PushEvent::default()
            };
            for file in self.changed_files(&change).await? {
                event.add_file(file);
            }
            events.push(event);
        }
        Ok(events)
    }
}

#[async_trait]
impl Downloader for BitbucketClient {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.encode_url(org, repo, path, branch);
        let api_path = format!("/repositories/{org}/{repo}/src/{branch}/{path}");
        super::fetch_file(self.retries, &key, || self.request(Method::GET, &api_path)).await
    }

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        self.codec.encode(org, repo, path, branch)
    }

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError> {
        self.codec.decode(url)
    }
}

#[async_trait]
impl StatusApi for BitbucketClient {
    async fn post_status(&self, event: &PushEvent, sha: &str, status: &CommitStatus) -> Result<()> {
        let path =
            format!("/repositories/{}/{}/commit/{}/statuses/build", event.org, event.repo, sha);
        let body = serde_json::json!({
            "state": cloud_state(status.state),
            "key": status.context,
            "name": status.context,
            "url": status.target_url.clone().unwrap_or_else(|| "https://bitbucket.org".to_string()),
            "description": status.description,
        });
        send_with_retry(self.retries, |_| false, || self.request(Method::POST, &path).json(&body))
            .await
            .with_context(|| format!("Failed to post {} status on {}", status.state, sha))?;
        Ok(())
    }

    async fn list_statuses(
        &self,
        event: &PushEvent,
        sha: &str,
    ) -> Result<Vec<(String, CommitState)>> {
        let path = format!("/repositories/{}/{}/commit/{}/statuses", event.org, event.repo, sha);
        let page: Page<StatusEntry> =
            send_with_retry(self.retries, |_| false, || self.request(Method::GET, &path))
                .await?
                .json()
                .await
                .context("Failed to decode commit statuses")?;
        Ok(page
            .values
            .into_iter()
            .filter_map(|s| parse_cloud_state(&s.state).map(|state| (s.key, state)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push_payload() -> Value {
        json!({
            "repository": {"full_name": "armory/svc"},
            "actor": {"nickname": "jdoe"},
            "push": {"changes": [
                {"new": {"name": "master", "type": "branch", "target": {"hash": "new1"}},
                 "old": {"name": "master", "type": "branch", "target": {"hash": "old1"}}},
                {"new": null, "old": {"name": "gone", "type": "branch", "target": {"hash": "x"}}}
            ]}
        })
    }

    #[test]
    fn test_repo_push() {
        let changes = parse_changes("repo:push", &push_payload()).unwrap();
        assert_eq!(
            changes,
            vec![CloudChange {
                org: "armory".to_string(),
                repo: "svc".to_string(),
                branch: "master".to_string(),
                head: "new1".to_string(),
                base: Some("old1".to_string()),
                actor: Some("jdoe".to_string()),
            }]
        );
    }

    #[test]
    fn test_fulfilled_uses_merge_commit() {
        let raw = json!({
            "repository": {"full_name": "armory/svc"},
            "pullrequest": {
                "destination": {"branch": {"name": "main"}, "commit": {"hash": "dest"}},
                "merge_commit": {"hash": "merge"}
            }
        });
        let changes = parse_changes("pullrequest:fulfilled", &raw).unwrap();
        assert_eq!(changes[0].branch, "main");
        assert_eq!(changes[0].head, "merge");
    }

    #[test]
    fn test_unknown_event_is_error() {
        assert!(parse_changes("repo:fork", &json!({})).is_err());
    }

    #[tokio::test]
    async fn test_decode_pushes_uses_diffstat() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/2.0/repositories/armory/svc/diffstat/new1..old1")
            .with_body(r#"{"values": [
                {"status": "modified", "new": {"path": "dinghyfile"}},
                {"status": "removed", "new": null}
            ]}"#)
            .create_async()
            .await;
        let settings = ProviderSettings {
            endpoint: server.url(),
            ..ProviderSettings::default()
        };
        let client = BitbucketClient::new(&settings, 0).unwrap();
        let events = client.decode_pushes("repo:push", &push_payload()).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].files, vec!["dinghyfile".to_string()]);
        assert_eq!(events[0].commits, vec!["new1".to_string()]);
    }
}
