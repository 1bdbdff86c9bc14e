//! Stash / Bitbucket Server adapter.
//!
//! Three payload shapes arrive here: the legacy Stash post-receive hook
//! (`refChanges`), and the Bitbucket Server events `repo:refs_changed` and
//! `pr:merged`. None of them list changed files, so files are read from the
//! commit changes API.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use super::{CommitState, CommitStatus, Downloader, FileLocation, PushEvent, StatusApi, UrlCodec};
use crate::config::ProviderSettings;
use crate::core::DinghyError;
use crate::utils::retry::send_with_retry;

pub const PROVIDER: &str = "stash";

const NULL_HASH: &str = "0000000000000000000000000000000000000000";

/// A ref update extracted from any of the three payload shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefChange {
    pub project: String,
    pub slug: String,
    pub branch: String,
    pub from_hash: String,
    pub to_hash: String,
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyHook {
    repository: Repository,
    #[serde(default)]
    ref_changes: Vec<LegacyRefChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyRefChange {
    ref_id: String,
    from_hash: String,
    to_hash: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    slug: String,
    project: Project,
}

#[derive(Debug, Deserialize)]
struct Project {
    key: String,
}

#[derive(Debug, Deserialize)]
struct RefsChanged {
    repository: Repository,
    #[serde(default)]
    changes: Vec<Change>,
    actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Change {
    #[serde(rename = "ref")]
    git_ref: ChangeRef,
    from_hash: String,
    to_hash: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeRef {
    display_id: String,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct Actor {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrMerged {
    pull_request: PullRequest,
    actor: Option<Actor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    from_ref: PrRef,
    to_ref: PrRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PrRef {
    display_id: String,
    latest_commit: String,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    values: Vec<T>,
    #[serde(rename = "isLastPage", default = "default_true")]
    is_last_page: bool,
    #[serde(rename = "nextPageStart")]
    next_page_start: Option<u64>,
}

const fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ChangeEntry {
    path: ChangePath,
    #[serde(rename = "type", default)]
    kind: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePath {
    to_string: String,
}

#[derive(Debug, Deserialize)]
struct BuildStatus {
    key: String,
    state: String,
}

/// Extract branch updates from a webhook body.
///
/// `event_key` is the `eventKey` of Bitbucket Server events; legacy Stash
/// hooks have none. Tag updates and branch deletions are dropped.
pub fn parse_ref_changes(event_key: Option<&str>, raw: &Value) -> Result<Vec<RefChange>> {
    let changes = match event_key {
        None => {
            let hook: LegacyHook =
                serde_json::from_value(raw.clone()).context("Failed to decode Stash webhook")?;
            hook.ref_changes
                .into_iter()
                .filter_map(|c| {
                    let branch = c.ref_id.strip_prefix("refs/heads/")?.to_string();
                    Some(RefChange {
                        project: hook.repository.project.key.clone(),
                        slug: hook.repository.slug.clone(),
                        branch,
                        from_hash: c.from_hash,
                        to_hash: c.to_hash,
                        actor: None,
                    })
                })
                .collect()
        }
        Some("repo:refs_changed") => {
            let event: RefsChanged = serde_json::from_value(raw.clone())
                .context("Failed to decode repo:refs_changed event")?;
            let actor = event.actor.map(|a| a.name);
            event
                .changes
                .into_iter()
                .filter(|c| c.git_ref.kind.is_empty() || c.git_ref.kind == "BRANCH")
                .filter(|c| c.kind != "DELETE")
                .map(|c| RefChange {
                    project: event.repository.project.key.clone(),
                    slug: event.repository.slug.clone(),
                    branch: c.git_ref.display_id,
                    from_hash: c.from_hash,
                    to_hash: c.to_hash,
                    actor: actor.clone(),
                })
                .collect()
        }
        Some("pr:merged") => {
            let event: PrMerged =
                serde_json::from_value(raw.clone()).context("Failed to decode pr:merged event")?;
            let pr = event.pull_request;
            vec![RefChange {
                project: pr.to_ref.repository.project.key,
                slug: pr.to_ref.repository.slug,
                branch: pr.to_ref.display_id,
                from_hash: pr.to_ref.latest_commit,
                to_hash: pr.from_ref.latest_commit,
                actor: event.actor.map(|a| a.name),
            }]
        }
        Some(other) => bail!("unsupported Bitbucket Server event {other}"),
    };
    Ok(changes.into_iter().filter(|c| c.to_hash != NULL_HASH).collect())
}

fn stash_state(state: CommitState) -> &'static str {
    match state {
        CommitState::Pending => "INPROGRESS",
        CommitState::Success => "SUCCESSFUL",
        CommitState::Failure | CommitState::Error => "FAILED",
    }
}

fn parse_stash_state(state: &str) -> Option<CommitState> {
    match state {
        "INPROGRESS" => Some(CommitState::Pending),
        "SUCCESSFUL" => Some(CommitState::Success),
        "FAILED" => Some(CommitState::Failure),
        _ => None,
    }
}

/// Bitbucket Server REST client.
pub struct StashClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    token: String,
    codec: UrlCodec,
    retries: usize,
}

impl StashClient {
    pub fn new(settings: &ProviderSettings, retries: usize) -> Result<Self, DinghyError> {
        if settings.endpoint.is_empty() {
            return Err(DinghyError::Config("stash.endpoint is required".to_string()));
        }
        let endpoint = settings.endpoint.trim_end_matches('/').to_string();
        Ok(Self {
            http: super::http_client()?,
            codec: UrlCodec::new(&endpoint)?,
            endpoint,
            username: settings.username.clone(),
            token: settings.token.clone(),
            retries,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request = self.http.request(method, format!("{}{}", self.endpoint, path));
        if self.username.is_empty() {
            request.bearer_auth(&self.token)
        } else {
            request.basic_auth(&self.username, Some(&self.token))
        }
    }

    /// Files touched between `from_hash` and `to_hash`.
    async fn changed_files(&self, change: &RefChange) -> Result<Vec<String>> {
        let path = format!(
            "/rest/api/1.0/projects/{}/repos/{}/commits/{}/changes",
            change.project, change.slug, change.to_hash
        );
        let mut files = Vec::new();
        let mut start = 0u64;
        loop {
            let mut query = vec![("start", start.to_string()), ("limit", "500".to_string())];
            if change.from_hash != NULL_HASH && !change.from_hash.is_empty() {
                query.push(("since", change.from_hash.clone()));
            }
            let page: Page<ChangeEntry> = send_with_retry(self.retries, |_| false, || {
                self.request(Method::GET, &path).query(&query)
            })
            .await?
            .json()
            .await
            .context("Failed to decode commit changes")?;
            let changed = page.values.into_iter().filter(|c| c.kind != "DELETE");
            files.extend(changed.map(|c| c.path.to_string));
            match page.next_page_start {
                Some(next) if !page.is_last_page => start = next,
                _ => break,
            }
        }
        Ok(files)
    }

    /// Decode a webhook into one push per updated branch.
    pub async fn decode_pushes(
        &self,
        event_key: Option<&str>,
        raw: &Value,
    ) -> Result<Vec<PushEvent>> {
        let mut events = Vec::new();
        for change in parse_ref_changes(event_key, raw)? {
            let mut event = PushEvent {
                provider: PROVIDER.to_string(),
                org: change.project.clone(),
                repo: change.slug.clone(),
                branch: change.branch.clone(),
                commits: vec![change.to_hash.clone()],
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
impl Downloader for StashClient {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.encode_url(org, repo, path, branch);
        let api_path = format!("/rest/api/1.0/projects/{org}/repos/{repo}/raw/{path}");
        let at = format!("refs/heads/{branch}");
        super::fetch_file(self.retries, &key, || {
            self.request(Method::GET, &api_path).query(&[("at", &at)])
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
impl StatusApi for StashClient {
    async fn post_status(
        &self,
        _event: &PushEvent,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<()> {
        let path = format!("/rest/build-status/1.0/commits/{sha}");
        let body = serde_json::json!({
            "state": stash_state(status.state),
            "key": status.context,
            "name": status.context,
            "url": status.target_url.clone().unwrap_or_else(|| self.endpoint.clone()),
            "description": status.description,
        });
        send_with_retry(self.retries, |_| false, || self.request(Method::POST, &path).json(&body))
            .await
            .with_context(|| format!("Failed to post {} build status on {}", status.state, sha))?;
        Ok(())
    }

    async fn list_statuses(
        &self,
        _event: &PushEvent,
        sha: &str,
    ) -> Result<Vec<(String, CommitState)>> {
        let path = format!("/rest/build-status/1.0/commits/{sha}");
        let page: Page<BuildStatus> =
            send_with_retry(self.retries, |_| false, || self.request(Method::GET, &path))
                .await?
                .json()
                .await
                .context("Failed to decode build statuses")?;
        Ok(page
            .values
            .into_iter()
            .filter_map(|s| parse_stash_state(&s.state).map(|state| (s.key, state)))
            .collect())
    }
}
