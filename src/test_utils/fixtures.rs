//! Webhook payloads and push events for tests.

use serde_json::{Value, json};

use crate::vcs::PushEvent;

/// A GitHub `push` webhook body with one commit, `sha`, touching `files`.
pub fn github_push_body(org: &str, repo: &str, branch: &str, files: &[&str], sha: &str) -> Value {
    json!({
        "ref": format!("refs/heads/{branch}"),
        "repository": {"name": repo, "owner": {"login": org, "name": org}},
        "commits": [{"id": sha, "added": [], "modified": files}],
        "pusher": {"name": "octocat"}
    })
}

/// A decoded GitHub push with a single commit `abc123`.
pub fn push_event(org: &str, repo: &str, branch: &str, files: &[&str]) -> PushEvent {
    PushEvent {
        provider: "github".to_string(),
        org: org.to_string(),
        repo: repo.to_string(),
        branch: branch.to_string(),
        files: files.iter().map(|f| f.to_string()).collect(),
        commits: vec!["abc123".to_string()],
        pusher: Some("octocat".to_string()),
        raw: github_push_body(org, repo, branch, files, "abc123"),
    }
}
