//! Commit status payloads shared by every provider.

use serde::{Deserialize, Serialize};

use super::CommitState;
use crate::constants::{MAX_STATUS_DESCRIPTION_LEN, STATUS_CONTEXT};

/// A commit status as posted to a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatus {
    pub state: CommitState,
    pub context: String,
    pub description: String,
    /// Link shown next to the status; the orchestrator UI when configured.
    #[serde(rename = "target_url", skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
}

impl CommitStatus {
    /// Build a dinghy status, truncating the description to the provider limit.
    pub fn new(state: CommitState, description: &str, deck_url: Option<&str>) -> Self {
        Self {
            state,
            context: STATUS_CONTEXT.to_string(),
            description: truncate_description(description),
            target_url: deck_url.filter(|u| !u.is_empty()).map(str::to_string),
        }
    }
}

/// Truncate to [`MAX_STATUS_DESCRIPTION_LEN`] characters, ending in `...`.
pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= MAX_STATUS_DESCRIPTION_LEN {
        return description.to_string();
    }
    let mut truncated: String = description.chars().take(MAX_STATUS_DESCRIPTION_LEN - 3).collect();
    truncated.push_str("...");
    truncated
}

/// The most recent dinghy state among `statuses`, which providers list newest first.
pub fn latest_dinghy_state<'a>(
    statuses: impl IntoIterator<Item = (&'a str, CommitState)>,
) -> Option<CommitState> {
    statuses.into_iter().find(|(context, _)| *context == STATUS_CONTEXT).map(|(_, state)| state)
}

/// Parse a provider state string. Unknown states read as `None`.
pub fn parse_state(state: &str) -> Option<CommitState> {
    match state.to_ascii_lowercase().as_str() {
        "pending" | "inprogress" | "in_progress" | "running" => Some(CommitState::Pending),
        "success" | "successful" => Some(CommitState::Success),
        "failure" | "failed" => Some(CommitState::Failure),
        "error" | "stopped" | "canceled" => Some(CommitState::Error),
        _ => None,
    }
}

/// Human readable description for a state at the start of processing.
pub fn pending_description(validating: bool) -> &'static str {
    if validating {
        "Validating dinghyfile"
    } else {
        "Updating pipelines from dinghyfile"
    }
}
