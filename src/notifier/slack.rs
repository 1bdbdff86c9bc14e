//! Slack incoming-webhook notifier.

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Notice, Notifier};
use crate::config::SlackSettings;
use crate::core::DinghyError;
use crate::vcs::{check_status, http_client};

/// Posts a one-line message per dinghyfile to a Slack incoming webhook.
pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
}

impl SlackNotifier {
    pub fn new(settings: &SlackSettings) -> Result<Self, DinghyError> {
        if settings.webhook_url.is_empty() {
            return Err(DinghyError::Config("notifiers.slack.webhook_url is required".to_string()));
        }
        Ok(Self {
            client: http_client()?,
            webhook_url: settings.webhook_url.clone(),
            channel: settings.channel.clone().filter(|c| !c.is_empty()),
        })
    }

    fn payload(&self, text: String) -> Value {
        let mut payload = json!({ "text": text });
        if let Some(channel) = &self.channel {
            payload["channel"] = json!(channel);
        }
        payload
    }

    async fn post(&self, text: String) -> anyhow::Result<()> {
        let response = self.client.post(&self.webhook_url).json(&self.payload(text)).send().await?;
        check_status(response, "slack webhook").await?;
        Ok(())
    }
}

fn location(notice: &Notice) -> String {
    let branch = notice.context.get("branch").and_then(Value::as_str).unwrap_or_default();
    if branch.is_empty() {
        format!("{}/{}/{}", notice.org, notice.repo, notice.path)
    } else {
        format!("{}/{}/{} ({})", notice.org, notice.repo, notice.path, branch)
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    fn name(&self) -> &str {
        "slack"
    }

    async fn send_success(&self, notice: &Notice) -> anyhow::Result<()> {
        self.post(format!(":white_check_mark: Updated pipelines from {}", location(notice))).await
    }

    async fn send_failure(&self, notice: &Notice) -> anyhow::Result<()> {
        let error = notice.error.as_deref().unwrap_or("unknown error");
        let from = location(notice);
        self.post(format!(":x: Failed to update pipelines from {from}: {error}")).await
    }
}
