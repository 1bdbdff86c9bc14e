//! Outcome notifications.
//!
//! After a webhook finishes, every configured [`Notifier`] is told whether
//! each dinghyfile succeeded. [`Notifiers::dispatch`] runs them concurrently
//! on their own tasks and waits at most the configured bound, so a slow chat
//! service never delays the webhook response. Notifier failures are logged
//! and otherwise ignored.

mod slack;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;

use crate::config::Settings;
use crate::core::DinghyError;

pub use slack::SlackNotifier;

/// What a notifier is told about one dinghyfile.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Notice {
    pub org: String,
    pub repo: String,
    pub path: String,
    /// Failure message; `None` for a success.
    pub error: Option<String>,
    /// The application's notification settings, when known.
    pub notifications: Option<Value>,
    /// Provider, branch, commits and any other context of the push.
    pub context: Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn send_success(&self, notice: &Notice) -> anyhow::Result<()>;

    async fn send_failure(&self, notice: &Notice) -> anyhow::Result<()>;
}

/// The configured notifiers and the bound on waiting for them.
#[derive(Clone)]
pub struct Notifiers {
    notifiers: Vec<Arc<dyn Notifier>>,
    timeout: Duration,
}

impl Notifiers {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>, timeout: Duration) -> Self {
        Self {
            notifiers,
            timeout,
        }
    }

    /// Notifiers enabled in `settings`.
    pub fn from_settings(settings: &Settings) -> Result<Self, DinghyError> {
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
        if settings.notifiers.slack.enabled {
            notifiers.push(Arc::new(SlackNotifier::new(&settings.notifiers.slack)?));
        }
        Ok(Self::new(notifiers, Duration::from_secs(settings.server.notifier_timeout_secs)))
    }

    pub fn len(&self) -> usize {
        self.notifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    /// Send `notice` to every notifier, waiting at most the configured bound.
    ///
    /// Notifiers still running when the bound expires keep running in the
    /// background.
    pub async fn dispatch(&self, notice: Notice) {
        if self.notifiers.is_empty() {
            return;
        }
        let notice = Arc::new(notice);
        let handles: Vec<_> = self
            .notifiers
            .iter()
            .cloned()
            .map(|notifier| {
                let notice = notice.clone();
                tokio::spawn(async move {
                    let result = match notice.error {
                        None => notifier.send_success(&notice).await,
                        Some(_) => notifier.send_failure(&notice).await,
                    };
                    if let Err(e) = result {
                        tracing::warn!(
                            "notifier {} failed for {}: {:#}",
                            notifier.name(),
                            notice.path,
                            e
                        );
                    }
                })
            })
            .collect();

        if tokio::time::timeout(self.timeout, join_all(handles)).await.is_err() {
            tracing::warn!(
                "notifiers still running after {}s, not waiting for them",
                self.timeout.as_secs_f32()
            );
        }
    }
}
