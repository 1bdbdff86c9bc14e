//! Per-webhook log events served at `/v1/logevents`.
//!
//! Each processed webhook leaves one [`LogEvent`] holding everything its
//! [`DinghyLog`](crate::core::DinghyLog) captured. Events expire after a
//! configurable TTL; expired entries are purged whenever the store is read
//! or written.

use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// How a webhook ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogEventStatus {
    Success,
    Error,
}

/// The record of one webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub org: String,
    pub repo: String,
    pub branch: String,
    pub files: Vec<String>,
    pub commits: Vec<String>,
    /// Captured log lines.
    pub message: String,
    pub status: LogEventStatus,
    /// Rendered output of every dinghyfile, in processing order.
    pub rendered_dinghyfile: String,
    pub date: DateTime<Utc>,
}

/// In-memory log-event store with expiry.
pub struct LogEventStore {
    ttl: Duration,
    events: Mutex<Vec<LogEvent>>,
}

impl LogEventStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            events: Mutex::new(Vec::new()),
        }
    }

    /// Store built from a TTL in minutes.
    pub fn with_ttl_minutes(minutes: u64) -> Self {
        Self::new(Duration::from_secs(minutes.saturating_mul(60)))
    }

    pub fn save(&self, event: LogEvent) {
        let mut events = self.events.lock();
        purge(&mut events, self.ttl, Utc::now());
        events.push(event);
    }

    /// Unexpired events, oldest first.
    pub fn events(&self) -> Vec<LogEvent> {
        let mut events = self.events.lock();
        purge(&mut events, self.ttl, Utc::now());
        events.clone()
    }
}

fn purge(events: &mut Vec<LogEvent>, ttl: Duration, now: DateTime<Utc>) {
    let Ok(ttl) = chrono::Duration::from_std(ttl) else {
        return;
    };
    events.retain(|e| now.signed_duration_since(e.date) < ttl);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(age_minutes: i64) -> LogEvent {
        LogEvent {
            org: "armory".to_string(),
            repo: "svc".to_string(),
            branch: "master".to_string(),
            files: vec!["dinghyfile".to_string()],
            commits: vec!["abc".to_string()],
            message: "[INFO] processing".to_string(),
            status: LogEventStatus::Success,
            rendered_dinghyfile: "{}".to_string(),
            date: Utc::now() - chrono::Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn test_expired_events_are_purged() {
        let store = LogEventStore::with_ttl_minutes(15);
        store.save(event(30));
        store.save(event(1));
        let events = store.events();
        assert_eq!(events.len(), 1);
        assert!(Utc::now().signed_duration_since(events[0].date) < chrono::Duration::minutes(2));
    }

    #[test]
    fn test_serializes_camel_case() {
        let value = serde_json::to_value(event(0)).unwrap();
        assert_eq!(value["status"], "success");
        assert_eq!(value["renderedDinghyfile"], "{}");
    }
}
