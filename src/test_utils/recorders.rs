use async_trait::async_trait;
use parking_lot::Mutex;

use crate::notifier::{Notice, Notifier};
use crate::renderer::{EventSink, RenderEvent, RenderEventKind};
use crate::vcs::{CommitState, Push, PushEvent};

/// A push whose commit statuses are kept in memory.
pub struct FakePush {
    event: PushEvent,
    statuses: Mutex<Vec<(CommitState, String)>>,
}

impl FakePush {
    pub fn new(event: PushEvent) -> Self {
        Self {
            event,
            statuses: Mutex::new(Vec::new()),
        }
    }

    /// Pretend a status was already posted before the webhook arrived.
    pub fn with_status(self, state: CommitState, description: &str) -> Self {
        self.statuses.lock().push((state, description.to_string()));
        self
    }

    /// Every status posted, oldest first.
    pub fn statuses(&self) -> Vec<(CommitState, String)> {
        self.statuses.lock().clone()
    }

    pub fn states(&self) -> Vec<CommitState> {
        self.statuses.lock().iter().map(|(s, _)| *s).collect()
    }
}

#[async_trait]
impl Push for FakePush {
    fn event(&self) -> &PushEvent {
        &self.event
    }

    async fn set_commit_status(&self, state: CommitState, description: &str) -> anyhow::Result<()> {
        self.statuses.lock().push((state, description.to_string()));
        Ok(())
    }

    async fn get_commit_status(&self) -> anyhow::Result<Option<CommitState>> {
        Ok(self.statuses.lock().last().map(|(s, _)| *s))
    }
}

/// Notifier that remembers every notice.
#[derive(Default)]
pub struct RecordingNotifier {
    successes: Mutex<Vec<Notice>>,
    failures: Mutex<Vec<Notice>>,
}

impl RecordingNotifier {
    pub fn successes(&self) -> Vec<Notice> {
        self.successes.lock().clone()
    }

    pub fn failures(&self) -> Vec<Notice> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send_success(&self, notice: &Notice) -> anyhow::Result<()> {
        self.successes.lock().push(notice.clone());
        Ok(())
    }

    async fn send_failure(&self, notice: &Notice) -> anyhow::Result<()> {
        self.failures.lock().push(notice.clone());
        Ok(())
    }
}

/// Event sink that keeps every render event.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RenderEvent>>,
}

impl RecordingEventSink {
    pub fn events(&self) -> Vec<RenderEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<RenderEventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: RenderEvent) {
        self.events.lock().push(event);
    }
}
