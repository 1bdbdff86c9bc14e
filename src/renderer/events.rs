//! Render events.

use std::fmt;

use serde::Serialize;

/// What happened during a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RenderEventKind {
    /// A template rendered successfully.
    Parse,
    /// The template could not be downloaded.
    DownloadFailed,
    /// The `globals` block could not be extracted.
    GlobalsFailed,
    /// The template failed to parse or execute.
    TemplateFailed,
}

impl RenderEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderEventKind::Parse => "parse",
            RenderEventKind::DownloadFailed => "parse-err-download",
            RenderEventKind::GlobalsFailed => "parse-err-globals",
            RenderEventKind::TemplateFailed => "parse-err-template",
        }
    }
}

impl fmt::Display for RenderEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One render event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderEvent {
    pub kind: RenderEventKind,
    pub org: String,
    pub repo: String,
    pub path: String,
    pub branch: String,
    /// Rendered text for [`RenderEventKind::Parse`], the error otherwise.
    pub message: String,
    /// Whether the template is a module rather than a dinghyfile.
    pub module: bool,
}

/// Receives render events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: RenderEvent);
}

/// Logs events through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: RenderEvent) {
        match event.kind {
            RenderEventKind::Parse => tracing::debug!(
                target: "dinghy::events",
                kind = %event.kind,
                module = event.module,
                "{}/{}/{}@{} rendered {} bytes",
                event.org,
                event.repo,
                event.path,
                event.branch,
                event.message.len()
            ),
            _ => tracing::warn!(
                target: "dinghy::events",
                kind = %event.kind,
                module = event.module,
                "{}/{}/{}@{}: {}",
                event.org,
                event.repo,
                event.path,
                event.branch,
                event.message
            ),
        }
    }
}
